use clap::ValueHint;
use std::path::PathBuf;

use super::SettingsArgs;
use crate::{print_object, OutputFormat};

/// Unmount command.
#[derive(Clone, Debug, clap::Args)]
pub struct UmountArgs {
    /// Mount record returned by the mount command.
    #[arg(value_name = "RECORD", value_hint = ValueHint::FilePath)]
    pub record: PathBuf,
}

impl UmountArgs {
    /// Run umount subcommand.
    pub fn run(
        &self,
        settings: &SettingsArgs,
        format: OutputFormat,
    ) -> Result<(), Box<dyn std::error::Error>> {
        settings.manager()?.unmount(&self.record)?;

        let output = serde_json::json!({
            "success": true,
            "recordPath": self.record,
        });
        print_object(format, &output)
    }
}
