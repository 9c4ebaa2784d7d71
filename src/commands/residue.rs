use clap::ValueHint;
use std::path::PathBuf;

use super::{CacheArgs, SettingsArgs};
use crate::{print_object, OutputFormat};

/// Clear residue command.
#[derive(Clone, Debug, clap::Args)]
pub struct ClearResidueArgs {
    #[command(flatten)]
    pub cache: CacheArgs,

    /// Only clear residue of this mount point.
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub target: Option<PathBuf>,
}

impl ClearResidueArgs {
    /// Run clear-residue subcommand.
    pub fn run(
        &self,
        settings: &SettingsArgs,
        format: OutputFormat,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let report = settings
            .manager()?
            .clear_residue(&self.cache.cache_dir, self.target.as_deref())?;
        print_object(format, &report)
    }
}
