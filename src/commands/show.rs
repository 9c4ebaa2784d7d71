use clap::ValueHint;
use std::path::PathBuf;
use vcopymount::MountRecordStore;

use crate::{print_object, OutputFormat};

/// Show command.
#[derive(Clone, Debug, clap::Args)]
pub struct ShowArgs {
    /// Mount record to print.
    #[arg(value_name = "RECORD", value_hint = ValueHint::FilePath)]
    pub record: PathBuf,
}

impl ShowArgs {
    /// Run show subcommand.
    pub fn run(&self, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
        let record = MountRecordStore::load(&self.record)?;
        print_object(format, &record)
    }
}
