use clap::ValueHint;
use std::path::PathBuf;
use vcopymount::MountConfig;

use super::{CacheArgs, SettingsArgs};
use crate::{print_object, OutputFormat};

/// Mount command.
#[derive(Clone, Debug, clap::Args)]
pub struct MountArgs {
    #[command(flatten)]
    pub cache: CacheArgs,

    /// Copy metadata directory.
    ///
    /// Must contain volumecopy.meta.json describing the copy layout.
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub meta: PathBuf,

    /// Copy data directory holding the data files referenced by the metadata.
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub data: PathBuf,

    /// Mount point. Created if it does not exist.
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub target: PathBuf,

    /// Filesystem type of the copied volume (e.g. ext4, xfs).
    #[arg(long = "type", short = 't', value_name = "FSTYPE")]
    pub fs_type: String,

    /// Comma separated mount options.
    ///
    /// The copy is always mounted read-only; 'rw' is rejected.
    #[arg(long, short = 'o', value_name = "OPTS", default_value = "ro")]
    pub options: String,
}

impl MountArgs {
    /// Run mount subcommand.
    pub fn run(
        &self,
        settings: &SettingsArgs,
        format: OutputFormat,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let config = MountConfig {
            copy_meta_dir_path: self.meta.clone(),
            copy_data_dir_path: self.data.clone(),
            mount_target_path: self.target.clone(),
            mount_fs_type: self.fs_type.clone(),
            mount_options: self.options.clone(),
        };
        let (record_path, record) = settings
            .manager()?
            .mount_with_record(&self.cache.cache_dir, &config)?;

        let output = serde_json::json!({
            "recordPath": record_path,
            "blockDeviceRef": record.block_device_ref,
            "mountTargetPath": record.mount_target_path,
        });
        print_object(format, &output)
    }
}
