use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::directory::Directory;
use crate::system::{parse_mount_options, MountOptions};
use crate::{Error, Result};

/// Input of a mount operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountConfig {
    pub copy_meta_dir_path: PathBuf,
    pub copy_data_dir_path: PathBuf,
    pub mount_target_path: PathBuf,
    pub mount_fs_type: String,
    pub mount_options: String,
}

/// [`MountConfig`] with canonical paths and parsed options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub meta_dir: PathBuf,
    pub data_dir: PathBuf,
    pub target: PathBuf,
    pub fs_type: String,
    pub options: String,
    pub mount_options: MountOptions,
}

impl MountConfig {
    /// Check every input. Creates the target directory if it is missing.
    ///
    /// All failures are `ConfigurationError`.
    pub fn validate(&self) -> Result<ValidatedConfig> {
        if self.mount_fs_type.trim().is_empty() {
            return Err(Error::configuration("mount filesystem type is empty"));
        }
        let mount_options = parse_mount_options(&self.mount_options)?;

        let meta_dir = existing_dir("copy meta directory", &self.copy_meta_dir_path)?;
        let data_dir = existing_dir("copy data directory", &self.copy_data_dir_path)?;
        let target = Directory::open_or_create(&self.mount_target_path)
            .map_err(|e| Error::configuration(format!("mount target: {}", e)))?;

        Ok(ValidatedConfig {
            meta_dir,
            data_dir,
            target: target.path().to_path_buf(),
            fs_type: self.mount_fs_type.trim().to_string(),
            options: self.mount_options.clone(),
            mount_options,
        })
    }
}

fn existing_dir(what: &str, path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(Error::configuration(format!("{} is not set", what)));
    }
    Directory::open(path)
        .map(|dir| dir.path().to_path_buf())
        .map_err(|e| Error::configuration(format!("{}: {}", what, e)))
}
