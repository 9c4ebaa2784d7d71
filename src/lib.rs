//! Mount volume copies (backup metadata + data directories) as read-only
//! filesystems and undo it later, possibly from another process.
//!
//! A mount builds a loop device (or a device-mapper concatenation of loop
//! devices) over the copy's data files, mounts it and writes a JSON mount
//! record into a cache directory. The record path is all that is needed to
//! unmount. Anything left behind by interrupted attempts is found and removed
//! by [`clear_residue`].
//!
//! ```no_run
//! use std::path::Path;
//! use vcopymount::MountConfig;
//!
//! # fn main() -> vcopymount::Result<()> {
//! let config = MountConfig {
//!     copy_meta_dir_path: "/backup/meta".into(),
//!     copy_data_dir_path: "/backup/data".into(),
//!     mount_target_path: "/mnt/vc1".into(),
//!     mount_fs_type: "ext4".to_string(),
//!     mount_options: "ro".to_string(),
//! };
//! let record = vcopymount::mount(Path::new("/cache"), &config)?;
//! vcopymount::unmount(&record)?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

pub mod assembler;
pub mod checkpoint;
pub mod config;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod meta;
pub mod pipeline;
pub mod record;
pub mod residue;
pub mod settings;
pub mod system;

pub use assembler::{BlockDeviceRef, VolumeImageAssembler};
pub use config::MountConfig;
pub use error::{Error, ErrorContext, ErrorKind, Result};
pub use lifecycle::{MountLifecycleManager, ProviderHandle};
pub use record::{MountRecord, MountRecordStore};
pub use residue::ResidueReport;
pub use settings::Settings;
pub use system::{LinuxSystem, System};

/// Mount the copy with default settings. Returns path to the mount record.
pub fn mount(cache_dir: &Path, config: &MountConfig) -> Result<PathBuf> {
    MountLifecycleManager::new(LinuxSystem::new()?, Settings::default()).mount(cache_dir, config)
}

/// Unmount the copy described by the mount record.
pub fn unmount(record_path: &Path) -> Result<()> {
    MountLifecycleManager::new(LinuxSystem::new()?, Settings::default()).unmount(record_path)
}

/// Remove residue of interrupted operations, optionally only for one target.
pub fn clear_residue(cache_dir: &Path, target: Option<&Path>) -> Result<ResidueReport> {
    MountLifecycleManager::new(LinuxSystem::new()?, Settings::default())
        .clear_residue(cache_dir, target)
}
