use log::debug;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempdir::TempDir;

use crate::{Error, Result};

use super::command::run_command;
use super::dm_device_path;

/// Device-mapper sector size.
pub const SECTOR_SIZE: u64 = 512;

/// One `linear` line of a device-mapper table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmLinearTarget {
    /// First sector of the virtual device covered by this target.
    pub start: u64,

    /// Number of sectors.
    pub length: u64,

    /// Underlying device.
    pub device: PathBuf,

    /// Offset in sectors on the underlying device.
    pub offset: u64,
}

impl fmt::Display for DmLinearTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} linear {} {}",
            self.start,
            self.length,
            self.device.display(),
            self.offset
        )
    }
}

/// Linear device-mapper table concatenating several devices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DmTable {
    targets: Vec<DmLinearTarget>,
}

impl DmTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` of `device` right after the previous target.
    ///
    /// `bytes` must be a whole number of sectors.
    pub fn append(&mut self, device: &Path, bytes: u64) -> Result<()> {
        if bytes == 0 || bytes % SECTOR_SIZE != 0 {
            return Err(Error::consistency(format!(
                "segment of {} bytes on {} is not sector aligned",
                bytes,
                device.display()
            )));
        }
        let start = self.sectors();
        self.targets.push(DmLinearTarget {
            start,
            length: bytes / SECTOR_SIZE,
            device: device.to_path_buf(),
            offset: 0,
        });
        Ok(())
    }

    pub fn targets(&self) -> &[DmLinearTarget] {
        &self.targets
    }

    /// Total size in sectors.
    pub fn sectors(&self) -> u64 {
        self.targets
            .last()
            .map(|t| t.start + t.length)
            .unwrap_or_default()
    }
}

impl fmt::Display for DmTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for target in &self.targets {
            writeln!(f, "{}", target)?;
        }
        Ok(())
    }
}

/// Create read-only device with `dmsetup create`.
pub(super) fn create(dmsetup: &Path, name: &str, table: &DmTable) -> Result<PathBuf> {
    let tmp = TempDir::new("vcopymount-dm")
        .map_err(|e| Error::kernel(format!("create temp directory for dm table: {}", e)))?;
    let table_file = tmp.path().join("table");
    fs::write(&table_file, table.to_string())
        .map_err(|e| Error::kernel(format!("write dm table {}: {}", table_file.display(), e)))?;

    run_command([
        dmsetup.as_os_str(),
        OsStr::new("create"),
        OsStr::new(name),
        OsStr::new("--readonly"),
        table_file.as_os_str(),
    ])
    .map_err(|e| Error::kernel(format!("create dm device {}: {:#}", name, e)))?;

    let path = dm_device_path(name);
    debug!("dm device created: {}", path.display());
    Ok(path)
}

/// Remove device with `dmsetup remove`.
pub(super) fn remove(dmsetup: &Path, name: &str) -> Result<()> {
    run_command([dmsetup.as_os_str(), OsStr::new("remove"), OsStr::new(name)])
        .map_err(|e| Error::kernel(format!("remove dm device {}: {:#}", name, e)))?;
    debug!("dm device removed: {}", name);
    Ok(())
}
