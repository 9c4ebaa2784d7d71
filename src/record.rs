//! Persisted mount records.

use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use ulid::Ulid;

use crate::assembler::BlockDeviceRef;
use crate::directory::Directory;
use crate::meta::CopyFormat;
use crate::{Error, Result};

pub const RECORD_SUFFIX: &str = ".json";

/// State of an active mount, enough to undo it from another process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountRecord {
    pub record_id: String,
    pub cache_dir_path: PathBuf,
    pub copy_meta_dir_path: PathBuf,
    pub copy_data_dir_path: PathBuf,
    pub mount_target_path: PathBuf,
    pub mount_fs_type: String,
    pub mount_options: String,

    /// Device mounted at the target.
    pub block_device_ref: PathBuf,

    /// Every loop device backing `block_device_ref`.
    #[serde(default)]
    pub loop_devices: Vec<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_device_name: Option<String>,

    #[serde(default)]
    pub copy_name: String,

    pub copy_format: CopyFormat,

    pub created_at: DateTime<Utc>,
}

impl MountRecord {
    /// Devices owned by the mount.
    pub fn block_device(&self) -> BlockDeviceRef {
        BlockDeviceRef {
            device_path: self.block_device_ref.clone(),
            loop_devices: self.loop_devices.clone(),
            dm_device_name: self.dm_device_name.clone(),
            copy_name: self.copy_name.clone(),
            copy_format: self.copy_format,
        }
    }
}

/// JSON record files in a cache directory.
#[derive(Clone, Debug)]
pub struct MountRecordStore {
    dir: PathBuf,
}

impl MountRecordStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the record with given id.
    pub fn record_path(&self, record_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", record_id, RECORD_SUFFIX))
    }

    /// Write record atomically. Returns record path.
    ///
    /// If a record with the same id already exists, a fresh id is assigned.
    pub fn save(&self, record: &mut MountRecord) -> Result<PathBuf> {
        while self.record_path(&record.record_id).exists() {
            let id = Ulid::new().to_string();
            debug!("record id {} is taken, using {}", record.record_id, id);
            record.record_id = id;
        }
        record.cache_dir_path = self.dir.clone();

        let path = self.record_path(&record.record_id);
        let tmp = self.dir.join(format!(".{}{}.tmp", record.record_id, RECORD_SUFFIX));
        let content = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::consistency(format!("serialize record: {}", e)))?;

        let write_err =
            |e: std::io::Error| Error::kernel(format!("write record {}: {}", path.display(), e));
        let result = fs::File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(&content)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, &path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(write_err(e));
        }
        trace!("record saved: {}", path.display());
        Ok(path)
    }

    /// Load record from file.
    pub fn load(path: &Path) -> Result<MountRecord> {
        let content = fs::read(path).map_err(|e| {
            if e.kind() == IoErrorKind::NotFound {
                Error::consistency(format!("mount record {} not found", path.display()))
            } else {
                Error::consistency(format!("read mount record {}: {}", path.display(), e))
            }
        })?;
        serde_json::from_slice(&content).map_err(|e| {
            Error::consistency(format!("mount record {} is corrupt: {}", path.display(), e))
        })
    }

    /// Delete record file. Missing file is not an error.
    pub fn delete(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                trace!("record deleted: {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::residue(format!(
                "delete mount record {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// All record files with their parse results.
    pub fn list(&self) -> Result<Vec<(PathBuf, Result<MountRecord>)>> {
        let dir = Directory::open(&self.dir).map_err(|e| Error::configuration(e.to_string()))?;
        Ok(dir
            .files_with_suffix(RECORD_SUFFIX)
            .map_err(|e| Error::configuration(e.to_string()))?
            .into_iter()
            .map(|path| {
                let record = Self::load(&path);
                (path, record)
            })
            .collect())
    }

    /// Valid records for the target.
    pub fn find_by_target(&self, target: &Path) -> Result<Vec<(PathBuf, MountRecord)>> {
        Ok(self
            .list()?
            .into_iter()
            .filter_map(|(path, record)| record.ok().map(|r| (path, r)))
            .filter(|(_, record)| record.mount_target_path == target)
            .collect())
    }
}
