//! Creation checkpoints.
//!
//! A checkpoint is written to the cache directory *before* a device is created
//! and removed after it is released. A crash in between leaves the checkpoint
//! behind, which is how the residue scanner finds devices without a record.

use log::trace;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use crate::directory::Directory;
use crate::{Error, Result};

pub const LOOP_SUFFIX: &str = ".loop.record";
pub const DM_SUFFIX: &str = ".dm.record";

/// Loop device checkpoint: device and the file it was bound to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopCheckpoint {
    pub path: PathBuf,
    pub device: PathBuf,
    pub backing_file: PathBuf,
}

/// Device-mapper checkpoint: device name and the loop devices it spans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmCheckpoint {
    pub path: PathBuf,
    pub name: String,
    pub loop_devices: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct CheckpointJournal {
    dir: PathBuf,
}

impl CheckpointJournal {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn loop_path(&self, device: &Path) -> Result<PathBuf> {
        let name = device
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::consistency(format!("bad loop device {}", device.display())))?;
        Ok(self.dir.join(format!("{}{}", name, LOOP_SUFFIX)))
    }

    fn dm_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, DM_SUFFIX))
    }

    pub fn record_loop(&self, device: &Path, backing_file: &Path) -> Result<()> {
        let path = self.loop_path(device)?;
        write(&path, &format!("{}\n", backing_file.display()))
    }

    /// Backing file recorded for the loop device, `None` without checkpoint.
    pub fn loop_backing(&self, device: &Path) -> Result<Option<PathBuf>> {
        let path = self.loop_path(device)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(PathBuf::from(content.trim_end_matches('\n')))),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::consistency(format!(
                "read checkpoint {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn forget_loop(&self, device: &Path) -> Result<()> {
        remove(&self.loop_path(device)?)
    }

    pub fn record_dm(&self, name: &str, loop_devices: &[PathBuf]) -> Result<()> {
        let content = loop_devices
            .iter()
            .map(|d| format!("{}\n", d.display()))
            .collect::<String>();
        write(&self.dm_path(name), &content)
    }

    pub fn forget_dm(&self, name: &str) -> Result<()> {
        remove(&self.dm_path(name))
    }

    /// Loop device checkpoints present in the cache directory.
    pub fn loops(&self) -> Result<Vec<LoopCheckpoint>> {
        Ok(self
            .list(LOOP_SUFFIX)?
            .into_iter()
            .map(|(path, stem, content)| LoopCheckpoint {
                device: Path::new("/dev").join(stem),
                backing_file: PathBuf::from(content.trim_end_matches('\n')),
                path,
            })
            .collect())
    }

    /// Device-mapper checkpoints present in the cache directory.
    pub fn dm_devices(&self) -> Result<Vec<DmCheckpoint>> {
        Ok(self
            .list(DM_SUFFIX)?
            .into_iter()
            .map(|(path, stem, content)| DmCheckpoint {
                name: stem,
                loop_devices: content
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(PathBuf::from)
                    .collect(),
                path,
            })
            .collect())
    }

    fn list(&self, suffix: &str) -> Result<Vec<(PathBuf, String, String)>> {
        let dir = Directory::open(&self.dir)
            .map_err(|e| Error::consistency(e.to_string()))?;
        let files = dir
            .files_with_suffix(suffix)
            .map_err(|e| Error::consistency(e.to_string()))?;
        let mut out = Vec::with_capacity(files.len());
        for path in files {
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(suffix))
                .map(str::to_string)
            else {
                continue;
            };
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                // released concurrently
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::consistency(format!(
                        "read checkpoint {}: {}",
                        path.display(),
                        e
                    )))
                }
            };
            out.push((path, stem, content));
        }
        Ok(out)
    }
}

fn write(path: &Path, content: &str) -> Result<()> {
    trace!("checkpoint: {}", path.display());
    fs::write(path, content)
        .and_then(|_| fs::File::open(path)?.sync_all())
        .map_err(|e| Error::kernel(format!("write checkpoint {}: {}", path.display(), e)))
}

fn remove(path: &Path) -> Result<()> {
    trace!("forget checkpoint: {}", path.display());
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::residue(format!(
            "remove checkpoint {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::CheckpointJournal;
    use anyhow::Result;
    use std::path::{Path, PathBuf};
    use tempdir::TempDir;

    #[test]
    fn test_loop_checkpoint_lifecycle() -> Result<()> {
        let tmp = TempDir::new("test-checkpoint")?;
        let journal = CheckpointJournal::new(tmp.path());

        journal.record_loop(Path::new("/dev/loop7"), Path::new("/backup/data/vc1.bin"))?;
        assert!(tmp.path().join("loop7.loop.record").is_file());

        let loops = journal.loops()?;
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].device, Path::new("/dev/loop7"));
        assert_eq!(loops[0].backing_file, Path::new("/backup/data/vc1.bin"));
        assert_eq!(
            journal.loop_backing(Path::new("/dev/loop7"))?,
            Some(PathBuf::from("/backup/data/vc1.bin"))
        );
        assert_eq!(journal.loop_backing(Path::new("/dev/loop8"))?, None);

        journal.forget_loop(Path::new("/dev/loop7"))?;
        journal.forget_loop(Path::new("/dev/loop7"))?;
        assert!(journal.loops()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_dm_checkpoint_lifecycle() -> Result<()> {
        let tmp = TempDir::new("test-checkpoint")?;
        let journal = CheckpointJournal::new(tmp.path());
        let loops = vec![PathBuf::from("/dev/loop0"), PathBuf::from("/dev/loop1")];

        journal.record_dm("vcopymount-01ARZ3NDEKTSV4RRFFQ69G5FAV", &loops)?;
        let dms = journal.dm_devices()?;
        assert_eq!(dms.len(), 1);
        assert_eq!(dms[0].name, "vcopymount-01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(dms[0].loop_devices, loops);
        assert!(journal.loops()?.is_empty());

        journal.forget_dm("vcopymount-01ARZ3NDEKTSV4RRFFQ69G5FAV")?;
        assert!(journal.dm_devices()?.is_empty());
        Ok(())
    }
}
