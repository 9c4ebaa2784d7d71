use log::debug;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

use super::command::run_command;

/// Loop device manipulator.
///
/// Wraps `losetup` for allocation and binding, reads sysfs for state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopDev {
    path: PathBuf,
}

impl LoopDev {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Find first unused loop device slot.
    ///
    /// Another process may grab the slot before it is attached.
    pub fn find_free(losetup: &Path) -> Result<Self> {
        let out = run_command([losetup.as_os_str(), OsStr::new("--find")])
            .map_err(|e| classify("find free loop device", e))?;
        let path = out.trim();
        if path.is_empty() {
            return Err(Error::resource_exhaustion("no free loop device"));
        }
        Ok(Self::new(path))
    }

    /// Bind file to the loop device read-only.
    pub fn attach(&self, losetup: &Path, file: &Path) -> Result<()> {
        run_command([
            losetup.as_os_str(),
            OsStr::new("--read-only"),
            self.path.as_os_str(),
            file.as_os_str(),
        ])
        .map_err(|e| classify(&format!("attach {} to {}", file.display(), self), e))?;
        debug!("loop device attached: {} -> {}", self, file.display());
        Ok(())
    }

    /// Detach loop device.
    pub fn detach(&self, losetup: &Path) -> Result<()> {
        run_command([
            losetup.as_os_str(),
            OsStr::new("--detach"),
            self.path.as_os_str(),
        ])
        .map_err(|e| Error::kernel(format!("detach loop device {}: {:#}", self, e)))?;
        debug!("loop device detached: {}", self);
        Ok(())
    }

    /// File currently bound to the device, `None` if detached.
    pub fn backing_file(&self) -> Result<Option<PathBuf>> {
        let name = self
            .path
            .file_name()
            .ok_or_else(|| Error::consistency(format!("bad loop device path {}", self)))?;
        let sysfs = Path::new("/sys/block")
            .join(name)
            .join("loop")
            .join("backing_file");
        match fs::read_to_string(&sysfs) {
            Ok(content) => {
                let content = content.trim_end_matches('\n');
                let content = content.strip_suffix(" (deleted)").unwrap_or(content);
                Ok(Some(PathBuf::from(content)))
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::kernel(format!(
                "read {}: {}",
                sysfs.display(),
                e
            ))),
        }
    }

    /// Path to loop device.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

/// Slot races and exhausted pools are retryable allocation failures.
fn classify(action: &str, e: anyhow::Error) -> Error {
    let message = format!("{}: {:#}", action, e);
    let lower = message.to_lowercase();
    if lower.contains("free loop") || lower.contains("resource busy") {
        Error::resource_exhaustion(message)
    } else {
        Error::kernel(message)
    }
}

impl fmt::Display for LoopDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format!("{}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::{classify, LoopDev};
    use crate::ErrorKind;
    use anyhow::anyhow;

    #[test]
    fn test_classify() {
        let err = classify(
            "find free loop device",
            anyhow!("losetup: cannot find an unused loop device: no free loop device"),
        );
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);

        let err = classify(
            "attach",
            anyhow!("losetup: /dev/loop3: failed to set up loop device: Device or resource busy"),
        );
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);

        let err = classify("attach", anyhow!("losetup: /data/x: No such file"));
        assert_eq!(err.kind(), ErrorKind::KernelOperation);
    }

    #[test]
    fn test_display() {
        assert_eq!(LoopDev::new("/dev/loop3").to_string(), "/dev/loop3");
    }

    #[test]
    fn test_backing_file_of_missing_device() {
        let dev = LoopDev::new("/dev/loop-vcopymount-test-nonexistent");
        assert_eq!(dev.backing_file().unwrap(), None);
    }
}
