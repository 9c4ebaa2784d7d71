use fs2::FileExt;
use log::{debug, trace};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::{Error, Result};

pub const LOCK_FILE_NAME: &str = ".vcopymount.lock";

const TARGET_LOCK_SUFFIX: &str = ".vcopymount.lock";

const LOCK_POLL: Duration = Duration::from_millis(50);

/// Exclusive advisory lock over a cache directory or a mount target.
///
/// Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Lock the cache directory, polling until `timeout` elapses.
    pub fn cache(cache_dir: &Path, timeout: Duration) -> Result<Self> {
        let path = cache_dir.join(LOCK_FILE_NAME);
        let file = open_lock_file(&path)?;
        Self::acquire(file, path, timeout)
    }

    /// Lock the mount target regardless of the cache directory used.
    ///
    /// The lock file `.<name>.vcopymount.lock` lives next to the target, not inside
    /// it, so it stays the same file whether or not something is mounted there.
    /// `None` if the parent directory does not exist: nothing can be mounted there.
    pub fn target(target: &Path, timeout: Duration) -> Result<Option<Self>> {
        let path = target_lock_path(target)?;
        let file = match open_lock_file(&path) {
            Ok(file) => file,
            Err(_) if path.parent().is_some_and(|dir| !dir.exists()) => {
                debug!("{} has no parent directory, not locking", target.display());
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Self::acquire(file, path, timeout).map(Some)
    }

    fn acquire(file: File, path: PathBuf, timeout: Duration) -> Result<Self> {
        let t0 = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    trace!("lock acquired: {}", path.display());
                    return Ok(Self { file, path });
                }
                Err(e) => {
                    if t0.elapsed() >= timeout {
                        return Err(Error::lock_timeout(format!(
                            "timeout acquiring {} after {:?}: {}",
                            path.display(),
                            timeout,
                            e
                        )));
                    }
                    debug!("waiting for lock {}", path.display());
                    thread::sleep(LOCK_POLL.min(timeout.saturating_sub(t0.elapsed())));
                }
            }
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            let message = format!("open lock file {}: {}", path.display(), e);
            if e.kind() == IoErrorKind::NotFound {
                Error::configuration(message)
            } else {
                Error::kernel(message)
            }
        })
}

fn target_lock_path(target: &Path) -> Result<PathBuf> {
    match (target.parent(), target.file_name()) {
        (Some(parent), Some(name)) => {
            let mut file_name = std::ffi::OsString::from(".");
            file_name.push(name);
            file_name.push(TARGET_LOCK_SUFFIX);
            Ok(parent.join(file_name))
        }
        _ => Err(Error::configuration(format!(
            "{} cannot be a mount target",
            target.display()
        ))),
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // ignore errors
        let _ = self.file.unlock();
        trace!("lock released: {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::{target_lock_path, FileLock};
    use crate::ErrorKind;
    use anyhow::Result;
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tempdir::TempDir;

    #[test]
    fn test_lock_timeout_and_release() -> Result<()> {
        let tmp = TempDir::new("test-lock")?;
        let guard = FileLock::cache(tmp.path(), Duration::from_millis(200))?;

        let barrier = Arc::new(Barrier::new(2));
        let b2 = barrier.clone();
        let dir = tmp.path().to_path_buf();
        let handle = thread::spawn(move || {
            b2.wait();
            FileLock::cache(&dir, Duration::from_millis(150))
                .err()
                .map(|e| e.kind())
        });
        barrier.wait();
        assert_eq!(handle.join().unwrap(), Some(ErrorKind::LockTimeout));

        drop(guard);
        let _guard = FileLock::cache(tmp.path(), Duration::from_millis(200))?;
        Ok(())
    }

    #[test]
    fn test_distinct_directories_do_not_block() -> Result<()> {
        let a = TempDir::new("test-lock")?;
        let b = TempDir::new("test-lock")?;
        let _ga = FileLock::cache(a.path(), Duration::ZERO)?;
        let _gb = FileLock::cache(b.path(), Duration::ZERO)?;
        Ok(())
    }

    #[test]
    fn test_target_lock_is_exclusive() -> Result<()> {
        let tmp = TempDir::new("test-lock")?;
        let target = tmp.path().join("vc1");
        fs::create_dir(&target)?;

        let guard = FileLock::target(&target, Duration::ZERO)?;
        assert!(guard.is_some());
        assert!(tmp.path().join(".vc1.vcopymount.lock").exists());
        assert!(fs::read_dir(&target)?.next().is_none());

        let err = FileLock::target(&target, Duration::from_millis(60)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);

        // other targets in the same directory are independent
        let _other = FileLock::target(&tmp.path().join("vc2"), Duration::ZERO)?;

        drop(guard);
        assert!(FileLock::target(&target, Duration::ZERO)?.is_some());
        Ok(())
    }

    #[test]
    fn test_target_without_parent() -> Result<()> {
        let tmp = TempDir::new("test-lock")?;
        let target = tmp.path().join("missing").join("vc1");
        assert!(FileLock::target(&target, Duration::ZERO)?.is_none());

        let err = target_lock_path(Path::new("/")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        Ok(())
    }
}
