//! Kernel-facing operations.
//!
//! Everything that touches loop devices, device-mapper or the mount table goes
//! through [`System`]. [`LinuxSystem`] is the real implementation.

use std::path::{Path, PathBuf};

use crate::Result;

mod command;
mod dm;
mod linux;
mod loopdev;
mod mount;

#[cfg(test)]
pub(crate) mod fake;

pub use dm::{DmLinearTarget, DmTable, SECTOR_SIZE};
pub use linux::LinuxSystem;
pub use loopdev::LoopDev;
pub use mount::{parse_mount_options, parse_mount_table, MountOptions};

/// Single entry of the kernel mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device, e.g. `/dev/loop7`.
    pub source: PathBuf,

    /// Mount point.
    pub target: PathBuf,

    /// Filesystem type.
    pub fs_type: String,
}

/// Unmount flavour, from least to most aggressive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnmountMode {
    /// Plain `umount2(target, 0)`.
    Normal,

    /// `MNT_DETACH`: detach now, clean up when no longer busy.
    Lazy,

    /// `MNT_FORCE | MNT_DETACH`.
    Force,
}

/// Kernel operations used by the mount lifecycle.
///
/// Errors are [`crate::Error`] values: allocation problems are reported as
/// `ResourceExhaustion`, everything else as `KernelOperation` (with errno when known).
pub trait System {
    /// Find a free loop device slot, e.g. `/dev/loop7`.
    fn find_free_loop(&self) -> Result<PathBuf>;

    /// Bind `file` read-only to the loop device.
    fn attach_loop(&self, loop_dev: &Path, file: &Path) -> Result<()>;

    /// Unbind loop device.
    fn detach_loop(&self, loop_dev: &Path) -> Result<()>;

    /// Backing file of the loop device, `None` if it is not attached.
    fn loop_backing_file(&self, loop_dev: &Path) -> Result<Option<PathBuf>>;

    /// Create read-only device-mapper device. Returns path to the new device.
    fn create_dm_device(&self, name: &str, table: &DmTable) -> Result<PathBuf>;

    /// Remove device-mapper device.
    fn remove_dm_device(&self, name: &str) -> Result<()>;

    /// Check whether device-mapper device with given name exists.
    fn dm_device_exists(&self, name: &str) -> Result<bool>;

    /// Mount `source` at `target`.
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &MountOptions,
    ) -> Result<()>;

    /// Unmount `target`.
    fn unmount(&self, target: &Path, mode: UnmountMode) -> Result<()>;

    /// Current mount table.
    fn mounts(&self) -> Result<Vec<MountEntry>>;
}

impl<S: System + ?Sized> System for &S {
    fn find_free_loop(&self) -> Result<PathBuf> {
        (**self).find_free_loop()
    }

    fn attach_loop(&self, loop_dev: &Path, file: &Path) -> Result<()> {
        (**self).attach_loop(loop_dev, file)
    }

    fn detach_loop(&self, loop_dev: &Path) -> Result<()> {
        (**self).detach_loop(loop_dev)
    }

    fn loop_backing_file(&self, loop_dev: &Path) -> Result<Option<PathBuf>> {
        (**self).loop_backing_file(loop_dev)
    }

    fn create_dm_device(&self, name: &str, table: &DmTable) -> Result<PathBuf> {
        (**self).create_dm_device(name, table)
    }

    fn remove_dm_device(&self, name: &str) -> Result<()> {
        (**self).remove_dm_device(name)
    }

    fn dm_device_exists(&self, name: &str) -> Result<bool> {
        (**self).dm_device_exists(name)
    }

    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &MountOptions,
    ) -> Result<()> {
        (**self).mount(source, target, fs_type, options)
    }

    fn unmount(&self, target: &Path, mode: UnmountMode) -> Result<()> {
        (**self).unmount(target, mode)
    }

    fn mounts(&self) -> Result<Vec<MountEntry>> {
        (**self).mounts()
    }
}

/// Path of the device-mapper device with given name.
pub fn dm_device_path(name: &str) -> PathBuf {
    Path::new("/dev/mapper").join(name)
}

/// Mount table entry for `target`, if mounted. The topmost entry wins.
pub fn mount_at<'a>(mounts: &'a [MountEntry], target: &Path) -> Option<&'a MountEntry> {
    mounts.iter().rev().find(|entry| entry.target == target)
}

/// Mount points where `source` is mounted.
pub fn mounted_from<'a>(
    mounts: &'a [MountEntry],
    source: &'a Path,
) -> impl Iterator<Item = &'a Path> + 'a {
    mounts
        .iter()
        .filter(move |entry| entry.source == source)
        .map(|entry| entry.target.as_path())
}
