use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

use super::loopdev::LoopDev;
use super::{dm, dm_device_path, mount, DmTable, MountEntry, MountOptions, System, UnmountMode};

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// [`System`] backed by the running Linux kernel.
///
/// Loop and device-mapper devices are managed with `losetup` and `dmsetup`,
/// mounts go straight to `mount(2)`/`umount2(2)`.
#[derive(Clone, Debug)]
pub struct LinuxSystem {
    losetup: PathBuf,
    dmsetup: PathBuf,
}

impl LinuxSystem {
    /// Locate helper tools in `PATH`.
    pub fn new() -> Result<Self> {
        Ok(Self {
            losetup: locate("losetup")?,
            dmsetup: locate("dmsetup")?,
        })
    }
}

fn locate(tool: &str) -> Result<PathBuf> {
    which::which(tool)
        .map_err(|e| Error::configuration(format!("required tool `{}` not found: {}", tool, e)))
}

impl System for LinuxSystem {
    fn find_free_loop(&self) -> Result<PathBuf> {
        LoopDev::find_free(&self.losetup).map(|dev| dev.path().to_path_buf())
    }

    fn attach_loop(&self, loop_dev: &Path, file: &Path) -> Result<()> {
        LoopDev::new(loop_dev).attach(&self.losetup, file)
    }

    fn detach_loop(&self, loop_dev: &Path) -> Result<()> {
        LoopDev::new(loop_dev).detach(&self.losetup)
    }

    fn loop_backing_file(&self, loop_dev: &Path) -> Result<Option<PathBuf>> {
        LoopDev::new(loop_dev).backing_file()
    }

    fn create_dm_device(&self, name: &str, table: &DmTable) -> Result<PathBuf> {
        dm::create(&self.dmsetup, name, table)
    }

    fn remove_dm_device(&self, name: &str) -> Result<()> {
        dm::remove(&self.dmsetup, name)
    }

    fn dm_device_exists(&self, name: &str) -> Result<bool> {
        let path = dm_device_path(name);
        path.try_exists()
            .map_err(|e| Error::kernel(format!("stat {}: {}", path.display(), e)))
    }

    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &MountOptions,
    ) -> Result<()> {
        mount::mount(source, target, fs_type, options)
    }

    fn unmount(&self, target: &Path, mode: UnmountMode) -> Result<()> {
        mount::unmount(target, mode)
    }

    fn mounts(&self) -> Result<Vec<MountEntry>> {
        let content = fs::read_to_string(MOUNT_TABLE)
            .map_err(|e| Error::kernel(format!("read {}: {}", MOUNT_TABLE, e)))?;
        Ok(mount::parse_mount_table(&content))
    }
}
