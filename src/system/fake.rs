//! In-memory [`System`] with failure injection.

use nix::errno::Errno;
use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

use super::{dm_device_path, DmTable, MountEntry, MountOptions, System, UnmountMode};

/// Kernel state and injected failures.
#[derive(Debug)]
pub(crate) struct FakeState {
    pub slots: usize,
    pub loops: BTreeMap<PathBuf, PathBuf>,
    pub dm: BTreeMap<String, DmTable>,
    pub mounts: Vec<MountEntry>,

    /// Every `mount` fails with this errno.
    pub mount_errno: Option<Errno>,
    /// Number of `mount` calls failing with `EBUSY`.
    pub busy_mounts: u32,
    /// Number of plain unmounts failing with `EBUSY`.
    pub busy_unmounts: u32,
    pub fail_lazy_unmount: bool,
    pub fail_force_unmount: bool,
    pub fail_detach: bool,
    pub fail_dm_remove: bool,
    /// Number of attach calls that lose the slot to another process.
    pub steal_slots: u32,
    /// Log of unmount modes used.
    pub unmounts: Vec<UnmountMode>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            slots: 8,
            loops: BTreeMap::new(),
            dm: BTreeMap::new(),
            mounts: Vec::new(),
            mount_errno: None,
            busy_mounts: 0,
            busy_unmounts: 0,
            fail_lazy_unmount: false,
            fail_force_unmount: false,
            fail_detach: false,
            fail_dm_remove: false,
            steal_slots: 0,
            unmounts: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeSystem {
    state: RefCell<FakeState>,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_mut(&self) -> RefMut<'_, FakeState> {
        self.state.borrow_mut()
    }

    pub fn attached_loops(&self) -> Vec<PathBuf> {
        self.state.borrow().loops.keys().cloned().collect()
    }

    pub fn dm_devices(&self) -> Vec<String> {
        self.state.borrow().dm.keys().cloned().collect()
    }

    pub fn mounted_targets(&self) -> Vec<PathBuf> {
        self.state
            .borrow()
            .mounts
            .iter()
            .map(|m| m.target.clone())
            .collect()
    }

    /// Pristine kernel: nothing attached, nothing mounted.
    pub fn is_clean(&self) -> bool {
        let state = self.state.borrow();
        state.loops.is_empty() && state.dm.is_empty() && state.mounts.is_empty()
    }

    fn device_exists(state: &FakeState, device: &Path) -> bool {
        state.loops.contains_key(device)
            || state.dm.keys().any(|name| dm_device_path(name) == device)
    }
}

impl System for FakeSystem {
    fn find_free_loop(&self) -> Result<PathBuf> {
        let state = self.state.borrow();
        (0..state.slots)
            .map(|n| PathBuf::from(format!("/dev/loop{}", n)))
            .find(|path| !state.loops.contains_key(path))
            .ok_or_else(|| Error::resource_exhaustion("no free loop device"))
    }

    fn attach_loop(&self, loop_dev: &Path, file: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.steal_slots > 0 {
            state.steal_slots -= 1;
            state
                .loops
                .insert(loop_dev.to_path_buf(), PathBuf::from("/other/process/file"));
        }
        if state.loops.contains_key(loop_dev) {
            return Err(Error::resource_exhaustion(format!(
                "attach {}: Device or resource busy",
                loop_dev.display()
            )));
        }
        state
            .loops
            .insert(loop_dev.to_path_buf(), file.to_path_buf());
        Ok(())
    }

    fn detach_loop(&self, loop_dev: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_detach {
            return Err(Error::kernel(format!("detach {}: injected", loop_dev.display())));
        }
        state
            .loops
            .remove(loop_dev)
            .map(|_| ())
            .ok_or_else(|| Error::from_errno(format!("detach {}", loop_dev.display()), Errno::ENXIO))
    }

    fn loop_backing_file(&self, loop_dev: &Path) -> Result<Option<PathBuf>> {
        Ok(self.state.borrow().loops.get(loop_dev).cloned())
    }

    fn create_dm_device(&self, name: &str, table: &DmTable) -> Result<PathBuf> {
        let mut state = self.state.borrow_mut();
        if state.dm.contains_key(name) {
            return Err(Error::from_errno(format!("create {}", name), Errno::EEXIST));
        }
        if let Some(target) = table
            .targets()
            .iter()
            .find(|t| !state.loops.contains_key(&t.device))
        {
            return Err(Error::from_errno(
                format!("create {}: {}", name, target.device.display()),
                Errno::ENXIO,
            ));
        }
        state.dm.insert(name.to_string(), table.clone());
        Ok(dm_device_path(name))
    }

    fn remove_dm_device(&self, name: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_dm_remove {
            return Err(Error::kernel(format!("remove {}: injected", name)));
        }
        state
            .dm
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::from_errno(format!("remove {}", name), Errno::ENXIO))
    }

    fn dm_device_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.borrow().dm.contains_key(name))
    }

    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        _options: &MountOptions,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let what = format!("mount {} at {}", source.display(), target.display());
        if let Some(errno) = state.mount_errno {
            return Err(Error::from_errno(what, errno));
        }
        if state.busy_mounts > 0 {
            state.busy_mounts -= 1;
            return Err(Error::from_errno(what, Errno::EBUSY));
        }
        if !Self::device_exists(&state, source) {
            return Err(Error::from_errno(what, Errno::ENOENT));
        }
        state.mounts.push(MountEntry {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_string(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path, mode: UnmountMode) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.unmounts.push(mode);
        let what = format!("unmount {}", target.display());
        let Some(pos) = state.mounts.iter().rposition(|m| m.target == target) else {
            return Err(Error::from_errno(what, Errno::EINVAL));
        };
        let busy = match mode {
            UnmountMode::Normal => {
                let busy = state.busy_unmounts > 0;
                state.busy_unmounts = state.busy_unmounts.saturating_sub(1);
                busy
            }
            UnmountMode::Lazy => state.fail_lazy_unmount,
            UnmountMode::Force => state.fail_force_unmount,
        };
        if busy {
            return Err(Error::from_errno(what, Errno::EBUSY));
        }
        state.mounts.remove(pos);
        Ok(())
    }

    fn mounts(&self) -> Result<Vec<MountEntry>> {
        Ok(self.state.borrow().mounts.clone())
    }
}
