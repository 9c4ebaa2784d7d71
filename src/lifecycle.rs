//! Mount and unmount orchestration.
//!
//! Mount: `Init -> DeviceReady -> Mounted -> Recorded`, or `Failed` after rollback.
//! Unmount: `Recorded -> Unmounting -> DeviceReleased -> Cleared`, back to `Recorded`
//! when the target cannot be unmounted, or `Residue` when the record cannot be removed.

use chrono::Utc;
use log::{debug, info, warn};
use nix::errno::Errno;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use ulid::Ulid;

use crate::assembler::{BlockDeviceRef, VolumeImageAssembler};
use crate::config::{MountConfig, ValidatedConfig};
use crate::directory::Directory;
use crate::lock::FileLock;
use crate::pipeline::{Pipeline, Step, Steps};
use crate::record::{MountRecord, MountRecordStore};
use crate::residue::{ResidueReport, ResidueScanner};
use crate::settings::{backoff, Settings};
use crate::system::{mount_at, mounted_from, MountOptions, System, UnmountMode};
use crate::{Error, ErrorContext, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MountState {
    Init,
    DeviceReady,
    Mounted,
    Recorded,
    Failed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnmountState {
    Recorded,
    Unmounting,
    DeviceReleased,
    Cleared,
    Residue,
}

fn transition<T: fmt::Debug + Copy>(state: &mut T, next: T) {
    debug!("{:?} -> {:?}", state, next);
    *state = next;
}

/// Mount `source` at `target`, retrying while the kernel reports busy.
pub(crate) fn mount_with_retry<S: System>(
    system: &S,
    source: &Path,
    target: &Path,
    fs_type: &str,
    options: &MountOptions,
    settings: &Settings,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        match system.mount(source, target, fs_type, options) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_busy() && attempt < settings.mount_retries => {
                let delay = backoff(settings.alloc_backoff, attempt);
                debug!("{}, retrying in {:?}", e, delay);
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn already_unmounted(e: &Error) -> bool {
    matches!(e.errno(), Some(Errno::EINVAL) | Some(Errno::ENOENT))
}

/// Unmount `target`: plain unmount with retries, then lazy and forced detach.
///
/// Returns the mode that succeeded.
pub(crate) fn unmount_with_fallback<S: System>(
    system: &S,
    target: &Path,
    settings: &Settings,
) -> Result<UnmountMode> {
    let mut attempt = 0;
    let busy = loop {
        match system.unmount(target, UnmountMode::Normal) {
            Ok(()) => return Ok(UnmountMode::Normal),
            Err(e) if attempt > 0 && already_unmounted(&e) => return Ok(UnmountMode::Normal),
            Err(e) if e.is_busy() && attempt < settings.unmount_retries => {
                let delay = backoff(settings.unmount_backoff, attempt);
                debug!("{}, retrying in {:?}", e, delay);
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) if e.is_busy() => break e,
            Err(e) => return Err(e),
        }
    };
    if !settings.lazy_unmount {
        return Err(busy);
    }

    warn!("{} is busy, detaching lazily", target.display());
    match system.unmount(target, UnmountMode::Lazy) {
        Ok(()) => return Ok(UnmountMode::Lazy),
        Err(e) if already_unmounted(&e) => return Ok(UnmountMode::Lazy),
        Err(e) => warn!("lazy unmount of {} failed: {}", target.display(), e),
    }
    match system.unmount(target, UnmountMode::Force) {
        Ok(()) => Ok(UnmountMode::Force),
        Err(e) if already_unmounted(&e) => Ok(UnmountMode::Force),
        Err(e) => Err(e),
    }
}

/// State of one mount operation.
pub(crate) struct MountContext<'s, S: System> {
    system: &'s S,
    settings: &'s Settings,
    cache_dir: PathBuf,
    config: ValidatedConfig,
    device: Option<BlockDeviceRef>,
    saved: Option<(PathBuf, MountRecord)>,
    state: MountState,
}

impl<'s, S: System> MountContext<'s, S> {
    fn assembler(&self) -> VolumeImageAssembler<'s, S> {
        VolumeImageAssembler::new(self.system, &self.cache_dir, self.settings)
    }

    fn device(&self) -> Result<&BlockDeviceRef> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::consistency("block device is not assembled"))
    }
}

struct AssembleDevice;

impl<'s, S: System> Step<MountContext<'s, S>> for AssembleDevice {
    fn name(&self) -> &'static str {
        "assemble device"
    }

    fn run(&mut self, ctx: &mut MountContext<'s, S>) -> Result<()> {
        let device = ctx
            .assembler()
            .assemble(&ctx.config.meta_dir, &ctx.config.data_dir)?;
        ctx.device = Some(device);
        transition(&mut ctx.state, MountState::DeviceReady);
        Ok(())
    }

    fn rollback(&mut self, ctx: &mut MountContext<'s, S>) -> Result<()> {
        let Some(device) = ctx.device.take() else {
            return Ok(());
        };
        // a device that could not be unmounted keeps its checkpoints
        let mounts = ctx.system.mounts()?;
        if let Some(target) = mounted_from(&mounts, &device.device_path).next() {
            return Err(Error::residue(format!(
                "{} is still mounted at {}, left for residue clearing",
                device.device_path.display(),
                target.display()
            )));
        }
        ctx.assembler().release(&device)
    }
}

struct MountDevice;

impl<'s, S: System> Step<MountContext<'s, S>> for MountDevice {
    fn name(&self) -> &'static str {
        "mount"
    }

    fn run(&mut self, ctx: &mut MountContext<'s, S>) -> Result<()> {
        let device = ctx.device()?;
        mount_with_retry(
            ctx.system,
            &device.device_path,
            &ctx.config.target,
            &ctx.config.fs_type,
            &ctx.config.mount_options,
            ctx.settings,
        )?;
        info!(
            "mounted {} at {}",
            device.device_path.display(),
            ctx.config.target.display()
        );
        transition(&mut ctx.state, MountState::Mounted);
        Ok(())
    }

    fn rollback(&mut self, ctx: &mut MountContext<'s, S>) -> Result<()> {
        unmount_with_fallback(ctx.system, &ctx.config.target, ctx.settings).map(|_| ())
    }
}

struct SaveRecord;

impl<'s, S: System> Step<MountContext<'s, S>> for SaveRecord {
    fn name(&self) -> &'static str {
        "save record"
    }

    fn run(&mut self, ctx: &mut MountContext<'s, S>) -> Result<()> {
        let device = ctx.device()?;
        let mut record = MountRecord {
            record_id: Ulid::new().to_string(),
            cache_dir_path: ctx.cache_dir.clone(),
            copy_meta_dir_path: ctx.config.meta_dir.clone(),
            copy_data_dir_path: ctx.config.data_dir.clone(),
            mount_target_path: ctx.config.target.clone(),
            mount_fs_type: ctx.config.fs_type.clone(),
            mount_options: ctx.config.options.clone(),
            block_device_ref: device.device_path.clone(),
            loop_devices: device.loop_devices.clone(),
            dm_device_name: device.dm_device_name.clone(),
            copy_name: device.copy_name.clone(),
            copy_format: device.copy_format,
            created_at: Utc::now(),
        };
        let path = MountRecordStore::new(&ctx.cache_dir).save(&mut record)?;
        debug!("mount record: {}", path.display());
        ctx.saved = Some((path, record));
        transition(&mut ctx.state, MountState::Recorded);
        Ok(())
    }
}

fn mount_steps<'s, S: System>() -> Steps<MountContext<'s, S>> {
    vec![
        Box::new(AssembleDevice),
        Box::new(MountDevice),
        Box::new(SaveRecord),
    ]
}

/// Orchestrates mount, unmount and residue clearing over a [`System`].
pub struct MountLifecycleManager<S: System> {
    system: S,
    settings: Settings,
}

impl<S: System> MountLifecycleManager<S> {
    pub fn new(system: S, settings: Settings) -> Self {
        Self { system, settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Handle tracking the last error of calls against `cache_dir`.
    pub fn handle<P: Into<PathBuf>>(&self, cache_dir: P) -> ProviderHandle<'_, S> {
        ProviderHandle {
            manager: self,
            cache_dir: cache_dir.into(),
            errors: ErrorContext::default(),
        }
    }

    /// Expose the copy at the configured target. Returns path to the mount record.
    pub fn mount(&self, cache_dir: &Path, config: &MountConfig) -> Result<PathBuf> {
        self.mount_with_record(cache_dir, config).map(|(path, _)| path)
    }

    /// Same as [`Self::mount`], also returning the record that was saved.
    pub fn mount_with_record(
        &self,
        cache_dir: &Path,
        config: &MountConfig,
    ) -> Result<(PathBuf, MountRecord)> {
        self.mount_with_steps(cache_dir, config, mount_steps())
    }

    fn mount_with_steps<'s>(
        &'s self,
        cache_dir: &Path,
        config: &MountConfig,
        steps: Steps<MountContext<'s, S>>,
    ) -> Result<(PathBuf, MountRecord)> {
        let cache = Directory::open_or_create(cache_dir)
            .map_err(|e| Error::configuration(format!("cache directory: {}", e)))?;
        let config = config.validate()?;

        let _lock = FileLock::cache(cache.path(), self.settings.lock_timeout)?;
        let _target_lock = FileLock::target(&config.target, self.settings.lock_timeout)?;
        self.check_target_free(cache.path(), &config.target)?;

        info!(
            "mounting copy {} at {}",
            config.meta_dir.display(),
            config.target.display()
        );
        let mut ctx = MountContext {
            system: &self.system,
            settings: &self.settings,
            cache_dir: cache.path().to_path_buf(),
            config,
            device: None,
            saved: None,
            state: MountState::Init,
        };
        match Pipeline::from_steps(&mut ctx, steps).run() {
            Ok(()) => ctx
                .saved
                .ok_or_else(|| Error::consistency("mount finished without a record")),
            Err(failure) => {
                transition(&mut ctx.state, MountState::Failed);
                Err(failure.into_error())
            }
        }
    }

    fn check_target_free(&self, cache_dir: &Path, target: &Path) -> Result<()> {
        if let Some((path, _)) = MountRecordStore::new(cache_dir)
            .find_by_target(target)?
            .first()
        {
            return Err(Error::configuration(format!(
                "{} already has mount record {}",
                target.display(),
                path.display()
            )));
        }
        if let Some(entry) = mount_at(&self.system.mounts()?, target) {
            return Err(Error::configuration(format!(
                "{} is already mounted from {}",
                target.display(),
                entry.source.display()
            )));
        }
        Ok(())
    }

    /// Undo the mount described by the record.
    pub fn unmount(&self, record_path: &Path) -> Result<()> {
        // nothing is touched for a missing or corrupt record
        MountRecordStore::load(record_path)?;
        let cache_dir = match record_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let _lock = FileLock::cache(cache_dir, self.settings.lock_timeout)?;
        let record = MountRecordStore::load(record_path)?;
        let target = &record.mount_target_path;
        let _target_lock = FileLock::target(target, self.settings.lock_timeout)?;
        let mut state = UnmountState::Recorded;

        match mount_at(&self.system.mounts()?, target) {
            None => {
                return Err(Error::consistency(format!(
                    "{} is not mounted; clear residue to remove record {}",
                    target.display(),
                    record_path.display()
                )))
            }
            Some(entry) if entry.source != record.block_device_ref => {
                return Err(Error::consistency(format!(
                    "{} is mounted from {}, record {} expects {}",
                    target.display(),
                    entry.source.display(),
                    record_path.display(),
                    record.block_device_ref.display()
                )))
            }
            Some(_) => {}
        }

        info!("unmounting {}", target.display());
        transition(&mut state, UnmountState::Unmounting);
        match unmount_with_fallback(&self.system, target, &self.settings) {
            Ok(mode) => debug!("{} unmounted ({:?})", target.display(), mode),
            Err(e) => {
                transition(&mut state, UnmountState::Recorded);
                return Err(e);
            }
        }

        let assembler = VolumeImageAssembler::new(&self.system, cache_dir, &self.settings);
        if let Err(e) = assembler.release(&record.block_device()) {
            warn!("{}; left for residue clearing", e);
        }
        transition(&mut state, UnmountState::DeviceReleased);

        match MountRecordStore::delete(record_path) {
            Ok(()) => {
                transition(&mut state, UnmountState::Cleared);
                info!("unmounted {}", target.display());
                Ok(())
            }
            Err(e) => {
                transition(&mut state, UnmountState::Residue);
                Err(e)
            }
        }
    }

    /// Remove residue in `cache_dir`, optionally only for one target.
    pub fn clear_residue(&self, cache_dir: &Path, target: Option<&Path>) -> Result<ResidueReport> {
        let cache = Directory::open(cache_dir)
            .map_err(|e| Error::configuration(format!("cache directory: {}", e)))?;
        let target = target.map(|t| fs::canonicalize(t).unwrap_or_else(|_| t.to_path_buf()));

        let _lock = FileLock::cache(cache.path(), self.settings.lock_timeout)?;
        let _target_lock = match &target {
            Some(target) => FileLock::target(target, self.settings.lock_timeout)?,
            None => None,
        };
        ResidueScanner::new(&self.system, cache.path(), &self.settings).clear(target.as_deref())
    }
}

/// One caller's view of the manager, with a last-error slot.
pub struct ProviderHandle<'m, S: System> {
    manager: &'m MountLifecycleManager<S>,
    cache_dir: PathBuf,
    errors: ErrorContext,
}

impl<'m, S: System> ProviderHandle<'m, S> {
    pub fn mount(&mut self, config: &MountConfig) -> Result<PathBuf> {
        let result = self.manager.mount(&self.cache_dir, config);
        self.errors.observe(&result);
        result
    }

    pub fn unmount(&mut self, record_path: &Path) -> Result<()> {
        let result = self.manager.unmount(record_path);
        self.errors.observe(&result);
        result
    }

    pub fn clear_residue(&mut self, target: Option<&Path>) -> Result<ResidueReport> {
        let result = self.manager.clear_residue(&self.cache_dir, target);
        self.errors.observe(&result);
        result
    }

    /// Error of the last call, `None` if it succeeded.
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last_error()
    }
}
