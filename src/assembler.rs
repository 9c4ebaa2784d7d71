//! Block device assembly from a volume copy.

use log::{debug, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::thread;
use ulid::Ulid;

use crate::checkpoint::CheckpointJournal;
use crate::meta::{CopyExtent, CopyFormat, VolumeCopyMeta};
use crate::settings::{backoff, Settings};
use crate::system::{DmTable, System};
use crate::{Error, ErrorKind, Result};

/// Prefix of device-mapper device names created here.
pub const DM_NAME_PREFIX: &str = "vcopymount-";

/// Block device backing a volume copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceRef {
    /// Device to mount: a loop device or `/dev/mapper/<name>`.
    pub device_path: PathBuf,

    /// Loop devices in volume order.
    pub loop_devices: Vec<PathBuf>,

    /// Device-mapper device concatenating `loop_devices`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dm_device_name: Option<String>,

    pub copy_name: String,
    pub copy_format: CopyFormat,
}

/// Turns (meta, data) into a kernel block device and releases it.
pub struct VolumeImageAssembler<'a, S: System> {
    system: &'a S,
    journal: CheckpointJournal,
    settings: &'a Settings,
}

impl<'a, S: System> VolumeImageAssembler<'a, S> {
    /// Assembler writing creation checkpoints into `cache_dir`.
    pub fn new(system: &'a S, cache_dir: &Path, settings: &'a Settings) -> Self {
        Self {
            system,
            journal: CheckpointJournal::new(cache_dir),
            settings,
        }
    }

    /// Validate the copy and build a read-only block device for it.
    ///
    /// Devices created before a failure are released before returning.
    pub fn assemble(&self, meta_dir: &Path, data_dir: &Path) -> Result<BlockDeviceRef> {
        let meta = VolumeCopyMeta::read(meta_dir)?;
        let extents = meta.validate(data_dir)?;
        info!(
            "assembling copy {} ({}, {} segment(s), {})",
            meta.copy_name,
            meta.copy_format,
            extents.len(),
            bytesize::ByteSize::b(meta.volume_size)
        );

        let mut device = BlockDeviceRef {
            device_path: PathBuf::new(),
            loop_devices: Vec::new(),
            dm_device_name: None,
            copy_name: meta.copy_name.clone(),
            copy_format: meta.copy_format,
        };

        match self.build(&extents, &mut device) {
            Ok(()) => {
                debug!("block device ready: {}", device.device_path.display());
                Ok(device)
            }
            Err(e) => match self.release(&device) {
                Ok(()) => Err(e),
                Err(residue) => Err(Error::residue(format!(
                    "{}; cleanup of partially assembled device failed: {}",
                    e,
                    residue.message()
                ))),
            },
        }
    }

    fn build(&self, extents: &[CopyExtent], device: &mut BlockDeviceRef) -> Result<()> {
        for extent in extents {
            let loop_dev = self.attach(&extent.file)?;
            device.loop_devices.push(loop_dev);
        }

        if let [single] = device.loop_devices.as_slice() {
            device.device_path = single.clone();
            return Ok(());
        }

        let mut table = DmTable::new();
        for (extent, loop_dev) in extents.iter().zip(&device.loop_devices) {
            table.append(loop_dev, extent.length)?;
        }
        let name = format!("{}{}", DM_NAME_PREFIX, Ulid::new().to_string().to_lowercase());
        self.journal.record_dm(&name, &device.loop_devices)?;
        device.dm_device_name = Some(name.clone());
        device.device_path = self.system.create_dm_device(&name, &table)?;
        Ok(())
    }

    /// Attach file to a free loop device, retrying when slots run out or get taken.
    fn attach(&self, file: &Path) -> Result<PathBuf> {
        let mut attempt = 0;
        loop {
            match self.try_attach(file) {
                Ok(loop_dev) => return Ok(loop_dev),
                Err(e)
                    if e.kind() == ErrorKind::ResourceExhaustion
                        && attempt < self.settings.alloc_retries =>
                {
                    let delay = backoff(self.settings.alloc_backoff, attempt);
                    debug!("loop allocation failed ({}), retrying in {:?}", e, delay);
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_attach(&self, file: &Path) -> Result<PathBuf> {
        let loop_dev = self.system.find_free_loop()?;
        self.journal.record_loop(&loop_dev, file)?;
        if let Err(e) = self.system.attach_loop(&loop_dev, file) {
            if let Err(forget) = self.journal.forget_loop(&loop_dev) {
                warn!("{}", forget);
            }
            return Err(e);
        }
        debug!("{} -> {}", file.display(), loop_dev.display());
        Ok(loop_dev)
    }

    /// Release device. Already released parts are skipped.
    ///
    /// Every loop device is attempted once the dm device is gone; failures are
    /// collected into a `ResidueError`.
    pub fn release(&self, device: &BlockDeviceRef) -> Result<()> {
        let mut failures = Vec::new();

        if let Some(name) = &device.dm_device_name {
            if let Err(e) = self.release_dm(name) {
                // loop devices stay attached under the dm device, both keep their checkpoints
                warn!("{}", e);
                return Err(Error::residue(format!(
                    "failed to release {}: {}",
                    device.device_path.display(),
                    e
                )));
            }
        }
        for loop_dev in device.loop_devices.iter().rev() {
            if let Err(e) = self.release_loop(loop_dev) {
                warn!("{}", e);
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::residue(format!(
                "failed to release {}: {}",
                device.device_path.display(),
                failures.join("; ")
            )))
        }
    }

    pub(crate) fn release_dm(&self, name: &str) -> Result<()> {
        if self.system.dm_device_exists(name)? {
            self.system.remove_dm_device(name)?;
            debug!("released dm device {}", name);
        }
        self.journal.forget_dm(name)
    }

    /// Detach loop device if it is still bound to the checkpointed file.
    pub(crate) fn release_loop(&self, loop_dev: &Path) -> Result<()> {
        let expected = self.journal.loop_backing(loop_dev)?;
        match (self.system.loop_backing_file(loop_dev)?, expected) {
            (Some(current), Some(expected)) if current == expected => {
                self.system.detach_loop(loop_dev)?;
                debug!("released loop device {}", loop_dev.display());
            }
            (Some(current), Some(_)) => {
                warn!(
                    "{} is now bound to {}, leaving it attached",
                    loop_dev.display(),
                    current.display()
                );
            }
            (Some(_), None) => {
                warn!(
                    "{} has no creation checkpoint, leaving it attached",
                    loop_dev.display()
                );
            }
            (None, _) => {}
        }
        self.journal.forget_loop(loop_dev)
    }
}
