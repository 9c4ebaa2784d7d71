//! Residue scanning and cleanup.
//!
//! Sources of truth are the mount records, the creation checkpoints and the
//! live mount table. Everything is re-read on every scan, so clearing is
//! idempotent and safe to repeat after a partial failure.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::assembler::VolumeImageAssembler;
use crate::checkpoint::CheckpointJournal;
use crate::lifecycle::unmount_with_fallback;
use crate::record::MountRecordStore;
use crate::system::{dm_device_path, mounted_from, MountEntry, System};
use crate::{Error, Result, Settings};

/// What a residue scan removed and what it refused to touch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResidueReport {
    pub released_devices: Vec<PathBuf>,
    pub unmounted_targets: Vec<PathBuf>,
    pub removed_records: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

impl ResidueReport {
    /// Nothing was removed.
    pub fn is_empty(&self) -> bool {
        self.released_devices.is_empty()
            && self.unmounted_targets.is_empty()
            && self.removed_records.is_empty()
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

pub struct ResidueScanner<'a, S: System> {
    system: &'a S,
    settings: Settings,
    store: MountRecordStore,
    journal: CheckpointJournal,
    assembler: VolumeImageAssembler<'a, S>,
}

impl<'a, S: System> ResidueScanner<'a, S> {
    pub fn new(system: &'a S, cache_dir: &Path, settings: &'a Settings) -> Self {
        Self {
            system,
            // orphans are nobody's mounts, lazy detach is always fine
            settings: Settings {
                lazy_unmount: true,
                ..settings.clone()
            },
            store: MountRecordStore::new(cache_dir),
            journal: CheckpointJournal::new(cache_dir),
            assembler: VolumeImageAssembler::new(system, cache_dir, settings),
        }
    }

    /// Remove stale records and orphaned devices.
    ///
    /// With `target`, only records for that target and orphans mounted there are handled.
    pub fn clear(&self, target: Option<&Path>) -> Result<ResidueReport> {
        let mut report = ResidueReport::default();
        let mut failures = Vec::new();
        let mounts = self.system.mounts()?;

        // devices referenced by live or out-of-scope records
        let mut referenced_loops = BTreeSet::new();
        let mut referenced_dms = BTreeSet::new();
        let mut corrupt_records = false;

        for (path, record) in self.store.list()? {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    corrupt_records = true;
                    report.warn(format!("skipping unreadable record: {}", e.message()));
                    continue;
                }
            };

            let in_scope = target.map_or(true, |t| record.mount_target_path == t);
            // live only while the recorded device is mounted there
            let live = mounted_from(&mounts, &record.block_device_ref)
                .any(|mount_point| mount_point == record.mount_target_path);
            if !in_scope || live {
                debug!(
                    "keeping record {} ({})",
                    path.display(),
                    if live { "live" } else { "out of scope" }
                );
                referenced_loops.extend(record.loop_devices.iter().cloned());
                referenced_dms.extend(record.dm_device_name.iter().cloned());
                continue;
            }

            info!(
                "stale record {}: {} is not mounted at {}",
                path.display(),
                record.block_device_ref.display(),
                record.mount_target_path.display()
            );
            let device = record.block_device();
            if let Err(e) = self.assembler.release(&device) {
                failures.push(e.message().to_string());
                referenced_loops.extend(record.loop_devices.iter().cloned());
                referenced_dms.extend(record.dm_device_name.iter().cloned());
                continue;
            }
            report
                .released_devices
                .extend(device.dm_device_name.iter().map(|n| dm_device_path(n)));
            report
                .released_devices
                .extend(device.loop_devices.iter().cloned());
            match MountRecordStore::delete(&path) {
                Ok(()) => report.removed_records.push(path),
                Err(e) => failures.push(e.message().to_string()),
            }
        }

        // device-mapper orphans first, they hold loop devices
        for checkpoint in self.journal.dm_devices()? {
            if referenced_dms.contains(&checkpoint.name) {
                referenced_loops.extend(checkpoint.loop_devices.iter().cloned());
                continue;
            }
            let device = dm_device_path(&checkpoint.name);
            if !self.system.dm_device_exists(&checkpoint.name)? {
                debug!("dm device {} is gone, forgetting it", checkpoint.name);
                if let Err(e) = self.journal.forget_dm(&checkpoint.name) {
                    failures.push(e.message().to_string());
                }
                continue;
            }
            match self.clear_orphan(&device, &mounts, target, corrupt_records, &mut report) {
                Ok(true) => match self.assembler.release_dm(&checkpoint.name) {
                    Ok(()) => report.released_devices.push(device),
                    Err(e) => {
                        failures.push(e.message().to_string());
                        referenced_loops.extend(checkpoint.loop_devices.iter().cloned());
                    }
                },
                Ok(false) => referenced_loops.extend(checkpoint.loop_devices.iter().cloned()),
                Err(e) => {
                    failures.push(e.message().to_string());
                    referenced_loops.extend(checkpoint.loop_devices.iter().cloned());
                }
            }
        }

        for checkpoint in self.journal.loops()? {
            if referenced_loops.contains(&checkpoint.device) {
                continue;
            }
            let current = self.system.loop_backing_file(&checkpoint.device)?;
            if current.as_ref() != Some(&checkpoint.backing_file) {
                if let Some(current) = current {
                    report.warn(format!(
                        "{} is bound to {}, not {}; forgetting stale checkpoint",
                        checkpoint.device.display(),
                        current.display(),
                        checkpoint.backing_file.display()
                    ));
                } else {
                    debug!("{} is detached, forgetting it", checkpoint.device.display());
                }
                if let Err(e) = self.journal.forget_loop(&checkpoint.device) {
                    failures.push(e.message().to_string());
                }
                continue;
            }
            match self.clear_orphan(&checkpoint.device, &mounts, target, corrupt_records, &mut report)
            {
                Ok(true) => match self.assembler.release_loop(&checkpoint.device) {
                    Ok(()) => report.released_devices.push(checkpoint.device),
                    Err(e) => failures.push(e.message().to_string()),
                },
                Ok(false) => {}
                Err(e) => failures.push(e.message().to_string()),
            }
        }

        if failures.is_empty() {
            info!(
                "residue cleared: {} device(s), {} mount(s), {} record(s)",
                report.released_devices.len(),
                report.unmounted_targets.len(),
                report.removed_records.len()
            );
            Ok(report)
        } else {
            Err(Error::residue(format!(
                "residue remains: {}",
                failures.join("; ")
            )))
        }
    }

    /// Unmount every mount of an orphaned device.
    ///
    /// Returns `false` if the device must be left alone.
    fn clear_orphan(
        &self,
        device: &Path,
        mounts: &[MountEntry],
        target: Option<&Path>,
        corrupt_records: bool,
        report: &mut ResidueReport,
    ) -> Result<bool> {
        let mounted = mounted_from(mounts, device)
            .map(Path::to_path_buf)
            .collect::<Vec<_>>();

        if let Some(target) = target {
            if !mounted.iter().any(|m| m == target) {
                debug!(
                    "{} is not mounted at {}, out of scope",
                    device.display(),
                    target.display()
                );
                return Ok(false);
            }
        }
        if corrupt_records && !mounted.is_empty() {
            report.warn(format!(
                "{} is mounted and may belong to an unreadable record, leaving it",
                device.display()
            ));
            return Ok(false);
        }

        info!("orphaned device {}", device.display());
        for mount_point in mounted {
            unmount_with_fallback(self.system, &mount_point, &self.settings)?;
            report.unmounted_targets.push(mount_point);
        }
        Ok(true)
    }
}
