//! vcopymount commands definition.

use clap::ValueHint;
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;
use vcopymount::{LinuxSystem, MountLifecycleManager, Settings};

/// Arguments selecting the cache directory.
#[derive(Clone, Debug, clap::Args)]
pub struct CacheArgs {
    /// Directory holding mount records, creation checkpoints and the lock file.
    #[arg(
        long,
        env = "VCOPYMOUNT_CACHE_DIR",
        value_name = "DIR",
        value_hint = ValueHint::DirPath,
        default_value_os_t = default_cache_dir(),
    )]
    pub cache_dir: PathBuf,
}

/// Per-user cache directory, `.cache` if it cannot be determined.
fn default_cache_dir() -> PathBuf {
    ProjectDirs::from("", "", "vcopymount")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".cache"))
}

/// Tunables shared by all operations.
#[derive(Clone, Debug, clap::Args)]
pub struct SettingsArgs {
    /// Seconds to wait for the cache directory lock.
    #[arg(
        global = true,
        long,
        value_name = "SECONDS",
        env = "VCOPYMOUNT_LOCK_TIMEOUT",
        default_value_t = Settings::default().lock_timeout.as_secs(),
    )]
    pub lock_timeout: u64,

    /// Extra attempts of a busy unmount before falling back to lazy detach.
    #[arg(
        global = true,
        long,
        value_name = "N",
        default_value_t = Settings::default().unmount_retries,
    )]
    pub unmount_retries: u32,

    /// Never fall back to lazy or forced unmount.
    #[arg(global = true, long)]
    pub no_lazy_unmount: bool,
}

impl SettingsArgs {
    pub fn settings(&self) -> Settings {
        Settings {
            lock_timeout: Duration::from_secs(self.lock_timeout),
            unmount_retries: self.unmount_retries,
            lazy_unmount: !self.no_lazy_unmount,
            ..Settings::default()
        }
    }

    /// Manager over the running kernel. Fails if helper tools are missing.
    pub fn manager(&self) -> vcopymount::Result<MountLifecycleManager<LinuxSystem>> {
        Ok(MountLifecycleManager::new(
            LinuxSystem::new()?,
            self.settings(),
        ))
    }
}

pub mod mount;
pub mod residue;
pub mod show;
pub mod umount;
