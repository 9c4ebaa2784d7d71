//! Tunables for retries, backoff and locking.

use std::time::Duration;

/// Operation settings.
///
/// Defaults are suitable for interactive use; tests use [`Settings::immediate()`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// How long to wait for the cache directory lock.
    pub lock_timeout: Duration,

    /// Extra attempts to allocate a loop device when none is free or a slot was taken.
    pub alloc_retries: u32,

    /// Initial delay between allocation and `mount(2)` attempts. Doubles on every attempt.
    pub alloc_backoff: Duration,

    /// Extra attempts of `mount(2)` on `EBUSY`/`EAGAIN`.
    pub mount_retries: u32,

    /// Extra attempts of a plain unmount on `EBUSY`.
    pub unmount_retries: u32,

    /// Initial delay between unmount attempts. Doubles on every attempt.
    pub unmount_backoff: Duration,

    /// Fall back to lazy and then forced unmount when the target stays busy.
    pub lazy_unmount: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            alloc_retries: 3,
            alloc_backoff: Duration::from_millis(100),
            mount_retries: 3,
            unmount_retries: 3,
            unmount_backoff: Duration::from_millis(200),
            lazy_unmount: true,
        }
    }
}

impl Settings {
    /// Same retry counts as default, without any sleeping.
    pub fn immediate() -> Self {
        Self {
            lock_timeout: Duration::ZERO,
            alloc_backoff: Duration::ZERO,
            unmount_backoff: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at 64x.
pub(crate) fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1 << attempt.min(6))
}

#[cfg(test)]
mod tests {
    use super::{backoff, Settings};
    use std::time::Duration;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 0), Duration::from_millis(100));
        assert_eq!(backoff(base, 1), Duration::from_millis(200));
        assert_eq!(backoff(base, 3), Duration::from_millis(800));
        assert_eq!(backoff(base, 6), backoff(base, 30));
    }

    #[test]
    fn test_immediate_keeps_retry_counts() {
        let settings = Settings::immediate();
        assert_eq!(settings.unmount_retries, Settings::default().unmount_retries);
        assert_eq!(settings.unmount_backoff, Duration::ZERO);
        assert!(settings.lazy_unmount);
    }
}
