//! Error taxonomy shared by every mount operation.

use nix::errno::Errno;
use serde::Serialize;
use std::fmt;

/// Category of a failed operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Bad or missing input, target already mounted. Raised before any OS state is touched.
    Configuration,

    /// No free block devices (loop slots) available.
    ResourceExhaustion,

    /// `mount(2)`, `umount2(2)` or a device helper failed.
    KernelOperation,

    /// Mount record or copy metadata is missing, corrupt or refers to something that is gone.
    Consistency,

    /// Rollback or cleanup could not undo everything that was acquired.
    Residue,

    /// Another process holds the cache directory lock.
    LockTimeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configuration => "ConfigurationError",
            Self::ResourceExhaustion => "ResourceExhaustion",
            Self::KernelOperation => "KernelOperationFailure",
            Self::Consistency => "ConsistencyError",
            Self::Residue => "ResidueError",
            Self::LockTimeout => "LockTimeout",
        })
    }
}

/// Structured error returned by mount, unmount and residue operations.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    errno: Option<Errno>,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        Self {
            kind,
            message: message.into(),
            errno: None,
        }
    }

    pub fn configuration<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn resource_exhaustion<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorKind::ResourceExhaustion, message)
    }

    pub fn consistency<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorKind::Consistency, message)
    }

    pub fn residue<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorKind::Residue, message)
    }

    pub fn lock_timeout<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorKind::LockTimeout, message)
    }

    /// Kernel operation failure without an errno (e.g. a helper tool failed).
    pub fn kernel<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorKind::KernelOperation, message)
    }

    /// Kernel operation failure carrying the OS error code.
    pub fn from_errno<M: Into<String>>(message: M, errno: Errno) -> Self {
        Self {
            kind: ErrorKind::KernelOperation,
            message: format!("{}: {} ({:?})", message.into(), errno.desc(), errno),
            errno: Some(errno),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn errno(&self) -> Option<Errno> {
        self.errno
    }

    /// `EBUSY`-class failure, worth retrying.
    pub fn is_busy(&self) -> bool {
        matches!(self.errno, Some(Errno::EBUSY) | Some(Errno::EAGAIN))
    }

    /// Prefix the message keeping kind and errno.
    pub fn context<C: fmt::Display>(mut self, context: C) -> Self {
        self.message = format!("{}: {}", context, self.message);
        self
    }
}

/// Last-error slot of a [`ProviderHandle`](crate::ProviderHandle).
///
/// Overwritten by every failing call and cleared by the next successful one.
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    last: Option<String>,
}

impl ErrorContext {
    /// Update the slot from the outcome of a call.
    pub fn observe<T>(&mut self, result: &Result<T>) {
        self.last = result.as_ref().err().map(ToString::to_string);
    }

    /// Human-readable description of the last failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorContext, ErrorKind, Result};
    use nix::errno::Errno;

    #[test]
    fn test_display_includes_kind() {
        let err = Error::consistency("record /cache/a.json not found");
        assert_eq!(
            err.to_string(),
            "ConsistencyError: record /cache/a.json not found"
        );
    }

    #[test]
    fn test_errno_is_kept() {
        let err = Error::from_errno("umount /mnt/vc1", Errno::EBUSY);
        assert_eq!(err.kind(), ErrorKind::KernelOperation);
        assert_eq!(err.errno(), Some(Errno::EBUSY));
        assert!(err.is_busy());
        assert!(err.message().starts_with("umount /mnt/vc1"));
    }

    #[test]
    fn test_context_keeps_kind_and_errno() {
        let err = Error::from_errno("mount", Errno::EINVAL).context("rollback");
        assert_eq!(err.kind(), ErrorKind::KernelOperation);
        assert_eq!(err.errno(), Some(Errno::EINVAL));
        assert!(err.message().starts_with("rollback: mount"));
        assert!(!err.is_busy());
    }

    #[test]
    fn test_error_context_cleared_on_success() {
        let mut ctx = ErrorContext::default();
        let failed: Result<()> = Err(Error::configuration("bad target"));
        ctx.observe(&failed);
        assert_eq!(ctx.last_error(), Some("ConfigurationError: bad target"));

        let failed: Result<()> = Err(Error::resource_exhaustion("no loop"));
        ctx.observe(&failed);
        assert_eq!(ctx.last_error(), Some("ResourceExhaustion: no loop"));

        ctx.observe(&Ok::<_, Error>(1));
        assert_eq!(ctx.last_error(), None);
    }
}
