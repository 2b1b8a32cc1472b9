use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Backing errors for all provisioning operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed API (message: {message:?}, retryable: {is_retryable:?})")]
    API { message: String, is_retryable: bool },
    #[error("failed for other reasons (message: {message:?}, retryable: {is_retryable:?})")]
    Other { message: String, is_retryable: bool },

    /// The instance already carries more attached volumes than the configured
    /// ceiling. Nothing has been created when this is returned.
    #[error("maximum number of attached volumes reached ({attached} attached, limit {limit})")]
    MaxAttachedVolumesReached { attached: usize, limit: usize },

    /// All 26 "/dev/sd[a-z]" slots are occupied. Raised before any volume
    /// is created.
    #[error("no free device slot left ({existing} devices already present)")]
    DeviceSlotsExhausted { existing: usize },

    /// Attaching the freshly created volume failed. "cleanup" records whether
    /// the compensating delete removed the volume or left it behind, so the
    /// original attachment failure is never masked by a failed delete.
    #[error("failed to attach volume {volume_id:?} ({attach_error}); {cleanup}")]
    AttachFailed {
        volume_id: String,
        attach_error: String,
        cleanup: CleanupOutcome,
    },
}

/// Outcome of the compensating delete after a failed attachment.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CleanupOutcome {
    /// The volume was deleted; nothing is billed.
    Deleted,
    /// The delete failed too; the volume may be left behind.
    DeleteFailed { message: String },
}

impl fmt::Display for CleanupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupOutcome::Deleted => write!(f, "volume deleted"),
            CleanupOutcome::DeleteFailed { message } => {
                write!(f, "volume may be leaked (delete failed: {message})")
            }
        }
    }
}

impl Error {
    /// Returns the error message in "String".
    #[inline]
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Error::API { message, .. } | Error::Other { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Returns if the error is retryable.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::API { is_retryable, .. } | Error::Other { is_retryable, .. } => *is_retryable,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_failed_renders_cleanup_outcome() {
        let cleaned = Error::AttachFailed {
            volume_id: String::from("vol-0123456789abcdef0"),
            attach_error: String::from("InvalidParameterValue"),
            cleanup: CleanupOutcome::Deleted,
        };
        let msg = cleaned.to_string();
        assert!(msg.contains("vol-0123456789abcdef0"));
        assert!(msg.contains("InvalidParameterValue"));
        assert!(msg.contains("volume deleted"));

        let leaked = Error::AttachFailed {
            volume_id: String::from("vol-0123456789abcdef0"),
            attach_error: String::from("InvalidParameterValue"),
            cleanup: CleanupOutcome::DeleteFailed {
                message: String::from("RequestLimitExceeded"),
            },
        };
        let msg = leaked.to_string();
        assert!(msg.contains("InvalidParameterValue"));
        assert!(msg.contains("volume may be leaked"));
        assert!(msg.contains("RequestLimitExceeded"));
    }

    #[test]
    fn guard_errors_are_not_retryable() {
        let e = Error::MaxAttachedVolumesReached {
            attached: 17,
            limit: 16,
        };
        assert!(!e.is_retryable());
        assert!(e.message().contains("17 attached"));

        let e = Error::DeviceSlotsExhausted { existing: 26 };
        assert!(!e.is_retryable());
        assert!(e.message().contains("26 devices"));
    }
}
