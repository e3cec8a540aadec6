use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Primary error type for snapslot operations.
///
/// Structured variants for the cases callers dispatch on; kernel failures
/// keep their `errno` so retry policies can distinguish `EBUSY` from real
/// damage.
#[derive(Error, Debug)]
pub enum SnapError {
    // === State store ===
    /// Could not open a metadata file.
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Could not acquire the advisory lock on the state file.
    #[error("flock failed on {path}: {source}")]
    Lock { path: PathBuf, source: Errno },

    /// A mutating operation was attempted while only a shared lock is held.
    #[error("{op} requires an exclusive lock on the state file")]
    NeedsExclusiveLock { op: &'static str },

    /// A snapshot record file did not parse.
    #[error("snapshot record for {name} is corrupt: {detail}")]
    RecordCorrupt { name: String, detail: String },

    /// No record exists for the named snapshot.
    #[error("no snapshot record for {name}")]
    NoSuchSnapshot { name: String },

    // === State machine preconditions ===
    /// The global update state does not permit this operation.
    #[error("cannot {op} while update state is {state}")]
    WrongState { op: &'static str, state: String },

    /// Cancellation was requested but the update has already begun merging.
    #[error("cannot cancel update after it has completed or started merging")]
    MergeNeeded,

    /// The boot indicator is required but missing or unreadable.
    #[error("cannot determine the pre-update slot: boot indicator is missing")]
    NoBootIndicator,

    /// A merge was requested while still booted from the pre-update slot.
    #[error("cannot merge while booted from the pre-update slot {slot}")]
    MergeFromOldSlot { slot: String },

    /// A persisted size field is not a multiple of the sector size.
    #[error("{what} {value} is not a multiple of the sector size")]
    Misaligned { what: &'static str, value: u64 },

    /// The same partition appeared twice in an update manifest.
    #[error("duplicate partition {name} in update manifest")]
    DuplicatePartition { name: String },

    // === Mapper ===
    /// A device-mapper ioctl failed; carries the kernel error code.
    #[error("device-mapper {op} failed for {name}: {source}")]
    Mapper {
        op: &'static str,
        name: String,
        source: Errno,
    },

    /// A device that must be mapped is not.
    #[error("device {name} is not mapped")]
    NotMapped { name: String },

    /// A device's live table has the wrong shape for the operation.
    #[error("device {name} has an unexpected table: {detail}")]
    UnexpectedTable { name: String, detail: String },

    /// A snapshot status line did not match `"A/B C"`.
    #[error("malformed snapshot status line {line:?}: {detail}")]
    StatusLine { line: String, detail: String },

    /// A table could not be serialized or validated.
    #[error("invalid device-mapper table: {0}")]
    InvalidTable(String),

    /// Waiting for an externally observable artifact exceeded the budget.
    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    // === External collaborators ===
    /// A backing-image operation failed.
    #[error("backing image {name}: {detail}")]
    Image { name: String, detail: String },

    /// A superpartition metadata operation failed.
    #[error("partition metadata: {0}")]
    Metadata(String),

    // === Catch-alls ===
    /// File I/O error with no more specific classification.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl SnapError {
    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a metadata error.
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// The kernel error code, for variants that carry one.
    #[must_use]
    pub const fn errno(&self) -> Option<Errno> {
        match self {
            Self::Lock { source, .. } | Self::Mapper { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// Whether a retry of the enclosing operation may succeed without any
    /// intervention (lock contention, device busy, path not yet published).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Lock { source, .. } | Self::Mapper { source, .. } => {
                matches!(source, Errno::EAGAIN | Errno::EBUSY | Errno::EINTR)
            }
            _ => false,
        }
    }
}

/// Result type alias using [`SnapError`].
pub type Result<T> = std::result::Result<T, SnapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_wrong_state() {
        let err = SnapError::WrongState {
            op: "begin update",
            state: "merging".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "cannot begin update while update state is merging"
        );
    }

    #[test]
    fn display_mapper_carries_errno() {
        let err = SnapError::Mapper {
            op: "table load",
            name: "system_b".to_owned(),
            source: Errno::EINVAL,
        };
        assert!(err.to_string().contains("system_b"));
        assert_eq!(err.errno(), Some(Errno::EINVAL));
    }

    #[test]
    fn transient_classification() {
        let busy = SnapError::Mapper {
            op: "remove",
            name: "x".to_owned(),
            source: Errno::EBUSY,
        };
        assert!(busy.is_transient());

        let inval = SnapError::Mapper {
            op: "remove",
            name: "x".to_owned(),
            source: Errno::EINVAL,
        };
        assert!(!inval.is_transient());

        assert!(SnapError::Timeout {
            what: "device path".to_owned()
        }
        .is_transient());
        assert!(!SnapError::MergeNeeded.is_transient());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SnapError = io_err.into();
        assert!(matches!(err, SnapError::Io(_)));
        assert_eq!(err.errno(), None);
    }
}
