//! Global and per-snapshot state tokens.
//!
//! Both enums persist as short ASCII tokens. The global update state lives in
//! `<metadata>/state`; the per-snapshot state is the first field of each
//! record under `<metadata>/snapshots/`. `UpdateState::Cancelled` is
//! transient: it is returned from merge polls but never written to disk.

use std::fmt;

/// Global state of the in-flight update, persisted at `<metadata>/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateState {
    /// No update or merge is in progress.
    None,
    /// An update is applying; snapshots may already exist.
    Initiated,
    /// An update is staged but has not been successfully booted yet.
    Unverified,
    /// The kernel is draining snapshots in the background.
    Merging,
    /// Merging finished but cleanup hit a transient error; the next reboot
    /// (or another poll) finishes the pending work.
    MergeNeedsReboot,
    /// Merging is complete and needs to be acknowledged.
    MergeCompleted,
    /// Merging failed; another poll may retry.
    MergeFailed,
    /// The update was implicitly cancelled by a rollback or an external
    /// reflash. Only ever returned from polls, never persisted.
    Cancelled,
}

impl UpdateState {
    /// The canonical on-disk token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Initiated => "initiated",
            Self::Unverified => "unverified",
            Self::Merging => "merging",
            Self::MergeNeedsReboot => "merge-needs-reboot",
            Self::MergeCompleted => "merge-completed",
            Self::MergeFailed => "merge-failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a persisted token. `Cancelled` is not a persisted token and is
    /// rejected here; unknown content is the caller's concern.
    #[must_use]
    pub fn parse_token(token: &str) -> Option<Self> {
        match token {
            "none" => Some(Self::None),
            "initiated" => Some(Self::Initiated),
            "unverified" => Some(Self::Unverified),
            "merging" => Some(Self::Merging),
            "merge-needs-reboot" => Some(Self::MergeNeedsReboot),
            "merge-completed" => Some(Self::MergeCompleted),
            "merge-failed" => Some(Self::MergeFailed),
            _ => None,
        }
    }

    /// Whether this state may legally be written to the state file.
    #[must_use]
    pub const fn is_persistable(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-snapshot lifecycle state, the first field of a snapshot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SnapshotState {
    #[default]
    None,
    /// The record and backing cow store exist; the device may be mapped.
    Created,
    /// The device table has been switched to a merge target.
    Merging,
    /// The drain finished; auxiliary devices may still need cleanup.
    MergeCompleted,
}

impl SnapshotState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Created => "created",
            Self::Merging => "merging",
            Self::MergeCompleted => "merge-completed",
        }
    }

    #[must_use]
    pub fn parse_token(token: &str) -> Option<Self> {
        match token {
            "none" => Some(Self::None),
            "created" => Some(Self::Created),
            "merging" => Some(Self::Merging),
            "merge-completed" => Some(Self::MergeCompleted),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
