//! A/B update snapshotting engine.
//!
//! snapslot lets a device apply an over-the-air update to block-level
//! partitions while keeping the old slot bootable, then merges the written
//! deltas back into the underlying storage once the new slot has proven
//! itself. Per-partition writes land in copy-on-write overlays stacked out
//! of kernel mapper devices; a small set of `O_SYNC` files under a metadata
//! directory records where every partition is in the
//! `begin → create → finish → (reboot) → merge → cleanup` lifecycle, and an
//! advisory lock on the state file serializes the processes that share it.
//!
//! [`SnapshotManager`] is the entry point. It consumes four collaborator
//! seams ([`deps`]) plus a [`snapslot_dm::Mapper`]; the [`sim`] module
//! provides in-memory implementations of all of them so the complete
//! lifecycle runs in tests without a kernel.

pub mod boot;
pub mod cleanup;
mod compose;
pub mod deps;
pub mod manager;
mod merge;
pub mod sim;
pub mod stack;

pub use deps::{
    CowPlan, CowPlanner, DeviceNames, ImageManager, Manifest, PartitionBuilder, PartitionInfo,
    PartitionUpdate, COW_GROUP,
};
pub use manager::{Collaborators, SnapshotManager, UpdateStatus};
pub use snapslot_error::{Result, SnapError};
pub use snapslot_types::{CancelToken, SnapshotRecord, SnapshotState, UpdateState};
