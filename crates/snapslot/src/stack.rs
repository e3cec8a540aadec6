//! Pure planning for per-partition device stacks.
//!
//! A snapshotted partition `P` is exposed through a small DAG of mapper
//! devices with deterministic names:
//!
//! ```text
//! P           the name the rest of the system sees
//! P-inner     the snapshot device, only when a linear tail exists
//! P-base      plain-linear extents of P in the superpartition
//! P-cow       the cow store fed to the snapshot target
//! P-cow-img   the overflow backing image's block device
//! ```
//!
//! The kernel rejects tables mixing snapshot and linear targets, so when
//! only a leading region of `P` is snapshotted the snapshot goes on
//! `P-inner` and `P` becomes a two-segment linear split over `P-inner` and
//! `P-base`.
//!
//! Everything here is deterministic bookkeeping over a [`SnapshotRecord`];
//! the effectful walk lives in the composer.

use snapslot_dm::{DmTable, SnapshotMode, TargetSpec};
use snapslot_error::{Result, SnapError};
use snapslot_types::{SnapshotRecord, UpdateState, SECTOR_SIZE};

#[must_use]
pub fn base_device_name(partition: &str) -> String {
    format!("{partition}-base")
}

#[must_use]
pub fn cow_name(partition: &str) -> String {
    format!("{partition}-cow")
}

#[must_use]
pub fn cow_image_name(partition: &str) -> String {
    format!("{partition}-cow-img")
}

#[must_use]
pub fn inner_name(partition: &str) -> String {
    format!("{partition}-inner")
}

/// The device actually holding the `snapshot`/`snapshot-merge` target. This
/// is `P-inner` when a linear tail exists, else `P` itself.
#[must_use]
pub fn snapshot_device_name(partition: &str, record: &SnapshotRecord) -> String {
    if record.device_size != record.snapshot_size {
        inner_name(partition)
    } else {
        partition.to_owned()
    }
}

/// How the cow store is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowShape {
    /// Overflow image only: `P-cow-img` doubles as `P-cow`.
    ImageOnly,
    /// In-superpartition extents only.
    PartitionOnly,
    /// Superpartition extents with the image concatenated after them.
    PartitionAndImage,
}

impl CowShape {
    /// The shape for a record, or `None` when nothing is snapshotted.
    #[must_use]
    pub const fn of(record: &SnapshotRecord) -> Option<Self> {
        match (record.cow_partition_size > 0, record.cow_file_size > 0) {
            (false, false) => None,
            (false, true) => Some(Self::ImageOnly),
            (true, false) => Some(Self::PartitionOnly),
            (true, true) => Some(Self::PartitionAndImage),
        }
    }
}

/// Pick the snapshot-target mode for mapping under the given global state.
///
/// A merge in flight (even a stalled one) must be honored; once the merge
/// has globally completed, mapping a snapshot again would resurrect stale
/// deltas, so it is refused.
pub fn select_mode(global: UpdateState) -> Result<SnapshotMode> {
    match global {
        UpdateState::MergeCompleted | UpdateState::MergeNeedsReboot => Err(SnapError::WrongState {
            op: "map a snapshot",
            state: global.to_string(),
        }),
        UpdateState::Merging | UpdateState::MergeFailed => Ok(SnapshotMode::Merge),
        _ => Ok(SnapshotMode::Persistent),
    }
}

/// Single snapshot target covering the snapshotted sectors.
#[must_use]
pub fn snapshot_table(
    base_device: &str,
    cow_device: &str,
    mode: SnapshotMode,
    snapshot_sectors: u64,
) -> DmTable {
    let mut table = DmTable::new();
    table.push(
        0,
        snapshot_sectors,
        TargetSpec::Snapshot {
            base: base_device.to_owned(),
            cow: cow_device.to_owned(),
            mode,
        },
    );
    table
}

/// The outer two-segment split: snapshotted head through `P-inner`, linear
/// tail straight to `P-base`.
#[must_use]
pub fn outer_split_table(
    inner_device: &str,
    base_device: &str,
    snapshot_sectors: u64,
    tail_sectors: u64,
) -> DmTable {
    let mut table = DmTable::new();
    table.push(
        0,
        snapshot_sectors,
        TargetSpec::Linear {
            device: inner_device.to_owned(),
            start_sector: 0,
        },
    );
    table.push(
        snapshot_sectors,
        tail_sectors,
        TargetSpec::Linear {
            device: base_device.to_owned(),
            start_sector: snapshot_sectors,
        },
    );
    table
}

/// Append the overflow image as the last extent of a cow-partition table.
pub fn append_cow_image(table: &mut DmTable, image_device: &str, record: &SnapshotRecord) {
    let cow_partition_sectors = record.cow_partition_size / SECTOR_SIZE;
    let image_sectors = record.cow_file_size / SECTOR_SIZE;
    table.push(
        cow_partition_sectors,
        image_sectors,
        TargetSpec::Linear {
            device: image_device.to_owned(),
            start_sector: 0,
        },
    );
}
