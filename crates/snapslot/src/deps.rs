//! Collaborator seams.
//!
//! The engine decides *when* things happen; these traits own *what* the
//! surrounding system looks like: which slot is live, which extents of the
//! superpartition back which partition, where overflow backing images live,
//! and how big each partition's copy-on-write store must be. Production
//! implementations wrap the platform services; [`crate::sim`] provides
//! in-memory ones.

use std::time::Duration;

use snapslot_dm::DmTable;
use snapslot_error::Result;

/// Name of the reserved superpartition group holding cow partitions.
/// Partitions in this group are never mapped as top-level devices.
pub const COW_GROUP: &str = "cow";

/// What an update wants to install: one entry per updated partition, named
/// without a slot suffix.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub partitions: Vec<PartitionUpdate>,
}

/// One partition in a [`Manifest`].
#[derive(Debug, Clone)]
pub struct PartitionUpdate {
    /// Unsuffixed partition name, e.g. `system`.
    pub name: String,
    /// Size of the partition in the target slot, in bytes.
    pub new_size: u64,
}

/// Slot and device naming for the running system.
pub trait DeviceNames: Send + Sync {
    /// Suffix of the currently booted slot, e.g. `_a`.
    fn slot_suffix(&self) -> String;

    /// Suffix of the other slot.
    fn other_slot_suffix(&self) -> String;

    /// The superpartition block device backing the given slot.
    fn super_device(&self, slot_suffix: &str) -> String;
}

/// A partition as listed in superpartition metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    pub group: String,
}

/// Reader/writer of superpartition metadata.
///
/// The builder owns the binding to the superpartition device; snapslot only
/// names slots and partitions.
pub trait PartitionBuilder: Send + Sync {
    /// Recompute the target slot's metadata from an update manifest. Called
    /// once per `create_update_snapshots`; the resulting layout stays
    /// in-memory until [`PartitionBuilder::persist_target`].
    fn start_update(&self, manifest: &Manifest, target_suffix: &str) -> Result<()>;

    /// Add a cow partition (group [`COW_GROUP`]) of the given size to the
    /// in-flight target layout, using free superpartition space.
    fn add_cow_partition(&self, target_suffix: &str, name: &str, size: u64) -> Result<()>;

    /// Persist the in-flight target layout to the named slot.
    fn persist_target(&self, target_suffix: &str) -> Result<()>;

    /// The linear extent table of `partition` in `slot_suffix`'s metadata.
    /// An empty table means the partition exists but has no extents.
    fn partition_table(&self, slot_suffix: &str, partition: &str) -> Result<DmTable>;

    /// The partition's UPDATED attribute: `Some(true)` if set, `Some(false)`
    /// if cleared (e.g. an external reflash), `None` if the partition does
    /// not exist in that slot's metadata.
    fn is_updated(&self, slot_suffix: &str, partition: &str) -> Result<Option<bool>>;

    /// All partitions in the given slot's metadata.
    fn list_partitions(&self, slot_suffix: &str) -> Result<Vec<PartitionInfo>>;
}

/// Backing-file images for cow stores that exceed free superpartition space.
pub trait ImageManager: Send + Sync {
    /// Create a backing image of the given byte size. Fails if it exists.
    fn create_image(&self, name: &str, size: u64) -> Result<()>;

    fn image_exists(&self, name: &str) -> Result<bool>;

    fn delete_image(&self, name: &str) -> Result<()>;

    /// Map the image as a block device and return its node path, waiting up
    /// to `timeout` for the node to appear (zero = no wait).
    fn map_image(&self, name: &str, timeout: Duration) -> Result<String>;

    /// Unmap the image's block device; absent or unmapped is success.
    fn unmap_image_if_exists(&self, name: &str) -> Result<()>;

    /// The mapped image's `major:minor` string, consumable as a target
    /// parameter.
    fn device_string(&self, name: &str) -> Result<String>;
}

/// Computed cow sizing for one partition. All fields in bytes,
/// sector-aligned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CowPlan {
    pub device_size: u64,
    /// Leading bytes subject to copy-on-write; zero means the whole
    /// partition fits in free superpartition space and needs no snapshot.
    pub snapshot_size: u64,
    pub cow_partition_size: u64,
    pub cow_file_size: u64,
}

/// The external sizing oracle ("cow creator"): decides how much of each
/// partition must be snapshotted and where the cow store lives.
pub trait CowPlanner: Send + Sync {
    fn plan(&self, update: &PartitionUpdate, target_suffix: &str) -> Result<CowPlan>;
}
