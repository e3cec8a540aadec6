//! First-stage bootstrap.
//!
//! Early boot cannot mount the updated partitions as plain linear devices
//! while an unmerged update is pending: the base devices still hold old-slot
//! content past the snapshotted region. When the boot indicator says an
//! update was finalized from the *other* slot, the loader composes snapshot
//! stacks instead of plain partitions. If the indicator names the *live*
//! slot, the device rolled back, snapshots must not be mounted, and the next
//! normal boot cleans them up.

use std::path::Path;
use std::time::Duration;

use snapslot_error::Result;
use snapslot_types::UpdateState;
use tracing::info;

use crate::deps::COW_GROUP;
use crate::manager::SnapshotManager;

/// Cheap early-boot probe: does the boot indicator exist? Usable by a
/// loader that has not opened the state lock (or mounted anything beyond
/// the metadata filesystem).
#[must_use]
pub fn needs_snapshot_manager(metadata_dir: &Path) -> bool {
    metadata_dir.join("snapshot-boot").exists()
}

impl SnapshotManager {
    /// Whether first-stage mount must compose snapshot stacks instead of
    /// plain partitions.
    ///
    /// True iff the indicator exists, names a slot different from the live
    /// one, and the update is in a state that still needs its snapshots.
    /// An unreadable indicator reads as `false`: the indicator still being
    /// present must not brick the rollback path.
    pub fn needs_snapshots_at_boot(&self) -> Result<bool> {
        let Some(old_slot) = self.store.read_boot_indicator() else {
            return Ok(false);
        };
        if self.names.slot_suffix() == old_slot {
            info!("detected slot rollback, will not mount snapshots");
            return Ok(false);
        }

        let session = self.lock_shared()?;
        Ok(matches!(
            self.store.read_global(&session),
            UpdateState::Unverified | UpdateState::Merging | UpdateState::MergeFailed
        ))
    }

    /// First-stage replacement for "create logical partitions": map every
    /// partition of the live slot, composing snapshot stacks where records
    /// demand them. Partitions in the reserved cow group are skipped; they
    /// only ever appear underneath a stack.
    pub fn create_logical_and_snapshot_partitions(&self, super_device: &str) -> Result<()> {
        info!(super_device, "creating logical partitions with snapshots as needed");

        let session = self.lock_exclusive()?;
        let slot = self.names.slot_suffix();
        for partition in self.builder.list_partitions(&slot)? {
            if partition.group == COW_GROUP {
                info!(partition = partition.name, "skip mapping cow group partition");
                continue;
            }
            // First-stage has no event daemon to wait on; callers resolve
            // device strings by number.
            self.map_partition_with_snapshot(&session, &partition.name, Duration::ZERO)?;
        }

        info!("created logical partitions with snapshots");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_a_bare_existence_check() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(!needs_snapshot_manager(dir.path()));
        std::fs::write(dir.path().join("snapshot-boot"), "_a").unwrap();
        assert!(needs_snapshot_manager(dir.path()));
    }
}
