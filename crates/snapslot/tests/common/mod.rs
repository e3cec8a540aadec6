//! Shared harness: one simulated A/B device plus a manager over a scratch
//! metadata directory.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use snapslot::sim::SimDevice;
use snapslot::{CowPlan, Manifest, PartitionUpdate, SnapshotManager};
use tempfile::TempDir;

pub const GIB: u64 = 1 << 30;
pub const MIB: u64 = 1 << 20;

pub struct Harness {
    pub scratch: TempDir,
    pub sim: SimDevice,
    pub manager: SnapshotManager,
}

impl Harness {
    pub fn new() -> Self {
        let scratch = TempDir::new().expect("scratch dir");
        let sim = SimDevice::new(scratch.path());
        let manager = Self::build_manager(&scratch, &sim);
        Self {
            scratch,
            sim,
            manager,
        }
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.scratch.path().join("metadata/ota")
    }

    /// A fresh manager over the same device and metadata, as a new process
    /// (or a post-crash restart) would construct.
    pub fn restart(&mut self) {
        self.manager = Self::build_manager(&self.scratch, &self.sim);
    }

    fn build_manager(scratch: &TempDir, sim: &SimDevice) -> SnapshotManager {
        let mut manager = SnapshotManager::new(
            scratch.path().join("metadata/ota"),
            sim.collaborators(),
        );
        manager.set_poll_interval(Duration::from_millis(10));
        manager
    }

    /// Number of record files under `<metadata>/snapshots`.
    pub fn record_count(&self) -> usize {
        std::fs::read_dir(self.metadata_dir().join("snapshots"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    pub fn boot_indicator_exists(&self) -> bool {
        self.metadata_dir().join("snapshot-boot").exists()
    }
}

pub fn manifest(entries: &[(&str, u64)]) -> Manifest {
    Manifest {
        partitions: entries
            .iter()
            .map(|(name, new_size)| PartitionUpdate {
                name: (*name).to_owned(),
                new_size: *new_size,
            })
            .collect(),
    }
}

/// The canonical single-partition update: 1 GiB `system`, leading 256 MiB
/// snapshotted into a 64 MiB in-superpartition cow store.
pub fn plan_system(harness: &Harness) -> Manifest {
    harness.sim.planner.set_plan(
        "system",
        CowPlan {
            device_size: GIB,
            snapshot_size: 256 * MIB,
            cow_partition_size: 64 * MIB,
            cow_file_size: 0,
        },
    );
    manifest(&[("system", GIB)])
}
