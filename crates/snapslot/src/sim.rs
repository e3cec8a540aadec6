//! In-memory collaborators.
//!
//! A [`SimDevice`] bundles fake implementations of every seam in
//! [`crate::deps`] plus a [`MemMapper`], modeling one A/B device: two slots
//! of superpartition metadata, a pool of backing images, and a slot switch
//! for simulated reboots. The integration suite drives the entire update
//! lifecycle against it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use snapslot_dm::{DmTable, MemMapper};
use snapslot_error::{Result, SnapError};
use snapslot_types::SECTOR_SIZE;

use crate::deps::{
    CowPlan, CowPlanner, DeviceNames, ImageManager, Manifest, PartitionBuilder, PartitionInfo,
    PartitionUpdate, COW_GROUP,
};
use crate::manager::Collaborators;

/// Device string of the simulated superpartition.
pub const SIM_SUPER_DEVICE: &str = "259:0";

/// Default group for simulated non-cow partitions.
pub const SIM_DEFAULT_GROUP: &str = "default";

// ---------------------------------------------------------------------------
// Slot naming
// ---------------------------------------------------------------------------

/// Two-slot naming with a switchable live slot.
#[derive(Debug)]
pub struct SimDeviceNames {
    slot: Mutex<String>,
}

impl SimDeviceNames {
    #[must_use]
    pub fn new(initial: &str) -> Self {
        Self {
            slot: Mutex::new(initial.to_owned()),
        }
    }

    /// Simulate booting into the given slot.
    pub fn set_slot(&self, suffix: &str) {
        *self.slot.lock() = suffix.to_owned();
    }
}

impl DeviceNames for SimDeviceNames {
    fn slot_suffix(&self) -> String {
        self.slot.lock().clone()
    }

    fn other_slot_suffix(&self) -> String {
        if *self.slot.lock() == "_a" {
            "_b".to_owned()
        } else {
            "_a".to_owned()
        }
    }

    fn super_device(&self, _slot_suffix: &str) -> String {
        "super".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Partition metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SimPartition {
    table: DmTable,
    group: String,
    updated: bool,
}

#[derive(Debug, Default)]
struct BuilderInner {
    /// Keyed by (slot suffix, partition name).
    partitions: HashMap<(String, String), SimPartition>,
    /// Next free extent offset in the simulated superpartition.
    next_extent: u64,
    persisted: Vec<String>,
}

impl BuilderInner {
    fn allocate(&mut self, sectors: u64) -> DmTable {
        let table = DmTable::linear(SIM_SUPER_DEVICE, self.next_extent, sectors);
        self.next_extent += sectors;
        table
    }
}

/// Two slots of superpartition metadata with extent allocation.
#[derive(Debug, Default)]
pub struct SimBuilder {
    inner: Mutex<BuilderInner>,
}

impl SimBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a partition into a slot's metadata.
    pub fn add_partition(&self, slot: &str, name: &str, group: &str, size: u64, updated: bool) {
        let mut inner = self.inner.lock();
        let table = inner.allocate(size / SECTOR_SIZE);
        inner.partitions.insert(
            (slot.to_owned(), name.to_owned()),
            SimPartition {
                table,
                group: group.to_owned(),
                updated,
            },
        );
    }

    /// Clear a partition's UPDATED attribute, as an external reflash does.
    pub fn clear_updated(&self, slot: &str, name: &str) {
        if let Some(partition) = self
            .inner
            .lock()
            .partitions
            .get_mut(&(slot.to_owned(), name.to_owned()))
        {
            partition.updated = false;
        }
    }

    /// Slots whose metadata has been persisted, in order.
    #[must_use]
    pub fn persisted_slots(&self) -> Vec<String> {
        self.inner.lock().persisted.clone()
    }
}

impl PartitionBuilder for SimBuilder {
    fn start_update(&self, manifest: &Manifest, target_suffix: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        for update in &manifest.partitions {
            let name = format!("{}{target_suffix}", update.name);
            let table = inner.allocate(update.new_size / SECTOR_SIZE);
            inner.partitions.insert(
                (target_suffix.to_owned(), name),
                SimPartition {
                    table,
                    group: SIM_DEFAULT_GROUP.to_owned(),
                    updated: true,
                },
            );
        }
        Ok(())
    }

    fn add_cow_partition(&self, target_suffix: &str, name: &str, size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let table = inner.allocate(size / SECTOR_SIZE);
        inner.partitions.insert(
            (target_suffix.to_owned(), name.to_owned()),
            SimPartition {
                table,
                group: COW_GROUP.to_owned(),
                updated: false,
            },
        );
        Ok(())
    }

    fn persist_target(&self, target_suffix: &str) -> Result<()> {
        self.inner.lock().persisted.push(target_suffix.to_owned());
        Ok(())
    }

    fn partition_table(&self, slot_suffix: &str, partition: &str) -> Result<DmTable> {
        self.inner
            .lock()
            .partitions
            .get(&(slot_suffix.to_owned(), partition.to_owned()))
            .map(|p| p.table.clone())
            .ok_or_else(|| {
                SnapError::metadata(format!("no partition {partition} in slot {slot_suffix}"))
            })
    }

    fn is_updated(&self, slot_suffix: &str, partition: &str) -> Result<Option<bool>> {
        Ok(self
            .inner
            .lock()
            .partitions
            .get(&(slot_suffix.to_owned(), partition.to_owned()))
            .map(|p| p.updated))
    }

    fn list_partitions(&self, slot_suffix: &str) -> Result<Vec<PartitionInfo>> {
        let inner = self.inner.lock();
        let mut partitions: Vec<PartitionInfo> = inner
            .partitions
            .iter()
            .filter(|((slot, _), _)| slot == slot_suffix)
            .map(|((_, name), p)| PartitionInfo {
                name: name.clone(),
                group: p.group.clone(),
            })
            .collect();
        partitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(partitions)
    }
}

// ---------------------------------------------------------------------------
// Backing images
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ImageState {
    size: u64,
    mapped: bool,
    index: u32,
}

#[derive(Debug, Default)]
struct ImagesInner {
    images: HashMap<String, ImageState>,
    next_index: u32,
}

/// File-backed image pool.
#[derive(Debug)]
pub struct SimImages {
    root: PathBuf,
    inner: Mutex<ImagesInner>,
}

impl SimImages {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: Mutex::new(ImagesInner::default()),
        }
    }

    fn image_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.img"))
    }

    /// Recorded size of an image, for assertions.
    #[must_use]
    pub fn image_size(&self, name: &str) -> Option<u64> {
        self.inner.lock().images.get(name).map(|i| i.size)
    }
}

impl ImageManager for SimImages {
    fn create_image(&self, name: &str, size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.images.contains_key(name) {
            return Err(SnapError::Image {
                name: name.to_owned(),
                detail: "already exists".to_owned(),
            });
        }
        std::fs::create_dir_all(&self.root)?;
        let file = std::fs::File::create(self.image_path(name))?;
        file.set_len(size)?;
        let index = inner.next_index;
        inner.next_index += 1;
        inner.images.insert(
            name.to_owned(),
            ImageState {
                size,
                mapped: false,
                index,
            },
        );
        Ok(())
    }

    fn image_exists(&self, name: &str) -> Result<bool> {
        Ok(self.inner.lock().images.contains_key(name))
    }

    fn delete_image(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.images.remove(name).is_none() {
            return Err(SnapError::Image {
                name: name.to_owned(),
                detail: "does not exist".to_owned(),
            });
        }
        let _ = std::fs::remove_file(self.image_path(name));
        Ok(())
    }

    fn map_image(&self, name: &str, _timeout: Duration) -> Result<String> {
        let mut inner = self.inner.lock();
        let image = inner.images.get_mut(name).ok_or_else(|| SnapError::Image {
            name: name.to_owned(),
            detail: "does not exist".to_owned(),
        })?;
        image.mapped = true;
        Ok(self.image_path(name).to_string_lossy().into_owned())
    }

    fn unmap_image_if_exists(&self, name: &str) -> Result<()> {
        if let Some(image) = self.inner.lock().images.get_mut(name) {
            image.mapped = false;
        }
        Ok(())
    }

    fn device_string(&self, name: &str) -> Result<String> {
        let inner = self.inner.lock();
        let image = inner.images.get(name).ok_or_else(|| SnapError::Image {
            name: name.to_owned(),
            detail: "does not exist".to_owned(),
        })?;
        Ok(format!("7:{}", image.index))
    }
}

// ---------------------------------------------------------------------------
// Cow sizing
// ---------------------------------------------------------------------------

/// Table-driven cow planner with a proportional default.
#[derive(Debug, Default)]
pub struct SimPlanner {
    plans: Mutex<HashMap<String, CowPlan>>,
}

impl SimPlanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the plan for an (unsuffixed) partition name.
    pub fn set_plan(&self, name: &str, plan: CowPlan) {
        self.plans.lock().insert(name.to_owned(), plan);
    }
}

impl CowPlanner for SimPlanner {
    fn plan(&self, update: &PartitionUpdate, _target_suffix: &str) -> Result<CowPlan> {
        if let Some(plan) = self.plans.lock().get(&update.name) {
            return Ok(*plan);
        }
        // Default: snapshot the whole partition, reserving an eighth of it
        // as in-superpartition cow space.
        let cow = (update.new_size / 8).next_multiple_of(SECTOR_SIZE);
        Ok(CowPlan {
            device_size: update.new_size,
            snapshot_size: update.new_size,
            cow_partition_size: cow,
            cow_file_size: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// The bundle
// ---------------------------------------------------------------------------

/// One simulated A/B device.
pub struct SimDevice {
    pub mapper: MemMapper,
    pub names: Arc<SimDeviceNames>,
    pub builder: Arc<SimBuilder>,
    pub images: Arc<SimImages>,
    pub planner: Arc<SimPlanner>,
}

impl SimDevice {
    /// Create a device booted into slot `_a`, with mapper-device and image
    /// files living under `scratch`.
    #[must_use]
    pub fn new(scratch: &Path) -> Self {
        Self {
            mapper: MemMapper::with_dev_root(scratch.join("dev")),
            names: Arc::new(SimDeviceNames::new("_a")),
            builder: Arc::new(SimBuilder::new()),
            images: Arc::new(SimImages::new(scratch.join("images"))),
            planner: Arc::new(SimPlanner::new()),
        }
    }

    /// The collaborator bundle for a [`crate::SnapshotManager`].
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            mapper: Arc::new(self.mapper.clone()),
            names: self.names.clone(),
            builder: self.builder.clone(),
            images: self.images.clone(),
            planner: self.planner.clone(),
        }
    }

    /// Simulate a reboot into the given slot.
    pub fn reboot_into(&self, slot_suffix: &str) {
        self.names.set_slot(slot_suffix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_switching() {
        let names = SimDeviceNames::new("_a");
        assert_eq!(names.slot_suffix(), "_a");
        assert_eq!(names.other_slot_suffix(), "_b");
        names.set_slot("_b");
        assert_eq!(names.slot_suffix(), "_b");
        assert_eq!(names.other_slot_suffix(), "_a");
    }

    #[test]
    fn builder_allocates_disjoint_extents() {
        let builder = SimBuilder::new();
        builder.add_partition("_a", "system_a", SIM_DEFAULT_GROUP, 1 << 20, false);
        builder.add_partition("_a", "vendor_a", SIM_DEFAULT_GROUP, 1 << 20, false);

        let system = builder.partition_table("_a", "system_a").unwrap();
        let vendor = builder.partition_table("_a", "vendor_a").unwrap();
        let system_start = match &system.targets()[0].spec {
            snapslot_dm::TargetSpec::Linear { start_sector, .. } => *start_sector,
            other => panic!("unexpected spec {other:?}"),
        };
        let vendor_start = match &vendor.targets()[0].spec {
            snapslot_dm::TargetSpec::Linear { start_sector, .. } => *start_sector,
            other => panic!("unexpected spec {other:?}"),
        };
        assert_eq!(vendor_start, system_start + system.num_sectors());
    }

    #[test]
    fn start_update_populates_target_slot() {
        let builder = SimBuilder::new();
        let manifest = Manifest {
            partitions: vec![PartitionUpdate {
                name: "system".to_owned(),
                new_size: 1 << 20,
            }],
        };
        builder.start_update(&manifest, "_b").unwrap();

        assert_eq!(builder.is_updated("_b", "system_b").unwrap(), Some(true));
        assert_eq!(builder.is_updated("_b", "ghost_b").unwrap(), None);
        let table = builder.partition_table("_b", "system_b").unwrap();
        assert_eq!(table.num_sectors(), (1 << 20) / SECTOR_SIZE);
    }

    #[test]
    fn cow_partitions_join_the_reserved_group() {
        let builder = SimBuilder::new();
        builder.add_cow_partition("_b", "system_b-cow", 1 << 16).unwrap();
        let listed = builder.list_partitions("_b").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].group, COW_GROUP);
    }

    #[test]
    fn image_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let images = SimImages::new(dir.path());

        images.create_image("img", 1 << 16).unwrap();
        assert!(images.image_exists("img").unwrap());
        assert!(images.create_image("img", 1 << 16).is_err());

        let path = images.map_image("img", Duration::ZERO).unwrap();
        assert!(Path::new(&path).exists());
        assert_eq!(images.device_string("img").unwrap(), "7:0");

        images.unmap_image_if_exists("img").unwrap();
        images.unmap_image_if_exists("ghost").unwrap();
        images.delete_image("img").unwrap();
        assert!(!images.image_exists("img").unwrap());
        assert!(images.delete_image("img").is_err());
    }

    #[test]
    fn planner_default_is_sector_aligned() {
        let planner = SimPlanner::new();
        let plan = planner
            .plan(
                &PartitionUpdate {
                    name: "system".to_owned(),
                    new_size: 1 << 30,
                },
                "_b",
            )
            .unwrap();
        assert_eq!(plan.device_size, 1 << 30);
        assert_eq!(plan.snapshot_size, 1 << 30);
        assert_eq!(plan.cow_partition_size % SECTOR_SIZE, 0);
        assert!(plan.cow_partition_size > 0);
    }

    #[test]
    fn planner_honors_fixed_plans() {
        let planner = SimPlanner::new();
        let fixed = CowPlan {
            device_size: 4096,
            snapshot_size: 0,
            cow_partition_size: 0,
            cow_file_size: 0,
        };
        planner.set_plan("odm", fixed);
        let plan = planner
            .plan(
                &PartitionUpdate {
                    name: "odm".to_owned(),
                    new_size: 4096,
                },
                "_b",
            )
            .unwrap();
        assert_eq!(plan, fixed);
    }
}
