//! In-memory mapper backend.
//!
//! Models the kernel's device table faithfully enough for the snapshot
//! lifecycle: named devices with active/inactive tables, suspend gating,
//! synthesized snapshot status counters, and injectable table-load faults.
//! With a device root configured, each created device is backed by a real
//! file so callers can open and write the "block device" in tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use parking_lot::Mutex;
use snapslot_error::{Result, SnapError};
use tracing::debug;

use crate::target::{DeviceState, DmTable, SnapshotStatus, TargetLine, TargetSpec};
use crate::traits::Mapper;

#[derive(Debug)]
struct MemDevice {
    minor: u32,
    uuid: String,
    active: Option<DmTable>,
    inactive: Option<DmTable>,
    suspended: bool,
    /// Synthesized counters for snapshot targets, keyed by target index.
    counters: HashMap<usize, SnapshotStatus>,
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<String, MemDevice>,
    /// Device names whose next table load fails with `EINVAL`.
    fail_next_load: HashSet<String>,
    dev_root: Option<PathBuf>,
}

impl Inner {
    /// Lowest unused minor, like the kernel's allocator. Remapping a torn
    /// down stack in the same order reproduces the same device numbers.
    fn next_free_minor(&self) -> u32 {
        let mut minor = 0;
        while self.devices.values().any(|d| d.minor == minor) {
            minor += 1;
        }
        minor
    }
}

/// Cheaply clonable in-memory mapper; clones share the device table.
#[derive(Debug, Clone, Default)]
pub struct MemMapper {
    inner: Arc<Mutex<Inner>>,
}

impl MemMapper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Back each device with an empty regular file under `root`, so device
    /// paths returned by [`Mapper::path`] can actually be opened.
    #[must_use]
    pub fn with_dev_root(root: impl Into<PathBuf>) -> Self {
        let mapper = Self::new();
        mapper.inner.lock().dev_root = Some(root.into());
        mapper
    }

    /// Arrange for the next `load_table` on `name` to fail with `EINVAL`.
    pub fn fail_next_load(&self, name: &str) {
        self.inner.lock().fail_next_load.insert(name.to_owned());
    }

    /// Overwrite the synthesized status counters of the first snapshot
    /// target of `name`.
    pub fn set_snapshot_counters(&self, name: &str, sectors_allocated: u64, metadata_sectors: u64) {
        let mut inner = self.inner.lock();
        let Some(device) = inner.devices.get_mut(name) else {
            return;
        };
        if let Some((index, status)) = first_snapshot_counter(device) {
            device.counters.insert(
                index,
                SnapshotStatus {
                    sectors_allocated,
                    metadata_sectors,
                    ..status
                },
            );
        }
    }

    /// Drive the first snapshot target of `name` to a fully drained state.
    pub fn complete_merge(&self, name: &str) {
        let mut inner = self.inner.lock();
        let Some(device) = inner.devices.get_mut(name) else {
            return;
        };
        if let Some((index, status)) = first_snapshot_counter(device) {
            device.counters.insert(
                index,
                SnapshotStatus {
                    sectors_allocated: status.metadata_sectors,
                    ..status
                },
            );
        }
    }

    /// The active table of `name`, if the device exists and has one.
    #[must_use]
    pub fn active_table(&self, name: &str) -> Option<DmTable> {
        self.inner.lock().devices.get(name)?.active.clone()
    }

    /// Names of all currently mapped devices, sorted.
    #[must_use]
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().devices.keys().cloned().collect();
        names.sort();
        names
    }

    fn backing_path(root: &std::path::Path, name: &str) -> PathBuf {
        root.join(name)
    }
}

/// Index and counters of the first snapshot-family target, seeding fresh
/// counters for a table that has never been queried.
fn first_snapshot_counter(device: &mut MemDevice) -> Option<(usize, SnapshotStatus)> {
    let table = device.active.as_ref()?;
    let (index, target) = table
        .targets()
        .iter()
        .enumerate()
        .find(|(_, t)| matches!(t.spec, TargetSpec::Snapshot { .. }))?;
    let status = device
        .counters
        .get(&index)
        .copied()
        .unwrap_or_else(|| fresh_counters(target.length_sectors));
    Some((index, status))
}

/// A freshly mapped snapshot reports a little allocated space and fewer
/// metadata sectors, i.e. a drain that has not finished.
const fn fresh_counters(length_sectors: u64) -> SnapshotStatus {
    SnapshotStatus {
        sectors_allocated: 16,
        total_sectors: length_sectors,
        metadata_sectors: 8,
    }
}

impl Mapper for MemMapper {
    fn create(&self, name: &str, uuid: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.devices.contains_key(name) {
            return Err(SnapError::Mapper {
                op: "create",
                name: name.to_owned(),
                source: Errno::EEXIST,
            });
        }
        if let Some(root) = inner.dev_root.clone() {
            std::fs::create_dir_all(&root)?;
            std::fs::File::create(Self::backing_path(&root, name))?;
        }
        let minor = inner.next_free_minor();
        inner.devices.insert(
            name.to_owned(),
            MemDevice {
                minor,
                uuid: uuid.unwrap_or("").to_owned(),
                active: None,
                inactive: None,
                suspended: false,
                counters: HashMap::new(),
            },
        );
        debug!(name, minor, "created in-memory device");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.devices.remove(name).is_none() {
            return Err(SnapError::Mapper {
                op: "remove",
                name: name.to_owned(),
                source: Errno::ENXIO,
            });
        }
        if let Some(root) = inner.dev_root.clone() {
            let _ = std::fs::remove_file(Self::backing_path(&root, name));
        }
        debug!(name, "removed in-memory device");
        Ok(())
    }

    fn load_table(&self, name: &str, table: &DmTable) -> Result<()> {
        table.validate()?;
        let mut inner = self.inner.lock();
        if inner.fail_next_load.remove(name) {
            return Err(SnapError::Mapper {
                op: "table load",
                name: name.to_owned(),
                source: Errno::EINVAL,
            });
        }
        let device = inner.devices.get_mut(name).ok_or_else(|| SnapError::Mapper {
            op: "table load",
            name: name.to_owned(),
            source: Errno::ENXIO,
        })?;
        device.inactive = Some(table.clone());
        Ok(())
    }

    fn suspend(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let device = inner.devices.get_mut(name).ok_or_else(|| SnapError::Mapper {
            op: "suspend",
            name: name.to_owned(),
            source: Errno::ENXIO,
        })?;
        device.suspended = true;
        Ok(())
    }

    fn resume(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let device = inner.devices.get_mut(name).ok_or_else(|| SnapError::Mapper {
            op: "resume",
            name: name.to_owned(),
            source: Errno::ENXIO,
        })?;
        if let Some(table) = device.inactive.take() {
            device.active = Some(table);
            // A fresh table gets fresh counters.
            device.counters.clear();
        }
        device.suspended = false;
        Ok(())
    }

    fn state(&self, name: &str) -> DeviceState {
        let inner = self.inner.lock();
        match inner.devices.get(name) {
            None => DeviceState::Invalid,
            Some(device) => {
                if device.active.is_some() && !device.suspended {
                    DeviceState::Active
                } else {
                    DeviceState::Suspended
                }
            }
        }
    }

    fn status(&self, name: &str) -> Result<Vec<TargetLine>> {
        let mut inner = self.inner.lock();
        let device = inner.devices.get_mut(name).ok_or_else(|| SnapError::Mapper {
            op: "table status",
            name: name.to_owned(),
            source: Errno::ENXIO,
        })?;
        let Some(table) = device.active.clone() else {
            return Ok(Vec::new());
        };

        let mut lines = Vec::with_capacity(table.num_targets());
        for (index, target) in table.targets().iter().enumerate() {
            let data = match &target.spec {
                TargetSpec::Linear { .. } => String::new(),
                TargetSpec::Snapshot { .. } => {
                    let status = device
                        .counters
                        .entry(index)
                        .or_insert_with(|| fresh_counters(target.length_sectors));
                    status.encode()
                }
            };
            lines.push(TargetLine {
                start_sector: target.start_sector,
                length_sectors: target.length_sectors,
                target_type: target.spec.target_type().to_owned(),
                data,
            });
        }
        Ok(lines)
    }

    fn table(&self, name: &str) -> Result<Vec<TargetLine>> {
        let inner = self.inner.lock();
        let device = inner.devices.get(name).ok_or_else(|| SnapError::Mapper {
            op: "table info",
            name: name.to_owned(),
            source: Errno::ENXIO,
        })?;
        let Some(table) = &device.active else {
            return Ok(Vec::new());
        };
        Ok(table
            .targets()
            .iter()
            .map(|target| TargetLine {
                start_sector: target.start_sector,
                length_sectors: target.length_sectors,
                target_type: target.spec.target_type().to_owned(),
                data: target.spec.params(),
            })
            .collect())
    }

    fn path(&self, name: &str) -> Result<String> {
        let inner = self.inner.lock();
        let device = inner.devices.get(name).ok_or_else(|| SnapError::Mapper {
            op: "status",
            name: name.to_owned(),
            source: Errno::ENXIO,
        })?;
        if let Some(root) = &inner.dev_root {
            return Ok(Self::backing_path(root, name).to_string_lossy().into_owned());
        }
        Ok(format!("/dev/dm-{}", device.minor))
    }

    fn unique_path(&self, name: &str) -> Result<String> {
        let inner = self.inner.lock();
        let device = inner.devices.get(name).ok_or_else(|| SnapError::Mapper {
            op: "unique path",
            name: name.to_owned(),
            source: Errno::ENXIO,
        })?;
        Ok(format!("/dev/disk/by-id/dm-uuid-{}", device.uuid))
    }

    fn device_string(&self, name: &str) -> Result<String> {
        let inner = self.inner.lock();
        let device = inner.devices.get(name).ok_or_else(|| SnapError::Mapper {
            op: "status",
            name: name.to_owned(),
            source: Errno::ENXIO,
        })?;
        Ok(format!("253:{}", device.minor))
    }

    /// In-memory devices are observable the moment they are created, so the
    /// path wait never blocks.
    fn wait_for_path(&self, _path: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
