//! Effectful stack composition and teardown.
//!
//! Walks the plans from [`crate::stack`] through the mapper, registering
//! every created artifact with a [`CleanupList`] so a failure partway
//! through unwinds cleanly. All waiting is bounded by a single millisecond
//! budget measured from the start of the top-level operation; a zero budget
//! means "do not wait on externally observable artifacts".

use std::fs::OpenOptions;
use std::io::Write as _;
use std::time::{Duration, Instant};

use snapslot_error::{Result, SnapError};
use snapslot_state::Session;
use snapslot_types::{SnapshotRecord, SnapshotState};
use tracing::{debug, info, warn};

use crate::cleanup::CleanupList;
use crate::manager::SnapshotManager;
use crate::stack;

/// Elapsed-decremented time budget. Zero total means "never wait"; an
/// exhausted nonzero budget fails the operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeBudget {
    total: Duration,
    started: Instant,
}

impl TimeBudget {
    pub(crate) fn start(total: Duration) -> Self {
        Self {
            total,
            started: Instant::now(),
        }
    }

    pub(crate) fn remaining(&self) -> Result<Duration> {
        if self.total.is_zero() {
            return Ok(Duration::ZERO);
        }
        let elapsed = self.started.elapsed();
        if elapsed >= self.total {
            return Err(SnapError::Timeout {
                what: format!("composition budget of {:?}", self.total),
            });
        }
        Ok(self.total - elapsed)
    }
}

/// A mapped cow device ready to feed a snapshot target.
pub(crate) struct MappedCow {
    /// `P-cow` when composed, `P-cow-img` when the image stands alone.
    pub name: String,
    /// `major:minor` for use in target parameters.
    pub device_string: String,
    /// Block-device node path.
    pub path: String,
}

/// Zero the first four bytes of a cow device so the kernel sees a brand-new
/// overlay rather than stale metadata from a previous update.
pub(crate) fn initialize_cow(path: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| SnapError::Open {
            path: path.into(),
            source,
        })?;
    file.write_all(&[0_u8; 4])?;
    Ok(())
}

impl SnapshotManager {
    /// Compose the full stack for one partition and return the path of the
    /// top device. Partitions without a live snapshot map as plain linear
    /// devices; zero-extent partitions map nothing and return an empty
    /// path.
    pub(crate) fn map_partition_with_snapshot(
        &self,
        session: &Session,
        partition: &str,
        timeout: Duration,
    ) -> Result<String> {
        let budget = TimeBudget::start(timeout);
        let slot = self.slot_suffix_of(partition)?;

        let base_table = self.builder.partition_table(&slot, partition)?;
        if base_table.is_empty() {
            info!(partition, "skipping zero-length partition");
            return Ok(String::new());
        }

        // Is there a live snapshot to honor? If so, the snapshot mode
        // depends on the global state and must be decided under the same
        // lock we map with.
        let live = match self.live_snapshot_record(session, &slot, partition)? {
            None => None,
            Some(record) => {
                let mode = stack::select_mode(self.store.read_global(session))?;
                Some((record, mode))
            }
        };

        let mut cleanup = CleanupList::new(
            self.mapper.as_ref(),
            self.images.as_ref(),
            &self.store,
            session,
        );

        // The plain extents of the partition. With a snapshot this becomes
        // `P-base` underneath the stack; without one it is the partition
        // itself.
        let base_name = if live.is_some() {
            stack::base_device_name(partition)
        } else {
            partition.to_owned()
        };
        let path = self
            .mapper
            .create_device(&base_name, &base_table, budget.remaining()?)?;
        cleanup.unmap_device_on_failure(&base_name);

        let Some((record, mode)) = live else {
            cleanup.release();
            return Ok(path);
        };

        let base_device = self.mapper.device_string(&base_name)?;
        let cow = self.map_cow_devices(session, partition, &record, &mut cleanup, &budget)?;

        let path =
            self.map_snapshot(partition, &record, &base_device, &cow.device_string, mode, &budget)?;

        cleanup.release();
        info!(partition, path, "mapped partition with snapshot");
        Ok(path)
    }

    /// The snapshot record to honor when mapping, if any. Reflashed
    /// partitions and completed merges map as plain partitions.
    fn live_snapshot_record(
        &self,
        session: &Session,
        slot: &str,
        partition: &str,
    ) -> Result<Option<SnapshotRecord>> {
        if !matches!(self.builder.is_updated(slot, partition)?, Some(true)) {
            info!(partition, "reflash detected, will skip snapshot");
            return Ok(None);
        }
        if !self.store.record_exists(partition) {
            return Ok(None);
        }
        let record = self.store.read_record(session, partition)?;
        if record.state == SnapshotState::MergeCompleted {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Map the cow store: the backing image, the in-superpartition
    /// extents, or their concatenation.
    pub(crate) fn map_cow_devices<'a>(
        &self,
        _session: &Session,
        partition: &str,
        record: &SnapshotRecord,
        cleanup: &mut CleanupList<'a>,
        budget: &TimeBudget,
    ) -> Result<MappedCow> {
        if record.cow_size() == 0 {
            return Err(SnapError::internal(format!(
                "map_cow_devices called for {partition} without a cow store"
            )));
        }
        let slot = self.slot_suffix_of(partition)?;
        let cow_image_name = stack::cow_image_name(partition);
        let cow_name = stack::cow_name(partition);

        let mut image_device = None;
        if record.cow_file_size > 0 {
            let image_path = self.images.map_image(&cow_image_name, budget.remaining()?)?;
            cleanup.unmap_image_on_failure(&cow_image_name);

            // Image alone: it *is* the cow device.
            if record.cow_partition_size == 0 {
                let device_string = self.images.device_string(&cow_image_name)?;
                debug!(partition, device = cow_image_name, "mapped cow image");
                return Ok(MappedCow {
                    name: cow_image_name,
                    device_string,
                    path: image_path,
                });
            }
            image_device = Some(self.images.device_string(&cow_image_name)?);
        }

        // The cow partition's extents, with the image appended when both
        // exist.
        let mut table = self.builder.partition_table(&slot, &cow_name)?;
        if let Some(image_device) = image_device {
            stack::append_cow_image(&mut table, &image_device, record);
        }

        let path = self
            .mapper
            .create_device(&cow_name, &table, budget.remaining()?)?;
        cleanup.unmap_device_on_failure(&cow_name);
        let device_string = self.mapper.device_string(&cow_name)?;
        debug!(partition, device = cow_name, "mapped cow device");
        Ok(MappedCow {
            name: cow_name,
            device_string,
            path,
        })
    }

    /// Create the snapshot device, and the outer linear split when only a
    /// leading region of the partition is snapshotted.
    fn map_snapshot(
        &self,
        partition: &str,
        record: &SnapshotRecord,
        base_device: &str,
        cow_device: &str,
        mode: snapslot_dm::SnapshotMode,
        budget: &TimeBudget,
    ) -> Result<String> {
        record.validate(partition)?;
        if record.state == SnapshotState::MergeCompleted {
            return Err(SnapError::WrongState {
                op: "map a merged snapshot",
                state: record.state.to_string(),
            });
        }

        let snapshot_sectors = record.snapshot_sectors();
        let tail_sectors = record.tail_sectors();

        // Snapshot and linear targets cannot share one table, so a partial
        // snapshot gets stacked: the snapshot lives on `P-inner` and `P`
        // splits between it and the base.
        let snap_name = if tail_sectors > 0 {
            stack::inner_name(partition)
        } else {
            partition.to_owned()
        };

        let table = stack::snapshot_table(base_device, cow_device, mode, snapshot_sectors);
        let path = self
            .mapper
            .create_device(&snap_name, &table, budget.remaining()?)?;

        if tail_sectors == 0 {
            return Ok(path);
        }

        let inner_device = self.mapper.device_string(&snap_name)?;
        let outer =
            stack::outer_split_table(&inner_device, base_device, snapshot_sectors, tail_sectors);
        match self
            .mapper
            .create_device(partition, &outer, budget.remaining()?)
        {
            Ok(path) => Ok(path),
            Err(err) => {
                if let Err(inner_err) = self.mapper.delete_if_exists(&snap_name) {
                    warn!(name = snap_name, %inner_err, "could not delete inner snapshot");
                }
                Err(err)
            }
        }
    }

    /// Tear down the whole stack for a partition. Idempotent: every layer
    /// uses delete-if-exists.
    pub(crate) fn unmap_partition_with_snapshot(
        &self,
        _session: &Session,
        partition: &str,
    ) -> Result<()> {
        self.mapper.delete_if_exists(partition)?;
        self.mapper
            .delete_if_exists(&stack::inner_name(partition))?;
        self.unmap_cow_devices(partition)?;
        self.mapper
            .delete_if_exists(&stack::base_device_name(partition))?;
        debug!(partition, "unmapped partition stack");
        Ok(())
    }

    /// Tear down the cow layers only.
    pub(crate) fn unmap_cow_devices(&self, partition: &str) -> Result<()> {
        self.mapper.delete_if_exists(&stack::cow_name(partition))?;
        self.images
            .unmap_image_if_exists(&stack::cow_image_name(partition))
    }

    /// Remove the backing store and record for a snapshot. The caller is
    /// responsible for the snapshot device itself being unmapped.
    pub(crate) fn delete_snapshot(&self, session: &Session, partition: &str) -> Result<()> {
        self.unmap_cow_devices(partition)?;

        let cow_image_name = stack::cow_image_name(partition);
        if self.images.image_exists(&cow_image_name)? {
            self.images.delete_image(&cow_image_name)?;
        }
        self.store.delete_record(session, partition)
    }

    /// Replace the outer device's table with one identical to `P-base`,
    /// making the partition indistinguishable from a plain mapping, then
    /// drop the snapshot machinery.
    pub(crate) fn collapse_snapshot_device(
        &self,
        _session: &Session,
        partition: &str,
        record: &SnapshotRecord,
    ) -> Result<()> {
        let dm_name = stack::snapshot_device_name(partition, record);

        // Be extra cautious before replacing tables: the live table must be
        // a lone, fully specified snapshot-merge target.
        let targets = self.mapper.table(&dm_name)?;
        if targets.len() != 1 || targets[0].target_type != "snapshot-merge" {
            return Err(SnapError::UnexpectedTable {
                name: dm_name,
                detail: "expected a single snapshot-merge target".to_owned(),
            });
        }
        snapslot_dm::parse_snapshot_params(&targets[0].data)?;

        let snapshot_sectors = record.snapshot_sectors();
        if dm_name != partition {
            // We will swap the *outer* table; verify it still looks like
            // the split we created.
            let outer = self.mapper.table(partition)?;
            if outer.len() != 2 || outer.iter().any(|t| t.target_type != "linear") {
                return Err(SnapError::UnexpectedTable {
                    name: partition.to_owned(),
                    detail: "expected two linear targets in the outer split".to_owned(),
                });
            }
            if outer[0].length_sectors != snapshot_sectors {
                return Err(SnapError::UnexpectedTable {
                    name: partition.to_owned(),
                    detail: format!(
                        "head segment covers {} sectors, expected {}",
                        outer[0].length_sectors, snapshot_sectors
                    ),
                });
            }
            let actual: u64 = outer.iter().map(|t| t.length_sectors).sum();
            if actual != record.device_sectors() {
                return Err(SnapError::UnexpectedTable {
                    name: partition.to_owned(),
                    detail: format!(
                        "outer device covers {actual} sectors, expected {}",
                        record.device_sectors()
                    ),
                });
            }
        }

        // Build a table identical to the base and load it in place of the
        // outer device.
        let slot = self.names.slot_suffix();
        let base_table = self.builder.partition_table(&slot, partition)?;
        self.mapper.load_and_activate(partition, &base_table)?;

        // Nothing depends on the snapshot layer anymore; reclaim it now so
        // the cow store can be freed without a reboot.
        if dm_name != partition {
            self.mapper.delete_if_exists(&dm_name).map_err(|err| {
                warn!(name = dm_name, %err, "cow cannot be reclaimed until after reboot");
                err
            })?;
        }

        // The base device is unused too; failure here does not block
        // cleanup.
        let base_name = stack::base_device_name(partition);
        if let Err(err) = self.mapper.delete_if_exists(&base_name) {
            warn!(name = base_name, %err, "could not delete base device");
        }
        info!(partition, "collapsed snapshot stack");
        Ok(())
    }
}
