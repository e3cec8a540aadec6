//! The update coordinator.
//!
//! [`SnapshotManager`] owns the metadata directory and sequences the global
//! state machine:
//!
//! ```text
//! none ──begin_update──▶ initiated ──finished_snapshot_writes──▶ unverified
//! unverified ──initiate_merge──▶ merging ──▶ merge-completed ──▶ none
//! ```
//!
//! with `merge-failed` / `merge-needs-reboot` as retryable detours and
//! rollback or external reflash collapsing everything back to `none`.
//! Every operation takes the state-file lock for its whole duration; shared
//! for reads and the runtime mapping path, exclusive for anything that
//! mutates persisted state.

use std::collections::HashSet;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snapslot_dm::Mapper;
use snapslot_error::{Result, SnapError};
use snapslot_state::{LockMode, Session, StateDir};
use snapslot_types::{CancelToken, SnapshotRecord, SnapshotState, UpdateState};
use tracing::{error, info, warn};

use crate::cleanup::CleanupList;
use crate::compose::{initialize_cow, TimeBudget};
use crate::deps::{CowPlanner, DeviceNames, ImageManager, Manifest, PartitionBuilder};
use crate::stack;

/// Everything the manager consumes from the surrounding system.
#[derive(Clone)]
pub struct Collaborators {
    pub mapper: Arc<dyn Mapper>,
    pub names: Arc<dyn DeviceNames>,
    pub builder: Arc<dyn PartitionBuilder>,
    pub images: Arc<dyn ImageManager>,
    pub planner: Arc<dyn CowPlanner>,
}

/// Result of [`SnapshotManager::get_update_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateStatus {
    pub state: UpdateState,
    /// Percentage complete. Currently `100` for `merge-completed` and `0`
    /// otherwise; a counter-derived value for `merging` is reserved for a
    /// later allocator-aware computation.
    pub progress: u32,
}

/// The snapshot lifecycle manager.
pub struct SnapshotManager {
    pub(crate) store: StateDir,
    pub(crate) mapper: Arc<dyn Mapper>,
    pub(crate) names: Arc<dyn DeviceNames>,
    pub(crate) builder: Arc<dyn PartitionBuilder>,
    pub(crate) images: Arc<dyn ImageManager>,
    pub(crate) planner: Arc<dyn CowPlanner>,
    pub(crate) poll_interval: Duration,
}

impl SnapshotManager {
    /// Create a manager over the given metadata directory.
    #[must_use]
    pub fn new(metadata_dir: impl Into<PathBuf>, deps: Collaborators) -> Self {
        Self {
            store: StateDir::new(metadata_dir),
            mapper: deps.mapper,
            names: deps.names,
            builder: deps.builder,
            images: deps.images,
            planner: deps.planner,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Variant for early boot: identical today, but callers must inject an
    /// image manager that works before system services are up.
    #[must_use]
    pub fn new_for_first_stage(metadata_dir: impl Into<PathBuf>, deps: Collaborators) -> Self {
        Self::new(metadata_dir, deps)
    }

    /// Override the merge poll interval. Intended for tests.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub(crate) fn lock_shared(&self) -> Result<Session> {
        self.store.open_session(LockMode::Shared)
    }

    pub(crate) fn lock_exclusive(&self) -> Result<Session> {
        self.store.open_session(LockMode::Exclusive)
    }

    /// The slot suffix embedded in a suffixed partition name.
    pub(crate) fn slot_suffix_of(&self, partition: &str) -> Result<String> {
        for suffix in [self.names.slot_suffix(), self.names.other_slot_suffix()] {
            if partition.ends_with(&suffix) {
                return Ok(suffix);
            }
        }
        Err(SnapError::metadata(format!(
            "partition {partition} carries no known slot suffix"
        )))
    }

    // ── Top-level lifecycle ──

    /// Begin an update. Any lingering prior update is first resolved: an
    /// unbooted one is cancelled outright, while a pending merge is driven
    /// to completion here (blocking) before the new update may start.
    pub fn begin_update(&self) -> Result<()> {
        if self.try_cancel_update()? {
            info!("waiting for the pending merge before beginning a new update");
            let state = self.process_update_state(&CancelToken::new())?;
            info!(%state, "pending merge resolved");
        }

        let session = self.lock_exclusive()?;
        let state = self.store.read_global(&session);
        if state != UpdateState::None {
            return Err(SnapError::WrongState {
                op: "begin update",
                state: state.to_string(),
            });
        }
        self.store.write_global(&session, UpdateState::Initiated)
    }

    /// Cancel the in-flight update and delete its snapshots. Fails with
    /// [`SnapError::MergeNeeded`] once the updated slot has been booted.
    pub fn cancel_update(&self) -> Result<()> {
        if self.try_cancel_update()? {
            return Err(SnapError::MergeNeeded);
        }
        Ok(())
    }

    /// The implicit cancel-or-merge rule shared by `begin_update` and
    /// `cancel_update`. Returns `true` when a merge is needed instead.
    fn try_cancel_update(&self) -> Result<bool> {
        let session = self.lock_exclusive()?;
        match self.store.read_global(&session) {
            UpdateState::None => Ok(false),
            UpdateState::Initiated => {
                info!("update has been initiated, now cancelling");
                self.remove_all_update_state(&session)?;
                Ok(false)
            }
            UpdateState::Unverified => match self.store.read_boot_indicator() {
                None => {
                    warn!("cannot read the boot indicator, proceeding to cancel the update");
                    self.remove_all_update_state(&session)?;
                    Ok(false)
                }
                Some(stored) if stored == self.names.slot_suffix() => {
                    info!("cancelling a previously finalized update");
                    self.remove_all_update_state(&session)?;
                    Ok(false)
                }
                Some(_) => Ok(true),
            },
            _ => Ok(true),
        }
    }

    /// Delete all snapshots, the boot indicator, and reset the global state
    /// to `none`.
    pub(crate) fn remove_all_update_state(&self, session: &Session) -> Result<()> {
        self.remove_all_snapshots(session)?;
        if let Err(err) = self.store.remove_boot_indicator(session) {
            warn!(%err, "could not remove the boot indicator");
        }
        // If this fails we keep retrying on future reboots or updates until
        // it finally succeeds.
        self.store.write_global(session, UpdateState::None)
    }

    /// Unmap and delete every known snapshot. Every snapshot is attempted;
    /// the first error is reported after the loop completes.
    pub(crate) fn remove_all_snapshots(&self, session: &Session) -> Result<()> {
        let snapshots = self.store.list_snapshots(session)?;
        let mut first_err = None;
        for name in snapshots {
            let result = self
                .unmap_partition_with_snapshot(session, &name)
                .and_then(|()| self.delete_snapshot(session, &name));
            if let Err(err) = result {
                error!(name, %err, "could not remove snapshot");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Mark snapshot writes as complete: record the live slot in the boot
    /// indicator and transition `initiated → unverified`. Idempotent once
    /// unverified.
    pub fn finished_snapshot_writes(&self) -> Result<()> {
        let session = self.lock_exclusive()?;
        let state = self.store.read_global(&session);
        if state == UpdateState::Unverified {
            info!("finished_snapshot_writes already called, ignoring");
            return Ok(());
        }
        if state != UpdateState::Initiated {
            return Err(SnapError::WrongState {
                op: "finish snapshot writes",
                state: state.to_string(),
            });
        }

        // The indicator doubles as a cheap early-boot probe and as the
        // rollback detector: it stores the slot that was live when the
        // update was finalized.
        self.store
            .write_boot_indicator(&session, &self.names.slot_suffix())?;
        self.store.write_global(&session, UpdateState::Unverified)
    }

    // ── Snapshot creation ──

    /// Create cow stores and records for every partition in the manifest's
    /// target slot. Requires state `initiated`.
    pub fn create_update_snapshots(&self, manifest: &Manifest) -> Result<()> {
        let session = self.lock_exclusive()?;
        let state = self.store.read_global(&session);
        if state != UpdateState::Initiated {
            return Err(SnapError::WrongState {
                op: "create update snapshots",
                state: state.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for update in &manifest.partitions {
            if !seen.insert(update.name.as_str()) {
                return Err(SnapError::DuplicatePartition {
                    name: update.name.clone(),
                });
            }
        }

        let target_suffix = self.names.other_slot_suffix();
        self.builder.start_update(manifest, &target_suffix)?;

        let mut cleanup = CleanupList::new(
            self.mapper.as_ref(),
            self.images.as_ref(),
            &self.store,
            &session,
        );
        let mut planned: Vec<(String, SnapshotRecord)> = Vec::new();

        for update in &manifest.partitions {
            let name = format!("{}{}", update.name, target_suffix);
            let plan = self.planner.plan(update, &target_suffix)?;
            info!(
                partition = name,
                device_size = plan.device_size,
                snapshot_size = plan.snapshot_size,
                cow_partition_size = plan.cow_partition_size,
                cow_file_size = plan.cow_file_size,
                "computed cow plan"
            );

            // Drop any stale snapshot from a previous attempt.
            self.delete_snapshot(&session, &name)?;

            let record = SnapshotRecord {
                state: SnapshotState::Created,
                device_size: plan.device_size,
                snapshot_size: plan.snapshot_size,
                cow_partition_size: plan.cow_partition_size,
                cow_file_size: plan.cow_file_size,
                sectors_allocated: 0,
                metadata_sectors: 0,
            };
            if !record.needs_snapshot() {
                info!(
                    partition = name,
                    "partition fits in free superpartition space, skipping snapshot"
                );
                continue;
            }

            self.store.write_record(&session, &name, &record)?;
            cleanup.delete_record_on_failure(&name);

            if record.cow_partition_size > 0 {
                self.builder.add_cow_partition(
                    &target_suffix,
                    &stack::cow_name(&name),
                    record.cow_partition_size,
                )?;
            }
            if record.cow_file_size > 0 {
                self.images
                    .create_image(&stack::cow_image_name(&name), record.cow_file_size)?;
            }

            planned.push((name, record));
        }

        // Map each cow device once and zero its header so the kernel treats
        // it as a freshly initialized overlay, then let the scoped list
        // unmap it again.
        for (name, record) in &planned {
            self.unmap_partition_with_snapshot(&session, name)?;

            let mut cow_cleanup = CleanupList::new(
                self.mapper.as_ref(),
                self.images.as_ref(),
                &self.store,
                &session,
            );
            let budget = TimeBudget::start(Duration::MAX);
            let cow = self.map_cow_devices(&session, name, record, &mut cow_cleanup, &budget)?;
            initialize_cow(&cow.path)?;
            info!(partition = name, device = cow.name, "initialized cow device");
        }

        self.builder.persist_target(&target_suffix)?;
        cleanup.release();
        info!(target_slot = target_suffix, "created all update snapshots");
        Ok(())
    }

    // ── Runtime mapping ──

    /// Map a snapshotted partition for writing, tearing down any leftover
    /// instance first. Returns the device node path, or an empty string for
    /// a partition with no extents.
    pub fn map_update_snapshot(&self, partition: &str, timeout: Duration) -> Result<String> {
        let session = self.lock_shared()?;
        self.unmap_partition_with_snapshot(&session, partition)?;
        self.map_partition_with_snapshot(&session, partition, timeout)
    }

    /// Tear down a stack mapped by [`SnapshotManager::map_update_snapshot`].
    pub fn unmap_update_snapshot(&self, partition: &str) -> Result<()> {
        let session = self.lock_shared()?;
        self.unmap_partition_with_snapshot(&session, partition)
    }

    // ── Queries ──

    /// The current update state. A missing state file short-circuits to
    /// `none` without taking the lock.
    #[must_use]
    pub fn get_update_state(&self) -> UpdateStatus {
        let none = UpdateStatus {
            state: UpdateState::None,
            progress: 0,
        };
        if !self.store.state_path().exists() {
            return none;
        }
        let Ok(session) = self.lock_shared() else {
            return none;
        };
        let state = self.store.read_global(&session);
        let progress = if state == UpdateState::MergeCompleted {
            100
        } else {
            0
        };
        UpdateStatus { state, progress }
    }

    /// Detect a rollback: the live slot matches the one stored when
    /// snapshots were finalized. (An unreadable indicator reads as "no
    /// rollback" so a normal boot is not blocked.)
    pub(crate) fn rollback_detected(&self) -> bool {
        match self.store.read_boot_indicator() {
            None => false,
            Some(stored) => stored == self.names.slot_suffix(),
        }
    }

    /// Whether the superpartition metadata says this partition was wiped or
    /// reflashed behind our back (UPDATED attribute cleared).
    pub(crate) fn is_cancelled_snapshot(&self, partition: &str) -> Result<bool> {
        let slot = self.names.slot_suffix();
        Ok(matches!(
            self.builder.is_updated(&slot, partition)?,
            Some(false)
        ))
    }

    /// Write a human-readable dump of all persisted state.
    ///
    /// Deliberately lock-free: dumping is diagnostic and may race.
    pub fn dump(&self, out: &mut dyn std::io::Write) -> Result<()> {
        let state = std::fs::read_to_string(self.store.state_path())
            .ok()
            .and_then(|contents| UpdateState::parse_token(&contents))
            .unwrap_or(UpdateState::None);
        writeln!(out, "Update state: {state}")?;

        if let Some(slot) = self.store.read_boot_indicator() {
            writeln!(out, "Boot indicator: old slot = {slot}")?;
        }

        let mut ok = true;
        let entries = match std::fs::read_dir(self.store.snapshots_dir()) {
            Ok(entries) => entries,
            Err(err) => {
                writeln!(out, "Could not list snapshots: {err}")?;
                return Ok(());
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        for name in names {
            writeln!(out, "Snapshot: {name}")?;
            let contents =
                std::fs::read_to_string(self.store.snapshots_dir().join(&name)).unwrap_or_default();
            match SnapshotRecord::decode(&name, &contents) {
                Err(err) => {
                    writeln!(out, "    unreadable record: {err}")?;
                    ok = false;
                }
                Ok(record) => {
                    writeln!(out, "    state: {}", record.state)?;
                    writeln!(out, "    device size (bytes): {}", record.device_size)?;
                    writeln!(out, "    snapshot size (bytes): {}", record.snapshot_size)?;
                    writeln!(
                        out,
                        "    cow partition size (bytes): {}",
                        record.cow_partition_size
                    )?;
                    writeln!(out, "    cow file size (bytes): {}", record.cow_file_size)?;
                    writeln!(out, "    allocated sectors: {}", record.sectors_allocated)?;
                    writeln!(out, "    metadata sectors: {}", record.metadata_sectors)?;
                }
            }
        }
        if ok {
            Ok(())
        } else {
            Err(SnapError::internal("some snapshot records were unreadable"))
        }
    }
}
