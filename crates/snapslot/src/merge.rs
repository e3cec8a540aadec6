//! The merge driver.
//!
//! `initiate_merge` flips every mapped snapshot's live table into merge
//! mode; `process_update_state` then polls the per-device drain counters,
//! collapsing each stack as its snapshot finishes and aggregating the
//! per-snapshot outcomes into the global state with priority
//! `merging > merge-failed > merge-needs-reboot > cancelled >
//! merge-completed`.
//!
//! A failed merge is never fatal to the machine: every later poll (and
//! every boot) retries, because a transient cause may have cleared.

use snapslot_dm::{DeviceState, SnapshotStatus, TargetLine};
use snapslot_error::{Result, SnapError};
use snapslot_state::Session;
use snapslot_types::{CancelToken, SnapshotRecord, SnapshotState, UpdateState};
use tracing::{error, info, warn};

use crate::manager::SnapshotManager;
use crate::stack;

impl SnapshotManager {
    /// Start merging all snapshots. Requires a verified update (state
    /// `unverified`) and that the device booted the updated slot.
    ///
    /// Writing `merging` is the point of no return; table rewrites happen
    /// after it. If some rewrites fail the global state is pre-emptively
    /// set to `merge-failed` (the next poll retries), but the call still
    /// succeeds: a merge *was* initiated.
    pub fn initiate_merge(&self) -> Result<()> {
        let session = self.lock_exclusive()?;
        let state = self.store.read_global(&session);
        if state != UpdateState::Unverified {
            return Err(SnapError::WrongState {
                op: "initiate merge",
                state: state.to_string(),
            });
        }

        let old_slot = self
            .store
            .read_boot_indicator()
            .ok_or(SnapError::NoBootIndicator)?;
        let new_slot = self.names.slot_suffix();
        if new_slot == old_slot {
            return Err(SnapError::MergeFromOldSlot { slot: old_slot });
        }

        let snapshots = self.store.list_snapshots(&session)?;

        // Everything merges at the same time, so every snapshot must
        // already be mapped; first-stage boot should have done that.
        for name in &snapshots {
            if self.mapper.state(name) == DeviceState::Invalid {
                return Err(SnapError::NotMapped { name: name.clone() });
            }
        }

        self.store.write_global(&session, UpdateState::Merging)?;

        let mut rewrote_all = true;
        for name in &snapshots {
            // A failure here leaves no choice but to continue: everything
            // must be merged. The next boot will try this snapshot again.
            if let Err(err) = self.switch_snapshot_to_merge(&session, name) {
                error!(name, %err, "failed to switch snapshot to a merge target");
                rewrote_all = false;
            }
        }

        if !rewrote_all {
            if let Err(err) = self.store.write_global(&session, UpdateState::MergeFailed) {
                error!(%err, "could not record the failed merge initiation");
            }
        }
        info!(count = snapshots.len(), "merge initiated");
        Ok(())
    }

    /// Rewrite one snapshot's table to merge mode and advance its record.
    fn switch_snapshot_to_merge(&self, session: &Session, name: &str) -> Result<()> {
        let mut record = self.store.read_record(session, name)?;
        if record.state != SnapshotState::Created {
            warn!(name, state = %record.state, "snapshot has unexpected state");
        }

        let dm_name = stack::snapshot_device_name(name, &record);
        self.rewrite_snapshot_device_table(&dm_name)?;

        // Past this point the switch happened; record keeping is
        // best-effort.
        record.state = SnapshotState::Merging;
        match self.query_snapshot_status(&dm_name) {
            Ok((_, status)) => {
                record.sectors_allocated = status.sectors_allocated;
                record.metadata_sectors = status.metadata_sectors;
            }
            Err(err) => error!(name = dm_name, %err, "could not query merge status"),
        }
        if let Err(err) = self.store.write_record(session, name, &record) {
            error!(name, %err, "could not update snapshot record");
        }
        Ok(())
    }

    /// Swap a live `snapshot` table for an identical `snapshot-merge` one.
    fn rewrite_snapshot_device_table(&self, dm_name: &str) -> Result<()> {
        let targets = self.mapper.table(dm_name)?;
        if targets.len() != 1 || targets[0].target_type != "snapshot" {
            return Err(SnapError::UnexpectedTable {
                name: dm_name.to_owned(),
                detail: "expected a single snapshot target".to_owned(),
            });
        }
        let (base, cow) = snapslot_dm::parse_snapshot_params(&targets[0].data)?;

        let table = stack::snapshot_table(
            &base,
            &cow,
            snapslot_dm::SnapshotMode::Merge,
            targets[0].length_sectors,
        );
        self.mapper.load_and_activate(dm_name, &table)?;
        info!(name = dm_name, "switched snapshot device to a merge target");
        Ok(())
    }

    // ── Polling ──

    /// Block until merging reaches a resting state.
    ///
    /// Returns the final state: `merge-completed` (update done, state is
    /// already reset to `none`), `merge-failed` (call again to retry),
    /// `merge-needs-reboot` (cleanup wants one more reboot, or another
    /// call), or `cancelled` (rollback/reflash; artifacts were removed).
    /// Tripping `cancel` returns the last observed state after the current
    /// poll.
    pub fn process_update_state(&self, cancel: &CancelToken) -> Result<UpdateState> {
        loop {
            let state = self.check_merge_state()?;
            if state == UpdateState::MergeFailed {
                self.acknowledge_merge_failure();
            }
            if state != UpdateState::Merging || cancel.is_cancelled() {
                return Ok(state);
            }
            // Not time sensitive; poll at a relaxed cadence.
            std::thread::sleep(self.poll_interval);
        }
    }

    /// One merge poll: evaluate every snapshot and act on the aggregate.
    pub(crate) fn check_merge_state(&self) -> Result<UpdateState> {
        let session = self.lock_exclusive()?;
        let state = self.check_merge_state_locked(&session)?;
        match state {
            // Success is acknowledged under the same lock.
            UpdateState::MergeCompleted => self.acknowledge_merge_success(&session)?,
            UpdateState::Cancelled => self.remove_all_update_state(&session)?,
            _ => {}
        }
        Ok(state)
    }

    fn check_merge_state_locked(&self, session: &Session) -> Result<UpdateState> {
        let state = self.store.read_global(session);
        match state {
            // Harmless races between concurrent pollers just propagate.
            UpdateState::None | UpdateState::MergeCompleted => return Ok(state),

            // Poll below. NeedsReboot polls too, giving cleanup another
            // opportunity each round.
            UpdateState::Merging | UpdateState::MergeNeedsReboot | UpdateState::MergeFailed => {}

            // Cancelled updates are normally detected by the per-device
            // poll, but a merge that never started needs this check.
            UpdateState::Unverified => {
                if self.rollback_detected() {
                    return Ok(UpdateState::Cancelled);
                }
                return Ok(state);
            }

            UpdateState::Initiated | UpdateState::Cancelled => return Ok(state),
        }

        let snapshots = self.store.list_snapshots(session)?;
        let mut merging = false;
        let mut failed = false;
        let mut needs_reboot = false;
        let mut cancelled = false;

        for name in &snapshots {
            // Every snapshot gets its chance each round; individual
            // failures aggregate rather than aborting the loop.
            match self.check_target_merge_state(session, name) {
                Ok(UpdateState::Merging) => merging = true,
                Ok(UpdateState::MergeFailed) => failed = true,
                Ok(UpdateState::MergeNeedsReboot) => needs_reboot = true,
                Ok(UpdateState::Cancelled) => cancelled = true,
                Ok(UpdateState::MergeCompleted) => {}
                Ok(other) => {
                    error!(name, state = %other, "unexpected per-snapshot merge state");
                    failed = true;
                }
                Err(err) => {
                    error!(name, %err, "could not check snapshot merge state");
                    failed = true;
                }
            }
        }

        // Keep polling until *nothing* is merging, so every snapshot gets a
        // chance to be marked completed or failed.
        if merging {
            return Ok(UpdateState::Merging);
        }
        if failed {
            // Acknowledged by the caller, outside this lock.
            return Ok(UpdateState::MergeFailed);
        }
        if needs_reboot {
            self.store
                .write_global(session, UpdateState::MergeNeedsReboot)?;
            return Ok(UpdateState::MergeNeedsReboot);
        }
        if cancelled {
            // The base partition changed underneath the update (an unlocked
            // device was reflashed). The exact update state is undefined;
            // report cancellation and let the caller clean up.
            return Ok(UpdateState::Cancelled);
        }
        Ok(UpdateState::MergeCompleted)
    }

    /// Evaluate a single snapshot's drain.
    fn check_target_merge_state(&self, session: &Session, name: &str) -> Result<UpdateState> {
        let mut record = self.store.read_record(session, name)?;
        let dm_name = stack::snapshot_device_name(name, &record);

        if !self.is_snapshot_device(&dm_name) {
            if self.is_cancelled_snapshot(name)? {
                self.delete_snapshot(session, name)?;
                return Ok(UpdateState::Cancelled);
            }

            // A previous round finished the drain but could not collapse
            // the stack. After a reboot the device comes back as plain
            // linear and cleanup can be retried; give it our best effort.
            if record.state == SnapshotState::MergeCompleted {
                if let Err(err) = self.on_snapshot_merge_complete(session, name, &record) {
                    warn!(name, %err, "post-merge cleanup still failing");
                }
                return Ok(UpdateState::MergeCompleted);
            }

            error!(
                name = dm_name,
                "expected a snapshot or snapshot-merge device"
            );
            return Ok(UpdateState::MergeFailed);
        }

        let (target_type, status) = self.query_snapshot_status(&dm_name)?;
        if target_type != "snapshot-merge" {
            // The table rewrite in initiate_merge failed for this device.
            error!(name, target_type, "snapshot has incorrect target type");
            return Ok(UpdateState::MergeFailed);
        }

        if !status.merge_complete() {
            if record.state == SnapshotState::MergeCompleted {
                error!(name, "snapshot is merging after being marked merge-completed");
                return Ok(UpdateState::MergeFailed);
            }
            return Ok(UpdateState::Merging);
        }

        // Drained. Persist completion before attempting cleanup, so that no
        // matter which part of cleanup fails, the next boot will not map
        // another snapshot for this partition.
        record.state = SnapshotState::MergeCompleted;
        record.sectors_allocated = status.sectors_allocated;
        record.metadata_sectors = status.metadata_sectors;
        self.store.write_record(session, name, &record)?;

        if let Err(err) = self.on_snapshot_merge_complete(session, name, &record) {
            warn!(name, %err, "merge completed but cleanup failed");
            return Ok(UpdateState::MergeNeedsReboot);
        }
        Ok(UpdateState::MergeCompleted)
    }

    /// Collapse the stack and drop the snapshot's artifacts once its drain
    /// has finished.
    fn on_snapshot_merge_complete(
        &self,
        session: &Session,
        name: &str,
        record: &SnapshotRecord,
    ) -> Result<()> {
        let dm_name = stack::snapshot_device_name(name, record);
        if self.is_snapshot_device(&dm_name) {
            // Re-verify before touching tables.
            let (target_type, status) = self.query_snapshot_status(&dm_name)?;
            if target_type != "snapshot-merge" {
                return Err(SnapError::UnexpectedTable {
                    name: dm_name,
                    detail: format!("unexpected target type {target_type}"),
                });
            }
            if !status.merge_complete() {
                return Err(SnapError::UnexpectedTable {
                    name: dm_name,
                    detail: "merge is unexpectedly incomplete".to_owned(),
                });
            }
            // Collapsing implicitly unmaps the snapshot.
            self.collapse_snapshot_device(session, name, record)?;
        }

        self.delete_snapshot(session, name)
    }

    /// Record a successful merge: all update state is removed.
    fn acknowledge_merge_success(&self, session: &Session) -> Result<()> {
        self.remove_all_update_state(session)
    }

    /// Record a failed merge. Runs outside the poll's lock, so state is
    /// re-read and only overwritten from the states a failure can follow.
    fn acknowledge_merge_failure(&self) {
        error!("merge could not be completed and will be marked as failed");

        let session = match self.lock_exclusive() {
            Ok(session) => session,
            Err(err) => {
                error!(%err, "cannot lock state to acknowledge merge failure");
                return;
            }
        };
        let state = self.store.read_global(&session);
        if state != UpdateState::Merging && state != UpdateState::MergeNeedsReboot {
            return;
        }
        if let Err(err) = self.store.write_global(&session, UpdateState::MergeFailed) {
            error!(%err, "could not write merge-failed state");
        }
    }

    // ── Device probes ──

    /// The device's single status line, or `None` for nonexistent devices
    /// and multi-target tables.
    fn single_status_target(&self, dm_name: &str) -> Option<TargetLine> {
        if self.mapper.state(dm_name) == DeviceState::Invalid {
            return None;
        }
        match self.mapper.status(dm_name) {
            Ok(mut targets) if targets.len() == 1 => Some(targets.remove(0)),
            Ok(_) => None,
            Err(err) => {
                error!(name = dm_name, %err, "could not query device");
                None
            }
        }
    }

    /// Whether the device currently holds a lone snapshot-family target.
    pub(crate) fn is_snapshot_device(&self, dm_name: &str) -> bool {
        self.single_status_target(dm_name)
            .is_some_and(|t| t.is_snapshot_type())
    }

    /// Target type and drain counters of a snapshot device.
    pub(crate) fn query_snapshot_status(
        &self,
        dm_name: &str,
    ) -> Result<(String, SnapshotStatus)> {
        let target = self
            .single_status_target(dm_name)
            .filter(TargetLine::is_snapshot_type)
            .ok_or_else(|| SnapError::UnexpectedTable {
                name: dm_name.to_owned(),
                detail: "not a snapshot or snapshot-merge device".to_owned(),
            })?;
        let status = SnapshotStatus::parse(&target.data)?;
        Ok((target.target_type, status))
    }
}
