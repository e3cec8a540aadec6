//! Cancellation, rollback, and external-wipe handling, plus stack
//! idempotence.

mod common;

use std::time::Duration;

use common::{plan_system, Harness};
use snapslot::{boot, CancelToken, SnapError, UpdateState};
use snapslot_dm::traits::Mapper;

const MAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Drive a harness through `finished_snapshot_writes` on slot `_a`.
fn finalize_update(harness: &Harness) {
    let manifest = plan_system(harness);
    harness.manager.begin_update().unwrap();
    harness.manager.create_update_snapshots(&manifest).unwrap();
    harness.manager.finished_snapshot_writes().unwrap();
}

#[test]
fn cancel_before_reboot() {
    let harness = Harness::new();
    finalize_update(&harness);
    assert!(harness.boot_indicator_exists());

    // Still booted from the old slot, so cancellation wins.
    harness.manager.cancel_update().unwrap();

    assert_eq!(harness.manager.get_update_state().state, UpdateState::None);
    assert_eq!(harness.record_count(), 0);
    assert!(!harness.boot_indicator_exists());
}

#[test]
fn cancel_refused_once_merging() {
    let mut harness = Harness::new();
    finalize_update(&harness);
    harness.sim.reboot_into("_b");
    harness.restart();
    harness
        .manager
        .create_logical_and_snapshot_partitions("super")
        .unwrap();
    harness.manager.initiate_merge().unwrap();

    assert!(matches!(
        harness.manager.cancel_update(),
        Err(SnapError::MergeNeeded)
    ));
    // The merge is untouched by the failed cancel.
    assert_eq!(
        harness.manager.get_update_state().state,
        UpdateState::Merging
    );
}

#[test]
fn rollback_is_detected_and_cleaned_up() {
    let mut harness = Harness::new();
    finalize_update(&harness);

    // "Reboot" without a slot switch: the bootloader fell back to _a.
    harness.restart();

    assert!(!harness.manager.needs_snapshots_at_boot().unwrap());

    // The next poll reports the transient cancellation and resets state.
    let state = harness
        .manager
        .process_update_state(&CancelToken::new())
        .unwrap();
    assert_eq!(state, UpdateState::Cancelled);
    assert_eq!(harness.manager.get_update_state().state, UpdateState::None);
    assert_eq!(harness.record_count(), 0);
    assert!(!harness.boot_indicator_exists());
}

#[test]
fn rollback_also_cancels_via_cancel_update() {
    let harness = Harness::new();
    finalize_update(&harness);

    // No slot switch: the indicator matches the live slot, so the update
    // can still be cancelled outright.
    harness.manager.cancel_update().unwrap();
    assert_eq!(harness.manager.get_update_state().state, UpdateState::None);
}

#[test]
fn externally_wiped_partition_cancels_the_merge() {
    let mut harness = Harness::new();
    finalize_update(&harness);
    harness.sim.reboot_into("_b");
    harness.restart();
    harness
        .manager
        .create_logical_and_snapshot_partitions("super")
        .unwrap();
    harness.manager.initiate_merge().unwrap();

    // A reflash tears down the stack and clears the UPDATED attribute.
    harness.sim.mapper.delete_if_exists("system_b").unwrap();
    harness
        .sim
        .mapper
        .delete_if_exists("system_b-inner")
        .unwrap();
    harness.sim.builder.clear_updated("_b", "system_b");

    let state = harness
        .manager
        .process_update_state(&CancelToken::new())
        .unwrap();
    assert_eq!(state, UpdateState::Cancelled);
    assert_eq!(harness.manager.get_update_state().state, UpdateState::None);
    assert_eq!(harness.record_count(), 0);
}

#[test]
fn unmap_is_idempotent_and_remap_is_equivalent() {
    let harness = Harness::new();
    let manifest = plan_system(&harness);
    harness.manager.begin_update().unwrap();
    harness.manager.create_update_snapshots(&manifest).unwrap();

    let first_path = harness
        .manager
        .map_update_snapshot("system_b", MAP_TIMEOUT)
        .unwrap();
    let first_table = harness.sim.mapper.active_table("system_b").unwrap();

    harness.manager.unmap_update_snapshot("system_b").unwrap();
    // Twice in a row succeeds.
    harness.manager.unmap_update_snapshot("system_b").unwrap();
    assert!(harness.sim.mapper.device_names().is_empty());

    // Remapping produces an equivalent stack.
    let second_path = harness
        .manager
        .map_update_snapshot("system_b", MAP_TIMEOUT)
        .unwrap();
    let second_table = harness.sim.mapper.active_table("system_b").unwrap();
    assert_eq!(first_path, second_path);
    assert_eq!(first_table, second_table);
}

#[test]
fn map_update_snapshot_tears_down_leftovers_first() {
    let harness = Harness::new();
    let manifest = plan_system(&harness);
    harness.manager.begin_update().unwrap();
    harness.manager.create_update_snapshots(&manifest).unwrap();

    harness
        .manager
        .map_update_snapshot("system_b", MAP_TIMEOUT)
        .unwrap();
    // Map again without unmapping: the stale stack is replaced, not
    // duplicated or leaked.
    harness
        .manager
        .map_update_snapshot("system_b", MAP_TIMEOUT)
        .unwrap();
    assert_eq!(
        harness.sim.mapper.device_names(),
        vec![
            "system_b".to_owned(),
            "system_b-base".to_owned(),
            "system_b-cow".to_owned(),
            "system_b-inner".to_owned(),
        ]
    );
}

#[test]
fn boot_probe_and_deep_check_disagree_only_on_state() {
    let mut harness = Harness::new();

    // No update at all: both say no.
    assert!(!boot::needs_snapshot_manager(&harness.metadata_dir()));
    assert!(!harness.manager.needs_snapshots_at_boot().unwrap());

    finalize_update(&harness);

    // The cheap probe is a bare existence check.
    assert!(boot::needs_snapshot_manager(&harness.metadata_dir()));
    // Same slot: the deep check refuses (rollback).
    assert!(!harness.manager.needs_snapshots_at_boot().unwrap());

    // New slot: snapshots are required.
    harness.sim.reboot_into("_b");
    harness.restart();
    assert!(harness.manager.needs_snapshots_at_boot().unwrap());
}

#[test]
fn cancelled_poll_token_returns_after_one_round() {
    let mut harness = Harness::new();
    finalize_update(&harness);
    harness.sim.reboot_into("_b");
    harness.restart();
    harness
        .manager
        .create_logical_and_snapshot_partitions("super")
        .unwrap();
    harness.manager.initiate_merge().unwrap();

    // The drain never completes, but a tripped token still returns.
    let cancel = CancelToken::new();
    cancel.cancel();
    let state = harness.manager.process_update_state(&cancel).unwrap();
    assert_eq!(state, UpdateState::Merging);
}

#[test]
fn dump_renders_state_and_records() {
    let harness = Harness::new();
    finalize_update(&harness);

    let mut out = Vec::new();
    harness.manager.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Update state: unverified"));
    assert!(text.contains("Boot indicator: old slot = _a"));
    assert!(text.contains("Snapshot: system_b"));
    assert!(text.contains("state: created"));
}
