// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::store_with_lab;
use crate::state::count_states;
use lm_core::{
    Lab, LabState, NodeActualState, NodeDesiredState, NodePlacement, NodeState,
};

#[test]
fn upsert_replaces_by_lab_and_name() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    store.upsert_node_state(NodeState::builder().lab_id(lab_id).node_name("n1").build());
    store.upsert_node_state(
        NodeState::builder()
            .lab_id(lab_id)
            .node_name("n1")
            .actual_state(NodeActualState::Running)
            .build(),
    );

    let states = store.node_states_for_lab(&lab_id);
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].actual_state, NodeActualState::Running);
}

#[test]
fn mismatched_scan_only_covers_stable_labs() {
    let (store, stable_lab) = store_with_lab(LabState::Running);
    let transitional = Lab::builder().state(LabState::Starting).build();
    let transitional_lab = transitional.id;
    store.upsert_lab(transitional);

    store.upsert_node_state(
        NodeState::builder()
            .lab_id(stable_lab)
            .node_name("n1")
            .desired_state(NodeDesiredState::Running)
            .actual_state(NodeActualState::Stopped)
            .build(),
    );
    store.upsert_node_state(
        NodeState::builder()
            .lab_id(transitional_lab)
            .node_name("n2")
            .desired_state(NodeDesiredState::Running)
            .actual_state(NodeActualState::Stopped)
            .build(),
    );
    // Converged node is never a mismatch
    store.upsert_node_state(
        NodeState::builder()
            .lab_id(stable_lab)
            .node_name("n3")
            .desired_state(NodeDesiredState::Running)
            .actual_state(NodeActualState::Running)
            .build(),
    );

    let mismatched = store.mismatched_node_states();
    assert_eq!(mismatched.len(), 1);
    assert_eq!(mismatched[0].node_name, "n1");
}

#[test]
fn stale_pending_respects_threshold() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    store.upsert_node_state(
        NodeState::builder()
            .lab_id(lab_id)
            .node_name("old")
            .actual_state(NodeActualState::Pending)
            .updated_at_ms(1_000u64)
            .build(),
    );
    store.upsert_node_state(
        NodeState::builder()
            .lab_id(lab_id)
            .node_name("new")
            .actual_state(NodeActualState::Pending)
            .updated_at_ms(9_000u64)
            .build(),
    );

    let stale = store.stale_pending_nodes(10_000, 5_000);
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].node_name, "old");
}

#[test]
fn running_without_placement_is_detected() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    store.upsert_node_state(
        NodeState::builder()
            .lab_id(lab_id)
            .node_name("placed")
            .actual_state(NodeActualState::Running)
            .build(),
    );
    store.upsert_node_state(
        NodeState::builder()
            .lab_id(lab_id)
            .node_name("floating")
            .actual_state(NodeActualState::Running)
            .build(),
    );
    store.upsert_placement(
        NodePlacement::builder().lab_id(lab_id).node_name("placed").build(),
    );

    let missing = store.running_nodes_without_placement();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].node_name, "floating");
}

#[test]
fn stuck_transitional_uses_matching_timestamp() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    store.upsert_node_state(
        NodeState::builder()
            .lab_id(lab_id)
            .node_name("stuck")
            .actual_state(NodeActualState::Stopping)
            .stopping_started_at_ms(1_000u64)
            .build(),
    );
    store.upsert_node_state(
        NodeState::builder()
            .lab_id(lab_id)
            .node_name("fresh")
            .actual_state(NodeActualState::Stopping)
            .stopping_started_at_ms(90_000u64)
            .build(),
    );
    // No timestamp at all: not eligible for timer-based recovery
    store.upsert_node_state(
        NodeState::builder()
            .lab_id(lab_id)
            .node_name("unstamped")
            .actual_state(NodeActualState::Stopping)
            .build(),
    );

    let stuck =
        store.stuck_transitional_nodes(NodeActualState::Stopping, 100_000, 50_000);
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].node_name, "stuck");
}

#[test]
fn count_states_buckets_transitional_states() {
    let states = vec![
        NodeState::builder().actual_state(NodeActualState::Running).build(),
        NodeState::builder().actual_state(NodeActualState::Starting).build(),
        NodeState::builder().actual_state(NodeActualState::Stopping).build(),
        NodeState::builder().actual_state(NodeActualState::Undeployed).build(),
        NodeState::builder().actual_state(NodeActualState::Error).build(),
    ];
    let counts = count_states(&states);
    assert_eq!(counts.running, 2); // running + starting
    assert_eq!(counts.stopped, 1); // stopping
    assert_eq!(counts.undeployed, 1);
    assert_eq!(counts.error, 1);
}
