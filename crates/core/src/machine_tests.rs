// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::state::{JobStatus, LinkDesiredState};
use yare::parameterized;

#[test]
fn transitional_entry_undeployed_to_running_is_pending() {
    let entry =
        NodeStateMachine::transitional_entry(NodeDesiredState::Running, NodeActualState::Undeployed)
            .unwrap();
    assert_eq!(entry.new_actual, NodeActualState::Pending);
    assert_eq!(entry.stamp, None);
}

#[parameterized(
    stopped = { NodeActualState::Stopped },
    exited = { NodeActualState::Exited },
)]
fn transitional_entry_stopped_to_running_is_starting(actual: NodeActualState) {
    let entry =
        NodeStateMachine::transitional_entry(NodeDesiredState::Running, actual).unwrap();
    assert_eq!(entry.new_actual, NodeActualState::Starting);
    assert_eq!(entry.stamp, Some(TransitionStamp::StartingStartedAt));
}

#[test]
fn transitional_entry_error_to_running_is_pending() {
    let entry =
        NodeStateMachine::transitional_entry(NodeDesiredState::Running, NodeActualState::Error)
            .unwrap();
    assert_eq!(entry.new_actual, NodeActualState::Pending);
}

#[test]
fn transitional_entry_running_to_stopped_is_stopping() {
    let entry =
        NodeStateMachine::transitional_entry(NodeDesiredState::Stopped, NodeActualState::Running)
            .unwrap();
    assert_eq!(entry.new_actual, NodeActualState::Stopping);
    assert_eq!(entry.stamp, Some(TransitionStamp::StoppingStartedAt));
}

#[test]
fn transitional_entry_converged_pairs_are_none() {
    assert!(NodeStateMachine::transitional_entry(
        NodeDesiredState::Running,
        NodeActualState::Running
    )
    .is_none());
    assert!(NodeStateMachine::transitional_entry(
        NodeDesiredState::Stopped,
        NodeActualState::Stopped
    )
    .is_none());
}

#[parameterized(
    stopped = { NodeActualState::Stopped, EnforcementAction::Start },
    exited = { NodeActualState::Exited, EnforcementAction::Start },
    error = { NodeActualState::Error, EnforcementAction::Start },
    pending = { NodeActualState::Pending, EnforcementAction::Start },
    undeployed = { NodeActualState::Undeployed, EnforcementAction::Redeploy },
)]
fn enforcement_action_for_want_running(actual: NodeActualState, expected: EnforcementAction) {
    let action =
        NodeStateMachine::enforcement_action(NodeDesiredState::Running, actual).unwrap();
    assert_eq!(action, expected);
}

#[test]
fn enforcement_action_for_want_stopped() {
    let action =
        NodeStateMachine::enforcement_action(NodeDesiredState::Stopped, NodeActualState::Running)
            .unwrap();
    assert_eq!(action, EnforcementAction::Stop);
    // Transitional actuals have no clear action
    assert!(NodeStateMachine::enforcement_action(
        NodeDesiredState::Stopped,
        NodeActualState::Stopping
    )
    .is_none());
}

#[parameterized(
    running = { "running", NodeActualState::Running },
    stopped = { "stopped", NodeActualState::Stopped },
    exited = { "exited", NodeActualState::Stopped },
    error = { "error", NodeActualState::Error },
    dead = { "dead", NodeActualState::Error },
    weird = { "paused", NodeActualState::Stopped },
)]
fn container_status_mapping(status: &str, expected: NodeActualState) {
    assert_eq!(NodeStateMachine::from_container_status(status), expected);
}

#[parameterized(
    empty = { NodeCounts::default(), LabState::Undeployed },
    all_running = { NodeCounts { running: 3, ..Default::default() }, LabState::Running },
    mixed_running = { NodeCounts { running: 1, stopped: 2, ..Default::default() }, LabState::Running },
    any_error = { NodeCounts { running: 2, error: 1, ..Default::default() }, LabState::Error },
    all_stopped = { NodeCounts { stopped: 2, ..Default::default() }, LabState::Stopped },
    stopped_and_undeployed = { NodeCounts { stopped: 1, undeployed: 1, ..Default::default() }, LabState::Stopped },
    all_undeployed = { NodeCounts { undeployed: 4, ..Default::default() }, LabState::Undeployed },
)]
fn lab_state_from_counts(counts: NodeCounts, expected: LabState) {
    assert_eq!(LabStateMachine::compute(counts), expected);
}

fn derivation() -> LinkDerivation {
    LinkDerivation {
        source_actual: NodeActualState::Running,
        target_actual: NodeActualState::Running,
        source_carrier: CarrierState::On,
        target_carrier: CarrierState::On,
        is_cross_host: false,
        tunnel: None,
    }
}

#[test]
fn link_same_host_both_running_is_up() {
    let (state, err) = LinkStateMachine::derive(derivation());
    assert_eq!(state, LinkActualState::Up);
    assert!(err.is_none());
}

#[test]
fn link_carrier_off_is_down() {
    let (state, err) = LinkStateMachine::derive(LinkDerivation {
        source_carrier: CarrierState::Off,
        ..derivation()
    });
    assert_eq!(state, LinkActualState::Down);
    assert!(err.is_some());
}

#[test]
fn link_cross_host_requires_active_tunnel() {
    let (state, err) = LinkStateMachine::derive(LinkDerivation {
        is_cross_host: true,
        tunnel: None,
        ..derivation()
    });
    assert_eq!(state, LinkActualState::Error);
    assert_eq!(err, Some("VXLAN tunnel not active"));

    let (state, _) = LinkStateMachine::derive(LinkDerivation {
        is_cross_host: true,
        tunnel: Some(TunnelStatus::Active),
        ..derivation()
    });
    assert_eq!(state, LinkActualState::Up);

    let (state, _) = LinkStateMachine::derive(LinkDerivation {
        is_cross_host: true,
        tunnel: Some(TunnelStatus::Failed),
        ..derivation()
    });
    assert_eq!(state, LinkActualState::Error);
}

#[test]
fn link_endpoint_error_wins() {
    let (state, _) = LinkStateMachine::derive(LinkDerivation {
        target_actual: NodeActualState::Error,
        ..derivation()
    });
    assert_eq!(state, LinkActualState::Error);
}

#[parameterized(
    stopped = { NodeActualState::Stopped },
    undeployed = { NodeActualState::Undeployed },
    exited = { NodeActualState::Exited },
)]
fn link_endpoint_down_states_make_link_down(target: NodeActualState) {
    let (state, _) = LinkStateMachine::derive(LinkDerivation {
        target_actual: target,
        ..derivation()
    });
    assert_eq!(state, LinkActualState::Down);
}

#[test]
fn link_transitional_endpoint_is_unknown() {
    let (state, _) = LinkStateMachine::derive(LinkDerivation {
        target_actual: NodeActualState::Starting,
        ..derivation()
    });
    assert_eq!(state, LinkActualState::Unknown);
}

// Compile-time use of re-exports that anchor protocol compatibility.
#[test]
fn wire_enums_referenced() {
    assert_eq!(JobStatus::Queued.to_string(), "queued");
    assert_eq!(LinkDesiredState::Up.to_string(), "up");
}
