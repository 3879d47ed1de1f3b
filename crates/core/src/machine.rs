// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State machines for nodes, links, and labs.
//!
//! These are pure transition tables: the lifecycle manager, reconciliation,
//! and enforcement all consult them instead of encoding transitions inline,
//! so every caller agrees on what a given (desired, actual) pair means.

use crate::state::{
    CarrierState, LabState, LinkActualState, NodeActualState, NodeDesiredState, TunnelStatus,
};

/// Transitional entry computed before any agent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionalEntry {
    pub new_actual: NodeActualState,
    /// Which in-flight timestamp to stamp, if any.
    pub stamp: Option<TransitionStamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStamp {
    StartingStartedAt,
    StoppingStartedAt,
}

/// Corrective action enforcement should take for a mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementAction {
    Start,
    Stop,
    Redeploy,
}

crate::str_display! {
    EnforcementAction {
        Start => "start",
        Stop => "stop",
        Redeploy => "redeploy",
    }
}

/// Node state transition tables.
pub struct NodeStateMachine;

impl NodeStateMachine {
    /// The transitional state a node enters when a sync job picks it up,
    /// committed before the agent call so the user sees the operation in
    /// flight. Returns `None` when the pair needs no transition (already
    /// converged, or mid-flight).
    pub fn transitional_entry(
        desired: NodeDesiredState,
        actual: NodeActualState,
    ) -> Option<TransitionalEntry> {
        match (desired, actual) {
            (NodeDesiredState::Running, NodeActualState::Undeployed) => Some(TransitionalEntry {
                new_actual: NodeActualState::Pending,
                stamp: None,
            }),
            (NodeDesiredState::Running, NodeActualState::Stopped)
            | (NodeDesiredState::Running, NodeActualState::Exited) => Some(TransitionalEntry {
                new_actual: NodeActualState::Starting,
                stamp: Some(TransitionStamp::StartingStartedAt),
            }),
            (NodeDesiredState::Running, NodeActualState::Error) => Some(TransitionalEntry {
                new_actual: NodeActualState::Pending,
                stamp: None,
            }),
            (NodeDesiredState::Stopped, NodeActualState::Running) => Some(TransitionalEntry {
                new_actual: NodeActualState::Stopping,
                stamp: Some(TransitionStamp::StoppingStartedAt),
            }),
            _ => None,
        }
    }

    /// The corrective action for a desired/actual mismatch, or `None`
    /// when no clear action exists (e.g. transitional actual states that
    /// an in-flight job owns).
    pub fn enforcement_action(
        desired: NodeDesiredState,
        actual: NodeActualState,
    ) -> Option<EnforcementAction> {
        match (desired, actual) {
            (NodeDesiredState::Running, NodeActualState::Stopped)
            | (NodeDesiredState::Running, NodeActualState::Exited)
            | (NodeDesiredState::Running, NodeActualState::Error)
            | (NodeDesiredState::Running, NodeActualState::Pending) => {
                Some(EnforcementAction::Start)
            }
            (NodeDesiredState::Running, NodeActualState::Undeployed) => {
                Some(EnforcementAction::Redeploy)
            }
            (NodeDesiredState::Stopped, NodeActualState::Running) => Some(EnforcementAction::Stop),
            _ => None,
        }
    }

    /// Map a container status string from an agent status report onto an
    /// actual state. Unrecognized statuses map to `Stopped` (conservative:
    /// the container exists but isn't serving).
    pub fn from_container_status(status: &str) -> NodeActualState {
        match status {
            "running" => NodeActualState::Running,
            "stopped" | "exited" => NodeActualState::Stopped,
            "error" | "dead" => NodeActualState::Error,
            _ => NodeActualState::Stopped,
        }
    }
}

/// Aggregated node counts for deriving a lab state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub running: usize,
    pub stopped: usize,
    pub undeployed: usize,
    pub error: usize,
}

/// Lab state derivation.
pub struct LabStateMachine;

impl LabStateMachine {
    /// Recompute a lab's state from aggregated node counts. Any error
    /// wins; otherwise the lab reads as running while any node runs.
    pub fn compute(counts: NodeCounts) -> LabState {
        let total = counts.running + counts.stopped + counts.undeployed + counts.error;
        if total == 0 {
            return LabState::Undeployed;
        }
        if counts.error > 0 {
            return LabState::Error;
        }
        if counts.running > 0 {
            return LabState::Running;
        }
        if counts.stopped > 0 {
            return LabState::Stopped;
        }
        if counts.undeployed == total {
            return LabState::Undeployed;
        }
        LabState::Unknown
    }
}

/// Inputs for deriving a link's actual state.
#[derive(Debug, Clone, Copy)]
pub struct LinkDerivation {
    pub source_actual: NodeActualState,
    pub target_actual: NodeActualState,
    pub source_carrier: CarrierState,
    pub target_carrier: CarrierState,
    pub is_cross_host: bool,
    /// Status of the link's tunnel row, if one exists.
    pub tunnel: Option<TunnelStatus>,
}

/// Link state derivation (the central invariant of the data model).
pub struct LinkStateMachine;

impl LinkStateMachine {
    /// Derive actual state plus an optional error message.
    ///
    /// Both endpoints running:
    /// - either carrier off ⇒ down
    /// - cross-host without an active tunnel ⇒ error
    /// - else ⇒ up
    ///
    /// Either endpoint error ⇒ error; stopped/undeployed ⇒ down;
    /// anything else ⇒ unknown.
    pub fn derive(input: LinkDerivation) -> (LinkActualState, Option<&'static str>) {
        let both_running = input.source_actual == NodeActualState::Running
            && input.target_actual == NodeActualState::Running;

        if both_running {
            if input.source_carrier == CarrierState::Off || input.target_carrier == CarrierState::Off
            {
                return (
                    LinkActualState::Down,
                    Some("Carrier disabled on one or more endpoints"),
                );
            }
            if input.is_cross_host {
                return match input.tunnel {
                    Some(TunnelStatus::Active) => (LinkActualState::Up, None),
                    _ => (LinkActualState::Error, Some("VXLAN tunnel not active")),
                };
            }
            return (LinkActualState::Up, None);
        }

        if input.source_actual == NodeActualState::Error
            || input.target_actual == NodeActualState::Error
        {
            return (
                LinkActualState::Error,
                Some("One or more endpoint nodes in error state"),
            );
        }

        let down_states = |s: NodeActualState| {
            matches!(
                s,
                NodeActualState::Stopped | NodeActualState::Undeployed | NodeActualState::Exited
            )
        };
        if down_states(input.source_actual) || down_states(input.target_actual) {
            return (LinkActualState::Down, None);
        }

        (LinkActualState::Unknown, None)
    }
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
