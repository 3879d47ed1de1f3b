// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node-state accessors: the queries reconciliation, enforcement, and
//! job-health select on.

use super::Store;
use lm_core::{LabId, NodeActualState, NodeDesiredState, NodeState};

impl Store {
    /// Insert or replace by (lab_id, node_name).
    pub fn upsert_node_state(&self, state: NodeState) {
        let mut tables = self.write();
        if let Some(existing) = tables
            .node_states
            .iter_mut()
            .find(|ns| ns.lab_id == state.lab_id && ns.node_name == state.node_name)
        {
            *existing = state;
        } else {
            tables.node_states.push(state);
        }
    }

    pub fn get_node_state(&self, lab_id: &LabId, node_name: &str) -> Option<NodeState> {
        self.read()
            .node_states
            .iter()
            .find(|ns| ns.lab_id == *lab_id && ns.node_name == node_name)
            .cloned()
    }

    /// Lookup by the user-visible node id (sync jobs address nodes this way).
    pub fn get_node_state_by_id(&self, lab_id: &LabId, node_id: &str) -> Option<NodeState> {
        self.read()
            .node_states
            .iter()
            .find(|ns| ns.lab_id == *lab_id && ns.node_id == node_id)
            .cloned()
    }

    pub fn node_states_for_lab(&self, lab_id: &LabId) -> Vec<NodeState> {
        self.read()
            .node_states
            .iter()
            .filter(|ns| ns.lab_id == *lab_id)
            .cloned()
            .collect()
    }

    /// Apply a mutation to one node state. Returns false when missing.
    pub fn with_node_state(
        &self,
        lab_id: &LabId,
        node_name: &str,
        f: impl FnOnce(&mut NodeState),
    ) -> bool {
        let mut tables = self.write();
        match tables
            .node_states
            .iter_mut()
            .find(|ns| ns.lab_id == *lab_id && ns.node_name == node_name)
        {
            Some(ns) => {
                f(ns);
                true
            }
            None => false,
        }
    }

    pub fn delete_node_states_for_lab(&self, lab_id: &LabId) {
        self.write().node_states.retain(|ns| ns.lab_id != *lab_id);
    }

    /// Mismatches across stable labs — the enforcement scan.
    pub fn mismatched_node_states(&self) -> Vec<NodeState> {
        let tables = self.read();
        tables
            .node_states
            .iter()
            .filter(|ns| {
                if ns.is_converged() {
                    return false;
                }
                tables
                    .labs
                    .get(&ns.lab_id)
                    .map(|lab| lab.state.is_stable())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Nodes stuck in `pending` beyond the staleness threshold.
    pub fn stale_pending_nodes(&self, now_ms: u64, threshold_ms: u64) -> Vec<NodeState> {
        self.read()
            .node_states
            .iter()
            .filter(|ns| {
                ns.actual_state == NodeActualState::Pending
                    && now_ms.saturating_sub(ns.updated_at_ms) > threshold_ms
            })
            .cloned()
            .collect()
    }

    /// Running nodes that have not completed boot readiness.
    pub fn unready_running_nodes(&self) -> Vec<NodeState> {
        self.read()
            .node_states
            .iter()
            .filter(|ns| ns.actual_state == NodeActualState::Running && !ns.is_ready)
            .cloned()
            .collect()
    }

    pub fn error_nodes(&self) -> Vec<NodeState> {
        self.read()
            .node_states
            .iter()
            .filter(|ns| ns.actual_state == NodeActualState::Error)
            .cloned()
            .collect()
    }

    /// Desired running but observed down — candidates for re-sync.
    pub fn desired_running_but_down(&self) -> Vec<NodeState> {
        self.read()
            .node_states
            .iter()
            .filter(|ns| {
                ns.desired_state == NodeDesiredState::Running
                    && matches!(
                        ns.actual_state,
                        NodeActualState::Stopped
                            | NodeActualState::Undeployed
                            | NodeActualState::Exited
                    )
            })
            .cloned()
            .collect()
    }

    /// Running nodes with no placement record (repair path).
    pub fn running_nodes_without_placement(&self) -> Vec<NodeState> {
        let tables = self.read();
        tables
            .node_states
            .iter()
            .filter(|ns| {
                ns.actual_state == NodeActualState::Running
                    && !tables
                        .placements
                        .iter()
                        .any(|p| p.lab_id == ns.lab_id && p.node_name == ns.node_name)
            })
            .cloned()
            .collect()
    }

    /// Nodes stuck in a transitional state past the threshold.
    pub fn stuck_transitional_nodes(
        &self,
        actual: NodeActualState,
        now_ms: u64,
        threshold_ms: u64,
    ) -> Vec<NodeState> {
        self.read()
            .node_states
            .iter()
            .filter(|ns| {
                if ns.actual_state != actual {
                    return false;
                }
                let stamp = match actual {
                    NodeActualState::Stopping => ns.stopping_started_at_ms,
                    NodeActualState::Starting => ns.starting_started_at_ms,
                    _ => None,
                };
                match stamp {
                    Some(at) => now_ms.saturating_sub(at) > threshold_ms,
                    None => false,
                }
            })
            .cloned()
            .collect()
    }

    /// Nodes with an active image-sync marker.
    pub fn nodes_with_active_image_sync(&self) -> Vec<NodeState> {
        self.read()
            .node_states
            .iter()
            .filter(|ns| ns.image_sync_status.map(|s| s.is_active()).unwrap_or(false))
            .cloned()
            .collect()
    }
}

/// Derive the lab state recompute inputs from a lab's node states.
pub fn count_states(states: &[NodeState]) -> lm_core::NodeCounts {
    let mut counts = lm_core::NodeCounts::default();
    for ns in states {
        match ns.actual_state {
            NodeActualState::Running | NodeActualState::Starting | NodeActualState::Pending => {
                counts.running += 1
            }
            NodeActualState::Stopped | NodeActualState::Exited | NodeActualState::Stopping => {
                counts.stopped += 1
            }
            NodeActualState::Undeployed => counts.undeployed += 1,
            NodeActualState::Error => counts.error += 1,
        }
    }
    counts
}
