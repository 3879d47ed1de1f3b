// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node definitions and per-node convergence state.

use crate::host::{HostId, ManagedInterfaceId};
use crate::lab::LabId;
use crate::state::{ImageSyncState, NodeActualState, NodeDesiredState};
use serde::{Deserialize, Serialize};

crate::entity_id! {
    /// Unique identifier for a node definition.
    pub struct NodeId("nod-");
}

/// What kind of entity a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// A containerized/virtualized device the lifecycle manager runs.
    Device,
    /// An external network attachment point: no container, links to it
    /// land on a pre-provisioned host interface.
    External,
}

impl Default for NodeType {
    fn default() -> Self {
        Self::Device
    }
}

crate::str_display! {
    NodeType {
        Device => "device",
        External => "external",
    }
}

/// One entity in a lab's topology, as authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub lab_id: LabId,
    /// User-visible id from the authoring layer.
    pub display_id: String,
    /// Container name on the worker host.
    pub container_name: String,
    #[serde(default)]
    pub node_type: NodeType,
    /// Device kind string, e.g. "linux", "ceos", "vmx". Keys the
    /// resource profile table.
    pub device: String,
    pub image: String,
    /// Explicit host assignment. When set, the user's intent is
    /// authoritative: no fallback on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<HostId>,
    /// For external nodes: the pre-provisioned host interface links to
    /// this node attach to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_interface_id: Option<ManagedInterfaceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,
}

impl Node {
    pub fn is_external(&self) -> bool {
        self.node_type == NodeType::External
    }
}

crate::builder! {
    pub struct NodeBuilder => Node {
        field {
            display_id: String = "n1",
            container_name: String = "n1",
            device: String = "linux",
            image: String = "alpine:latest",
            lab_id: LabId = LabId::from_string("lab-test"),
            node_type: NodeType = NodeType::Device,
        }
        option {
            host_id: HostId = None,
            managed_interface_id: ManagedInterfaceId = None,
            memory_mb: u64 = None,
            cpu_cores: f64 = None,
        }
        init {
            id: NodeId = NodeId::new(),
        }
    }
}

/// The convergence unit: one row per node per lab.
///
/// `desired_state` is what the user asked for; `actual_state` is the
/// last committed observation. Everything the lifecycle manager,
/// reconciliation, and enforcement negotiate over lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub lab_id: LabId,
    /// User-visible node id (from the authoring layer).
    pub node_id: String,
    /// Container name; unique per lab.
    pub node_name: String,
    /// FK to the node definition, backfilled lazily.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_definition_id: Option<NodeId>,
    pub desired_state: NodeDesiredState,
    pub actual_state: NodeActualState,
    /// Boot-complete signal. Implies `actual_state == Running`.
    #[serde(default)]
    pub is_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopping_started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_sync_status: Option<ImageSyncState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_sync_message: Option<String>,
    /// Consecutive corrective attempts; reset to zero on a successful sync.
    #[serde(default)]
    pub enforcement_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_enforcement_at_ms: Option<u64>,
    /// Permanent-failure marker. While set, reconciliation must not
    /// overwrite `actual_state` (prevents error↔running oscillation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforcement_failed_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl NodeState {
    /// Whether desired and actual already agree (nothing to do).
    pub fn is_converged(&self) -> bool {
        matches!(
            (self.desired_state, self.actual_state),
            (NodeDesiredState::Running, NodeActualState::Running)
                | (NodeDesiredState::Stopped, NodeActualState::Stopped)
                | (NodeDesiredState::Stopped, NodeActualState::Undeployed)
        )
    }

    /// Enter a transitional actual state, clearing stale error text.
    pub fn enter_transitional(&mut self, new_actual: NodeActualState, now_ms: u64) {
        self.actual_state = new_actual;
        self.error_message = None;
        self.updated_at_ms = now_ms;
    }

    /// Commit a clean stop: clear in-flight timestamps and readiness.
    pub fn mark_stopped(&mut self, now_ms: u64) {
        self.actual_state = NodeActualState::Stopped;
        self.is_ready = false;
        self.stopping_started_at_ms = None;
        self.starting_started_at_ms = None;
        self.boot_started_at_ms = None;
        self.error_message = None;
        self.updated_at_ms = now_ms;
    }

    /// Commit a running observation, clearing in-flight timestamps.
    pub fn mark_running(&mut self, now_ms: u64) {
        self.actual_state = NodeActualState::Running;
        self.stopping_started_at_ms = None;
        self.starting_started_at_ms = None;
        self.error_message = None;
        if self.boot_started_at_ms.is_none() {
            self.boot_started_at_ms = Some(now_ms);
        }
        self.updated_at_ms = now_ms;
    }

    /// Commit a permanent failure with the agent's message.
    pub fn mark_error(&mut self, message: impl Into<String>, now_ms: u64) {
        self.actual_state = NodeActualState::Error;
        self.error_message = Some(message.into());
        self.is_ready = false;
        self.stopping_started_at_ms = None;
        self.starting_started_at_ms = None;
        self.boot_started_at_ms = None;
        self.updated_at_ms = now_ms;
    }

    /// Successful sync resets the enforcement ledger.
    pub fn reset_enforcement(&mut self) {
        self.enforcement_attempts = 0;
        self.enforcement_failed_at_ms = None;
    }
}

crate::builder! {
    pub struct NodeStateBuilder => NodeState {
        field {
            node_id: String = "n1",
            node_name: String = "n1",
            lab_id: LabId = LabId::from_string("lab-test"),
            desired_state: NodeDesiredState = NodeDesiredState::Running,
            actual_state: NodeActualState = NodeActualState::Undeployed,
            is_ready: bool = false,
            ip_addresses: Vec<String> = Vec::<String>::new(),
            enforcement_attempts: u32 = 0u32,
            updated_at_ms: u64 = 1_700_000_000_000u64,
        }
        option {
            node_definition_id: NodeId = None,
            starting_started_at_ms: u64 = None,
            stopping_started_at_ms: u64 = None,
            boot_started_at_ms: u64 = None,
            error_message: String = None,
            image_sync_status: ImageSyncState = None,
            image_sync_message: String = None,
            last_enforcement_at_ms: u64 = None,
            enforcement_failed_at_ms: u64 = None,
            management_ip: String = None,
        }
    }
}

#[cfg(test)]
#[path = "node_tests.rs"]
mod tests;
