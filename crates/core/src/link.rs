// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Link definitions, link convergence state, and tunnel rows.

use crate::host::HostId;
use crate::lab::LabId;
use crate::node::NodeId;
use crate::state::{CarrierState, LinkActualState, LinkDesiredState, OperState, TunnelStatus};
use serde::{Deserialize, Serialize};

crate::entity_id! {
    /// Unique identifier for a link definition.
    pub struct LinkId("lnk-");
}

crate::entity_id! {
    /// Unique identifier for a VXLAN tunnel row.
    pub struct TunnelId("tun-");
}

/// Static edge in a lab's topology, as authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub lab_id: LabId,
    /// Stable name, e.g. `r1:eth1-r2:eth1`.
    pub link_name: String,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub source_interface: String,
    pub target_interface: String,
    /// Explicit VLAN override from the authoring layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
}

/// Canonical link name from endpoint node/interface pairs.
pub fn link_name(source_node: &str, source_if: &str, target_node: &str, target_if: &str) -> String {
    format!("{source_node}:{source_if}-{target_node}:{target_if}")
}

crate::builder! {
    pub struct LinkBuilder => Link {
        field {
            link_name: String = "n1:eth1-n2:eth1",
            source_interface: String = "eth1",
            target_interface: String = "eth1",
            lab_id: LabId = LabId::from_string("lab-test"),
            source_node_id: NodeId = NodeId::from_string("nod-src"),
            target_node_id: NodeId = NodeId::from_string("nod-dst"),
        }
        option {
            vlan: u16 = None,
        }
        init {
            id: LinkId = LinkId::new(),
        }
    }
}

/// The convergence unit for edges: one row per link per lab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkState {
    pub lab_id: LabId,
    pub link_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_definition_id: Option<LinkId>,
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
    pub desired_state: LinkDesiredState,
    pub actual_state: LinkActualState,
    #[serde(default)]
    pub is_cross_host: bool,
    /// Resolved from placements; may lag behind migrations until the
    /// next reconciliation pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_host_id: Option<HostId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host_id: Option<HostId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vni: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u16>,
    #[serde(default)]
    pub source_carrier_state: CarrierState,
    #[serde(default)]
    pub target_carrier_state: CarrierState,
    #[serde(default)]
    pub source_oper_state: OperState,
    #[serde(default)]
    pub target_oper_state: OperState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_oper_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_oper_reason: Option<String>,
    /// Bumped on every oper-state write so stale async updates lose.
    #[serde(default)]
    pub oper_epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl LinkState {
    /// Both endpoints resolved to different hosts.
    pub fn endpoints_cross_host(&self) -> bool {
        match (self.source_host_id, self.target_host_id) {
            (Some(s), Some(t)) => s != t,
            _ => false,
        }
    }

    /// Mark both oper endpoints, bumping the epoch.
    pub fn set_oper_both(&mut self, state: OperState, reason: Option<&str>) {
        self.source_oper_state = state;
        self.target_oper_state = state;
        self.source_oper_reason = reason.map(str::to_string);
        self.target_oper_reason = reason.map(str::to_string);
        self.oper_epoch += 1;
    }
}

crate::builder! {
    pub struct LinkStateBuilder => LinkState {
        field {
            link_name: String = "n1:eth1-n2:eth1",
            source_node: String = "n1",
            source_interface: String = "eth1",
            target_node: String = "n2",
            target_interface: String = "eth1",
            lab_id: LabId = LabId::from_string("lab-test"),
            desired_state: LinkDesiredState = LinkDesiredState::Up,
            actual_state: LinkActualState = LinkActualState::Unknown,
            is_cross_host: bool = false,
            source_carrier_state: CarrierState = CarrierState::On,
            target_carrier_state: CarrierState = CarrierState::On,
            source_oper_state: OperState = OperState::Unknown,
            target_oper_state: OperState = OperState::Unknown,
            oper_epoch: u64 = 0u64,
        }
        option {
            link_definition_id: LinkId = None,
            source_host_id: HostId = None,
            target_host_id: HostId = None,
            vni: u32 = None,
            vlan_tag: u16 = None,
            source_oper_reason: String = None,
            target_oper_reason: String = None,
            error_message: String = None,
        }
    }
}

/// One VXLAN tunnel per cross-host link state, upserted on re-creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VxlanTunnel {
    pub id: TunnelId,
    pub lab_id: LabId,
    /// Exactly one tunnel row per link state.
    pub link_name: String,
    pub vni: u32,
    pub vlan_tag: u16,
    pub source_host_id: HostId,
    pub target_host_id: HostId,
    pub source_ip: String,
    pub target_ip: String,
    pub status: TunnelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ms: u64,
}

impl VxlanTunnel {
    /// The tunnel connects the same pair of hosts (in either direction).
    pub fn matches_endpoints(&self, a: HostId, b: HostId) -> bool {
        (self.source_host_id == a && self.target_host_id == b)
            || (self.source_host_id == b && self.target_host_id == a)
    }
}

crate::builder! {
    pub struct VxlanTunnelBuilder => VxlanTunnel {
        field {
            link_name: String = "n1:eth1-n2:eth1",
            source_ip: String = "10.0.0.10",
            target_ip: String = "10.0.0.11",
            lab_id: LabId = LabId::from_string("lab-test"),
            vni: u32 = 100_000u32,
            vlan_tag: u16 = 3000u16,
            source_host_id: HostId = HostId::from_string("hst-a"),
            target_host_id: HostId = HostId::from_string("hst-b"),
            status: TunnelStatus = TunnelStatus::Active,
            created_at_ms: u64 = 1_700_000_000_000u64,
        }
        option {
            error: String = None,
        }
        init {
            id: TunnelId = TunnelId::new(),
        }
    }
}
