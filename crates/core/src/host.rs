// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker host records.

use crate::state::HostStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

crate::entity_id! {
    /// Unique identifier for a worker host (agent).
    pub struct HostId("hst-");
}

crate::entity_id! {
    /// Unique identifier for a managed host interface.
    pub struct ManagedInterfaceId("mif-");
}

/// Which workload providers an agent can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Container,
    Vm,
}

crate::str_display! {
    Provider {
        Container => "container",
        Vm => "vm",
    }
}

/// Resource usage snapshot reported with each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub cpu_count: u32,
    pub cpu_percent: f64,
    pub disk_total_gb: u64,
    pub disk_used_gb: u64,
}

/// A worker host running an agent daemon.
///
/// Created on first registration, updated on every heartbeat. The core
/// never deletes hosts; that is an admin operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    /// Management address (`host:port`) the controller dials.
    pub address: String,
    pub status: HostStatus,
    #[serde(default)]
    pub last_heartbeat_ms: Option<u64>,
    /// Providers this agent supports.
    #[serde(default)]
    pub providers: BTreeSet<Provider>,
    #[serde(default)]
    pub resources: ResourceSnapshot,
    #[serde(default)]
    pub version: Option<String>,
    /// Data-plane IP used as the VXLAN endpoint. Falls back to the host
    /// part of `address` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_plane_address: Option<String>,
    #[serde(default)]
    pub process_started_ms: Option<u64>,
    /// Last query failure against this agent; cleared on the next
    /// successful query. Owned by reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_since_ms: Option<u64>,
}

impl Host {
    /// The IP the VXLAN endpoint binds to: explicit data-plane address
    /// when configured, otherwise the host part of the management address.
    pub fn data_plane_ip(&self) -> &str {
        if let Some(ip) = self.data_plane_address.as_deref() {
            return ip;
        }
        self.address.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.address)
    }

    /// A host is online when its status says so and its heartbeat is
    /// within `timeout_ms` of `now_ms`.
    pub fn is_online(&self, now_ms: u64, timeout_ms: u64) -> bool {
        if self.status != HostStatus::Online {
            return false;
        }
        match self.last_heartbeat_ms {
            Some(hb) => now_ms.saturating_sub(hb) <= timeout_ms,
            None => false,
        }
    }

    pub fn supports(&self, provider: Provider) -> bool {
        self.providers.contains(&provider)
    }
}

crate::builder! {
    pub struct HostBuilder => Host {
        field {
            name: String = "host-a",
            address: String = "10.0.0.10:8000",
            status: HostStatus = HostStatus::Online,
            providers: BTreeSet<Provider> = BTreeSet::from([Provider::Container]),
            resources: ResourceSnapshot = ResourceSnapshot {
                memory_total_mb: 32_768,
                memory_used_mb: 4_096,
                cpu_count: 16,
                cpu_percent: 10.0,
                disk_total_gb: 500,
                disk_used_gb: 100,
            },
            last_heartbeat_ms: Option<u64> = Some(1_700_000_000_000u64),
            version: Option<String> = None::<String>,
            process_started_ms: Option<u64> = None::<u64>,
        }
        option {
            data_plane_address: String = None,
            last_error: String = None,
            error_since_ms: u64 = None,
        }
        init {
            id: HostId = HostId::new(),
        }
    }
}

/// A host network interface pre-provisioned by the agent for external
/// network links. Links to an external node attach the container veth
/// to this interface instead of another container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedInterface {
    pub id: ManagedInterfaceId,
    pub host_id: HostId,
    /// Kernel interface name on the host, e.g. `eth99`.
    pub name: String,
    /// Role of the interface; "external" for uplinks to real networks.
    #[serde(default)]
    pub interface_type: String,
    /// Agent-reported provisioning state ("synced" when usable).
    #[serde(default)]
    pub sync_status: String,
    #[serde(default)]
    pub is_up: bool,
}

crate::builder! {
    pub struct ManagedInterfaceBuilder => ManagedInterface {
        field {
            name: String = "eth99",
            interface_type: String = "external",
            sync_status: String = "synced",
            host_id: HostId = HostId::from_string("hst-a"),
            is_up: bool = true,
        }
        init {
            id: ManagedInterfaceId = ManagedInterfaceId::new(),
        }
    }
}
