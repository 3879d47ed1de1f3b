// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed tables and accessors.
//!
//! One module per entity family, all operating on [`Tables`] through the
//! shared [`Store`] lock. Accessors mirror the queries the monitors and
//! the lifecycle manager need; nothing outside this crate touches the
//! tables directly.

mod hosts;
mod images;
mod jobs;
mod link_states;
mod node_states;
mod placements;
mod topology;

pub use node_states::count_states;

use lm_core::{
    AgentUpdateJob, AgentUpdateJobId, ConfigSnapshot, Host, HostId, ImageHost, ImageSyncJob,
    ImageSyncJobId, Job, JobId, Lab, LabId, Link, LinkId, LinkState, ManagedInterface,
    ManagedInterfaceId, Node, NodeId, NodePlacement, NodeState, VxlanTunnel,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The complete table set. Serializable as a whole for snapshots.
///
/// Keyed tables are maps; convergence rows (`node_states`,
/// `link_states`, `placements`, `tunnels`) are vectors with a
/// per-lab-per-name uniqueness invariant enforced by their upserts —
/// labs are small, so linear scans within a lab are fine.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    pub hosts: HashMap<HostId, Host>,
    #[serde(default)]
    pub managed_interfaces: HashMap<ManagedInterfaceId, ManagedInterface>,
    #[serde(default)]
    pub labs: HashMap<LabId, Lab>,
    #[serde(default)]
    pub nodes: HashMap<NodeId, Node>,
    #[serde(default)]
    pub links: HashMap<LinkId, Link>,
    #[serde(default)]
    pub node_states: Vec<NodeState>,
    #[serde(default)]
    pub link_states: Vec<LinkState>,
    #[serde(default)]
    pub placements: Vec<NodePlacement>,
    #[serde(default)]
    pub tunnels: Vec<VxlanTunnel>,
    #[serde(default)]
    pub jobs: HashMap<JobId, Job>,
    #[serde(default)]
    pub image_hosts: Vec<ImageHost>,
    #[serde(default)]
    pub image_sync_jobs: HashMap<ImageSyncJobId, ImageSyncJob>,
    #[serde(default)]
    pub agent_update_jobs: HashMap<AgentUpdateJobId, AgentUpdateJob>,
    #[serde(default)]
    pub config_snapshots: Vec<ConfigSnapshot>,
}

/// Shared handle over the tables.
///
/// Cheap to clone; all clones see the same data. Read accessors clone
/// out rows (the store never hands out references across the lock), and
/// mutations go through closures so the lock is held briefly.
#[derive(Default)]
pub struct Store {
    tables: RwLock<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: Tables) -> Self {
        Self { tables: RwLock::new(tables) }
    }

    /// Full copy of the tables (snapshotting, tests).
    pub fn export(&self) -> Tables {
        self.tables.read().clone()
    }

    /// Replace the tables wholesale (snapshot recovery).
    pub fn import(&self, tables: Tables) {
        *self.tables.write() = tables;
    }

    pub(crate) fn read(&self) -> parking_lot::RwLockReadGuard<'_, Tables> {
        self.tables.read()
    }

    pub(crate) fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Tables> {
        self.tables.write()
    }
}

#[cfg(test)]
#[path = "../state_tests/mod.rs"]
mod tests;
