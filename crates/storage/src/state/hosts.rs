// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host table accessors.

use super::Store;
use lm_core::{Host, HostId, HostStatus, ManagedInterface, ManagedInterfaceId, Provider, ResourceSnapshot};

impl Store {
    pub fn upsert_host(&self, host: Host) {
        self.write().hosts.insert(host.id, host);
    }

    pub fn get_host(&self, id: &HostId) -> Option<Host> {
        self.read().hosts.get(id).cloned()
    }

    pub fn list_hosts(&self) -> Vec<Host> {
        self.read().hosts.values().cloned().collect()
    }

    /// Apply a mutation to one host. Returns false if the host is unknown.
    pub fn with_host(&self, id: &HostId, f: impl FnOnce(&mut Host)) -> bool {
        let mut tables = self.write();
        match tables.hosts.get_mut(id) {
            Some(host) => {
                f(host);
                true
            }
            None => false,
        }
    }

    /// Record a heartbeat: marks the host online and refreshes its
    /// resource snapshot.
    pub fn record_heartbeat(&self, id: &HostId, resources: ResourceSnapshot, now_ms: u64) -> bool {
        self.with_host(id, |host| {
            host.status = HostStatus::Online;
            host.last_heartbeat_ms = Some(now_ms);
            host.resources = resources;
        })
    }

    pub fn mark_host_offline(&self, id: &HostId) -> bool {
        self.with_host(id, |host| host.status = HostStatus::Offline)
    }

    /// Hosts currently considered online (status + fresh heartbeat).
    pub fn online_hosts(&self, now_ms: u64, heartbeat_timeout_ms: u64) -> Vec<Host> {
        self.read()
            .hosts
            .values()
            .filter(|h| h.is_online(now_ms, heartbeat_timeout_ms))
            .cloned()
            .collect()
    }

    pub fn offline_hosts(&self) -> Vec<Host> {
        self.read()
            .hosts
            .values()
            .filter(|h| h.status == HostStatus::Offline)
            .cloned()
            .collect()
    }

    /// Pick a healthy host that supports `provider`, preferring
    /// `prefer` when given and skipping `exclude`.
    pub fn healthy_host(
        &self,
        provider: Provider,
        now_ms: u64,
        heartbeat_timeout_ms: u64,
        prefer: Option<HostId>,
        exclude: &[HostId],
    ) -> Option<Host> {
        let tables = self.read();
        let eligible = |h: &&Host| {
            h.is_online(now_ms, heartbeat_timeout_ms)
                && h.supports(provider)
                && !exclude.contains(&h.id)
        };

        if let Some(preferred) = prefer {
            if let Some(host) = tables.hosts.get(&preferred) {
                if eligible(&host) {
                    return Some(host.clone());
                }
            }
        }

        let mut candidates: Vec<&Host> = tables.hosts.values().filter(eligible).collect();
        // Deterministic pick: least loaded first, id as tiebreaker.
        candidates.sort_by(|a, b| {
            a.resources
                .memory_used_mb
                .cmp(&b.resources.memory_used_mb)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        candidates.first().map(|h| (*h).clone())
    }

    /// Set the host's query-error fields; stamps `error_since_ms` only
    /// on the first failure of a streak.
    pub fn set_host_error(&self, id: &HostId, message: &str, now_ms: u64) -> bool {
        self.with_host(id, |host| {
            if host.last_error.is_none() {
                host.error_since_ms = Some(now_ms);
            }
            host.last_error = Some(message.to_string());
        })
    }

    /// Clear the error streak after a successful query.
    pub fn clear_host_error(&self, id: &HostId) -> bool {
        self.with_host(id, |host| {
            host.last_error = None;
            host.error_since_ms = None;
        })
    }

    pub fn upsert_managed_interface(&self, interface: ManagedInterface) {
        self.write().managed_interfaces.insert(interface.id, interface);
    }

    pub fn get_managed_interface(&self, id: &ManagedInterfaceId) -> Option<ManagedInterface> {
        self.read().managed_interfaces.get(id).cloned()
    }

    pub fn managed_interfaces_for_host(&self, host_id: &HostId) -> Vec<ManagedInterface> {
        self.read()
            .managed_interfaces
            .values()
            .filter(|i| i.host_id == *host_id)
            .cloned()
            .collect()
    }
}
