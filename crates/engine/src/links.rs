// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Link orchestration: same-host hot-connect and cross-host VXLAN.
//!
//! Entry points run under the per-lab link-ops lock (taken by callers)
//! since every path here writes link states. Cross-host links upsert
//! exactly one tunnel row per link state; endpoint swaps after a
//! migration update the row in place.

use crate::ctx::Ctx;
use crate::topology::{normalize_interface, TopologyService};
use lm_adapters::{AgentError, CrossHostLinkRequest, ExternalConnectRequest, HotConnectRequest};
use lm_core::{
    link_name, Clock, Host, Lab, LinkActualState, LinkDesiredState, LinkState, Node,
    NodeActualState, OperState, TunnelId, TunnelStatus, VxlanTunnel,
};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("endpoint host for {node} is offline or unknown")]
    HostUnavailable { node: String },
    #[error("link endpoints unresolvable: {0}")]
    Unresolvable(String),
    #[error("external node {node} has no managed interface assigned")]
    ManagedInterfaceMissing { node: String },
    #[error("managed interface {interface} lives on host {interface_host}, not the node's placed host")]
    ManagedInterfaceForeign { interface: String, interface_host: String },
    #[error("VNI range exhausted")]
    VniExhausted,
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("agent refused link: {0}")]
    Refused(String),
}

/// The resolved shape of a link whose far end is an external node.
struct ExternalEndpoint {
    /// Container name of the device side.
    device_node: String,
    /// Authored interface on the device side.
    device_interface: String,
    /// The external node definition.
    external: Node,
}

pub struct LinkOrchestrator<'a, C: Clock> {
    ctx: &'a Ctx<C>,
}

impl<'a, C: Clock> LinkOrchestrator<'a, C> {
    pub fn new(ctx: &'a Ctx<C>) -> Self {
        Self { ctx }
    }

    /// Idempotently create link-state rows for every authored link.
    /// Returns the number created.
    pub fn ensure_link_states(&self, lab: &Lab) -> usize {
        let store = &self.ctx.store;
        let topo = TopologyService::new(store);
        let mut created = 0;

        for link in topo.get_links(&lab.id) {
            let source = store.get_node(&link.source_node_id);
            let target = store.get_node(&link.target_node_id);
            let (source, target) = match (source, target) {
                (Some(s), Some(t)) => (s, t),
                _ => continue,
            };

            let name = if link.link_name.is_empty() {
                link_name(
                    &source.container_name,
                    &link.source_interface,
                    &target.container_name,
                    &link.target_interface,
                )
            } else {
                link.link_name.clone()
            };
            if store.get_link_state(&lab.id, &name).is_some() {
                continue;
            }

            let source_host = source
                .host_id
                .or_else(|| store.get_placement(&lab.id, &source.container_name).map(|p| p.host_id));
            let target_host = target
                .host_id
                .or_else(|| store.get_placement(&lab.id, &target.container_name).map(|p| p.host_id));
            let is_cross_host = matches!((source_host, target_host), (Some(s), Some(t)) if s != t);

            store.upsert_link_state(LinkState {
                lab_id: lab.id,
                link_name: name,
                link_definition_id: Some(link.id),
                source_node: source.container_name,
                source_interface: link.source_interface.clone(),
                target_node: target.container_name,
                target_interface: link.target_interface.clone(),
                desired_state: LinkDesiredState::Up,
                actual_state: LinkActualState::Unknown,
                is_cross_host,
                source_host_id: source_host,
                target_host_id: target_host,
                vni: None,
                vlan_tag: None,
                source_carrier_state: Default::default(),
                target_carrier_state: Default::default(),
                source_oper_state: Default::default(),
                target_oper_state: Default::default(),
                source_oper_reason: None,
                target_oper_reason: None,
                oper_epoch: 0,
                error_message: None,
            });
            created += 1;
        }
        created
    }

    /// Refresh host resolution on a link state from current placements.
    fn refresh_endpoints(&self, lab: &Lab, ls: &LinkState) -> LinkState {
        let store = &self.ctx.store;
        let mut updated = ls.clone();
        for (node, slot) in [
            (&ls.source_node, &mut updated.source_host_id),
            (&ls.target_node, &mut updated.target_host_id),
        ] {
            let explicit = store
                .node_by_container_name(&lab.id, node)
                .and_then(|n| n.host_id);
            let placed = store.get_placement(&lab.id, node).map(|p| p.host_id);
            if let Some(host) = explicit.or(placed) {
                *slot = Some(host);
            }
        }
        updated.is_cross_host = updated.endpoints_cross_host();
        store.upsert_link_state(updated.clone());
        updated
    }

    fn online_host(&self, id: lm_core::HostId, node: &str) -> Result<Host, LinkError> {
        let host = self
            .ctx
            .store
            .get_host(&id)
            .ok_or(LinkError::HostUnavailable { node: node.to_string() })?;
        if !self.ctx.is_host_online(&host) {
            return Err(LinkError::HostUnavailable { node: node.to_string() });
        }
        Ok(host)
    }

    /// Lowest free VNI across tunnel rows and link states, in range.
    fn allocate_vni(&self) -> Result<u32, LinkError> {
        let settings = &self.ctx.settings;
        let tables = self.ctx.store.export();
        let mut in_use: std::collections::HashSet<u32> =
            tables.tunnels.iter().map(|t| t.vni).collect();
        in_use.extend(tables.link_states.iter().filter_map(|ls| ls.vni));

        (settings.vxlan_vni_base..=settings.vxlan_vni_max)
            .find(|vni| !in_use.contains(vni))
            .ok_or(LinkError::VniExhausted)
    }

    /// Deterministic VLAN tag inside [3000, 4000).
    fn vni_to_vlan(vni: u32) -> u16 {
        3000 + (vni % 1000) as u16
    }

    /// Container names of the lab's external nodes. Links to these
    /// attach to a host interface, and the endpoint never has a
    /// container of its own.
    pub(crate) fn external_node_names(&self, lab: &Lab) -> BTreeSet<String> {
        self.ctx
            .store
            .nodes_for_lab(&lab.id)
            .into_iter()
            .filter(Node::is_external)
            .map(|n| n.container_name)
            .collect()
    }

    /// Resolve the external side of a link, if it has one.
    fn external_endpoint(&self, lab: &Lab, ls: &LinkState) -> Option<ExternalEndpoint> {
        let store = &self.ctx.store;
        let source = store.node_by_container_name(&lab.id, &ls.source_node);
        let target = store.node_by_container_name(&lab.id, &ls.target_node);

        if let Some(external) = target.filter(Node::is_external) {
            return Some(ExternalEndpoint {
                device_node: ls.source_node.clone(),
                device_interface: ls.source_interface.clone(),
                external,
            });
        }
        if let Some(external) = source.filter(Node::is_external) {
            return Some(ExternalEndpoint {
                device_node: ls.target_node.clone(),
                device_interface: ls.target_interface.clone(),
                external,
            });
        }
        None
    }

    /// Connect one link whose endpoints are both running. Commits the
    /// resulting state (up or error) and broadcasts it.
    pub async fn connect_link(&self, lab: &Lab, ls: &LinkState) -> Result<(), LinkError> {
        let ls = self.refresh_endpoints(lab, ls);
        let result = if let Some(endpoint) = self.external_endpoint(lab, &ls) {
            self.connect_external(lab, &ls, endpoint).await
        } else if ls.is_cross_host {
            self.connect_cross_host(lab, &ls).await
        } else {
            self.connect_same_host(lab, &ls).await
        };

        let store = &self.ctx.store;
        match &result {
            Ok(()) => {}
            Err(e) => {
                let message = e.to_string();
                store.with_link_state(&lab.id, &ls.link_name, |row| {
                    row.actual_state = LinkActualState::Error;
                    row.error_message = Some(message.clone());
                });
                if let Some(row) = store.get_link_state(&lab.id, &ls.link_name) {
                    self.ctx.publish_link_state(&row);
                }
            }
        }
        result
    }

    async fn connect_same_host(&self, lab: &Lab, ls: &LinkState) -> Result<(), LinkError> {
        let host_id = ls
            .source_host_id
            .or(ls.target_host_id)
            .ok_or_else(|| LinkError::Unresolvable(ls.link_name.clone()))?;
        let host = self.online_host(host_id, &ls.source_node)?;

        let request = HotConnectRequest {
            lab_id: lab.id.to_string(),
            container_a: lab.container_name(&ls.source_node),
            interface_a: normalize_interface(&ls.source_interface),
            container_b: lab.container_name(&ls.target_node),
            interface_b: normalize_interface(&ls.target_interface),
            vlan_tag: ls.vlan_tag,
        };
        let result = self.ctx.agent.connect_link(&host, &request).await?;
        if !result.success {
            return Err(LinkError::Refused(
                result.error.unwrap_or_else(|| "hot-connect failed".to_string()),
            ));
        }

        let store = &self.ctx.store;
        store.with_link_state(&lab.id, &ls.link_name, |row| {
            row.actual_state = LinkActualState::Up;
            row.vlan_tag = result.vlan_tag.or(row.vlan_tag);
            row.error_message = None;
            row.set_oper_both(OperState::Up, None);
        });
        if let Some(row) = store.get_link_state(&lab.id, &ls.link_name) {
            self.ctx.publish_link_state(&row);
        }
        tracing::info!(lab_id = %lab.id, link = %ls.link_name, "same-host link connected");
        Ok(())
    }

    /// External network link: attach the device container's veth to the
    /// external node's pre-provisioned host interface, on the device's
    /// placed host. Same-host only; there is no far-side container.
    async fn connect_external(
        &self,
        lab: &Lab,
        ls: &LinkState,
        endpoint: ExternalEndpoint,
    ) -> Result<(), LinkError> {
        let store = &self.ctx.store;

        let interface_id = endpoint.external.managed_interface_id.ok_or_else(|| {
            LinkError::ManagedInterfaceMissing {
                node: endpoint.external.container_name.clone(),
            }
        })?;
        let interface = store.get_managed_interface(&interface_id).ok_or_else(|| {
            LinkError::ManagedInterfaceMissing {
                node: endpoint.external.container_name.clone(),
            }
        })?;

        // The device's placed host is where the attachment happens.
        let host_id = store
            .node_by_container_name(&lab.id, &endpoint.device_node)
            .and_then(|n| n.host_id)
            .or_else(|| {
                store
                    .get_placement(&lab.id, &endpoint.device_node)
                    .map(|p| p.host_id)
            })
            .ok_or_else(|| LinkError::Unresolvable(ls.link_name.clone()))?;
        let host = self.online_host(host_id, &endpoint.device_node)?;
        if interface.host_id != host.id {
            return Err(LinkError::ManagedInterfaceForeign {
                interface: interface.name.clone(),
                interface_host: interface.host_id.to_string(),
            });
        }

        let request = ExternalConnectRequest {
            lab_id: lab.id.to_string(),
            container_name: lab.container_name(&endpoint.device_node),
            interface_name: normalize_interface(&endpoint.device_interface),
            host_interface: interface.name.clone(),
            vlan_tag: ls.vlan_tag,
        };
        let result = self.ctx.agent.connect_external(&host, &request).await?;
        if !result.success {
            return Err(LinkError::Refused(
                result.error.unwrap_or_else(|| "external connect failed".to_string()),
            ));
        }

        store.with_link_state(&lab.id, &ls.link_name, |row| {
            row.actual_state = LinkActualState::Up;
            row.vlan_tag = result.vlan_tag.or(row.vlan_tag);
            row.source_host_id = Some(host.id);
            row.target_host_id = Some(host.id);
            row.is_cross_host = false;
            row.error_message = None;
            row.set_oper_both(OperState::Up, None);
        });
        if let Some(row) = store.get_link_state(&lab.id, &ls.link_name) {
            self.ctx.publish_link_state(&row);
        }
        tracing::info!(
            lab_id = %lab.id,
            link = %ls.link_name,
            host_interface = %interface.name,
            "external network link connected"
        );
        Ok(())
    }

    async fn connect_cross_host(&self, lab: &Lab, ls: &LinkState) -> Result<(), LinkError> {
        let (source_host_id, target_host_id) = match (ls.source_host_id, ls.target_host_id) {
            (Some(s), Some(t)) => (s, t),
            _ => return Err(LinkError::Unresolvable(ls.link_name.clone())),
        };
        let source_host = self.online_host(source_host_id, &ls.source_node)?;
        let target_host = self.online_host(target_host_id, &ls.target_node)?;

        let source_ip = source_host.data_plane_ip().to_string();
        let target_ip = target_host.data_plane_ip().to_string();

        let store = &self.ctx.store;
        let existing = store.get_tunnel(&lab.id, &ls.link_name);

        // Reuse the VNI on the existing row (or the link state) before
        // allocating a fresh one.
        let vni = existing
            .as_ref()
            .map(|t| t.vni)
            .or(ls.vni)
            .map(Ok)
            .unwrap_or_else(|| self.allocate_vni())?;
        let vlan_tag = Self::vni_to_vlan(vni);

        if let Some(tunnel) = &existing {
            if tunnel.status == TunnelStatus::Active
                && tunnel.matches_endpoints(source_host_id, target_host_id)
                && ls.actual_state == LinkActualState::Up
            {
                tracing::debug!(lab_id = %lab.id, link = %ls.link_name, "tunnel already active");
                return Ok(());
            }
        }

        // Setup both sides; each agent sees the other as remote.
        let base = CrossHostLinkRequest {
            lab_id: lab.id.to_string(),
            link_id: ls.link_name.clone(),
            container_name: lab.container_name(&ls.source_node),
            interface_name: normalize_interface(&ls.source_interface),
            local_ip: source_ip.clone(),
            remote_ip: target_ip.clone(),
            vni,
            vlan_tag,
            mtu: self.ctx.settings.overlay_mtu,
        };
        let source_result = self.ctx.agent.setup_cross_host_link(&source_host, &base).await;

        let target_request = CrossHostLinkRequest {
            container_name: lab.container_name(&ls.target_node),
            interface_name: normalize_interface(&ls.target_interface),
            local_ip: target_ip.clone(),
            remote_ip: source_ip.clone(),
            ..base
        };
        let target_result = self
            .ctx
            .agent
            .setup_cross_host_link(&target_host, &target_request)
            .await;

        let now_ms = self.ctx.now_ms();
        let mut tunnel = VxlanTunnel {
            id: existing.as_ref().map(|t| t.id).unwrap_or_else(TunnelId::new),
            lab_id: lab.id,
            link_name: ls.link_name.clone(),
            vni,
            vlan_tag,
            source_host_id,
            target_host_id,
            source_ip,
            target_ip,
            status: TunnelStatus::Active,
            error: None,
            created_at_ms: existing.as_ref().map(|t| t.created_at_ms).unwrap_or(now_ms),
        };

        let failure = match (&source_result, &target_result) {
            (Ok(s), Ok(t)) if s.success && t.success => None,
            (Ok(s), Ok(t)) => Some(
                s.error
                    .clone()
                    .or_else(|| t.error.clone())
                    .unwrap_or_else(|| "cross-host link setup refused".to_string()),
            ),
            (Err(e), _) | (_, Err(e)) => Some(e.to_string()),
        };

        if let Some(message) = failure {
            tunnel.status = TunnelStatus::Failed;
            tunnel.error = Some(message.clone());
            store.upsert_tunnel(tunnel);
            return Err(LinkError::Refused(message));
        }

        store.upsert_tunnel(tunnel);
        store.with_link_state(&lab.id, &ls.link_name, |row| {
            row.actual_state = LinkActualState::Up;
            row.vni = Some(vni);
            row.vlan_tag = Some(vlan_tag);
            row.error_message = None;
            row.set_oper_both(OperState::Up, None);
        });
        if let Some(row) = store.get_link_state(&lab.id, &ls.link_name) {
            self.ctx.publish_link_state(&row);
        }
        tracing::info!(
            lab_id = %lab.id,
            link = %ls.link_name,
            vni,
            vlan_tag,
            "cross-host link connected"
        );
        Ok(())
    }

    /// Connect every link whose desired state is up and whose endpoints
    /// are both running. Returns (ok, failed).
    pub async fn create_deployment_links(
        &self,
        lab: &Lab,
        log: &mut Vec<String>,
    ) -> (usize, usize) {
        self.ensure_link_states(lab);

        let store = &self.ctx.store;
        let node_states = store.node_states_for_lab(&lab.id);
        // External endpoints have no container; the host interface is
        // always there.
        let external = self.external_node_names(lab);
        let running = |name: &str| {
            external.contains(name)
                || node_states
                    .iter()
                    .any(|ns| ns.node_name == name && ns.actual_state == NodeActualState::Running)
        };

        let mut ok = 0;
        let mut failed = 0;
        for ls in store.link_states_for_lab(&lab.id) {
            if ls.desired_state != LinkDesiredState::Up
                || ls.actual_state == LinkActualState::Up
            {
                continue;
            }
            if !running(&ls.source_node) || !running(&ls.target_node) {
                log.push(format!("  link {}: endpoints not ready, deferred", ls.link_name));
                continue;
            }
            match self.connect_link(lab, &ls).await {
                Ok(()) => {
                    ok += 1;
                    log.push(format!("  link {}: up", ls.link_name));
                }
                Err(e) => {
                    failed += 1;
                    log.push(format!("  link {}: FAILED - {e}", ls.link_name));
                    tracing::warn!(lab_id = %lab.id, link = %ls.link_name, error = %e, "link setup failed");
                }
            }
        }
        (ok, failed)
    }

    /// Tear down overlay state on every placed host, then drop tunnel
    /// and link-state rows. Returns (ok, failed) per host cleanup.
    pub async fn teardown_deployment_links(
        &self,
        lab: &Lab,
        log: &mut Vec<String>,
    ) -> (usize, usize) {
        let store = &self.ctx.store;
        let mut ok = 0;
        let mut failed = 0;

        for host_id in store.placement_hosts_for_lab(&lab.id) {
            let host = match store.get_host(&host_id) {
                Some(h) => h,
                None => continue,
            };
            if !self.ctx.is_host_online(&host) {
                log.push(format!("  overlay cleanup skipped on offline host {}", host.name));
                continue;
            }
            match self.ctx.agent.cleanup_overlay(&host, lab.id.as_str()).await {
                Ok(result) => {
                    ok += 1;
                    log.push(format!(
                        "  overlay cleanup on {}: {} tunnels removed",
                        host.name, result.tunnels_deleted
                    ));
                }
                Err(e) => {
                    failed += 1;
                    log.push(format!("  overlay cleanup on {} FAILED: {e}", host.name));
                    tracing::warn!(host = %host.name, error = %e, "overlay cleanup failed");
                }
            }
        }

        store.delete_tunnels_for_lab(&lab.id);
        store.delete_link_states_for_lab(&lab.id);
        (ok, failed)
    }
}

#[cfg(test)]
#[path = "links_tests.rs"]
mod tests;
