// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent resolution, resource checks, and migration (phases 3–5).

use super::NodeLifecycle;
use crate::capacity::{check_host_capacity, CapacityReport};
use lm_core::{Clock, Host, HostId, Node, NodeDesiredState, PlacementStatus};
use std::collections::HashMap;

impl<C: Clock> NodeLifecycle<C> {
    fn node_def_for(&self, node_name: &str) -> Option<Node> {
        let store = &self.ctx.store;
        let ns = store.get_node_state(&self.lab.id, node_name)?;
        if let Some(id) = ns.node_definition_id {
            if let Some(def) = store.get_node(&id) {
                return Some(def);
            }
        }
        let def = store.node_by_container_name(&self.lab.id, node_name);
        // Link the FK for future lookups.
        if let Some(def) = &def {
            if ns.node_definition_id.is_none() {
                let def_id = def.id;
                store.with_node_state(&self.lab.id, node_name, |row| {
                    row.node_definition_id = Some(def_id);
                });
            }
        }
        def
    }

    /// Phase 3: pick a target host per node. Explicit assignments are
    /// honored or failed — never substituted. Nodes routed to secondary
    /// hosts move into child jobs; the primary host's nodes stay here.
    pub(super) async fn resolve_agents(&mut self, targets: Vec<String>) -> Vec<String> {
        let mut by_host: Vec<(HostId, Host, Vec<String>)> = Vec::new();
        let now = self.ctx.now_ms();

        for node_name in targets {
            let Some(ns) = self.node_state(&node_name) else { continue };
            let node_def = self.node_def_for(&node_name);

            // Explicit placement: the user's intent is authoritative.
            if let Some(host_id) = node_def.as_ref().and_then(|d| d.host_id) {
                let host = self.ctx.store.get_host(&host_id);
                let online = host.as_ref().map(|h| self.ctx.is_host_online(h)).unwrap_or(false);
                if !online {
                    let host_name = host
                        .as_ref()
                        .map(|h| h.name.clone())
                        .unwrap_or_else(|| host_id.to_string());
                    let message = format!("explicit host {host_name} offline");
                    self.ctx.store.with_node_state(&self.lab.id, &node_name, |row| {
                        row.mark_error(message.clone(), now);
                    });
                    self.publish_node(&node_name);
                    self.logf(format!("node {node_name}: {message}"));
                    continue;
                }
                let host = match host {
                    Some(h) => h,
                    None => continue,
                };
                Self::push_host_node(&mut by_host, host, node_name);
                continue;
            }

            // Free placement: affinity → lab default → any healthy.
            match self.ctx.agent_for_node(&self.lab, node_def.as_ref(), &ns) {
                Some(host) => Self::push_host_node(&mut by_host, host, node_name),
                None => {
                    self.ctx.store.with_node_state(&self.lab.id, &node_name, |row| {
                        row.mark_error("No agent available", now);
                    });
                    self.publish_node(&node_name);
                    self.logf(format!("node {node_name}: no agent available"));
                }
            }
        }

        if by_host.is_empty() {
            return Vec::new();
        }

        // Keep the first host's nodes; spawn children for the rest.
        let mut iter = by_host.into_iter();
        let (_, primary_host, primary_nodes) = match iter.next() {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        for (_, host, node_names) in iter {
            let child_node_ids: Vec<String> = node_names
                .iter()
                .filter_map(|name| self.node_state(name).map(|ns| ns.node_id))
                .collect();
            self.spawn_child_job(&host, child_node_ids);
        }

        self.logf(format!(
            "resolved {} node(s) to host {}",
            primary_nodes.len(),
            primary_host.name
        ));
        for node_name in &primary_nodes {
            self.resolved.insert(node_name.clone(), primary_host.clone());
        }
        primary_nodes
    }

    fn push_host_node(
        by_host: &mut Vec<(HostId, Host, Vec<String>)>,
        host: Host,
        node_name: String,
    ) {
        if let Some((_, _, nodes)) = by_host.iter_mut().find(|(id, _, _)| *id == host.id) {
            nodes.push(node_name);
        } else {
            by_host.push((host.id, host.clone(), vec![node_name]));
        }
    }

    /// Phase 4: capacity gate for the nodes that will deploy or start
    /// on the chosen host. Explicit-host nodes never fall back on
    /// capacity failure — they error.
    pub(super) fn check_resources(&mut self, targets: Vec<String>) -> Vec<String> {
        if !self.ctx.settings.resource_validation_enabled {
            return targets;
        }

        let now = self.ctx.now_ms();
        let mut defs_by_host: HashMap<HostId, Vec<Node>> = HashMap::new();
        let mut host_for_node: HashMap<String, HostId> = HashMap::new();
        for node_name in &targets {
            let Some(ns) = self.node_state(node_name) else { continue };
            // Only nodes that will consume new resources count.
            if ns.desired_state != NodeDesiredState::Running {
                continue;
            }
            let Some(host) = self.resolved.get(node_name) else { continue };
            if let Some(def) = self.node_def_for(node_name) {
                defs_by_host.entry(host.id).or_default().push(def);
                host_for_node.insert(node_name.clone(), host.id);
            }
        }

        let mut report = CapacityReport::default();
        let mut over_capacity_hosts: Vec<HostId> = Vec::new();
        for (host_id, nodes) in &defs_by_host {
            let Some(host) = self.ctx.store.get_host(host_id) else { continue };
            let capacity = check_host_capacity(&host, nodes, &self.ctx.settings);
            if !capacity.fits {
                over_capacity_hosts.push(*host_id);
            }
            report.hosts.push(capacity);
        }

        for warning in report.warnings() {
            tracing::warn!(lab_id = %self.lab.id, "{warning}");
            self.logf(format!("WARNING: {warning}"));
        }

        if over_capacity_hosts.is_empty() {
            return targets;
        }

        let message = report.error_message();
        self.logf(message.clone());
        let mut surviving = Vec::new();
        for node_name in targets {
            match host_for_node.get(&node_name) {
                Some(host_id) if over_capacity_hosts.contains(host_id) => {
                    self.ctx.store.with_node_state(&self.lab.id, &node_name, |row| {
                        row.mark_error(message.clone(), now);
                    });
                    self.publish_node(&node_name);
                }
                _ => surviving.push(node_name),
            }
        }
        surviving
    }

    /// Phase 5: nodes placed on a different host than resolved get the
    /// old container stopped (best-effort) and the placement dropped;
    /// the deploy phase recreates it on the new host.
    pub(super) async fn handle_migrations(&mut self, targets: &[String]) {
        for node_name in targets {
            let Some(target_host) = self.resolved.get(node_name).cloned() else { continue };
            let Some(placement) = self.ctx.store.get_placement(&self.lab.id, node_name) else {
                continue;
            };
            if placement.host_id == target_host.id {
                continue;
            }

            self.logf(format!(
                "node {node_name}: migrating {} -> {}",
                placement.host_id, target_host.id
            ));
            tracing::info!(
                lab_id = %self.lab.id,
                node = %node_name,
                from = %placement.host_id,
                to = %target_host.id,
                "migrating node"
            );

            if let Some(old_host) = self.ctx.store.get_host(&placement.host_id) {
                if self.ctx.is_host_online(&old_host) {
                    if let Err(e) = self
                        .ctx
                        .agent
                        .stop_node(&old_host, self.lab.id.as_str(), node_name)
                        .await
                    {
                        self.logf(format!(
                            "  old-host stop failed (continuing): {e}"
                        ));
                    }
                } else {
                    self.logf(format!(
                        "  old host {} offline, skipping container stop",
                        old_host.name
                    ));
                }
            }

            self.ctx.store.delete_placement(&self.lab.id, node_name);
        }
    }

    /// Record the chosen target host early so the UI shows it during
    /// the transition.
    pub(super) fn record_starting_placements(&self, node_names: &[String]) {
        for node_name in node_names {
            let Some(host) = self.resolved.get(node_name) else { continue };
            let node_def_id = self
                .ctx
                .store
                .get_node_state(&self.lab.id, node_name)
                .and_then(|ns| ns.node_definition_id);
            self.ctx.store.upsert_placement(lm_core::NodePlacement {
                lab_id: self.lab.id,
                node_name: node_name.clone(),
                node_definition_id: node_def_id,
                host_id: host.id,
                status: PlacementStatus::Starting,
            });
        }
    }
}
