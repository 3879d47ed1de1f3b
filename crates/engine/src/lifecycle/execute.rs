// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Categorization and per-category execution (phases 6–7).
//!
//! Categories run in order stop → deploy → start; a failure in one
//! category never blocks the others. Deploys go through the agent's
//! topology path by default (per-node mode behind a flag), guarded by
//! per-node deploy locks in the coordination store.

use super::NodeLifecycle;
use crate::topology::TopologyService;
use futures_util::future::join_all;
use lm_adapters::{keys, AgentError, DeployNode, DeployTopology};
use lm_core::{
    Clock, Host, HostId, NodeActualState, NodeDesiredState, PlacementStatus,
};
use std::collections::BTreeSet;
use std::time::Duration;

/// TTL for per-node deploy locks.
const DEPLOY_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct Categories {
    deploy: Vec<String>,
    start: Vec<String>,
    stop: Vec<String>,
}

impl<C: Clock> NodeLifecycle<C> {
    /// Phase 6: partition the surviving targets.
    fn categorize(&self) -> Categories {
        let mut categories = Categories::default();
        for node_name in &self.targets {
            let Some(ns) = self.node_state(node_name) else { continue };
            match (ns.desired_state, ns.actual_state) {
                (
                    NodeDesiredState::Running,
                    NodeActualState::Undeployed | NodeActualState::Pending,
                ) => categories.deploy.push(node_name.clone()),
                (
                    NodeDesiredState::Running,
                    NodeActualState::Stopped
                    | NodeActualState::Exited
                    | NodeActualState::Error
                    | NodeActualState::Starting,
                ) => categories.start.push(node_name.clone()),
                (
                    NodeDesiredState::Stopped,
                    NodeActualState::Running
                    | NodeActualState::Starting
                    | NodeActualState::Stopping,
                ) => categories.stop.push(node_name.clone()),
                _ => {}
            }
        }
        categories
    }

    /// Phase 7: run the categories, isolated from each other.
    pub(super) async fn run_categories(&mut self) {
        let categories = self.categorize();
        self.logf(format!(
            "categorized: {} stop, {} deploy, {} start",
            categories.stop.len(),
            categories.deploy.len(),
            categories.start.len()
        ));

        if !categories.stop.is_empty() {
            self.execute_stop(&categories.stop).await;
            self.heartbeat();
        }
        if !categories.deploy.is_empty() {
            if self.ctx.settings.per_node_lifecycle_enabled {
                self.execute_deploy_per_node(&categories.deploy).await;
            } else {
                self.execute_deploy_topology(&categories.deploy).await;
            }
            self.heartbeat();
        }
        if !categories.start.is_empty() {
            self.execute_start(&categories.start).await;
            self.heartbeat();
        }
    }

    /// Stop each node on its *current* host (placement, not the resolved
    /// target — a migrating node stops where it actually runs).
    async fn execute_stop(&mut self, node_names: &[String]) {
        let now = self.ctx.now_ms();

        let mut calls = Vec::new();
        for node_name in node_names {
            let host = self
                .ctx
                .store
                .get_placement(&self.lab.id, node_name)
                .and_then(|p| self.ctx.store.get_host(&p.host_id))
                .or_else(|| self.resolved.get(node_name).cloned());
            let Some(host) = host else {
                self.logf(format!("stop {node_name}: no host known, marking stopped"));
                self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                    row.mark_stopped(now);
                });
                self.publish_node(node_name);
                continue;
            };
            calls.push((node_name.clone(), host));
        }

        let results = join_all(calls.iter().map(|(node_name, host)| {
            let agent = self.ctx.agent.clone();
            let lab_id = self.lab.id;
            async move { agent.stop_node(host, lab_id.as_str(), node_name).await }
        }))
        .await;

        for ((node_name, _), result) in calls.iter().zip(results) {
            match result {
                Ok(_) => {
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.mark_stopped(now);
                    });
                    self.logf(format!("stop {node_name}: ok"));
                }
                Err(e) if e.is_transient() => {
                    // Preserve the observed state; job-health retries.
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.actual_state = NodeActualState::Running;
                        row.stopping_started_at_ms = None;
                        row.error_message = Some(format!("transient: {e}"));
                    });
                    self.logf(format!("stop {node_name}: transient failure - {e}"));
                }
                Err(e) => {
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.mark_error(e.to_string(), now);
                    });
                    self.logf(format!("stop {node_name}: FAILED - {e}"));
                }
            }
            self.publish_node(node_name);
        }
    }

    /// Topology-mode deploy: per-node locks, filtered topology, one
    /// deploy call per target host, orphan cleanup on former hosts.
    async fn execute_deploy_topology(&mut self, node_names: &[String]) {
        let now = self.ctx.now_ms();
        let Some(host) = node_names
            .iter()
            .find_map(|n| self.resolved.get(n))
            .cloned()
        else {
            return;
        };

        // Per-node deploy locks, fail-open on coordination errors: two
        // controllers racing is rarer than a flaky lock store, and the
        // agent serializes per-lab work anyway.
        let mut locked = Vec::new();
        let mut lock_conflicts = Vec::new();
        for node_name in node_names {
            let key = keys::deploy_lock(self.lab.id.as_str(), node_name);
            let value = format!("agent:{}:job:{}", host.id, self.job_id);
            match self.ctx.coord.set_nx_ex(&key, &value, DEPLOY_LOCK_TTL).await {
                Ok(true) | Err(_) => locked.push(node_name.clone()),
                Ok(false) => lock_conflicts.push(node_name.clone()),
            }
        }
        for node_name in &lock_conflicts {
            self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                row.mark_error("deploy lock held by a concurrent job", now);
            });
            self.publish_node(node_name);
            self.logf(format!("deploy {node_name}: lock held by concurrent job"));
        }
        if locked.is_empty() {
            return;
        }

        // Record intended placement before the deploy so the UI shows
        // the target host during the transition.
        self.record_starting_placements(&locked);

        // Hosts that previously held any of these nodes; orphan cleanup
        // targets after a successful deploy.
        let prior_hosts: BTreeSet<HostId> = self
            .ctx
            .store
            .placements_for_lab(&self.lab.id)
            .into_iter()
            .filter(|p| locked.contains(&p.node_name) && p.host_id != host.id)
            .map(|p| p.host_id)
            .collect();

        let topology = self.filtered_topology(&locked, &host);
        self.logf(format!(
            "deploying {} node(s) to host {}",
            topology.nodes.len(),
            host.name
        ));

        let deploy_result = self
            .ctx
            .agent
            .deploy_lab(&host, self.job_id.as_str(), &topology, self.provider)
            .await;

        match deploy_result {
            Ok(outcome) => {
                if !outcome.stdout.is_empty() {
                    self.logf(format!("=== STDOUT ===\n{}", outcome.stdout.trim_end()));
                }
                if !outcome.stderr.is_empty() {
                    self.logf(format!("=== STDERR ===\n{}", outcome.stderr.trim_end()));
                }
                for node_name in &locked {
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.mark_running(now);
                    });
                    self.ctx.store.upsert_placement(lm_core::NodePlacement {
                        lab_id: self.lab.id,
                        node_name: node_name.clone(),
                        node_definition_id: self
                            .ctx
                            .store
                            .get_node_state(&self.lab.id, node_name)
                            .and_then(|ns| ns.node_definition_id),
                        host_id: host.id,
                        status: PlacementStatus::Deployed,
                    });
                    self.publish_node(node_name);
                }
                self.logf("deploy completed");
                self.capture_node_ips(&host).await;
                self.probe_readiness(&host, &locked).await;
                self.cleanup_orphans(&prior_hosts, &host).await;
            }
            Err(e) if e.is_transient() => {
                for node_name in &locked {
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.error_message = Some(format!("transient: {e}"));
                    });
                    self.publish_node(node_name);
                }
                self.logf(format!("deploy: transient failure - {e}"));
            }
            Err(e) => {
                let message = agent_error_message(&e);
                for node_name in &locked {
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.mark_error(message.clone(), now);
                    });
                    self.publish_node(node_name);
                }
                self.logf(format!("deploy FAILED: {message}"));
            }
        }

        let lock_keys: Vec<String> = locked
            .iter()
            .map(|n| keys::deploy_lock(self.lab.id.as_str(), n))
            .collect();
        let _ = self.ctx.coord.delete(&lock_keys).await;
    }

    /// Per-node mode: create then start each node individually.
    async fn execute_deploy_per_node(&mut self, node_names: &[String]) {
        let now = self.ctx.now_ms();
        self.record_starting_placements(node_names);

        for node_name in node_names {
            let Some(host) = self.resolved.get(node_name).cloned() else { continue };
            let Some(def) = self.ctx.store.node_by_container_name(&self.lab.id, node_name)
            else {
                self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                    row.mark_error("node definition missing", now);
                });
                self.publish_node(node_name);
                continue;
            };

            let spec = DeployNode {
                name: def.container_name.clone(),
                device: def.device.clone(),
                image: def.image.clone(),
                memory_mb: def.memory_mb,
                cpu_cores: def.cpu_cores,
            };
            let created = self
                .ctx
                .agent
                .create_node(&host, self.lab.id.as_str(), &spec)
                .await;
            let started = match created {
                Ok(_) => {
                    self.ctx
                        .agent
                        .start_node(&host, self.lab.id.as_str(), node_name)
                        .await
                }
                Err(e) => Err(e),
            };

            match started {
                Ok(_) => {
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.mark_running(now);
                    });
                    self.ctx.store.set_placement_status(
                        &self.lab.id,
                        node_name,
                        PlacementStatus::Deployed,
                    );
                    self.logf(format!("deploy {node_name}: ok"));
                }
                Err(e) if e.is_transient() => {
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.error_message = Some(format!("transient: {e}"));
                    });
                    self.logf(format!("deploy {node_name}: transient failure - {e}"));
                }
                Err(e) => {
                    let message = agent_error_message(&e);
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.mark_error(message.clone(), now);
                    });
                    self.logf(format!("deploy {node_name}: FAILED - {message}"));
                }
            }
            self.publish_node(node_name);
        }
    }

    /// Start stopped/exited/errored nodes in place.
    async fn execute_start(&mut self, node_names: &[String]) {
        let now = self.ctx.now_ms();

        let mut calls = Vec::new();
        for node_name in node_names {
            let Some(host) = self.resolved.get(node_name).cloned() else { continue };
            calls.push((node_name.clone(), host));
        }

        let results = join_all(calls.iter().map(|(node_name, host)| {
            let agent = self.ctx.agent.clone();
            let lab_id = self.lab.id;
            async move { agent.start_node(host, lab_id.as_str(), node_name).await }
        }))
        .await;

        for ((node_name, host), result) in calls.iter().zip(results) {
            match result {
                Ok(_) => {
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.mark_running(now);
                        row.boot_started_at_ms = Some(now);
                        row.is_ready = false;
                    });
                    self.ctx.store.upsert_placement(lm_core::NodePlacement {
                        lab_id: self.lab.id,
                        node_name: node_name.clone(),
                        node_definition_id: self
                            .ctx
                            .store
                            .get_node_state(&self.lab.id, node_name)
                            .and_then(|ns| ns.node_definition_id),
                        host_id: host.id,
                        status: PlacementStatus::Deployed,
                    });
                    self.logf(format!("start {node_name}: ok"));
                }
                Err(e) if e.is_transient() => {
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.error_message = Some(format!("transient: {e}"));
                    });
                    self.logf(format!("start {node_name}: transient failure - {e}"));
                }
                Err(e) => {
                    let message = agent_error_message(&e);
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.mark_error(message.clone(), now);
                    });
                    self.logf(format!("start {node_name}: FAILED - {message}"));
                }
            }
            self.publish_node(node_name);
        }
    }

    /// Topology filtered to the targeted nodes plus the same-host links
    /// among them.
    fn filtered_topology(&self, node_names: &[String], host: &Host) -> DeployTopology {
        let topo = TopologyService::new(&self.ctx.store);
        let full = topo.build_deploy_topology(&self.lab, &host.id);
        let wanted: BTreeSet<&str> = node_names.iter().map(String::as_str).collect();
        DeployTopology {
            lab_id: full.lab_id,
            nodes: full
                .nodes
                .into_iter()
                .filter(|n| wanted.contains(n.name.as_str()))
                .collect(),
            links: full
                .links
                .into_iter()
                .filter(|l| {
                    wanted.contains(l.source_node.as_str())
                        && wanted.contains(l.target_node.as_str())
                })
                .collect(),
        }
    }

    /// First boot-readiness probe right after deploy; reconciliation
    /// keeps polling nodes that aren't ready yet.
    async fn probe_readiness(&mut self, host: &Host, node_names: &[String]) {
        for node_name in node_names {
            match self
                .ctx
                .agent
                .check_node_readiness(host, self.lab.id.as_str(), node_name)
                .await
            {
                Ok(true) => {
                    self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                        row.is_ready = true;
                    });
                    self.publish_node(node_name);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(node = %node_name, error = %e, "readiness probe failed");
                }
            }
        }
    }

    /// Capture management IPs from the agent's status report
    /// (best-effort; never fails the job).
    async fn capture_node_ips(&mut self, host: &Host) {
        let status = match self.ctx.agent.get_lab_status(host, self.lab.id.as_str()).await {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(lab_id = %self.lab.id, error = %e, "IP capture skipped");
                return;
            }
        };
        for container in status.nodes {
            if container.ip_addresses.is_empty() {
                continue;
            }
            self.ctx.store.with_node_state(&self.lab.id, &container.name, |row| {
                row.management_ip = container.ip_addresses.first().cloned();
                row.ip_addresses = container.ip_addresses.clone();
            });
        }
    }

    /// Destroy leftover containers on hosts that used to run these
    /// nodes (post-migration cleanup; this path is authoritative,
    /// reconciliation's misplacement check only observes).
    async fn cleanup_orphans(&mut self, prior_hosts: &BTreeSet<HostId>, new_host: &Host) {
        for host_id in prior_hosts {
            if *host_id == new_host.id {
                continue;
            }
            let Some(old_host) = self.ctx.store.get_host(host_id) else { continue };
            if !self.ctx.is_host_online(&old_host) {
                self.logf(format!(
                    "orphan cleanup skipped on offline host {}",
                    old_host.name
                ));
                continue;
            }
            match self
                .ctx
                .agent
                .destroy_lab(&old_host, self.job_id.as_str(), self.lab.id.as_str())
                .await
            {
                Ok(_) => {
                    self.logf(format!("orphan cleanup on {}: ok", old_host.name));
                    self.ctx
                        .store
                        .delete_placements_for_lab_host(&self.lab.id, host_id);
                }
                Err(e) => {
                    self.logf(format!("orphan cleanup on {} failed: {e}", old_host.name));
                    tracing::warn!(host = %old_host.name, error = %e, "orphan cleanup failed");
                }
            }
        }
    }
}

fn agent_error_message(error: &AgentError) -> String {
    match error {
        AgentError::Job { message, stderr, .. } => match stderr {
            Some(stderr) if !stderr.is_empty() => format!("{message}\n{stderr}"),
            _ => message.clone(),
        },
        other => other.to_string(),
    }
}
