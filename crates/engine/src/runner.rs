// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job dispatch and execution.
//!
//! A bounded pool of worker tasks executes jobs concurrently; within a
//! job, fan-out to multiple agents runs in parallel. Deploys and
//! destroys are the lab-wide paths; everything `sync:*` goes through
//! the node lifecycle manager. Monitors hand their created jobs here.

use crate::ctx::Ctx;
use crate::enforce::Enforcer;
use crate::extract::extract_before_destroy;
use crate::image_sync::ImageSyncService;
use crate::lifecycle::NodeLifecycle;
use crate::links::LinkOrchestrator;
use crate::topology::TopologyService;
use futures_util::future::join_all;
use lm_core::{
    Clock, Event, Host, JobAction, JobId, JobStatus, Lab, LabState, NodeActualState,
    NodeDesiredState, NodeState, PlacementStatus,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub struct JobRunner<C: Clock> {
    ctx: Arc<Ctx<C>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl<C: Clock> JobRunner<C> {
    pub fn new(ctx: Arc<Ctx<C>>, cancel: CancellationToken) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(ctx.settings.job_worker_permits));
        Arc::new(Self { ctx, permits, cancel })
    }

    /// Queue a job onto the worker pool.
    pub fn spawn(self: &Arc<Self>, job_id: JobId) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match runner.permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => return, // pool shut down
            };
            tokio::select! {
                _ = runner.cancel.cancelled() => {
                    tracing::debug!(job_id = %job_id, "job skipped: shutting down");
                }
                _ = runner.execute(job_id) => {}
            }
        });
    }

    /// Execute one job to completion, dispatching on its action.
    pub async fn execute(self: &Arc<Self>, job_id: JobId) {
        let Some(job) = self.ctx.store.get_job(&job_id) else {
            tracing::error!(job_id = %job_id, "job not found");
            return;
        };
        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "job already terminal");
            return;
        }
        let Some(lab) = self.ctx.store.get_lab(&job.lab_id) else {
            self.fail_early(&job_id, "lab not found");
            return;
        };

        // Explicit user operations clear enforcement cooldowns so the
        // new desired state takes effect immediately.
        if job.user_id.is_some() {
            let node_names: Vec<String> = self
                .ctx
                .store
                .node_states_for_lab(&lab.id)
                .into_iter()
                .map(|ns| ns.node_name)
                .collect();
            Enforcer::new(self.ctx.clone())
                .clear_cooldowns_for_lab(&lab.id, &node_names)
                .await;
        }

        match job.action.clone() {
            JobAction::Up => self.run_deploy(&job_id, &lab).await,
            JobAction::Down => self.run_destroy(&job_id, &lab).await,
            JobAction::SyncNode(node_id) => {
                self.run_sync(&job_id, lab, vec![node_id]).await;
            }
            JobAction::SyncBatch(_) | JobAction::SyncHost(_) | JobAction::ReconcileEnforce(_) => {
                let node_ids = if job.node_ids.is_empty() {
                    self.ctx
                        .store
                        .node_states_for_lab(&lab.id)
                        .into_iter()
                        .map(|ns| ns.node_id)
                        .collect()
                } else {
                    job.node_ids.clone()
                };
                self.run_sync(&job_id, lab, node_ids).await;
            }
            JobAction::Other(action) => {
                self.fail_early(&job_id, &format!("Unknown action: {action}"));
            }
        }
    }

    fn fail_early(&self, job_id: &JobId, reason: &str) {
        let now = self.ctx.now_ms();
        tracing::error!(job_id = %job_id, reason, "job failed before execution");
        self.ctx.store.with_job(job_id, |row| {
            row.status = JobStatus::Failed;
            row.completed_at_ms = Some(now);
            row.append_log(&format!("ERROR: {reason}"));
        });
    }

    async fn run_sync(self: &Arc<Self>, job_id: &JobId, lab: Lab, node_ids: Vec<String>) {
        let provider = lab.provider;
        let lifecycle = NodeLifecycle::new(
            self.ctx.clone(),
            *job_id,
            lab,
            node_ids,
            provider,
        );
        let outcome = lifecycle.execute().await;
        for child_id in outcome.spawned_children {
            self.spawn(child_id);
        }
    }

    /// Lab-wide deploy: preflight, placement analysis, parallel per-host
    /// deploy with rollback, link setup, placement/IP bookkeeping.
    async fn run_deploy(&self, job_id: &JobId, lab: &Lab) {
        let store = &self.ctx.store;
        let now = self.ctx.now_ms();
        let mut log: Vec<String> = Vec::new();

        self.ensure_node_states(lab, NodeDesiredState::Running);

        let topo = TopologyService::new(store);
        if !topo.has_nodes(&lab.id) {
            self.finish_deploy_failed(job_id, lab, &mut log, "No topology defined").await;
            return;
        }

        // Nodes without explicit placement get the default agent pinned
        // via a placement row so every later path resolves them the
        // same way.
        let mut analysis = topo.analyze_placements(&lab.id);
        if !analysis.unplaced.is_empty() {
            let Some(default_agent) = self.ctx.agent_for_lab(lab, &[]) else {
                self.finish_deploy_failed(
                    job_id,
                    lab,
                    &mut log,
                    &format!(
                        "{} nodes have no host assignment and no healthy agent available",
                        analysis.unplaced.len()
                    ),
                )
                .await;
                return;
            };
            log.push(format!(
                "{} unplaced node(s) assigned to {}",
                analysis.unplaced.len(),
                default_agent.name
            ));
            for node in std::mem::take(&mut analysis.unplaced) {
                store.upsert_placement(lm_core::NodePlacement {
                    lab_id: lab.id,
                    node_name: node.container_name.clone(),
                    node_definition_id: Some(node.id),
                    host_id: default_agent.id,
                    status: PlacementStatus::Starting,
                });
            }
            analysis = topo.analyze_placements(&lab.id);
        }

        // Resolve and preflight every target host.
        let mut hosts: Vec<Host> = Vec::new();
        let mut missing: Vec<String> = Vec::new();
        for host_id in analysis.placements.keys() {
            match store.get_host(host_id) {
                Some(host) if self.ctx.is_host_online(&host) => {
                    match self.ctx.agent.get_lab_status(&host, lab.id.as_str()).await {
                        Ok(_) => hosts.push(host),
                        Err(e) => missing
                            .push(format!("{host_id} (preflight connectivity failed: {e})")),
                    }
                }
                _ => missing.push(host_id.to_string()),
            }
        }
        if !missing.is_empty() {
            self.finish_deploy_failed(
                job_id,
                lab,
                &mut log,
                &format!("Missing or unhealthy agents for hosts: {}", missing.join(", ")),
            )
            .await;
            return;
        }

        // Pre-deploy image gate.
        if self.ctx.settings.image_sync_enabled && self.ctx.settings.image_sync_pre_deploy_check {
            let image_sync = ImageSyncService::new(self.ctx.clone());
            for host in &hosts {
                let (all_ready, missing_images) =
                    image_sync.ensure_images_for_deployment(lab, host).await;
                if !all_ready
                    && self.ctx.settings.image_sync_fallback_strategy
                        == lm_core::ImageSyncFallback::Fail
                {
                    let display: Vec<&str> =
                        missing_images.iter().take(5).map(String::as_str).collect();
                    let more = if missing_images.len() > 5 {
                        format!(" (+{} more)", missing_images.len() - 5)
                    } else {
                        String::new()
                    };
                    self.finish_deploy_failed(
                        job_id,
                        lab,
                        &mut log,
                        &format!(
                            "Preflight image check failed on {}.\nMissing images: {}{more}\nUpload/sync required images before retrying.",
                            host.name,
                            display.join(", ")
                        ),
                    )
                    .await;
                    return;
                }
            }
        }

        // Mark the job running and the lab starting.
        self.ctx.store.with_job(job_id, |row| {
            row.status = JobStatus::Running;
            row.started_at_ms = Some(now);
            row.last_heartbeat_ms = Some(now);
            row.agent_id = hosts.first().map(|h| h.id);
        });
        store.update_lab_state(&lab.id, LabState::Starting, None, now);
        self.publish_progress(job_id, lab, JobStatus::Running, "Deployment started");

        // Capacity gate across the host set.
        if self.ctx.settings.resource_validation_enabled {
            let mut report = crate::capacity::CapacityReport::default();
            for host in &hosts {
                let nodes = analysis.placements.get(&host.id).cloned().unwrap_or_default();
                report
                    .hosts
                    .push(crate::capacity::check_host_capacity(host, &nodes, &self.ctx.settings));
            }
            for warning in report.warnings() {
                log.push(format!("WARNING: {warning}"));
            }
            if !report.all_fit() {
                self.finish_deploy_failed(job_id, lab, &mut log, &report.error_message()).await;
                return;
            }
        }

        // Parallel per-host deploy.
        let deploys = join_all(hosts.iter().map(|host| {
            let topology = topo.build_deploy_topology(lab, &host.id);
            let agent = self.ctx.agent.clone();
            let job = job_id.to_string();
            async move {
                let result = agent.deploy_lab(host, &job, &topology, lab.provider).await;
                (topology, result)
            }
        }))
        .await;

        let mut deploy_ok = true;
        let mut succeeded_hosts: Vec<&Host> = Vec::new();
        for (host, (topology, result)) in hosts.iter().zip(&deploys) {
            log.push(format!("=== Host: {} ===", host.name));
            log.push(format!(
                "Nodes: {}",
                topology.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(", ")
            ));
            match result {
                Ok(outcome) => {
                    log.push(format!("Deploy to {}: {}", host.name, outcome.status));
                    if !outcome.stdout.is_empty() {
                        log.push(format!("STDOUT:\n{}", outcome.stdout.trim_end()));
                    }
                    if !outcome.stderr.is_empty() {
                        log.push(format!("STDERR:\n{}", outcome.stderr.trim_end()));
                    }
                    succeeded_hosts.push(host);
                }
                Err(e) => {
                    log.push(format!("Deploy to {} FAILED: {e}", host.name));
                    deploy_ok = false;
                }
            }
        }

        if !deploy_ok {
            // Rollback the hosts that succeeded so no orphans remain.
            log.push("=== Rollback: cleaning up partially deployed hosts ===".to_string());
            if succeeded_hosts.is_empty() {
                log.push("No hosts to rollback (all failed)".to_string());
            } else {
                let rollbacks = join_all(succeeded_hosts.iter().map(|host| {
                    self.ctx.agent.destroy_lab(host, job_id.as_str(), lab.id.as_str())
                }))
                .await;
                for (host, result) in succeeded_hosts.iter().zip(rollbacks) {
                    match result {
                        Ok(_) => log.push(format!("  {}: rollback completed", host.name)),
                        Err(e) => log.push(format!("  {}: rollback FAILED - {e}", host.name)),
                    }
                }
            }
            self.finish_deploy_failed(
                job_id,
                lab,
                &mut log,
                "Deployment failed on one or more hosts",
            )
            .await;
            return;
        }

        // Commit node states and placements for every deployed node.
        for (host, (topology, _)) in hosts.iter().zip(&deploys) {
            for node in &topology.nodes {
                store.with_node_state(&lab.id, &node.name, |row| {
                    row.desired_state = NodeDesiredState::Running;
                    row.mark_running(now);
                });
                store.upsert_placement(lm_core::NodePlacement {
                    lab_id: lab.id,
                    node_name: node.name.clone(),
                    node_definition_id: store
                        .node_by_container_name(&lab.id, &node.name)
                        .map(|n| n.id),
                    host_id: host.id,
                    status: PlacementStatus::Deployed,
                });
                if let Some(ns) = store.get_node_state(&lab.id, &node.name) {
                    self.ctx.publish_node_state(&ns, Some(host));
                }
            }
        }
        self.ctx.store.with_job(job_id, |row| {
            row.last_heartbeat_ms = Some(self.ctx.now_ms());
        });

        // Link setup under the link-ops lock.
        let lock_key = lm_adapters::keys::link_ops_lock(lab.id.as_str());
        let lock_acquired = self
            .ctx
            .coord
            .set_nx_ex(&lock_key, job_id.as_str(), std::time::Duration::from_secs(30))
            .await
            .unwrap_or(true);
        let (links_ok, links_failed) = if lock_acquired {
            let orchestrator = LinkOrchestrator::new(&self.ctx);
            let counts = orchestrator.create_deployment_links(lab, &mut log).await;
            let _ = self.ctx.coord.delete(&[lock_key]).await;
            counts
        } else {
            log.push("link ops lock held, link setup deferred to reconciliation".to_string());
            (0, 0)
        };

        if links_failed > 0 {
            log.push("=== Link Setup Summary ===".to_string());
            log.push(format!("Links: {links_ok} OK, {links_failed} failed"));
            log.push("Note: containers are deployed but some links failed.".to_string());
            self.finish_deploy_failed(
                job_id,
                lab,
                &mut log,
                &format!("Link setup failed: {links_failed} link(s)"),
            )
            .await;
            return;
        }

        // Capture management IPs for IaC consumers.
        for host in &hosts {
            if let Ok(status) = self.ctx.agent.get_lab_status(host, lab.id.as_str()).await {
                for container in status.nodes {
                    if container.ip_addresses.is_empty() {
                        continue;
                    }
                    store.with_node_state(&lab.id, &container.name, |row| {
                        row.management_ip = container.ip_addresses.first().cloned();
                        row.ip_addresses = container.ip_addresses.clone();
                    });
                }
            }
        }

        let now = self.ctx.now_ms();
        log.push("deploy completed".to_string());
        let log_text = log.join("\n");
        store.with_job(job_id, |row| {
            row.status = JobStatus::Completed;
            row.completed_at_ms = Some(now);
            row.log = Some(log_text.clone());
        });
        store.update_lab_state(&lab.id, LabState::Running, None, now);
        self.ctx.publish(Event::LabStateChanged {
            lab_id: lab.id,
            state: LabState::Running,
            state_error: None,
        });
        self.publish_progress(job_id, lab, JobStatus::Completed, "Deployment completed");
        tracing::info!(job_id = %job_id, lab_id = %lab.id, "deploy job completed");
    }

    /// Lab-wide destroy: config snapshots, overlay teardown, parallel
    /// per-host destroy, state cleanup. Partial failures complete with
    /// warnings so the operator knows cleanup may be incomplete.
    async fn run_destroy(&self, job_id: &JobId, lab: &Lab) {
        let store = &self.ctx.store;
        let now = self.ctx.now_ms();
        let mut log: Vec<String> = Vec::new();

        self.ctx.store.with_job(job_id, |row| {
            row.status = JobStatus::Running;
            row.started_at_ms = Some(now);
            row.last_heartbeat_ms = Some(now);
        });
        store.update_lab_state(&lab.id, LabState::Stopping, None, now);
        self.publish_progress(job_id, lab, JobStatus::Running, "Destroy started");

        extract_before_destroy(&self.ctx, lab).await;

        let mut host_ids = store.placement_hosts_for_lab(&lab.id);
        if let Some(agent_id) = lab.agent_id {
            host_ids.insert(agent_id);
        }
        let hosts: Vec<Host> = host_ids.iter().filter_map(|id| store.get_host(id)).collect();

        if hosts.is_empty() {
            self.finish_deploy_failed(job_id, lab, &mut log, "No agents found for destroy").await;
            return;
        }

        // Overlay teardown before containers go away.
        let orchestrator = LinkOrchestrator::new(&self.ctx);
        orchestrator.teardown_deployment_links(lab, &mut log).await;

        log.push("=== Destroying containers ===".to_string());
        let mut all_ok = true;
        let mut any_ok = false;
        let online: Vec<&Host> =
            hosts.iter().filter(|h| self.ctx.is_host_online(h)).collect();
        for host in &hosts {
            if !self.ctx.is_host_online(host) {
                log.push(format!("{}: skipped (offline)", host.name));
                all_ok = false;
            }
        }
        let results = join_all(
            online
                .iter()
                .map(|host| self.ctx.agent.destroy_lab(host, job_id.as_str(), lab.id.as_str())),
        )
        .await;
        for (host, result) in online.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    log.push(format!("{}: {}", host.name, outcome.status));
                    any_ok = true;
                }
                Err(e) => {
                    log.push(format!("{}: FAILED - {e}", host.name));
                    all_ok = false;
                }
            }
        }

        if !any_ok {
            self.finish_deploy_failed(job_id, lab, &mut log, "Destroy failed on all hosts").await;
            return;
        }

        // Converge the stored state to undeployed.
        for ns in store.node_states_for_lab(&lab.id) {
            store.with_node_state(&lab.id, &ns.node_name, |row| {
                row.desired_state = NodeDesiredState::Stopped;
                row.actual_state = NodeActualState::Undeployed;
                row.is_ready = false;
                row.starting_started_at_ms = None;
                row.stopping_started_at_ms = None;
                row.boot_started_at_ms = None;
                row.error_message = None;
                row.management_ip = None;
                row.ip_addresses.clear();
                row.reset_enforcement();
                row.updated_at_ms = now;
            });
            if let Some(updated) = store.get_node_state(&lab.id, &ns.node_name) {
                self.ctx.publish_node_state(&updated, None);
            }
        }
        store.delete_placements_for_lab(&lab.id);

        let now = self.ctx.now_ms();
        let status = if all_ok {
            JobStatus::Completed
        } else {
            log.push("WARNING: some hosts had issues during destroy".to_string());
            log.push("Containers may need manual cleanup on failed hosts.".to_string());
            JobStatus::CompletedWithWarnings
        };
        let log_text = log.join("\n");
        store.with_job(job_id, |row| {
            row.status = status;
            row.completed_at_ms = Some(now);
            row.log = Some(log_text.clone());
        });
        store.update_lab_state(&lab.id, LabState::Stopped, None, now);
        self.ctx.publish(Event::LabStateChanged {
            lab_id: lab.id,
            state: LabState::Stopped,
            state_error: None,
        });
        self.publish_progress(job_id, lab, status, "Destroy completed");
        tracing::info!(job_id = %job_id, lab_id = %lab.id, status = %status, "destroy job finished");
    }

    /// Create any missing node-state rows from the definitions, with
    /// the given desired state applied to all rows. External nodes have
    /// no container and get no convergence row.
    fn ensure_node_states(&self, lab: &Lab, desired: NodeDesiredState) {
        let store = &self.ctx.store;
        let now = self.ctx.now_ms();
        for node in store.nodes_for_lab(&lab.id) {
            if node.is_external() {
                continue;
            }
            match store.get_node_state(&lab.id, &node.container_name) {
                Some(_) => {
                    store.with_node_state(&lab.id, &node.container_name, |row| {
                        row.desired_state = desired;
                    });
                }
                None => {
                    store.upsert_node_state(NodeState {
                        lab_id: lab.id,
                        node_id: node.display_id.clone(),
                        node_name: node.container_name.clone(),
                        node_definition_id: Some(node.id),
                        desired_state: desired,
                        actual_state: NodeActualState::Undeployed,
                        is_ready: false,
                        starting_started_at_ms: None,
                        stopping_started_at_ms: None,
                        boot_started_at_ms: None,
                        error_message: None,
                        image_sync_status: None,
                        image_sync_message: None,
                        enforcement_attempts: 0,
                        last_enforcement_at_ms: None,
                        enforcement_failed_at_ms: None,
                        management_ip: None,
                        ip_addresses: Vec::new(),
                        updated_at_ms: now,
                    });
                }
            }
        }
    }

    async fn finish_deploy_failed(
        &self,
        job_id: &JobId,
        lab: &Lab,
        log: &mut Vec<String>,
        error: &str,
    ) {
        let now = self.ctx.now_ms();
        log.push(format!("ERROR: {error}"));
        let log_text = log.join("\n");
        self.ctx.store.with_job(job_id, |row| {
            row.status = JobStatus::Failed;
            row.completed_at_ms = Some(now);
            row.log = Some(log_text.clone());
        });
        self.ctx
            .store
            .update_lab_state(&lab.id, LabState::Error, Some(error), now);
        self.ctx.publish(Event::LabStateChanged {
            lab_id: lab.id,
            state: LabState::Error,
            state_error: Some(error.to_string()),
        });
        self.publish_progress(job_id, lab, JobStatus::Failed, error);
        tracing::error!(job_id = %job_id, lab_id = %lab.id, error, "lab-wide job failed");
    }

    fn publish_progress(&self, job_id: &JobId, lab: &Lab, status: JobStatus, message: &str) {
        if let Some(job) = self.ctx.store.get_job(job_id) {
            self.ctx.publish(Event::JobProgress {
                lab_id: lab.id,
                job_id: *job_id,
                action: job.action,
                status,
                progress_message: (status != JobStatus::Failed).then(|| message.to_string()),
                error_message: (status == JobStatus::Failed).then(|| message.to_string()),
            });
        }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
