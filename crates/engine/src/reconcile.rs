// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State reconciliation: converge the store's view with agent reality.
//!
//! Read-mostly: observes container state and rewrites `actual_state`,
//! placements, lab state, and link states. It only *creates* work via
//! the enforcement trigger (one job per out-of-sync lab). An agent that
//! fails to respond never erases state — nodes expected on an unqueried
//! host keep their last known truth.

use crate::ctx::Ctx;
use crate::links::LinkOrchestrator;
use crate::topology::TopologyService;
use lm_adapters::keys;
use lm_core::{
    Clock, Event, Host, HostId, Job, JobAction, JobId, Lab, LabId, LabState, LabStateMachine,
    LinkActualState, LinkDerivation, LinkDesiredState, LinkStateMachine, NodeActualState,
    NodeDesiredState, NodeStateMachine,
};
use lm_storage::state::count_states;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// TTL for the per-lab reconciliation lock.
const RECONCILE_LOCK_TTL: Duration = Duration::from_secs(60);

pub struct Reconciler<C: Clock> {
    ctx: Arc<Ctx<C>>,
}

impl<C: Clock> Reconciler<C> {
    pub fn new(ctx: Arc<Ctx<C>>) -> Self {
        Self { ctx }
    }

    /// One reconciliation pass. Returns enforcement jobs the runner
    /// must schedule.
    pub async fn run_once(&self) -> Vec<JobId> {
        // Readiness polling runs first and unconditionally — it is
        // non-destructive and useful even while jobs are active.
        self.poll_readiness().await;

        let labs = self.select_labs();
        if labs.is_empty() {
            return Vec::new();
        }
        tracing::info!(count = labs.len(), "reconciling labs");

        let mut enforcement_jobs = Vec::new();
        for lab_id in labs {
            match self.reconcile_lab(&lab_id).await {
                Ok(mut jobs) => enforcement_jobs.append(&mut jobs),
                Err(e) => {
                    tracing::error!(lab_id = %lab_id, error = %e, "failed to reconcile lab");
                }
            }
        }
        enforcement_jobs
    }

    /// Labs that need a look: transitional, stuck-pending, unready,
    /// errored, out-of-sync, or running without placement.
    fn select_labs(&self) -> BTreeSet<LabId> {
        let store = &self.ctx.store;
        let settings = &self.ctx.settings;
        let now = self.ctx.now_ms();
        let mut labs = BTreeSet::new();

        for lab in store.labs_in_states(&[LabState::Starting, LabState::Stopping, LabState::Unknown])
        {
            labs.insert(lab.id);
        }
        for ns in store.stale_pending_nodes(now, settings.stale_pending_threshold * 1000) {
            labs.insert(ns.lab_id);
        }
        for ns in store.unready_running_nodes() {
            labs.insert(ns.lab_id);
        }
        for ns in store.error_nodes() {
            labs.insert(ns.lab_id);
        }
        for ns in store.desired_running_but_down() {
            labs.insert(ns.lab_id);
        }
        for ns in store.running_nodes_without_placement() {
            labs.insert(ns.lab_id);
        }

        labs
    }

    /// Poll boot readiness for running-but-unready nodes.
    async fn poll_readiness(&self) {
        let store = &self.ctx.store;
        let now = self.ctx.now_ms();

        let mut by_lab: HashMap<LabId, Vec<String>> = HashMap::new();
        for ns in store.unready_running_nodes() {
            // Nodes with a permanent-failure marker are left alone.
            if ns.enforcement_failed_at_ms.is_some() {
                continue;
            }
            by_lab.entry(ns.lab_id).or_default().push(ns.node_name);
        }

        for (lab_id, node_names) in by_lab {
            let Some(lab) = store.get_lab(&lab_id) else { continue };
            for node_name in node_names {
                store.with_node_state(&lab_id, &node_name, |row| {
                    if row.boot_started_at_ms.is_none() {
                        row.boot_started_at_ms = Some(now);
                    }
                });

                let host = store
                    .get_placement(&lab_id, &node_name)
                    .and_then(|p| store.get_host(&p.host_id))
                    .filter(|h| self.ctx.is_host_online(h))
                    .or_else(|| self.ctx.agent_for_lab(&lab, &[]));
                let Some(host) = host else { continue };

                match self
                    .ctx
                    .agent
                    .check_node_readiness(&host, lab_id.as_str(), &node_name)
                    .await
                {
                    Ok(true) => {
                        store.with_node_state(&lab_id, &node_name, |row| {
                            row.is_ready = true;
                        });
                        if let Some(ns) = store.get_node_state(&lab_id, &node_name) {
                            self.ctx.publish_node_state(&ns, Some(&host));
                        }
                        tracing::info!(lab_id = %lab_id, node = %node_name, "node is now ready");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::debug!(node = %node_name, error = %e, "readiness check failed");
                    }
                }
            }
        }
    }

    /// Reconcile one lab under the distributed lock. Fail-closed: no
    /// lock (or no coordination store) means no pass.
    async fn reconcile_lab(&self, lab_id: &LabId) -> Result<Vec<JobId>, String> {
        let Some(lab) = self.ctx.store.get_lab(lab_id) else {
            return Ok(Vec::new());
        };

        let lock_key = keys::reconcile_lock(lab_id.as_str());
        match self.ctx.coord.set_nx_ex(&lock_key, "1", RECONCILE_LOCK_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(lab_id = %lab_id, "reconcile lock held, skipping");
                return Ok(Vec::new());
            }
            Err(e) => {
                tracing::warn!(lab_id = %lab_id, error = %e, "coordination store unavailable, skipping pass");
                return Ok(Vec::new());
            }
        }

        let result = self.do_reconcile(&lab).await;
        let _ = self.ctx.coord.delete(&[lock_key]).await;
        result
    }

    async fn do_reconcile(&self, lab: &Lab) -> Result<Vec<JobId>, String> {
        let store = &self.ctx.store;
        let now = self.ctx.now_ms();
        let lab_id = lab.id;

        // An active job inside its timeout window owns the lab.
        if let Some(job) = store.any_active_job_for_lab(&lab_id) {
            if !job.is_stuck(now) {
                tracing::debug!(lab_id = %lab_id, job_id = %job.id, "active job, skipping reconciliation");
                return Ok(Vec::new());
            }
            tracing::warn!(
                lab_id = %lab_id,
                job_id = %job.id,
                action = %job.action,
                "stuck job detected, proceeding with reconciliation"
            );
        }

        let orchestrator = LinkOrchestrator::new(&self.ctx);
        let created = orchestrator.ensure_link_states(lab);
        if created > 0 {
            tracing::info!(lab_id = %lab_id, created, "created link states");
        }

        let topo = TopologyService::new(store);
        let normalized = topo.normalize_links_for_lab(&lab_id);
        if normalized > 0 {
            tracing::info!(lab_id = %lab_id, normalized, "normalized link interfaces");
        }

        let backfilled = store.backfill_placement_node_ids(&lab_id);
        if backfilled > 0 {
            tracing::info!(lab_id = %lab_id, backfilled, "backfilled placement node ids");
        }

        // Hosts involved: placements plus the lab default, else any
        // healthy agent as a fallback.
        let mut host_ids = store.placement_hosts_for_lab(&lab_id);
        if let Some(agent_id) = lab.agent_id {
            host_ids.insert(agent_id);
        }
        if host_ids.is_empty() {
            if let Some(host) = self.ctx.agent_for_lab(lab, &[]) {
                host_ids.insert(host.id);
            }
        }
        if host_ids.is_empty() {
            tracing::warn!(lab_id = %lab_id, "no agent available to reconcile lab");
            return Ok(Vec::new());
        }

        // Expected host per node, for safe undeployed detection.
        let expected_host: HashMap<String, HostId> = store
            .placements_for_lab(&lab_id)
            .into_iter()
            .map(|p| (p.node_name, p.host_id))
            .collect();

        // Query every involved host.
        let mut container_status: HashMap<String, String> = HashMap::new();
        let mut container_host: HashMap<String, HostId> = HashMap::new();
        let mut queried: BTreeSet<HostId> = BTreeSet::new();
        let mut hosts: HashMap<HostId, Host> = HashMap::new();

        for host_id in &host_ids {
            let Some(host) = store.get_host(host_id) else { continue };
            if !self.ctx.is_host_online(&host) {
                tracing::debug!(host = %host.name, "host offline, skipping in reconciliation");
                continue;
            }
            hosts.insert(*host_id, host.clone());

            match self.ctx.agent.get_lab_status(&host, lab_id.as_str()).await {
                Ok(status) => {
                    match &status.error {
                        None => {
                            queried.insert(*host_id);
                            store.clear_host_error(host_id);
                        }
                        Some(agent_error) => {
                            // Partial data may still be present, but the
                            // host cannot be trusted for absence checks.
                            tracing::warn!(
                                host = %host.name,
                                lab_id = %lab_id,
                                error = %agent_error,
                                "agent returned error for lab status"
                            );
                            store.set_host_error(host_id, agent_error, now);
                        }
                    }
                    for container in status.nodes {
                        container_status.insert(container.name.clone(), container.status);
                        container_host.insert(container.name, *host_id);
                    }
                }
                Err(e) => {
                    tracing::warn!(host = %host.name, lab_id = %lab_id, error = %e, "failed to query agent");
                    store.set_host_error(host_id, &format!("Query failed: {e}"), now);
                }
            }
        }

        // Merge observed container state into node states.
        self.apply_observations(
            lab,
            &container_status,
            &container_host,
            &queried,
            &expected_host,
            &hosts,
        )
        .await;

        // Placement repair, guarded against perpetuating misplacement.
        self.repair_placements(&lab_id, &container_host);

        // Recompute the lab state.
        let node_states = store.node_states_for_lab(&lab_id);
        let counts = count_states(&node_states);
        let new_state = LabStateMachine::compute(counts);
        let error_text = (new_state == LabState::Error)
            .then(|| format!("{} node(s) in error state", counts.error));
        let old_state = lab.state;
        store.update_lab_state(&lab_id, new_state, error_text.as_deref(), now);
        if new_state != old_state {
            tracing::info!(lab_id = %lab_id, from = %old_state, to = %new_state, "reconciled lab state");
            self.ctx.publish(Event::LabStateChanged {
                lab_id,
                state: new_state,
                state_error: error_text,
            });
        }

        // Link-state derivation and auto-connect.
        self.reconcile_links(lab).await;

        // Drop links marked for deletion.
        for name in store.delete_marked_link_states(&lab_id) {
            tracing::info!(lab_id = %lab_id, link = %name, "deleted link state");
        }

        // Enforcement trigger: one job per lab when observed ≠ desired
        // and nobody is working on it.
        Ok(self.trigger_enforcement(lab))
    }

    async fn apply_observations(
        &self,
        lab: &Lab,
        container_status: &HashMap<String, String>,
        container_host: &HashMap<String, HostId>,
        queried: &BTreeSet<HostId>,
        expected_host: &HashMap<String, HostId>,
        hosts: &HashMap<HostId, Host>,
    ) {
        let store = &self.ctx.store;
        let settings = &self.ctx.settings;
        let now = self.ctx.now_ms();
        let grace_ms = settings.transitional_grace * 1000;
        let lab_id = lab.id;
        let active_job = store.any_active_job_for_lab(&lab_id);

        for ns in store.node_states_for_lab(&lab_id) {
            // Permanent-failure guard: reconciliation never overwrites a
            // node that exhausted enforcement.
            if ns.enforcement_failed_at_ms.is_some() {
                continue;
            }

            // In-flight stop/start inside the grace window belongs to
            // its job; past the window the stale stamp is cleared and
            // normal reconciliation resumes.
            if let Some(at) = ns.stopping_started_at_ms {
                if now.saturating_sub(at) < grace_ms {
                    continue;
                }
                tracing::warn!(lab_id = %lab_id, node = %ns.node_name, "stale stopping stamp, recovering");
                store.with_node_state(&lab_id, &ns.node_name, |row| {
                    row.stopping_started_at_ms = None;
                });
            }
            if let Some(at) = ns.starting_started_at_ms {
                if now.saturating_sub(at) < grace_ms {
                    continue;
                }
                tracing::warn!(lab_id = %lab_id, node = %ns.node_name, "stale starting stamp, recovering");
                store.with_node_state(&lab_id, &ns.node_name, |row| {
                    row.starting_started_at_ms = None;
                });
            }

            // Transitional without a stamp: an active job still owns it.
            if ns.actual_state.is_transitional()
                && ns.stopping_started_at_ms.is_none()
                && ns.starting_started_at_ms.is_none()
                && active_job.is_some()
                && ns.actual_state != NodeActualState::Pending
            {
                continue;
            }

            let old_state = ns.actual_state;
            let old_ready = ns.is_ready;

            match container_status.get(&ns.node_name) {
                Some(status) => {
                    let observed = NodeStateMachine::from_container_status(status);
                    match observed {
                        NodeActualState::Running => {
                            store.with_node_state(&lab_id, &ns.node_name, |row| {
                                row.mark_running(now);
                            });
                        }
                        NodeActualState::Error => {
                            let message = format!("Container status: {status}");
                            store.with_node_state(&lab_id, &ns.node_name, |row| {
                                row.mark_error(message.clone(), now);
                            });
                        }
                        _ => {
                            store.with_node_state(&lab_id, &ns.node_name, |row| {
                                row.mark_stopped(now);
                            });
                        }
                    }
                }
                None => {
                    // Absent from every report. Only conclude undeployed
                    // when the host that should have it actually answered.
                    let expected = expected_host.get(&ns.node_name);
                    let trustworthy = match expected {
                        Some(host_id) => queried.contains(host_id),
                        None => !queried.is_empty(),
                    };
                    if trustworthy {
                        store.with_node_state(&lab_id, &ns.node_name, |row| {
                            if !matches!(
                                row.actual_state,
                                NodeActualState::Undeployed | NodeActualState::Stopped
                            ) {
                                row.actual_state = NodeActualState::Undeployed;
                                row.error_message = None;
                            }
                            row.is_ready = false;
                            row.boot_started_at_ms = None;
                            row.updated_at_ms = now;
                        });
                    } else {
                        tracing::debug!(
                            lab_id = %lab_id,
                            node = %ns.node_name,
                            "expected host not queried, preserving state"
                        );
                    }
                }
            }

            let Some(updated) = store.get_node_state(&lab_id, &ns.node_name) else { continue };
            if updated.actual_state != old_state || (updated.is_ready && !old_ready) {
                tracing::info!(
                    lab_id = %lab_id,
                    node = %ns.node_name,
                    from = %old_state,
                    to = %updated.actual_state,
                    "reconciled node state"
                );
                let host = container_host
                    .get(&ns.node_name)
                    .and_then(|id| hosts.get(id));
                self.ctx.publish_node_state(&updated, host);
            }
        }
    }

    /// Align placements with observed container locations. A container
    /// observed on a host that contradicts the node's explicit
    /// assignment is logged loudly and left alone — moving the
    /// placement would perpetuate the misplacement.
    fn repair_placements(&self, lab_id: &LabId, container_host: &HashMap<String, HostId>) {
        let store = &self.ctx.store;

        for (node_name, observed_host) in container_host {
            let node_def = store.node_by_container_name(lab_id, node_name);

            if let Some(def) = &node_def {
                if let Some(intended) = def.host_id {
                    if intended != *observed_host {
                        tracing::warn!(
                            lab_id = %lab_id,
                            node = %node_name,
                            observed = %observed_host,
                            intended = %intended,
                            "MISPLACED CONTAINER: refusing placement update, container may need cleanup"
                        );
                        continue;
                    }
                }
            }

            match store.get_placement(lab_id, node_name) {
                Some(placement) if placement.host_id == *observed_host => {
                    if placement.node_definition_id.is_none() {
                        if let Some(def) = &node_def {
                            let def_id = def.id;
                            store.upsert_placement(lm_core::NodePlacement {
                                node_definition_id: Some(def_id),
                                ..placement
                            });
                        }
                    }
                }
                Some(placement) => {
                    tracing::info!(
                        lab_id = %lab_id,
                        node = %node_name,
                        from = %placement.host_id,
                        to = %observed_host,
                        "updating placement to observed host"
                    );
                    store.upsert_placement(lm_core::NodePlacement {
                        lab_id: *lab_id,
                        node_name: node_name.clone(),
                        node_definition_id: placement
                            .node_definition_id
                            .or_else(|| node_def.as_ref().map(|d| d.id)),
                        host_id: *observed_host,
                        status: lm_core::PlacementStatus::Deployed,
                    });
                }
                None => {
                    tracing::info!(
                        lab_id = %lab_id,
                        node = %node_name,
                        host = %observed_host,
                        "creating placement from observed container"
                    );
                    store.upsert_placement(lm_core::NodePlacement {
                        lab_id: *lab_id,
                        node_name: node_name.clone(),
                        node_definition_id: node_def.map(|d| d.id),
                        host_id: *observed_host,
                        status: lm_core::PlacementStatus::Deployed,
                    });
                }
            }
        }
    }

    /// Recompute link actual states from endpoints + tunnels, then
    /// auto-connect eligible links under the link-ops lock.
    async fn reconcile_links(&self, lab: &Lab) {
        let store = &self.ctx.store;
        let lab_id = lab.id;

        let node_actual: HashMap<String, NodeActualState> = store
            .node_states_for_lab(&lab_id)
            .into_iter()
            .map(|ns| (ns.node_name, ns.actual_state))
            .collect();
        // External nodes have no container to observe; the host
        // interface they stand for counts as running.
        let external = LinkOrchestrator::new(&self.ctx).external_node_names(lab);
        let actual_of = |name: &str| {
            if external.contains(name) {
                return NodeActualState::Running;
            }
            node_actual
                .get(name)
                .copied()
                .unwrap_or(NodeActualState::Undeployed)
        };

        let mut to_connect = Vec::new();
        for ls in store.link_states_for_lab(&lab_id) {
            let derivation = LinkDerivation {
                source_actual: actual_of(&ls.source_node),
                target_actual: actual_of(&ls.target_node),
                source_carrier: ls.source_carrier_state,
                target_carrier: ls.target_carrier_state,
                is_cross_host: ls.is_cross_host,
                tunnel: store.get_tunnel(&lab_id, &ls.link_name).map(|t| t.status),
            };
            let (derived, reason) = LinkStateMachine::derive(derivation);

            if derived != ls.actual_state {
                store.with_link_state(&lab_id, &ls.link_name, |row| {
                    row.actual_state = derived;
                    row.error_message = reason.map(str::to_string);
                });
                if let Some(updated) = store.get_link_state(&lab_id, &ls.link_name) {
                    tracing::debug!(
                        lab_id = %lab_id,
                        link = %ls.link_name,
                        from = %ls.actual_state,
                        to = %derived,
                        "reconciled link state"
                    );
                    self.ctx.publish_link_state(&updated);
                }
            }

            // Auto-connect: desired up, both endpoints running, link not
            // up. Error links retry too — the setup paths are idempotent
            // and recover from agent restarts and VLAN drift.
            let both_running = actual_of(&ls.source_node) == NodeActualState::Running
                && actual_of(&ls.target_node) == NodeActualState::Running;
            if ls.desired_state == LinkDesiredState::Up
                && both_running
                && matches!(
                    derived,
                    LinkActualState::Unknown
                        | LinkActualState::Pending
                        | LinkActualState::Down
                        | LinkActualState::Error
                )
            {
                to_connect.push(ls);
            }
        }

        if to_connect.is_empty() {
            return;
        }

        let lock_key = keys::link_ops_lock(lab_id.as_str());
        let acquired = self
            .ctx
            .coord
            .set_nx_ex(&lock_key, "reconcile", Duration::from_secs(30))
            .await
            .unwrap_or(false);
        if !acquired {
            tracing::debug!(lab_id = %lab_id, "link ops lock held, deferring auto-connect");
            return;
        }

        let orchestrator = LinkOrchestrator::new(&self.ctx);
        for ls in to_connect {
            tracing::info!(lab_id = %lab_id, link = %ls.link_name, "auto-connecting link");
            if let Err(e) = orchestrator.connect_link(lab, &ls).await {
                tracing::warn!(lab_id = %lab_id, link = %ls.link_name, error = %e, "auto-connect failed");
            }
        }
        let _ = self.ctx.coord.delete(&[lock_key]).await;
    }

    /// Create one enforcement job for the lab's out-of-sync nodes when
    /// no job is already active.
    fn trigger_enforcement(&self, lab: &Lab) -> Vec<JobId> {
        let store = &self.ctx.store;
        let now = self.ctx.now_ms();
        let lab_id = lab.id;

        let mut out_of_sync = Vec::new();
        for ns in store.node_states_for_lab(&lab_id) {
            if ns.actual_state.is_transitional() {
                continue;
            }
            if ns.stopping_started_at_ms.is_some() || ns.starting_started_at_ms.is_some() {
                continue;
            }
            if ns.enforcement_failed_at_ms.is_some() {
                continue;
            }
            let needs_start = ns.desired_state == NodeDesiredState::Running
                && matches!(
                    ns.actual_state,
                    NodeActualState::Stopped
                        | NodeActualState::Undeployed
                        | NodeActualState::Exited
                        | NodeActualState::Error
                );
            let needs_stop = ns.desired_state == NodeDesiredState::Stopped
                && ns.actual_state == NodeActualState::Running;
            if needs_start || needs_stop {
                out_of_sync.push(ns);
            }
        }
        if out_of_sync.is_empty() {
            return Vec::new();
        }

        if let Some(job) = store.any_active_job_for_lab(&lab_id) {
            tracing::debug!(
                lab_id = %lab_id,
                job_id = %job.id,
                count = out_of_sync.len(),
                "out-of-sync nodes but active job exists, skipping enforcement"
            );
            return Vec::new();
        }

        let node_ids: Vec<String> = out_of_sync.iter().map(|ns| ns.node_id.clone()).collect();
        let display: Vec<&str> = node_ids.iter().take(5).map(String::as_str).collect();
        let suffix = if node_ids.len() > 5 { "..." } else { "" };
        let mut job = Job::new(
            lab_id,
            JobAction::ReconcileEnforce(format!("{}{}", display.join(","), suffix)),
            now,
        );
        job.node_ids = node_ids.clone();
        let job_id = job.id;
        store.insert_job(job);

        tracing::info!(
            lab_id = %lab_id,
            job_id = %job_id,
            nodes = ?node_ids,
            "reconciliation enforcement: triggering sync"
        );
        vec![job_id]
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
