// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node lifecycle manager: one sync job's execution.
//!
//! Phases: load & validate → set transitional states (before any agent
//! call, so users see the operation in flight even if the job dies) →
//! resolve agents (spawning child jobs for secondary hosts) → resource
//! check → migration → categorize → execute per category (failures in
//! one category never block the others) → finalize.

mod execute;
mod resolve;

use crate::ctx::Ctx;
use crate::links::LinkOrchestrator;
use lm_core::{
    Clock, Event, Host, Job, JobAction, JobId, JobStatus, Lab, LabState, LabStateMachine,
    NodeState, NodeStateMachine, Provider, TransitionStamp,
};
use lm_storage::state::count_states;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome handed back to the runner: child jobs it must schedule.
#[derive(Debug, Default)]
pub struct LifecycleOutcome {
    pub spawned_children: Vec<JobId>,
}

pub struct NodeLifecycle<C: Clock> {
    ctx: Arc<Ctx<C>>,
    job_id: JobId,
    lab: Lab,
    provider: Provider,
    /// User-visible node ids this job operates on.
    node_ids: Vec<String>,
    /// Container names of the nodes still in play (errors drop out).
    targets: Vec<String>,
    /// node_name → resolved target host.
    resolved: HashMap<String, Host>,
    log: Vec<String>,
    outcome: LifecycleOutcome,
}

impl<C: Clock> NodeLifecycle<C> {
    pub fn new(
        ctx: Arc<Ctx<C>>,
        job_id: JobId,
        lab: Lab,
        node_ids: Vec<String>,
        provider: Provider,
    ) -> Self {
        Self {
            ctx,
            job_id,
            lab,
            provider,
            node_ids,
            targets: Vec::new(),
            resolved: HashMap::new(),
            log: Vec::new(),
            outcome: LifecycleOutcome::default(),
        }
    }

    pub(crate) fn logf(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    fn heartbeat(&self) {
        let now = self.ctx.now_ms();
        self.ctx.store.with_job(&self.job_id, |job| {
            job.last_heartbeat_ms = Some(now);
        });
    }

    /// True when the job row was cancelled underneath us; checked at
    /// commit points between phases.
    fn cancelled(&self) -> bool {
        self.ctx
            .store
            .get_job(&self.job_id)
            .map(|job| job.status == JobStatus::Cancelled)
            .unwrap_or(true)
    }

    fn node_state(&self, node_name: &str) -> Option<NodeState> {
        self.ctx.store.get_node_state(&self.lab.id, node_name)
    }

    fn publish_node(&self, node_name: &str) {
        if let Some(ns) = self.node_state(node_name) {
            let host = self.resolved.get(node_name);
            self.ctx.publish_node_state(&ns, host);
        }
    }

    fn publish_job_progress(&self, status: JobStatus, message: Option<&str>, error: Option<&str>) {
        if let Some(job) = self.ctx.store.get_job(&self.job_id) {
            self.ctx.publish(Event::JobProgress {
                lab_id: self.lab.id,
                job_id: self.job_id,
                action: job.action.clone(),
                status,
                progress_message: message.map(str::to_string),
                error_message: error.map(str::to_string),
            });
        }
    }

    /// Run the job to completion. Returns the child jobs the runner must
    /// schedule.
    pub async fn execute(mut self) -> LifecycleOutcome {
        let now = self.ctx.now_ms();
        self.ctx.store.with_job(&self.job_id, |job| {
            job.status = JobStatus::Running;
            job.started_at_ms = Some(now);
            job.last_heartbeat_ms = Some(now);
        });
        self.publish_job_progress(JobStatus::Running, Some("Sync started"), None);

        // Phase 1: load & validate.
        let mut actionable = self.load_and_validate();
        if actionable.is_empty() {
            self.logf("No nodes require action (actual matches desired)");
            self.finish(JobStatus::Completed).await;
            return self.outcome;
        }

        // Phase 2: transitional states, committed before any agent call.
        self.enter_transitional_states(&actionable);

        if self.cancelled() {
            self.logf("Job cancelled before agent resolution");
            return self.outcome;
        }

        // Phase 3: resolve agents; secondary hosts become child jobs.
        actionable = self.resolve_agents(actionable).await;
        self.heartbeat();

        // Phase 4: resource check for the candidate deploy set.
        actionable = self.check_resources(actionable);

        // Phase 5: migration handling.
        self.handle_migrations(&actionable).await;
        self.heartbeat();

        if self.cancelled() {
            self.logf("Job cancelled before execution");
            return self.outcome;
        }

        // Phases 6–7: categorize and execute.
        self.targets = actionable;
        self.run_categories().await;

        // Link orchestration for newly-ready links, under the link-ops
        // lock (fail-closed: skipped links reconnect on the next
        // reconciliation pass).
        self.connect_ready_links().await;

        // Phase 8: finalize.
        let errors = self
            .node_ids
            .clone()
            .iter()
            .filter_map(|id| self.ctx.store.get_node_state_by_id(&self.lab.id, id))
            .filter(|ns| ns.actual_state == lm_core::NodeActualState::Error)
            .count();
        let status = if errors == 0 {
            self.logf("sync completed");
            JobStatus::Completed
        } else {
            self.logf(format!("sync completed with {errors} node error(s)"));
            JobStatus::Failed
        };
        self.finish(status).await;
        self.outcome
    }

    async fn connect_ready_links(&mut self) {
        let lock_key = lm_adapters::keys::link_ops_lock(self.lab.id.as_str());
        let acquired = self
            .ctx
            .coord
            .set_nx_ex(&lock_key, self.job_id.as_str(), std::time::Duration::from_secs(30))
            .await
            .unwrap_or(false);
        if !acquired {
            self.logf("link ops lock held elsewhere, deferring link setup");
            return;
        }

        let orchestrator = LinkOrchestrator::new(&self.ctx);
        let lab = self.lab.clone();
        let mut log = Vec::new();
        let (ok, failed) = orchestrator.create_deployment_links(&lab, &mut log).await;
        self.log.extend(log);
        if ok > 0 || failed > 0 {
            self.logf(format!("links: {ok} connected, {failed} failed"));
        }

        let _ = self.ctx.coord.delete(&[lock_key]).await;
    }

    /// Phase 1: pull node states, repair placeholder names, drop rows
    /// that already match their desired state.
    fn load_and_validate(&mut self) -> Vec<String> {
        let mut actionable = Vec::new();

        for node_id in self.node_ids.clone() {
            let Some(ns) = self.ctx.store.get_node_state_by_id(&self.lab.id, &node_id) else {
                self.logf(format!("node {node_id}: no state row, skipping"));
                continue;
            };

            // Placeholder repair: earlier code paths left node_name equal
            // to the node id; resolve it to the container name.
            if ns.node_name == ns.node_id {
                if let Some(def) = self.ctx.store.node_by_display_id(&self.lab.id, &ns.node_id) {
                    if def.container_name != ns.node_name {
                        let container = def.container_name.clone();
                        let def_id = def.id;
                        self.ctx.store.with_node_state(&self.lab.id, &ns.node_name, |row| {
                            row.node_name = container.clone();
                            row.node_definition_id = Some(def_id);
                        });
                        self.logf(format!(
                            "node {node_id}: repaired placeholder name to {}",
                            def.container_name
                        ));
                    }
                }
            }

            let ns = match self.ctx.store.get_node_state_by_id(&self.lab.id, &node_id) {
                Some(ns) => ns,
                None => continue,
            };
            if ns.is_converged() {
                continue;
            }
            actionable.push(ns.node_name);
        }

        actionable
    }

    /// Phase 2: commit transitional actual states.
    fn enter_transitional_states(&mut self, targets: &[String]) {
        let now = self.ctx.now_ms();
        for node_name in targets {
            let Some(ns) = self.node_state(node_name) else { continue };
            let Some(entry) =
                NodeStateMachine::transitional_entry(ns.desired_state, ns.actual_state)
            else {
                continue;
            };

            self.ctx.store.with_node_state(&self.lab.id, node_name, |row| {
                row.enter_transitional(entry.new_actual, now);
                match entry.stamp {
                    Some(TransitionStamp::StartingStartedAt) => {
                        row.starting_started_at_ms = Some(now)
                    }
                    Some(TransitionStamp::StoppingStartedAt) => {
                        row.stopping_started_at_ms = Some(now)
                    }
                    None => {}
                }
            });
            self.publish_node(node_name);
            tracing::debug!(
                lab_id = %self.lab.id,
                node = %node_name,
                state = %entry.new_actual,
                "entered transitional state"
            );
        }
    }

    /// Recompute the lab state from node counts and finish the job.
    async fn finish(&mut self, status: JobStatus) {
        let store = &self.ctx.store;
        let now = self.ctx.now_ms();

        // Successful sync resets the enforcement ledger for converged
        // nodes.
        for node_id in &self.node_ids {
            if let Some(ns) = store.get_node_state_by_id(&self.lab.id, node_id) {
                if ns.is_converged() && ns.enforcement_attempts > 0 {
                    store.with_node_state(&self.lab.id, &ns.node_name, |row| {
                        row.reset_enforcement();
                    });
                }
            }
        }

        let counts = count_states(&store.node_states_for_lab(&self.lab.id));
        let lab_state = LabStateMachine::compute(counts);
        let error_text = (lab_state == LabState::Error)
            .then(|| format!("{} node(s) in error state", counts.error));
        store.update_lab_state(&self.lab.id, lab_state, error_text.as_deref(), now);
        self.ctx.publish(Event::LabStateChanged {
            lab_id: self.lab.id,
            state: lab_state,
            state_error: error_text,
        });

        let log = self.log.join("\n");
        store.with_job(&self.job_id, |job| {
            job.status = status;
            job.completed_at_ms = Some(now);
            job.log = Some(log.clone());
        });
        self.publish_job_progress(
            status,
            (status == JobStatus::Completed).then_some("Sync completed"),
            (status == JobStatus::Failed).then_some("Sync finished with errors"),
        );
        tracing::info!(
            job_id = %self.job_id,
            lab_id = %self.lab.id,
            status = %status,
            "lifecycle job finished"
        );
    }

    /// Create a child job for nodes routed to a secondary host.
    fn spawn_child_job(&mut self, host: &Host, node_ids: Vec<String>) -> JobId {
        let now = self.ctx.now_ms();
        let mut child = Job::new(self.lab.id, JobAction::SyncHost(host.id), now);
        child.parent_job_id = Some(self.job_id);
        child.agent_id = Some(host.id);
        child.node_ids = node_ids;
        let child_id = child.id;
        self.ctx.store.insert_job(child);
        self.outcome.spawned_children.push(child_id);
        self.logf(format!("spawned child job {child_id} for host {}", host.name));
        child_id
    }
}

#[cfg(test)]
#[path = "../lifecycle_tests.rs"]
mod tests;
