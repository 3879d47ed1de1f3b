// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State enforcement: corrective action when observed ≠ desired.
//!
//! Unlike reconciliation (which only updates the store), enforcement
//! creates sync jobs. Retries are bounded: per-node attempt counts,
//! exponential backoff, a crash cooldown after exhaustion, and a
//! TTL cooldown key in the coordination store that user-initiated
//! operations clear.

use crate::ctx::Ctx;
use crate::extract::extract_before_restart;
use lm_adapters::keys;
use lm_core::{
    Clock, EnforcementAction, Event, Job, JobAction, JobId, LabId, NodeActualState,
    NodeState, NodeStateMachine,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct Enforcer<C: Clock> {
    ctx: Arc<Ctx<C>>,
}

impl<C: Clock> Enforcer<C> {
    pub fn new(ctx: Arc<Ctx<C>>) -> Self {
        Self { ctx }
    }

    /// One enforcement pass: batch eligible nodes by lab, one sync job
    /// per lab. Returns the jobs the runner must schedule.
    pub async fn run_once(&self) -> Vec<JobId> {
        if !self.ctx.settings.state_enforcement_enabled {
            return Vec::new();
        }

        let mismatched = self.ctx.store.mismatched_node_states();
        if mismatched.is_empty() {
            return Vec::new();
        }
        tracing::debug!(count = mismatched.len(), "nodes with state mismatches");

        // Per-node pre-filter.
        let mut eligible_by_lab: HashMap<LabId, Vec<NodeState>> = HashMap::new();
        for ns in mismatched {
            if self.is_enforceable(&ns).await {
                eligible_by_lab.entry(ns.lab_id).or_default().push(ns);
            }
        }
        if eligible_by_lab.is_empty() {
            return Vec::new();
        }

        let mut jobs = Vec::new();
        let now = self.ctx.now_ms();
        for (lab_id, nodes) in eligible_by_lab {
            let Some(lab) = self.ctx.store.get_lab(&lab_id) else { continue };

            // A lab-wide deploy/destroy owns the lab.
            if let Some(job) = self.ctx.store.active_lab_wide_job(&lab_id) {
                tracing::debug!(
                    lab_id = %lab_id,
                    job_id = %job.id,
                    "active deploy/destroy job, skipping batch enforcement"
                );
                continue;
            }

            // Crashed nodes may still hold a running config worth
            // saving before the container is replaced.
            extract_before_restart(&self.ctx, &lab, &nodes).await;

            let mut node_ids = Vec::new();
            for ns in &nodes {
                let cooldown_key =
                    keys::enforcement_cooldown(lab_id.as_str(), &ns.node_name);
                let ttl = Duration::from_secs(self.ctx.settings.state_enforcement_cooldown);
                if let Err(e) = self.ctx.coord.set_ex(&cooldown_key, "1", ttl).await {
                    tracing::warn!(error = %e, "failed to set enforcement cooldown");
                }

                self.ctx.store.with_node_state(&lab_id, &ns.node_name, |row| {
                    row.enforcement_attempts += 1;
                    row.last_enforcement_at_ms = Some(now);
                    if row.enforcement_failed_at_ms.take().is_some() {
                        tracing::info!(
                            lab_id = %lab_id,
                            node = %row.node_name,
                            "retrying failed node after crash cooldown"
                        );
                    }
                });
                node_ids.push(ns.node_id.clone());
            }

            let mut job = Job::new(lab_id, JobAction::SyncBatch(node_ids.len()), now);
            job.node_ids = node_ids.clone();
            let job_id = job.id;
            self.ctx.store.insert_job(job);
            jobs.push(job_id);

            tracing::info!(
                lab_id = %lab_id,
                job_id = %job_id,
                count = node_ids.len(),
                "state enforcement: batch sync"
            );
        }

        jobs
    }

    /// All the per-node pre-filtering: action determination, retry
    /// exhaustion (with the one-time failure marking), crash cooldown,
    /// exponential backoff, the coordination-store cooldown, and active
    /// per-node jobs.
    async fn is_enforceable(&self, ns: &NodeState) -> bool {
        let settings = &self.ctx.settings;
        let now = self.ctx.now_ms();

        let Some(action) = NodeStateMachine::enforcement_action(ns.desired_state, ns.actual_state)
        else {
            tracing::debug!(
                node = %ns.node_name,
                desired = %ns.desired_state,
                actual = %ns.actual_state,
                "no enforcement action for mismatch"
            );
            return false;
        };

        if action == EnforcementAction::Start
            && ns.actual_state == NodeActualState::Error
            && !settings.state_enforcement_auto_restart_enabled
        {
            tracing::debug!(node = %ns.node_name, "auto-restart disabled, skipping");
            return false;
        }

        // Retry exhaustion: mark once, then stay silent until the crash
        // cooldown lets a fresh retry cycle through.
        let mut attempts = ns.enforcement_attempts;
        if attempts >= settings.state_enforcement_max_retries {
            let Some(failed_at) = ns.enforcement_failed_at_ms else {
                self.mark_exhausted(ns, now);
                return false;
            };
            let cooldown_end = failed_at + settings.state_enforcement_crash_cooldown * 1000;
            if now < cooldown_end {
                tracing::debug!(node = %ns.node_name, "max retries exhausted, in crash cooldown");
                return false;
            }
            // Cooldown elapsed: restart the cycle (remaining guards
            // below still apply).
            self.ctx.store.with_node_state(&ns.lab_id, &ns.node_name, |row| {
                row.enforcement_attempts = 0;
            });
            attempts = 0;
        } else if let Some(failed_at) = ns.enforcement_failed_at_ms {
            // Crash cooldown window (failure marker set mid-cycle).
            let cooldown_end = failed_at + settings.state_enforcement_crash_cooldown * 1000;
            if now < cooldown_end {
                tracing::debug!(
                    node = %ns.node_name,
                    remaining_ms = cooldown_end - now,
                    "in crash cooldown"
                );
                return false;
            }
        }

        // Exponential backoff between attempts.
        if attempts > 0 {
            if let Some(last) = ns.last_enforcement_at_ms {
                let backoff_ms = settings.enforcement_backoff_ms(attempts - 1);
                if now < last + backoff_ms {
                    tracing::debug!(
                        node = %ns.node_name,
                        remaining_ms = last + backoff_ms - now,
                        "in backoff delay"
                    );
                    return false;
                }
            }
        }

        // Coordination-store cooldown (recently fired). On store errors
        // assume not on cooldown — blocking enforcement is worse.
        let cooldown_key = keys::enforcement_cooldown(ns.lab_id.as_str(), &ns.node_name);
        match self.ctx.coord.exists(&cooldown_key).await {
            Ok(true) => {
                tracing::debug!(node = %ns.node_name, "on enforcement cooldown");
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "cooldown check failed, proceeding");
            }
        }

        // Another job already touching this node.
        if let Some(job) = self.ctx.store.active_job_for_node(&ns.lab_id, &ns.node_id) {
            tracing::debug!(node = %ns.node_name, job_id = %job.id, "active job, skipping enforcement");
            return false;
        }

        true
    }

    /// Max retries reached: mark the permanent failure exactly once and
    /// tell the UI. Reconciliation stops overwriting this node until a
    /// crash-cooldown retry clears the marker.
    fn mark_exhausted(&self, ns: &NodeState, now: u64) {
        let attempts = ns.enforcement_attempts;
        self.ctx.store.with_node_state(&ns.lab_id, &ns.node_name, |row| {
            row.enforcement_failed_at_ms = Some(now);
            row.actual_state = NodeActualState::Error;
            let original = row.error_message.take().unwrap_or_else(|| "unknown".to_string());
            row.error_message = Some(format!(
                "State enforcement failed after {attempts} attempts. Last error: {original}"
            ));
        });
        tracing::warn!(
            lab_id = %ns.lab_id,
            node = %ns.node_name,
            attempts,
            "exceeded max enforcement retries, marking as error"
        );
        self.ctx.publish(Event::EnforcementFailed {
            lab_id: ns.lab_id,
            node_id: ns.node_id.clone(),
            node_name: ns.node_name.clone(),
            attempts,
        });
        if let Some(updated) = self.ctx.store.get_node_state(&ns.lab_id, &ns.node_name) {
            self.ctx.publish_node_state(&updated, None);
        }
    }

    /// Clear cooldown keys for a lab's nodes. Called when the user
    /// issues an explicit operation so enforcement doesn't sit out a
    /// stale cooldown against the new desired state.
    pub async fn clear_cooldowns_for_lab(&self, lab_id: &LabId, node_names: &[String]) {
        if node_names.is_empty() {
            return;
        }
        let cooldown_keys: Vec<String> = node_names
            .iter()
            .map(|name| keys::enforcement_cooldown(lab_id.as_str(), name))
            .collect();
        match self.ctx.coord.delete(&cooldown_keys).await {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(lab_id = %lab_id, deleted, "cleared enforcement cooldowns");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(lab_id = %lab_id, error = %e, "failed to clear cooldowns");
            }
        }
    }
}

#[cfg(test)]
#[path = "enforce_tests.rs"]
mod tests;
