// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job health supervision.
//!
//! Periodic sweeps over everything that can wedge: jobs past their
//! timeout, queued jobs nobody picked up, jobs stranded on offline
//! agents, stuck image syncs, stale agent-side locks, nodes stuck in
//! transitional states, orphaned image-sync markers, and stalled agent
//! updates. Stuck jobs are retried with superseded-by chaining (or
//! failed permanently when the log carries a non-retryable signature).

use crate::ctx::Ctx;
use crate::image_sync::ImageSyncService;
use lm_core::{
    Clock, Event, Job, JobId, JobStatus, LabState, NodeActualState,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Queued jobs with no agent older than this are orphans.
const ORPHAN_QUEUED_AFTER: Duration = Duration::from_secs(120);

/// How much of a file-backed log the signature check reads.
const LOG_TAIL_BYTES: usize = 12_000;

pub struct JobHealthMonitor<C: Clock> {
    ctx: Arc<Ctx<C>>,
}

impl<C: Clock> JobHealthMonitor<C> {
    pub fn new(ctx: Arc<Ctx<C>>) -> Self {
        Self { ctx }
    }

    /// One full sweep. Returns retry jobs the runner must schedule.
    pub async fn run_once(&self) -> Vec<JobId> {
        let mut to_schedule = Vec::new();

        self.check_stuck_jobs(&mut to_schedule).await;
        self.check_orphaned_queued_jobs(&mut to_schedule).await;
        self.check_jobs_on_offline_agents(&mut to_schedule).await;
        self.check_stuck_image_sync_jobs().await;
        self.check_stuck_locks().await;
        self.check_stuck_transitional_nodes();
        self.check_orphaned_image_sync_markers();
        self.check_stuck_agent_updates();

        to_schedule
    }

    async fn check_stuck_jobs(&self, to_schedule: &mut Vec<JobId>) {
        let now = self.ctx.now_ms();
        for job in self.ctx.store.active_jobs() {
            if !job.is_stuck(now) {
                continue;
            }
            self.handle_stuck_job(job, to_schedule).await;
        }
    }

    async fn handle_stuck_job(&self, job: Job, to_schedule: &mut Vec<JobId>) {
        // Children defer to a live parent; a terminal parent means the
        // child is orphaned and fails without retry.
        if let Some(parent_id) = job.parent_job_id {
            match self.ctx.store.get_job(&parent_id) {
                Some(parent) if parent.status.is_active() => {
                    tracing::debug!(
                        job_id = %job.id,
                        parent_id = %parent_id,
                        "stuck child deferred to active parent"
                    );
                    return;
                }
                _ => {
                    tracing::warn!(job_id = %job.id, parent_id = %parent_id, "failing orphaned child job");
                    self.fail_job(&job, "Parent job completed or missing, child orphaned");
                    return;
                }
            }
        }

        tracing::warn!(
            job_id = %job.id,
            action = %job.action,
            status = %job.status,
            agent_id = ?job.agent_id,
            "detected stuck job"
        );

        let agent_offline = job
            .agent_id
            .and_then(|id| self.ctx.store.get_host(&id))
            .map(|h| !self.ctx.is_host_online(&h))
            .unwrap_or(false);

        let log_text = read_log_for_classification(job.log.as_deref());
        if let Some(reason) =
            non_retryable_signature(&job.action.to_string(), log_text.as_deref())
        {
            self.fail_job(
                &job,
                &format!(
                    "Job timed out with non-retryable failure signature ({reason}); skipping retry"
                ),
            );
            return;
        }

        if job.retry_count < self.ctx.settings.job_max_retries {
            if let Some(new_id) = self.retry_job(&job, agent_offline).await {
                to_schedule.push(new_id);
            }
        } else {
            self.fail_job(&job, "Job timed out after maximum retries");
        }
    }

    /// Create the replacement job and chain the old one (and its active
    /// children) to it. Returns `None` when an equivalent job already
    /// exists — the old one is cancelled as a duplicate instead.
    async fn retry_job(&self, old_job: &Job, agent_offline: bool) -> Option<JobId> {
        let store = &self.ctx.store;
        let now = self.ctx.now_ms();

        tracing::info!(
            job_id = %old_job.id,
            attempt = old_job.retry_count + 1,
            max = self.ctx.settings.job_max_retries,
            "retrying stuck job"
        );

        // Deduplication: an active twin supersedes instead of stacking
        // another retry on top.
        if let Some(existing) = store.duplicate_active_job(old_job) {
            tracing::info!(
                job_id = %old_job.id,
                existing = %existing.id,
                "duplicate active job found, superseding instead of retrying"
            );
            store.with_job(&old_job.id, |row| {
                row.status = JobStatus::Cancelled;
                row.completed_at_ms = Some(now);
                row.superseded_by_id = Some(existing.id);
                row.append_log(&format!("--- Cancelled: duplicate of job {} ---", existing.id));
            });
            return None;
        }

        // Force-release the agent-side lab lock so the retry doesn't
        // immediately block on it.
        if let Some(agent_id) = old_job.agent_id {
            if !agent_offline {
                if let Some(host) = store.get_host(&agent_id) {
                    if self.ctx.is_host_online(&host) {
                        match self.ctx.agent.release_lock(&host, old_job.lab_id.as_str()).await {
                            Ok(result) if result.status == "cleared" => {
                                tracing::info!(
                                    lab_id = %old_job.lab_id,
                                    agent = %host.name,
                                    "force-released agent lock before retry"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to force-release agent lock");
                            }
                        }
                    }
                }
            }
        }

        let mut new_job = Job::new(old_job.lab_id, old_job.action.clone(), now);
        new_job.user_id = old_job.user_id.clone();
        new_job.retry_count = old_job.retry_count + 1;
        new_job.node_ids = old_job.node_ids.clone();
        let new_id = new_job.id;
        store.insert_job(new_job);

        let timeout_secs = old_job.action.timeout().as_secs();
        store.with_job(&old_job.id, |row| {
            row.status = JobStatus::Failed;
            row.completed_at_ms = Some(now);
            row.superseded_by_id = Some(new_id);
            append_to_log(
                row,
                &format!(
                    "--- Job timed out after {timeout_secs}s, retrying (attempt {}) ---",
                    old_job.retry_count + 1
                ),
            );
        });

        // The old job's children restart under the new parent; cancel
        // the stale ones.
        let children = store.active_children(&old_job.id);
        if !children.is_empty() {
            tracing::info!(
                job_id = %old_job.id,
                count = children.len(),
                "cancelling children of retried job"
            );
            for child in children {
                store.with_job(&child.id, |row| {
                    row.status = JobStatus::Cancelled;
                    row.completed_at_ms = Some(now);
                    row.superseded_by_id = Some(new_id);
                    row.append_log("--- Cancelled: parent job retried ---");
                });
            }
        }

        tracing::info!(new_job_id = %new_id, old_job_id = %old_job.id, "created retry job");
        Some(new_id)
    }

    /// Permanent failure: terminal status, reason in the log, lab to
    /// error.
    fn fail_job(&self, job: &Job, reason: &str) {
        let now = self.ctx.now_ms();
        tracing::error!(job_id = %job.id, reason, "failing job");

        self.ctx.store.with_job(&job.id, |row| {
            row.status = JobStatus::Failed;
            row.completed_at_ms = Some(now);
            append_to_log(row, &format!("--- Job failed: {reason} ---"));
        });

        let error = format!("Job {} failed: {reason}", job.action);
        self.ctx
            .store
            .update_lab_state(&job.lab_id, LabState::Error, Some(&error), now);
        self.ctx.publish(Event::LabStateChanged {
            lab_id: job.lab_id,
            state: LabState::Error,
            state_error: Some(error),
        });
        self.ctx.publish(Event::JobProgress {
            lab_id: job.lab_id,
            job_id: job.id,
            action: job.action.clone(),
            status: JobStatus::Failed,
            progress_message: None,
            error_message: Some(reason.to_string()),
        });
    }

    /// Queued jobs with no agent assignment that nobody picked up.
    async fn check_orphaned_queued_jobs(&self, to_schedule: &mut Vec<JobId>) {
        let cutoff = self
            .ctx
            .now_ms()
            .saturating_sub(ORPHAN_QUEUED_AFTER.as_millis() as u64);
        for job in self.ctx.store.orphaned_queued_jobs(cutoff) {
            tracing::warn!(job_id = %job.id, "found orphaned queued job");
            if job.retry_count < self.ctx.settings.job_max_retries {
                if let Some(new_id) = self.retry_job(&job, false).await {
                    to_schedule.push(new_id);
                }
            } else {
                self.fail_job(&job, "No agent available to process job");
            }
        }
    }

    /// Active jobs whose assigned agent went offline retry elsewhere
    /// (offline hosts are excluded by liveness during resolution).
    async fn check_jobs_on_offline_agents(&self, to_schedule: &mut Vec<JobId>) {
        let offline: Vec<lm_core::HostId> =
            self.ctx.store.offline_hosts().iter().map(|h| h.id).collect();
        if offline.is_empty() {
            return;
        }

        for job in self.ctx.store.active_jobs_on_hosts(&offline) {
            tracing::warn!(
                job_id = %job.id,
                agent_id = ?job.agent_id,
                retry_count = job.retry_count,
                "job stranded on offline agent"
            );
            if job.retry_count < self.ctx.settings.job_max_retries {
                if let Some(new_id) = self.retry_job(&job, true).await {
                    to_schedule.push(new_id);
                }
            } else {
                self.fail_job(&job, "Agent went offline during job execution");
            }
        }
    }

    /// Image syncs stuck pending, or transferring/loading past the
    /// timeout. Before failing a transfer the agent is asked whether it
    /// is genuinely still active; a hard ceiling of twice the timeout
    /// force-fails regardless.
    async fn check_stuck_image_sync_jobs(&self) {
        let settings = &self.ctx.settings;
        let now = self.ctx.now_ms();
        let pending_timeout_ms = settings.image_sync_job_pending_timeout * 1000;
        let timeout_ms = settings.image_sync_timeout * 1000;

        for job in self.ctx.store.active_image_sync_jobs() {
            let host = self.ctx.store.get_host(&job.host_id);
            let host_offline = host.as_ref().map(|h| !self.ctx.is_host_online(h)).unwrap_or(true);
            let host_name = host
                .as_ref()
                .map(|h| h.name.clone())
                .unwrap_or_else(|| job.host_id.to_string());

            let reason = match job.status {
                lm_core::ImageSyncJobStatus::Pending => {
                    if now.saturating_sub(job.created_at_ms) > pending_timeout_ms {
                        let mut reason = format!(
                            "Job stuck in pending state for over {}s",
                            settings.image_sync_job_pending_timeout
                        );
                        if host_offline {
                            reason.push_str(&format!(" (target host {host_name} is offline)"));
                        }
                        Some(reason)
                    } else {
                        None
                    }
                }
                lm_core::ImageSyncJobStatus::Transferring
                | lm_core::ImageSyncJobStatus::Loading => {
                    if host_offline {
                        Some(format!("Target host {host_name} went offline during transfer"))
                    } else if now.saturating_sub(job.reference_ms()) > timeout_ms {
                        let age_ms = now.saturating_sub(job.reference_ms());
                        let agent_active = match &host {
                            Some(h) => self
                                .ctx
                                .agent
                                .get_active_transfers(h)
                                .await
                                .map(|ids| ids.iter().any(|id| *id == job.id.as_str()))
                                .unwrap_or(false),
                            None => false,
                        };
                        if agent_active && age_ms <= timeout_ms * 2 {
                            tracing::info!(
                                job_id = %job.id,
                                "sync exceeds timeout but agent reports active transfer, skipping"
                            );
                            None
                        } else {
                            if agent_active {
                                tracing::warn!(
                                    job_id = %job.id,
                                    "force-failing sync past hard ceiling despite active transfer"
                                );
                            }
                            Some(format!(
                                "Job timed out after {}s in {} state",
                                settings.image_sync_timeout, job.status
                            ))
                        }
                    } else {
                        None
                    }
                }
                _ => None,
            };

            let Some(reason) = reason else { continue };
            tracing::warn!(
                job_id = %job.id,
                image = %job.image_ref,
                host_id = %job.host_id,
                reason = %reason,
                "detected stuck image sync job"
            );
            self.ctx.store.with_image_sync_job(&job.id, |row| {
                row.status = lm_core::ImageSyncJobStatus::Failed;
                row.error_message = Some(reason.clone());
                row.completed_at_ms = Some(now);
            });
            self.ctx.store.upsert_image_host(lm_core::ImageHost {
                image_ref: job.image_ref.clone(),
                host_id: job.host_id,
                status: lm_core::ImageSyncJobStatus::Failed,
                error_message: Some(reason),
                updated_at_ms: now,
            });
        }
    }

    /// Query each online agent's locks and release any held too long.
    async fn check_stuck_locks(&self) {
        let now = self.ctx.now_ms();
        let heartbeat_ms = self.ctx.settings.agent_heartbeat_timeout * 1000;
        let threshold = self.ctx.settings.stuck_lock_threshold as f64;

        for host in self.ctx.store.online_hosts(now, heartbeat_ms) {
            let status = match self.ctx.agent.get_lock_status(&host).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::debug!(host = %host.name, error = %e, "lock status query failed");
                    continue;
                }
            };
            if let Some(error) = status.error {
                tracing::debug!(host = %host.name, error = %error, "agent lock status error");
                continue;
            }
            for lock in status.locks {
                if !lock.is_stuck && lock.age_seconds < threshold {
                    continue;
                }
                tracing::warn!(
                    host = %host.name,
                    lab_id = %lock.lab_id,
                    age_seconds = lock.age_seconds,
                    "found stuck agent lock"
                );
                match self.ctx.agent.release_lock(&host, &lock.lab_id).await {
                    Ok(result) if result.status == "cleared" => {
                        tracing::info!(host = %host.name, lab_id = %lock.lab_id, "released stuck lock");
                    }
                    Ok(result) => {
                        tracing::warn!(host = %host.name, status = %result.status, "lock release reported failure");
                    }
                    Err(e) => {
                        tracing::warn!(host = %host.name, error = %e, "failed to release stuck lock");
                    }
                }
            }
        }
    }

    /// Nodes stuck in stopping/starting past the grace window with no
    /// active job recover to stopped (the safe default). A starting
    /// node mid-image-sync is left alone.
    fn check_stuck_transitional_nodes(&self) {
        let now = self.ctx.now_ms();
        let grace_ms = self.ctx.settings.transitional_grace * 1000;

        for actual in [NodeActualState::Stopping, NodeActualState::Starting] {
            for ns in self.ctx.store.stuck_transitional_nodes(actual, now, grace_ms) {
                if self.ctx.store.any_active_job_for_lab(&ns.lab_id).is_some() {
                    continue;
                }
                if actual == NodeActualState::Starting {
                    if let Some(sync) = ns.image_sync_status {
                        if sync.is_active() {
                            tracing::debug!(
                                node = %ns.node_name,
                                status = %sync,
                                "skipping stuck-starting recovery: image sync in progress"
                            );
                            continue;
                        }
                    }
                }

                tracing::warn!(
                    lab_id = %ns.lab_id,
                    node = %ns.node_name,
                    state = %actual,
                    "recovering node stuck in transitional state"
                );
                self.ctx.store.with_node_state(&ns.lab_id, &ns.node_name, |row| {
                    row.mark_stopped(now);
                });
                if let Some(updated) = self.ctx.store.get_node_state(&ns.lab_id, &ns.node_name) {
                    self.ctx.publish_node_state(&updated, None);
                }
            }
        }
    }

    /// Clear image-sync markers with no live sync job behind them.
    fn check_orphaned_image_sync_markers(&self) {
        let service = ImageSyncService::new(self.ctx.clone());

        for ns in self.ctx.store.nodes_with_active_image_sync() {
            let node_def = self.ctx.store.node_by_container_name(&ns.lab_id, &ns.node_name);
            let Some(node_def) = node_def else {
                tracing::warn!(
                    lab_id = %ns.lab_id,
                    node = %ns.node_name,
                    "clearing orphaned image sync marker: no node definition"
                );
                service.clear_node_sync_status(&ns.lab_id, &ns.node_name);
                continue;
            };

            let Some(placement) = self.ctx.store.get_placement(&ns.lab_id, &ns.node_name) else {
                tracing::warn!(
                    lab_id = %ns.lab_id,
                    node = %ns.node_name,
                    "clearing orphaned image sync marker: no placement"
                );
                service.clear_node_sync_status(&ns.lab_id, &ns.node_name);
                continue;
            };

            if self
                .ctx
                .store
                .active_image_sync_for(&node_def.image, &placement.host_id)
                .is_some()
            {
                continue;
            }

            tracing::warn!(
                lab_id = %ns.lab_id,
                node = %ns.node_name,
                status = ?ns.image_sync_status,
                "clearing orphaned image sync marker: no active sync job"
            );
            service.clear_node_sync_status(&ns.lab_id, &ns.node_name);
        }
    }

    /// Agent self-update jobs stuck in an active state or assigned to
    /// an offline host.
    fn check_stuck_agent_updates(&self) {
        let now = self.ctx.now_ms();
        let timeout_ms = self.ctx.settings.agent_update_timeout * 1000;

        for job in self.ctx.store.active_agent_update_jobs() {
            let host = self.ctx.store.get_host(&job.host_id);
            let host_offline = host.as_ref().map(|h| !self.ctx.is_host_online(h)).unwrap_or(true);
            let timed_out = now.saturating_sub(job.reference_ms()) > timeout_ms;

            let reason = if host_offline {
                let host_name = host
                    .map(|h| h.name)
                    .unwrap_or_else(|| job.host_id.to_string());
                format!("Agent {host_name} went offline during update")
            } else if timed_out {
                let age_min = now.saturating_sub(job.reference_ms()) / 60_000;
                format!("Timed out after {age_min} minutes in '{}' state", job.status)
            } else {
                continue;
            };

            tracing::warn!(
                job_id = %job.id,
                host_id = %job.host_id,
                status = %job.status,
                reason = %reason,
                "detected stuck agent update job"
            );
            self.ctx.store.with_agent_update_job(&job.id, |row| {
                row.status = lm_core::AgentUpdateStatus::Failed;
                row.error_message = Some(reason.clone());
                row.completed_at_ms = Some(now);
            });
        }
    }
}

/// Append to an inline log, or to the log file when the stored value is
/// a path (legacy file-backed logs).
fn append_to_log(job: &mut Job, line: &str) {
    if let Some(value) = &job.log {
        if is_file_path(value) {
            if let Ok(mut file) = std::fs::OpenOptions::new().append(true).open(value) {
                use std::io::Write;
                let _ = writeln!(file, "\n{line}");
                return;
            }
        }
    }
    job.append_log(line);
}

/// Heuristic: the stored log value names an existing absolute file
/// rather than holding inline content.
fn is_file_path(value: &str) -> bool {
    if value.contains('\n') || value.len() > 4096 || !value.starts_with('/') {
        return false;
    }
    Path::new(value).is_file()
}

/// Inline log content, or the tail of a file-backed log.
fn read_log_for_classification(log: Option<&str>) -> Option<String> {
    let value = log?;
    if !is_file_path(value) {
        return Some(value.to_string());
    }
    let text = std::fs::read_to_string(value).ok()?;
    if text.len() > LOG_TAIL_BYTES {
        // Tail from a char boundary.
        let start = text.len() - LOG_TAIL_BYTES;
        let start = (start..text.len()).find(|i| text.is_char_boundary(*i))?;
        Some(text[start..].to_string())
    } else {
        Some(text)
    }
}

/// Deterministic failures that a retry cannot fix. Matched against the
/// lowercased log tail.
fn non_retryable_signature(action: &str, log_text: Option<&str>) -> Option<&'static str> {
    let text = log_text?.to_lowercase();

    const CHECKS: &[(&[&str], &str)] = &[
        (
            &[
                "no image found",
                "no image available",
                "required images not available on agent",
                "upload/sync required images",
            ],
            "missing_image",
        ),
        (
            &[
                "explicit host assignments failed",
                "missing or unhealthy agents for hosts",
                "assigned host",
                "no healthy agent available",
            ],
            "host_assignment_or_agent_unavailable",
        ),
        (
            &["libvirt error", "domain not found", "unsupported configuration"],
            "libvirt_runtime_error",
        ),
        (
            &["per-link tunnel creation failed", "could not find ovs port"],
            "link_tunnel_creation_failed",
        ),
    ];

    for (needles, reason) in CHECKS {
        if needles.iter().any(|needle| text.contains(needle)) {
            return Some(reason);
        }
    }

    // Sync retries are expensive; known partial-failure markers are
    // final.
    if (action.starts_with("sync:") || action == "sync")
        && text.contains("completed with ")
        && text.contains("error")
    {
        return Some("sync_partial_failure");
    }

    None
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
