// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job table accessors.

use super::Store;
use lm_core::{HostId, Job, JobId, LabId};

impl Store {
    pub fn insert_job(&self, job: Job) {
        self.write().jobs.insert(job.id, job);
    }

    pub fn get_job(&self, id: &JobId) -> Option<Job> {
        self.read().jobs.get(id).cloned()
    }

    pub fn with_job(&self, id: &JobId, f: impl FnOnce(&mut Job)) -> bool {
        let mut tables = self.write();
        match tables.jobs.get_mut(id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.read().jobs.values().cloned().collect()
    }

    /// All queued/running jobs.
    pub fn active_jobs(&self) -> Vec<Job> {
        self.read()
            .jobs
            .values()
            .filter(|j| j.status.is_active())
            .cloned()
            .collect()
    }

    pub fn active_jobs_for_lab(&self, lab_id: &LabId) -> Vec<Job> {
        self.read()
            .jobs
            .values()
            .filter(|j| j.status.is_active() && j.lab_id == *lab_id)
            .cloned()
            .collect()
    }

    /// Any active job for the lab (reconciliation skip check).
    pub fn any_active_job_for_lab(&self, lab_id: &LabId) -> Option<Job> {
        self.read()
            .jobs
            .values()
            .find(|j| j.status.is_active() && j.lab_id == *lab_id)
            .cloned()
    }

    /// Active deploy/destroy for the lab (blocks enforcement).
    pub fn active_lab_wide_job(&self, lab_id: &LabId) -> Option<Job> {
        self.read()
            .jobs
            .values()
            .find(|j| j.status.is_active() && j.lab_id == *lab_id && j.action.is_lab_wide())
            .cloned()
    }

    /// Active job touching a specific node of a lab.
    pub fn active_job_for_node(&self, lab_id: &LabId, node_id: &str) -> Option<Job> {
        self.read()
            .jobs
            .values()
            .find(|j| {
                j.status.is_active()
                    && j.lab_id == *lab_id
                    && j.node_ids.iter().any(|n| n == node_id)
            })
            .cloned()
    }

    /// An active job with the same lab and action, excluding `except`
    /// (retry deduplication).
    pub fn duplicate_active_job(&self, job: &Job) -> Option<Job> {
        self.read()
            .jobs
            .values()
            .find(|j| {
                j.id != job.id
                    && j.status.is_active()
                    && j.lab_id == job.lab_id
                    && j.action == job.action
            })
            .cloned()
    }

    /// Active children of a parent job.
    pub fn active_children(&self, parent_id: &JobId) -> Vec<Job> {
        self.read()
            .jobs
            .values()
            .filter(|j| j.status.is_active() && j.parent_job_id == Some(*parent_id))
            .cloned()
            .collect()
    }

    /// Queued jobs with no agent assigned, older than the cutoff.
    pub fn orphaned_queued_jobs(&self, cutoff_ms: u64) -> Vec<Job> {
        self.read()
            .jobs
            .values()
            .filter(|j| {
                j.status == lm_core::JobStatus::Queued
                    && j.agent_id.is_none()
                    && j.created_at_ms < cutoff_ms
            })
            .cloned()
            .collect()
    }

    /// Active jobs assigned to any of the given hosts.
    pub fn active_jobs_on_hosts(&self, host_ids: &[HostId]) -> Vec<Job> {
        self.read()
            .jobs
            .values()
            .filter(|j| {
                j.status.is_active()
                    && j.agent_id.map(|a| host_ids.contains(&a)).unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}
