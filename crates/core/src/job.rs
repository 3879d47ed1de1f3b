// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job records.

use crate::actions::JobAction;
use crate::host::HostId;
use crate::lab::LabId;
use crate::state::JobStatus;
use serde::{Deserialize, Serialize};

crate::entity_id! {
    /// Unique identifier for a job.
    pub struct JobId("job-");
}

/// A unit of work against one lab.
///
/// Invariants: a completed ancestor never has active descendants, and a
/// retried job is always linked to its successor via `superseded_by_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub lab_id: LabId,
    /// None for system-initiated jobs (enforcement, reconciliation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub action: JobAction,
    pub status: JobStatus,
    #[serde(default)]
    pub retry_count: u32,
    /// Set on child jobs spawned for secondary hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<JobId>,
    /// Links a retried/cancelled job to its replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by_id: Option<JobId>,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    /// Bumped between phases so long deploys aren't killed mid-progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_ms: Option<u64>,
    /// Inline log content, or (legacy) an absolute path to a log file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<HostId>,
    /// Node ids this job operates on, for `sync:*` actions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<String>,
}

impl Job {
    pub fn new(lab_id: LabId, action: JobAction, now_ms: u64) -> Self {
        Self {
            id: JobId::new(),
            lab_id,
            user_id: None,
            action,
            status: JobStatus::Queued,
            retry_count: 0,
            parent_job_id: None,
            superseded_by_id: None,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            last_heartbeat_ms: None,
            log: None,
            agent_id: None,
            node_ids: Vec::new(),
        }
    }

    /// The reference point for stuck detection: the later of start time
    /// and last heartbeat, falling back to creation.
    pub fn liveness_reference_ms(&self) -> u64 {
        let base = self.started_at_ms.unwrap_or(self.created_at_ms);
        match self.last_heartbeat_ms {
            Some(hb) => base.max(hb),
            None => base,
        }
    }

    /// Whether the job has exceeded its per-action timeout at `now_ms`.
    pub fn is_stuck(&self, now_ms: u64) -> bool {
        if !self.status.is_active() {
            return false;
        }
        let timeout_ms = self.action.timeout().as_millis() as u64;
        now_ms.saturating_sub(self.liveness_reference_ms()) > timeout_ms
    }

    /// Append a line to the inline log.
    pub fn append_log(&mut self, line: &str) {
        match &mut self.log {
            Some(log) => {
                log.push('\n');
                log.push_str(line);
            }
            None => self.log = Some(line.to_string()),
        }
    }
}

crate::builder! {
    pub struct JobBuilder => Job {
        field {
            lab_id: LabId = LabId::from_string("lab-test"),
            action: JobAction = JobAction::Up,
            status: JobStatus = JobStatus::Queued,
            retry_count: u32 = 0u32,
            created_at_ms: u64 = 1_700_000_000_000u64,
            node_ids: Vec<String> = Vec::<String>::new(),
        }
        option {
            user_id: String = None,
            parent_job_id: JobId = None,
            superseded_by_id: JobId = None,
            started_at_ms: u64 = None,
            completed_at_ms: u64 = None,
            last_heartbeat_ms: u64 = None,
            log: String = None,
            agent_id: HostId = None,
        }
        init {
            id: JobId = JobId::new(),
        }
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
