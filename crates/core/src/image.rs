// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Image inventory, per-host sync state, and agent update jobs.

use crate::host::HostId;
use crate::state::{AgentUpdateStatus, ImageSyncJobStatus};
use serde::{Deserialize, Serialize};

crate::entity_id! {
    /// Unique identifier for an image sync job.
    pub struct ImageSyncJobId("isj-");
}

crate::entity_id! {
    /// Unique identifier for an agent update job.
    pub struct AgentUpdateJobId("auj-");
}

/// Per-(image, host) presence record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHost {
    /// Image reference, e.g. `ceos:4.32.0F` or a file-backed ref.
    pub image_ref: String,
    pub host_id: HostId,
    pub status: ImageSyncJobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub updated_at_ms: u64,
}

/// One sync of one image to one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSyncJob {
    pub id: ImageSyncJobId,
    pub image_ref: String,
    pub host_id: HostId,
    pub status: ImageSyncJobStatus,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ImageSyncJob {
    pub fn new(image_ref: impl Into<String>, host_id: HostId, now_ms: u64) -> Self {
        Self {
            id: ImageSyncJobId::new(),
            image_ref: image_ref.into(),
            host_id,
            status: ImageSyncJobStatus::Pending,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            error_message: None,
        }
    }

    /// Reference timestamp for timeout checks: start time when the
    /// transfer began, else creation.
    pub fn reference_ms(&self) -> u64 {
        self.started_at_ms.unwrap_or(self.created_at_ms)
    }
}

crate::builder! {
    pub struct ImageSyncJobBuilder => ImageSyncJob {
        field {
            image_ref: String = "alpine:latest",
            host_id: HostId = HostId::from_string("hst-a"),
            status: ImageSyncJobStatus = ImageSyncJobStatus::Pending,
            created_at_ms: u64 = 1_700_000_000_000u64,
        }
        option {
            started_at_ms: u64 = None,
            completed_at_ms: u64 = None,
            error_message: String = None,
        }
        init {
            id: ImageSyncJobId = ImageSyncJobId::new(),
        }
    }
}

/// Agent binary self-upgrade lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentUpdateJob {
    pub id: AgentUpdateJobId,
    pub host_id: HostId,
    pub target_version: String,
    pub status: AgentUpdateStatus,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AgentUpdateJob {
    pub fn reference_ms(&self) -> u64 {
        self.started_at_ms.unwrap_or(self.created_at_ms)
    }
}

crate::builder! {
    pub struct AgentUpdateJobBuilder => AgentUpdateJob {
        field {
            target_version: String = "1.2.0",
            host_id: HostId = HostId::from_string("hst-a"),
            status: AgentUpdateStatus = AgentUpdateStatus::Pending,
            created_at_ms: u64 = 1_700_000_000_000u64,
        }
        option {
            started_at_ms: u64 = None,
            completed_at_ms: u64 = None,
            error_message: String = None,
        }
        init {
            id: AgentUpdateJobId = AgentUpdateJobId::new(),
        }
    }
}
