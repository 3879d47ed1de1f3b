// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State-change events and the broadcast bus.
//!
//! Every path that commits a node, link, lab, or job state change
//! publishes here for UI consumers. Publishing is fire-and-forget:
//! it never blocks and never fails the caller. Consumers must tolerate
//! reordering and loss (slow receivers are lagged out by the channel).

use crate::actions::JobAction;
use crate::host::HostId;
use crate::job::JobId;
use crate::lab::LabId;
use crate::state::{
    ImageSyncState, JobStatus, LabState, LinkActualState, LinkDesiredState, NodeActualState,
    NodeDesiredState,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default bus capacity; slow consumers past this lose events.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    NodeStateChanged {
        lab_id: LabId,
        node_id: String,
        node_name: String,
        desired_state: NodeDesiredState,
        actual_state: NodeActualState,
        is_ready: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_id: Option<HostId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_name: Option<String>,
    },
    LinkStateChanged {
        lab_id: LabId,
        link_name: String,
        desired_state: LinkDesiredState,
        actual_state: LinkActualState,
        source_node: String,
        target_node: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    LabStateChanged {
        lab_id: LabId,
        state: LabState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_error: Option<String>,
    },
    JobProgress {
        lab_id: LabId,
        job_id: JobId,
        action: JobAction,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    EnforcementFailed {
        lab_id: LabId,
        node_id: String,
        node_name: String,
        attempts: u32,
    },
    ImageSyncCleared {
        lab_id: LabId,
        node_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<ImageSyncState>,
    },
}

/// Fire-and-forget event bus for UI consumers.
///
/// `publish` drops events when nobody is subscribed; that is fine — the
/// store remains the source of truth and the UI re-syncs on connect.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Event>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event; never blocks, never errors.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers (for diagnostics).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
