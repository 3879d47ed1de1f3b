// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lab deployment units.

use crate::host::{HostId, Provider};
use crate::state::LabState;
use serde::{Deserialize, Serialize};

crate::entity_id! {
    /// Unique identifier for a lab.
    pub struct LabId("lab-");
}

/// A deployment unit owned by a user.
///
/// `state` is a derived view over the lab's node states; reconciliation
/// recomputes it after every pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lab {
    pub id: LabId,
    pub name: String,
    pub owner: String,
    pub provider: Provider,
    pub state: LabState,
    /// Default agent for nodes without explicit placement or affinity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<HostId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_error: Option<String>,
    pub created_at_ms: u64,
    #[serde(default)]
    pub state_updated_at_ms: u64,
}

impl Lab {
    /// Sanitized lab suffix used in container names:
    /// `labmesh-{suffix}-{node}`.
    pub fn container_suffix(&self) -> String {
        let cleaned: String = self
            .id
            .as_str()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        cleaned.chars().take(20).collect()
    }

    /// Full container name for a node of this lab.
    pub fn container_name(&self, node_name: &str) -> String {
        let safe_node: String = node_name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        format!("labmesh-{}-{}", self.container_suffix(), safe_node)
    }
}

crate::builder! {
    pub struct LabBuilder => Lab {
        field {
            name: String = "lab-1",
            owner: String = "tester",
            provider: Provider = Provider::Container,
            state: LabState = LabState::Undeployed,
            created_at_ms: u64 = 1_700_000_000_000u64,
            state_updated_at_ms: u64 = 0u64,
        }
        option {
            agent_id: HostId = None,
            state_error: String = None,
        }
        init {
            id: LabId = LabId::new(),
        }
    }
}
