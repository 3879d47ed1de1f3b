// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node placement: where a node's container currently lives.
//!
//! Distinct from `Node.host_id`, which is the *intended* host. Placements
//! are created and updated by the lifecycle manager and deleted when a
//! node migrates off a host.

use crate::host::HostId;
use crate::lab::LabId;
use crate::node::NodeId;
use crate::state::PlacementStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePlacement {
    pub lab_id: LabId,
    pub node_name: String,
    /// FK to the node definition, backfilled lazily for rows created
    /// before the FK existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_definition_id: Option<NodeId>,
    pub host_id: HostId,
    pub status: PlacementStatus,
}

crate::builder! {
    pub struct NodePlacementBuilder => NodePlacement {
        field {
            node_name: String = "n1",
            lab_id: LabId = LabId::from_string("lab-test"),
            host_id: HostId = HostId::from_string("hst-a"),
            status: PlacementStatus = PlacementStatus::Deployed,
        }
        option {
            node_definition_id: NodeId = None,
        }
    }
}
