// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node placement accessors.

use super::Store;
use lm_core::{HostId, LabId, NodePlacement, PlacementStatus};
use std::collections::BTreeSet;

impl Store {
    /// Insert or update by (lab_id, node_name). Backfills the node
    /// definition FK when the existing row is missing it.
    pub fn upsert_placement(&self, placement: NodePlacement) {
        let mut tables = self.write();
        if let Some(existing) = tables
            .placements
            .iter_mut()
            .find(|p| p.lab_id == placement.lab_id && p.node_name == placement.node_name)
        {
            existing.host_id = placement.host_id;
            existing.status = placement.status;
            if existing.node_definition_id.is_none() {
                existing.node_definition_id = placement.node_definition_id;
            }
        } else {
            tables.placements.push(placement);
        }
    }

    pub fn get_placement(&self, lab_id: &LabId, node_name: &str) -> Option<NodePlacement> {
        self.read()
            .placements
            .iter()
            .find(|p| p.lab_id == *lab_id && p.node_name == node_name)
            .cloned()
    }

    pub fn placements_for_lab(&self, lab_id: &LabId) -> Vec<NodePlacement> {
        self.read()
            .placements
            .iter()
            .filter(|p| p.lab_id == *lab_id)
            .cloned()
            .collect()
    }

    /// Distinct hosts with placements for a lab.
    pub fn placement_hosts_for_lab(&self, lab_id: &LabId) -> BTreeSet<HostId> {
        self.read()
            .placements
            .iter()
            .filter(|p| p.lab_id == *lab_id)
            .map(|p| p.host_id)
            .collect()
    }

    pub fn set_placement_status(
        &self,
        lab_id: &LabId,
        node_name: &str,
        status: PlacementStatus,
    ) -> bool {
        let mut tables = self.write();
        match tables
            .placements
            .iter_mut()
            .find(|p| p.lab_id == *lab_id && p.node_name == node_name)
        {
            Some(p) => {
                p.status = status;
                true
            }
            None => false,
        }
    }

    pub fn delete_placement(&self, lab_id: &LabId, node_name: &str) {
        self.write()
            .placements
            .retain(|p| !(p.lab_id == *lab_id && p.node_name == node_name));
    }

    pub fn delete_placements_for_lab_host(&self, lab_id: &LabId, host_id: &HostId) {
        self.write()
            .placements
            .retain(|p| !(p.lab_id == *lab_id && p.host_id == *host_id));
    }

    pub fn delete_placements_for_lab(&self, lab_id: &LabId) {
        self.write().placements.retain(|p| p.lab_id != *lab_id);
    }

    /// Backfill missing node-definition FKs from container names.
    /// Returns the number of rows repaired.
    pub fn backfill_placement_node_ids(&self, lab_id: &LabId) -> usize {
        let mut tables = self.write();
        let node_ids: Vec<(String, lm_core::NodeId)> = tables
            .nodes
            .values()
            .filter(|n| n.lab_id == *lab_id)
            .map(|n| (n.container_name.clone(), n.id))
            .collect();

        let mut count = 0;
        for p in tables
            .placements
            .iter_mut()
            .filter(|p| p.lab_id == *lab_id && p.node_definition_id.is_none())
        {
            if let Some((_, id)) = node_ids.iter().find(|(name, _)| *name == p.node_name) {
                p.node_definition_id = Some(*id);
                count += 1;
            }
        }
        count
    }
}
