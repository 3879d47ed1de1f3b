// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lab, node-definition, and link-definition accessors (the read-side
//! the topology service consumes).

use super::Store;
use lm_core::{Lab, LabId, LabState, Link, LinkId, Node, NodeId};

impl Store {
    pub fn upsert_lab(&self, lab: Lab) {
        self.write().labs.insert(lab.id, lab);
    }

    pub fn get_lab(&self, id: &LabId) -> Option<Lab> {
        self.read().labs.get(id).cloned()
    }

    pub fn list_labs(&self) -> Vec<Lab> {
        self.read().labs.values().cloned().collect()
    }

    pub fn with_lab(&self, id: &LabId, f: impl FnOnce(&mut Lab)) -> bool {
        let mut tables = self.write();
        match tables.labs.get_mut(id) {
            Some(lab) => {
                f(lab);
                true
            }
            None => false,
        }
    }

    /// Update the derived lab state, stamping `state_updated_at_ms`.
    pub fn update_lab_state(
        &self,
        id: &LabId,
        state: LabState,
        error: Option<&str>,
        now_ms: u64,
    ) -> bool {
        self.with_lab(id, |lab| {
            lab.state = state;
            lab.state_error = error.map(str::to_string);
            lab.state_updated_at_ms = now_ms;
        })
    }

    pub fn labs_in_states(&self, states: &[LabState]) -> Vec<Lab> {
        self.read()
            .labs
            .values()
            .filter(|lab| states.contains(&lab.state))
            .cloned()
            .collect()
    }

    pub fn insert_node(&self, node: Node) {
        self.write().nodes.insert(node.id, node);
    }

    pub fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.read().nodes.get(id).cloned()
    }

    pub fn nodes_for_lab(&self, lab_id: &LabId) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .read()
            .nodes
            .values()
            .filter(|n| n.lab_id == *lab_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        nodes
    }

    pub fn has_nodes(&self, lab_id: &LabId) -> bool {
        self.read().nodes.values().any(|n| n.lab_id == *lab_id)
    }

    pub fn node_by_container_name(&self, lab_id: &LabId, container_name: &str) -> Option<Node> {
        self.read()
            .nodes
            .values()
            .find(|n| n.lab_id == *lab_id && n.container_name == container_name)
            .cloned()
    }

    pub fn node_by_display_id(&self, lab_id: &LabId, display_id: &str) -> Option<Node> {
        self.read()
            .nodes
            .values()
            .find(|n| n.lab_id == *lab_id && n.display_id == display_id)
            .cloned()
    }

    /// Change a node definition's explicit host assignment.
    pub fn set_node_host(
        &self,
        lab_id: &LabId,
        container_name: &str,
        host_id: Option<lm_core::HostId>,
    ) -> bool {
        let mut tables = self.write();
        match tables
            .nodes
            .values_mut()
            .find(|n| n.lab_id == *lab_id && n.container_name == container_name)
        {
            Some(node) => {
                node.host_id = host_id;
                true
            }
            None => false,
        }
    }

    pub fn insert_link(&self, link: Link) {
        self.write().links.insert(link.id, link);
    }

    pub fn get_link(&self, id: &LinkId) -> Option<Link> {
        self.read().links.get(id).cloned()
    }

    pub fn links_for_lab(&self, lab_id: &LabId) -> Vec<Link> {
        let mut links: Vec<Link> = self
            .read()
            .links
            .values()
            .filter(|l| l.lab_id == *lab_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| a.link_name.cmp(&b.link_name));
        links
    }
}
