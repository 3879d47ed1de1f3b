// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Read-side over the authored topology.
//!
//! Pure queries: which nodes/links a lab has, which host each node
//! resolves to (definition first, placement as affinity fallback), and
//! the per-host deploy payload an agent consumes.

use indexmap::IndexMap;
use lm_adapters::{DeployLink, DeployNode, DeployTopology};
use lm_core::{HostId, Lab, LabId, Link, Node};
use lm_storage::Store;
use std::collections::BTreeSet;

/// Result of resolving a lab's nodes onto hosts.
#[derive(Debug, Default)]
pub struct PlacementAnalysis {
    /// host → nodes resolved to it (insertion-ordered for stable
    /// payloads and logs).
    pub placements: IndexMap<HostId, Vec<Node>>,
    /// Links whose endpoints resolve to different hosts.
    pub cross_host_links: Vec<Link>,
    /// Nodes with no resolvable host.
    pub unplaced: Vec<Node>,
}

pub struct TopologyService<'a> {
    store: &'a Store,
}

impl<'a> TopologyService<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn get_nodes(&self, lab_id: &LabId) -> Vec<Node> {
        self.store.nodes_for_lab(lab_id)
    }

    pub fn get_links(&self, lab_id: &LabId) -> Vec<Link> {
        self.store.links_for_lab(lab_id)
    }

    pub fn has_nodes(&self, lab_id: &LabId) -> bool {
        self.store.has_nodes(lab_id)
    }

    /// Resolve one node's host: explicit assignment wins, then
    /// placement affinity.
    pub fn resolve_node_host(&self, node: &Node) -> Option<HostId> {
        if let Some(host_id) = node.host_id {
            return Some(host_id);
        }
        self.store
            .get_placement(&node.lab_id, &node.container_name)
            .map(|p| p.host_id)
    }

    /// Group a lab's nodes by resolved host and classify links.
    pub fn analyze_placements(&self, lab_id: &LabId) -> PlacementAnalysis {
        let mut analysis = PlacementAnalysis::default();
        let nodes = self.get_nodes(lab_id);

        let mut node_hosts: IndexMap<String, Option<HostId>> = IndexMap::new();
        for node in nodes {
            let host = self.resolve_node_host(&node);
            node_hosts.insert(node.container_name.clone(), host);
            match host {
                Some(host_id) => analysis.placements.entry(host_id).or_default().push(node),
                None => analysis.unplaced.push(node),
            }
        }

        for link in self.get_links(lab_id) {
            let source = self.store.get_node(&link.source_node_id);
            let target = self.store.get_node(&link.target_node_id);
            let (source, target) = match (source, target) {
                (Some(s), Some(t)) => (s, t),
                _ => continue,
            };
            let source_host = node_hosts.get(&source.container_name).copied().flatten();
            let target_host = node_hosts.get(&target.container_name).copied().flatten();
            if let (Some(sh), Some(th)) = (source_host, target_host) {
                if sh != th {
                    analysis.cross_host_links.push(link);
                }
            }
        }

        analysis
    }

    /// The deploy payload for one host: its nodes plus the same-host
    /// links with both endpoints on it. Links are pre-normalized so the
    /// agent works with kernel interface names. External nodes are not
    /// containers and never appear in the payload; their links go
    /// through the dedicated external-connect operation instead.
    pub fn build_deploy_topology(&self, lab: &Lab, host_id: &HostId) -> DeployTopology {
        let analysis = self.analyze_placements(&lab.id);
        let host_nodes: Vec<Node> = analysis
            .placements
            .get(host_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|n| !n.is_external())
            .collect();
        let host_node_names: BTreeSet<&str> =
            host_nodes.iter().map(|n| n.container_name.as_str()).collect();

        let mut links = Vec::new();
        for link in self.get_links(&lab.id) {
            let source = self.store.get_node(&link.source_node_id);
            let target = self.store.get_node(&link.target_node_id);
            let (source, target) = match (source, target) {
                (Some(s), Some(t)) => (s, t),
                _ => continue,
            };
            if host_node_names.contains(source.container_name.as_str())
                && host_node_names.contains(target.container_name.as_str())
            {
                links.push(DeployLink {
                    source_node: source.container_name,
                    source_interface: normalize_interface(&link.source_interface),
                    target_node: target.container_name,
                    target_interface: normalize_interface(&link.target_interface),
                    vlan: link.vlan,
                });
            }
        }

        DeployTopology {
            lab_id: lab.id.to_string(),
            nodes: host_nodes
                .into_iter()
                .map(|n| DeployNode {
                    name: n.container_name,
                    device: n.device,
                    image: n.image,
                    memory_mb: n.memory_mb,
                    cpu_cores: n.cpu_cores,
                })
                .collect(),
            links,
        }
    }

    /// Distinct image references a lab needs (external nodes run no
    /// container and need none).
    pub fn get_required_images(&self, lab_id: &LabId) -> Vec<String> {
        let mut images = BTreeSet::new();
        for node in self.get_nodes(lab_id) {
            if node.is_external() {
                continue;
            }
            images.insert(node.image);
        }
        images.into_iter().collect()
    }

    /// image reference → container names using it.
    pub fn get_image_to_nodes_map(&self, lab_id: &LabId) -> IndexMap<String, Vec<String>> {
        let mut map: IndexMap<String, Vec<String>> = IndexMap::new();
        for node in self.get_nodes(lab_id) {
            if node.is_external() {
                continue;
            }
            map.entry(node.image).or_default().push(node.container_name);
        }
        map
    }

    /// Rewrite a lab's link-state interface names to their normalized
    /// form. Returns the number of rows touched. The authored names are
    /// preserved on the link definitions for display.
    pub fn normalize_links_for_lab(&self, lab_id: &LabId) -> usize {
        let mut normalized = 0;
        for ls in self.store.link_states_for_lab(lab_id) {
            let source = normalize_interface(&ls.source_interface);
            let target = normalize_interface(&ls.target_interface);
            if source != ls.source_interface || target != ls.target_interface {
                self.store.with_link_state(lab_id, &ls.link_name, |row| {
                    row.source_interface = source;
                    row.target_interface = target;
                });
                normalized += 1;
            }
        }
        normalized
    }
}

/// Map vendor interface aliases onto kernel names for bookkeeping:
/// `Ethernet3` → `eth3`, `GigabitEthernet0/1` → `eth1`,
/// `Management1` → `eth0`, `et3` → `eth3`, `ge-0/0/2` → `eth2`.
/// Unrecognized names pass through unchanged.
pub fn normalize_interface(name: &str) -> String {
    let lower = name.to_ascii_lowercase();

    if lower.starts_with("eth") && lower[3..].chars().all(|c| c.is_ascii_digit()) {
        return lower;
    }

    // Management interfaces map to the first port.
    if lower.starts_with("management") || lower.starts_with("mgmt") {
        return "eth0".to_string();
    }

    // Juniper style: ge-0/0/2, xe-0/1/3 — last component is the port.
    if let Some(rest) = lower.split_once('-').map(|(_, r)| r) {
        if rest.contains('/') {
            if let Some(port) = rest.rsplit('/').next() {
                if let Ok(n) = port.parse::<u32>() {
                    return format!("eth{n}");
                }
            }
        }
    }

    // Slash-style (GigabitEthernet0/1, FastEthernet0/0): last number wins.
    if lower.contains('/') {
        if let Some(port) = lower.rsplit('/').next() {
            if let Ok(n) = port.parse::<u32>() {
                return format!("eth{n}");
            }
        }
    }

    // Trailing-number style (Ethernet3, et3, e1).
    let digits: String = lower.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        let prefix = &lower[..lower.len() - digits.len()];
        if matches!(prefix, "ethernet" | "et" | "e" | "eth") {
            let number: String = digits.chars().rev().collect();
            return format!("eth{number}");
        }
    }

    name.to_string()
}

#[cfg(test)]
#[path = "topology_tests.rs"]
mod tests;
