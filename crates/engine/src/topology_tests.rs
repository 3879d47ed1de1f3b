// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_support::Harness;
use lm_core::LabState;
use yare::parameterized;

#[parameterized(
    plain_eth = { "eth1", "eth1" },
    arista = { "Ethernet3", "eth3" },
    arista_short = { "et3", "eth3" },
    cisco_gige = { "GigabitEthernet0/1", "eth1" },
    cisco_fast = { "FastEthernet0/0", "eth0" },
    juniper = { "ge-0/0/2", "eth2" },
    management = { "Management1", "eth0" },
    mgmt = { "mgmt0", "eth0" },
    uppercase_eth = { "ETH2", "eth2" },
    unknown = { "swp1x", "swp1x" },
)]
fn interface_normalization(input: &str, expected: &str) {
    assert_eq!(normalize_interface(input), expected);
}

#[test]
fn analyze_placements_groups_by_host_and_finds_cross_host_links() {
    let h = Harness::new();
    let host_a = h.add_host("host-a");
    let host_b = h.add_host("host-b");
    let lab = h.add_lab(LabState::Undeployed);

    let n1 = h.add_node(&lab, "r1", Some(&host_a));
    let n2 = h.add_node(&lab, "r2", Some(&host_b));
    let n3 = h.add_node(&lab, "r3", Some(&host_a));
    h.add_link(&lab, &n1, "eth1", &n2, "eth1"); // cross-host
    h.add_link(&lab, &n1, "eth2", &n3, "eth1"); // same-host

    let topo = TopologyService::new(&h.store);
    let analysis = topo.analyze_placements(&lab.id);

    assert_eq!(analysis.placements.len(), 2);
    assert_eq!(analysis.placements[&host_a.id].len(), 2);
    assert_eq!(analysis.placements[&host_b.id].len(), 1);
    assert_eq!(analysis.cross_host_links.len(), 1);
    assert!(analysis.unplaced.is_empty());
}

#[test]
fn placement_falls_back_to_affinity_rows() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Undeployed);
    let node = h.add_node(&lab, "r1", None);
    h.store.upsert_placement(
        lm_core::NodePlacement::builder()
            .lab_id(lab.id)
            .node_name("r1")
            .host_id(host.id)
            .build(),
    );

    let topo = TopologyService::new(&h.store);
    assert_eq!(topo.resolve_node_host(&node), Some(host.id));

    let analysis = topo.analyze_placements(&lab.id);
    assert_eq!(analysis.placements[&host.id].len(), 1);
}

#[test]
fn unplaced_nodes_are_reported() {
    let h = Harness::new();
    let lab = h.add_lab(LabState::Undeployed);
    h.add_node(&lab, "floating", None);

    let topo = TopologyService::new(&h.store);
    let analysis = topo.analyze_placements(&lab.id);
    assert_eq!(analysis.unplaced.len(), 1);
}

#[test]
fn deploy_topology_filters_to_host_and_normalizes_links() {
    let h = Harness::new();
    let host_a = h.add_host("host-a");
    let host_b = h.add_host("host-b");
    let lab = h.add_lab(LabState::Undeployed);

    let n1 = h.add_node(&lab, "r1", Some(&host_a));
    let n2 = h.add_node(&lab, "r2", Some(&host_a));
    let n3 = h.add_node(&lab, "r3", Some(&host_b));
    h.add_link(&lab, &n1, "Ethernet1", &n2, "Ethernet1"); // same host, vendor names
    h.add_link(&lab, &n1, "eth2", &n3, "eth1"); // cross host, excluded

    let topo = TopologyService::new(&h.store);
    let payload = topo.build_deploy_topology(&lab, &host_a.id);

    assert_eq!(payload.lab_id, lab.id.to_string());
    assert_eq!(payload.nodes.len(), 2);
    assert_eq!(payload.links.len(), 1);
    assert_eq!(payload.links[0].source_interface, "eth1");
    assert_eq!(payload.links[0].target_interface, "eth1");
}

#[test]
fn required_images_are_deduplicated() {
    let h = Harness::new();
    let lab = h.add_lab(LabState::Undeployed);
    h.add_node(&lab, "r1", None);
    h.add_node(&lab, "r2", None);

    let topo = TopologyService::new(&h.store);
    let images = topo.get_required_images(&lab.id);
    assert_eq!(images, vec!["alpine:latest".to_string()]);

    let map = topo.get_image_to_nodes_map(&lab.id);
    assert_eq!(map["alpine:latest"].len(), 2);
}
