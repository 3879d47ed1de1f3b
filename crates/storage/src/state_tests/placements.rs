// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::store_with_lab;
use lm_core::{
    HostId, LabState, Node, NodePlacement, PlacementStatus,
};

#[test]
fn upsert_updates_host_and_backfills_fk() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    let node = Node::builder().lab_id(lab_id).container_name("n1").build();
    let node_id = node.id;
    store.insert_node(node);

    store.upsert_placement(NodePlacement::builder().lab_id(lab_id).node_name("n1").build());

    let new_host = HostId::from_string("hst-new");
    store.upsert_placement(NodePlacement {
        lab_id,
        node_name: "n1".to_string(),
        node_definition_id: Some(node_id),
        host_id: new_host,
        status: PlacementStatus::Starting,
    });

    let placements = store.placements_for_lab(&lab_id);
    assert_eq!(placements.len(), 1);
    assert_eq!(placements[0].host_id, new_host);
    assert_eq!(placements[0].status, PlacementStatus::Starting);
    assert_eq!(placements[0].node_definition_id, Some(node_id));
}

#[test]
fn backfill_links_placements_to_definitions() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    let node = Node::builder().lab_id(lab_id).container_name("r1").build();
    let node_id = node.id;
    store.insert_node(node);
    store.upsert_placement(NodePlacement::builder().lab_id(lab_id).node_name("r1").build());
    store.upsert_placement(NodePlacement::builder().lab_id(lab_id).node_name("ghost").build());

    let repaired = store.backfill_placement_node_ids(&lab_id);
    assert_eq!(repaired, 1);
    assert_eq!(
        store.get_placement(&lab_id, "r1").unwrap().node_definition_id,
        Some(node_id)
    );
    assert!(store.get_placement(&lab_id, "ghost").unwrap().node_definition_id.is_none());
}

#[test]
fn delete_by_lab_and_host_scopes_correctly() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    let host_a = HostId::from_string("hst-a");
    let host_b = HostId::from_string("hst-b");
    store.upsert_placement(
        NodePlacement::builder().lab_id(lab_id).node_name("n1").host_id(host_a).build(),
    );
    store.upsert_placement(
        NodePlacement::builder().lab_id(lab_id).node_name("n2").host_id(host_b).build(),
    );

    store.delete_placements_for_lab_host(&lab_id, &host_a);
    let remaining = store.placements_for_lab(&lab_id);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].host_id, host_b);

    let hosts = store.placement_hosts_for_lab(&lab_id);
    assert_eq!(hosts.len(), 1);
    assert!(hosts.contains(&host_b));
}
