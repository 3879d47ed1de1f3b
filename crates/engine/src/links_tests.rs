// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_support::Harness;
use lm_adapters::{AgentCall, FakeFailure};
use lm_core::{
    LabState, LinkActualState, NodeActualState, NodeDesiredState, OperState, TunnelStatus,
};

/// Two-node lab; both nodes running on their hosts.
fn two_host_lab(h: &Harness) -> (lm_core::Lab, lm_core::Host, lm_core::Host) {
    let host_a = h.add_host("host-a");
    let host_b = h.add_host("host-b");
    let lab = h.add_lab(LabState::Running);
    let n1 = h.add_node(&lab, "r1", Some(&host_a));
    let n2 = h.add_node(&lab, "r2", Some(&host_b));
    h.add_link(&lab, &n1, "eth1", &n2, "eth1");
    h.set_node_state(&lab, "r1", NodeDesiredState::Running, NodeActualState::Running);
    h.set_node_state(&lab, "r2", NodeDesiredState::Running, NodeActualState::Running);
    (lab, host_a, host_b)
}

#[test]
fn ensure_link_states_is_idempotent() {
    let h = Harness::new();
    let (lab, _, _) = two_host_lab(&h);

    let orchestrator = LinkOrchestrator::new(&h.ctx);
    assert_eq!(orchestrator.ensure_link_states(&lab), 1);
    assert_eq!(orchestrator.ensure_link_states(&lab), 0);

    let states = h.store.link_states_for_lab(&lab.id);
    assert_eq!(states.len(), 1);
    assert!(states[0].is_cross_host);
    assert_eq!(states[0].desired_state, lm_core::LinkDesiredState::Up);
}

#[tokio::test]
async fn cross_host_link_creates_exactly_one_active_tunnel() {
    let h = Harness::new();
    let (lab, host_a, host_b) = two_host_lab(&h);

    let orchestrator = LinkOrchestrator::new(&h.ctx);
    let mut log = Vec::new();
    let (ok, failed) = orchestrator.create_deployment_links(&lab, &mut log).await;
    assert_eq!((ok, failed), (1, 0));

    let ls = &h.store.link_states_for_lab(&lab.id)[0];
    assert_eq!(ls.actual_state, LinkActualState::Up);
    assert!(ls.is_cross_host);
    assert_eq!(ls.source_oper_state, OperState::Up);
    assert_eq!(ls.target_oper_state, OperState::Up);

    // Exactly one tunnel, VNI in range, VLAN in [3000, 4000).
    let tunnels = h.store.tunnels_for_lab(&lab.id);
    assert_eq!(tunnels.len(), 1);
    let tunnel = &tunnels[0];
    assert_eq!(tunnel.status, TunnelStatus::Active);
    let settings = &h.ctx.settings;
    assert!((settings.vxlan_vni_base..=settings.vxlan_vni_max).contains(&tunnel.vni));
    assert!((3000..4000).contains(&tunnel.vlan_tag));

    // Both sides were configured.
    let setups: Vec<AgentCall> = h
        .agent
        .calls()
        .into_iter()
        .filter(|c| matches!(c, AgentCall::SetupCrossHostLink { .. }))
        .collect();
    assert_eq!(setups.len(), 2);

    // Re-running is a no-op: still one tunnel, no extra setup calls.
    h.agent.clear_calls();
    let (ok, failed) = orchestrator.create_deployment_links(&lab, &mut log).await;
    assert_eq!((ok, failed), (0, 0));
    assert_eq!(h.store.tunnels_for_lab(&lab.id).len(), 1);
    assert_eq!(h.agent.call_count("setup_cross_host_link"), 0);
    let _ = (host_a, host_b);
}

#[tokio::test]
async fn same_host_link_hot_connects_with_vlan() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Running);
    let n1 = h.add_node(&lab, "r1", Some(&host));
    let n2 = h.add_node(&lab, "r2", Some(&host));
    h.add_link(&lab, &n1, "Ethernet1", &n2, "Ethernet1");
    h.set_node_state(&lab, "r1", NodeDesiredState::Running, NodeActualState::Running);
    h.set_node_state(&lab, "r2", NodeDesiredState::Running, NodeActualState::Running);

    let orchestrator = LinkOrchestrator::new(&h.ctx);
    let mut log = Vec::new();
    let (ok, failed) = orchestrator.create_deployment_links(&lab, &mut log).await;
    assert_eq!((ok, failed), (1, 0));

    let ls = &h.store.link_states_for_lab(&lab.id)[0];
    assert_eq!(ls.actual_state, LinkActualState::Up);
    assert!(!ls.is_cross_host);
    assert!(ls.vlan_tag.is_some());
    assert!(h.store.tunnels_for_lab(&lab.id).is_empty());

    // The hot-connect used normalized interface names.
    let connect = h
        .agent
        .calls()
        .into_iter()
        .find_map(|c| match c {
            AgentCall::ConnectLink { endpoints, .. } => Some(endpoints),
            _ => None,
        })
        .unwrap();
    assert!(connect.contains(":eth1"));
    assert!(!connect.contains("Ethernet"));
}

#[tokio::test]
async fn links_wait_for_both_endpoints() {
    let h = Harness::new();
    let (lab, _, _) = two_host_lab(&h);
    h.set_node_state(&lab, "r2", NodeDesiredState::Running, NodeActualState::Starting);

    let orchestrator = LinkOrchestrator::new(&h.ctx);
    let mut log = Vec::new();
    let (ok, failed) = orchestrator.create_deployment_links(&lab, &mut log).await;
    assert_eq!((ok, failed), (0, 0));
    assert!(h.store.tunnels_for_lab(&lab.id).is_empty());
    assert!(log.iter().any(|l| l.contains("endpoints not ready")));
}

#[tokio::test]
async fn agent_refusal_marks_link_error_and_tunnel_failed() {
    let h = Harness::new();
    let (lab, _, _) = two_host_lab(&h);
    h.agent.fail_once(
        "setup_cross_host_link",
        FakeFailure::Permanent("per-link tunnel creation failed".into()),
    );

    let orchestrator = LinkOrchestrator::new(&h.ctx);
    let mut log = Vec::new();
    let (ok, failed) = orchestrator.create_deployment_links(&lab, &mut log).await;
    assert_eq!((ok, failed), (0, 1));

    let ls = &h.store.link_states_for_lab(&lab.id)[0];
    assert_eq!(ls.actual_state, LinkActualState::Error);
    assert!(ls.error_message.is_some());

    let tunnel = &h.store.tunnels_for_lab(&lab.id)[0];
    assert_eq!(tunnel.status, TunnelStatus::Failed);
}

#[tokio::test]
async fn endpoint_swap_after_migration_updates_tunnel_in_place() {
    let h = Harness::new();
    let (lab, host_a, _host_b) = two_host_lab(&h);
    let orchestrator = LinkOrchestrator::new(&h.ctx);
    let mut log = Vec::new();
    orchestrator.create_deployment_links(&lab, &mut log).await;
    let original = h.store.tunnels_for_lab(&lab.id)[0].clone();

    // r2 migrates onto a new host.
    let host_c = h.add_host("host-c");
    h.store.set_node_host(&lab.id, "r2", Some(host_c.id));
    h.store.with_link_state(&lab.id, &original.link_name, |row| {
        row.actual_state = LinkActualState::Error;
    });

    orchestrator
        .connect_link(&lab, &h.store.get_link_state(&lab.id, &original.link_name).unwrap())
        .await
        .unwrap();

    let tunnels = h.store.tunnels_for_lab(&lab.id);
    assert_eq!(tunnels.len(), 1);
    let updated = &tunnels[0];
    assert_eq!(updated.id, original.id);
    assert_eq!(updated.vni, original.vni);
    assert!(updated.matches_endpoints(host_a.id, host_c.id));
}

#[tokio::test]
async fn external_link_missing_managed_interface_errors() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Running);
    let r1 = h.add_node(&lab, "r1", Some(&host));
    let ext = h.add_external_node(&lab, "ext1", &host, None);
    h.add_link(&lab, &r1, "eth1", &ext, "_external");
    h.set_node_state(&lab, "r1", NodeDesiredState::Running, NodeActualState::Running);

    let orchestrator = LinkOrchestrator::new(&h.ctx);
    let mut log = Vec::new();
    let (ok, failed) = orchestrator.create_deployment_links(&lab, &mut log).await;
    assert_eq!((ok, failed), (0, 1));

    let ls = &h.store.link_states_for_lab(&lab.id)[0];
    assert_eq!(ls.actual_state, LinkActualState::Error);
    assert!(ls
        .error_message
        .as_deref()
        .unwrap_or("")
        .to_lowercase()
        .contains("managed interface"));
    // No agent attachment was attempted.
    assert_eq!(h.agent.call_count("connect_external"), 0);
}

#[tokio::test]
async fn external_link_attaches_to_host_interface() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Running);
    let interface = h.add_managed_interface(&host, "eth99");
    let r1 = h.add_node(&lab, "r1", Some(&host));
    let ext = h.add_external_node(&lab, "ext1", &host, Some(&interface));
    h.add_link(&lab, &r1, "eth1", &ext, "_external");
    h.set_node_state(&lab, "r1", NodeDesiredState::Running, NodeActualState::Running);

    let orchestrator = LinkOrchestrator::new(&h.ctx);
    let mut log = Vec::new();
    let (ok, failed) = orchestrator.create_deployment_links(&lab, &mut log).await;
    assert_eq!((ok, failed), (1, 0));

    let ls = &h.store.link_states_for_lab(&lab.id)[0];
    assert_eq!(ls.actual_state, LinkActualState::Up);
    assert_eq!(ls.source_oper_state, OperState::Up);
    assert_eq!(ls.target_oper_state, OperState::Up);
    assert!(ls.vlan_tag.is_some());
    // External links never get tunnels.
    assert!(h.store.tunnels_for_lab(&lab.id).is_empty());

    // The agent attached the device container to the host interface.
    let attach = h
        .agent
        .calls()
        .into_iter()
        .find_map(|c| match c {
            AgentCall::ConnectExternal { host, container, host_interface, .. } => {
                Some((host, container, host_interface))
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(attach.0, host.id.to_string());
    assert_eq!(attach.1, lab.container_name("r1"));
    assert_eq!(attach.2, "eth99");
}

#[tokio::test]
async fn external_link_on_foreign_interface_host_errors() {
    let h = Harness::new();
    let host_a = h.add_host("host-a");
    let host_b = h.add_host("host-b");
    let lab = h.add_lab(LabState::Running);
    // Interface provisioned on the wrong host.
    let interface = h.add_managed_interface(&host_b, "eth99");
    let r1 = h.add_node(&lab, "r1", Some(&host_a));
    let ext = h.add_external_node(&lab, "ext1", &host_a, Some(&interface));
    h.add_link(&lab, &r1, "eth1", &ext, "_external");
    h.set_node_state(&lab, "r1", NodeDesiredState::Running, NodeActualState::Running);

    let orchestrator = LinkOrchestrator::new(&h.ctx);
    let mut log = Vec::new();
    let (ok, failed) = orchestrator.create_deployment_links(&lab, &mut log).await;
    assert_eq!((ok, failed), (0, 1));
    assert_eq!(h.agent.call_count("connect_external"), 0);

    let ls = &h.store.link_states_for_lab(&lab.id)[0];
    assert_eq!(ls.actual_state, LinkActualState::Error);
    assert!(ls.error_message.as_deref().unwrap_or("").contains("managed interface"));
}

#[tokio::test]
async fn teardown_removes_tunnels_and_link_states() {
    let h = Harness::new();
    let (lab, host_a, host_b) = two_host_lab(&h);
    h.store.upsert_placement(
        lm_core::NodePlacement::builder().lab_id(lab.id).node_name("r1").host_id(host_a.id).build(),
    );
    h.store.upsert_placement(
        lm_core::NodePlacement::builder().lab_id(lab.id).node_name("r2").host_id(host_b.id).build(),
    );

    let orchestrator = LinkOrchestrator::new(&h.ctx);
    let mut log = Vec::new();
    orchestrator.create_deployment_links(&lab, &mut log).await;
    assert_eq!(h.store.tunnels_for_lab(&lab.id).len(), 1);

    let (ok, failed) = orchestrator.teardown_deployment_links(&lab, &mut log).await;
    assert_eq!(failed, 0);
    assert_eq!(ok, 2);
    assert!(h.store.tunnels_for_lab(&lab.id).is_empty());
    assert!(h.store.link_states_for_lab(&lab.id).is_empty());
    assert_eq!(h.agent.call_count("cleanup_overlay"), 2);
}
