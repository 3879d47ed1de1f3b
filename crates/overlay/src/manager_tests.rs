// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::command::{CommandOutput, FakeCommandRunner};
use std::path::Path;

fn manager(dir: &Path) -> OverlayManager<FakeCommandRunner> {
    let config = OverlayConfig {
        bridge_name: "lm-ovs".to_string(),
        vni_base: 100_000,
        vni_max: 116_777,
        mtu: 1450,
        workspace: dir.to_path_buf(),
    };
    OverlayManager::new(FakeCommandRunner::new(), config)
}

fn spec(link_id: &str, lab_id: &str, port_name: &str, vni: u32, vlan: u16) -> DeclaredTunnelSpec {
    DeclaredTunnelSpec {
        link_id: link_id.to_string(),
        lab_id: lab_id.to_string(),
        vni,
        local_ip: "10.0.0.1".to_string(),
        remote_ip: "10.0.0.2".to_string(),
        expected_vlan: vlan,
        port_name: port_name.to_string(),
        mtu: 0,
    }
}

fn runner(mgr: &OverlayManager<FakeCommandRunner>) -> &FakeCommandRunner {
    mgr.runner()
}

#[test]
fn vlan_mapping_is_deterministic_and_in_range() {
    for vni in [100_000u32, 100_001, 116_777, 123_456_789] {
        let vlan = OverlayManager::<FakeCommandRunner>::vni_to_vlan(vni);
        assert!((3000..4000).contains(&vlan), "vlan {vlan} out of range");
    }
    assert_eq!(
        OverlayManager::<FakeCommandRunner>::vni_to_vlan(100_000),
        OverlayManager::<FakeCommandRunner>::vni_to_vlan(100_000),
    );
}

#[tokio::test]
async fn ensure_bridge_creates_and_sets_standalone() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    runner(&mgr).respond("ovs-vsctl br-exists", CommandOutput::failed(2, ""));
    runner(&mgr).respond("ovs-vsctl get bridge lm-ovs fail_mode", CommandOutput::ok("secure"));

    mgr.ensure_bridge().await.unwrap();

    let lines: Vec<String> =
        runner(&mgr).invocations().iter().map(|i| i.line()).collect();
    assert!(lines.iter().any(|l| l == "ovs-vsctl add-br lm-ovs"));
    assert!(lines.iter().any(|l| l == "ovs-vsctl set-fail-mode lm-ovs standalone"));
    assert!(lines.iter().any(|l| l == "ip link set lm-ovs up"));
}

#[tokio::test]
async fn ensure_bridge_errors_when_ovs_missing() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    runner(&mgr).respond("ovs-vsctl --version", CommandOutput::failed(127, "not found"));

    assert!(matches!(
        mgr.ensure_bridge().await,
        Err(OverlayError::OvsUnavailable(_))
    ));
}

#[tokio::test]
async fn create_tunnel_allocates_vni_and_adds_port() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());

    let tunnel = mgr
        .create_tunnel("lab-1", "r1:eth1-r2:eth1", "10.0.0.1", "10.0.0.2", None)
        .await
        .unwrap();

    assert!((100_000..=116_777).contains(&tunnel.vni));
    assert!((3000..4000).contains(&tunnel.vlan_tag));
    assert_eq!(tunnel.port_name, format!("vxlan{}", tunnel.vni));

    let add_port_lines = runner(&mgr).lines_containing("add-port");
    assert!(add_port_lines.iter().any(|l| l.contains(&tunnel.port_name)));
    let set_lines = runner(&mgr).lines_containing("type=vxlan");
    assert!(set_lines.iter().any(|l| {
        l.contains("options:remote_ip=10.0.0.2")
            && l.contains("options:local_ip=10.0.0.1")
            && l.contains(&format!("options:key={}", tunnel.vni))
    }));

    // Second call is a no-op returning the same tunnel
    let again = mgr
        .create_tunnel("lab-1", "r1:eth1-r2:eth1", "10.0.0.1", "10.0.0.2", None)
        .await
        .unwrap();
    assert_eq!(again, tunnel);
}

#[tokio::test]
async fn declare_creates_missing_tunnels() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());

    let result = mgr
        .declare_state(&[spec("R1:eth1-R2:eth1", "lab-1", "vxlan100000", 100_000, 3001)])
        .await
        .unwrap();

    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].status, DeclareOutcome::Created);
    assert_eq!(result.results[0].link_id, "R1:eth1-R2:eth1");
    assert!(result.orphans_removed.is_empty());

    assert_eq!(mgr.tunnels_for_lab("lab-1").len(), 1);
}

#[tokio::test]
async fn declare_updates_drifted_vlan() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    runner(&mgr).respond("ovs-vsctl list-ports", CommandOutput::ok("vxlan100000\n"));
    runner(&mgr).respond("ovs-vsctl get port vxlan100000 tag", CommandOutput::ok("3099"));

    let result = mgr
        .declare_state(&[spec("R1:eth1-R2:eth1", "lab-1", "vxlan100000", 100_000, 3001)])
        .await
        .unwrap();

    assert_eq!(result.results[0].status, DeclareOutcome::Updated);
    let set_lines = runner(&mgr).lines_containing("set port vxlan100000 tag=3001");
    assert_eq!(set_lines.len(), 1);
}

#[tokio::test]
async fn declare_converged_makes_no_changes() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    runner(&mgr).respond("ovs-vsctl list-ports", CommandOutput::ok("vxlan100000\n"));
    runner(&mgr).respond("ovs-vsctl get port vxlan100000 tag", CommandOutput::ok("3001"));

    let result = mgr
        .declare_state(&[spec("R1:eth1-R2:eth1", "lab-1", "vxlan100000", 100_000, 3001)])
        .await
        .unwrap();

    assert_eq!(result.results[0].status, DeclareOutcome::Converged);
    assert!(runner(&mgr).lines_containing("set port").is_empty());
    assert!(runner(&mgr).lines_containing("add-port").is_empty());
}

#[tokio::test]
async fn declare_removes_orphans_scoped_to_declared_labs() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());

    // Track a port for a foreign lab, then list both it and an
    // untracked orphan alongside the declared port.
    mgr.declare_state(&[spec("other-link", "lab-OTHER", "vxlan100009", 100_009, 3009)])
        .await
        .unwrap();

    runner(&mgr).respond(
        "ovs-vsctl list-ports",
        CommandOutput::ok("vxlan100000\nvxlan100005\nvxlan100009\n"),
    );
    runner(&mgr).respond("ovs-vsctl get port vxlan100000 tag", CommandOutput::ok("3001"));
    runner(&mgr).respond("ovs-vsctl get port vxlan100005 tag", CommandOutput::ok("3005"));
    runner(&mgr).respond("ovs-vsctl get port vxlan100009 tag", CommandOutput::ok("3009"));

    let result = mgr
        .declare_state(&[spec("R1:eth1-R2:eth1", "lab-1", "vxlan100000", 100_000, 3001)])
        .await
        .unwrap();

    // Untracked vxlan100005 is removed; lab-OTHER's port survives.
    assert_eq!(result.orphans_removed, vec!["vxlan100005".to_string()]);
    assert_eq!(mgr.tunnels_for_lab("lab-OTHER").len(), 1);
}

#[tokio::test]
async fn declare_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    let declared = [spec("R1:eth1-R2:eth1", "lab-1", "vxlan100000", 100_000, 3001)];

    let first = mgr.declare_state(&declared).await.unwrap();
    assert_eq!(first.results[0].status, DeclareOutcome::Created);

    // Simulate the port now existing with the right tag
    runner(&mgr).respond("ovs-vsctl list-ports", CommandOutput::ok("vxlan100000\n"));
    runner(&mgr).respond("ovs-vsctl get port vxlan100000 tag", CommandOutput::ok("3001"));

    let second = mgr.declare_state(&declared).await.unwrap();
    assert_eq!(second.results[0].status, DeclareOutcome::Converged);
    assert!(second.orphans_removed.is_empty());
}

#[tokio::test]
async fn declare_partial_failure_reports_per_link() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    // The second port's creation fails at OVS
    runner(&mgr).respond(
        "ovs-vsctl -- add-port lm-ovs vxlan100001",
        CommandOutput::failed(1, "OVS bridge error"),
    );

    let result = mgr
        .declare_state(&[
            spec("link-ok", "lab-1", "vxlan100000", 100_000, 3001),
            spec("link-fail", "lab-1", "vxlan100001", 100_001, 3002),
        ])
        .await
        .unwrap();

    let statuses: std::collections::HashMap<&str, DeclareOutcome> = result
        .results
        .iter()
        .map(|r| (r.link_id.as_str(), r.status))
        .collect();
    assert_eq!(statuses["link-ok"], DeclareOutcome::Created);
    assert_eq!(statuses["link-fail"], DeclareOutcome::Error);

    // Only the successful tunnel is tracked
    let tracked = mgr.tunnels_for_lab("lab-1");
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].link_id, "link-ok");
}

#[tokio::test]
async fn declare_empty_is_cleanup_only_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());

    let result = mgr.declare_state(&[]).await.unwrap();
    assert!(result.results.is_empty());
    assert!(result.orphans_removed.is_empty());
}

#[tokio::test]
async fn declare_writes_and_overwrites_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());

    mgr.declare_state(&[spec("old-link", "lab-1", "vxlan100000", 100_000, 3001)])
        .await
        .unwrap();
    let loaded = mgr.load_declared_state_cache().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].link_id, "old-link");

    mgr.declare_state(&[spec("new-link", "lab-1", "vxlan100001", 100_001, 3002)])
        .await
        .unwrap();
    let loaded = mgr.load_declared_state_cache().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].link_id, "new-link");
}

#[tokio::test]
async fn cleanup_lab_deletes_tunnels_and_releases_vnis() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    mgr.create_tunnel("lab-1", "a", "10.0.0.1", "10.0.0.2", None).await.unwrap();
    mgr.create_tunnel("lab-1", "b", "10.0.0.1", "10.0.0.3", None).await.unwrap();
    mgr.create_tunnel("lab-2", "c", "10.0.0.1", "10.0.0.4", None).await.unwrap();

    let cleanup = mgr.cleanup_lab("lab-1").await;
    assert_eq!(cleanup.tunnels_deleted, 2);
    assert_eq!(cleanup.vnis_released, 2);
    assert!(cleanup.errors.is_empty());

    assert!(mgr.tunnels_for_lab("lab-1").is_empty());
    assert_eq!(mgr.tunnels_for_lab("lab-2").len(), 1);
}

#[tokio::test]
async fn attach_container_requires_running_container() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    runner(&mgr).respond("docker inspect", CommandOutput::ok("0"));

    let err = mgr.attach_container("labmesh-x-r1", "eth1", 3001, 100_000).await.unwrap_err();
    assert!(matches!(err, OverlayError::ContainerNotRunning(_)));
}

#[tokio::test]
async fn attach_container_builds_veth_pair_with_vlan() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    runner(&mgr).respond("docker inspect", CommandOutput::ok("12345\n"));

    mgr.attach_container("labmesh-x-r1", "eth1", 3001, 100_000).await.unwrap();

    let lines: Vec<String> = runner(&mgr).invocations().iter().map(|i| i.line()).collect();
    assert!(lines.iter().any(|l| l.contains("type veth peer name")));
    assert!(lines.iter().any(|l| l.contains("add-port lm-ovs") && l.contains("tag=3001")));
    assert!(lines.iter().any(|l| l.contains("netns 12345")));
    assert!(lines
        .iter()
        .any(|l| l.contains("nsenter -t 12345 -n ip link set") && l.contains("name eth1")));
    // MTU applied to both ends
    assert_eq!(lines.iter().filter(|l| l.contains("mtu 1450")).count(), 2);
}
