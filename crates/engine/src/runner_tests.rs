// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_support::Harness;
use lm_adapters::FakeFailure;
use lm_core::{
    JobAction, JobStatus, LabState, LinkActualState, NodeActualState, NodeDesiredState,
};
use tokio_util::sync::CancellationToken;

fn runner(h: &Harness) -> std::sync::Arc<JobRunner<lm_core::FakeClock>> {
    JobRunner::new(h.ctx.clone(), CancellationToken::new())
}

#[tokio::test]
async fn deploy_job_converges_whole_lab_with_links() {
    let h = Harness::new();
    let host_a = h.add_host("host-a");
    let host_b = h.add_host("host-b");
    let lab = h.add_lab(LabState::Undeployed);
    let n1 = h.add_node(&lab, "r1", Some(&host_a));
    let n2 = h.add_node(&lab, "r2", Some(&host_b));
    h.add_link(&lab, &n1, "eth1", &n2, "eth1");
    h.agent.add_image(&host_a, "alpine:latest");
    h.agent.add_image(&host_b, "alpine:latest");

    let job = h.make_job(&lab, JobAction::Up, vec![]);
    runner(&h).execute(job.id).await;

    let job = h.store.get_job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.log.as_deref().unwrap_or("").contains("deploy completed"));

    for node in ["r1", "r2"] {
        let ns = h.node_state(&lab, node);
        assert_eq!(ns.actual_state, NodeActualState::Running);
        assert!(ns.management_ip.is_some());
    }
    assert_eq!(h.store.get_lab(&lab.id).unwrap().state, LabState::Running);

    // Cross-host link established during deploy.
    let links = h.store.link_states_for_lab(&lab.id);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].actual_state, LinkActualState::Up);
    assert_eq!(h.store.tunnels_for_lab(&lab.id).len(), 1);

    // Deploy fanned out to both hosts.
    assert_eq!(h.agent.call_count("deploy_lab"), 2);
}

#[tokio::test]
async fn partial_deploy_failure_rolls_back_succeeded_hosts() {
    let h = Harness::new();
    let host_a = h.add_host("host-a");
    let host_b = h.add_host("host-b");
    let lab = h.add_lab(LabState::Undeployed);
    h.add_node(&lab, "r1", Some(&host_a));
    h.add_node(&lab, "r2", Some(&host_b));
    h.agent.add_image(&host_a, "alpine:latest");
    h.agent.add_image(&host_b, "alpine:latest");
    // Second deploy call fails permanently.
    h.agent.fail_once("deploy_lab", FakeFailure::Permanent("disk full".into()));

    let job = h.make_job(&lab, JobAction::Up, vec![]);
    runner(&h).execute(job.id).await;

    let job = h.store.get_job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let log = job.log.unwrap_or_default();
    assert!(log.contains("Rollback"));

    // The successful host was destroyed again: deploy x2, destroy x1.
    assert_eq!(h.agent.call_count("destroy_lab"), 1);
    assert_eq!(h.store.get_lab(&lab.id).unwrap().state, LabState::Error);
}

#[tokio::test]
async fn preflight_image_gate_fails_fast() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Undeployed);
    h.add_node(&lab, "r1", Some(&host));
    // No image on the host, sync enabled with fail fallback.

    let job = h.make_job(&lab, JobAction::Up, vec![]);
    runner(&h).execute(job.id).await;

    let job = h.store.get_job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.log.as_deref().unwrap_or("").contains("Missing images"));
    // Deploy never reached the agent.
    assert_eq!(h.agent.call_count("deploy_lab"), 0);
}

#[tokio::test]
async fn destroy_job_tears_down_lab_state() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Running);
    h.add_node(&lab, "r1", Some(&host));
    h.set_node_state(&lab, "r1", NodeDesiredState::Running, NodeActualState::Running);
    h.store.upsert_placement(
        lm_core::NodePlacement::builder()
            .lab_id(lab.id)
            .node_name("r1")
            .host_id(host.id)
            .build(),
    );
    h.agent.set_container(&host, lab.id.as_str(), "r1", "running", vec![]);

    let job = h.make_job(&lab, JobAction::Down, vec![]);
    runner(&h).execute(job.id).await;

    let job = h.store.get_job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let ns = h.node_state(&lab, "r1");
    assert_eq!(ns.desired_state, NodeDesiredState::Stopped);
    assert_eq!(ns.actual_state, NodeActualState::Undeployed);
    assert!(h.store.placements_for_lab(&lab.id).is_empty());
    assert_eq!(h.store.get_lab(&lab.id).unwrap().state, LabState::Stopped);

    // Config snapshots were attempted and overlay cleaned before destroy.
    assert_eq!(h.agent.call_count("extract_configs"), 1);
    assert_eq!(h.agent.call_count("cleanup_overlay"), 1);
    assert_eq!(h.agent.call_count("destroy_lab"), 1);
}

#[tokio::test]
async fn destroy_with_offline_host_completes_with_warnings() {
    let h = Harness::new();
    let online = h.add_host("online");
    let offline = h.add_offline_host("offline");
    let lab = h.add_lab(LabState::Running);
    h.add_node(&lab, "r1", Some(&online));
    h.add_node(&lab, "r2", Some(&offline));
    for (name, host) in [("r1", &online), ("r2", &offline)] {
        h.store.upsert_placement(
            lm_core::NodePlacement::builder()
                .lab_id(lab.id)
                .node_name(name)
                .host_id(host.id)
                .build(),
        );
    }

    let job = h.make_job(&lab, JobAction::Down, vec![]);
    runner(&h).execute(job.id).await;

    let job = h.store.get_job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::CompletedWithWarnings);
    assert!(job.log.as_deref().unwrap_or("").contains("offline"));
}

#[tokio::test]
async fn sync_actions_dispatch_to_lifecycle() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Stopped);
    h.add_node(&lab, "n1", Some(&host));

    let mut job = h.make_job(&lab, JobAction::SyncNode("n1".into()), vec![]);
    job.node_ids = vec!["n1".to_string()];
    h.store.insert_job(job.clone());

    runner(&h).execute(job.id).await;

    assert_eq!(h.store.get_job(&job.id).unwrap().status, JobStatus::Completed);
    assert_eq!(h.node_state(&lab, "n1").actual_state, NodeActualState::Running);
}

#[tokio::test]
async fn unknown_actions_fail_cleanly() {
    let h = Harness::new();
    let lab = h.add_lab(LabState::Running);
    let job = h.make_job(&lab, JobAction::Other("node:start:n1".into()), vec![]);

    runner(&h).execute(job.id).await;

    let job = h.store.get_job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.log.as_deref().unwrap_or("").contains("Unknown action"));
}

#[tokio::test]
async fn user_jobs_clear_enforcement_cooldowns() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Stopped);
    h.add_node(&lab, "n1", Some(&host));
    h.agent.add_image(&host, "alpine:latest");

    let key = lm_adapters::keys::enforcement_cooldown(lab.id.as_str(), "n1");
    h.ctx
        .coord
        .set_ex(&key, "1", std::time::Duration::from_secs(300))
        .await
        .unwrap();

    let mut job = h.make_job(&lab, JobAction::Up, vec![]);
    job.user_id = Some("operator".to_string());
    h.store.insert_job(job.clone());

    runner(&h).execute(job.id).await;
    assert!(!h.ctx.coord.exists(&key).await.unwrap());
}
