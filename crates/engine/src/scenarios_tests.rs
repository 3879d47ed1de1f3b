// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end convergence scenarios across the monitors and the
//! lifecycle manager.

use crate::enforce::Enforcer;
use crate::health::JobHealthMonitor;
use crate::lifecycle::NodeLifecycle;
use crate::reconcile::Reconciler;
use crate::runner::JobRunner;
use crate::test_support::Harness;
use lm_core::{
    Clock, JobAction, JobStatus, LabState, LinkActualState, NodeActualState, NodeDesiredState,
    OperState, PlacementStatus, TunnelStatus,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn run_sync_job(h: &Harness, lab: &lm_core::Lab, job_id: lm_core::JobId) {
    let job = h.store.get_job(&job_id).unwrap();
    let lifecycle = NodeLifecycle::new(
        h.ctx.clone(),
        job_id,
        lab.clone(),
        job.node_ids.clone(),
        lab.provider,
    );
    lifecycle.execute().await;
}

// Happy-path deploy: one node, explicit host, ample capacity. One NLM
// pass converges it to running+ready with a deployed placement.
#[tokio::test]
async fn happy_path_deploy() {
    let h = Harness::new();
    let host_a = h.add_host("H_A");
    let lab = h.add_lab(LabState::Stopped);
    h.add_node(&lab, "N1", Some(&host_a));

    let job = h.make_job(&lab, JobAction::SyncNode("N1".into()), vec!["N1".to_string()]);
    run_sync_job(&h, &lab, job.id).await;

    let ns = h.node_state(&lab, "N1");
    assert_eq!(ns.actual_state, NodeActualState::Running);
    assert!(ns.is_ready);

    let placement = h.store.get_placement(&lab.id, "N1").unwrap();
    assert_eq!(placement.host_id, host_a.id);
    assert_eq!(placement.status, PlacementStatus::Deployed);

    let job = h.store.get_job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.log.as_deref().unwrap_or("").contains("deploy completed"));
}

// Explicit host offline: error with no fallback even though another
// healthy agent exists.
#[tokio::test]
async fn explicit_host_offline() {
    let h = Harness::new();
    let host_a = h.add_offline_host("H_A");
    h.add_host("H_B");
    let lab = h.add_lab(LabState::Stopped);
    h.add_node(&lab, "N1", Some(&host_a));

    let job = h.make_job(&lab, JobAction::SyncNode("N1".into()), vec!["N1".to_string()]);
    run_sync_job(&h, &lab, job.id).await;

    let ns = h.node_state(&lab, "N1");
    assert_eq!(ns.actual_state, NodeActualState::Error);
    assert!(ns.error_message.as_deref().unwrap_or("").contains("offline"));
    assert!(h.store.get_placement(&lab.id, "N1").is_none());
    assert_eq!(h.store.get_job(&job.id).unwrap().status, JobStatus::Failed);
}

// Cross-host link: N1 on H_A, N2 on H_B, link N1:eth1 ↔ N2:eth1.
// Deploy both, expect exactly one active tunnel with in-range ids and
// both oper states up.
#[tokio::test]
async fn cross_host_link_creation() {
    let h = Harness::new();
    let host_a = h.add_host("H_A");
    let host_b = h.add_host("H_B");
    let lab = h.add_lab(LabState::Undeployed);
    let n1 = h.add_node(&lab, "N1", Some(&host_a));
    let n2 = h.add_node(&lab, "N2", Some(&host_b));
    h.add_link(&lab, &n1, "eth1", &n2, "eth1");
    h.agent.add_image(&host_a, "alpine:latest");
    h.agent.add_image(&host_b, "alpine:latest");

    let job = h.make_job(&lab, JobAction::Up, vec![]);
    let runner = JobRunner::new(h.ctx.clone(), CancellationToken::new());
    runner.execute(job.id).await;

    assert_eq!(h.store.get_job(&job.id).unwrap().status, JobStatus::Completed);

    let tunnels = h.store.tunnels_for_lab(&lab.id);
    assert_eq!(tunnels.len(), 1);
    let tunnel = &tunnels[0];
    assert_eq!(tunnel.status, TunnelStatus::Active);
    let settings = &h.ctx.settings;
    assert!((settings.vxlan_vni_base..=settings.vxlan_vni_max).contains(&tunnel.vni));
    assert!((3000..4000).contains(&tunnel.vlan_tag));

    let ls = &h.store.link_states_for_lab(&lab.id)[0];
    assert_eq!(ls.actual_state, LinkActualState::Up);
    assert!(ls.is_cross_host);
    assert_eq!(ls.source_oper_state, OperState::Up);
    assert_eq!(ls.target_oper_state, OperState::Up);
}

// Enforcement with backoff: a crash-looping node with max_retries=3 and
// backoff=30s fires at t=0, t≈30s, t≈60s; the third failure sets the
// permanent marker that reconciliation respects until the crash
// cooldown expires.
#[tokio::test]
async fn enforcement_backoff_and_permanent_failure() {
    let h = Harness::with_settings(|s| {
        s.state_enforcement_max_retries = 3;
        s.state_enforcement_retry_backoff = 30;
        s.state_enforcement_crash_cooldown = 300;
    });
    let host = h.add_host("H_A");
    let lab = h.add_lab(LabState::Running);
    h.add_node(&lab, "N1", Some(&host));
    h.set_node_state(&lab, "N1", NodeDesiredState::Running, NodeActualState::Error);

    let enforcer = Enforcer::new(h.ctx.clone());
    let mut fire_times = Vec::new();

    // Walk the clock second-by-step and record when enforcement fires.
    let start = h.clock.epoch_ms();
    for _ in 0..13 {
        let jobs = enforcer.run_once().await;
        if let Some(job_id) = jobs.first() {
            fire_times.push((h.clock.epoch_ms() - start) / 1000);
            // The sync "runs" and the node crashes again.
            h.store.with_job(job_id, |row| {
                row.status = JobStatus::Failed;
                row.completed_at_ms = Some(0);
            });
            h.set_node_state(&lab, "N1", NodeDesiredState::Running, NodeActualState::Error);
            let key = lm_adapters::keys::enforcement_cooldown(lab.id.as_str(), "N1");
            let _ = h.ctx.coord.delete(&[key]).await;
        }
        h.clock.advance(Duration::from_secs(10));
        h.heartbeat(&host);
    }

    assert_eq!(fire_times, vec![0, 30, 90]);

    // Exhausted: the permanent marker is set and holds.
    let jobs = enforcer.run_once().await;
    assert!(jobs.is_empty());
    let ns = h.node_state(&lab, "N1");
    assert!(ns.enforcement_failed_at_ms.is_some());
    assert_eq!(ns.actual_state, NodeActualState::Error);

    // Reconciliation observes a running container but must not
    // overwrite the marked node.
    h.agent.set_container(&host, lab.id.as_str(), "N1", "running", vec![]);
    Reconciler::new(h.ctx.clone()).run_once().await;
    assert_eq!(h.node_state(&lab, "N1").actual_state, NodeActualState::Error);

    // After the crash cooldown, retries resume.
    h.clock.advance(Duration::from_secs(301));
    h.heartbeat(&host);
    let jobs = enforcer.run_once().await;
    assert_eq!(jobs.len(), 1);
    assert!(h.node_state(&lab, "N1").enforcement_failed_at_ms.is_none());
}

// Job-health retry: deploy J1 times out; J2 supersedes it with
// retry_count=1 and J1's running child is cancelled onto J2.
#[tokio::test]
async fn job_health_retry_with_superseded_chaining() {
    let h = Harness::new();
    let host = h.add_host("H_A");
    let lab = h.add_lab(LabState::Starting);

    let mut j1 = h.make_job(&lab, JobAction::Up, vec![]);
    j1.status = JobStatus::Running;
    j1.started_at_ms = Some(h.clock.epoch_ms());
    j1.agent_id = Some(host.id);
    h.store.insert_job(j1.clone());

    let mut c1 = h.make_job(&lab, JobAction::SyncHost(host.id), vec![]);
    c1.status = JobStatus::Running;
    c1.parent_job_id = Some(j1.id);
    h.store.insert_job(c1.clone());

    h.clock.advance(Duration::from_secs(1000));
    h.heartbeat(&host);

    let scheduled = JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert_eq!(scheduled.len(), 1);
    let j2 = h.store.get_job(&scheduled[0]).unwrap();
    assert_eq!(j2.retry_count, 1);

    let j1 = h.store.get_job(&j1.id).unwrap();
    assert_eq!(j1.status, JobStatus::Failed);
    assert_eq!(j1.superseded_by_id, Some(j2.id));

    let c1 = h.store.get_job(&c1.id).unwrap();
    assert_eq!(c1.status, JobStatus::Cancelled);
    assert_eq!(c1.superseded_by_id, Some(j2.id));
}

// Reconciliation preserves state when the agent is unreachable, records
// the host error, and clears it on recovery.
#[tokio::test]
async fn reconciliation_preserves_state_under_agent_failure() {
    let h = Harness::new();
    let host_a = h.add_host("H_A");
    let lab = h.add_lab(LabState::Starting);
    h.add_node(&lab, "N1", Some(&host_a));
    h.set_node_state(&lab, "N1", NodeDesiredState::Running, NodeActualState::Running);
    h.store.upsert_placement(
        lm_core::NodePlacement::builder()
            .lab_id(lab.id)
            .node_name("N1")
            .host_id(host_a.id)
            .build(),
    );
    h.agent.set_unreachable(&host_a, true);

    Reconciler::new(h.ctx.clone()).run_once().await;

    assert_eq!(h.node_state(&lab, "N1").actual_state, NodeActualState::Running);
    assert!(h.store.get_host(&host_a.id).unwrap().last_error.is_some());

    h.agent.set_unreachable(&host_a, false);
    h.agent.set_container(&host_a, lab.id.as_str(), "N1", "running", vec![]);
    Reconciler::new(h.ctx.clone()).run_once().await;
    assert!(h.store.get_host(&host_a.id).unwrap().last_error.is_none());
}

// Empty lab: a deploy against no topology fails fast and cleanly.
#[tokio::test]
async fn empty_lab_deploy_fails_cleanly() {
    let h = Harness::new();
    h.add_host("H_A");
    let lab = h.add_lab(LabState::Undeployed);

    let job = h.make_job(&lab, JobAction::Up, vec![]);
    let runner = JobRunner::new(h.ctx.clone(), CancellationToken::new());
    runner.execute(job.id).await;

    let job = h.store.get_job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.log.as_deref().unwrap_or("").contains("No topology"));
}

// Full loop: reconciliation notices drift, creates an enforcement job,
// the lifecycle runs it, and the node converges back to running.
#[tokio::test]
async fn drift_detection_to_convergence_loop() {
    let h = Harness::new();
    let host = h.add_host("H_A");
    let lab = h.add_lab(LabState::Starting);
    h.add_node(&lab, "N1", Some(&host));
    h.set_node_state(&lab, "N1", NodeDesiredState::Running, NodeActualState::Running);
    h.store.upsert_placement(
        lm_core::NodePlacement::builder()
            .lab_id(lab.id)
            .node_name("N1")
            .host_id(host.id)
            .build(),
    );
    // Reality: the container died.
    h.agent.set_container(&host, lab.id.as_str(), "N1", "exited", vec![]);

    let jobs = Reconciler::new(h.ctx.clone()).run_once().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(h.node_state(&lab, "N1").actual_state, NodeActualState::Stopped);

    run_sync_job(&h, &lab, jobs[0]).await;

    let ns = h.node_state(&lab, "N1");
    assert_eq!(ns.actual_state, NodeActualState::Running);
    assert_eq!(h.store.get_job(&jobs[0]).unwrap().status, JobStatus::Completed);
}
