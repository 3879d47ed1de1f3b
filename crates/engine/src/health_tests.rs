// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_support::Harness;
use lm_core::{
    AgentUpdateStatus, ImageSyncJobStatus, JobAction, JobStatus, LabState, NodeActualState,
    NodeDesiredState,
};
use std::time::Duration;
use yare::parameterized;

fn stuck_running_job(h: &Harness, lab: &lm_core::Lab, action: JobAction) -> lm_core::Job {
    let mut job = h.make_job(lab, action.clone(), vec![]);
    job.status = JobStatus::Running;
    job.started_at_ms = Some(h.clock.epoch_ms());
    h.store.insert_job(job.clone());
    // Blow past the per-action timeout.
    h.clock.advance(action.timeout() + Duration::from_secs(60));
    job
}

#[tokio::test]
async fn stuck_job_retries_with_superseded_chain() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Starting);
    let mut old = stuck_running_job(&h, &lab, JobAction::Up);
    old.agent_id = Some(host.id);
    h.store.insert_job(old.clone());
    h.heartbeat(&host);

    // One running child under the stuck parent.
    let mut child = h.make_job(&lab, JobAction::SyncHost(host.id), vec![]);
    child.status = JobStatus::Running;
    child.parent_job_id = Some(old.id);
    h.store.insert_job(child.clone());

    let to_schedule = JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert_eq!(to_schedule.len(), 1);

    let new_job = h.store.get_job(&to_schedule[0]).unwrap();
    assert_eq!(new_job.retry_count, 1);
    assert_eq!(new_job.action, JobAction::Up);
    assert_eq!(new_job.status, JobStatus::Queued);

    let old = h.store.get_job(&old.id).unwrap();
    assert_eq!(old.status, JobStatus::Failed);
    assert_eq!(old.superseded_by_id, Some(new_job.id));

    let child = h.store.get_job(&child.id).unwrap();
    assert_eq!(child.status, JobStatus::Cancelled);
    assert_eq!(child.superseded_by_id, Some(new_job.id));

    // The agent-side lab lock was force-released before the retry.
    assert_eq!(h.agent.call_count("release_lock"), 1);
}

#[tokio::test]
async fn duplicate_active_job_supersedes_instead_of_retrying() {
    let h = Harness::new();
    let lab = h.add_lab(LabState::Starting);
    let old = stuck_running_job(&h, &lab, JobAction::Up);

    // A fresh equivalent job is already queued.
    let twin = h.make_job(&lab, JobAction::Up, vec![]);

    let to_schedule = JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert!(to_schedule.is_empty());

    let old = h.store.get_job(&old.id).unwrap();
    assert_eq!(old.status, JobStatus::Cancelled);
    assert_eq!(old.superseded_by_id, Some(twin.id));
}

#[tokio::test]
async fn retries_exhausted_fails_job_and_lab() {
    let h = Harness::new();
    let lab = h.add_lab(LabState::Starting);
    let mut old = stuck_running_job(&h, &lab, JobAction::Up);
    old.retry_count = 2; // == job_max_retries default
    h.store.insert_job(old.clone());

    let to_schedule = JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert!(to_schedule.is_empty());

    let old = h.store.get_job(&old.id).unwrap();
    assert_eq!(old.status, JobStatus::Failed);
    assert!(old.log.as_deref().unwrap_or("").contains("maximum retries"));
    assert_eq!(h.store.get_lab(&lab.id).unwrap().state, LabState::Error);
}

#[parameterized(
    missing_image = { "ERROR: No image found for ceos:4.32", "missing_image" },
    upload_hint = { "Upload/sync required images before retrying.", "missing_image" },
    explicit_host = { "explicit host assignments failed for n1", "host_assignment_or_agent_unavailable" },
    no_agent = { "ERROR: No healthy agent available.", "host_assignment_or_agent_unavailable" },
    libvirt = { "libvirt error: Domain not found", "libvirt_runtime_error" },
    tunnel = { "per-link tunnel creation failed on vxlan100001", "link_tunnel_creation_failed" },
)]
fn signature_table_matches(log: &str, expected: &str) {
    assert_eq!(non_retryable_signature("up", Some(log)), Some(expected));
}

#[test]
fn retryable_logs_have_no_signature() {
    assert_eq!(non_retryable_signature("up", Some("connection reset by peer")), None);
    assert_eq!(non_retryable_signature("up", None), None);
    // The partial-failure marker only applies to sync actions.
    let partial = "sync completed with 2 error(s)";
    assert_eq!(non_retryable_signature("up", Some(partial)), None);
    assert_eq!(
        non_retryable_signature("sync:batch:3", Some(partial)),
        Some("sync_partial_failure")
    );
}

#[tokio::test]
async fn non_retryable_signature_fails_without_retry() {
    let h = Harness::new();
    let lab = h.add_lab(LabState::Starting);
    let mut job = stuck_running_job(&h, &lab, JobAction::Up);
    job.log = Some("ERROR: no image found for ceos:4.32".to_string());
    h.store.insert_job(job.clone());

    let to_schedule = JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert!(to_schedule.is_empty());

    let job = h.store.get_job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .log
        .as_deref()
        .unwrap_or("")
        .contains("non-retryable failure signature"));
}

#[tokio::test]
async fn sync_partial_failure_signature_is_final() {
    let h = Harness::new();
    let lab = h.add_lab(LabState::Starting);
    let mut job = stuck_running_job(&h, &lab, JobAction::SyncBatch(3));
    job.log = Some("sync completed with 2 error(s)".to_string());
    h.store.insert_job(job.clone());

    let to_schedule = JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert!(to_schedule.is_empty());
    assert_eq!(h.store.get_job(&job.id).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn stuck_child_with_active_parent_is_left_alone() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Starting);

    let mut parent = h.make_job(&lab, JobAction::Up, vec![]);
    parent.status = JobStatus::Running;
    parent.started_at_ms = Some(h.clock.epoch_ms());
    h.store.insert_job(parent.clone());

    let mut child = h.make_job(&lab, JobAction::SyncHost(host.id), vec![]);
    child.status = JobStatus::Running;
    child.started_at_ms = Some(h.clock.epoch_ms());
    child.parent_job_id = Some(parent.id);
    h.store.insert_job(child.clone());

    // Child past its sync timeout but parent's longer deploy window is
    // still open.
    h.clock.advance(Duration::from_secs(700));
    h.heartbeat(&host);

    JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert_eq!(h.store.get_job(&child.id).unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn orphaned_child_of_terminal_parent_fails() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Starting);

    let mut parent = h.make_job(&lab, JobAction::Up, vec![]);
    parent.status = JobStatus::Failed;
    h.store.insert_job(parent.clone());

    let mut child = h.make_job(&lab, JobAction::SyncHost(host.id), vec![]);
    child.status = JobStatus::Running;
    child.started_at_ms = Some(h.clock.epoch_ms());
    child.parent_job_id = Some(parent.id);
    h.store.insert_job(child.clone());
    h.clock.advance(Duration::from_secs(700));

    JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    let child = h.store.get_job(&child.id).unwrap();
    assert_eq!(child.status, JobStatus::Failed);
    assert!(child.log.as_deref().unwrap_or("").contains("orphaned"));
}

#[tokio::test]
async fn orphaned_queued_jobs_are_retried() {
    let h = Harness::new();
    h.add_host("host-a");
    let lab = h.add_lab(LabState::Undeployed);
    let job = h.make_job(&lab, JobAction::Up, vec![]);
    h.clock.advance(Duration::from_secs(150));

    let to_schedule = JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert_eq!(to_schedule.len(), 1);
    let old = h.store.get_job(&job.id).unwrap();
    assert_eq!(old.status, JobStatus::Failed);
    assert_eq!(old.superseded_by_id, Some(to_schedule[0]));
}

#[tokio::test]
async fn jobs_on_offline_agents_are_retried() {
    let h = Harness::new();
    let offline = h.add_offline_host("gone");
    let lab = h.add_lab(LabState::Starting);
    let mut job = h.make_job(&lab, JobAction::Up, vec![]);
    job.status = JobStatus::Running;
    job.started_at_ms = Some(h.clock.epoch_ms());
    job.agent_id = Some(offline.id);
    h.store.insert_job(job.clone());

    let to_schedule = JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert_eq!(to_schedule.len(), 1);
    assert_eq!(h.store.get_job(&job.id).unwrap().status, JobStatus::Failed);
    // No lock release attempted against an offline agent.
    assert_eq!(h.agent.call_count("release_lock"), 0);
}

#[tokio::test]
async fn stuck_pending_image_sync_fails() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let sync = lm_core::ImageSyncJob::new("ceos:4.32", host.id, h.clock.epoch_ms());
    let sync_id = sync.id;
    h.store.insert_image_sync_job(sync);
    h.clock.advance(Duration::from_secs(130));
    h.heartbeat(&host);

    JobHealthMonitor::new(h.ctx.clone()).run_once().await;

    let job = h.store.get_image_sync_job(&sync_id).unwrap();
    assert_eq!(job.status, ImageSyncJobStatus::Failed);
    assert!(job.error_message.as_deref().unwrap_or("").contains("pending"));
}

#[tokio::test]
async fn transferring_sync_with_agent_activity_waits_until_hard_ceiling() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let mut sync = lm_core::ImageSyncJob::new("ceos:4.32", host.id, h.clock.epoch_ms());
    sync.status = ImageSyncJobStatus::Transferring;
    sync.started_at_ms = Some(h.clock.epoch_ms());
    let sync_id = sync.id;
    h.store.insert_image_sync_job(sync);
    h.agent.set_active_transfers(vec![sync_id.to_string()]);

    // Past the timeout but under 2×, and the agent says it's working.
    h.clock.advance(Duration::from_secs(700));
    h.heartbeat(&host);
    JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert_eq!(
        h.store.get_image_sync_job(&sync_id).unwrap().status,
        ImageSyncJobStatus::Transferring
    );

    // Past the hard ceiling it fails regardless.
    h.clock.advance(Duration::from_secs(600));
    h.heartbeat(&host);
    JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert_eq!(
        h.store.get_image_sync_job(&sync_id).unwrap().status,
        ImageSyncJobStatus::Failed
    );
}

#[tokio::test]
async fn stuck_agent_locks_are_released() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    h.agent.set_locks(
        &host,
        vec![lm_adapters::LockEntry {
            lab_id: "lab-stuck".to_string(),
            age_seconds: 2000.0,
            is_stuck: true,
        }],
    );

    JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert_eq!(h.agent.call_count("release_lock"), 1);
}

#[tokio::test]
async fn stuck_transitional_nodes_recover_to_stopped() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Running);
    h.add_node(&lab, "stopper", Some(&host));
    h.add_node(&lab, "starter", Some(&host));
    h.add_node(&lab, "syncing", Some(&host));

    let stale = h.clock.epoch_ms();
    h.store.with_node_state(&lab.id, "stopper", |row| {
        row.actual_state = NodeActualState::Stopping;
        row.stopping_started_at_ms = Some(stale);
    });
    h.store.with_node_state(&lab.id, "starter", |row| {
        row.actual_state = NodeActualState::Starting;
        row.starting_started_at_ms = Some(stale);
    });
    h.store.with_node_state(&lab.id, "syncing", |row| {
        row.actual_state = NodeActualState::Starting;
        row.starting_started_at_ms = Some(stale);
        row.image_sync_status = Some(lm_core::ImageSyncState::Syncing);
    });
    h.clock.advance(Duration::from_secs(400));
    h.heartbeat(&host);

    JobHealthMonitor::new(h.ctx.clone()).run_once().await;

    assert_eq!(h.node_state(&lab, "stopper").actual_state, NodeActualState::Stopped);
    assert_eq!(h.node_state(&lab, "starter").actual_state, NodeActualState::Stopped);
    // Image-sync exception: still starting.
    assert_eq!(h.node_state(&lab, "syncing").actual_state, NodeActualState::Starting);
}

#[tokio::test]
async fn transitional_nodes_with_active_job_are_left_alone() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Running);
    h.add_node(&lab, "n1", Some(&host));
    let stale = h.clock.epoch_ms();
    h.store.with_node_state(&lab.id, "n1", |row| {
        row.actual_state = NodeActualState::Stopping;
        row.stopping_started_at_ms = Some(stale);
    });
    h.clock.advance(Duration::from_secs(400));
    h.heartbeat(&host);
    let mut job = h.make_job(&lab, JobAction::SyncBatch(1), vec!["n1".to_string()]);
    job.status = JobStatus::Running;
    job.started_at_ms = Some(h.clock.epoch_ms());
    h.store.insert_job(job);

    JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert_eq!(h.node_state(&lab, "n1").actual_state, NodeActualState::Stopping);
}

#[tokio::test]
async fn orphaned_image_sync_markers_are_cleared() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Running);
    h.add_node(&lab, "n1", Some(&host));
    h.store.upsert_placement(
        lm_core::NodePlacement::builder()
            .lab_id(lab.id)
            .node_name("n1")
            .host_id(host.id)
            .build(),
    );
    h.set_node_state(&lab, "n1", NodeDesiredState::Running, NodeActualState::Running);
    h.store.with_node_state(&lab.id, "n1", |row| {
        row.image_sync_status = Some(lm_core::ImageSyncState::Syncing);
    });

    // No active ImageSyncJob exists → the marker is stale.
    JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert!(h.node_state(&lab, "n1").image_sync_status.is_none());

    // With a live sync job the marker survives.
    h.store.with_node_state(&lab.id, "n1", |row| {
        row.image_sync_status = Some(lm_core::ImageSyncState::Syncing);
    });
    h.store.insert_image_sync_job(lm_core::ImageSyncJob::new(
        "alpine:latest",
        host.id,
        h.clock.epoch_ms(),
    ));
    JobHealthMonitor::new(h.ctx.clone()).run_once().await;
    assert!(h.node_state(&lab, "n1").image_sync_status.is_some());
}

#[tokio::test]
async fn stuck_agent_updates_fail() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let update = lm_core::AgentUpdateJob {
        id: lm_core::AgentUpdateJobId::new(),
        host_id: host.id,
        target_version: "1.2.3".to_string(),
        status: AgentUpdateStatus::Downloading,
        created_at_ms: h.clock.epoch_ms(),
        started_at_ms: Some(h.clock.epoch_ms()),
        completed_at_ms: None,
        error_message: None,
    };
    let update_id = update.id;
    h.store.insert_agent_update_job(update);
    h.clock.advance(Duration::from_secs(700));
    h.heartbeat(&host);

    JobHealthMonitor::new(h.ctx.clone()).run_once().await;

    let tables = h.store.export();
    let job = &tables.agent_update_jobs[&update_id];
    assert_eq!(job.status, AgentUpdateStatus::Failed);
    assert!(job.error_message.as_deref().unwrap_or("").contains("Timed out"));
}
