// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_support::Harness;
use lm_core::{JobAction, JobStatus, LabState, NodeActualState, NodeDesiredState};
use std::time::Duration;

fn crashed_lab(h: &Harness) -> (lm_core::Lab, lm_core::Host) {
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Running);
    h.add_node(&lab, "n1", Some(&host));
    h.set_node_state(&lab, "n1", NodeDesiredState::Running, NodeActualState::Error);
    (lab, host)
}

async fn drain_cooldown(h: &Harness, lab: &lm_core::Lab, node: &str) {
    // Remove the coordination-store cooldown so the next pass is gated
    // only by the database-side backoff.
    let key = lm_adapters::keys::enforcement_cooldown(lab.id.as_str(), node);
    let _ = h.ctx.coord.delete(&[key]).await;
}

fn complete_job(h: &Harness, job_id: &lm_core::JobId) {
    h.store.with_job(job_id, |row| {
        row.status = JobStatus::Completed;
        row.completed_at_ms = Some(0);
    });
}

#[tokio::test]
async fn mismatch_creates_one_batch_job_per_lab() {
    let h = Harness::new();
    let (lab, host) = crashed_lab(&h);
    h.add_node(&lab, "n2", Some(&host));
    h.set_node_state(&lab, "n2", NodeDesiredState::Running, NodeActualState::Stopped);

    let jobs = Enforcer::new(h.ctx.clone()).run_once().await;

    assert_eq!(jobs.len(), 1);
    let job = h.store.get_job(&jobs[0]).unwrap();
    assert_eq!(job.action, JobAction::SyncBatch(2));
    assert_eq!(job.node_ids.len(), 2);

    // Attempt bookkeeping was stamped on both nodes.
    for node in ["n1", "n2"] {
        let ns = h.node_state(&lab, node);
        assert_eq!(ns.enforcement_attempts, 1);
        assert!(ns.last_enforcement_at_ms.is_some());
    }
}

#[tokio::test]
async fn disabled_enforcement_does_nothing() {
    let h = Harness::with_settings(|s| s.state_enforcement_enabled = false);
    crashed_lab(&h);
    let jobs = Enforcer::new(h.ctx.clone()).run_once().await;
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn transitional_labs_are_not_enforced() {
    let h = Harness::new();
    let host = h.add_host("host-a");
    let lab = h.add_lab(LabState::Starting);
    h.add_node(&lab, "n1", Some(&host));
    h.set_node_state(&lab, "n1", NodeDesiredState::Running, NodeActualState::Stopped);

    let jobs = Enforcer::new(h.ctx.clone()).run_once().await;
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn cooldown_key_blocks_immediate_refire() {
    let h = Harness::new();
    let (lab, _) = crashed_lab(&h);

    let enforcer = Enforcer::new(h.ctx.clone());
    let first = enforcer.run_once().await;
    assert_eq!(first.len(), 1);
    complete_job(&h, &first[0]);

    // Past the backoff window but the cooldown key (TTL 300s) is still
    // fresh: nothing fires until a user operation clears it.
    h.clock.advance(Duration::from_secs(31));
    let second = enforcer.run_once().await;
    assert!(second.is_empty());

    enforcer
        .clear_cooldowns_for_lab(&lab.id, &["n1".to_string()])
        .await;
    let third = enforcer.run_once().await;
    assert_eq!(third.len(), 1);
}

#[tokio::test]
async fn backoff_schedule_fires_at_zero_then_doubling_delays() {
    // max_retries=3, backoff=30s: fires at t=0, t≈30s, t≈60s.
    let h = Harness::with_settings(|s| {
        s.state_enforcement_max_retries = 3;
        s.state_enforcement_retry_backoff = 30;
    });
    let (lab, _) = crashed_lab(&h);
    let enforcer = Enforcer::new(h.ctx.clone());

    // t=0: first attempt.
    let jobs = enforcer.run_once().await;
    assert_eq!(jobs.len(), 1);
    complete_job(&h, &jobs[0]);
    h.set_node_state(&lab, "n1", NodeDesiredState::Running, NodeActualState::Error);
    drain_cooldown(&h, &lab, "n1").await;

    // t=10s: inside the 30s backoff window, nothing fires.
    h.clock.advance(Duration::from_secs(10));
    assert!(enforcer.run_once().await.is_empty());

    // t=31s: second attempt.
    h.clock.advance(Duration::from_secs(21));
    let jobs = enforcer.run_once().await;
    assert_eq!(jobs.len(), 1);
    complete_job(&h, &jobs[0]);
    h.set_node_state(&lab, "n1", NodeDesiredState::Running, NodeActualState::Error);
    drain_cooldown(&h, &lab, "n1").await;

    // t=61s: attempt 2 needs a 60s gap; only 30s elapsed.
    h.clock.advance(Duration::from_secs(30));
    assert!(enforcer.run_once().await.is_empty());

    // t=92s: third attempt fires.
    h.clock.advance(Duration::from_secs(31));
    let jobs = enforcer.run_once().await;
    assert_eq!(jobs.len(), 1);
    complete_job(&h, &jobs[0]);
    h.set_node_state(&lab, "n1", NodeDesiredState::Running, NodeActualState::Error);
    drain_cooldown(&h, &lab, "n1").await;

    let ns = h.node_state(&lab, "n1");
    assert_eq!(ns.enforcement_attempts, 3);
}

#[tokio::test]
async fn exhausted_retries_set_permanent_failure_once() {
    let h = Harness::with_settings(|s| s.state_enforcement_max_retries = 1);
    let (lab, _) = crashed_lab(&h);
    let enforcer = Enforcer::new(h.ctx.clone());

    let jobs = enforcer.run_once().await;
    assert_eq!(jobs.len(), 1);
    complete_job(&h, &jobs[0]);
    h.store.with_node_state(&lab.id, "n1", |row| {
        row.actual_state = NodeActualState::Error;
        row.error_message = Some("segfault".to_string());
    });
    drain_cooldown(&h, &lab, "n1").await;
    h.clock.advance(Duration::from_secs(3600));

    // Attempts exhausted: marks the failure and stops.
    let jobs = enforcer.run_once().await;
    assert!(jobs.is_empty());
    let ns = h.node_state(&lab, "n1");
    assert!(ns.enforcement_failed_at_ms.is_some());
    assert_eq!(ns.actual_state, NodeActualState::Error);
    assert!(ns
        .error_message
        .as_deref()
        .unwrap_or("")
        .contains("State enforcement failed after 1 attempts"));
    assert!(ns.error_message.as_deref().unwrap_or("").contains("segfault"));
}

#[tokio::test]
async fn crash_cooldown_allows_retry_after_expiry() {
    let h = Harness::with_settings(|s| {
        s.state_enforcement_max_retries = 1;
        s.state_enforcement_crash_cooldown = 300;
    });
    let (lab, _) = crashed_lab(&h);
    let enforcer = Enforcer::new(h.ctx.clone());

    // Exhaust and mark.
    let jobs = enforcer.run_once().await;
    complete_job(&h, &jobs[0]);
    h.set_node_state(&lab, "n1", NodeDesiredState::Running, NodeActualState::Error);
    drain_cooldown(&h, &lab, "n1").await;
    h.clock.advance(Duration::from_secs(3600));
    assert!(enforcer.run_once().await.is_empty());
    assert!(h.node_state(&lab, "n1").enforcement_failed_at_ms.is_some());

    // Inside the crash cooldown: still nothing.
    drain_cooldown(&h, &lab, "n1").await;
    h.clock.advance(Duration::from_secs(100));
    assert!(enforcer.run_once().await.is_empty());

    // Past the crash cooldown: a fresh retry cycle begins and the
    // failure marker clears.
    h.clock.advance(Duration::from_secs(300));
    drain_cooldown(&h, &lab, "n1").await;
    let jobs = enforcer.run_once().await;
    assert_eq!(jobs.len(), 1);
    let ns = h.node_state(&lab, "n1");
    assert!(ns.enforcement_failed_at_ms.is_none());
}

#[tokio::test]
async fn auto_restart_disabled_skips_error_nodes() {
    let h = Harness::with_settings(|s| s.state_enforcement_auto_restart_enabled = false);
    let (lab, host) = crashed_lab(&h);
    // A plain stopped mismatch still enforces.
    h.add_node(&lab, "n2", Some(&host));
    h.set_node_state(&lab, "n2", NodeDesiredState::Running, NodeActualState::Stopped);

    let jobs = Enforcer::new(h.ctx.clone()).run_once().await;
    assert_eq!(jobs.len(), 1);
    let job = h.store.get_job(&jobs[0]).unwrap();
    assert_eq!(job.node_ids, vec!["n2".to_string()]);
}

#[tokio::test]
async fn active_lab_wide_job_blocks_batch() {
    let h = Harness::new();
    let (lab, _) = crashed_lab(&h);
    let mut deploy = h.make_job(&lab, JobAction::Up, vec![]);
    deploy.status = JobStatus::Running;
    h.store.insert_job(deploy);

    let jobs = Enforcer::new(h.ctx.clone()).run_once().await;
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn active_node_job_blocks_that_node() {
    let h = Harness::new();
    let (lab, host) = crashed_lab(&h);
    h.add_node(&lab, "n2", Some(&host));
    h.set_node_state(&lab, "n2", NodeDesiredState::Running, NodeActualState::Stopped);

    let mut sync = h.make_job(&lab, JobAction::SyncNode("n1".into()), vec!["n1".to_string()]);
    sync.status = JobStatus::Running;
    h.store.insert_job(sync);

    let jobs = Enforcer::new(h.ctx.clone()).run_once().await;
    assert_eq!(jobs.len(), 1);
    let job = h.store.get_job(&jobs[0]).unwrap();
    assert_eq!(job.node_ids, vec!["n2".to_string()]);
}

#[tokio::test]
async fn config_extraction_runs_for_crashed_nodes() {
    let h = Harness::new();
    let (lab, host) = crashed_lab(&h);
    h.store.upsert_placement(
        lm_core::NodePlacement::builder()
            .lab_id(lab.id)
            .node_name("n1")
            .host_id(host.id)
            .build(),
    );
    h.agent.set_configs(
        lab.id.as_str(),
        vec![lm_adapters::ExtractedConfig {
            node_name: "n1".to_string(),
            content: "hostname n1".to_string(),
        }],
    );

    Enforcer::new(h.ctx.clone()).run_once().await;

    let snapshots = h.store.config_snapshots_for_lab(&lab.id);
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].kind, lm_core::SnapshotKind::AutoRestart);
    assert_eq!(snapshots[0].node_name, "n1");
}
