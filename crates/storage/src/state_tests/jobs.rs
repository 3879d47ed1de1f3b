// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::store_with_lab;
use lm_core::{Job, JobAction, JobStatus, LabState};

#[test]
fn active_job_queries_filter_by_lab_and_kind() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    let deploy = Job::builder()
        .lab_id(lab_id)
        .action(JobAction::Up)
        .status(JobStatus::Running)
        .build();
    let sync = Job::builder()
        .lab_id(lab_id)
        .action(JobAction::SyncBatch(2))
        .status(JobStatus::Queued)
        .node_ids(vec!["n1".to_string(), "n2".to_string()])
        .build();
    let done = Job::builder()
        .lab_id(lab_id)
        .action(JobAction::Down)
        .status(JobStatus::Completed)
        .build();
    store.insert_job(deploy.clone());
    store.insert_job(sync.clone());
    store.insert_job(done);

    assert_eq!(store.active_jobs_for_lab(&lab_id).len(), 2);
    assert_eq!(store.active_lab_wide_job(&lab_id).unwrap().id, deploy.id);
    assert_eq!(store.active_job_for_node(&lab_id, "n2").unwrap().id, sync.id);
    assert!(store.active_job_for_node(&lab_id, "n9").is_none());
}

#[test]
fn duplicate_detection_matches_lab_and_action() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    let original = Job::builder()
        .lab_id(lab_id)
        .action(JobAction::Up)
        .status(JobStatus::Running)
        .build();
    let twin = Job::builder()
        .lab_id(lab_id)
        .action(JobAction::Up)
        .status(JobStatus::Queued)
        .build();
    store.insert_job(original.clone());
    store.insert_job(twin.clone());

    let dup = store.duplicate_active_job(&original).unwrap();
    assert_eq!(dup.id, twin.id);
}

#[test]
fn active_children_tracks_parent_link() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    let parent = Job::builder().lab_id(lab_id).status(JobStatus::Running).build();
    let child = Job::builder()
        .lab_id(lab_id)
        .status(JobStatus::Running)
        .parent_job_id(parent.id)
        .build();
    let finished_child = Job::builder()
        .lab_id(lab_id)
        .status(JobStatus::Completed)
        .parent_job_id(parent.id)
        .build();
    store.insert_job(parent.clone());
    store.insert_job(child.clone());
    store.insert_job(finished_child);

    let children = store.active_children(&parent.id);
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, child.id);
}

#[test]
fn orphaned_queued_jobs_need_no_agent_and_age() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    let old_unassigned = Job::builder()
        .lab_id(lab_id)
        .status(JobStatus::Queued)
        .created_at_ms(1_000u64)
        .build();
    let mut old_assigned = Job::builder()
        .lab_id(lab_id)
        .status(JobStatus::Queued)
        .created_at_ms(1_000u64)
        .build();
    old_assigned.agent_id = Some(lm_core::HostId::from_string("hst-x"));
    let fresh = Job::builder()
        .lab_id(lab_id)
        .status(JobStatus::Queued)
        .created_at_ms(9_000u64)
        .build();
    store.insert_job(old_unassigned.clone());
    store.insert_job(old_assigned);
    store.insert_job(fresh);

    let orphans = store.orphaned_queued_jobs(5_000);
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, old_unassigned.id);
}
