// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Image sync and agent update accessors.

use super::Store;
use lm_core::{
    AgentUpdateJob, AgentUpdateJobId, HostId, ImageHost, ImageSyncJob, ImageSyncJobId,
    ImageSyncJobStatus,
};

impl Store {
    /// Insert or replace by (image_ref, host_id).
    pub fn upsert_image_host(&self, record: ImageHost) {
        let mut tables = self.write();
        if let Some(existing) = tables
            .image_hosts
            .iter_mut()
            .find(|ih| ih.image_ref == record.image_ref && ih.host_id == record.host_id)
        {
            *existing = record;
        } else {
            tables.image_hosts.push(record);
        }
    }

    pub fn get_image_host(&self, image_ref: &str, host_id: &HostId) -> Option<ImageHost> {
        self.read()
            .image_hosts
            .iter()
            .find(|ih| ih.image_ref == image_ref && ih.host_id == *host_id)
            .cloned()
    }

    pub fn insert_image_sync_job(&self, job: ImageSyncJob) {
        self.write().image_sync_jobs.insert(job.id, job);
    }

    pub fn get_image_sync_job(&self, id: &ImageSyncJobId) -> Option<ImageSyncJob> {
        self.read().image_sync_jobs.get(id).cloned()
    }

    pub fn with_image_sync_job(
        &self,
        id: &ImageSyncJobId,
        f: impl FnOnce(&mut ImageSyncJob),
    ) -> bool {
        let mut tables = self.write();
        match tables.image_sync_jobs.get_mut(id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }

    pub fn active_image_sync_jobs(&self) -> Vec<ImageSyncJob> {
        self.read()
            .image_sync_jobs
            .values()
            .filter(|j| j.status.is_active())
            .cloned()
            .collect()
    }

    /// An active sync for this image on this host, if any.
    pub fn active_image_sync_for(&self, image_ref: &str, host_id: &HostId) -> Option<ImageSyncJob> {
        self.read()
            .image_sync_jobs
            .values()
            .find(|j| j.status.is_active() && j.image_ref == image_ref && j.host_id == *host_id)
            .cloned()
    }

    /// Whether the image is recorded as completed on the host.
    pub fn image_completed_on_host(&self, image_ref: &str, host_id: &HostId) -> bool {
        self.get_image_host(image_ref, host_id)
            .map(|ih| ih.status == ImageSyncJobStatus::Completed)
            .unwrap_or(false)
    }

    pub fn insert_agent_update_job(&self, job: AgentUpdateJob) {
        self.write().agent_update_jobs.insert(job.id, job);
    }

    pub fn with_agent_update_job(
        &self,
        id: &AgentUpdateJobId,
        f: impl FnOnce(&mut AgentUpdateJob),
    ) -> bool {
        let mut tables = self.write();
        match tables.agent_update_jobs.get_mut(id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }

    pub fn active_agent_update_jobs(&self) -> Vec<AgentUpdateJob> {
        self.read()
            .agent_update_jobs
            .values()
            .filter(|j| j.status.is_active())
            .cloned()
            .collect()
    }

    pub fn insert_config_snapshot(&self, snapshot: lm_core::ConfigSnapshot) {
        self.write().config_snapshots.push(snapshot);
    }

    pub fn config_snapshots_for_lab(&self, lab_id: &lm_core::LabId) -> Vec<lm_core::ConfigSnapshot> {
        self.read()
            .config_snapshots
            .iter()
            .filter(|s| s.lab_id == *lab_id)
            .cloned()
            .collect()
    }
}
