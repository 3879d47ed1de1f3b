// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Image sync: confirm (or transfer) images before deploys.
//!
//! The controller only tracks sync state and asks agents about their
//! inventories; actual byte transfer is the agent's business. Node
//! states carry an `image_sync_status` side-channel so the UI can show
//! sync progress per node.

use crate::ctx::Ctx;
use crate::topology::TopologyService;
use lm_core::{
    Clock, Event, Host, ImageHost, ImageSyncJob, ImageSyncJobStatus, ImageSyncState, Lab,
};
use std::sync::Arc;

pub struct ImageSyncService<C: Clock> {
    ctx: Arc<Ctx<C>>,
}

impl<C: Clock> ImageSyncService<C> {
    pub fn new(ctx: Arc<Ctx<C>>) -> Self {
        Self { ctx }
    }

    /// Ask the agent whether it has the image, consulting the recorded
    /// per-host inventory first.
    pub async fn check_agent_has_image(&self, host: &Host, image_ref: &str) -> bool {
        if self.ctx.store.image_completed_on_host(image_ref, &host.id) {
            return true;
        }
        match self.ctx.agent.list_images(host).await {
            Ok(images) => {
                let present = images.iter().any(|i| i.reference == image_ref);
                if present {
                    // Cache the observation.
                    self.ctx.store.upsert_image_host(ImageHost {
                        image_ref: image_ref.to_string(),
                        host_id: host.id,
                        status: ImageSyncJobStatus::Completed,
                        error_message: None,
                        updated_at_ms: self.ctx.now_ms(),
                    });
                }
                present
            }
            Err(e) => {
                tracing::debug!(host = %host.name, image = image_ref, error = %e, "image inventory query failed");
                false
            }
        }
    }

    /// Pre-deploy gate: confirm every image the lab needs is available
    /// on the host. Returns `(all_ready, missing)`; when sync is
    /// enabled, missing images get sync jobs created and the affected
    /// nodes marked `checking`/`syncing`.
    pub async fn ensure_images_for_deployment(
        &self,
        lab: &Lab,
        host: &Host,
    ) -> (bool, Vec<String>) {
        let topo = TopologyService::new(&self.ctx.store);
        let required = topo.get_required_images(&lab.id);
        if required.is_empty() {
            return (true, Vec::new());
        }
        let image_to_nodes = topo.get_image_to_nodes_map(&lab.id);

        let mut missing = Vec::new();
        for image_ref in &required {
            self.set_node_sync_status(
                lab,
                image_to_nodes.get(image_ref),
                Some(ImageSyncState::Checking),
                None,
            );

            if self.check_agent_has_image(host, image_ref).await {
                self.set_node_sync_status(lab, image_to_nodes.get(image_ref), None, None);
                continue;
            }
            missing.push(image_ref.clone());

            if self.ctx.settings.image_sync_enabled {
                self.start_sync(host, image_ref);
                self.set_node_sync_status(
                    lab,
                    image_to_nodes.get(image_ref),
                    Some(ImageSyncState::Syncing),
                    Some(&format!("syncing {image_ref} to {}", host.name)),
                );
            } else {
                self.set_node_sync_status(
                    lab,
                    image_to_nodes.get(image_ref),
                    Some(ImageSyncState::Failed),
                    Some(&format!("image {image_ref} not available and sync disabled")),
                );
            }
        }

        (missing.is_empty(), missing)
    }

    /// Record a pending sync job for (image, host), unless one is
    /// already active.
    fn start_sync(&self, host: &Host, image_ref: &str) {
        let store = &self.ctx.store;
        if store.active_image_sync_for(image_ref, &host.id).is_some() {
            return;
        }
        let now = self.ctx.now_ms();
        let job = ImageSyncJob::new(image_ref, host.id, now);
        tracing::info!(
            image = image_ref,
            host = %host.name,
            job_id = %job.id,
            "created image sync job"
        );
        store.insert_image_sync_job(job);
        store.upsert_image_host(ImageHost {
            image_ref: image_ref.to_string(),
            host_id: host.id,
            status: ImageSyncJobStatus::Pending,
            error_message: None,
            updated_at_ms: now,
        });
    }

    fn set_node_sync_status(
        &self,
        lab: &Lab,
        node_names: Option<&Vec<String>>,
        status: Option<ImageSyncState>,
        message: Option<&str>,
    ) {
        let Some(node_names) = node_names else { return };
        for node_name in node_names {
            let previous = self
                .ctx
                .store
                .get_node_state(&lab.id, node_name)
                .and_then(|ns| ns.image_sync_status);
            self.ctx.store.with_node_state(&lab.id, node_name, |row| {
                row.image_sync_status = status;
                row.image_sync_message = message.map(str::to_string);
            });
            if status.is_none() && previous.is_some() {
                self.ctx.publish(Event::ImageSyncCleared {
                    lab_id: lab.id,
                    node_name: node_name.clone(),
                    previous,
                });
            }
        }
    }

    /// Clear a node's sync marker (job-health orphan sweep).
    pub fn clear_node_sync_status(&self, lab_id: &lm_core::LabId, node_name: &str) {
        let previous = self
            .ctx
            .store
            .get_node_state(lab_id, node_name)
            .and_then(|ns| ns.image_sync_status);
        self.ctx.store.with_node_state(lab_id, node_name, |row| {
            row.image_sync_status = None;
            row.image_sync_message = None;
        });
        if previous.is_some() {
            self.ctx.publish(Event::ImageSyncCleared {
                lab_id: *lab_id,
                node_name: node_name.to_string(),
                previous,
            });
        }
    }
}

#[cfg(test)]
#[path = "image_sync_tests.rs"]
mod tests;
