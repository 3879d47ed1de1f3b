// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle management: startup, shutdown, recovery.

use lm_adapters::{HttpAgentClient, MemoryCoordStore};
use lm_core::{Broadcaster, Settings, SystemClock};
use lm_engine::{Ctx, JobRunner};
use lm_storage::{Snapshot, Store};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Daemon runtime context with concrete types.
pub type DaemonCtx = Ctx<SystemClock>;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root state directory (e.g. /var/lib/labmesh)
    pub state_dir: PathBuf,
    /// Path to the settings file
    pub settings_path: PathBuf,
    /// Path to the snapshot file
    pub snapshot_path: PathBuf,
    /// Path to the daemon log file
    pub log_path: PathBuf,
}

impl Config {
    /// Paths under a state directory. The directory comes from
    /// `LABMESH_STATE_DIR` (default `/var/lib/labmesh`).
    pub fn load() -> Self {
        let state_dir = std::env::var("LABMESH_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/labmesh"));
        Self::for_state_dir(state_dir)
    }

    pub fn for_state_dir(state_dir: PathBuf) -> Self {
        Self {
            settings_path: state_dir.join("labmesh.toml"),
            snapshot_path: state_dir.join("snapshot.zst"),
            log_path: state_dir.join("labmeshd.log"),
            state_dir,
        }
    }
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("config error: {0}")]
    Config(#[from] lm_core::ConfigError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] lm_storage::SnapshotError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Daemon state during operation.
pub struct DaemonState {
    pub config: Config,
    pub ctx: Arc<DaemonCtx>,
    pub runner: Arc<JobRunner<SystemClock>>,
    pub cancel: CancellationToken,
}

impl DaemonState {
    /// Build the full runtime: settings, snapshot recovery, adapters,
    /// worker pool.
    pub fn startup(config: Config) -> Result<Self, LifecycleError> {
        std::fs::create_dir_all(&config.state_dir)?;

        let settings = if config.settings_path.exists() {
            Settings::load(&config.settings_path)?
        } else {
            Settings::from_env()?
        };

        let store = Arc::new(Store::new());
        match Snapshot::recover(&config.snapshot_path) {
            Some(snapshot) => {
                let tables = snapshot.tables;
                info!(
                    labs = tables.labs.len(),
                    hosts = tables.hosts.len(),
                    jobs = tables.jobs.len(),
                    "recovered state from snapshot"
                );
                store.import(tables);
            }
            None => info!("no snapshot found, starting with empty state"),
        }

        let clock = SystemClock;
        let agent = Arc::new(HttpAgentClient::new(settings.agent_auth_token.clone()));
        let coord = Arc::new(MemoryCoordStore::new(clock.clone()));
        let ctx = Arc::new(Ctx::new(
            store,
            agent,
            coord,
            Broadcaster::default(),
            Arc::new(settings),
            clock,
        ));

        let cancel = CancellationToken::new();
        let runner = JobRunner::new(ctx.clone(), cancel.clone());

        Ok(Self { config, ctx, runner, cancel })
    }

    /// Resume jobs that were queued when the daemon last stopped.
    pub fn resume_queued_jobs(&self) {
        let queued: Vec<_> = self
            .ctx
            .store
            .active_jobs()
            .into_iter()
            .filter(|j| j.status == lm_core::JobStatus::Queued)
            .collect();
        if queued.is_empty() {
            return;
        }
        info!(count = queued.len(), "resuming queued jobs from snapshot");
        for job in queued {
            self.runner.spawn(job.id);
        }
    }

    /// Persist the current tables.
    pub fn checkpoint(&self) -> Result<(), LifecycleError> {
        Snapshot::new(self.ctx.store.export()).save(&self.config.snapshot_path)?;
        Ok(())
    }

    /// Shutdown the daemon gracefully: stop the monitors and workers,
    /// then save a final snapshot so the next startup resumes cleanly.
    pub fn shutdown(&self) {
        info!("shutting down daemon");
        self.cancel.cancel();
        if let Err(e) = self.checkpoint() {
            warn!(error = %e, "failed to save shutdown snapshot");
        } else {
            info!("saved shutdown snapshot");
        }
        info!("daemon shutdown complete");
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
