// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic monitor loops.
//!
//! Each monitor runs on its own ticker, independent of the others. One
//! pass failing never stops a loop; jobs the monitors create go to the
//! runner's worker pool.

use crate::lifecycle::DaemonState;
use lm_core::SystemClock;
use lm_engine::{Enforcer, JobHealthMonitor, JobRunner, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How often the in-memory tables checkpoint to disk.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn every background loop. They all stop when `cancel` fires.
pub fn spawn_monitors(state: &DaemonState) {
    let ctx = state.ctx.clone();
    let runner = state.runner.clone();
    let cancel = state.cancel.clone();
    let settings = ctx.settings.clone();

    spawn_loop(
        "reconciliation",
        settings.reconciliation_interval(),
        cancel.clone(),
        {
            let ctx = ctx.clone();
            let runner = runner.clone();
            move || {
                let reconciler = Reconciler::new(ctx.clone());
                let runner = runner.clone();
                async move {
                    schedule(&runner, reconciler.run_once().await);
                }
            }
        },
    );

    if settings.state_enforcement_enabled {
        spawn_loop(
            "state-enforcement",
            settings.enforcement_interval(),
            cancel.clone(),
            {
                let ctx = ctx.clone();
                let runner = runner.clone();
                move || {
                    let enforcer = Enforcer::new(ctx.clone());
                    let runner = runner.clone();
                    async move {
                        schedule(&runner, enforcer.run_once().await);
                    }
                }
            },
        );
        info!(
            interval = settings.state_enforcement_interval,
            cooldown = settings.state_enforcement_cooldown,
            "state enforcement monitor started"
        );
    }

    spawn_loop(
        "job-health",
        settings.job_health_interval(),
        cancel.clone(),
        {
            let ctx = ctx.clone();
            let runner = runner.clone();
            move || {
                let monitor = JobHealthMonitor::new(ctx.clone());
                let runner = runner.clone();
                async move {
                    schedule(&runner, monitor.run_once().await);
                }
            }
        },
    );

    // Periodic snapshot checkpoint.
    {
        let config = state.config.clone();
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECKPOINT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = lm_storage::Snapshot::new(ctx.store.export());
                        if let Err(e) = snapshot.save(&config.snapshot_path) {
                            tracing::warn!(error = %e, "periodic checkpoint failed");
                        }
                    }
                }
            }
        });
    }

    info!(
        reconciliation_interval = settings.reconciliation_interval,
        job_health_interval = settings.job_health_check_interval,
        "monitors started"
    );
}

fn schedule(runner: &Arc<JobRunner<SystemClock>>, job_ids: Vec<lm_core::JobId>) {
    for job_id in job_ids {
        runner.spawn(job_id);
    }
}

/// Generic ticker loop: run `pass` every `interval` until cancelled.
/// The first tick fires after one full interval, matching the original
/// monitors' sleep-then-work shape.
fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut pass: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // completes immediately; skip the zero tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(monitor = name, "monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    pass().await;
                }
            }
        }
    });
}
