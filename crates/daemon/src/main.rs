// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! labmeshd: the labmesh controller daemon.

use lm_daemon::lifecycle::{Config, DaemonState};
use lm_daemon::monitors::spawn_monitors;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    match config.log_path.parent().map(std::fs::create_dir_all) {
        Some(Ok(())) => {
            let file_appender = tracing_appender::rolling::never(
                config.log_path.parent().unwrap_or(std::path::Path::new(".")),
                config
                    .log_path
                    .file_name()
                    .unwrap_or(std::ffi::OsStr::new("labmeshd.log")),
            );
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(stdout_layer).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config = Config::load();
    let _log_guard = init_tracing(&config);

    info!(state_dir = %config.state_dir.display(), "labmeshd starting");

    let state = match DaemonState::startup(config) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "startup failed");
            return std::process::ExitCode::FAILURE;
        }
    };

    spawn_monitors(&state);
    state.resume_queued_jobs();
    info!("labmeshd ready");

    // Run until SIGINT/SIGTERM.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(term) => term,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
    };
    shutdown.await;

    state.shutdown();
    std::process::ExitCode::SUCCESS
}
