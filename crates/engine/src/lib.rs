// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! lm-engine: the state convergence engine.
//!
//! The closed loop that drives per-node lifecycle through transitional
//! states, reconciles stored state against each agent's observed
//! reality, enforces desired state with bounded retry, constructs links
//! when both endpoints are ready, and supervises job health — all under
//! distributed locking.

pub mod agents;
pub mod capacity;
pub mod ctx;
pub mod enforce;
pub mod extract;
pub mod health;
pub mod image_sync;
pub mod lifecycle;
pub mod links;
pub mod reconcile;
pub mod runner;
pub mod topology;

pub use agents::provider_for_node;
pub use capacity::{check_host_capacity, CapacityReport, HostCapacity};
pub use ctx::Ctx;
pub use enforce::Enforcer;
pub use health::JobHealthMonitor;
pub use image_sync::ImageSyncService;
pub use lifecycle::{LifecycleOutcome, NodeLifecycle};
pub use links::{LinkError, LinkOrchestrator};
pub use reconcile::Reconciler;
pub use runner::JobRunner;
pub use topology::{normalize_interface, PlacementAnalysis, TopologyService};

#[cfg(test)]
mod test_support;
#[cfg(test)]
#[path = "scenarios_tests.rs"]
mod scenarios_tests;
