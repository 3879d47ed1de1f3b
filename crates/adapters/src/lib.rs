// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! lm-adapters: the external collaborators the convergence core talks to.
//!
//! - [`agent`]: typed RPC over the worker-agent HTTP surface, with
//!   transient/permanent error classification.
//! - [`coord`]: the coordination-store interface (`SET NX EX` locks and
//!   TTL cooldown keys).

pub mod agent;
pub mod coord;

pub use agent::{
    AgentApi, AgentError, AgentJobOutcome, ContainerStatus, CrossHostLinkRequest,
    CrossHostLinkResult, DeclareResultEntry, DeclareStateResult, DeclareTunnelOutcome,
    DeclaredTunnel, DeployLink, DeployNode, DeployTopology, ExternalConnectRequest, ExtractResult,
    ExtractedConfig, HotConnectRequest, HotConnectResult, HttpAgentClient, ImageInfo, LabStatus,
    LockEntry, LockStatus, OverlayCleanupResult, ReleaseLockResult,
};
#[cfg(any(test, feature = "test-support"))]
pub use agent::{AgentCall, FakeAgent, FakeFailure};
pub use coord::{keys, CoordError, CoordStore, MemoryCoordStore};
