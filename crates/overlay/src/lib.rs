// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! lm-overlay: agent-side VXLAN overlay networking.
//!
//! Maintains a single shared OVS bridge per host, creates VXLAN ports
//! with VLAN-tag isolation for cross-host links, attaches container
//! veths, and converges local overlay state against declarations from
//! the controller. VNIs come from a disk-persisted allocator that can
//! recover from live system state after a crash.

pub mod command;
pub mod manager;
pub mod vni;

pub use command::{CommandOutput, CommandRunner, TokioCommandRunner};
#[cfg(any(test, feature = "test-support"))]
pub use command::{FakeCommandRunner, Invocation};
pub use manager::{
    DeclareEntry, DeclareOutcome, DeclareResult, DeclaredTunnelSpec, LinkTunnel, OverlayCleanup,
    OverlayConfig, OverlayError, OverlayManager,
};
pub use vni::{scan_system_vxlan_names, VniAllocator, VniError};
