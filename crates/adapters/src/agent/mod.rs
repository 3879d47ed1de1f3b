// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed RPC over the worker-agent HTTP surface.
//!
//! Every failure is classified into one of two kinds, and everything
//! downstream branches on that classification:
//!
//! - [`AgentError::Unavailable`] — connect failure, timeout, 5xx. The
//!   caller must preserve the current state and let job-health retry;
//!   an unreachable agent never silently erases state.
//! - [`AgentError::Job`] — the agent returned a structured error. The
//!   caller records it (`actual_state = error`).

mod http;

pub use http::HttpAgentClient;

#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{AgentCall, FakeAgent, FakeFailure};

use async_trait::async_trait;
use lm_core::{Host, Provider};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from agent operations, pre-classified for the caller.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Network failure, timeout, or 5xx. Transient: preserve state.
    #[error("agent unavailable: {message}")]
    Unavailable { message: String },
    /// The agent executed the request and reported failure. Permanent:
    /// record the error.
    #[error("agent job error: {message}")]
    Job {
        message: String,
        stdout: Option<String>,
        stderr: Option<String>,
    },
}

impl AgentError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    pub fn job(message: impl Into<String>) -> Self {
        Self::Job { message: message.into(), stdout: None, stderr: None }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Outcome of a deploy/destroy/container operation on an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentJobOutcome {
    pub status: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AgentJobOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// One container's status in a lab status report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub ready: Option<bool>,
}

/// Full lab status from one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabStatus {
    #[serde(default)]
    pub nodes: Vec<ContainerStatus>,
    /// Set when the agent responded but could not trust its own runtime
    /// (e.g. container-engine state corruption). Partial node data may
    /// still be present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One node in a deploy payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployNode {
    pub name: String,
    pub device: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,
}

/// One same-host link in a deploy payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployLink {
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
}

/// The per-host deploy payload built by the topology service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployTopology {
    pub lab_id: String,
    pub nodes: Vec<DeployNode>,
    pub links: Vec<DeployLink>,
}

/// Same-host hot-connect request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotConnectRequest {
    pub lab_id: String,
    pub container_a: String,
    pub interface_a: String,
    pub container_b: String,
    pub interface_b: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotConnectResult {
    pub success: bool,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Attach a container veth to a pre-provisioned host interface
/// (external network link).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConnectRequest {
    pub lab_id: String,
    pub container_name: String,
    pub interface_name: String,
    /// The managed host interface to bridge onto, e.g. `eth99`.
    pub host_interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u16>,
}

/// One side of a cross-host VXLAN link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossHostLinkRequest {
    pub lab_id: String,
    pub link_id: String,
    pub container_name: String,
    pub interface_name: String,
    pub local_ip: String,
    pub remote_ip: String,
    pub vni: u32,
    pub vlan_tag: u16,
    pub mtu: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrossHostLinkResult {
    pub success: bool,
    #[serde(default)]
    pub vni: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One tunnel in a convergent overlay declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredTunnel {
    pub link_id: String,
    pub lab_id: String,
    pub vni: u32,
    pub local_ip: String,
    pub remote_ip: String,
    pub expected_vlan: u16,
    pub port_name: String,
    pub mtu: u32,
}

/// How the agent classified one declared tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclareTunnelOutcome {
    Created,
    /// Port existed with a drifted VLAN; repaired.
    Updated,
    Converged,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareResultEntry {
    pub link_id: String,
    pub status: DeclareTunnelOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeclareStateResult {
    #[serde(default)]
    pub results: Vec<DeclareResultEntry>,
    /// VXLAN ports belonging to declared labs that were not declared.
    #[serde(default)]
    pub orphans_removed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayCleanupResult {
    #[serde(default)]
    pub tunnels_deleted: usize,
    #[serde(default)]
    pub bridges_deleted: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub lab_id: String,
    pub age_seconds: f64,
    #[serde(default)]
    pub is_stuck: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockStatus {
    #[serde(default)]
    pub locks: Vec<LockEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseLockResult {
    /// "cleared" or "not_found"
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub reference: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedConfig {
    pub node_name: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractResult {
    pub success: bool,
    #[serde(default)]
    pub configs: Vec<ExtractedConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The agent operations the convergence core consumes.
///
/// One method per HTTP operation; implementations classify failures as
/// [`AgentError::Unavailable`] vs [`AgentError::Job`].
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn deploy_lab(
        &self,
        host: &Host,
        job_id: &str,
        topology: &DeployTopology,
        provider: Provider,
    ) -> Result<AgentJobOutcome, AgentError>;

    async fn destroy_lab(
        &self,
        host: &Host,
        job_id: &str,
        lab_id: &str,
    ) -> Result<AgentJobOutcome, AgentError>;

    async fn create_node(
        &self,
        host: &Host,
        lab_id: &str,
        node: &DeployNode,
    ) -> Result<AgentJobOutcome, AgentError>;

    async fn start_node(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
    ) -> Result<AgentJobOutcome, AgentError>;

    async fn stop_node(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
    ) -> Result<AgentJobOutcome, AgentError>;

    /// Free-form per-container action ("restart", "pause", ...) for
    /// operations without a dedicated endpoint.
    async fn container_action(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
        action: &str,
    ) -> Result<AgentJobOutcome, AgentError>;

    async fn get_lab_status(&self, host: &Host, lab_id: &str) -> Result<LabStatus, AgentError>;

    async fn check_node_readiness(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
    ) -> Result<bool, AgentError>;

    async fn extract_configs(&self, host: &Host, lab_id: &str)
        -> Result<ExtractResult, AgentError>;

    /// Same-host link hot-connect; the agent picks (or confirms) the
    /// VLAN tag and returns it.
    async fn connect_link(
        &self,
        host: &Host,
        request: &HotConnectRequest,
    ) -> Result<HotConnectResult, AgentError>;

    /// One side of a cross-host VXLAN link.
    async fn setup_cross_host_link(
        &self,
        host: &Host,
        request: &CrossHostLinkRequest,
    ) -> Result<CrossHostLinkResult, AgentError>;

    /// External network link: attach the container veth to a
    /// pre-provisioned host interface. Same-host only.
    async fn connect_external(
        &self,
        host: &Host,
        request: &ExternalConnectRequest,
    ) -> Result<HotConnectResult, AgentError>;

    /// Convergent overlay state declaration (see the overlay crate for
    /// the agent-side contract).
    async fn declare_overlay_state(
        &self,
        host: &Host,
        declared: &[DeclaredTunnel],
    ) -> Result<DeclareStateResult, AgentError>;

    async fn cleanup_overlay(
        &self,
        host: &Host,
        lab_id: &str,
    ) -> Result<OverlayCleanupResult, AgentError>;

    async fn get_lock_status(&self, host: &Host) -> Result<LockStatus, AgentError>;

    async fn release_lock(
        &self,
        host: &Host,
        lab_id: &str,
    ) -> Result<ReleaseLockResult, AgentError>;

    async fn list_images(&self, host: &Host) -> Result<Vec<ImageInfo>, AgentError>;

    /// Job ids of transfers the agent still considers active.
    async fn get_active_transfers(&self, host: &Host) -> Result<Vec<String>, AgentError>;
}
