// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted in-memory agent for tests.
//!
//! `FakeAgent` records every call, serves container statuses from a
//! scripted world, and mutates that world on deploy/start/stop/destroy
//! so convergence tests see the same feedback loop the real system has.
//! Failures can be injected per operation, one-shot or persistent, with
//! either error classification.

use super::{
    AgentApi, AgentError, AgentJobOutcome, ContainerStatus, CrossHostLinkRequest,
    CrossHostLinkResult, DeclareResultEntry, DeclareStateResult, DeclareTunnelOutcome,
    DeclaredTunnel, DeployNode, DeployTopology, ExternalConnectRequest, ExtractResult,
    ExtractedConfig, HotConnectRequest, HotConnectResult, ImageInfo, LabStatus, LockEntry,
    LockStatus, OverlayCleanupResult, ReleaseLockResult,
};
use async_trait::async_trait;
use lm_core::{Host, Provider};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// A recorded agent call, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    DeployLab { host: String, lab_id: String, nodes: Vec<String> },
    DestroyLab { host: String, lab_id: String },
    CreateNode { host: String, lab_id: String, node: String },
    StartNode { host: String, lab_id: String, node: String },
    StopNode { host: String, lab_id: String, node: String },
    ContainerAction { host: String, lab_id: String, node: String, action: String },
    GetLabStatus { host: String, lab_id: String },
    CheckReadiness { host: String, lab_id: String, node: String },
    ExtractConfigs { host: String, lab_id: String },
    ConnectLink { host: String, lab_id: String, endpoints: String },
    ConnectExternal { host: String, lab_id: String, container: String, host_interface: String },
    SetupCrossHostLink { host: String, lab_id: String, link_id: String, vni: u32 },
    DeclareOverlayState { host: String, declared: usize },
    CleanupOverlay { host: String, lab_id: String },
    GetLockStatus { host: String },
    ReleaseLock { host: String, lab_id: String },
    ListImages { host: String },
    GetActiveTransfers { host: String },
}

/// Injected failure with its classification.
#[derive(Debug, Clone)]
pub enum FakeFailure {
    Transient(String),
    Permanent(String),
}

impl FakeFailure {
    fn to_error(&self) -> AgentError {
        match self {
            Self::Transient(msg) => AgentError::unavailable(msg.clone()),
            Self::Permanent(msg) => AgentError::job(msg.clone()),
        }
    }
}

/// Scripted world state.
#[derive(Default)]
pub struct FakeAgentBehavior {
    /// (host_id, lab_id) → container statuses.
    containers: HashMap<(String, String), Vec<ContainerStatus>>,
    /// (host_id, lab_id, node) → boot readiness (default true).
    readiness: HashMap<(String, String, String), bool>,
    /// Persistent failures per operation name.
    persistent_failures: HashMap<String, FakeFailure>,
    /// One-shot failures per operation name, consumed in order.
    queued_failures: HashMap<String, Vec<FakeFailure>>,
    /// Hosts that fail every operation with a transient error.
    unreachable_hosts: HashSet<String>,
    /// host_id → lock entries.
    locks: HashMap<String, Vec<LockEntry>>,
    /// host_id → image references present.
    images: HashMap<String, Vec<String>>,
    /// Transfer job ids the agent reports active.
    active_transfers: Vec<String>,
    /// VLAN tag hot-connect hands back.
    hot_connect_vlan: u16,
    /// Configs served by extract_configs, per lab.
    configs: HashMap<String, Vec<ExtractedConfig>>,
}

#[derive(Default)]
pub struct FakeAgent {
    calls: Mutex<Vec<AgentCall>>,
    behavior: Mutex<FakeAgentBehavior>,
}

impl FakeAgent {
    pub fn new() -> Self {
        let agent = Self::default();
        agent.behavior.lock().hot_connect_vlan = 3001;
        agent
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Count calls of one operation kind by display name.
    pub fn call_count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| Self::op_name(c) == op)
            .count()
    }

    fn op_name(call: &AgentCall) -> &'static str {
        match call {
            AgentCall::DeployLab { .. } => "deploy_lab",
            AgentCall::DestroyLab { .. } => "destroy_lab",
            AgentCall::CreateNode { .. } => "create_node",
            AgentCall::StartNode { .. } => "start_node",
            AgentCall::StopNode { .. } => "stop_node",
            AgentCall::ContainerAction { .. } => "container_action",
            AgentCall::GetLabStatus { .. } => "get_lab_status",
            AgentCall::CheckReadiness { .. } => "check_node_readiness",
            AgentCall::ExtractConfigs { .. } => "extract_configs",
            AgentCall::ConnectLink { .. } => "connect_link",
            AgentCall::ConnectExternal { .. } => "connect_external",
            AgentCall::SetupCrossHostLink { .. } => "setup_cross_host_link",
            AgentCall::DeclareOverlayState { .. } => "declare_overlay_state",
            AgentCall::CleanupOverlay { .. } => "cleanup_overlay",
            AgentCall::GetLockStatus { .. } => "get_lock_status",
            AgentCall::ReleaseLock { .. } => "release_lock",
            AgentCall::ListImages { .. } => "list_images",
            AgentCall::GetActiveTransfers { .. } => "get_active_transfers",
        }
    }

    /// Script a container's status on a host.
    pub fn set_container(
        &self,
        host: &Host,
        lab_id: &str,
        name: &str,
        status: &str,
        ip_addresses: Vec<String>,
    ) {
        let mut behavior = self.behavior.lock();
        let key = (host.id.to_string(), lab_id.to_string());
        let containers = behavior.containers.entry(key).or_default();
        if let Some(existing) = containers.iter_mut().find(|c| c.name == name) {
            existing.status = status.to_string();
            existing.ip_addresses = ip_addresses;
        } else {
            containers.push(ContainerStatus {
                name: name.to_string(),
                status: status.to_string(),
                ip_addresses,
                ready: None,
            });
        }
    }

    pub fn remove_container(&self, host: &Host, lab_id: &str, name: &str) {
        let mut behavior = self.behavior.lock();
        if let Some(containers) = behavior
            .containers
            .get_mut(&(host.id.to_string(), lab_id.to_string()))
        {
            containers.retain(|c| c.name != name);
        }
    }

    pub fn set_readiness(&self, host: &Host, lab_id: &str, node: &str, ready: bool) {
        self.behavior.lock().readiness.insert(
            (host.id.to_string(), lab_id.to_string(), node.to_string()),
            ready,
        );
    }

    /// Fail the next call of `op` (operation names match `AgentApi`
    /// method names).
    pub fn fail_once(&self, op: &str, failure: FakeFailure) {
        self.behavior
            .lock()
            .queued_failures
            .entry(op.to_string())
            .or_default()
            .push(failure);
    }

    /// Fail every call of `op` until cleared.
    pub fn fail_always(&self, op: &str, failure: FakeFailure) {
        self.behavior
            .lock()
            .persistent_failures
            .insert(op.to_string(), failure);
    }

    pub fn clear_failures(&self) {
        let mut behavior = self.behavior.lock();
        behavior.persistent_failures.clear();
        behavior.queued_failures.clear();
        behavior.unreachable_hosts.clear();
    }

    /// Make every operation against this host transiently fail.
    pub fn set_unreachable(&self, host: &Host, unreachable: bool) {
        let mut behavior = self.behavior.lock();
        if unreachable {
            behavior.unreachable_hosts.insert(host.id.to_string());
        } else {
            behavior.unreachable_hosts.remove(host.id.as_str());
        }
    }

    pub fn set_locks(&self, host: &Host, locks: Vec<LockEntry>) {
        self.behavior.lock().locks.insert(host.id.to_string(), locks);
    }

    pub fn add_image(&self, host: &Host, reference: &str) {
        self.behavior
            .lock()
            .images
            .entry(host.id.to_string())
            .or_default()
            .push(reference.to_string());
    }

    pub fn set_active_transfers(&self, job_ids: Vec<String>) {
        self.behavior.lock().active_transfers = job_ids;
    }

    pub fn set_configs(&self, lab_id: &str, configs: Vec<ExtractedConfig>) {
        self.behavior.lock().configs.insert(lab_id.to_string(), configs);
    }

    fn check_failure(&self, op: &str, host: &Host) -> Result<(), AgentError> {
        let mut behavior = self.behavior.lock();
        if behavior.unreachable_hosts.contains(host.id.as_str()) {
            return Err(AgentError::unavailable(format!(
                "host {} unreachable",
                host.name
            )));
        }
        if let Some(queue) = behavior.queued_failures.get_mut(op) {
            if !queue.is_empty() {
                let failure = queue.remove(0);
                return Err(failure.to_error());
            }
        }
        if let Some(failure) = behavior.persistent_failures.get(op) {
            return Err(failure.to_error());
        }
        Ok(())
    }

    fn record(&self, call: AgentCall) {
        self.calls.lock().push(call);
    }

    fn completed() -> AgentJobOutcome {
        AgentJobOutcome {
            status: "completed".to_string(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn deploy_lab(
        &self,
        host: &Host,
        _job_id: &str,
        topology: &DeployTopology,
        _provider: Provider,
    ) -> Result<AgentJobOutcome, AgentError> {
        self.record(AgentCall::DeployLab {
            host: host.id.to_string(),
            lab_id: topology.lab_id.clone(),
            nodes: topology.nodes.iter().map(|n| n.name.clone()).collect(),
        });
        self.check_failure("deploy_lab", host)?;
        // Deploy materializes running containers in the scripted world.
        for node in &topology.nodes {
            self.set_container(
                host,
                &topology.lab_id,
                &node.name,
                "running",
                vec![format!("172.20.0.{}", 10 + (node.name.len() % 200))],
            );
        }
        Ok(Self::completed())
    }

    async fn destroy_lab(
        &self,
        host: &Host,
        _job_id: &str,
        lab_id: &str,
    ) -> Result<AgentJobOutcome, AgentError> {
        self.record(AgentCall::DestroyLab {
            host: host.id.to_string(),
            lab_id: lab_id.to_string(),
        });
        self.check_failure("destroy_lab", host)?;
        self.behavior
            .lock()
            .containers
            .remove(&(host.id.to_string(), lab_id.to_string()));
        Ok(Self::completed())
    }

    async fn create_node(
        &self,
        host: &Host,
        lab_id: &str,
        node: &DeployNode,
    ) -> Result<AgentJobOutcome, AgentError> {
        self.record(AgentCall::CreateNode {
            host: host.id.to_string(),
            lab_id: lab_id.to_string(),
            node: node.name.clone(),
        });
        self.check_failure("create_node", host)?;
        self.set_container(host, lab_id, &node.name, "stopped", vec![]);
        Ok(Self::completed())
    }

    async fn start_node(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
    ) -> Result<AgentJobOutcome, AgentError> {
        self.record(AgentCall::StartNode {
            host: host.id.to_string(),
            lab_id: lab_id.to_string(),
            node: node_name.to_string(),
        });
        self.check_failure("start_node", host)?;
        self.set_container(host, lab_id, node_name, "running", vec![]);
        Ok(Self::completed())
    }

    async fn stop_node(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
    ) -> Result<AgentJobOutcome, AgentError> {
        self.record(AgentCall::StopNode {
            host: host.id.to_string(),
            lab_id: lab_id.to_string(),
            node: node_name.to_string(),
        });
        self.check_failure("stop_node", host)?;
        self.set_container(host, lab_id, node_name, "stopped", vec![]);
        Ok(Self::completed())
    }

    async fn container_action(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
        action: &str,
    ) -> Result<AgentJobOutcome, AgentError> {
        self.record(AgentCall::ContainerAction {
            host: host.id.to_string(),
            lab_id: lab_id.to_string(),
            node: node_name.to_string(),
            action: action.to_string(),
        });
        self.check_failure("container_action", host)?;
        match action {
            "stop" | "pause" => self.set_container(host, lab_id, node_name, "stopped", vec![]),
            "start" | "restart" => self.set_container(host, lab_id, node_name, "running", vec![]),
            _ => {}
        }
        Ok(Self::completed())
    }

    async fn get_lab_status(&self, host: &Host, lab_id: &str) -> Result<LabStatus, AgentError> {
        self.record(AgentCall::GetLabStatus {
            host: host.id.to_string(),
            lab_id: lab_id.to_string(),
        });
        self.check_failure("get_lab_status", host)?;
        let behavior = self.behavior.lock();
        let nodes = behavior
            .containers
            .get(&(host.id.to_string(), lab_id.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(LabStatus { nodes, error: None })
    }

    async fn check_node_readiness(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
    ) -> Result<bool, AgentError> {
        self.record(AgentCall::CheckReadiness {
            host: host.id.to_string(),
            lab_id: lab_id.to_string(),
            node: node_name.to_string(),
        });
        self.check_failure("check_node_readiness", host)?;
        let behavior = self.behavior.lock();
        Ok(*behavior
            .readiness
            .get(&(host.id.to_string(), lab_id.to_string(), node_name.to_string()))
            .unwrap_or(&true))
    }

    async fn extract_configs(
        &self,
        host: &Host,
        lab_id: &str,
    ) -> Result<ExtractResult, AgentError> {
        self.record(AgentCall::ExtractConfigs {
            host: host.id.to_string(),
            lab_id: lab_id.to_string(),
        });
        self.check_failure("extract_configs", host)?;
        let behavior = self.behavior.lock();
        Ok(ExtractResult {
            success: true,
            configs: behavior.configs.get(lab_id).cloned().unwrap_or_default(),
            error: None,
        })
    }

    async fn connect_link(
        &self,
        host: &Host,
        request: &HotConnectRequest,
    ) -> Result<HotConnectResult, AgentError> {
        self.record(AgentCall::ConnectLink {
            host: host.id.to_string(),
            lab_id: request.lab_id.clone(),
            endpoints: format!(
                "{}:{}-{}:{}",
                request.container_a, request.interface_a, request.container_b,
                request.interface_b
            ),
        });
        self.check_failure("connect_link", host)?;
        let vlan = request.vlan_tag.unwrap_or(self.behavior.lock().hot_connect_vlan);
        Ok(HotConnectResult { success: true, vlan_tag: Some(vlan), error: None })
    }

    async fn connect_external(
        &self,
        host: &Host,
        request: &ExternalConnectRequest,
    ) -> Result<HotConnectResult, AgentError> {
        self.record(AgentCall::ConnectExternal {
            host: host.id.to_string(),
            lab_id: request.lab_id.clone(),
            container: request.container_name.clone(),
            host_interface: request.host_interface.clone(),
        });
        self.check_failure("connect_external", host)?;
        let vlan = request.vlan_tag.unwrap_or(self.behavior.lock().hot_connect_vlan);
        Ok(HotConnectResult { success: true, vlan_tag: Some(vlan), error: None })
    }

    async fn setup_cross_host_link(
        &self,
        host: &Host,
        request: &CrossHostLinkRequest,
    ) -> Result<CrossHostLinkResult, AgentError> {
        self.record(AgentCall::SetupCrossHostLink {
            host: host.id.to_string(),
            lab_id: request.lab_id.clone(),
            link_id: request.link_id.clone(),
            vni: request.vni,
        });
        self.check_failure("setup_cross_host_link", host)?;
        Ok(CrossHostLinkResult { success: true, vni: Some(request.vni), error: None })
    }

    async fn declare_overlay_state(
        &self,
        host: &Host,
        declared: &[DeclaredTunnel],
    ) -> Result<DeclareStateResult, AgentError> {
        self.record(AgentCall::DeclareOverlayState {
            host: host.id.to_string(),
            declared: declared.len(),
        });
        self.check_failure("declare_overlay_state", host)?;
        Ok(DeclareStateResult {
            results: declared
                .iter()
                .map(|t| DeclareResultEntry {
                    link_id: t.link_id.clone(),
                    status: DeclareTunnelOutcome::Converged,
                    error: None,
                })
                .collect(),
            orphans_removed: Vec::new(),
        })
    }

    async fn cleanup_overlay(
        &self,
        host: &Host,
        lab_id: &str,
    ) -> Result<OverlayCleanupResult, AgentError> {
        self.record(AgentCall::CleanupOverlay {
            host: host.id.to_string(),
            lab_id: lab_id.to_string(),
        });
        self.check_failure("cleanup_overlay", host)?;
        Ok(OverlayCleanupResult::default())
    }

    async fn get_lock_status(&self, host: &Host) -> Result<LockStatus, AgentError> {
        self.record(AgentCall::GetLockStatus { host: host.id.to_string() });
        self.check_failure("get_lock_status", host)?;
        let behavior = self.behavior.lock();
        Ok(LockStatus {
            locks: behavior.locks.get(host.id.as_str()).cloned().unwrap_or_default(),
            error: None,
        })
    }

    async fn release_lock(
        &self,
        host: &Host,
        lab_id: &str,
    ) -> Result<ReleaseLockResult, AgentError> {
        self.record(AgentCall::ReleaseLock {
            host: host.id.to_string(),
            lab_id: lab_id.to_string(),
        });
        self.check_failure("release_lock", host)?;
        let mut behavior = self.behavior.lock();
        let had_lock = behavior
            .locks
            .get(host.id.as_str())
            .map(|locks| locks.iter().any(|l| l.lab_id == lab_id))
            .unwrap_or(false);
        if let Some(locks) = behavior.locks.get_mut(host.id.as_str()) {
            locks.retain(|l| l.lab_id != lab_id);
        }
        Ok(ReleaseLockResult {
            status: if had_lock { "cleared" } else { "not_found" }.to_string(),
        })
    }

    async fn list_images(&self, host: &Host) -> Result<Vec<ImageInfo>, AgentError> {
        self.record(AgentCall::ListImages { host: host.id.to_string() });
        self.check_failure("list_images", host)?;
        let behavior = self.behavior.lock();
        Ok(behavior
            .images
            .get(host.id.as_str())
            .map(|refs| {
                refs.iter()
                    .map(|r| ImageInfo { reference: r.clone(), size_bytes: None })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_active_transfers(&self, host: &Host) -> Result<Vec<String>, AgentError> {
        self.record(AgentCall::GetActiveTransfers { host: host.id.to_string() });
        self.check_failure("get_active_transfers", host)?;
        Ok(self.behavior.lock().active_transfers.clone())
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
