// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OVS overlay manager.
//!
//! One shared OVS bridge per host, fail-mode `standalone` so unknown
//! MACs are flooded like a normal switch. Cross-host links become VXLAN
//! ports tagged with a VLAN for isolation inside the shared bridge;
//! container endpoints are veth pairs whose host end joins the bridge
//! with the link's tag. `declare_state` converges local ports against
//! the controller's declared set and checkpoints it to
//! `declared_overlay_state.json` for API-less recovery.

use crate::command::{CommandOutput, CommandRunner};
use crate::vni::{VniAllocator, VniError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;

/// VLAN tag range for overlay isolation within the shared bridge.
pub const OVERLAY_VLAN_BASE: u16 = 3000;
pub const OVERLAY_VLAN_MAX: u16 = 4000;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("OVS not available: {0}")]
    OvsUnavailable(String),
    #[error("OVS command failed: {0}")]
    Ovs(String),
    #[error("container {0} is not running")]
    ContainerNotRunning(String),
    #[error("failed to spawn command {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Vni(#[from] VniError),
}

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub bridge_name: String,
    pub vni_base: u32,
    pub vni_max: u32,
    pub mtu: u32,
    /// Agent workspace: VNI allocations and the declared-state
    /// checkpoint live here.
    pub workspace: PathBuf,
}

/// One cross-host tunnel tracked in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkTunnel {
    pub link_id: String,
    pub lab_id: String,
    pub vni: u32,
    pub vlan_tag: u16,
    pub local_ip: String,
    pub remote_ip: String,
    pub port_name: String,
    pub mtu: u32,
}

/// One tunnel in a convergent declaration from the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredTunnelSpec {
    pub link_id: String,
    pub lab_id: String,
    pub vni: u32,
    pub local_ip: String,
    pub remote_ip: String,
    pub expected_vlan: u16,
    pub port_name: String,
    #[serde(default)]
    pub mtu: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclareOutcome {
    Created,
    Updated,
    Converged,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareEntry {
    pub link_id: String,
    pub status: DeclareOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeclareResult {
    pub results: Vec<DeclareEntry>,
    pub orphans_removed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayCleanup {
    pub tunnels_deleted: usize,
    pub bridges_deleted: usize,
    pub vnis_released: usize,
    pub errors: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct DeclaredStateCache {
    declared_at: chrono::DateTime<chrono::Utc>,
    tunnels: Vec<DeclaredTunnelSpec>,
}

pub struct OverlayManager<R: CommandRunner> {
    runner: R,
    config: OverlayConfig,
    allocator: Mutex<VniAllocator>,
    /// link_id → tunnel.
    tunnels: Mutex<HashMap<String, LinkTunnel>>,
    bridge_ready: Mutex<bool>,
}

impl<R: CommandRunner> OverlayManager<R> {
    pub fn new(runner: R, config: OverlayConfig) -> Self {
        let allocator = VniAllocator::new(
            config.vni_base,
            config.vni_max,
            config.workspace.join("vni_allocations.json"),
        );
        Self {
            runner,
            config,
            allocator: Mutex::new(allocator),
            tunnels: Mutex::new(HashMap::new()),
            bridge_ready: Mutex::new(false),
        }
    }

    /// Deterministic VLAN tag for a VNI. Collisions within a host are
    /// tolerated: isolation is by VNI on the wire and by port naming in
    /// OVS.
    pub fn vni_to_vlan(vni: u32) -> u16 {
        let span = (OVERLAY_VLAN_MAX - OVERLAY_VLAN_BASE) as u32;
        OVERLAY_VLAN_BASE + (vni % span) as u16
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, OverlayError> {
        self.runner.run(program, args).await.map_err(|source| OverlayError::Spawn {
            program: program.to_string(),
            source,
        })
    }

    async fn ovs_vsctl(&self, args: &[&str]) -> Result<CommandOutput, OverlayError> {
        self.run("ovs-vsctl", args).await
    }

    /// Ensure the shared bridge exists, is in standalone fail-mode, and
    /// is up. Idempotent; runs once per manager unless it fails.
    pub async fn ensure_bridge(&self) -> Result<(), OverlayError> {
        if *self.bridge_ready.lock() {
            return Ok(());
        }

        let version = self.ovs_vsctl(&["--version"]).await?;
        if !version.success() {
            return Err(OverlayError::OvsUnavailable(version.stderr));
        }

        let bridge = self.config.bridge_name.clone();
        let exists = self.ovs_vsctl(&["br-exists", &bridge]).await?;
        if !exists.success() {
            tracing::info!(bridge = %bridge, "creating OVS bridge for overlay");
            let created = self.ovs_vsctl(&["add-br", &bridge]).await?;
            if !created.success() {
                return Err(OverlayError::Ovs(created.stderr));
            }
        }

        // Secure fail-mode drops all traffic without flows; standalone
        // gives normal L2 switching.
        let mode = self.ovs_vsctl(&["get", "bridge", &bridge, "fail_mode"]).await?;
        if mode.stdout.trim().trim_matches('"') != "standalone" {
            tracing::info!(bridge = %bridge, "setting bridge to standalone fail-mode");
            self.ovs_vsctl(&["set-fail-mode", &bridge, "standalone"]).await?;
        }

        self.run("ip", &["link", "set", &bridge, "up"]).await?;

        *self.bridge_ready.lock() = true;
        tracing::info!(bridge = %bridge, "OVS bridge ready for overlay");
        Ok(())
    }

    async fn port_exists(&self, port: &str) -> Result<bool, OverlayError> {
        let output = self.ovs_vsctl(&["list-ports", &self.config.bridge_name]).await?;
        if !output.success() {
            return Ok(false);
        }
        Ok(output.stdout.lines().any(|p| p.trim() == port))
    }

    async fn ip_link_exists(&self, name: &str) -> Result<bool, OverlayError> {
        Ok(self.run("ip", &["link", "show", name]).await?.success())
    }

    /// Create (or return the existing) VXLAN tunnel for a link.
    pub async fn create_tunnel(
        &self,
        lab_id: &str,
        link_id: &str,
        local_ip: &str,
        remote_ip: &str,
        vni: Option<u32>,
    ) -> Result<LinkTunnel, OverlayError> {
        self.ensure_bridge().await?;

        let existing = self.tunnels.lock().get(link_id).cloned();
        if let Some(tunnel) = existing {
            tracing::info!(link_id, "tunnel already exists");
            return Ok(tunnel);
        }

        let vni = match vni {
            Some(v) => v,
            None => self.allocator.lock().allocate(lab_id, link_id)?,
        };
        let port_name = format!("vxlan{vni}");
        let vlan_tag = Self::vni_to_vlan(vni);

        // Stale state from a previous run gets replaced, not reused.
        if self.port_exists(&port_name).await? {
            tracing::warn!(port = %port_name, "VXLAN port already exists, deleting");
            self.ovs_vsctl(&["--if-exists", "del-port", &self.config.bridge_name, &port_name])
                .await?;
        }
        if self.ip_link_exists(&port_name).await? {
            tracing::warn!(interface = %port_name, "kernel VXLAN interface exists, deleting");
            self.run("ip", &["link", "delete", &port_name]).await?;
        }

        self.add_vxlan_port(&port_name, vlan_tag, local_ip, remote_ip, vni).await?;

        let tunnel = LinkTunnel {
            link_id: link_id.to_string(),
            lab_id: lab_id.to_string(),
            vni,
            vlan_tag,
            local_ip: local_ip.to_string(),
            remote_ip: remote_ip.to_string(),
            port_name: port_name.clone(),
            mtu: self.config.mtu,
        };
        self.tunnels.lock().insert(link_id.to_string(), tunnel.clone());
        tracing::info!(
            port = %port_name,
            vni,
            vlan_tag,
            remote_ip,
            "created OVS VXLAN tunnel"
        );
        Ok(tunnel)
    }

    async fn add_vxlan_port(
        &self,
        port_name: &str,
        vlan_tag: u16,
        local_ip: &str,
        remote_ip: &str,
        vni: u32,
    ) -> Result<(), OverlayError> {
        let bridge = self.config.bridge_name.clone();
        let tag = format!("tag={vlan_tag}");
        let remote = format!("options:remote_ip={remote_ip}");
        let local = format!("options:local_ip={local_ip}");
        let key = format!("options:key={vni}");
        let output = self
            .ovs_vsctl(&[
                "--", "add-port", &bridge, port_name, &tag,
                "--", "set", "interface", port_name, "type=vxlan", &remote, &local, &key,
            ])
            .await?;
        if !output.success() {
            return Err(OverlayError::Ovs(output.stderr));
        }
        Ok(())
    }

    /// Delete a tunnel's port and release its VNI.
    pub async fn delete_tunnel(&self, link_id: &str) -> bool {
        let tunnel = match self.tunnels.lock().remove(link_id) {
            Some(t) => t,
            None => return false,
        };
        let bridge = self.config.bridge_name.clone();
        if let Ok(output) = self
            .run("ovs-vsctl", &["--if-exists", "del-port", &bridge, &tunnel.port_name])
            .await
        {
            if !output.success() {
                tracing::warn!(port = %tunnel.port_name, stderr = %output.stderr, "failed to delete VXLAN port");
            }
        }
        self.allocator.lock().release(&tunnel.lab_id, &tunnel.link_id);
        tracing::info!(port = %tunnel.port_name, "deleted VXLAN tunnel");
        true
    }

    /// Attach a container interface to the bridge with a VLAN tag.
    ///
    /// Creates a veth pair, moves one end into the container namespace
    /// under the authored interface name, and adds the host end to the
    /// bridge tagged with the link's VLAN.
    pub async fn attach_container(
        &self,
        container_name: &str,
        interface_name: &str,
        vlan_tag: u16,
        vni: u32,
    ) -> Result<(), OverlayError> {
        self.ensure_bridge().await?;

        let pid_output = self
            .run("docker", &["inspect", "--format", "{{.State.Pid}}", container_name])
            .await?;
        let pid = pid_output.stdout.trim().to_string();
        if !pid_output.success() || pid.is_empty() || pid == "0" {
            return Err(OverlayError::ContainerNotRunning(container_name.to_string()));
        }

        // Names are derived from the endpoint so re-attach is idempotent;
        // 15-char kernel limit.
        let suffix = endpoint_suffix(container_name, interface_name);
        let veth_host = truncate(&format!("v{}{}h", vni % 10_000, suffix), 15);
        let veth_cont = truncate(&format!("v{}{}c", vni % 10_000, suffix), 15);
        let bridge = self.config.bridge_name.clone();

        // Replace any leftover pair from a previous attach.
        self.ovs_vsctl(&["--if-exists", "del-port", &bridge, &veth_host]).await?;
        self.run("ip", &["link", "delete", &veth_host]).await?;

        let created = self
            .run("ip", &["link", "add", &veth_host, "type", "veth", "peer", "name", &veth_cont])
            .await?;
        if !created.success() {
            return Err(OverlayError::Ovs(created.stderr));
        }

        if self.config.mtu > 0 {
            let mtu = self.config.mtu.to_string();
            self.run("ip", &["link", "set", &veth_host, "mtu", &mtu]).await?;
            self.run("ip", &["link", "set", &veth_cont, "mtu", &mtu]).await?;
        }

        let tag = format!("tag={vlan_tag}");
        let added = self.ovs_vsctl(&["add-port", &bridge, &veth_host, &tag]).await?;
        if !added.success() {
            self.run("ip", &["link", "delete", &veth_host]).await?;
            return Err(OverlayError::Ovs(added.stderr));
        }
        self.run("ip", &["link", "set", &veth_host, "up"]).await?;

        let moved = self.run("ip", &["link", "set", &veth_cont, "netns", &pid]).await?;
        if !moved.success() {
            self.ovs_vsctl(&["--if-exists", "del-port", &bridge, &veth_host]).await?;
            self.run("ip", &["link", "delete", &veth_host]).await?;
            return Err(OverlayError::Ovs(moved.stderr));
        }

        // Clear any pre-existing interface with the target name, then
        // rename and bring up inside the namespace.
        self.run("nsenter", &["-t", &pid, "-n", "ip", "link", "delete", interface_name])
            .await?;
        self.run(
            "nsenter",
            &["-t", &pid, "-n", "ip", "link", "set", &veth_cont, "name", interface_name],
        )
        .await?;
        self.run("nsenter", &["-t", &pid, "-n", "ip", "link", "set", interface_name, "up"])
            .await?;

        tracing::info!(
            container = container_name,
            interface = interface_name,
            vlan_tag,
            "attached container to overlay bridge"
        );
        Ok(())
    }

    /// Read the bridge's VXLAN ports with their VLAN tags.
    async fn read_vxlan_ports(&self) -> Result<HashMap<String, Option<u16>>, OverlayError> {
        let output = self.ovs_vsctl(&["list-ports", &self.config.bridge_name]).await?;
        if !output.success() {
            return Ok(HashMap::new());
        }
        let mut ports = HashMap::new();
        for port in output.stdout.lines().map(str::trim) {
            if !port.starts_with("vxlan") {
                continue;
            }
            let tag_output = self.ovs_vsctl(&["get", "port", port, "tag"]).await?;
            let tag = tag_output.stdout.trim().parse::<u16>().ok();
            ports.insert(port.to_string(), tag);
        }
        Ok(ports)
    }

    /// Converge local VXLAN ports against the controller's declared set.
    ///
    /// Each declared tunnel is classified `created` (port missing),
    /// `updated` (VLAN drift repaired), or `converged`. Ports belonging
    /// to declared labs but not declared are removed as orphans; ports
    /// tracked for foreign labs are preserved. The declared set is
    /// checkpointed to disk afterwards.
    pub async fn declare_state(
        &self,
        declared: &[DeclaredTunnelSpec],
    ) -> Result<DeclareResult, OverlayError> {
        self.ensure_bridge().await?;

        let existing = self.read_vxlan_ports().await?;
        let declared_labs: HashSet<&str> = declared.iter().map(|t| t.lab_id.as_str()).collect();
        let declared_ports: HashSet<&str> = declared.iter().map(|t| t.port_name.as_str()).collect();

        let mut result = DeclareResult::default();

        for spec in declared {
            let entry = match existing.get(&spec.port_name) {
                None => match self
                    .add_vxlan_port(
                        &spec.port_name,
                        spec.expected_vlan,
                        &spec.local_ip,
                        &spec.remote_ip,
                        spec.vni,
                    )
                    .await
                {
                    Ok(()) => DeclareEntry {
                        link_id: spec.link_id.clone(),
                        status: DeclareOutcome::Created,
                        error: None,
                    },
                    Err(e) => DeclareEntry {
                        link_id: spec.link_id.clone(),
                        status: DeclareOutcome::Error,
                        error: Some(e.to_string()),
                    },
                },
                Some(tag) if *tag != Some(spec.expected_vlan) => {
                    let set_tag = format!("tag={}", spec.expected_vlan);
                    let output = self
                        .ovs_vsctl(&["set", "port", &spec.port_name, &set_tag])
                        .await?;
                    if output.success() {
                        tracing::info!(
                            port = %spec.port_name,
                            expected = spec.expected_vlan,
                            observed = ?tag,
                            "repaired drifted VLAN tag"
                        );
                        DeclareEntry {
                            link_id: spec.link_id.clone(),
                            status: DeclareOutcome::Updated,
                            error: None,
                        }
                    } else {
                        DeclareEntry {
                            link_id: spec.link_id.clone(),
                            status: DeclareOutcome::Error,
                            error: Some(output.stderr),
                        }
                    }
                }
                Some(_) => DeclareEntry {
                    link_id: spec.link_id.clone(),
                    status: DeclareOutcome::Converged,
                    error: None,
                },
            };

            if entry.status != DeclareOutcome::Error {
                self.tunnels.lock().insert(
                    spec.link_id.clone(),
                    LinkTunnel {
                        link_id: spec.link_id.clone(),
                        lab_id: spec.lab_id.clone(),
                        vni: spec.vni,
                        vlan_tag: spec.expected_vlan,
                        local_ip: spec.local_ip.clone(),
                        remote_ip: spec.remote_ip.clone(),
                        port_name: spec.port_name.clone(),
                        mtu: if spec.mtu > 0 { spec.mtu } else { self.config.mtu },
                    },
                );
            }
            result.results.push(entry);
        }

        // Orphans: undeclared VXLAN ports that are either untracked or
        // tracked for one of the declared labs. Foreign labs' ports
        // must survive.
        if !declared_labs.is_empty() {
            let tracked_labs: HashMap<String, String> = self
                .tunnels
                .lock()
                .values()
                .map(|t| (t.port_name.clone(), t.lab_id.clone()))
                .collect();

            for port in existing.keys() {
                if declared_ports.contains(port.as_str()) {
                    continue;
                }
                let owner = tracked_labs.get(port);
                let removable = match owner {
                    Some(lab) => declared_labs.contains(lab.as_str()),
                    None => true,
                };
                if !removable {
                    continue;
                }
                let bridge = self.config.bridge_name.clone();
                let output = self
                    .ovs_vsctl(&["--if-exists", "del-port", &bridge, port])
                    .await?;
                if output.success() {
                    tracing::info!(port = %port, "removed orphan VXLAN port");
                    result.orphans_removed.push(port.clone());
                    let mut tunnels = self.tunnels.lock();
                    tunnels.retain(|_, t| t.port_name != *port);
                }
            }
        }

        if let Err(e) = self.write_declared_state_cache(declared) {
            tracing::warn!(error = %e, "failed to write declared-state checkpoint");
        }

        Ok(result)
    }

    fn cache_path(&self) -> PathBuf {
        self.config.workspace.join("declared_overlay_state.json")
    }

    fn write_declared_state_cache(&self, declared: &[DeclaredTunnelSpec]) -> std::io::Result<()> {
        let cache = DeclaredStateCache {
            declared_at: chrono::Utc::now(),
            tunnels: declared.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&cache)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::create_dir_all(&self.config.workspace)?;
        let tmp = self.cache_path().with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, self.cache_path())
    }

    /// Load the checkpointed declaration for recovery after a restart.
    pub fn load_declared_state_cache(&self) -> Option<Vec<DeclaredTunnelSpec>> {
        let data = std::fs::read(self.cache_path()).ok()?;
        let cache: DeclaredStateCache = serde_json::from_slice(&data).ok()?;
        Some(cache.tunnels)
    }

    /// Remove all overlay state for a lab: VXLAN ports, veths, VNIs.
    pub async fn cleanup_lab(&self, lab_id: &str) -> OverlayCleanup {
        let mut cleanup = OverlayCleanup::default();
        let allocated_before = self.allocator.lock().allocated_for_lab(lab_id);

        let to_delete: Vec<LinkTunnel> = self
            .tunnels
            .lock()
            .values()
            .filter(|t| t.lab_id == lab_id)
            .cloned()
            .collect();

        for tunnel in to_delete {
            if self.delete_tunnel(&tunnel.link_id).await {
                cleanup.tunnels_deleted += 1;
            } else {
                cleanup.errors.push(format!("tunnel {}: already gone", tunnel.port_name));
            }
        }

        // delete_tunnel released per-link VNIs; this sweeps any leftover
        // allocations under the lab's key prefix.
        self.allocator.lock().release_lab(lab_id);
        cleanup.vnis_released = allocated_before;
        tracing::info!(
            lab_id,
            tunnels_deleted = cleanup.tunnels_deleted,
            vnis_released = cleanup.vnis_released,
            "lab overlay cleanup complete"
        );
        cleanup
    }

    /// Adopt VNIs found live on the system (crash recovery).
    pub async fn recover_allocations(&self) -> usize {
        let names =
            crate::vni::scan_system_vxlan_names(&self.runner, &self.config.bridge_name).await;
        self.allocator.lock().adopt_system_names(&names)
    }

    /// The underlying command runner (tests script it).
    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn tunnels_for_lab(&self, lab_id: &str) -> Vec<LinkTunnel> {
        self.tunnels
            .lock()
            .values()
            .filter(|t| t.lab_id == lab_id)
            .cloned()
            .collect()
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Short stable suffix for veth names, derived from the endpoint so
/// repeated attaches reuse the same pair.
fn endpoint_suffix(container: &str, interface: &str) -> String {
    let mut hash: u32 = 2166136261;
    for byte in container.bytes().chain(interface.bytes()) {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    format!("{:04x}", hash & 0xffff)
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
