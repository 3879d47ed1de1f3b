// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Disk-persisted VNI allocator.
//!
//! Keys are `"{lab_id}:{link_id}"`. Allocation walks the configured
//! range circularly; persistence is atomic (temp file + rename). On
//! startup the allocator adopts any in-range VNI found live on the
//! system but absent from the persisted map, under a placeholder key,
//! so it will not be re-issued.

use crate::command::CommandRunner;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VniError {
    #[error("no VNIs available in range {base}..={max}")]
    Exhausted { base: u32, max: u32 },
    #[error("failed to persist allocations: {0}")]
    Persist(#[from] std::io::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedAllocations {
    #[serde(default)]
    allocations: HashMap<String, u32>,
    #[serde(default)]
    next_vni: u32,
}

pub struct VniAllocator {
    base: u32,
    max: u32,
    allocated: HashMap<String, u32>,
    next_vni: u32,
    persistence_path: PathBuf,
}

impl VniAllocator {
    pub fn new(base: u32, max: u32, persistence_path: PathBuf) -> Self {
        let mut allocator = Self {
            base,
            max,
            allocated: HashMap::new(),
            next_vni: base,
            persistence_path,
        };
        allocator.load_from_disk();
        allocator
    }

    fn key(lab_id: &str, link_id: &str) -> String {
        format!("{lab_id}:{link_id}")
    }

    fn load_from_disk(&mut self) {
        let data = match std::fs::read(&self.persistence_path) {
            Ok(data) => data,
            Err(_) => return,
        };
        let persisted: PersistedAllocations = match serde_json::from_slice(&data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse persisted VNI allocations");
                return;
            }
        };

        // Drop out-of-range entries (range may have been reconfigured).
        let mut valid = HashMap::new();
        for (key, vni) in persisted.allocations {
            if (self.base..=self.max).contains(&vni) {
                valid.insert(key, vni);
            } else {
                tracing::warn!(key = %key, vni, "ignoring out-of-range VNI allocation");
            }
        }
        self.allocated = valid;
        self.next_vni = if (self.base..=self.max).contains(&persisted.next_vni) {
            persisted.next_vni
        } else {
            self.base
        };
        tracing::info!(count = self.allocated.len(), "loaded VNI allocations from disk");
    }

    fn save_to_disk(&self) -> Result<(), VniError> {
        let persisted = PersistedAllocations {
            allocations: self.allocated.clone(),
            next_vni: self.next_vni,
        };
        let json = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = self.persistence_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.persistence_path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.persistence_path)?;
        Ok(())
    }

    /// Allocate (or return the existing) VNI for a link.
    pub fn allocate(&mut self, lab_id: &str, link_id: &str) -> Result<u32, VniError> {
        let key = Self::key(lab_id, link_id);
        if let Some(vni) = self.allocated.get(&key) {
            return Ok(*vni);
        }

        let in_use: std::collections::HashSet<u32> = self.allocated.values().copied().collect();
        let span = self.max - self.base + 1;
        let mut candidate = self.next_vni;
        let mut attempts = 0u32;
        while in_use.contains(&candidate) {
            candidate += 1;
            if candidate > self.max {
                candidate = self.base;
            }
            attempts += 1;
            if attempts > span {
                return Err(VniError::Exhausted { base: self.base, max: self.max });
            }
        }

        self.allocated.insert(key, candidate);
        self.next_vni = if candidate >= self.max { self.base } else { candidate + 1 };
        self.save_to_disk()?;
        Ok(candidate)
    }

    pub fn release(&mut self, lab_id: &str, link_id: &str) {
        if self.allocated.remove(&Self::key(lab_id, link_id)).is_some() {
            if let Err(e) = self.save_to_disk() {
                tracing::warn!(error = %e, "failed to persist VNI release");
            }
        }
    }

    /// Release every allocation with the lab's key prefix. Returns the
    /// number released.
    pub fn release_lab(&mut self, lab_id: &str) -> usize {
        let prefix = format!("{lab_id}:");
        let before = self.allocated.len();
        self.allocated.retain(|key, _| !key.starts_with(&prefix));
        let released = before - self.allocated.len();
        if released > 0 {
            if let Err(e) = self.save_to_disk() {
                tracing::warn!(error = %e, "failed to persist lab VNI release");
            }
            tracing::info!(lab_id, released, "released lab VNI allocations");
        }
        released
    }

    pub fn get(&self, lab_id: &str, link_id: &str) -> Option<u32> {
        self.allocated.get(&Self::key(lab_id, link_id)).copied()
    }

    /// How many allocations carry the lab's key prefix.
    pub fn allocated_for_lab(&self, lab_id: &str) -> usize {
        let prefix = format!("{lab_id}:");
        self.allocated.keys().filter(|k| k.starts_with(&prefix)).count()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn allocated_vnis(&self) -> Vec<u32> {
        self.allocated.values().copied().collect()
    }

    /// Adopt VNIs found live on the system but absent from the
    /// persisted map, under `_recovered:` placeholder keys so they are
    /// never re-issued. `names` are `vxlan{vni}` port/interface names
    /// from [`scan_system_vxlan_names`]. Returns the number recovered.
    pub fn adopt_system_names(&mut self, names: &[String]) -> usize {
        let mut recovered = 0;
        let mut in_use: std::collections::HashSet<u32> =
            self.allocated.values().copied().collect();

        for name in names {
            if let Some(vni) = parse_vxlan_port_vni(name) {
                if (self.base..=self.max).contains(&vni) && !in_use.contains(&vni) {
                    self.allocated.insert(format!("_recovered:{name}"), vni);
                    in_use.insert(vni);
                    recovered += 1;
                    tracing::info!(vni, name = %name, "recovered in-use VNI");
                }
            }
        }

        if recovered > 0 {
            if let Err(e) = self.save_to_disk() {
                tracing::warn!(error = %e, "failed to persist recovered VNIs");
            }
            tracing::info!(recovered, "recovered VNIs from system state");
        }
        recovered
    }
}

/// Collect `vxlan*` names from the OVS bridge and from legacy kernel
/// VXLAN interfaces (crash recovery input for the allocator).
pub async fn scan_system_vxlan_names(
    runner: &dyn CommandRunner,
    bridge_name: &str,
) -> Vec<String> {
    let mut names = Vec::new();

    if let Ok(output) = runner.run("ovs-vsctl", &["list-ports", bridge_name]).await {
        if output.success() {
            names.extend(
                output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|p| p.starts_with("vxlan"))
                    .map(str::to_string),
            );
        }
    }

    if let Ok(output) = runner.run("ip", &["-j", "link", "show", "type", "vxlan"]).await {
        if output.success() && !output.stdout.trim().is_empty() {
            if let Ok(interfaces) = serde_json::from_str::<Vec<serde_json::Value>>(&output.stdout)
            {
                for iface in interfaces {
                    if let Some(name) = iface.get("ifname").and_then(|n| n.as_str()) {
                        if name.starts_with("vxlan") {
                            names.push(name.to_string());
                        }
                    }
                }
            }
        }
    }

    names
}

/// Extract the VNI from a `vxlan{vni}` interface/port name.
fn parse_vxlan_port_vni(name: &str) -> Option<u32> {
    name.strip_prefix("vxlan")?.parse().ok()
}

#[cfg(test)]
#[path = "vni_tests.rs"]
mod tests;
