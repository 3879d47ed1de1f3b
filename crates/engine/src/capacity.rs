// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pre-deploy resource capacity gate.
//!
//! Sums per-device requirements for the candidate set on a host and
//! projects utilization against the most recent heartbeat snapshot.
//! Above the error threshold the deploy is refused; above the warning
//! threshold it proceeds with logged warnings.

use lm_core::{requirements_for_node, Host, Node, Settings};

/// Projected utilization for one host.
#[derive(Debug, Clone)]
pub struct HostCapacity {
    pub host_name: String,
    pub fits: bool,
    pub required_memory_mb: u64,
    pub projected_memory_percent: f64,
    pub required_cpu_cores: f64,
    pub projected_cpu_percent: f64,
    pub warnings: Vec<String>,
    /// Set when `fits` is false.
    pub error: Option<String>,
}

/// Capacity verdicts for a deploy's host set.
#[derive(Debug, Clone, Default)]
pub struct CapacityReport {
    pub hosts: Vec<HostCapacity>,
}

impl CapacityReport {
    pub fn all_fit(&self) -> bool {
        self.hosts.iter().all(|h| h.fits)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.hosts.iter().flat_map(|h| h.warnings.clone()).collect()
    }

    /// Formatted refusal message naming each over-capacity host.
    pub fn error_message(&self) -> String {
        let mut parts = vec!["Insufficient resources for deployment.".to_string()];
        for host in self.hosts.iter().filter(|h| !h.fits) {
            if let Some(error) = &host.error {
                parts.push(format!("  {}: {}", host.host_name, error));
            }
        }
        parts.join("\n")
    }
}

/// Check one host against the nodes targeted at it.
pub fn check_host_capacity(host: &Host, nodes: &[Node], settings: &Settings) -> HostCapacity {
    let mut required_memory_mb = 0u64;
    let mut required_cpu_cores = 0f64;
    for node in nodes {
        let req = requirements_for_node(node);
        required_memory_mb += req.memory_mb;
        required_cpu_cores += req.cpu_cores;
    }

    let snapshot = &host.resources;
    let mut warnings = Vec::new();
    let mut error = None;
    let mut fits = true;

    // Memory: used + required + buffer against total.
    let projected_memory_percent = if snapshot.memory_total_mb > 0 {
        let projected = snapshot.memory_used_mb
            + required_memory_mb
            + settings.resource_memory_buffer_mb;
        (projected as f64 / snapshot.memory_total_mb as f64) * 100.0
    } else {
        0.0
    };
    if snapshot.memory_total_mb > 0 {
        if projected_memory_percent >= settings.resource_error_percent {
            fits = false;
            error = Some(format!(
                "memory: need {required_memory_mb} MB, projected {projected_memory_percent:.0}% of {} MB",
                snapshot.memory_total_mb
            ));
        } else if projected_memory_percent >= settings.resource_warning_percent {
            warnings.push(format!(
                "{}: projected memory {projected_memory_percent:.0}% (≥ {:.0}% warning threshold)",
                host.name, settings.resource_warning_percent
            ));
        }
    }

    // CPU: current load plus required cores (plus buffer) against count.
    let projected_cpu_percent = if snapshot.cpu_count > 0 {
        let current_cores = snapshot.cpu_percent / 100.0 * snapshot.cpu_count as f64;
        let projected =
            current_cores + required_cpu_cores + settings.resource_cpu_buffer_cores;
        (projected / snapshot.cpu_count as f64) * 100.0
    } else {
        0.0
    };
    if snapshot.cpu_count > 0 && fits {
        if projected_cpu_percent >= settings.resource_error_percent {
            fits = false;
            error = Some(format!(
                "cpu: need {required_cpu_cores:.1} cores, projected {projected_cpu_percent:.0}% of {} cores",
                snapshot.cpu_count
            ));
        } else if projected_cpu_percent >= settings.resource_warning_percent {
            warnings.push(format!(
                "{}: projected cpu {projected_cpu_percent:.0}% (≥ {:.0}% warning threshold)",
                host.name, settings.resource_warning_percent
            ));
        }
    }

    // Disk: coarse guard against filling the host.
    if snapshot.disk_total_gb > 0 {
        let projected_disk = snapshot.disk_used_gb + settings.resource_disk_buffer_gb;
        let disk_percent = (projected_disk as f64 / snapshot.disk_total_gb as f64) * 100.0;
        if disk_percent >= settings.resource_error_percent && fits {
            fits = false;
            error = Some(format!(
                "disk: {disk_percent:.0}% projected of {} GB",
                snapshot.disk_total_gb
            ));
        } else if disk_percent >= settings.resource_warning_percent {
            warnings.push(format!(
                "{}: projected disk {disk_percent:.0}% (≥ {:.0}% warning threshold)",
                host.name, settings.resource_warning_percent
            ));
        }
    }

    HostCapacity {
        host_name: host.name.clone(),
        fits,
        required_memory_mb,
        projected_memory_percent,
        required_cpu_cores,
        projected_cpu_percent,
        warnings,
        error,
    }
}

#[cfg(test)]
#[path = "capacity_tests.rs"]
mod tests;
