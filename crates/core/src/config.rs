// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime configuration.
//!
//! `Settings` is a read-only value passed to each subsystem at init.
//! Loaded from a TOML file with `LABMESH_*` environment overrides for
//! the options operators tune most often. All intervals and timeouts
//! are seconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Reconciliation
    pub reconciliation_interval: u64,
    pub stale_starting_threshold: u64,
    pub stale_pending_threshold: u64,
    /// Grace window for transitional states before monitors recover them.
    pub transitional_grace: u64,

    // State enforcement
    pub state_enforcement_enabled: bool,
    pub state_enforcement_interval: u64,
    pub state_enforcement_cooldown: u64,
    pub state_enforcement_max_retries: u32,
    pub state_enforcement_retry_backoff: u64,
    pub state_enforcement_crash_cooldown: u64,
    pub state_enforcement_auto_restart_enabled: bool,

    // Job health
    pub job_health_check_interval: u64,
    pub job_max_retries: u32,
    pub stuck_lock_threshold: u64,

    // Image sync
    pub image_sync_enabled: bool,
    pub image_sync_pre_deploy_check: bool,
    pub image_sync_timeout: u64,
    pub image_sync_job_pending_timeout: u64,
    pub image_sync_fallback_strategy: ImageSyncFallback,

    // Resource validation
    pub resource_validation_enabled: bool,
    pub resource_memory_buffer_mb: u64,
    pub resource_cpu_buffer_cores: f64,
    pub resource_disk_buffer_gb: u64,
    pub resource_warning_percent: f64,
    pub resource_error_percent: f64,

    // Lifecycle
    pub per_node_lifecycle_enabled: bool,
    pub feature_auto_extract_on_destroy: bool,
    pub feature_auto_extract_on_enforcement: bool,

    // Agents
    pub agent_heartbeat_timeout: u64,
    pub agent_update_timeout: u64,
    pub agent_auth_token: String,

    // Overlay
    pub vxlan_vni_base: u32,
    pub vxlan_vni_max: u32,
    pub overlay_mtu: u32,
    pub ovs_bridge_name: String,

    // Worker pool
    pub job_worker_permits: usize,
}

/// What to do when a required image cannot be confirmed before deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSyncFallback {
    /// Fail the deploy (default).
    Fail,
    /// Deploy anyway and let the agent pull.
    Proceed,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reconciliation_interval: 30,
            stale_starting_threshold: 600,
            stale_pending_threshold: 300,
            transitional_grace: 360,

            state_enforcement_enabled: true,
            state_enforcement_interval: 60,
            state_enforcement_cooldown: 300,
            state_enforcement_max_retries: 3,
            state_enforcement_retry_backoff: 30,
            state_enforcement_crash_cooldown: 300,
            state_enforcement_auto_restart_enabled: true,

            job_health_check_interval: 60,
            job_max_retries: 2,
            stuck_lock_threshold: 900,

            image_sync_enabled: true,
            image_sync_pre_deploy_check: true,
            image_sync_timeout: 600,
            image_sync_job_pending_timeout: 120,
            image_sync_fallback_strategy: ImageSyncFallback::Fail,

            resource_validation_enabled: true,
            resource_memory_buffer_mb: 1024,
            resource_cpu_buffer_cores: 1.0,
            resource_disk_buffer_gb: 10,
            resource_warning_percent: 80.0,
            resource_error_percent: 95.0,

            per_node_lifecycle_enabled: false,
            feature_auto_extract_on_destroy: true,
            feature_auto_extract_on_enforcement: true,

            agent_heartbeat_timeout: 60,
            agent_update_timeout: 600,
            agent_auth_token: String::new(),

            vxlan_vni_base: 100_000,
            vxlan_vni_max: 116_777,
            overlay_mtu: 1450,
            ovs_bridge_name: "lm-ovs".to_string(),

            job_worker_permits: 8,
        }
    }
}

impl Settings {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut settings: Settings =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    /// Defaults plus environment overrides (no config file).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidOverride {
                key: key.to_string(),
                value,
            })
        }
        fn env_u64(key: &str, slot: &mut u64) -> Result<(), ConfigError> {
            if let Ok(v) = std::env::var(key) {
                *slot = parse(key, v)?;
            }
            Ok(())
        }
        fn env_u32(key: &str, slot: &mut u32) -> Result<(), ConfigError> {
            if let Ok(v) = std::env::var(key) {
                *slot = parse(key, v)?;
            }
            Ok(())
        }
        fn env_bool(key: &str, slot: &mut bool) -> Result<(), ConfigError> {
            if let Ok(v) = std::env::var(key) {
                *slot = parse(key, v)?;
            }
            Ok(())
        }

        env_u64("LABMESH_RECONCILIATION_INTERVAL", &mut self.reconciliation_interval)?;
        env_u64(
            "LABMESH_STATE_ENFORCEMENT_INTERVAL",
            &mut self.state_enforcement_interval,
        )?;
        env_u64(
            "LABMESH_STATE_ENFORCEMENT_COOLDOWN",
            &mut self.state_enforcement_cooldown,
        )?;
        env_u64(
            "LABMESH_STATE_ENFORCEMENT_RETRY_BACKOFF",
            &mut self.state_enforcement_retry_backoff,
        )?;
        env_u64(
            "LABMESH_STATE_ENFORCEMENT_CRASH_COOLDOWN",
            &mut self.state_enforcement_crash_cooldown,
        )?;
        env_u64("LABMESH_JOB_HEALTH_CHECK_INTERVAL", &mut self.job_health_check_interval)?;
        env_u64("LABMESH_IMAGE_SYNC_TIMEOUT", &mut self.image_sync_timeout)?;
        env_u32(
            "LABMESH_STATE_ENFORCEMENT_MAX_RETRIES",
            &mut self.state_enforcement_max_retries,
        )?;
        env_u32("LABMESH_JOB_MAX_RETRIES", &mut self.job_max_retries)?;
        env_bool("LABMESH_STATE_ENFORCEMENT_ENABLED", &mut self.state_enforcement_enabled)?;
        env_bool("LABMESH_IMAGE_SYNC_ENABLED", &mut self.image_sync_enabled)?;
        env_bool(
            "LABMESH_RESOURCE_VALIDATION_ENABLED",
            &mut self.resource_validation_enabled,
        )?;
        env_bool(
            "LABMESH_PER_NODE_LIFECYCLE_ENABLED",
            &mut self.per_node_lifecycle_enabled,
        )?;
        if let Ok(v) = std::env::var("LABMESH_AGENT_AUTH_TOKEN") {
            self.agent_auth_token = v;
        }
        if let Ok(v) = std::env::var("LABMESH_OVS_BRIDGE_NAME") {
            self.ovs_bridge_name = v;
        }
        Ok(())
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval)
    }

    pub fn enforcement_interval(&self) -> Duration {
        Duration::from_secs(self.state_enforcement_interval)
    }

    pub fn job_health_interval(&self) -> Duration {
        Duration::from_secs(self.job_health_check_interval)
    }

    /// Exponential backoff for enforcement retries:
    /// `min(base * 2^attempts, cooldown)`, in milliseconds.
    pub fn enforcement_backoff_ms(&self, attempts: u32) -> u64 {
        let base = self.state_enforcement_retry_backoff.saturating_mul(1000);
        let max = self.state_enforcement_cooldown.saturating_mul(1000);
        let delay = base.saturating_mul(1u64 << attempts.min(20));
        delay.min(max)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
