// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State enums shared across the convergence core.

use serde::{Deserialize, Serialize};

/// What the user asked a node to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDesiredState {
    Running,
    Stopped,
}

crate::str_display! {
    NodeDesiredState {
        Running => "running",
        Stopped => "stopped",
    }
}

/// What a node's container was last observed (or committed) to be.
///
/// `Pending`, `Starting`, and `Stopping` are transitional: they are set
/// by the lifecycle manager before the agent call so the user sees the
/// operation in flight even if the job later fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeActualState {
    Undeployed,
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Exited,
    Error,
}

impl NodeActualState {
    /// Transitional states are owned by an in-flight job; reconciliation
    /// must not overwrite them within the grace window.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Pending | Self::Starting | Self::Stopping)
    }
}

crate::str_display! {
    NodeActualState {
        Undeployed => "undeployed",
        Pending => "pending",
        Starting => "starting",
        Running => "running",
        Stopping => "stopping",
        Stopped => "stopped",
        Exited => "exited",
        Error => "error",
    }
}

/// Desired state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDesiredState {
    Up,
    Down,
    /// Marked for removal; reconciliation deletes the row.
    Deleted,
}

crate::str_display! {
    LinkDesiredState {
        Up => "up",
        Down => "down",
        Deleted => "deleted",
    }
}

/// Observed state of a link, derived from endpoint node states and
/// (for cross-host links) tunnel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkActualState {
    Unknown,
    Pending,
    Up,
    Down,
    Error,
}

crate::str_display! {
    LinkActualState {
        Unknown => "unknown",
        Pending => "pending",
        Up => "up",
        Down => "down",
        Error => "error",
    }
}

/// User-settable carrier (administrative) state of a link endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarrierState {
    On,
    Off,
}

impl Default for CarrierState {
    fn default() -> Self {
        Self::On
    }
}

crate::str_display! {
    CarrierState {
        On => "on",
        Off => "off",
    }
}

/// Operational state of a link endpoint as reported by the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperState {
    Up,
    Down,
    Unknown,
}

impl Default for OperState {
    fn default() -> Self {
        Self::Unknown
    }
}

crate::str_display! {
    OperState {
        Up => "up",
        Down => "down",
        Unknown => "unknown",
    }
}

/// Derived view of a lab, always recomputable from its node states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabState {
    Undeployed,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Unknown,
}

impl LabState {
    /// Stable states are eligible for enforcement; transitional labs are
    /// owned by an in-flight job.
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Running | Self::Stopped | Self::Error)
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping | Self::Unknown)
    }
}

crate::str_display! {
    LabState {
        Undeployed => "undeployed",
        Starting => "starting",
        Running => "running",
        Stopping => "stopping",
        Stopped => "stopped",
        Error => "error",
        Unknown => "unknown",
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    /// Primary operation succeeded but cleanup was incomplete (e.g. some
    /// agents were offline during a multi-host destroy).
    CompletedWithWarnings,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

crate::str_display! {
    JobStatus {
        Queued => "queued",
        Running => "running",
        Completed => "completed",
        CompletedWithWarnings => "completed_with_warnings",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

/// Worker host status as maintained by the heartbeat path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Online,
    Offline,
}

crate::str_display! {
    HostStatus {
        Online => "online",
        Offline => "offline",
    }
}

/// Node placement record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStatus {
    /// Target host chosen, deploy in flight.
    Starting,
    Deployed,
}

crate::str_display! {
    PlacementStatus {
        Starting => "starting",
        Deployed => "deployed",
    }
}

/// Image sync side-channel status on a node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSyncState {
    Checking,
    Syncing,
    Failed,
}

impl ImageSyncState {
    /// Active states block stuck-starting recovery.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Checking | Self::Syncing)
    }
}

crate::str_display! {
    ImageSyncState {
        Checking => "checking",
        Syncing => "syncing",
        Failed => "failed",
    }
}

/// Per-(image, host) sync job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSyncJobStatus {
    Pending,
    Transferring,
    Loading,
    Completed,
    Failed,
}

impl ImageSyncJobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Transferring | Self::Loading)
    }
}

crate::str_display! {
    ImageSyncJobStatus {
        Pending => "pending",
        Transferring => "transferring",
        Loading => "loading",
        Completed => "completed",
        Failed => "failed",
    }
}

/// Agent binary self-upgrade lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentUpdateStatus {
    Pending,
    Downloading,
    Installing,
    Restarting,
    Completed,
    Failed,
}

impl AgentUpdateStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Downloading | Self::Installing | Self::Restarting
        )
    }
}

crate::str_display! {
    AgentUpdateStatus {
        Pending => "pending",
        Downloading => "downloading",
        Installing => "installing",
        Restarting => "restarting",
        Completed => "completed",
        Failed => "failed",
    }
}

/// Tunnel row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Active,
    Failed,
}

crate::str_display! {
    TunnelStatus {
        Active => "active",
        Failed => "failed",
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
