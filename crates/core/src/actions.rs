// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed job actions with a stable wire format.
//!
//! Job rows persist the action as a string (`up`, `sync:node:<id>`,
//! `sync:batch:<n>`, …). The enum keeps parsing in one place while the
//! `Display` impl reproduces the exact legacy strings so stored rows
//! stay readable across versions.

use crate::host::HostId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unit-of-work kinds the runner dispatches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobAction {
    /// Deploy the whole lab.
    Up,
    /// Destroy the whole lab.
    Down,
    /// Sync one node by its user-visible id.
    SyncNode(String),
    /// Enforcement batch of N nodes (node ids travel out of band).
    SyncBatch(usize),
    /// Child job syncing the node ids routed to one host.
    SyncHost(HostId),
    /// Reconciliation-triggered enforcement; payload is a truncated,
    /// comma-joined id list for display.
    ReconcileEnforce(String),
    /// Free-form action we don't recognize (forward compatibility).
    Other(String),
}

impl JobAction {
    pub fn parse(s: &str) -> Self {
        match s {
            "up" => return Self::Up,
            "down" => return Self::Down,
            _ => {}
        }
        if let Some(rest) = s.strip_prefix("sync:node:") {
            return Self::SyncNode(rest.to_string());
        }
        if let Some(rest) = s.strip_prefix("sync:batch:") {
            if let Ok(n) = rest.parse::<usize>() {
                return Self::SyncBatch(n);
            }
        }
        if let Some(rest) = s.strip_prefix("sync:host:") {
            return Self::SyncHost(HostId::from_string(rest));
        }
        if let Some(rest) = s.strip_prefix("reconcile:enforce:") {
            return Self::ReconcileEnforce(rest.to_string());
        }
        Self::Other(s.to_string())
    }

    /// Any of the `sync:*` family (per-node lifecycle work).
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            Self::SyncNode(_) | Self::SyncBatch(_) | Self::SyncHost(_) | Self::ReconcileEnforce(_)
        )
    }

    /// Lab-wide deploy/destroy (blocks enforcement while active).
    pub fn is_lab_wide(&self) -> bool {
        matches!(self, Self::Up | Self::Down)
    }

    /// How long a job of this kind may run before job-health calls it
    /// stuck. Deploys wait on image boots; syncs fan out per node.
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Up | Self::Down => Duration::from_secs(900),
            Self::SyncNode(_) | Self::SyncBatch(_) | Self::SyncHost(_)
            | Self::ReconcileEnforce(_) => Duration::from_secs(600),
            Self::Other(_) => Duration::from_secs(300),
        }
    }
}

impl std::fmt::Display for JobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
            Self::SyncNode(id) => write!(f, "sync:node:{id}"),
            Self::SyncBatch(n) => write!(f, "sync:batch:{n}"),
            Self::SyncHost(h) => write!(f, "sync:host:{h}"),
            Self::ReconcileEnforce(ids) => write!(f, "reconcile:enforce:{ids}"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

impl Serialize for JobAction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for JobAction {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

#[cfg(test)]
#[path = "actions_tests.rs"]
mod tests;
