// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Extracted device-config snapshots.
//!
//! Captured best-effort before destroys and enforcement restarts so a
//! crashed container's running config survives replacement.

use crate::lab::LabId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Manual,
    /// Taken before a lab destroy.
    AutoStop,
    /// Taken before an enforcement restart.
    AutoRestart,
}

crate::str_display! {
    SnapshotKind {
        Manual => "manual",
        AutoStop => "auto_stop",
        AutoRestart => "auto_restart",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub lab_id: LabId,
    pub node_name: String,
    pub content: String,
    pub kind: SnapshotKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_kind: Option<String>,
    pub created_at_ms: u64,
}
