// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot persistence for crash recovery.
//!
//! A snapshot stores the complete table set at a point in time as
//! zstd-compressed JSON. Writes go to a temp file first and rename into
//! place; the previous snapshot rotates to `.bak` files so a torn write
//! never loses the last good state.

use crate::state::Tables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current snapshot schema version
pub const CURRENT_SNAPSHOT_VERSION: u32 = 1;

/// zstd compression level for snapshots (speed over ratio).
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0} (current: {CURRENT_SNAPSHOT_VERSION})")]
    Version(u32),
}

/// A snapshot of the store at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Schema version for migrations
    #[serde(rename = "v")]
    pub version: u32,
    /// The complete table set
    pub tables: Tables,
    /// When this snapshot was created
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(tables: Tables) -> Self {
        Self {
            version: CURRENT_SNAPSHOT_VERSION,
            tables,
            created_at: Utc::now(),
        }
    }

    /// Write the snapshot atomically, rotating older copies to `.bak`.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec(self)?;
        let compressed = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &compressed)?;

        if path.exists() {
            let bak = rotate_bak_path(path);
            let _ = fs::rename(path, bak);
        }
        fs::rename(&tmp, path)?;

        tracing::debug!(
            path = %path.display(),
            size_bytes = compressed.len(),
            "saved snapshot"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let compressed = fs::read(path)?;
        let json = zstd::decode_all(compressed.as_slice())?;
        let snapshot: Snapshot = serde_json::from_slice(&json)?;
        if snapshot.version > CURRENT_SNAPSHOT_VERSION {
            return Err(SnapshotError::Version(snapshot.version));
        }
        Ok(snapshot)
    }

    /// Load the snapshot if one exists, falling back through rotated
    /// backups on corruption. Returns `None` when nothing loads.
    pub fn recover(path: &Path) -> Option<Self> {
        let mut candidates = vec![path.to_path_buf()];
        candidates.push(path.with_extension("bak"));
        for n in 2..=MAX_BAK_FILES {
            candidates.push(path.with_extension(format!("bak.{n}")));
        }

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            match Self::load(&candidate) {
                Ok(snapshot) => {
                    if candidate != path {
                        tracing::warn!(
                            recovered_from = %candidate.display(),
                            "primary snapshot unreadable, recovered from backup"
                        );
                    }
                    return Some(snapshot);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %candidate.display(),
                        error = %e,
                        "failed to load snapshot candidate"
                    );
                }
            }
        }
        None
    }
}

const MAX_BAK_FILES: u32 = 3;

/// Pick the next `.bak` / `.bak.N` path, rotating older backups out.
///
/// Keeps up to [`MAX_BAK_FILES`] backups: `.bak`, `.bak.2`, `.bak.3`.
/// The oldest backup is removed when the limit is reached.
fn rotate_bak_path(path: &Path) -> PathBuf {
    let bak = |n: u32| {
        if n == 1 {
            path.with_extension("bak")
        } else {
            path.with_extension(format!("bak.{n}"))
        }
    };

    let oldest = bak(MAX_BAK_FILES);
    if oldest.exists() {
        let _ = fs::remove_file(&oldest);
    }

    for n in (1..MAX_BAK_FILES).rev() {
        let src = bak(n);
        if src.exists() {
            let _ = fs::rename(&src, bak(n + 1));
        }
    }

    bak(1)
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
