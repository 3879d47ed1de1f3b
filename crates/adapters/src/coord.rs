// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Coordination-store interface: `SET NX EX` locks and TTL cooldowns.
//!
//! The store itself (Redis or compatible) is an external collaborator;
//! this trait is the interface the core consumes. Failure policy is
//! decided per call site: reconciliation locks fail closed (skip the
//! pass), deploy locks fail open (proceed; the agent layer is the
//! backstop). The in-memory implementation is clock-driven so tests can
//! expire keys deterministically.

use async_trait::async_trait;
use lm_core::Clock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CoordStore: Send + Sync {
    /// `SET key value NX EX ttl`. Returns true when the key was set
    /// (lock acquired), false when it already exists.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CoordError>;

    /// `SETEX` — unconditional set with TTL (cooldown keys).
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoordError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CoordError>;

    async fn exists(&self, key: &str) -> Result<bool, CoordError>;

    /// Delete keys; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CoordError>;
}

/// Key naming, shared by every lock/cooldown call site.
pub mod keys {
    /// Held by reconciliation for one pass over a lab.
    pub fn reconcile_lock(lab_id: &str) -> String {
        format!("reconcile_lock:{lab_id}")
    }

    /// Held by anything that writes link states or orchestrates links.
    pub fn link_ops_lock(lab_id: &str) -> String {
        format!("link_ops_lock:{lab_id}")
    }

    /// One per deploying node; prevents two jobs deploying the same
    /// node to different hosts.
    pub fn deploy_lock(lab_id: &str, node_name: &str) -> String {
        format!("deploy_lock:{lab_id}:{node_name}")
    }

    /// TTL-based negative lease: presence means enforcement recently
    /// fired for this node.
    pub fn enforcement_cooldown(lab_id: &str, node_name: &str) -> String {
        format!("enforcement_cooldown:{lab_id}:{node_name}")
    }
}

struct Entry {
    value: String,
    expires_at_ms: u64,
}

/// Clock-driven in-memory coordination store.
pub struct MemoryCoordStore<C: Clock> {
    clock: C,
    entries: Mutex<HashMap<String, Entry>>,
}

impl<C: Clock> MemoryCoordStore<C> {
    pub fn new(clock: C) -> Self {
        Self { clock, entries: Mutex::new(HashMap::new()) }
    }

    fn purge_expired(&self, entries: &mut HashMap<String, Entry>) {
        let now = self.clock.epoch_ms();
        entries.retain(|_, e| e.expires_at_ms > now);
    }
}

#[async_trait]
impl<C: Clock> CoordStore for MemoryCoordStore<C> {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CoordError> {
        let mut entries = self.entries.lock();
        self.purge_expired(&mut entries);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms: self.clock.epoch_ms() + ttl.as_millis() as u64,
            },
        );
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoordError> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms: self.clock.epoch_ms() + ttl.as_millis() as u64,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut entries = self.entries.lock();
        self.purge_expired(&mut entries);
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool, CoordError> {
        let mut entries = self.entries.lock();
        self.purge_expired(&mut entries);
        Ok(entries.contains_key(key))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CoordError> {
        let mut entries = self.entries.lock();
        self.purge_expired(&mut entries);
        let mut removed = 0;
        for key in keys {
            if entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[path = "coord_tests.rs"]
mod tests;
