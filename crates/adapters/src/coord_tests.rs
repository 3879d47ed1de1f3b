// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use lm_core::FakeClock;
use std::time::Duration;

fn store() -> (MemoryCoordStore<FakeClock>, FakeClock) {
    let clock = FakeClock::new();
    (MemoryCoordStore::new(clock.clone()), clock)
}

#[tokio::test]
async fn set_nx_ex_acquires_once() {
    let (store, _) = store();
    assert!(store.set_nx_ex("lock", "a", Duration::from_secs(10)).await.unwrap());
    assert!(!store.set_nx_ex("lock", "b", Duration::from_secs(10)).await.unwrap());
    assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));
}

#[tokio::test]
async fn keys_expire_with_the_clock() {
    let (store, clock) = store();
    store.set_nx_ex("lock", "a", Duration::from_secs(10)).await.unwrap();

    clock.advance(Duration::from_secs(9));
    assert!(store.exists("lock").await.unwrap());

    clock.advance(Duration::from_secs(2));
    assert!(!store.exists("lock").await.unwrap());
    // Expired lock can be re-acquired
    assert!(store.set_nx_ex("lock", "b", Duration::from_secs(10)).await.unwrap());
}

#[tokio::test]
async fn set_ex_overwrites_and_refreshes_ttl() {
    let (store, clock) = store();
    store.set_ex("cooldown", "1", Duration::from_secs(5)).await.unwrap();
    clock.advance(Duration::from_secs(4));
    store.set_ex("cooldown", "1", Duration::from_secs(5)).await.unwrap();
    clock.advance(Duration::from_secs(4));
    assert!(store.exists("cooldown").await.unwrap());
}

#[tokio::test]
async fn delete_counts_existing_keys() {
    let (store, _) = store();
    store.set_ex("a", "1", Duration::from_secs(5)).await.unwrap();
    store.set_ex("b", "1", Duration::from_secs(5)).await.unwrap();
    let removed = store
        .delete(&["a".to_string(), "b".to_string(), "missing".to_string()])
        .await
        .unwrap();
    assert_eq!(removed, 2);
}

#[test]
fn key_naming_matches_wire_format() {
    assert_eq!(keys::reconcile_lock("lab-1"), "reconcile_lock:lab-1");
    assert_eq!(keys::link_ops_lock("lab-1"), "link_ops_lock:lab-1");
    assert_eq!(keys::deploy_lock("lab-1", "r1"), "deploy_lock:lab-1:r1");
    assert_eq!(
        keys::enforcement_cooldown("lab-1", "r1"),
        "enforcement_cooldown:lab-1:r1"
    );
}
