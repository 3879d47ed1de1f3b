// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::state::Store;
use lm_core::{Host, HostStatus, Provider, ResourceSnapshot};

const NOW: u64 = 1_700_000_100_000;
const HEARTBEAT_TIMEOUT: u64 = 60_000;

#[test]
fn heartbeat_marks_online_and_refreshes_resources() {
    let store = Store::new();
    let host = Host::builder().status(HostStatus::Offline).build();
    let id = host.id;
    store.upsert_host(host);

    let resources = ResourceSnapshot { memory_total_mb: 1, ..Default::default() };
    assert!(store.record_heartbeat(&id, resources, NOW));

    let host = store.get_host(&id).unwrap();
    assert_eq!(host.status, HostStatus::Online);
    assert_eq!(host.last_heartbeat_ms, Some(NOW));
    assert_eq!(host.resources.memory_total_mb, 1);
}

#[test]
fn online_hosts_require_fresh_heartbeat() {
    let store = Store::new();
    let fresh = Host::builder().name("fresh").last_heartbeat_ms(Some(NOW)).build();
    let stale = Host::builder()
        .name("stale")
        .last_heartbeat_ms(Some(NOW - HEARTBEAT_TIMEOUT - 1))
        .build();
    store.upsert_host(fresh);
    store.upsert_host(stale);

    let online = store.online_hosts(NOW, HEARTBEAT_TIMEOUT);
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].name, "fresh");
}

#[test]
fn healthy_host_prefers_and_excludes() {
    let store = Store::new();
    let a = Host::builder().name("a").last_heartbeat_ms(Some(NOW)).build();
    let b = Host::builder().name("b").last_heartbeat_ms(Some(NOW)).build();
    let (a_id, b_id) = (a.id, b.id);
    store.upsert_host(a);
    store.upsert_host(b);

    let picked = store
        .healthy_host(Provider::Container, NOW, HEARTBEAT_TIMEOUT, Some(b_id), &[])
        .unwrap();
    assert_eq!(picked.id, b_id);

    let picked = store
        .healthy_host(Provider::Container, NOW, HEARTBEAT_TIMEOUT, Some(b_id), &[b_id])
        .unwrap();
    assert_eq!(picked.id, a_id);

    assert!(store
        .healthy_host(Provider::Vm, NOW, HEARTBEAT_TIMEOUT, None, &[])
        .is_none());
}

#[test]
fn host_error_streak_stamps_since_once() {
    let store = Store::new();
    let host = Host::builder().build();
    let id = host.id;
    store.upsert_host(host);

    store.set_host_error(&id, "first", 100);
    store.set_host_error(&id, "second", 200);
    let host = store.get_host(&id).unwrap();
    assert_eq!(host.last_error.as_deref(), Some("second"));
    assert_eq!(host.error_since_ms, Some(100));

    store.clear_host_error(&id);
    let host = store.get_host(&id).unwrap();
    assert!(host.last_error.is_none());
    assert!(host.error_since_ms.is_none());
}
