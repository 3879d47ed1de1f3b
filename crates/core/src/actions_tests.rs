// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    up = { "up" },
    down = { "down" },
    sync_node = { "sync:node:n1" },
    sync_batch = { "sync:batch:4" },
    sync_host = { "sync:host:hst-abc" },
    enforce = { "reconcile:enforce:n1,n2" },
    other = { "node:start:n1" },
)]
fn wire_format_round_trips(wire: &str) {
    let action = JobAction::parse(wire);
    assert_eq!(action.to_string(), wire);
}

#[test]
fn parse_classifies_families() {
    assert!(JobAction::parse("up").is_lab_wide());
    assert!(JobAction::parse("down").is_lab_wide());
    assert!(JobAction::parse("sync:node:x").is_sync());
    assert!(JobAction::parse("sync:batch:2").is_sync());
    assert!(JobAction::parse("reconcile:enforce:x").is_sync());
    assert!(!JobAction::parse("sync:node:x").is_lab_wide());
}

#[test]
fn malformed_batch_count_falls_back_to_other() {
    let action = JobAction::parse("sync:batch:notanumber");
    assert_eq!(action, JobAction::Other("sync:batch:notanumber".to_string()));
}

#[test]
fn timeouts_ordered_by_action_weight() {
    assert!(JobAction::Up.timeout() > JobAction::SyncBatch(1).timeout());
    assert!(JobAction::SyncBatch(1).timeout() > JobAction::Other("x".into()).timeout());
}

#[test]
fn serde_uses_wire_strings() {
    let json = serde_json::to_string(&JobAction::SyncBatch(3)).unwrap();
    assert_eq!(json, "\"sync:batch:3\"");
    let back: JobAction = serde_json::from_str("\"sync:node:abc\"").unwrap();
    assert_eq!(back, JobAction::SyncNode("abc".to_string()));
}
