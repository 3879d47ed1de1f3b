// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::state::{NodeActualState, NodeDesiredState};

fn node_event() -> Event {
    Event::NodeStateChanged {
        lab_id: LabId::from_string("lab-x"),
        node_id: "n1".to_string(),
        node_name: "n1".to_string(),
        desired_state: NodeDesiredState::Running,
        actual_state: NodeActualState::Running,
        is_ready: true,
        error_message: None,
        host_id: None,
        host_name: None,
    }
}

#[tokio::test]
async fn publish_without_subscribers_does_not_error() {
    let bus = Broadcaster::default();
    bus.publish(node_event());
    assert_eq!(bus.receiver_count(), 0);
}

#[tokio::test]
async fn subscriber_receives_published_events() {
    let bus = Broadcaster::new(16);
    let mut rx = bus.subscribe();
    bus.publish(node_event());
    let event = rx.recv().await.unwrap();
    match event {
        Event::NodeStateChanged { node_name, is_ready, .. } => {
            assert_eq!(node_name, "n1");
            assert!(is_ready);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn slow_subscribers_lag_instead_of_blocking() {
    let bus = Broadcaster::new(2);
    let mut rx = bus.subscribe();
    for _ in 0..10 {
        bus.publish(node_event());
    }
    // The receiver lost early events but the publisher never blocked.
    let result = rx.recv().await;
    assert!(matches!(
        result,
        Err(tokio::sync::broadcast::error::RecvError::Lagged(_))
    ));
}

#[test]
fn events_serialize_with_kind_tag() {
    let json = serde_json::to_string(&node_event()).unwrap();
    assert!(json.contains("\"kind\":\"node_state_changed\""));
}
