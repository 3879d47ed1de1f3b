// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared engine context.
//!
//! Every subsystem gets the same read-only bundle at init: the store,
//! the agent client, the coordination store, the event bus, settings,
//! and the clock. No process-wide mutable singletons.

use lm_adapters::{AgentApi, CoordStore};
use lm_core::{Broadcaster, Clock, Event, Host, Settings};
use lm_storage::Store;
use std::sync::Arc;

pub struct Ctx<C: Clock> {
    pub store: Arc<Store>,
    pub agent: Arc<dyn AgentApi>,
    pub coord: Arc<dyn CoordStore>,
    pub bus: Broadcaster,
    pub settings: Arc<Settings>,
    pub clock: C,
}

impl<C: Clock> Ctx<C> {
    pub fn new(
        store: Arc<Store>,
        agent: Arc<dyn AgentApi>,
        coord: Arc<dyn CoordStore>,
        bus: Broadcaster,
        settings: Arc<Settings>,
        clock: C,
    ) -> Self {
        Self { store, agent, coord, bus, settings, clock }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.epoch_ms()
    }

    /// Host liveness per settings (status + heartbeat freshness).
    pub fn is_host_online(&self, host: &Host) -> bool {
        host.is_online(self.now_ms(), self.settings.agent_heartbeat_timeout * 1000)
    }

    pub fn publish(&self, event: Event) {
        self.bus.publish(event);
    }

    /// Broadcast the current state of one node.
    pub fn publish_node_state(&self, ns: &lm_core::NodeState, host: Option<&Host>) {
        self.publish(Event::NodeStateChanged {
            lab_id: ns.lab_id,
            node_id: ns.node_id.clone(),
            node_name: ns.node_name.clone(),
            desired_state: ns.desired_state,
            actual_state: ns.actual_state,
            is_ready: ns.is_ready,
            error_message: ns.error_message.clone(),
            host_id: host.map(|h| h.id),
            host_name: host.map(|h| h.name.clone()),
        });
    }

    /// Broadcast the current state of one link.
    pub fn publish_link_state(&self, ls: &lm_core::LinkState) {
        self.publish(Event::LinkStateChanged {
            lab_id: ls.lab_id,
            link_name: ls.link_name.clone(),
            desired_state: ls.desired_state,
            actual_state: ls.actual_state,
            source_node: ls.source_node.clone(),
            target_node: ls.target_node.clone(),
            error_message: ls.error_message.clone(),
        });
    }
}
