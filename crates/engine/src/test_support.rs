// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test harness: store + fake agent + in-memory coordination
//! store + fake clock, wired into one `Ctx`.

use crate::ctx::Ctx;
use lm_adapters::{FakeAgent, MemoryCoordStore};
use lm_core::{
    Broadcaster, Clock, FakeClock, Host, HostStatus, Job, JobAction, Lab, LabState, Link, LinkId,
    ManagedInterface, Node, NodeActualState, NodeDesiredState, NodeState, NodeType, Settings,
};
use lm_storage::Store;
use std::sync::Arc;

pub(crate) struct Harness {
    pub ctx: Arc<Ctx<FakeClock>>,
    pub clock: FakeClock,
    pub agent: Arc<FakeAgent>,
    pub store: Arc<Store>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
        let mut settings = Settings::default();
        configure(&mut settings);

        let clock = FakeClock::new();
        let store = Arc::new(Store::new());
        let agent = Arc::new(FakeAgent::new());
        let coord = Arc::new(MemoryCoordStore::new(clock.clone()));
        let ctx = Arc::new(Ctx::new(
            store.clone(),
            agent.clone(),
            coord,
            Broadcaster::default(),
            Arc::new(settings),
            clock.clone(),
        ));
        Self { ctx, clock, agent, store }
    }

    /// Online host with a fresh heartbeat.
    pub fn add_host(&self, name: &str) -> Host {
        let host = Host::builder()
            .name(name)
            .last_heartbeat_ms(Some(self.clock.epoch_ms()))
            .build();
        self.store.upsert_host(host.clone());
        host
    }

    pub fn add_offline_host(&self, name: &str) -> Host {
        let host = Host::builder()
            .name(name)
            .status(HostStatus::Offline)
            .last_heartbeat_ms(None)
            .build();
        self.store.upsert_host(host.clone());
        host
    }

    /// Refresh a host's heartbeat to the current fake time.
    pub fn heartbeat(&self, host: &Host) {
        let now = self.clock.epoch_ms();
        self.store.with_host(&host.id, |h| {
            h.last_heartbeat_ms = Some(now);
        });
    }

    pub fn add_lab(&self, state: LabState) -> Lab {
        let lab = Lab::builder().state(state).created_at_ms(self.clock.epoch_ms()).build();
        self.store.upsert_lab(lab.clone());
        lab
    }

    /// Node definition plus its state row (desired running, actual
    /// undeployed by default).
    pub fn add_node(&self, lab: &Lab, name: &str, host: Option<&Host>) -> Node {
        let mut builder = Node::builder()
            .lab_id(lab.id)
            .display_id(name)
            .container_name(name);
        if let Some(host) = host {
            builder = builder.host_id(host.id);
        }
        let node = builder.build();
        self.store.insert_node(node.clone());
        self.store.upsert_node_state(
            NodeState::builder()
                .lab_id(lab.id)
                .node_id(name)
                .node_name(name)
                .node_definition_id(node.id)
                .desired_state(NodeDesiredState::Running)
                .actual_state(NodeActualState::Undeployed)
                .updated_at_ms(self.clock.epoch_ms())
                .build(),
        );
        node
    }

    /// Pre-provisioned host interface for external links.
    pub fn add_managed_interface(&self, host: &Host, name: &str) -> ManagedInterface {
        let interface = ManagedInterface::builder().host_id(host.id).name(name).build();
        self.store.upsert_managed_interface(interface.clone());
        interface
    }

    /// External node: no container, no state row; links to it attach to
    /// the managed interface.
    pub fn add_external_node(
        &self,
        lab: &Lab,
        name: &str,
        host: &Host,
        interface: Option<&ManagedInterface>,
    ) -> Node {
        let mut builder = Node::builder()
            .lab_id(lab.id)
            .display_id(name)
            .container_name(name)
            .device("external")
            .node_type(NodeType::External)
            .host_id(host.id);
        if let Some(interface) = interface {
            builder = builder.managed_interface_id(interface.id);
        }
        let node = builder.build();
        self.store.insert_node(node.clone());
        node
    }

    pub fn set_node_state(
        &self,
        lab: &Lab,
        name: &str,
        desired: NodeDesiredState,
        actual: NodeActualState,
    ) {
        self.store.with_node_state(&lab.id, name, |row| {
            row.desired_state = desired;
            row.actual_state = actual;
        });
    }

    pub fn node_state(&self, lab: &Lab, name: &str) -> NodeState {
        match self.store.get_node_state(&lab.id, name) {
            Some(ns) => ns,
            None => panic!("no node state for {name}"),
        }
    }

    pub fn add_link(&self, lab: &Lab, a: &Node, if_a: &str, b: &Node, if_b: &str) -> Link {
        let link = Link {
            id: LinkId::new(),
            lab_id: lab.id,
            link_name: lm_core::link_name(&a.container_name, if_a, &b.container_name, if_b),
            source_node_id: a.id,
            target_node_id: b.id,
            source_interface: if_a.to_string(),
            target_interface: if_b.to_string(),
            vlan: None,
        };
        self.store.insert_link(link.clone());
        link
    }

    pub fn make_job(&self, lab: &Lab, action: JobAction, node_ids: Vec<String>) -> Job {
        let mut job = Job::new(lab.id, action, self.clock.epoch_ms());
        job.node_ids = node_ids;
        self.store.insert_job(job.clone());
        job
    }
}
