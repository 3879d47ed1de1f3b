// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent resolution: which host should act for a node or a lab.

use crate::ctx::Ctx;
use lm_core::{Clock, Host, HostId, Lab, Node, NodeState, Provider};

/// Provider a node needs, derived from its device kind. VM-class
/// devices need a VM-capable agent; everything else runs in containers.
pub fn provider_for_node(node: &Node) -> Provider {
    match node.device.as_str() {
        "vmx" | "vqfx" | "csr" | "xrv" | "vsrx" => Provider::Vm,
        _ => Provider::Container,
    }
}

impl<C: Clock> Ctx<C> {
    fn online_host(&self, id: &HostId) -> Option<Host> {
        let host = self.store.get_host(id)?;
        self.is_host_online(&host).then_some(host)
    }

    /// Pick the agent for one node, by priority:
    /// 1. `Node.host_id` (explicit; the caller handles offline — no
    ///    fallback there, so explicit assignment is resolved separately)
    /// 2. `NodePlacement` affinity
    /// 3. the lab's default agent
    /// 4. any healthy agent with the required provider
    pub fn agent_for_node(
        &self,
        lab: &Lab,
        node_def: Option<&Node>,
        node_state: &NodeState,
    ) -> Option<Host> {
        if let Some(node) = node_def {
            if let Some(host_id) = node.host_id {
                return self.online_host(&host_id);
            }
        }

        if let Some(placement) = self.store.get_placement(&lab.id, &node_state.node_name) {
            if let Some(host) = self.online_host(&placement.host_id) {
                return Some(host);
            }
        }

        if let Some(agent_id) = lab.agent_id {
            if let Some(host) = self.online_host(&agent_id) {
                return Some(host);
            }
        }

        let provider = node_def.map(provider_for_node).unwrap_or(lab.provider);
        self.store.healthy_host(
            provider,
            self.now_ms(),
            self.settings.agent_heartbeat_timeout * 1000,
            None,
            &[],
        )
    }

    /// Pick the agent for lab-wide work: placement affinity first, then
    /// the lab default, then any healthy agent.
    pub fn agent_for_lab(&self, lab: &Lab, exclude: &[HostId]) -> Option<Host> {
        for host_id in self.store.placement_hosts_for_lab(&lab.id) {
            if exclude.contains(&host_id) {
                continue;
            }
            if let Some(host) = self.online_host(&host_id) {
                return Some(host);
            }
        }

        if let Some(agent_id) = lab.agent_id {
            if !exclude.contains(&agent_id) {
                if let Some(host) = self.online_host(&agent_id) {
                    return Some(host);
                }
            }
        }

        self.store.healthy_host(
            lab.provider,
            self.now_ms(),
            self.settings.agent_heartbeat_timeout * 1000,
            None,
            exclude,
        )
    }
}

#[cfg(test)]
#[path = "agents_tests.rs"]
mod tests;
