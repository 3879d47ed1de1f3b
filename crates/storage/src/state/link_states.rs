// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Link-state and tunnel accessors.

use super::Store;
use lm_core::{LabId, LinkDesiredState, LinkState, TunnelStatus, VxlanTunnel};

impl Store {
    /// Insert or replace by (lab_id, link_name).
    pub fn upsert_link_state(&self, state: LinkState) {
        let mut tables = self.write();
        if let Some(existing) = tables
            .link_states
            .iter_mut()
            .find(|ls| ls.lab_id == state.lab_id && ls.link_name == state.link_name)
        {
            *existing = state;
        } else {
            tables.link_states.push(state);
        }
    }

    pub fn get_link_state(&self, lab_id: &LabId, link_name: &str) -> Option<LinkState> {
        self.read()
            .link_states
            .iter()
            .find(|ls| ls.lab_id == *lab_id && ls.link_name == link_name)
            .cloned()
    }

    pub fn link_states_for_lab(&self, lab_id: &LabId) -> Vec<LinkState> {
        self.read()
            .link_states
            .iter()
            .filter(|ls| ls.lab_id == *lab_id)
            .cloned()
            .collect()
    }

    pub fn with_link_state(
        &self,
        lab_id: &LabId,
        link_name: &str,
        f: impl FnOnce(&mut LinkState),
    ) -> bool {
        let mut tables = self.write();
        match tables
            .link_states
            .iter_mut()
            .find(|ls| ls.lab_id == *lab_id && ls.link_name == link_name)
        {
            Some(ls) => {
                f(ls);
                true
            }
            None => false,
        }
    }

    /// Remove link states marked for deletion. Returns removed names.
    pub fn delete_marked_link_states(&self, lab_id: &LabId) -> Vec<String> {
        let mut tables = self.write();
        let mut removed = Vec::new();
        tables.link_states.retain(|ls| {
            let drop = ls.lab_id == *lab_id && ls.desired_state == LinkDesiredState::Deleted;
            if drop {
                removed.push(ls.link_name.clone());
            }
            !drop
        });
        removed
    }

    pub fn delete_link_states_for_lab(&self, lab_id: &LabId) {
        self.write().link_states.retain(|ls| ls.lab_id != *lab_id);
    }

    /// Exactly-one tunnel per link state: replaces any existing row for
    /// the same (lab_id, link_name).
    pub fn upsert_tunnel(&self, tunnel: VxlanTunnel) {
        let mut tables = self.write();
        tables
            .tunnels
            .retain(|t| !(t.lab_id == tunnel.lab_id && t.link_name == tunnel.link_name));
        tables.tunnels.push(tunnel);
    }

    pub fn get_tunnel(&self, lab_id: &LabId, link_name: &str) -> Option<VxlanTunnel> {
        self.read()
            .tunnels
            .iter()
            .find(|t| t.lab_id == *lab_id && t.link_name == link_name)
            .cloned()
    }

    pub fn active_tunnel(&self, lab_id: &LabId, link_name: &str) -> Option<VxlanTunnel> {
        self.get_tunnel(lab_id, link_name)
            .filter(|t| t.status == TunnelStatus::Active)
    }

    pub fn tunnels_for_lab(&self, lab_id: &LabId) -> Vec<VxlanTunnel> {
        self.read()
            .tunnels
            .iter()
            .filter(|t| t.lab_id == *lab_id)
            .cloned()
            .collect()
    }

    pub fn delete_tunnel(&self, lab_id: &LabId, link_name: &str) {
        self.write()
            .tunnels
            .retain(|t| !(t.lab_id == *lab_id && t.link_name == link_name));
    }

    pub fn delete_tunnels_for_lab(&self, lab_id: &LabId) {
        self.write().tunnels.retain(|t| t.lab_id != *lab_id);
    }
}
