// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Best-effort config snapshot extraction.
//!
//! Before a destroy or an enforcement restart, running configs are
//! pulled from every placed host and saved as snapshots. Always
//! best-effort: the container may already be gone, and a failure here
//! must never fail the surrounding operation.

use crate::ctx::Ctx;
use futures_util::future::join_all;
use lm_core::{Clock, ConfigSnapshot, Host, Lab, NodeActualState, NodeState, SnapshotKind};
use std::collections::BTreeSet;

/// Extract configs from every online host placed for the lab and save
/// them with the given snapshot kind. Returns how many snapshots were
/// stored.
async fn extract_for_lab<C: Clock>(
    ctx: &Ctx<C>,
    lab: &Lab,
    kind: SnapshotKind,
    only_nodes: Option<&BTreeSet<String>>,
) -> usize {
    let store = &ctx.store;

    let mut host_ids = store.placement_hosts_for_lab(&lab.id);
    if host_ids.is_empty() {
        if let Some(agent_id) = lab.agent_id {
            host_ids.insert(agent_id);
        }
    }

    let hosts: Vec<Host> = host_ids
        .iter()
        .filter_map(|id| store.get_host(id))
        .filter(|h| ctx.is_host_online(h))
        .collect();
    if hosts.is_empty() {
        tracing::debug!(lab_id = %lab.id, "no healthy hosts for config extraction");
        return 0;
    }

    let results = join_all(
        hosts
            .iter()
            .map(|host| ctx.agent.extract_configs(host, lab.id.as_str())),
    )
    .await;

    let device_by_node: std::collections::HashMap<String, String> = store
        .nodes_for_lab(&lab.id)
        .into_iter()
        .map(|n| (n.container_name, n.device))
        .collect();

    let now = ctx.now_ms();
    let mut saved = 0;
    for (host, result) in hosts.iter().zip(results) {
        let extract = match result {
            Ok(extract) if extract.success => extract,
            Ok(extract) => {
                tracing::debug!(
                    host = %host.name,
                    error = ?extract.error,
                    "config extraction refused"
                );
                continue;
            }
            Err(e) => {
                tracing::debug!(host = %host.name, error = %e, "config extraction failed");
                continue;
            }
        };
        for config in extract.configs {
            if config.content.is_empty() {
                continue;
            }
            if let Some(only) = only_nodes {
                if !only.contains(&config.node_name) {
                    continue;
                }
            }
            store.insert_config_snapshot(ConfigSnapshot {
                lab_id: lab.id,
                node_name: config.node_name.clone(),
                content: config.content,
                kind,
                device_kind: device_by_node.get(&config.node_name).cloned(),
                created_at_ms: now,
            });
            saved += 1;
        }
    }

    if saved > 0 {
        tracing::info!(lab_id = %lab.id, saved, kind = %kind, "extracted config snapshots");
    }
    saved
}

/// Snapshot running configs before a lab destroy.
pub async fn extract_before_destroy<C: Clock>(ctx: &Ctx<C>, lab: &Lab) {
    if !ctx.settings.feature_auto_extract_on_destroy {
        return;
    }
    extract_for_lab(ctx, lab, SnapshotKind::AutoStop, None).await;
}

/// Snapshot configs from crashed nodes before enforcement replaces
/// their containers.
pub async fn extract_before_restart<C: Clock>(ctx: &Ctx<C>, lab: &Lab, nodes: &[NodeState]) {
    if !ctx.settings.feature_auto_extract_on_enforcement {
        return;
    }
    let restart_nodes: BTreeSet<String> = nodes
        .iter()
        .filter(|ns| {
            matches!(
                ns.actual_state,
                NodeActualState::Exited | NodeActualState::Error
            )
        })
        .map(|ns| ns.node_name.clone())
        .collect();
    if restart_nodes.is_empty() {
        return;
    }
    extract_for_lab(ctx, lab, SnapshotKind::AutoRestart, Some(&restart_nodes)).await;
}
