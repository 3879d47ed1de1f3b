// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

mod hosts;
mod jobs;
mod node_states;
mod placements;

use lm_core::{Lab, LabId, LabState};

pub(crate) fn store_with_lab(state: LabState) -> (Store, LabId) {
    let store = Store::new();
    let lab = Lab::builder().state(state).build();
    let lab_id = lab.id;
    store.upsert_lab(lab);
    (store, lab_id)
}

#[test]
fn export_import_round_trip() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    let tables = store.export();

    let other = Store::new();
    other.import(tables);
    assert!(other.get_lab(&lab_id).is_some());
}

#[test]
fn tables_serialize_with_id_map_keys() {
    let (store, lab_id) = store_with_lab(LabState::Running);
    let json = serde_json::to_string(&store.export()).unwrap();
    assert!(json.contains(lab_id.as_str()));
    let back: Tables = serde_json::from_str(&json).unwrap();
    assert!(back.labs.contains_key(&lab_id));
}
