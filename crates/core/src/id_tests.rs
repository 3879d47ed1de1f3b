// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::host::HostId;
use crate::job::JobId;
use crate::lab::LabId;

#[test]
fn minted_ids_fill_the_capacity_with_prefix() {
    let id = LabId::new();
    assert!(id.as_str().starts_with("lab-"));
    assert_eq!(id.as_str().len(), ID_CAPACITY);
}

#[test]
fn minted_ids_are_unique() {
    let a = JobId::new();
    let b = JobId::new();
    assert_ne!(a, b);
}

#[test]
fn from_string_round_trips_shorter_wire_ids() {
    let id = HostId::from_string("hst-abc123");
    assert_eq!(id.as_str(), "hst-abc123");
    assert!(!id.is_empty());
}

#[test]
fn empty_raw_id_reads_as_empty() {
    let raw = RawId::empty();
    assert!(raw.is_empty());
    assert_eq!(raw.as_str(), "");
}

#[test]
fn padding_is_canonical_for_equality_and_hashing() {
    use std::collections::HashMap;
    let a = LabId::from_string("lab-k");
    let b = LabId::from_string("lab-k");
    assert_eq!(a, b);

    let mut map: HashMap<LabId, u32> = HashMap::new();
    map.insert(a, 7);
    assert_eq!(map.get(&b), Some(&7));
}

#[test]
fn id_compares_with_str() {
    let id = LabId::from_string("lab-x");
    assert_eq!(id, "lab-x");
    assert_eq!(id, *"lab-x");
}

#[test]
fn serde_round_trip() {
    let id = LabId::from_string("lab-serde");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"lab-serde\"");
    let back: LabId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn ids_work_as_json_map_keys() {
    use std::collections::HashMap;
    let mut map: HashMap<LabId, u32> = HashMap::new();
    map.insert(LabId::from_string("lab-key"), 9);
    let json = serde_json::to_string(&map).unwrap();
    assert!(json.contains("\"lab-key\""));
    let back: HashMap<LabId, u32> = serde_json::from_str(&json).unwrap();
    assert_eq!(back.get(&LabId::from_string("lab-key")), Some(&9));
}

#[test]
fn deserialize_rejects_oversized_id() {
    let long = format!("\"{}\"", "x".repeat(ID_CAPACITY + 1));
    let result: Result<LabId, _> = serde_json::from_str(&long);
    assert!(result.is_err());
}
