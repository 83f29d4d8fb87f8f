//! Presence reconciliation through the public API: snapshot vs diff merging
//! and the callback contract channels rely on.

use pulse_realtime::presence::{
    normalize_diff, normalize_state, sync_diff, sync_state, PresenceMeta, PresenceState,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn raw_state(entries: &[(&str, &[&str])]) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for (key, refs) in entries {
        let metas: Vec<_> = refs.iter().map(|r| json!({"phx_ref": r})).collect();
        obj.insert(key.to_string(), json!({"metas": metas}));
    }
    serde_json::Value::Object(obj)
}

#[test]
fn test_snapshot_then_identical_snapshot_is_idempotent() {
    let first = normalize_state(&raw_state(&[("u1", &["1"]), ("u2", &["2", "3"])]));
    let state = sync_state(
        &PresenceState::new(),
        first.clone(),
        &mut |_, _, _| {},
        &mut |_, _, _| {},
    );

    let callbacks = Arc::new(Mutex::new(0u32));
    let (a, b) = (Arc::clone(&callbacks), Arc::clone(&callbacks));
    let next = sync_state(
        &state,
        first,
        &mut move |_, _, _| *a.lock().unwrap() += 1,
        &mut move |_, _, _| *b.lock().unwrap() += 1,
    );

    assert_eq!(next, state);
    assert_eq!(*callbacks.lock().unwrap(), 0);
}

#[test]
fn test_diff_join_prepends_and_keeps_existing_device() {
    let mut state = sync_state(
        &PresenceState::new(),
        normalize_state(&raw_state(&[("u1", &["1"])])),
        &mut |_, _, _| {},
        &mut |_, _, _| {},
    );

    let diff = normalize_diff(&json!({
        "joins": raw_state(&[("u1", &["2"])]),
        "leaves": {},
    }));
    let joins = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&joins);
    sync_diff(
        &mut state,
        &diff,
        &mut move |key, previous, new| {
            sink.lock().unwrap().push((
                key.to_string(),
                previous.to_vec(),
                new.to_vec(),
            ));
        },
        &mut |_, _, _| {},
    );

    let refs: Vec<&str> = state["u1"].iter().map(|m| m.presence_ref.as_str()).collect();
    assert_eq!(refs, vec!["2", "1"]);

    let joins = joins.lock().unwrap();
    assert_eq!(joins.len(), 1);
    let (key, previous, new) = &joins[0];
    assert_eq!(key, "u1");
    assert_eq!(
        previous.iter().map(|m| m.presence_ref.as_str()).collect::<Vec<_>>(),
        vec!["1"]
    );
    assert_eq!(
        new.iter().map(|m| m.presence_ref.as_str()).collect::<Vec<_>>(),
        vec!["2"]
    );
}

#[test]
fn test_leave_of_last_device_removes_the_key() {
    let mut state = sync_state(
        &PresenceState::new(),
        normalize_state(&raw_state(&[("u1", &["1"]), ("u2", &["2"])])),
        &mut |_, _, _| {},
        &mut |_, _, _| {},
    );

    let diff = normalize_diff(&json!({
        "joins": {},
        "leaves": raw_state(&[("u1", &["1"])]),
    }));
    sync_diff(&mut state, &diff, &mut |_, _, _| {}, &mut |_, _, _| {});

    assert!(!state.contains_key("u1"));
    assert!(state.contains_key("u2"));
}

#[test]
fn test_snapshot_reports_per_device_churn() {
    let current = sync_state(
        &PresenceState::new(),
        normalize_state(&raw_state(&[("u1", &["1", "2"])])),
        &mut |_, _, _| {},
        &mut |_, _, _| {},
    );

    // Device "1" left, device "3" joined, "2" stayed.
    let joined: Arc<Mutex<Vec<PresenceMeta>>> = Arc::new(Mutex::new(Vec::new()));
    let left: Arc<Mutex<Vec<PresenceMeta>>> = Arc::new(Mutex::new(Vec::new()));
    let (j, l) = (Arc::clone(&joined), Arc::clone(&left));
    let next = sync_state(
        &current,
        normalize_state(&raw_state(&[("u1", &["2", "3"])])),
        &mut move |_, _, new| j.lock().unwrap().extend(new.to_vec()),
        &mut move |_, _, gone| l.lock().unwrap().extend(gone.to_vec()),
    );

    assert_eq!(joined.lock().unwrap()[0].presence_ref, "3");
    assert_eq!(left.lock().unwrap()[0].presence_ref, "1");
    let refs: Vec<&str> = next["u1"].iter().map(|m| m.presence_ref.as_str()).collect();
    assert!(refs.contains(&"2") && refs.contains(&"3"));
    assert_eq!(refs.len(), 2);
}

#[test]
fn test_metadata_survives_normalization() {
    let state = normalize_state(&json!({
        "u1": {"metas": [{
            "phx_ref": "a",
            "phx_ref_prev": "old",
            "online_at": 123,
            "device": "phone",
        }]},
    }));
    let meta = &state["u1"][0];
    assert_eq!(meta.presence_ref, "a");
    assert_eq!(meta.payload, json!({"online_at": 123, "device": "phone"}));
}
