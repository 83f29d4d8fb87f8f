//! Channel lifecycle through the public API, driven by simulated inbound
//! frames. No transport is involved: frames a live server would send are fed
//! straight into `Channel::trigger`.

use pulse_realtime::{
    BindingFilter, ChannelConfig, ChannelError, ChannelState, Client, ClientOptions, Payload,
    PresenceListen, SubscribeStatus,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn offline_client() -> Arc<Client> {
    Client::new("ws://localhost:4000/socket", ClientOptions::default())
}

fn reply(channel: &Arc<pulse_realtime::Channel>, status: &str, response: serde_json::Value) {
    let join_ref = channel.join_ref().expect("join was never sent");
    channel.trigger(
        "phx_reply",
        Payload::Json(json!({"status": status, "response": response})),
        Some(join_ref.as_str()),
        None,
    );
}

#[tokio::test]
async fn test_join_handshake_reaches_joined() {
    let client = offline_client();
    let channel = client.channel("room:1", ChannelConfig::default()).unwrap();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    channel
        .subscribe(move |status, _| sink.lock().unwrap().push(status), None)
        .unwrap();
    assert_eq!(channel.state(), ChannelState::Joining);

    reply(&channel, "ok", json!({}));
    assert_eq!(channel.state(), ChannelState::Joined);
    assert_eq!(*statuses.lock().unwrap(), vec![SubscribeStatus::Subscribed]);
}

#[tokio::test]
async fn test_second_subscribe_fails_fast() {
    let client = offline_client();
    let channel = client.channel("room:1", ChannelConfig::default()).unwrap();
    channel.subscribe(|_, _| {}, None).unwrap();
    assert_eq!(
        channel.subscribe(|_, _| {}, None),
        Err(ChannelError::AlreadySubscribed)
    );
}

#[tokio::test]
async fn test_push_requires_a_subscription() {
    let client = offline_client();
    let channel = client.channel("room:1", ChannelConfig::default()).unwrap();
    assert_eq!(
        channel.push("msg", Payload::empty(), None).err(),
        Some(ChannelError::NotJoined)
    );
}

#[tokio::test]
async fn test_stale_join_ref_cannot_perturb_state() {
    let client = offline_client();
    let channel = client.channel("room:1", ChannelConfig::default()).unwrap();
    channel.subscribe(|_, _| {}, None).unwrap();
    reply(&channel, "ok", json!({}));

    for event in ["phx_error", "phx_close", "phx_leave", "phx_join"] {
        channel.trigger(event, Payload::empty(), Some("stale-ref"), None);
        assert_eq!(channel.state(), ChannelState::Joined, "event {event}");
    }
}

#[tokio::test]
async fn test_binding_mismatch_errors_instead_of_joining() {
    let client = offline_client();
    let channel = client.channel("db:changes", ChannelConfig::default()).unwrap();
    channel.on(
        BindingFilter::PostgresChanges {
            event: "INSERT".into(),
            schema: "public".into(),
            table: Some("users".into()),
            filter: None,
        },
        |_| {},
    );
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    channel
        .subscribe(move |s, m| sink.lock().unwrap().push((s, m)), None)
        .unwrap();

    reply(
        &channel,
        "ok",
        json!({"postgres_changes": [
            {"id": 1, "event": "UPDATE", "schema": "public", "table": "users"},
        ]}),
    );

    assert_eq!(channel.state(), ChannelState::Errored);
    let statuses = statuses.lock().unwrap();
    assert_eq!(statuses[0].0, SubscribeStatus::ChannelError);
    assert_eq!(
        statuses[0].1.as_deref(),
        Some("mismatch between server and client bindings")
    );
}

#[tokio::test]
async fn test_change_feed_end_to_end() {
    let client = offline_client();
    let channel = client.channel("db:changes", ChannelConfig::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    channel.on(
        BindingFilter::PostgresChanges {
            event: "*".into(),
            schema: "public".into(),
            table: None,
            filter: None,
        },
        move |payload| sink.lock().unwrap().push(payload.clone()),
    );
    channel.subscribe(|_, _| {}, None).unwrap();
    reply(
        &channel,
        "ok",
        json!({"postgres_changes": [{"id": 3, "event": "*", "schema": "public"}]}),
    );
    assert_eq!(channel.state(), ChannelState::Joined);

    channel.trigger(
        "postgres_changes",
        Payload::Json(json!({
            "ids": [3],
            "data": {
                "type": "UPDATE",
                "schema": "public",
                "table": "users",
                "commit_timestamp": "2026-02-01T10:00:00Z",
                "errors": null,
                "record": {"id": 5, "name": "after"},
                "old_record": {"id": 5, "name": "before"},
            },
        })),
        None,
        None,
    );

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let body = seen[0].as_json().unwrap();
    assert_eq!(body["eventType"], json!("UPDATE"));
    assert_eq!(body["new"]["name"], json!("after"));
    assert_eq!(body["old"]["name"], json!("before"));
}

#[tokio::test]
async fn test_presence_diff_waits_for_snapshot() {
    let client = offline_client();
    let channel = client.channel("room:1", ChannelConfig::default()).unwrap();
    let joins = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&joins);
    channel.on(BindingFilter::Presence(PresenceListen::Join), move |p| {
        sink.lock().unwrap().push(p.clone());
    });
    channel.subscribe(|_, _| {}, None).unwrap();
    reply(&channel, "ok", json!({}));

    // The diff arrives first; nothing may fire until the snapshot lands.
    channel.trigger(
        "presence_diff",
        Payload::Json(json!({
            "joins": {"u2": {"metas": [{"phx_ref": "b"}]}},
            "leaves": {},
        })),
        None,
        None,
    );
    assert!(joins.lock().unwrap().is_empty());

    channel.trigger(
        "presence_state",
        Payload::Json(json!({"u1": {"metas": [{"phx_ref": "a"}]}})),
        None,
        None,
    );
    let joins = joins.lock().unwrap();
    assert_eq!(joins.len(), 2);
    assert_eq!(joins[0].as_json().unwrap()["key"], json!("u1"));
    assert_eq!(joins[1].as_json().unwrap()["key"], json!("u2"));

    let state = channel.presence_state();
    assert!(state.contains_key("u1") && state.contains_key("u2"));
}

#[tokio::test]
async fn test_unsubscribe_closes_and_deregisters() {
    let client = offline_client();
    let channel = client.channel("room:1", ChannelConfig::default()).unwrap();
    channel.subscribe(|_, _| {}, None).unwrap();
    assert_eq!(client.channels().len(), 1);

    // Disconnected, so the leave resolves locally.
    assert_eq!(channel.unsubscribe(None).await, "ok");
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(client.channels().is_empty());
}
