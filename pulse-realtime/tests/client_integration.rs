//! End-to-end tests over a real WebSocket: a minimal in-process server
//! accepts connections and answers join/leave/heartbeat pushes the way the
//! upstream endpoint would.

use futures_util::{SinkExt, StreamExt};
use pulse_realtime::protocol::{decode_json, encode_json, Message, Payload};
use pulse_realtime::{BindingFilter, ChannelConfig, Client, ClientOptions, SubscribeStatus};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct ServerBehavior {
    answer_heartbeats: bool,
    broadcast_after_join: Option<Message>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            answer_heartbeats: true,
            broadcast_after_join: None,
        }
    }
}

fn ok_reply(msg: &Message) -> WsMessage {
    let reply = Message::new(
        msg.join_ref.clone(),
        msg.reference.clone(),
        msg.topic.clone(),
        "phx_reply",
        Payload::Json(json!({"status": "ok", "response": {}})),
    );
    WsMessage::Text(encode_json(&reply).unwrap().into())
}

/// Start a server on a free port; every accepted connection bumps the
/// counter.
async fn start_server(behavior: ServerBehavior, connections: Arc<AtomicU32>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let behavior = Arc::new(behavior);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            connections.fetch_add(1, Ordering::SeqCst);
            let behavior = Arc::clone(&behavior);
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(frame)) = ws.next().await {
                    let WsMessage::Text(text) = frame else {
                        continue;
                    };
                    let msg = decode_json(text.as_str()).unwrap();
                    match msg.event.as_str() {
                        "phx_join" => {
                            let _ = ws.send(ok_reply(&msg)).await;
                            if let Some(broadcast) = &behavior.broadcast_after_join {
                                let frame = encode_json(broadcast).unwrap();
                                let _ = ws.send(WsMessage::Text(frame.into())).await;
                            }
                        }
                        "phx_leave" => {
                            let _ = ws.send(ok_reply(&msg)).await;
                        }
                        "heartbeat" if behavior.answer_heartbeats => {
                            let _ = ws.send(ok_reply(&msg)).await;
                        }
                        _ => {}
                    }
                }
            });
        }
    });
    port
}

fn client_for(port: u16, options: ClientOptions) -> Arc<Client> {
    Client::new(format!("ws://127.0.0.1:{port}/socket"), options)
}

#[tokio::test]
async fn test_connect_join_and_leave() {
    let port = start_server(ServerBehavior::default(), Arc::new(AtomicU32::new(0))).await;
    let client = client_for(port, ClientOptions::default());
    client.connect().await.unwrap();
    assert!(client.is_connected());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let channel = client.channel("room:1", ChannelConfig::default()).unwrap();
    channel
        .subscribe(move |status, _| tx.send(status).unwrap(), None)
        .unwrap();

    let status = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(status, Some(SubscribeStatus::Subscribed));

    assert_eq!(
        timeout(Duration::from_secs(2), channel.unsubscribe(None))
            .await
            .unwrap(),
        "ok"
    );
    assert!(client.channels().is_empty());
    client.disconnect();
}

#[tokio::test]
async fn test_broadcast_reaches_binding() {
    let behavior = ServerBehavior {
        broadcast_after_join: Some(Message::new(
            None,
            None,
            "room:1",
            "broadcast",
            Payload::Json(json!({"type": "broadcast", "event": "ping", "payload": {"n": 7}})),
        )),
        ..ServerBehavior::default()
    };
    let port = start_server(behavior, Arc::new(AtomicU32::new(0))).await;
    let client = client_for(port, ClientOptions::default());
    client.connect().await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let channel = client.channel("room:1", ChannelConfig::default()).unwrap();
    channel.on(BindingFilter::Broadcast { event: "ping".into() }, move |payload| {
        tx.send(payload.clone()).unwrap();
    });
    channel.subscribe(|_, _| {}, None).unwrap();

    let payload = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.as_json().unwrap()["payload"]["n"], json!(7));
    client.disconnect();
}

#[tokio::test]
async fn test_acknowledged_heartbeats_keep_the_connection() {
    let port = start_server(ServerBehavior::default(), Arc::new(AtomicU32::new(0))).await;
    let client = client_for(
        port,
        ClientOptions {
            heartbeat_interval: Duration::from_millis(40),
            ..ClientOptions::default()
        },
    );
    client.connect().await.unwrap();

    // Several heartbeat cycles, each acknowledged.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(client.is_connected());
    client.disconnect();
}

#[tokio::test]
async fn test_ignored_heartbeats_trigger_reconnect() {
    let connections = Arc::new(AtomicU32::new(0));
    let behavior = ServerBehavior {
        answer_heartbeats: false,
        ..ServerBehavior::default()
    };
    let port = start_server(behavior, Arc::clone(&connections)).await;
    let client = client_for(
        port,
        ClientOptions {
            heartbeat_interval: Duration::from_millis(40),
            reconnect_after: Arc::new(|_| Duration::from_millis(20)),
            ..ClientOptions::default()
        },
    );
    client.connect().await.unwrap();
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    // Two missed ticks force a close, then the backoff reconnects.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(connections.load(Ordering::SeqCst) >= 2);
    client.disconnect();
}
