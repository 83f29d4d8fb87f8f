//! # pulse-realtime
//!
//! Client engine for a multiplexed, reconnecting publish/subscribe protocol
//! over a single WebSocket. One physical connection carries many independent
//! logical channels, each with its own join/leave lifecycle, push/reply
//! correlation, failure recovery, and an optional presence sub-protocol.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────┐
//!   │                        Client                            │
//!   │   transport · heartbeat · reconnect backoff · buffer     │
//!   └───────┬──────────────────┬──────────────────┬────────────┘
//!           │ route by topic   │                  │
//!     ┌─────▼─────┐      ┌─────▼─────┐      ┌─────▼─────┐
//!     │  Channel  │      │  Channel  │      │  Channel  │
//!     │ bindings  │      │ presence  │      │  pushes   │
//!     └───────────┘      └───────────┘      └───────────┘
//! ```
//!
//! Inbound frames are decoded by [`protocol`], routed by topic to the owning
//! [`Channel`], and dispatched to the [`Push`] awaiting that reply ref or to
//! the registered bindings. Outbound pushes travel the reverse path, with
//! buffering at both layers while disconnected.
//!
//! ## Example
//!
//! ```no_run
//! use pulse_realtime::{BindingFilter, ChannelConfig, Client, ClientOptions, Payload};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new("wss://example.com/socket", ClientOptions::default());
//! client.connect().await?;
//!
//! let room = client.channel("room:lobby", ChannelConfig::default())?;
//! room.on(BindingFilter::Broadcast { event: "new_msg".into() }, |payload| {
//!     println!("got {payload:?}");
//! });
//! room.subscribe(|status, _| println!("subscription: {status:?}"), None)?;
//!
//! room.push("new_msg", Payload::Json(json!({"body": "hello"})), None)?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod push;
pub mod timer;

pub use channel::{
    BindingFilter, Channel, ChannelConfig, ChannelError, ChannelState, PresenceListen,
    SubscribeStatus,
};
pub use client::{AccessTokenProvider, Client, ClientError, ClientOptions};
pub use presence::{PresenceDiff, PresenceEvent, PresenceMeta, PresenceState};
pub use protocol::{CodecError, Message, Payload};
pub use push::{Push, PushStatus, Reply};
pub use timer::{default_delay, BackoffTimer};
