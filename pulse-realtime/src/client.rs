//! Connection manager: one WebSocket shared by every channel.
//!
//! ```text
//!                 ┌────────────────────────────────────────────┐
//!                 │                  Client                    │
//!  connect ─────► │  writer task ◄── mpsc ◄── push()           │
//!                 │  reader task ──► decode ──► route by topic │
//!                 │  heartbeat task (interval, pending ref)    │
//!                 │  reconnect BackoffTimer                    │
//!                 └───────────────┬────────────────────────────┘
//!                                 ▼
//!                    Channel  Channel  Channel ...
//! ```
//!
//! The writer is an unbounded mpsc feeding a spawned sink task, so sending
//! never blocks protocol logic. Frames pushed while disconnected land in the
//! send buffer and flush FIFO on the next open. A heartbeat whose reply has
//! not arrived by the next tick force-closes the transport so the normal
//! close path drives reconnection.
//!
//! Each (re)connect bumps a generation counter; the reader task carries the
//! generation it was spawned under, and a teardown report from a stale
//! generation is ignored.

use crate::channel::{Channel, ChannelConfig, ChannelError, Socket};
use crate::protocol::{self, Message, Payload, PHX_ERROR, VSN};
use crate::timer::{default_delay, BackoffTimer, DelayFn};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Fetches a fresh access token. A failing provider is logged and the cached
/// token stays in use.
pub type AccessTokenProvider =
    Arc<dyn Fn() -> Result<String, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

type MessageObserver = Arc<Mutex<dyn FnMut(&Message) + Send>>;

/// Connection-level failures surfaced from `connect`.
#[derive(Debug)]
pub enum ClientError {
    Connect(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(detail) => write!(f, "connection failed: {detail}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Construction options. `Default` gives the stock intervals and backoff.
#[derive(Clone)]
pub struct ClientOptions {
    /// Query parameters appended to the endpoint (e.g. an apikey).
    pub params: Vec<(String, String)>,
    pub heartbeat_interval: Duration,
    /// Default timeout for joins, leaves, and pushes.
    pub timeout: Duration,
    /// Delay before reconnect attempt n.
    pub reconnect_after: Arc<DelayFn>,
    /// Delay before a channel's rejoin attempt n.
    pub rejoin_after: Arc<DelayFn>,
    pub access_token: Option<String>,
    pub token_provider: Option<AccessTokenProvider>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            heartbeat_interval: Duration::from_secs(25),
            timeout: Duration::from_secs(10),
            reconnect_after: Arc::new(default_delay),
            rejoin_after: Arc::new(default_delay),
            access_token: None,
            token_provider: None,
        }
    }
}

struct ClientInner {
    connected: bool,
    /// Bumped on every (re)connect and forced close.
    generation: u64,
    writer: Option<mpsc::UnboundedSender<WsMessage>>,
    ref_counter: u64,
    pending_heartbeat_ref: Option<String>,
    /// Encoded frames awaiting a connection, flushed FIFO on open.
    send_buffer: VecDeque<WsMessage>,
    channels: Vec<Arc<Channel>>,
    access_token: Option<String>,
    heartbeat_handle: Option<AbortHandle>,
    reader_handle: Option<AbortHandle>,
    closed_locally: bool,
    observers: Vec<(u64, MessageObserver)>,
    next_observer_ref: u64,
}

/// The realtime client. One instance per endpoint; all state is instance
/// scoped, so several clients in one process never collide.
pub struct Client {
    endpoint: String,
    params: Vec<(String, String)>,
    heartbeat_interval: Duration,
    timeout: Duration,
    rejoin_after: Arc<DelayFn>,
    token_provider: Option<AccessTokenProvider>,
    reconnect_timer: BackoffTimer,
    inner: Mutex<ClientInner>,
}

impl Client {
    pub fn new(endpoint: impl Into<String>, options: ClientOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Client>| {
            let timer_ref = weak.clone();
            let reconnect_timer = BackoffTimer::new(
                Arc::new(move || {
                    if let Some(client) = timer_ref.upgrade() {
                        tokio::spawn(async move {
                            // A failed attempt re-arms the timer itself.
                            let _ = client.connect().await;
                        });
                    }
                }),
                options.reconnect_after,
            );
            Client {
                endpoint: endpoint.into(),
                params: options.params,
                heartbeat_interval: options.heartbeat_interval,
                timeout: options.timeout,
                rejoin_after: options.rejoin_after,
                token_provider: options.token_provider,
                reconnect_timer,
                inner: Mutex::new(ClientInner {
                    connected: false,
                    generation: 0,
                    writer: None,
                    ref_counter: 0,
                    pending_heartbeat_ref: None,
                    send_buffer: VecDeque::new(),
                    channels: Vec::new(),
                    access_token: options.access_token,
                    heartbeat_handle: None,
                    reader_handle: None,
                    closed_locally: false,
                    observers: Vec::new(),
                    next_observer_ref: 0,
                }),
            }
        })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.lock().unwrap().access_token.clone()
    }

    /// Create and register a channel for `topic`. The channel is inert until
    /// `subscribe` is called on it.
    pub fn channel(
        self: &Arc<Self>,
        topic: impl Into<String>,
        config: ChannelConfig,
    ) -> Result<Arc<Channel>, ChannelError> {
        let as_socket: Arc<dyn Socket> = Arc::clone(self) as Arc<dyn Socket>;
        let channel = Channel::new(
            topic,
            config,
            Arc::downgrade(&as_socket),
            self.timeout,
            Arc::clone(&self.rejoin_after),
        )?;
        self.inner.lock().unwrap().channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.inner.lock().unwrap().channels.clone()
    }

    /// Observe every decoded inbound frame, after channel routing.
    pub fn on_message(&self, observer: impl FnMut(&Message) + Send + 'static) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_observer_ref += 1;
        let reference = inner.next_observer_ref;
        inner
            .observers
            .push((reference, Arc::new(Mutex::new(observer))));
        reference
    }

    pub fn off_message(&self, reference: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.observers.retain(|(r, _)| *r != reference);
    }

    // ─── lifecycle ──────────────────────────────────────────────────

    /// Open the transport. A no-op when already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.inner.lock().unwrap().writer.is_some() {
            return Ok(());
        }
        let url = self.build_url();
        log::info!("connecting to {url}");
        let (stream, _response) = match connect_async(&url).await {
            Ok(ok) => ok,
            Err(err) => {
                log::error!("connect failed: {err}");
                self.reconnect_timer.schedule_timeout();
                return Err(ClientError::Connect(err.to_string()));
            }
        };

        let (mut sink, mut reader) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let generation = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            inner.connected = true;
            inner.closed_locally = false;
            inner.pending_heartbeat_ref = None;
            inner.writer = Some(tx.clone());
            inner.generation
        };

        let weak = Arc::downgrade(self);
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match protocol::decode_json(text.as_str()) {
                        Ok(msg) => {
                            if let Some(client) = weak.upgrade() {
                                client.handle_message(msg);
                            }
                        }
                        Err(err) => log::warn!("dropping malformed text frame: {err}"),
                    },
                    Ok(WsMessage::Binary(bytes)) => match protocol::decode_binary(&bytes) {
                        Ok(msg) => {
                            if let Some(client) = weak.upgrade() {
                                client.handle_message(msg);
                            }
                        }
                        Err(err) => log::warn!("dropping malformed binary frame: {err}"),
                    },
                    Ok(WsMessage::Close(frame)) => {
                        log::info!("server closed the connection: {frame:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::error!("transport error: {err}");
                        break;
                    }
                }
            }
            if let Some(client) = weak.upgrade() {
                client.on_transport_closed(generation);
            }
        });
        self.inner.lock().unwrap().reader_handle = Some(reader_task.abort_handle());

        self.refresh_token();
        self.reconnect_timer.reset();
        self.flush_send_buffer();
        self.start_heartbeat();

        for channel in self.channels() {
            channel.on_socket_open();
        }
        Ok(())
    }

    /// Close the transport without arming reconnection.
    pub fn disconnect(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed_locally = true;
            inner.connected = false;
            inner.pending_heartbeat_ref = None;
            inner.generation += 1;
            if let Some(tx) = inner.writer.take() {
                let _ = tx.send(WsMessage::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                })));
            }
            if let Some(handle) = inner.heartbeat_handle.take() {
                handle.abort();
            }
            if let Some(handle) = inner.reader_handle.take() {
                handle.abort();
            }
        }
        self.reconnect_timer.reset();
    }

    // ─── outbound ───────────────────────────────────────────────────

    /// Next wire ref. Wraps to zero at the ceiling.
    pub(crate) fn next_ref(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.ref_counter = inner.ref_counter.wrapping_add(1);
        inner.ref_counter.to_string()
    }

    /// Encode and send, or buffer until the next open.
    pub fn push(&self, msg: Message) {
        let frame = match &msg.payload {
            Payload::Binary(_) => match protocol::encode_binary(&msg) {
                Ok(bytes) => WsMessage::Binary(bytes.into()),
                Err(err) => {
                    log::error!("dropping unencodable push `{}`: {err}", msg.event);
                    return;
                }
            },
            Payload::Json(_) => match protocol::encode_json(&msg) {
                Ok(text) => WsMessage::Text(text.into()),
                Err(err) => {
                    log::error!("dropping unencodable push `{}`: {err}", msg.event);
                    return;
                }
            },
        };
        let mut inner = self.inner.lock().unwrap();
        match (&inner.writer, inner.connected) {
            (Some(tx), true) => {
                if tx.send(frame).is_err() {
                    log::warn!("writer gone, frame dropped");
                }
            }
            _ => inner.send_buffer.push_back(frame),
        }
    }

    /// Store a new token and propagate it to every currently joined channel.
    pub fn set_auth(self: &Arc<Self>, token: impl Into<String>) {
        let token = token.into();
        let channels = {
            let mut inner = self.inner.lock().unwrap();
            inner.access_token = Some(token.clone());
            inner.channels.clone()
        };
        for channel in channels {
            if channel.state() == crate::channel::ChannelState::Joined {
                let _ = channel.push(
                    "access_token",
                    Payload::Json(json!({ "access_token": token })),
                    None,
                );
            }
        }
    }

    // ─── internals ──────────────────────────────────────────────────

    fn build_url(&self) -> String {
        let mut url = self.endpoint.clone();
        let mut sep = if url.contains('?') { '&' } else { '?' };
        for (key, value) in &self.params {
            url.push(sep);
            url.push_str(key);
            url.push('=');
            url.push_str(value);
            sep = '&';
        }
        url.push(sep);
        url.push_str("vsn=");
        url.push_str(VSN);
        url
    }

    fn flush_send_buffer(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.writer.clone() {
            while let Some(frame) = inner.send_buffer.pop_front() {
                if tx.send(frame).is_err() {
                    break;
                }
            }
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(client) => client.heartbeat_tick(),
                    None => break,
                }
            }
        });
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.heartbeat_handle.replace(task.abort_handle()) {
            old.abort();
        }
    }

    fn heartbeat_tick(self: &Arc<Self>) {
        enum Action {
            Skip,
            Timeout,
            Send(String),
        }
        let action = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.connected {
                Action::Skip
            } else if inner.pending_heartbeat_ref.is_some() {
                inner.pending_heartbeat_ref = None;
                Action::Timeout
            } else {
                inner.ref_counter = inner.ref_counter.wrapping_add(1);
                let reference = inner.ref_counter.to_string();
                inner.pending_heartbeat_ref = Some(reference.clone());
                Action::Send(reference)
            }
        };
        match action {
            Action::Skip => {}
            Action::Timeout => {
                log::warn!("heartbeat reply never arrived, closing transport");
                self.force_close(CloseCode::Normal, "heartbeat timeout");
            }
            Action::Send(reference) => {
                self.push(Message::new(
                    None,
                    Some(reference),
                    "phoenix",
                    "heartbeat",
                    Payload::empty(),
                ));
                self.refresh_token();
            }
        }
    }

    fn refresh_token(self: &Arc<Self>) {
        let Some(provider) = &self.token_provider else {
            return;
        };
        match provider() {
            Ok(token) => {
                let changed = self.inner.lock().unwrap().access_token.as_deref()
                    != Some(token.as_str());
                if changed {
                    self.set_auth(token);
                }
            }
            Err(err) => log::error!("access token provider failed: {err}"),
        }
    }

    /// Close the transport from our side and run the normal close
    /// propagation (channels errored, reconnect armed).
    fn force_close(self: &Arc<Self>, code: CloseCode, reason: &str) {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(tx) = inner.writer.take() {
                let _ = tx.send(WsMessage::Close(Some(CloseFrame {
                    code,
                    reason: reason.to_string().into(),
                })));
            }
            if let Some(handle) = inner.reader_handle.take() {
                handle.abort();
            }
            // The aborted reader's teardown report is stale from here on.
            inner.generation += 1;
            inner.generation
        };
        self.on_transport_closed(generation);
    }

    /// Transport gone. Every channel decides from its own state whether to
    /// rejoin; reconnection is armed unless the close was local.
    fn on_transport_closed(self: &Arc<Self>, generation: u64) {
        let (channels, local) = {
            let mut inner = self.inner.lock().unwrap();
            if generation != inner.generation {
                return;
            }
            inner.connected = false;
            inner.writer = None;
            inner.pending_heartbeat_ref = None;
            if let Some(handle) = inner.heartbeat_handle.take() {
                handle.abort();
            }
            (inner.channels.clone(), inner.closed_locally)
        };
        for channel in channels {
            channel.trigger(PHX_ERROR, Payload::empty(), None, None);
        }
        if !local {
            self.reconnect_timer.schedule_timeout();
        }
    }

    fn handle_message(self: &Arc<Self>, msg: Message) {
        let (channels, observers) = {
            let mut inner = self.inner.lock().unwrap();
            if msg.reference.is_some() && msg.reference == inner.pending_heartbeat_ref {
                log::debug!("heartbeat acknowledged");
                inner.pending_heartbeat_ref = None;
            }
            let channels: Vec<Arc<Channel>> = inner
                .channels
                .iter()
                .filter(|c| c.topic() == msg.topic)
                .cloned()
                .collect();
            let observers: Vec<MessageObserver> =
                inner.observers.iter().map(|(_, o)| Arc::clone(o)).collect();
            (channels, observers)
        };
        for channel in channels {
            channel.trigger(
                &msg.event,
                msg.payload.clone(),
                msg.reference.as_deref(),
                msg.join_ref.as_deref(),
            );
        }
        for observer in observers {
            (observer.lock().unwrap())(&msg);
        }
    }
}

impl Socket for Client {
    fn is_connected(&self) -> bool {
        Client::is_connected(self)
    }

    fn make_ref(&self) -> String {
        self.next_ref()
    }

    fn push_message(&self, msg: Message) {
        self.push(msg);
    }

    fn remove_channel(&self, topic: &str) {
        use crate::channel::ChannelState;
        let mut inner = self.inner.lock().unwrap();
        inner
            .channels
            .retain(|c| !(c.topic() == topic && c.state() == ChannelState::Closed));
    }

    fn access_token(&self) -> Option<String> {
        Client::access_token(self)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.heartbeat_handle.take() {
            handle.abort();
        }
        if let Some(handle) = inner.reader_handle.take() {
            handle.abort();
        }
    }
}
