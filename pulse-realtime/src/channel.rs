//! Per-topic channel state machine.
//!
//! ```text
//!            subscribe            ok reply
//!   closed ───────────► joining ───────────► joined
//!                          │  ▲                │
//!            error/timeout │  │ rejoin timer   │ connection error
//!                          ▼  │                ▼
//!                        errored ◄─────────────┘
//!                          │
//!              unsubscribe ▼ (any non-leaving state)
//!                       leaving ───► closed (terminal)
//! ```
//!
//! A channel is joined at most once per instance; after it closes, the same
//! topic needs a fresh channel. Frames carrying a reserved lifecycle event
//! with a ref from an earlier join attempt are fenced out so a stale reply
//! cannot perturb the current generation.
//!
//! Lock order is channel-then-socket. Callbacks are collected under the
//! channel lock and invoked after it is released.

use crate::presence::{ChannelPresence, PresenceEvent, PresenceMeta, PresenceState};
use crate::protocol::{Message, Payload, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY, RESERVED_EVENTS};
use crate::push::{Push, PushStatus};
use crate::timer::{BackoffTimer, DelayFn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Pushes queued while the channel cannot send. At capacity the oldest is
/// evicted.
const PUSH_BUFFER_CAPACITY: usize = 100;

/// What the channel needs from its owning connection. Non-owning: the
/// channel holds this behind a `Weak` so teardown runs connection-first.
pub(crate) trait Socket: Send + Sync {
    fn is_connected(&self) -> bool;
    fn make_ref(&self) -> String;
    fn push_message(&self, msg: Message);
    fn remove_channel(&self, topic: &str);
    fn access_token(&self) -> Option<String>;
}

/// Lifecycle states. `Closed` is terminal for the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Errored,
    Joined,
    Joining,
    Leaving,
}

/// Status delivered to the subscribe callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    TimedOut,
    ChannelError,
    Closed,
}

/// Caller contract violations and configuration errors. Recoverable protocol
/// conditions never surface here; they arrive as status callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// `subscribe` called more than once on one instance.
    AlreadySubscribed,
    /// `push` called before the channel was ever subscribed.
    NotJoined,
    InvalidConfig(&'static str),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadySubscribed => write!(f, "subscribe called more than once"),
            Self::NotJoined => write!(f, "push called before subscribing the channel"),
            Self::InvalidConfig(detail) => write!(f, "invalid channel config: {detail}"),
        }
    }
}

impl std::error::Error for ChannelError {}

// ─── configuration ──────────────────────────────────────────────────

/// Channel-scoped options merged into the join payload. Deserializes from
/// partial JSON, absent fields falling back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Server acknowledges each broadcast push.
    pub broadcast_ack: bool,
    /// This client receives its own broadcasts back.
    pub broadcast_self: bool,
    pub presence_key: String,
    pub presence_enabled: bool,
    pub private: bool,
    /// Broadcast replay window, private channels only.
    pub replay: Option<Value>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            broadcast_ack: false,
            broadcast_self: false,
            presence_key: String::new(),
            presence_enabled: false,
            private: false,
            replay: None,
        }
    }
}

// ─── bindings ───────────────────────────────────────────────────────

/// Presence notification kinds a binding can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceListen {
    Sync,
    Join,
    Leave,
}

/// What a binding listens for. A closed union instead of raw event strings
/// so dispatch is an exhaustive match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingFilter {
    /// Broadcast by event name; `*` matches every broadcast.
    Broadcast { event: String },
    Presence(PresenceListen),
    /// Database change feed. `event` is `INSERT`/`UPDATE`/`DELETE` or `*`.
    PostgresChanges {
        event: String,
        schema: String,
        table: Option<String>,
        filter: Option<String>,
    },
    /// Connection-level system notices.
    System,
}

type BindingCallback = Arc<Mutex<dyn FnMut(&Payload) + Send>>;
type SubscribeCallback = Arc<Mutex<dyn FnMut(SubscribeStatus, Option<String>) + Send>>;

struct Binding {
    reference: u64,
    filter: BindingFilter,
    callback: BindingCallback,
    /// Server-assigned id, present on postgres bindings after a validated
    /// join.
    server_id: Option<u64>,
}

// ─── channel ────────────────────────────────────────────────────────

struct ChannelInner {
    status: ChannelState,
    joined_once: bool,
    /// Presence participation declared at the last join.
    joined_with_presence: bool,
    bindings: Vec<Binding>,
    next_binding_ref: u64,
    push_buffer: VecDeque<Arc<Push>>,
    /// Wire ref → push awaiting that reply.
    replies: HashMap<String, Arc<Push>>,
    presence: ChannelPresence,
    subscribe_callback: Option<SubscribeCallback>,
}

/// One subscribed topic on the shared connection.
pub struct Channel {
    topic: String,
    config: ChannelConfig,
    socket: Weak<dyn Socket>,
    default_timeout: Duration,
    join_push: Arc<Push>,
    rejoin_timer: BackoffTimer,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        topic: impl Into<String>,
        config: ChannelConfig,
        socket: Weak<dyn Socket>,
        default_timeout: Duration,
        rejoin_delay: Arc<DelayFn>,
    ) -> Result<Arc<Self>, ChannelError> {
        if config.replay.is_some() && !config.private {
            return Err(ChannelError::InvalidConfig(
                "replay requires a private channel",
            ));
        }
        let channel = Arc::new_cyclic(|weak: &Weak<Channel>| {
            let timer_ref = weak.clone();
            let rejoin_timer = BackoffTimer::new(
                Arc::new(move || {
                    if let Some(channel) = timer_ref.upgrade() {
                        channel.rejoin_tick();
                    }
                }),
                rejoin_delay,
            );
            Channel {
                topic: topic.into(),
                config,
                socket,
                default_timeout,
                join_push: Push::new(PHX_JOIN, Payload::empty(), default_timeout),
                rejoin_timer,
                inner: Mutex::new(ChannelInner {
                    status: ChannelState::Closed,
                    joined_once: false,
                    joined_with_presence: false,
                    bindings: Vec::new(),
                    next_binding_ref: 0,
                    push_buffer: VecDeque::new(),
                    replies: HashMap::new(),
                    presence: ChannelPresence::new(),
                    subscribe_callback: None,
                }),
            }
        });

        let weak = Arc::downgrade(&channel);
        channel.join_push.receive(PushStatus::Ok, {
            let weak = weak.clone();
            move |response| {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_join_ok(response);
                }
            }
        });
        channel.join_push.receive(PushStatus::Error, {
            let weak = weak.clone();
            move |response| {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_join_error(response);
                }
            }
        });
        channel.join_push.receive(PushStatus::Timeout, move |_| {
            if let Some(channel) = weak.upgrade() {
                channel.handle_join_timeout();
            }
        });
        Ok(channel)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().unwrap().status
    }

    /// Ref of the push that joined this channel, once sent.
    pub fn join_ref(&self) -> Option<String> {
        self.join_push.reference()
    }

    pub fn presence_state(&self) -> PresenceState {
        self.inner.lock().unwrap().presence.state().clone()
    }

    // ─── subscribe / unsubscribe ────────────────────────────────────

    /// Join the topic. The callback observes every lifecycle transition of
    /// this subscription.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl FnMut(SubscribeStatus, Option<String>) + Send + 'static,
        timeout: Option<Duration>,
    ) -> Result<(), ChannelError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.joined_once {
                return Err(ChannelError::AlreadySubscribed);
            }
            inner.joined_once = true;
            inner.subscribe_callback = Some(Arc::new(Mutex::new(callback)));
        }
        self.join_push.set_timeout(timeout);
        self.send_join();
        Ok(())
    }

    /// Leave the topic. Resolves `"ok"`, `"timed out"`, or `"error"`; the
    /// channel closes and deregisters either way. When the socket is down or
    /// the channel never joined, the leave resolves locally without a round
    /// trip.
    pub async fn unsubscribe(self: &Arc<Self>, timeout: Option<Duration>) -> &'static str {
        let timeout = timeout.unwrap_or(self.default_timeout);
        self.inner.lock().unwrap().status = ChannelState::Leaving;
        self.rejoin_timer.reset();
        // A join still in flight must not race the leave with a late timeout.
        if let Some(old_ref) = self.join_push.destroy() {
            self.inner.lock().unwrap().replies.remove(&old_ref);
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let leave = Push::new(PHX_LEAVE, Payload::empty(), timeout);
        for (status, outcome) in [
            (PushStatus::Ok, "ok"),
            (PushStatus::Timeout, "timed out"),
            (PushStatus::Error, "error"),
        ] {
            let tx = Arc::clone(&tx);
            let weak = Arc::downgrade(self);
            leave.receive(status, move |_| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(outcome);
                }
                if let Some(channel) = weak.upgrade() {
                    channel.close();
                }
            });
        }

        let connected = self
            .socket
            .upgrade()
            .map(|s| s.is_connected())
            .unwrap_or(false);
        if connected && self.join_push.is_sent() {
            self.send_push(&leave);
        } else {
            leave.trigger(PushStatus::Ok, json!({}));
        }
        rx.await.unwrap_or("ok")
    }

    // ─── bindings ───────────────────────────────────────────────────

    /// Register a binding; the returned ref removes it later.
    ///
    /// Adding a presence binding to a channel that joined without presence
    /// re-negotiates the join so the server starts tracking.
    pub fn on(
        self: &Arc<Self>,
        filter: BindingFilter,
        callback: impl FnMut(&Payload) + Send + 'static,
    ) -> u64 {
        let is_presence = matches!(filter, BindingFilter::Presence(_));
        let (reference, renegotiate) = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_binding_ref += 1;
            let reference = inner.next_binding_ref;
            inner.bindings.push(Binding {
                reference,
                filter,
                callback: Arc::new(Mutex::new(callback)),
                server_id: None,
            });
            let renegotiate = is_presence
                && inner.status == ChannelState::Joined
                && !inner.joined_with_presence;
            (reference, renegotiate)
        };
        if renegotiate {
            self.resubscribe();
        }
        reference
    }

    /// Remove every binding equal to `filter`.
    pub fn off(&self, filter: &BindingFilter) {
        let mut inner = self.inner.lock().unwrap();
        inner.bindings.retain(|b| &b.filter != filter);
    }

    /// Remove one binding by the ref `on` returned.
    pub fn off_ref(&self, reference: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.bindings.retain(|b| b.reference != reference);
    }

    // ─── outbound ───────────────────────────────────────────────────

    /// Send an event to the topic. Buffered while the channel cannot send;
    /// the buffer holds the newest [`PUSH_BUFFER_CAPACITY`] pushes.
    pub fn push(
        self: &Arc<Self>,
        event: impl Into<String>,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<Arc<Push>, ChannelError> {
        if !self.inner.lock().unwrap().joined_once {
            return Err(ChannelError::NotJoined);
        }
        let push = Push::new(event, payload, timeout.unwrap_or(self.default_timeout));
        if self.can_push() {
            self.send_push(&push);
        } else {
            push.start_timeout();
            let mut inner = self.inner.lock().unwrap();
            if inner.push_buffer.len() >= PUSH_BUFFER_CAPACITY {
                if let Some(evicted) = inner.push_buffer.pop_front() {
                    if let Some(old_ref) = evicted.destroy() {
                        inner.replies.remove(&old_ref);
                    }
                    log::warn!(
                        "channel `{}`: push buffer full, dropping oldest push `{}`",
                        self.topic,
                        evicted.event
                    );
                }
            }
            inner.push_buffer.push_back(Arc::clone(&push));
        }
        Ok(push)
    }

    // ─── inbound dispatch ───────────────────────────────────────────

    /// Deliver one decoded frame to this channel.
    pub fn trigger(
        self: &Arc<Self>,
        event: &str,
        payload: Payload,
        reference: Option<&str>,
        _join_ref: Option<&str>,
    ) {
        if RESERVED_EVENTS.contains(&event) {
            // Fence out lifecycle frames from a previous join attempt.
            if reference.is_some() && reference != self.join_ref().as_deref() {
                log::debug!(
                    "channel `{}`: dropping `{event}` with stale ref {reference:?}",
                    self.topic
                );
                return;
            }
        }

        match event {
            PHX_REPLY => {
                let push = reference.and_then(|r| {
                    let mut inner = self.inner.lock().unwrap();
                    inner.replies.remove(r)
                });
                match (push, payload.as_json()) {
                    (Some(push), Some(body)) => push.trigger_reply(body),
                    (Some(_), None) => {
                        log::warn!("channel `{}`: binary reply payload dropped", self.topic)
                    }
                    (None, _) => log::debug!(
                        "channel `{}`: reply with no waiting push (ref {reference:?})",
                        self.topic
                    ),
                }
            }
            PHX_ERROR => self.handle_remote_error(),
            PHX_CLOSE => self.close(),
            // Remaining lifecycle events are consumed by the state machine,
            // never delivered to bindings.
            PHX_JOIN | PHX_LEAVE => {}
            "presence_state" => {
                if let Some(body) = payload.as_json() {
                    let join_ref = self.join_ref();
                    let events = {
                        let mut inner = self.inner.lock().unwrap();
                        inner.presence.on_state(body, join_ref.as_deref())
                    };
                    self.dispatch_presence(events);
                }
            }
            "presence_diff" => {
                if let Some(body) = payload.as_json() {
                    let join_ref = self.join_ref();
                    let events = {
                        let mut inner = self.inner.lock().unwrap();
                        inner.presence.on_diff(body, join_ref.as_deref())
                    };
                    self.dispatch_presence(events);
                }
            }
            "postgres_changes" => self.dispatch_postgres(&payload),
            "broadcast" => {
                let sub_event = payload
                    .as_json()
                    .and_then(|v| v.get("event"))
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                self.dispatch(&payload, |binding| match &binding.filter {
                    BindingFilter::Broadcast { event } => {
                        event == "*" || Some(event.as_str()) == sub_event.as_deref()
                    }
                    _ => false,
                });
            }
            "system" => {
                self.dispatch(&payload, |binding| binding.filter == BindingFilter::System);
            }
            other => {
                // Plain server-pushed events match broadcast bindings by name.
                self.dispatch(&payload, |binding| match &binding.filter {
                    BindingFilter::Broadcast { event } => event == "*" || event == other,
                    _ => false,
                });
            }
        }
    }

    // ─── connection notifications ───────────────────────────────────

    /// The transport (re)opened; errored channels rejoin immediately.
    pub(crate) fn on_socket_open(self: &Arc<Self>) {
        if self.state() == ChannelState::Errored {
            self.rejoin_timer.reset();
            self.send_join();
        }
    }

    // ─── internals ──────────────────────────────────────────────────

    fn can_push(&self) -> bool {
        let connected = self
            .socket
            .upgrade()
            .map(|s| s.is_connected())
            .unwrap_or(false);
        connected && self.state() == ChannelState::Joined
    }

    /// Rejoin backoff fired. Only meaningful while errored; when the socket
    /// is still down, back off again.
    fn rejoin_tick(self: &Arc<Self>) {
        if self.state() != ChannelState::Errored {
            return;
        }
        let connected = self
            .socket
            .upgrade()
            .map(|s| s.is_connected())
            .unwrap_or(false);
        if connected {
            self.send_join();
        } else {
            self.rejoin_timer.schedule_timeout();
        }
    }

    fn build_join_payload(&self) -> Payload {
        let (has_presence_binding, filters) = {
            let inner = self.inner.lock().unwrap();
            let has_presence = inner
                .bindings
                .iter()
                .any(|b| matches!(b.filter, BindingFilter::Presence(_)));
            let filters: Vec<Value> = inner
                .bindings
                .iter()
                .filter_map(|b| match &b.filter {
                    BindingFilter::PostgresChanges {
                        event,
                        schema,
                        table,
                        filter,
                    } => {
                        let mut entry = Map::new();
                        entry.insert("event".into(), json!(event));
                        entry.insert("schema".into(), json!(schema));
                        if let Some(table) = table {
                            entry.insert("table".into(), json!(table));
                        }
                        if let Some(filter) = filter {
                            entry.insert("filter".into(), json!(filter));
                        }
                        Some(Value::Object(entry))
                    }
                    _ => None,
                })
                .collect();
            (has_presence, filters)
        };
        let presence_enabled = self.config.presence_enabled || has_presence_binding;
        self.inner.lock().unwrap().joined_with_presence = presence_enabled;

        let mut broadcast = Map::new();
        broadcast.insert("ack".into(), json!(self.config.broadcast_ack));
        broadcast.insert("self".into(), json!(self.config.broadcast_self));
        if let Some(replay) = &self.config.replay {
            broadcast.insert("replay".into(), replay.clone());
        }
        let mut body = Map::new();
        body.insert(
            "config".into(),
            json!({
                "broadcast": broadcast,
                "presence": {
                    "key": self.config.presence_key,
                    "enabled": presence_enabled,
                },
                "private": self.config.private,
            }),
        );
        if !filters.is_empty() {
            body.insert("postgres_changes".into(), Value::Array(filters));
        }
        if let Some(token) = self.socket.upgrade().and_then(|s| s.access_token()) {
            body.insert("access_token".into(), json!(token));
        }
        Payload::Json(Value::Object(body))
    }

    /// (Re)send the join push with a fresh ref and a freshly built payload
    /// (the access token may have rotated between attempts).
    fn send_join(self: &Arc<Self>) {
        let Some(socket) = self.socket.upgrade() else {
            return;
        };
        self.join_push.set_payload(self.build_join_payload());
        let reference = socket.make_ref();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.status = ChannelState::Joining;
            if let Some(old_ref) = self.join_push.reset() {
                inner.replies.remove(&old_ref);
            }
            self.join_push.prepare_send(reference.clone());
            inner
                .replies
                .insert(reference.clone(), Arc::clone(&self.join_push));
        }
        self.join_push.start_timeout();
        socket.push_message(Message::new(
            Some(reference.clone()),
            Some(reference),
            self.topic.clone(),
            PHX_JOIN,
            self.join_push.payload(),
        ));
    }

    fn send_push(self: &Arc<Self>, push: &Arc<Push>) {
        let Some(socket) = self.socket.upgrade() else {
            return;
        };
        let reference = socket.make_ref();
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(old_ref) = push.reset() {
                inner.replies.remove(&old_ref);
            }
            push.prepare_send(reference.clone());
            inner.replies.insert(reference.clone(), Arc::clone(push));
        }
        push.start_timeout();
        socket.push_message(Message::new(
            self.join_ref(),
            Some(reference),
            self.topic.clone(),
            push.event.clone(),
            push.payload(),
        ));
    }

    fn handle_join_ok(self: &Arc<Self>, response: &Value) {
        match response.get("postgres_changes") {
            None => self.finalize_join(&[]),
            Some(server_list) => {
                let server_list = server_list.as_array().cloned().unwrap_or_default();
                let matched = {
                    let inner = self.inner.lock().unwrap();
                    verify_server_filters(&inner.bindings, &server_list)
                };
                match matched {
                    Some(ids) => self.finalize_join(&ids),
                    None => self.fail_join_mismatch(),
                }
            }
        }
    }

    /// Join acknowledged and (if requested) filters validated. Enrich
    /// postgres bindings with server ids, flush the buffer, notify.
    fn finalize_join(self: &Arc<Self>, server_ids: &[u64]) {
        self.rejoin_timer.reset();
        let (buffered, callback) = {
            let mut inner = self.inner.lock().unwrap();
            inner.status = ChannelState::Joined;
            let mut ids = server_ids.iter();
            for binding in inner
                .bindings
                .iter_mut()
                .filter(|b| matches!(b.filter, BindingFilter::PostgresChanges { .. }))
            {
                binding.server_id = ids.next().copied();
            }
            let buffered: Vec<Arc<Push>> = inner.push_buffer.drain(..).collect();
            (buffered, inner.subscribe_callback.clone())
        };
        for push in buffered {
            self.send_push(&push);
        }
        if let Some(callback) = callback {
            (callback.lock().unwrap())(SubscribeStatus::Subscribed, None);
        }
    }

    /// The server's validated filter list disagrees with ours: we cannot
    /// trust which changes would arrive, so the subscription is abandoned.
    fn fail_join_mismatch(self: &Arc<Self>) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            inner.status = ChannelState::Errored;
            inner.subscribe_callback.clone()
        };
        if let Some(socket) = self.socket.upgrade() {
            socket.push_message(Message::new(
                self.join_ref(),
                Some(socket.make_ref()),
                self.topic.clone(),
                PHX_LEAVE,
                Payload::empty(),
            ));
        }
        if let Some(callback) = callback {
            (callback.lock().unwrap())(
                SubscribeStatus::ChannelError,
                Some("mismatch between server and client bindings".to_string()),
            );
        }
    }

    fn handle_join_error(self: &Arc<Self>, response: &Value) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.status, ChannelState::Leaving | ChannelState::Closed) {
                return;
            }
            inner.status = ChannelState::Errored;
            inner.subscribe_callback.clone()
        };
        self.rejoin_timer.schedule_timeout();
        if let Some(callback) = callback {
            (callback.lock().unwrap())(
                SubscribeStatus::ChannelError,
                Some(response.to_string()),
            );
        }
    }

    fn handle_join_timeout(self: &Arc<Self>) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status != ChannelState::Joining {
                return;
            }
            inner.status = ChannelState::Errored;
            inner.subscribe_callback.clone()
        };
        log::debug!("channel `{}`: join timed out", self.topic);
        self.rejoin_timer.schedule_timeout();
        if let Some(callback) = callback {
            (callback.lock().unwrap())(SubscribeStatus::TimedOut, None);
        }
    }

    /// `phx_error` from the server or a transport failure.
    fn handle_remote_error(self: &Arc<Self>) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.status, ChannelState::Leaving | ChannelState::Closed) {
                return;
            }
            inner.status = ChannelState::Errored;
            if let Some(old_ref) = self.join_push.reset() {
                inner.replies.remove(&old_ref);
            }
            inner.subscribe_callback.clone()
        };
        self.rejoin_timer.schedule_timeout();
        if let Some(callback) = callback {
            (callback.lock().unwrap())(SubscribeStatus::ChannelError, None);
        }
    }

    /// Terminal close: cancel everything and deregister from the connection.
    fn close(self: &Arc<Self>) {
        self.rejoin_timer.reset();
        self.join_push.destroy();
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status == ChannelState::Closed {
                return;
            }
            inner.status = ChannelState::Closed;
            for push in inner.push_buffer.drain(..).collect::<Vec<_>>() {
                push.destroy();
            }
            inner.replies.clear();
            inner.presence.reset();
            inner.subscribe_callback.clone()
        };
        if let Some(socket) = self.socket.upgrade() {
            socket.remove_channel(&self.topic);
        }
        if let Some(callback) = callback {
            (callback.lock().unwrap())(SubscribeStatus::Closed, None);
        }
    }

    /// Leave and rejoin in place so the server picks up a changed join
    /// payload (used when presence tracking is enabled after joining).
    fn resubscribe(self: &Arc<Self>) {
        if let Some(socket) = self.socket.upgrade() {
            socket.push_message(Message::new(
                self.join_ref(),
                Some(socket.make_ref()),
                self.topic.clone(),
                PHX_LEAVE,
                Payload::empty(),
            ));
        }
        self.inner.lock().unwrap().presence.reset();
        self.send_join();
    }

    fn dispatch(&self, payload: &Payload, matches: impl Fn(&Binding) -> bool) {
        let callbacks: Vec<BindingCallback> = {
            let inner = self.inner.lock().unwrap();
            inner
                .bindings
                .iter()
                .filter(|b| matches(b))
                .map(|b| Arc::clone(&b.callback))
                .collect()
        };
        for callback in callbacks {
            (callback.lock().unwrap())(payload);
        }
    }

    fn dispatch_presence(&self, events: Vec<PresenceEvent>) {
        for event in events {
            let (listen, body) = match event {
                PresenceEvent::Sync => {
                    let state = {
                        let inner = self.inner.lock().unwrap();
                        state_json(inner.presence.state())
                    };
                    (PresenceListen::Sync, state)
                }
                PresenceEvent::Join { key, current, new } => (
                    PresenceListen::Join,
                    json!({
                        "key": key,
                        "current": metas_json(&current),
                        "new": metas_json(&new),
                    }),
                ),
                PresenceEvent::Leave { key, current, left } => (
                    PresenceListen::Leave,
                    json!({
                        "key": key,
                        "current": metas_json(&current),
                        "left": metas_json(&left),
                    }),
                ),
            };
            let payload = Payload::Json(body);
            self.dispatch(&payload, |binding| {
                binding.filter == BindingFilter::Presence(listen)
            });
        }
    }

    /// Database change frames carry the server ids of the bindings they were
    /// produced for; match on id plus event type, then reshape the payload.
    fn dispatch_postgres(&self, payload: &Payload) {
        let Some(body) = payload.as_json() else {
            return;
        };
        let ids: Vec<u64> = body
            .get("ids")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        let Some(data) = body.get("data") else {
            return;
        };
        let change_type = data.get("type").and_then(Value::as_str).unwrap_or("");
        let shaped = Payload::Json(shape_postgres_change(data));
        self.dispatch(&shaped, |binding| match (&binding.filter, binding.server_id) {
            (BindingFilter::PostgresChanges { event, .. }, Some(id)) => {
                ids.contains(&id)
                    && (event == "*" || event.eq_ignore_ascii_case(change_type))
            }
            _ => false,
        });
    }
}

// ─── helpers ────────────────────────────────────────────────────────

/// Positional comparison of the server's validated filter list against the
/// locally registered postgres bindings. Returns the server ids in binding
/// order on a full match.
fn verify_server_filters(bindings: &[Binding], server_list: &[Value]) -> Option<Vec<u64>> {
    let locals: Vec<&BindingFilter> = bindings
        .iter()
        .filter(|b| matches!(b.filter, BindingFilter::PostgresChanges { .. }))
        .map(|b| &b.filter)
        .collect();
    if locals.len() != server_list.len() {
        return None;
    }
    let mut ids = Vec::with_capacity(locals.len());
    for (local, server) in locals.iter().zip(server_list) {
        let BindingFilter::PostgresChanges {
            event,
            schema,
            table,
            filter,
        } = local
        else {
            return None;
        };
        let field = |name: &str| server.get(name).and_then(Value::as_str).unwrap_or("");
        // Absent and empty-string are the same "no constraint".
        if field("event") != event
            || field("schema") != schema
            || field("table") != table.as_deref().unwrap_or("")
            || field("filter") != filter.as_deref().unwrap_or("")
        {
            return None;
        }
        ids.push(server.get("id").and_then(Value::as_u64)?);
    }
    Some(ids)
}

/// Reshape an inbound change record for delivery: `type` becomes
/// `eventType`, `record` surfaces as `new` only for INSERT/UPDATE, and
/// `old_record` as `old` only for UPDATE/DELETE.
fn shape_postgres_change(data: &Value) -> Value {
    let change_type = data.get("type").and_then(Value::as_str).unwrap_or("");
    let mut shaped = Map::new();
    for key in ["schema", "table", "commit_timestamp", "errors"] {
        shaped.insert(key.into(), data.get(key).cloned().unwrap_or(Value::Null));
    }
    shaped.insert("eventType".into(), json!(change_type));
    let new = match change_type {
        "INSERT" | "UPDATE" => data.get("record").cloned().unwrap_or(Value::Null),
        _ => json!({}),
    };
    let old = match change_type {
        "UPDATE" | "DELETE" => data.get("old_record").cloned().unwrap_or(Value::Null),
        _ => json!({}),
    };
    shaped.insert("new".into(), new);
    shaped.insert("old".into(), old);
    Value::Object(shaped)
}

fn metas_json(metas: &[PresenceMeta]) -> Value {
    Value::Array(
        metas
            .iter()
            .map(|meta| {
                let mut obj = match &meta.payload {
                    Value::Object(map) => map.clone(),
                    other => {
                        let mut map = Map::new();
                        if !other.is_null() {
                            map.insert("payload".into(), other.clone());
                        }
                        map
                    }
                };
                obj.insert("presence_ref".into(), json!(meta.presence_ref));
                Value::Object(obj)
            })
            .collect(),
    )
}

fn state_json(state: &PresenceState) -> Value {
    Value::Object(
        state
            .iter()
            .map(|(key, metas)| (key.clone(), metas_json(metas)))
            .collect(),
    )
}
