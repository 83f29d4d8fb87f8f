//! One outbound request awaiting a correlated reply.
//!
//! A push moves through unsent → sent (timeout armed) → exactly one terminal
//! status (`ok`, `error`, `timeout`). Hooks are registered per status; once a
//! reply is recorded, hooks for other statuses never fire, and a hook
//! registered late for the already-received status fires immediately.

use crate::protocol::Payload;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Terminal status of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Ok,
    Error,
    Timeout,
}

impl PushStatus {
    pub fn from_wire(status: &str) -> Option<Self> {
        match status {
            "ok" => Some(Self::Ok),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

/// The recorded reply of a push.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: PushStatus,
    pub response: Value,
}

type Hook = Arc<Mutex<dyn FnMut(&Value) + Send>>;

struct PushState {
    payload: Payload,
    timeout: Duration,
    reference: Option<String>,
    sent: bool,
    received: Option<Reply>,
    hooks: Vec<(PushStatus, Hook)>,
    timeout_handle: Option<AbortHandle>,
}

/// An in-flight request owned by a channel.
pub struct Push {
    pub(crate) event: String,
    state: Mutex<PushState>,
}

impl Push {
    pub(crate) fn new(event: impl Into<String>, payload: Payload, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            event: event.into(),
            state: Mutex::new(PushState {
                payload,
                timeout,
                reference: None,
                sent: false,
                received: None,
                hooks: Vec::new(),
                timeout_handle: None,
            }),
        })
    }

    /// Register a hook for a terminal status.
    ///
    /// If that status was already received the hook runs now, synchronously.
    pub fn receive(self: &Arc<Self>, status: PushStatus, hook: impl FnMut(&Value) + Send + 'static) {
        let hook: Hook = Arc::new(Mutex::new(hook));
        let immediate = {
            let mut state = self.state.lock().unwrap();
            match &state.received {
                Some(reply) if reply.status == status => Some(reply.response.clone()),
                _ => {
                    state.hooks.push((status, Arc::clone(&hook)));
                    None
                }
            }
        };
        if let Some(response) = immediate {
            (hook.lock().unwrap())(&response);
        }
    }

    /// Record a terminal status and run its hooks. A second trigger after a
    /// reply is recorded is a no-op.
    pub(crate) fn trigger(&self, status: PushStatus, response: Value) {
        let hooks: Vec<Hook> = {
            let mut state = self.state.lock().unwrap();
            if state.received.is_some() {
                return;
            }
            if let Some(handle) = state.timeout_handle.take() {
                handle.abort();
            }
            state.received = Some(Reply {
                status,
                response: response.clone(),
            });
            state
                .hooks
                .iter()
                .filter(|(s, _)| *s == status)
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };
        for hook in hooks {
            (hook.lock().unwrap())(&response);
        }
    }

    /// Interpret a raw reply payload (`{"status": .., "response": ..}`).
    pub(crate) fn trigger_reply(&self, payload: &Value) {
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .and_then(PushStatus::from_wire);
        let response = payload.get("response").cloned().unwrap_or(json!({}));
        match status {
            Some(status) => self.trigger(status, response),
            None => log::warn!(
                "push `{}` got reply with unknown status: {payload}",
                self.event
            ),
        }
    }

    /// Assign the wire ref and mark sent. Any previous reply is cleared so a
    /// resend starts a fresh cycle.
    pub(crate) fn prepare_send(&self, reference: String) {
        let mut state = self.state.lock().unwrap();
        state.reference = Some(reference);
        state.received = None;
        state.sent = true;
    }

    /// Arm the timeout task. The task holds a weak handle so a dropped push
    /// cannot be resurrected by its own timer.
    pub(crate) fn start_timeout(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if let Some(handle) = state.timeout_handle.take() {
            handle.abort();
        }
        let timeout = state.timeout;
        let weak: Weak<Push> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(push) = weak.upgrade() {
                push.trigger(PushStatus::Timeout, json!({}));
            }
        });
        state.timeout_handle = Some(task.abort_handle());
    }

    /// Clear ref, reply slot, and timeout ahead of a resend. Returns the old
    /// ref so the owner can drop its reply registration.
    pub(crate) fn reset(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        if let Some(handle) = state.timeout_handle.take() {
            handle.abort();
        }
        state.sent = false;
        state.received = None;
        state.reference.take()
    }

    /// Cancel the timeout so a channel leaving mid-flight leaks no timer.
    pub(crate) fn destroy(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        if let Some(handle) = state.timeout_handle.take() {
            handle.abort();
        }
        state.reference.clone()
    }

    pub fn reference(&self) -> Option<String> {
        self.state.lock().unwrap().reference.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.state.lock().unwrap().timeout
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        self.state.lock().unwrap().timeout = timeout;
    }

    pub(crate) fn payload(&self) -> Payload {
        self.state.lock().unwrap().payload.clone()
    }

    /// Replace the payload (the join push refreshes its access token between
    /// attempts).
    pub(crate) fn set_payload(&self, payload: Payload) {
        self.state.lock().unwrap().payload = payload;
    }

    pub fn is_sent(&self) -> bool {
        self.state.lock().unwrap().sent
    }
}

impl Drop for Push {
    fn drop(&mut self) {
        if let Some(handle) = self.state.lock().unwrap().timeout_handle.take() {
            handle.abort();
        }
    }
}
