//! Presence reconciliation: pure state/diff merging plus the per-channel
//! tracker that orders diffs behind the first snapshot of a join generation.
//!
//! ```text
//! presence_state ──► sync_state ──┐
//!                                 ├──► {joins, leaves} ──► sync_diff ──► state
//! presence_diff  ─────────────────┘         │
//!                                           ▼
//!                              on_join / on_leave callbacks
//! ```
//!
//! Both entry points funnel through `sync_diff` so there is exactly one
//! mutation path. A diff that arrives before the first snapshot of the
//! current join generation is buffered and replayed in arrival order once the
//! snapshot lands; applying it early would double-apply joins or mutate a
//! stale baseline after a reconnect.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// One device's presence record, identified by a server-assigned ref that is
/// unique within its key's list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceMeta {
    pub presence_ref: String,
    /// Remaining user metadata, with the wire refs stripped.
    pub payload: Value,
}

/// Presence key → ordered device records.
pub type PresenceState = HashMap<String, Vec<PresenceMeta>>;

/// A reconciliation delta keyed like the state itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PresenceDiff {
    pub joins: PresenceState,
    pub leaves: PresenceState,
}

/// Callback signature for join/leave notifications:
/// `(key, current_or_previous_records, changed_records)`.
pub type PresenceCallback<'a> = &'a mut dyn FnMut(&str, &[PresenceMeta], &[PresenceMeta]);

// ───────────────────────────────────────────────────────────────────
// Wire normalization
// ───────────────────────────────────────────────────────────────────

/// Parse a raw snapshot (`{key: {"metas": [{"phx_ref": ..}, ..]}}`) into
/// normalized state, exposing `presence_ref` and dropping the wire ref keys.
pub fn normalize_state(raw: &Value) -> PresenceState {
    let mut state = PresenceState::new();
    let Some(entries) = raw.as_object() else {
        return state;
    };
    for (key, value) in entries {
        let metas = normalize_metas(value);
        if !metas.is_empty() {
            state.insert(key.clone(), metas);
        }
    }
    state
}

/// Parse a raw diff (`{"joins": .., "leaves": ..}`).
pub fn normalize_diff(raw: &Value) -> PresenceDiff {
    PresenceDiff {
        joins: raw.get("joins").map(normalize_state).unwrap_or_default(),
        leaves: raw.get("leaves").map(normalize_state).unwrap_or_default(),
    }
}

fn normalize_metas(value: &Value) -> Vec<PresenceMeta> {
    let Some(metas) = value.get("metas").and_then(Value::as_array) else {
        return Vec::new();
    };
    metas
        .iter()
        .filter_map(|meta| {
            let obj = meta.as_object()?;
            let presence_ref = obj.get("phx_ref")?.as_str()?.to_string();
            let payload: Map<String, Value> = obj
                .iter()
                .filter(|(k, _)| k.as_str() != "phx_ref" && k.as_str() != "phx_ref_prev")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Some(PresenceMeta {
                presence_ref,
                payload: Value::Object(payload),
            })
        })
        .collect()
}

// ───────────────────────────────────────────────────────────────────
// Reconciliation
// ───────────────────────────────────────────────────────────────────

/// Reconcile a full snapshot against `current`, reporting per-key joins and
/// leaves by ref, then applying them through [`sync_diff`].
pub fn sync_state(
    current: &PresenceState,
    incoming: PresenceState,
    on_join: PresenceCallback<'_>,
    on_leave: PresenceCallback<'_>,
) -> PresenceState {
    let mut state = current.clone();
    let mut diff = PresenceDiff::default();

    // Keys gone from the snapshot are wholesale leaves.
    for (key, metas) in &state {
        if !incoming.contains_key(key) {
            diff.leaves.insert(key.clone(), metas.clone());
        }
    }

    for (key, new_metas) in incoming {
        match state.get(&key) {
            Some(cur_metas) => {
                let new_refs: HashSet<&str> =
                    new_metas.iter().map(|m| m.presence_ref.as_str()).collect();
                let cur_refs: HashSet<&str> =
                    cur_metas.iter().map(|m| m.presence_ref.as_str()).collect();
                let joined: Vec<PresenceMeta> = new_metas
                    .iter()
                    .filter(|m| !cur_refs.contains(m.presence_ref.as_str()))
                    .cloned()
                    .collect();
                let left: Vec<PresenceMeta> = cur_metas
                    .iter()
                    .filter(|m| !new_refs.contains(m.presence_ref.as_str()))
                    .cloned()
                    .collect();
                if !joined.is_empty() {
                    diff.joins.insert(key.clone(), joined);
                }
                if !left.is_empty() {
                    diff.leaves.insert(key.clone(), left);
                }
            }
            None => {
                diff.joins.insert(key, new_metas);
            }
        }
    }

    sync_diff(&mut state, &diff, on_join, on_leave);
    state
}

/// Apply a join/leave delta in place.
///
/// Joins store the new records first and keep any pre-existing records whose
/// refs are not superseded (multi-device presence survives partial updates).
/// Leaves remove exactly the named refs and drop the key once empty.
pub fn sync_diff(
    state: &mut PresenceState,
    diff: &PresenceDiff,
    on_join: PresenceCallback<'_>,
    on_leave: PresenceCallback<'_>,
) {
    for (key, new_metas) in &diff.joins {
        let previous = state.get(key).cloned().unwrap_or_default();
        let new_refs: HashSet<&str> = new_metas.iter().map(|m| m.presence_ref.as_str()).collect();
        let mut merged = new_metas.clone();
        merged.extend(
            previous
                .iter()
                .filter(|m| !new_refs.contains(m.presence_ref.as_str()))
                .cloned(),
        );
        state.insert(key.clone(), merged);
        on_join(key, &previous, new_metas);
    }

    for (key, left_metas) in &diff.leaves {
        let Some(cur_metas) = state.get_mut(key) else {
            continue;
        };
        let left_refs: HashSet<&str> =
            left_metas.iter().map(|m| m.presence_ref.as_str()).collect();
        cur_metas.retain(|m| !left_refs.contains(m.presence_ref.as_str()));
        let remaining = cur_metas.clone();
        on_leave(key, &remaining, left_metas);
        if remaining.is_empty() {
            state.remove(key);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Per-channel tracker
// ───────────────────────────────────────────────────────────────────

/// Presence notification produced for channel bindings.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Sync,
    Join {
        key: String,
        current: Vec<PresenceMeta>,
        new: Vec<PresenceMeta>,
    },
    Leave {
        key: String,
        current: Vec<PresenceMeta>,
        left: Vec<PresenceMeta>,
    },
}

/// Presence bookkeeping for one channel.
///
/// Tracks which join generation the last applied snapshot belonged to and
/// parks early diffs until that snapshot arrives.
#[derive(Default)]
pub(crate) struct ChannelPresence {
    state: PresenceState,
    pending_diffs: Vec<Value>,
    join_ref: Option<String>,
}

impl ChannelPresence {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> &PresenceState {
        &self.state
    }

    fn in_pending_sync_state(&self, channel_join_ref: Option<&str>) -> bool {
        self.join_ref.is_none() || self.join_ref.as_deref() != channel_join_ref
    }

    /// Apply a full snapshot, then replay any parked diffs in arrival order.
    pub(crate) fn on_state(
        &mut self,
        raw: &Value,
        channel_join_ref: Option<&str>,
    ) -> Vec<PresenceEvent> {
        let incoming = normalize_state(raw);
        let mut joins = Vec::new();
        let mut leaves = Vec::new();
        self.state = sync_state(
            &self.state,
            incoming,
            &mut |key, current, new| {
                joins.push(PresenceEvent::Join {
                    key: key.to_string(),
                    current: current.to_vec(),
                    new: new.to_vec(),
                });
            },
            &mut |key, current, left| {
                leaves.push(PresenceEvent::Leave {
                    key: key.to_string(),
                    current: current.to_vec(),
                    left: left.to_vec(),
                });
            },
        );
        // sync_diff fires every join before any leave, so concatenating the
        // two accumulators reproduces callback order.
        let mut events = joins;
        events.append(&mut leaves);
        self.join_ref = channel_join_ref.map(str::to_owned);

        let parked = std::mem::take(&mut self.pending_diffs);
        for raw_diff in &parked {
            events.extend(self.apply_diff(raw_diff));
        }
        events.push(PresenceEvent::Sync);
        events
    }

    /// Apply a diff, or park it if the snapshot for this join generation has
    /// not arrived yet.
    pub(crate) fn on_diff(
        &mut self,
        raw: &Value,
        channel_join_ref: Option<&str>,
    ) -> Vec<PresenceEvent> {
        if self.in_pending_sync_state(channel_join_ref) {
            log::debug!("presence diff ahead of snapshot, buffering");
            self.pending_diffs.push(raw.clone());
            return Vec::new();
        }
        let mut events = self.apply_diff(raw);
        events.push(PresenceEvent::Sync);
        events
    }

    /// Drop all state ahead of a rejoin; the next snapshot rebuilds it.
    pub(crate) fn reset(&mut self) {
        self.state.clear();
        self.pending_diffs.clear();
        self.join_ref = None;
    }

    fn apply_diff(&mut self, raw: &Value) -> Vec<PresenceEvent> {
        let diff = normalize_diff(raw);
        let mut joins = Vec::new();
        let mut leaves = Vec::new();
        sync_diff(
            &mut self.state,
            &diff,
            &mut |key, current, new| {
                joins.push(PresenceEvent::Join {
                    key: key.to_string(),
                    current: current.to_vec(),
                    new: new.to_vec(),
                });
            },
            &mut |key, current, left| {
                leaves.push(PresenceEvent::Leave {
                    key: key.to_string(),
                    current: current.to_vec(),
                    left: left.to_vec(),
                });
            },
        );
        let mut events = joins;
        events.append(&mut leaves);
        events
    }
}
