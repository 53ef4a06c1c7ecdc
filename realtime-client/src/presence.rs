//! Replicated presence state
//!
//! `sync_state` and `sync_diff` merge server snapshots and diffs into a
//! local map of presence key to metas. `Presence` binds them to a channel:
//! diffs that arrive before the first snapshot of the current join are held
//! back and applied right after that snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use realtime_common::types::{events, Payload};

use crate::channel::ChannelInner;

/// One connection's entry under a presence key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub presence_ref: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Presence key to metas, in first-seen order per key
pub type PresenceState = BTreeMap<String, Vec<PresenceMeta>>;

/// Joins and leaves received in one `presence_diff`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceDiff {
    pub joins: PresenceState,
    pub leaves: PresenceState,
}

/// Presence event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Metas joined under `key`
    Join {
        key: String,
        #[serde(rename = "currentPresences")]
        current: Vec<PresenceMeta>,
        #[serde(rename = "newPresences")]
        joined: Vec<PresenceMeta>,
    },
    /// Metas left `key`
    Leave {
        key: String,
        #[serde(rename = "currentPresences")]
        current: Vec<PresenceMeta>,
        #[serde(rename = "leftPresences")]
        left: Vec<PresenceMeta>,
    },
    /// A snapshot or diff was fully applied
    Sync,
}

fn refs(metas: &[PresenceMeta]) -> Vec<&str> {
    metas.iter().map(|m| m.presence_ref.as_str()).collect()
}

/// Merge a full snapshot into `current`, reporting what joined and left.
/// The result holds exactly the metas of `new_state`.
pub fn sync_state<J, L>(
    current: &PresenceState,
    new_state: &PresenceState,
    on_join: J,
    on_leave: L,
) -> PresenceState
where
    J: FnMut(&str, &[PresenceMeta], &[PresenceMeta]),
    L: FnMut(&str, &[PresenceMeta], &[PresenceMeta]),
{
    let state = current.clone();
    let mut diff = PresenceDiff::default();

    for (key, presences) in &state {
        if !new_state.contains_key(key) {
            diff.leaves.insert(key.clone(), presences.clone());
        }
    }

    for (key, new_presences) in new_state {
        match state.get(key) {
            Some(current_presences) => {
                let new_refs = refs(new_presences);
                let current_refs = refs(current_presences);
                let joined: Vec<PresenceMeta> = new_presences
                    .iter()
                    .filter(|m| !current_refs.contains(&m.presence_ref.as_str()))
                    .cloned()
                    .collect();
                let left: Vec<PresenceMeta> = current_presences
                    .iter()
                    .filter(|m| !new_refs.contains(&m.presence_ref.as_str()))
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
                diff.joins.insert(key.clone(), new_presences.clone());
            }
        }
    }

    sync_diff(state, &diff, on_join, on_leave)
}

/// Apply one diff: joins append to their key, leaves remove by
/// `presence_ref` and drop keys left without metas.
pub fn sync_diff<J, L>(
    mut state: PresenceState,
    diff: &PresenceDiff,
    mut on_join: J,
    mut on_leave: L,
) -> PresenceState
where
    J: FnMut(&str, &[PresenceMeta], &[PresenceMeta]),
    L: FnMut(&str, &[PresenceMeta], &[PresenceMeta]),
{
    for (key, new_presences) in &diff.joins {
        let current = state.get(key).cloned().unwrap_or_default();
        let joined_refs = refs(new_presences);
        let mut merged: Vec<PresenceMeta> = current
            .iter()
            .filter(|m| !joined_refs.contains(&m.presence_ref.as_str()))
            .cloned()
            .collect();
        merged.extend(new_presences.iter().cloned());
        state.insert(key.clone(), merged);
        on_join(key, &current, new_presences);
    }

    for (key, left_presences) in &diff.leaves {
        let Some(current) = state.get_mut(key) else {
            continue;
        };
        let left_refs = refs(left_presences);
        current.retain(|m| !left_refs.contains(&m.presence_ref.as_str()));
        let remaining = current.clone();
        on_leave(key, &remaining, left_presences);
        if remaining.is_empty() {
            state.remove(key);
        }
    }

    state
}

/// Convert the wire shape `{key: {metas: [{phx_ref, ...}]}}` into a
/// `PresenceState`. Entries already in `{key: [meta]}` form pass through.
pub fn transform_state(raw: &Value) -> PresenceState {
    let mut state = PresenceState::new();
    let Some(entries) = raw.as_object() else {
        return state;
    };

    for (key, presences) in entries {
        let metas = presences.get("metas").unwrap_or(presences);
        let Some(metas) = metas.as_array() else {
            continue;
        };
        let parsed = metas
            .iter()
            .filter_map(|meta| {
                let mut fields = meta.as_object()?.clone();
                if let Some(phx_ref) = fields.remove("phx_ref") {
                    fields.insert("presence_ref".to_string(), phx_ref);
                }
                fields.remove("phx_ref_prev");
                match serde_json::from_value::<PresenceMeta>(Value::Object(fields)) {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        warn!("Skipping presence meta under {}: {}", key, e);
                        None
                    }
                }
            })
            .collect();
        state.insert(key.clone(), parsed);
    }
    state
}

type PresenceCallback = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;

struct PresenceInner {
    state: PresenceState,
    pending_diffs: Vec<PresenceDiff>,
    join_ref: Option<String>,
    state_event: String,
    diff_event: String,
}

/// Presence bound to one channel
pub struct Presence {
    channel: Weak<ChannelInner>,
    inner: Mutex<PresenceInner>,
    callbacks: RwLock<Vec<PresenceCallback>>,
}

impl Presence {
    pub(crate) fn new(channel: Weak<ChannelInner>) -> Self {
        Self {
            channel,
            inner: Mutex::new(PresenceInner {
                state: PresenceState::new(),
                pending_diffs: Vec::new(),
                join_ref: None,
                state_event: events::PRESENCE_STATE.to_string(),
                diff_event: events::PRESENCE_DIFF.to_string(),
            }),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Listen for snapshots and diffs under custom event names
    pub fn set_events(&self, state_event: &str, diff_event: &str) {
        let mut inner = self.inner.lock();
        inner.state_event = state_event.to_string();
        inner.diff_event = diff_event.to_string();
    }

    /// Current merged state
    pub fn state(&self) -> PresenceState {
        self.inner.lock().state.clone()
    }

    /// Diffs held back until the next snapshot
    pub fn pending_diffs(&self) -> usize {
        self.inner.lock().pending_diffs.len()
    }

    /// True until a snapshot for the channel's current join has arrived
    pub fn in_pending_sync_state(&self) -> bool {
        let channel_join_ref = self.channel.upgrade().and_then(|c| c.join_ref());
        let inner = self.inner.lock();
        inner.join_ref.is_none() || inner.join_ref != channel_join_ref
    }

    /// Register a callback for every join, leave and sync
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    pub fn on_join<F>(&self, callback: F)
    where
        F: Fn(&str, &[PresenceMeta], &[PresenceMeta]) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let PresenceEvent::Join {
                key,
                current,
                joined,
            } = event
            {
                callback(key, current, joined);
            }
        });
    }

    pub fn on_leave<F>(&self, callback: F)
    where
        F: Fn(&str, &[PresenceMeta], &[PresenceMeta]) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let PresenceEvent::Leave { key, current, left } = event {
                callback(key, current, left);
            }
        });
    }

    pub fn on_sync<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if matches!(event, PresenceEvent::Sync) {
                callback();
            }
        });
    }

    /// Feed a channel event; anything other than a snapshot or diff is ignored
    pub(crate) fn handle(&self, event: &str, payload: &Value) {
        let (is_state, is_diff) = {
            let inner = self.inner.lock();
            (event == inner.state_event, event == inner.diff_event)
        };
        if is_state {
            self.apply_state(payload);
        } else if is_diff {
            self.apply_diff(payload);
        }
    }

    fn apply_state(&self, payload: &Value) {
        let new_state = transform_state(payload);
        let join_ref = self.channel.upgrade().and_then(|c| c.join_ref());

        let mut emitted = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.join_ref = join_ref;
            let merged = collect_changes(&mut emitted, |on_join, on_leave| {
                sync_state(&inner.state, &new_state, on_join, on_leave)
            });
            inner.state = merged;

            let pending = std::mem::take(&mut inner.pending_diffs);
            if !pending.is_empty() {
                debug!("Applying {} queued presence diffs", pending.len());
            }
            for diff in &pending {
                let current = std::mem::take(&mut inner.state);
                inner.state = collect_changes(&mut emitted, |on_join, on_leave| {
                    sync_diff(current, diff, on_join, on_leave)
                });
            }
        }
        emitted.push(PresenceEvent::Sync);
        self.emit(&emitted);
    }

    fn apply_diff(&self, payload: &Value) {
        let diff = PresenceDiff {
            joins: payload.get("joins").map(transform_state).unwrap_or_default(),
            leaves: payload.get("leaves").map(transform_state).unwrap_or_default(),
        };

        if self.in_pending_sync_state() {
            self.inner.lock().pending_diffs.push(diff);
            return;
        }

        let mut emitted = Vec::new();
        {
            let mut inner = self.inner.lock();
            let current = std::mem::take(&mut inner.state);
            inner.state = collect_changes(&mut emitted, |on_join, on_leave| {
                sync_diff(current, &diff, on_join, on_leave)
            });
        }
        emitted.push(PresenceEvent::Sync);
        self.emit(&emitted);
    }

    /// Run callbacks and re-trigger the channel's `presence` bindings
    fn emit(&self, emitted: &[PresenceEvent]) {
        let callbacks: Vec<PresenceCallback> = self.callbacks.read().clone();
        let channel = self.channel.upgrade();

        for event in emitted {
            for callback in &callbacks {
                callback(event);
            }
            if let Some(channel) = &channel {
                let mut payload = serde_json::to_value(event).unwrap_or_else(|_| json!({}));
                if let Value::Object(map) = &mut payload {
                    map.insert("type".to_string(), json!(events::PRESENCE));
                }
                channel.trigger_bindings(events::PRESENCE, &Payload::Json(payload), None);
            }
        }
    }
}

type MetaSink<'a> = Box<dyn FnMut(&str, &[PresenceMeta], &[PresenceMeta]) + 'a>;

/// Run a merge, recording joins before leaves in the order the merge
/// reports them.
fn collect_changes<F>(emitted: &mut Vec<PresenceEvent>, merge: F) -> PresenceState
where
    F: FnOnce(MetaSink<'_>, MetaSink<'_>) -> PresenceState,
{
    let mut joins = Vec::new();
    let mut leaves = Vec::new();
    let state = merge(
        Box::new(|key, current, joined| {
            joins.push(PresenceEvent::Join {
                key: key.to_string(),
                current: current.to_vec(),
                joined: joined.to_vec(),
            });
        }),
        Box::new(|key, current, left| {
            leaves.push(PresenceEvent::Leave {
                key: key.to_string(),
                current: current.to_vec(),
                left: left.to_vec(),
            });
        }),
    );
    emitted.append(&mut joins);
    emitted.append(&mut leaves);
    state
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Presence")
            .field("keys", &inner.state.len())
            .field("pending_diffs", &inner.pending_diffs.len())
            .finish_non_exhaustive()
    }
}
