//! Event bindings registered on a channel

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use realtime_common::types::{events, Payload};

use crate::postgres::{ChangeType, PostgresChangesFilter};

/// Callback invoked with the payload and the frame's ref
pub type BindingCallback = Arc<dyn Fn(&Payload, Option<&str>) + Send + Sync>;

/// What a binding listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingEvent {
    /// Database change deliveries, narrowed by change type
    PostgresChanges,
    /// Broadcast messages, narrowed by the broadcast's own event name
    Broadcast,
    /// Presence join/leave/sync notifications
    Presence,
    /// Any frame whose event equals the payload's `type` field
    Any,
    /// Exact event name match
    Named(String),
}

impl From<&str> for BindingEvent {
    fn from(event: &str) -> Self {
        match event {
            events::POSTGRES_CHANGES => Self::PostgresChanges,
            events::BROADCAST => Self::Broadcast,
            events::PRESENCE => Self::Presence,
            "*" => Self::Any,
            other => Self::Named(other.to_string()),
        }
    }
}

impl From<String> for BindingEvent {
    fn from(event: String) -> Self {
        Self::from(event.as_str())
    }
}

impl fmt::Display for BindingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PostgresChanges => f.write_str(events::POSTGRES_CHANGES),
            Self::Broadcast => f.write_str(events::BROADCAST),
            Self::Presence => f.write_str(events::PRESENCE),
            Self::Any => f.write_str("*"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Narrows which deliveries of a binding's event reach its callback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingFilter {
    /// Sub-event: broadcast event name, presence event, or change type.
    /// `None` and `"*"` both match everything.
    pub event: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub filter: Option<String>,
}

impl BindingFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn event(event: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            ..Self::default()
        }
    }

    /// Filter for `postgres_changes` on `schema`, optionally one table
    pub fn postgres(change: ChangeType, schema: &str, table: Option<&str>) -> Self {
        Self {
            event: Some(change.as_str().to_string()),
            schema: Some(schema.to_string()),
            table: table.map(str::to_string),
            filter: None,
        }
    }

    /// Row filter such as `id=eq.1`
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn matches_event(&self, event: Option<&str>) -> bool {
        match self.event.as_deref() {
            None | Some("*") => true,
            Some(expected) => event.is_some_and(|e| expected.eq_ignore_ascii_case(e)),
        }
    }

    /// Change-type check for postgres bindings; an unknown filter event
    /// matches nothing
    fn matches_change(&self, change_type: Option<&str>) -> bool {
        match self.event.as_deref().map(ChangeType::parse) {
            None => true,
            Some(Some(change)) => change_type.is_some_and(|t| change.matches(t)),
            Some(None) => false,
        }
    }

    pub(crate) fn to_postgres(&self) -> PostgresChangesFilter {
        PostgresChangesFilter {
            event: self.event.clone().unwrap_or_else(|| "*".to_string()),
            schema: self.schema.clone().unwrap_or_else(|| "public".to_string()),
            table: self.table.clone(),
            filter: self.filter.clone(),
        }
    }
}

/// A registered callback
#[derive(Clone)]
pub(crate) struct Binding {
    pub event: BindingEvent,
    pub filter: BindingFilter,
    /// Id the server assigned to this postgres binding on join
    pub server_id: Option<u64>,
    pub callback: BindingCallback,
}

impl Binding {
    pub fn new(event: BindingEvent, filter: BindingFilter, callback: BindingCallback) -> Self {
        Self {
            event,
            filter,
            server_id: None,
            callback,
        }
    }

    /// Check if this binding wants a frame with `event_type` (lowercased)
    pub fn matches(&self, event_type: &str, payload: &Payload) -> bool {
        match &self.event {
            BindingEvent::PostgresChanges => match event_type {
                "insert" | "update" | "delete" => self.filter.matches_change(Some(event_type)),
                events::POSTGRES_CHANGES => {
                    let change_type = payload
                        .get("data")
                        .and_then(|d| d.get("type"))
                        .and_then(Value::as_str);
                    let id_matches = match self.server_id {
                        Some(id) => payload
                            .get("ids")
                            .and_then(Value::as_array)
                            .is_some_and(|ids| ids.iter().any(|v| v.as_u64() == Some(id))),
                        None => true,
                    };
                    id_matches && self.filter.matches_change(change_type)
                }
                _ => false,
            },
            BindingEvent::Broadcast | BindingEvent::Presence => {
                let kind = if self.event == BindingEvent::Broadcast {
                    events::BROADCAST
                } else {
                    events::PRESENCE
                };
                event_type == kind
                    && self
                        .filter
                        .matches_event(payload.get("event").and_then(Value::as_str))
            }
            BindingEvent::Any => payload
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| t.eq_ignore_ascii_case(event_type)),
            BindingEvent::Named(name) => name.eq_ignore_ascii_case(event_type),
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("event", &self.event)
            .field("filter", &self.filter)
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}
