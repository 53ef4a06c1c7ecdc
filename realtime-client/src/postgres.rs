//! Postgres change-data-capture events delivered over a channel

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Type of database change a binding listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "*",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Whether an incoming change of type `event_type` matches
    pub fn matches(self, event_type: &str) -> bool {
        self == Self::All || self.as_str().eq_ignore_ascii_case(event_type)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "*" => Some(Self::All),
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One entry of the join config's `postgres_changes` list, and of the
/// server's answer to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresChangesFilter {
    pub event: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Server-acknowledged filter with its binding id
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServerPostgresFilter {
    pub id: u64,
    pub event: String,
    pub schema: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
}

impl ServerPostgresFilter {
    pub fn agrees_with(&self, client: &PostgresChangesFilter) -> bool {
        self.event == client.event
            && self.schema == client.schema
            && self.table == client.table
            && self.filter == client.filter
    }
}

/// Flatten a `postgres_changes` delivery `{ids, data}` into the shape
/// handed to callbacks
pub(crate) fn enrich_change(data: &Value) -> Value {
    let field = |name: &str| data.get(name).cloned().unwrap_or(Value::Null);
    let change_type = data.get("type").and_then(Value::as_str).unwrap_or_default();
    let empty = || Value::Object(serde_json::Map::new());

    let (new, old) = match ChangeType::parse(change_type) {
        Some(ChangeType::Insert) => (data.get("record").cloned().unwrap_or_else(empty), empty()),
        Some(ChangeType::Update) => (
            data.get("record").cloned().unwrap_or_else(empty),
            data.get("old_record").cloned().unwrap_or_else(empty),
        ),
        Some(ChangeType::Delete) => (empty(), data.get("old_record").cloned().unwrap_or_else(empty)),
        _ => (empty(), empty()),
    };

    json!({
        "schema": field("schema"),
        "table": field("table"),
        "commit_timestamp": field("commit_timestamp"),
        "eventType": change_type,
        "new": new,
        "old": old,
        "errors": field("errors"),
    })
}
