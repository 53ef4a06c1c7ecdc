//! Wire-level types shared by the socket, channels and serializer

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Protocol
// ============================================================================

/// Topic used for socket-level traffic such as heartbeats
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Prefix every channel topic carries on the wire
pub const TOPIC_PREFIX: &str = "realtime:";

/// Reserved event names
pub mod events {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const CLOSE: &str = "phx_close";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";

    /// Lifecycle events that are dropped when they carry a stale join ref
    pub const LIFECYCLE: [&str; 4] = [CLOSE, ERROR, LEAVE, JOIN];
}

/// Serializer version announced through the `vsn` query parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// JSON object frames
    #[default]
    #[serde(rename = "1.0.0")]
    V1,
    /// JSON array frames plus binary push encoding
    #[serde(rename = "2.0.0")]
    V2,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "1.0.0",
            Self::V2 => "2.0.0",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Message payload: structured JSON, or raw bytes under protocol 2.0.0
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Bytes),
}

impl Payload {
    /// An empty JSON object
    pub fn empty() -> Self {
        Self::Json(Value::Object(serde_json::Map::new()))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Binary(_) => None,
        }
    }

    /// Field lookup on a JSON object payload
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_json().and_then(|v| v.get(key))
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

/// One protocol frame, inbound or outbound
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Topic (channel name)
    pub topic: String,
    /// Event type
    pub event: String,
    /// Payload
    pub payload: Payload,
    /// Reference for request/response matching
    pub reference: Option<String>,
    /// Join reference of the channel instance this frame belongs to
    pub join_ref: Option<String>,
}

impl Message {
    /// Create a message without refs
    pub fn new(topic: &str, event: &str, payload: impl Into<Payload>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload: payload.into(),
            reference: None,
            join_ref: None,
        }
    }

    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_join_ref(mut self, join_ref: Option<String>) -> Self {
        self.join_ref = join_ref;
        self
    }

    /// Create a reply message to `original`
    pub fn reply(original: &Message, status: &str, response: Value) -> Self {
        Self {
            topic: original.topic.clone(),
            event: events::REPLY.to_string(),
            payload: Payload::Json(serde_json::json!({
                "status": status,
                "response": response
            })),
            reference: original.reference.clone(),
            join_ref: original.join_ref.clone(),
        }
    }

    /// Heartbeat frame carrying `reference`
    pub fn heartbeat(reference: impl Into<String>) -> Self {
        Self::new(PHOENIX_TOPIC, events::HEARTBEAT, Payload::empty()).with_ref(reference)
    }
}

/// Prefix `topic` with `realtime:` unless it already carries it
pub fn channel_topic(topic: &str) -> String {
    if topic.starts_with(TOPIC_PREFIX) {
        topic.to_string()
    } else {
        format!("{TOPIC_PREFIX}{topic}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_keeps_refs() {
        let msg = Message::new("realtime:room", events::JOIN, serde_json::json!({}))
            .with_ref("3")
            .with_join_ref(Some("3".into()));
        let reply = Message::reply(&msg, "ok", serde_json::json!({"a": 1}));

        assert_eq!(reply.event, events::REPLY);
        assert_eq!(reply.reference.as_deref(), Some("3"));
        assert_eq!(reply.join_ref.as_deref(), Some("3"));
        assert_eq!(reply.payload.get("status"), Some(&serde_json::json!("ok")));
    }

    #[test]
    fn test_channel_topic_prefix() {
        assert_eq!(channel_topic("room"), "realtime:room");
        assert_eq!(channel_topic("realtime:room"), "realtime:room");
    }

    #[test]
    fn test_protocol_version_serde() {
        let v: ProtocolVersion = serde_json::from_str("\"2.0.0\"").unwrap();
        assert_eq!(v, ProtocolVersion::V2);
        assert_eq!(ProtocolVersion::V1.to_string(), "1.0.0");
    }
}
