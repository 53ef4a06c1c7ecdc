//! Configuration types for the realtime channel engine

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ProtocolVersion;

/// Socket-level configuration shared by every channel on one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Default push and join timeout in milliseconds (default: 10000)
    pub timeout_ms: u64,
    /// Heartbeat interval in milliseconds (default: 30000)
    pub heartbeat_interval_ms: u64,
    /// Retry delays in milliseconds; the last entry repeats once exhausted
    pub reconnect_after_ms: Vec<u64>,
    /// Wire protocol version sent as `vsn`
    pub protocol: ProtocolVersion,
    /// Extra query parameters appended to the endpoint (e.g. `apikey`)
    pub params: BTreeMap<String, String>,
    /// Access token applied to every channel join
    pub access_token: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            reconnect_after_ms: vec![1_000, 2_000, 5_000, 10_000],
            protocol: ProtocolVersion::V1,
            params: BTreeMap::new(),
            access_token: None,
        }
    }
}

impl RealtimeConfig {
    /// Check invariants the engine relies on
    ///
    /// # Errors
    /// Returns `Error::Config` for a zero heartbeat or timeout, or an empty
    /// backoff table.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeat_interval_ms must be positive".into()));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be positive".into()));
        }
        if self.reconnect_after_ms.is_empty() {
            return Err(Error::Config("reconnect_after_ms must not be empty".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Broadcast options sent in the join config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Ask the server to acknowledge broadcasts
    pub ack: bool,
    /// Receive our own broadcasts
    #[serde(rename = "self")]
    pub receive_own: bool,
}

/// Presence options sent in the join config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Key this client's presence is tracked under
    pub key: String,
}

/// Per-channel join configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub broadcast: BroadcastConfig,
    pub presence: PresenceConfig,
    /// Caller-supplied join params merged next to `config`
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ChannelConfig {
    pub fn with_params(params: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence.key = key.into();
        self
    }
}

/// A channel the listener joins at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenedChannel {
    /// Topic without the `realtime:` prefix
    pub topic: String,
    /// Broadcast events to bind (`*` for all)
    pub events: Vec<String>,
    /// Presence key, if this client should track itself
    pub presence_key: Option<String>,
    /// Join options
    pub config: ChannelConfig,
}

/// Configuration for the listener binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Realtime endpoint, e.g. `wss://project.example.co/realtime/v1`
    pub endpoint: String,
    /// Socket options
    pub realtime: RealtimeConfig,
    /// Channels to join
    pub channels: Vec<ListenedChannel>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:4000/socket".to_string(),
            realtime: RealtimeConfig::default(),
            channels: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RealtimeConfig::default();
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.protocol, ProtocolVersion::V1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_backoff() {
        let config = RealtimeConfig {
            reconnect_after_ms: vec![],
            ..RealtimeConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_broadcast_self_field_name() {
        let json = serde_json::to_value(BroadcastConfig {
            ack: true,
            receive_own: false,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"ack": true, "self": false}));
    }

    #[test]
    fn test_listener_config_from_toml() {
        let config: ListenerConfig = toml::from_str(
            r#"
            endpoint = "wss://example.test/realtime/v1"

            [realtime]
            heartbeat_interval_ms = 15000
            protocol = "2.0.0"
            params = { apikey = "anon" }

            [[channels]]
            topic = "room:lobby"
            events = ["cursor"]
            presence_key = "alice"
            "#,
        )
        .unwrap();

        assert_eq!(config.realtime.heartbeat_interval_ms, 15_000);
        assert_eq!(config.realtime.timeout_ms, 10_000);
        assert_eq!(config.realtime.protocol, ProtocolVersion::V2);
        assert_eq!(config.realtime.params.get("apikey").map(String::as_str), Some("anon"));
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.channels[0].events, vec!["cursor".to_string()]);
    }
}
