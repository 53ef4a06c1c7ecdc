//! Error types for the realtime channel engine

use thiserror::Error;

/// Realtime engine error types
#[derive(Error, Debug)]
pub enum Error {
    // Transport Errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // Protocol Errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Caller Errors
    #[error(
        "tried to subscribe multiple times to '{topic}'. 'subscribe' can only be called a single time per channel instance"
    )]
    SubscribeMultipleTimes { topic: String },

    #[error("tried to push '{event}' to '{topic}' before joining. Use channel.subscribe() before pushing events")]
    PushBeforeJoin { topic: String, event: String },

    // General Errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for realtime operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable error code for logs
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::Protocol(_) => "protocol_error",
            Self::InvalidEndpoint(_) => "invalid_endpoint",
            Self::Serialization(_) => "json_error",
            Self::SubscribeMultipleTimes { .. } => "subscribe_multiple_times",
            Self::PushBeforeJoin { .. } => "push_before_join",
            Self::Config(_) => "config_error",
        }
    }
}
