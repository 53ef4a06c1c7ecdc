//! Realtime Common Types and Utilities
//!
//! Shared wire types, configuration, and error handling for the realtime
//! channel engine.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{ChannelConfig, ListenerConfig, RealtimeConfig};
pub use error::{Error, Result};
pub use types::{Message, Payload, ProtocolVersion};
