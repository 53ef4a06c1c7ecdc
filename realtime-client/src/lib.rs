//! Realtime Channel Engine
//!
//! Client side of the Phoenix channel protocol:
//! - One multiplexed WebSocket with heartbeats and reconnect backoff
//! - Per-topic channels with join/leave lifecycles and automatic rejoin
//! - Request/reply pushes with timeouts
//! - Presence state sync and Postgres change routing

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod binding;
pub mod channel;
pub mod postgres;
pub mod presence;
pub mod push;
pub mod serializer;
pub mod socket;
pub mod timer;
pub mod transport;

pub use binding::{BindingEvent, BindingFilter};
pub use channel::{Channel, ChannelState, SubscribeStatus};
pub use postgres::{ChangeType, PostgresChangesFilter};
pub use presence::{
    sync_diff, sync_state, transform_state, Presence, PresenceDiff, PresenceEvent, PresenceMeta,
    PresenceState,
};
pub use push::{Push, PushReply, PushStatus};
pub use serializer::Serializer;
pub use socket::{ConnectionState, Socket};
pub use timer::{stepped_backoff, Timer};
pub use transport::{Connection, Frame, Outbound, Transport, TransportEvent, WebSocketTransport};
