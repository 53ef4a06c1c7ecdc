//! Realtime channel engine
//!
//! Re-exports the engine crates and provides a [`Listener`] that joins a
//! configured set of channels and tails their traffic to the log.
//!
//! # Features
//!
//! - **Channels** - Join/leave lifecycle with automatic rejoin
//! - **Broadcast** - Event fan-out between clients on a topic
//! - **Presence** - Replicated "who is here" state
//! - **Postgres changes** - Database change notifications routed per binding

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use realtime_client as client;
pub use realtime_common as common;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use realtime_client::{BindingEvent, BindingFilter, Channel, PushStatus, Socket, SubscribeStatus};
use realtime_common::config::{ListenedChannel, ListenerConfig};
use realtime_common::error::Result;

/// Joins the configured channels and logs everything they receive
pub struct Listener {
    config: ListenerConfig,
    socket: Socket,
    channels: Vec<Channel>,
    stopped: Arc<Notify>,
}

impl Listener {
    /// Create a listener with the given configuration
    ///
    /// # Errors
    /// Returns an error if the endpoint or socket options are invalid.
    pub fn new(config: ListenerConfig) -> Result<Self> {
        let socket = Socket::new(&config.endpoint, config.realtime.clone())?;
        Ok(Self::with_socket(config, socket))
    }

    /// Create a listener over an already constructed socket
    #[must_use]
    pub fn with_socket(config: ListenerConfig, socket: Socket) -> Self {
        info!("Initializing listener for {}", socket.endpoint_url());

        socket.on_open(|| info!("Socket open"));
        socket.on_close(|code, reason| warn!("Socket closed ({:?}): {}", code, reason));
        socket.on_error(|reason| error!("Socket error: {}", reason));

        let channels = config
            .channels
            .iter()
            .map(|listened| bind_channel(&socket, listened))
            .collect();

        Self {
            config,
            socket,
            channels,
            stopped: Arc::new(Notify::new()),
        }
    }

    /// Get reference to the socket
    #[must_use]
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Channels created from the configuration, in configuration order
    #[must_use]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Connect and join every configured channel
    ///
    /// # Errors
    /// Returns an error if a channel has already been subscribed.
    pub fn start(&self) -> Result<()> {
        info!("Starting listener with {} channel(s)", self.channels.len());
        self.socket.connect();

        for (channel, listened) in self.channels.iter().zip(&self.config.channels) {
            let topic = channel.topic().to_string();
            channel.subscribe_with(
                move |status| match status {
                    SubscribeStatus::Subscribed => info!("Joined {}", topic),
                    SubscribeStatus::Closed => info!("Left {}", topic),
                    SubscribeStatus::TimedOut => warn!("Join of {} timed out", topic),
                    SubscribeStatus::ChannelError(reason) => {
                        error!("Join of {} failed: {}", topic, reason);
                    }
                },
                None,
            )?;

            if let Some(key) = &listened.presence_key {
                channel.track(json!({ "key": key, "client": env!("CARGO_PKG_NAME") }))?;
            }
        }
        Ok(())
    }

    /// Start, then wait until [`Listener::shutdown`] is called
    ///
    /// # Errors
    /// Same as [`Listener::start`].
    pub async fn run(&self) -> Result<()> {
        self.start()?;
        self.stopped.notified().await;
        Ok(())
    }

    /// Leave every channel and close the socket
    pub async fn shutdown(&self) -> Vec<PushStatus> {
        info!("Shutting down listener");
        let statuses = self.socket.remove_all_channels().await;
        for status in &statuses {
            if *status != PushStatus::Ok {
                warn!("Leave finished with {:?}", status);
            }
        }
        self.stopped.notify_waiters();
        statuses
    }
}

/// Create the channel for `listened` and attach logging bindings
fn bind_channel(socket: &Socket, listened: &ListenedChannel) -> Channel {
    let mut config = listened.config.clone();
    if let Some(key) = &listened.presence_key {
        config = config.presence_key(key.clone());
    }
    let channel = socket.channel(&listened.topic, config);
    let topic = channel.topic().to_string();

    let events: Vec<&str> = if listened.events.is_empty() {
        vec!["*"]
    } else {
        listened.events.iter().map(String::as_str).collect()
    };
    for event in events {
        let topic = topic.clone();
        channel.on(
            BindingEvent::Broadcast,
            BindingFilter::event(event),
            move |payload, _| info!(topic = %topic, "broadcast {:?}", payload),
        );
    }

    let sync_topic = topic.clone();
    let presence = channel.presence();
    presence.on_join(move |key, _, joined| {
        info!("{} joined {} ({} meta)", key, sync_topic, joined.len());
    });
    let leave_topic = topic.clone();
    presence.on_leave(move |key, _, left| {
        info!("{} left {} ({} meta)", key, leave_topic, left.len());
    });
    presence.on_sync(move || debug!("Presence synced on {}", topic));

    channel.on_error(|reason| warn!("Channel error: {}", reason));
    channel
}
