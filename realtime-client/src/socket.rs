//! Socket: the one connection every channel is multiplexed over
//!
//! The socket owns the transport, the heartbeat loop, the reconnect timer,
//! ref generation and the channel registry. Frames pushed while the
//! connection is down are buffered and flushed in order once it opens.
//! Every connection attempt gets a generation number, and events from an
//! older generation are ignored.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

use realtime_common::config::{ChannelConfig, RealtimeConfig};
use realtime_common::error::Result;
use realtime_common::types::{channel_topic, events, Message};

use crate::channel::{Channel, ChannelInner, ChannelState};
use crate::push::PushStatus;
use crate::serializer::Serializer;
use crate::timer::{stepped_backoff, Timer};
use crate::transport::{
    Connection, Frame, Outbound, Transport, TransportEvent, WebSocketTransport, CLOSE_NORMAL,
};

/// Largest ref handed out before the counter wraps to 0
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Connection state as seen by callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    #[default]
    Closed,
}

type OpenCallback = Arc<dyn Fn() + Send + Sync>;
type CloseCallback = Arc<dyn Fn(Option<u16>, &str) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Default)]
struct StateCallbacks {
    open: Vec<OpenCallback>,
    close: Vec<CloseCallback>,
    error: Vec<ErrorCallback>,
    message: Vec<MessageCallback>,
}

struct ConnState {
    status: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    tasks: Vec<JoinHandle<()>>,
    send_buffer: VecDeque<Message>,
    pending_heartbeat: Option<String>,
}

pub(crate) struct SocketInner {
    config: RealtimeConfig,
    endpoint: Url,
    transport: Arc<dyn Transport>,
    serializer: Serializer,
    me: Weak<SocketInner>,
    next_ref: Mutex<u64>,
    conn: Mutex<ConnState>,
    channels: RwLock<Vec<Channel>>,
    reconnect_timer: Timer,
    callbacks: RwLock<StateCallbacks>,
    access_token: RwLock<Option<String>>,
}

/// Client connection to a realtime server
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

/// `<endpoint>/websocket?<params>&vsn=<version>`
fn endpoint_url(endpoint: &str, config: &RealtimeConfig) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/websocket", endpoint.trim_end_matches('/')))?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in &config.params {
            query.append_pair(key, value);
        }
        query.append_pair("vsn", config.protocol.as_str());
    }
    Ok(url)
}

impl SocketInner {
    pub(crate) fn is_connected(&self) -> bool {
        self.conn.lock().status == ConnectionState::Open
    }

    pub(crate) fn access_token(&self) -> Option<String> {
        self.access_token.read().clone()
    }

    /// Next ref; wraps to "0" after `MAX_SAFE_INTEGER`
    pub(crate) fn make_ref(&self) -> String {
        let mut next = self.next_ref.lock();
        *next = if *next >= MAX_SAFE_INTEGER { 0 } else { *next + 1 };
        next.to_string()
    }

    fn channels(&self) -> Vec<Channel> {
        self.channels.read().clone()
    }

    /// Send now if open, otherwise queue for the next open
    pub(crate) fn push(&self, message: Message) {
        let mut conn = self.conn.lock();
        let outbound = conn
            .outbound
            .clone()
            .filter(|_| conn.status == ConnectionState::Open);
        match outbound {
            Some(outbound) => self.write(&outbound, &message),
            None => {
                debug!("Buffering {} {} until connected", message.topic, message.event);
                conn.send_buffer.push_back(message);
            }
        }
    }

    fn write(&self, outbound: &mpsc::UnboundedSender<Outbound>, message: &Message) {
        debug!(
            "push {} {} ({:?})",
            message.topic, message.event, message.reference
        );
        match self.serializer.encode(message) {
            Ok(frame) => {
                if outbound.send(Outbound::Frame(frame)).is_err() {
                    warn!("Transport writer is gone, dropping {}", message.event);
                }
            }
            Err(e) => error!(
                code = e.error_code(),
                "Failed to encode {} {}: {}",
                message.topic,
                message.event,
                e
            ),
        }
    }

    pub(crate) fn remove(&self, channel: &ChannelInner) {
        self.channels.write().retain(|c| !c.is(channel));
    }

    /// Leave any other joined or joining channel on `topic`
    pub(crate) fn leave_open_topic(&self, topic: &str, except: &ChannelInner) {
        let duplicate = self
            .channels
            .read()
            .iter()
            .find(|c| {
                !c.is(except)
                    && c.topic() == topic
                    && matches!(c.state(), ChannelState::Joined | ChannelState::Joining)
            })
            .cloned();
        if let Some(duplicate) = duplicate {
            warn!("Leaving duplicate channel for topic {}", topic);
            duplicate.unsubscribe(None);
        }
    }

    fn connect(&self) {
        let generation = {
            let mut conn = self.conn.lock();
            if conn.status != ConnectionState::Closed {
                return;
            }
            conn.status = ConnectionState::Connecting;
            conn.generation += 1;
            conn.generation
        };
        info!("Connecting to {}", self.endpoint);

        let me = self.me.clone();
        let transport = Arc::clone(&self.transport);
        let url = self.endpoint.clone();
        let task = tokio::spawn(async move {
            let result = transport.connect(&url).await;
            let Some(socket) = me.upgrade() else {
                return;
            };
            match result {
                Ok(connection) => socket.on_conn_open(generation, connection),
                Err(e) => {
                    error!(code = e.error_code(), "Failed to connect to {}: {}", url, e);
                    socket.on_conn_close(generation, None, &e.to_string());
                }
            }
        });
        self.conn.lock().tasks.push(task);
    }

    fn on_conn_open(&self, generation: u64, connection: Connection) {
        let Connection {
            outbound,
            mut inbound,
        } = connection;
        {
            let mut conn = self.conn.lock();
            if conn.generation != generation {
                let _ = outbound.send(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: "superseded".to_string(),
                });
                return;
            }
            conn.status = ConnectionState::Open;
            conn.pending_heartbeat = None;
            while let Some(message) = conn.send_buffer.pop_front() {
                self.write(&outbound, &message);
            }
            conn.outbound = Some(outbound);

            let me = self.me.clone();
            let period = self.config.heartbeat_interval();
            conn.tasks.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let Some(socket) = me.upgrade() else {
                        return;
                    };
                    if !socket.send_heartbeat(generation) {
                        return;
                    }
                }
            }));

            let me = self.me.clone();
            conn.tasks.push(tokio::spawn(async move {
                while let Some(event) = inbound.recv().await {
                    let Some(socket) = me.upgrade() else {
                        return;
                    };
                    match event {
                        TransportEvent::Frame(frame) => socket.on_conn_message(generation, &frame),
                        TransportEvent::Error(reason) => socket.on_conn_error(generation, &reason),
                        TransportEvent::Closed { code, reason } => {
                            socket.on_conn_close(generation, code, &reason);
                            return;
                        }
                    }
                }
                if let Some(socket) = me.upgrade() {
                    socket.on_conn_close(generation, None, "transport dropped");
                }
            }));
        }

        info!("Connected to {}", self.endpoint);
        self.reconnect_timer.reset();
        let callbacks = self.callbacks.read().open.clone();
        for callback in callbacks {
            callback();
        }
    }

    /// Returns false once the heartbeat loop should stop
    fn send_heartbeat(&self, generation: u64) -> bool {
        let outbound = {
            let mut conn = self.conn.lock();
            if conn.generation != generation || conn.status != ConnectionState::Open {
                return false;
            }
            let Some(outbound) = conn.outbound.clone() else {
                return false;
            };
            if conn.pending_heartbeat.take().is_none() {
                let reference = self.make_ref();
                conn.pending_heartbeat = Some(reference.clone());
                self.write(&outbound, &Message::heartbeat(reference));
                return true;
            }
            outbound
        };

        warn!("Heartbeat timeout, closing connection to {}", self.endpoint);
        let _ = outbound.send(Outbound::Close {
            code: CLOSE_NORMAL,
            reason: "heartbeat timeout".to_string(),
        });
        self.on_conn_close(generation, Some(CLOSE_NORMAL), "heartbeat timeout");
        false
    }

    fn on_conn_message(&self, generation: u64, frame: &Frame) {
        let message = {
            let mut conn = self.conn.lock();
            if conn.generation != generation {
                return;
            }
            let message = match self.serializer.decode(frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(code = e.error_code(), "Dropping undecodable frame: {}", e);
                    return;
                }
            };
            if message.reference.is_some() && message.reference == conn.pending_heartbeat {
                conn.pending_heartbeat = None;
            }
            message
        };
        debug!(
            "receive {} {} ({:?})",
            message.topic, message.event, message.reference
        );

        let channels: Vec<Channel> = self
            .channels
            .read()
            .iter()
            .filter(|c| c.topic() == message.topic)
            .cloned()
            .collect();
        for channel in channels {
            channel.inner().dispatch(&message);
        }

        let callbacks = self.callbacks.read().message.clone();
        for callback in callbacks {
            callback(&message);
        }
    }

    fn on_conn_error(&self, generation: u64, reason: &str) {
        if self.conn.lock().generation != generation {
            return;
        }
        error!("Transport error on {}: {}", self.endpoint, reason);
        for channel in self.channels() {
            channel.inner().handle_error(reason);
        }
        let callbacks = self.callbacks.read().error.clone();
        for callback in callbacks {
            callback(reason);
        }
    }

    fn on_conn_close(&self, generation: u64, code: Option<u16>, reason: &str) {
        {
            let mut conn = self.conn.lock();
            if conn.generation != generation || conn.status == ConnectionState::Closed {
                return;
            }
            conn.status = ConnectionState::Closed;
            conn.outbound = None;
            conn.pending_heartbeat = None;
            for task in conn.tasks.drain(..) {
                task.abort();
            }
        }
        info!("Connection to {} closed ({:?}): {}", self.endpoint, code, reason);

        for channel in self.channels() {
            channel.inner().handle_error(reason);
        }
        self.reconnect_timer.schedule_timeout();

        let callbacks = self.callbacks.read().close.clone();
        for callback in callbacks {
            callback(code, reason);
        }
    }

    /// Drop the current connection without notifying channels
    fn teardown(&self, code: Option<u16>, reason: Option<&str>) {
        let (outbound, tasks) = {
            let mut conn = self.conn.lock();
            conn.generation += 1;
            conn.status = ConnectionState::Closing;
            conn.pending_heartbeat = None;
            let tasks: Vec<_> = conn.tasks.drain(..).collect();
            (conn.outbound.take(), tasks)
        };
        if let Some(outbound) = outbound {
            let _ = outbound.send(Outbound::Close {
                code: code.unwrap_or(CLOSE_NORMAL),
                reason: reason.unwrap_or_default().to_string(),
            });
        }
        for task in tasks {
            task.abort();
        }
        self.conn.lock().status = ConnectionState::Closed;
    }

    fn set_auth(&self, token: Option<String>) {
        *self.access_token.write() = token.clone();

        for channel in self.channels() {
            match &token {
                Some(token) => {
                    let mut partial = Map::new();
                    partial.insert("access_token".to_string(), json!(token));
                    channel.update_join_payload(&partial);
                }
                None => channel.inner().clear_join_payload_key("access_token"),
            }
            if channel.inner().joined_once() && channel.is_joined() {
                if let Err(e) = channel.push(events::ACCESS_TOKEN, json!({"access_token": token}), None) {
                    debug!(
                        code = e.error_code(),
                        "Skipping token refresh on {}: {}",
                        channel.topic(),
                        e
                    );
                }
            }
        }
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        for task in self.conn.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

impl Socket {
    /// Socket over a real WebSocket
    ///
    /// # Errors
    /// Returns `Error::InvalidEndpoint` for an unparsable endpoint and
    /// `Error::Config` for an invalid configuration.
    pub fn new(endpoint: &str, config: RealtimeConfig) -> Result<Self> {
        Self::with_transport(endpoint, config, Arc::new(WebSocketTransport))
    }

    /// Socket over a caller-provided transport
    ///
    /// # Errors
    /// Same as [`Socket::new`].
    pub fn with_transport(
        endpoint: &str,
        config: RealtimeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let endpoint = endpoint_url(endpoint, &config)?;
        let serializer = Serializer::new(config.protocol);
        let backoff = stepped_backoff(config.reconnect_after_ms.clone());
        let access_token = config.access_token.clone();

        let inner = Arc::new_cyclic(|me: &Weak<SocketInner>| {
            let reconnect_target = me.clone();
            SocketInner {
                config,
                endpoint,
                transport,
                serializer,
                me: me.clone(),
                next_ref: Mutex::new(0),
                conn: Mutex::new(ConnState {
                    status: ConnectionState::Closed,
                    generation: 0,
                    outbound: None,
                    tasks: Vec::new(),
                    send_buffer: VecDeque::new(),
                    pending_heartbeat: None,
                }),
                channels: RwLock::new(Vec::new()),
                reconnect_timer: Timer::new(
                    move || {
                        if let Some(socket) = reconnect_target.upgrade() {
                            socket.teardown(None, None);
                            socket.connect();
                        }
                    },
                    backoff,
                ),
                callbacks: RwLock::new(StateCallbacks::default()),
                access_token: RwLock::new(access_token),
            }
        });
        Ok(Self { inner })
    }

    /// Full connection URL including `vsn`
    pub fn endpoint_url(&self) -> &Url {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Open the connection. No-op while connecting or connected.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Close the connection and stop reconnecting. Channels keep their
    /// state and rejoin after the next `connect`.
    pub fn disconnect(&self, code: Option<u16>, reason: Option<&str>) {
        info!("Disconnecting from {}", self.inner.endpoint);
        self.inner.teardown(code, reason);
        self.inner.reconnect_timer.reset();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.conn.lock().status
    }

    pub fn make_ref(&self) -> String {
        self.inner.make_ref()
    }

    /// Send a raw message, buffering it while disconnected
    pub fn push(&self, message: Message) {
        self.inner.push(message);
    }

    /// Channel for `topic`. An existing joined or joining channel on the
    /// same topic is returned instead of a new one.
    pub fn channel(&self, topic: &str, config: ChannelConfig) -> Channel {
        let full_topic = channel_topic(topic);
        let existing = self
            .inner
            .channels
            .read()
            .iter()
            .find(|c| {
                c.topic() == full_topic
                    && matches!(c.state(), ChannelState::Joined | ChannelState::Joining)
            })
            .cloned();
        if let Some(existing) = existing {
            return existing;
        }

        let channel = Channel::new(
            &full_topic,
            config,
            Arc::downgrade(&self.inner),
            &self.inner.config,
        );
        self.inner.channels.write().push(channel.clone());
        channel
    }

    /// Registered channels
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels()
    }

    /// Leave `channel`, and disconnect once no channels remain
    pub async fn remove_channel(&self, channel: &Channel) -> PushStatus {
        let status = channel.unsubscribe(None).outcome().await.status;
        if self.inner.channels.read().is_empty() {
            self.disconnect(None, None);
        }
        status
    }

    /// Leave every channel and disconnect
    pub async fn remove_all_channels(&self) -> Vec<PushStatus> {
        let leaves: Vec<_> = self
            .channels()
            .iter()
            .map(|channel| channel.unsubscribe(None))
            .collect();
        let replies = futures::future::join_all(leaves.iter().map(|push| push.outcome())).await;
        self.disconnect(None, None);
        replies.into_iter().map(|reply| reply.status).collect()
    }

    /// Store `token` for future joins and push it to joined channels
    pub fn set_auth(&self, token: Option<String>) {
        self.inner.set_auth(token);
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.access_token()
    }

    pub fn on_open<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks.write().open.push(Arc::new(callback));
    }

    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn(Option<u16>, &str) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().close.push(Arc::new(callback));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().error.push(Arc::new(callback));
    }

    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().message.push(Arc::new(callback));
    }

    #[cfg(test)]
    fn set_ref(&self, value: u64) {
        *self.inner.next_ref.lock() = value;
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("state", &self.connection_state())
            .field("channels", &self.inner.channels.read().len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
