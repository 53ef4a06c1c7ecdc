//! Channel join state machine
//!
//! A channel owns one topic on the shared socket: its join push, the pushes
//! created before the join completed, the event bindings and the rejoin
//! timer. Socket loss and server errors move the channel to `Errored`, after
//! which the rejoin timer retries the join with backoff until it succeeds or
//! the channel is left.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use realtime_common::config::{ChannelConfig, RealtimeConfig};
use realtime_common::error::{Error, Result};
use realtime_common::types::{channel_topic, events, Message, Payload};

use crate::binding::{Binding, BindingCallback, BindingEvent, BindingFilter};
use crate::postgres::{enrich_change, ServerPostgresFilter};
use crate::presence::Presence;
use crate::push::{Push, PushStatus};
use crate::socket::SocketInner;
use crate::timer::{stepped_backoff, Timer};

/// Channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Closed,
    Errored,
    Joined,
    Joining,
    Leaving,
}

/// Outcome reported to the callback passed to `subscribe_with`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

impl fmt::Display for SubscribeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribed => f.write_str("SUBSCRIBED"),
            Self::ChannelError(reason) => write!(f, "CHANNEL_ERROR: {reason}"),
            Self::TimedOut => f.write_str("TIMED_OUT"),
            Self::Closed => f.write_str("CLOSED"),
        }
    }
}

pub type SubscribeCallback = Arc<dyn Fn(SubscribeStatus) + Send + Sync>;
type CloseCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

const POSTGRES_MISMATCH: &str = "mismatch between server and client bindings for postgres changes";

struct ChannelCore {
    state: ChannelState,
    joined_once: bool,
    push_buffer: Vec<Push>,
    bindings: Vec<Binding>,
    subscribe_callback: Option<SubscribeCallback>,
    close_callbacks: Vec<CloseCallback>,
    error_callbacks: Vec<ErrorCallback>,
}

pub(crate) struct ChannelInner {
    topic: String,
    config: ChannelConfig,
    timeout: Duration,
    socket: Weak<SocketInner>,
    me: Weak<ChannelInner>,
    join_push: Push,
    rejoin_timer: Timer,
    presence: Presence,
    core: Mutex<ChannelCore>,
    replies: Mutex<HashMap<String, Push>>,
}

/// One topic on a socket
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

fn base_join_payload(config: &ChannelConfig) -> Payload {
    let mut payload = config.params.clone();
    payload.insert(
        "config".to_string(),
        json!({
            "broadcast": config.broadcast,
            "presence": config.presence,
        }),
    );
    Payload::Json(Value::Object(payload))
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ChannelInner {
    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.core.lock().state
    }

    pub(crate) fn joined_once(&self) -> bool {
        self.core.lock().joined_once
    }

    /// Ref of the join push that opened the current membership
    pub(crate) fn join_ref(&self) -> Option<String> {
        self.join_push.reference()
    }

    fn socket_connected(&self) -> bool {
        self.socket.upgrade().is_some_and(|s| s.is_connected())
    }

    pub(crate) fn can_push(&self) -> bool {
        self.socket_connected() && self.state() == ChannelState::Joined
    }

    pub(crate) fn make_ref(&self) -> Option<String> {
        self.socket.upgrade().map(|s| s.make_ref())
    }

    pub(crate) fn socket_push(&self, message: Message) {
        if let Some(socket) = self.socket.upgrade() {
            socket.push(message);
        }
    }

    pub(crate) fn register_reply(&self, reference: &str, push: Push) {
        self.replies.lock().insert(reference.to_string(), push);
    }

    pub(crate) fn forget_reply(&self, reference: &str) {
        self.replies.lock().remove(reference);
    }

    fn install_join_hooks(&self) {
        let me = self.me.clone();
        self.join_push.receive(PushStatus::Ok, move |response| {
            if let Some(channel) = me.upgrade() {
                channel.on_join_ok(response);
            }
        });
        let me = self.me.clone();
        self.join_push.receive(PushStatus::Error, move |response| {
            if let Some(channel) = me.upgrade() {
                channel.on_join_error(response);
            }
        });
        let me = self.me.clone();
        self.join_push.receive(PushStatus::Timeout, move |_| {
            if let Some(channel) = me.upgrade() {
                channel.on_join_timeout();
            }
        });
    }

    fn on_join_ok(&self, response: &Value) {
        let (buffered, callback) = {
            let mut core = self.core.lock();
            core.state = ChannelState::Joined;
            (
                std::mem::take(&mut core.push_buffer),
                core.subscribe_callback.clone(),
            )
        };
        self.rejoin_timer.reset();
        info!("Joined channel {}", self.topic);

        for push in buffered {
            push.send();
        }

        if !self.bind_server_filters(response) {
            warn!("Channel {}: {}", self.topic, POSTGRES_MISMATCH);
            self.unsubscribe(None);
            if let Some(callback) = callback {
                callback(SubscribeStatus::ChannelError(POSTGRES_MISMATCH.to_string()));
            }
            return;
        }
        if let Some(callback) = callback {
            callback(SubscribeStatus::Subscribed);
        }
    }

    /// Copy the server-assigned ids onto the postgres bindings, in order.
    /// Returns false when the server's list disagrees with ours.
    fn bind_server_filters(&self, response: &Value) -> bool {
        let server: Vec<ServerPostgresFilter> = response
            .get(events::POSTGRES_CHANGES)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let mut core = self.core.lock();
        let postgres_bindings = core
            .bindings
            .iter_mut()
            .filter(|b| b.event == BindingEvent::PostgresChanges);
        for (idx, binding) in postgres_bindings.enumerate() {
            match server.get(idx) {
                Some(filter) if filter.agrees_with(&binding.filter.to_postgres()) => {
                    binding.server_id = Some(filter.id);
                }
                _ => return false,
            }
        }
        true
    }

    fn on_join_error(&self, response: &Value) {
        let reason = response
            .get("reason")
            .and_then(Value::as_str)
            .map_or_else(|| response.to_string(), str::to_string);
        warn!("Join rejected on {}: {}", self.topic, reason);
        let callback = self.core.lock().subscribe_callback.clone();
        if let Some(callback) = callback {
            callback(SubscribeStatus::ChannelError(reason));
        }
    }

    fn on_join_timeout(&self) {
        let (was_joining, callback) = {
            let mut core = self.core.lock();
            let joining = core.state == ChannelState::Joining;
            if joining {
                core.state = ChannelState::Errored;
            }
            (joining, core.subscribe_callback.clone())
        };
        if was_joining {
            debug!("Join timed out on {}", self.topic);
            self.rejoin_timer.schedule_timeout();
        }
        if let Some(callback) = callback {
            callback(SubscribeStatus::TimedOut);
        }
    }

    fn rejoin_until_connected(&self) {
        self.rejoin_timer.schedule_timeout();
        if self.socket_connected() {
            self.rejoin(None);
        }
    }

    fn rejoin(&self, timeout: Option<Duration>) {
        if self.state() == ChannelState::Leaving {
            return;
        }
        if let Some(socket) = self.socket.upgrade() {
            socket.leave_open_topic(&self.topic, self);
        }
        self.core.lock().state = ChannelState::Joining;
        self.join_push.resend(timeout.unwrap_or(self.timeout));
    }

    fn subscribe(&self, callback: Option<SubscribeCallback>, timeout: Option<Duration>) -> Result<()> {
        let filters: Vec<_> = {
            let mut core = self.core.lock();
            if core.joined_once {
                return Err(Error::SubscribeMultipleTimes {
                    topic: self.topic.clone(),
                });
            }
            core.joined_once = true;
            core.subscribe_callback = callback;
            core.bindings
                .iter()
                .filter(|b| b.event == BindingEvent::PostgresChanges)
                .map(|b| b.filter.to_postgres())
                .collect()
        };

        let token = self.socket.upgrade().and_then(|s| s.access_token());
        let config = json!({
            "broadcast": self.config.broadcast,
            "presence": self.config.presence,
            "postgres_changes": filters,
        });
        self.join_push.update_payload(|payload| {
            if let Payload::Json(Value::Object(map)) = payload {
                map.insert("config".to_string(), config);
                match token {
                    Some(token) => map.insert("access_token".to_string(), Value::String(token)),
                    None => map.remove("access_token"),
                };
            }
        });

        debug!("Subscribing to {}", self.topic);
        self.rejoin(timeout);
        Ok(())
    }

    pub(crate) fn push(
        &self,
        event: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<Push> {
        let push = Push::new(
            self.me.clone(),
            event,
            payload,
            timeout.unwrap_or(self.timeout),
        );
        let connected = self.socket_connected();
        let buffered = {
            let mut core = self.core.lock();
            if !core.joined_once || core.state == ChannelState::Closed {
                return Err(Error::PushBeforeJoin {
                    topic: self.topic.clone(),
                    event: event.to_string(),
                });
            }
            if connected && core.state == ChannelState::Joined {
                false
            } else {
                core.push_buffer.push(push.clone());
                true
            }
        };

        if buffered || !push.send() {
            debug!("Buffering {} on {} until joined", event, self.topic);
            if !buffered {
                self.core.lock().push_buffer.push(push.clone());
            }
            push.start_timeout();
        }
        Ok(push)
    }

    pub(crate) fn unsubscribe(&self, timeout: Option<Duration>) -> Push {
        let could_push = self.can_push();
        self.core.lock().state = ChannelState::Leaving;
        self.rejoin_timer.reset();
        self.join_push.destroy();

        let leave = Push::new(
            self.me.clone(),
            events::LEAVE,
            Payload::empty(),
            timeout.unwrap_or(self.timeout),
        );
        for status in [PushStatus::Ok, PushStatus::Timeout] {
            let me = self.me.clone();
            leave.receive(status, move |_| {
                if let Some(channel) = me.upgrade() {
                    channel.handle_close();
                }
            });
        }

        debug!("Leaving {}", self.topic);
        if self.socket_connected() {
            leave.transmit();
        }
        if !could_push {
            leave.trigger(PushStatus::Ok, empty_object());
        }
        leave
    }

    /// Unexpected socket loss or a server `phx_error`
    pub(crate) fn handle_error(&self, reason: &str) {
        let (callbacks, subscribe_callback) = {
            let mut core = self.core.lock();
            if matches!(core.state, ChannelState::Leaving | ChannelState::Closed) {
                return;
            }
            core.state = ChannelState::Errored;
            (core.error_callbacks.clone(), core.subscribe_callback.clone())
        };
        warn!("Channel {} errored: {}", self.topic, reason);
        self.rejoin_timer.schedule_timeout();

        for callback in callbacks {
            callback(reason);
        }
        if let Some(callback) = subscribe_callback {
            callback(SubscribeStatus::ChannelError(reason.to_string()));
        }
    }

    /// Buffered pushes are dropped from the buffer but keep their timeouts,
    /// so each still resolves
    fn handle_close(&self) {
        let (callbacks, subscribe_callback, buffered) = {
            let mut core = self.core.lock();
            if core.state == ChannelState::Closed {
                return;
            }
            core.state = ChannelState::Closed;
            core.bindings.clear();
            (
                core.close_callbacks.clone(),
                core.subscribe_callback.clone(),
                std::mem::take(&mut core.push_buffer),
            )
        };
        info!("Channel {} closed", self.topic);
        self.rejoin_timer.reset();
        self.join_push.destroy();
        if !buffered.is_empty() {
            debug!("Dropping {} buffered pushes on {}", buffered.len(), self.topic);
        }
        if let Some(socket) = self.socket.upgrade() {
            socket.remove(self);
        }

        for callback in callbacks {
            callback();
        }
        if let Some(callback) = subscribe_callback {
            callback(SubscribeStatus::Closed);
        }
    }

    /// Route an inbound frame addressed to this topic
    pub(crate) fn dispatch(&self, message: &Message) {
        let event = message.event.as_str();
        if events::LIFECYCLE.contains(&event) {
            if let Some(join_ref) = message.join_ref.as_deref() {
                if self.join_ref().as_deref() != Some(join_ref) {
                    debug!("Dropping stale {} on {} (join_ref {})", event, self.topic, join_ref);
                    return;
                }
            }
        }

        match event {
            events::REPLY => {
                let push = message
                    .reference
                    .as_deref()
                    .and_then(|r| self.replies.lock().get(r).cloned());
                if let (Some(push), Some(payload)) = (push, message.payload.as_json()) {
                    push.match_reply(payload);
                }
            }
            events::CLOSE => self.handle_close(),
            events::ERROR => {
                let reason = message
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("channel error");
                self.handle_error(reason);
            }
            _ => {
                if let Some(payload) = message.payload.as_json() {
                    self.presence.handle(event, payload);
                }
            }
        }

        self.trigger_bindings(event, &message.payload, message.reference.as_deref());
    }

    /// Invoke every binding that matches `event`
    pub(crate) fn trigger_bindings(&self, event: &str, payload: &Payload, reference: Option<&str>) {
        let event_type = event.to_ascii_lowercase();
        let callbacks: Vec<BindingCallback> = self
            .core
            .lock()
            .bindings
            .iter()
            .filter(|b| b.matches(&event_type, payload))
            .map(|b| Arc::clone(&b.callback))
            .collect();
        if callbacks.is_empty() {
            return;
        }

        let enriched = if event_type == events::POSTGRES_CHANGES {
            payload.get("data").map(|data| Payload::Json(enrich_change(data)))
        } else {
            None
        };
        let delivered = enriched.as_ref().unwrap_or(payload);
        for callback in callbacks {
            callback(delivered, reference);
        }
    }

    pub(crate) fn update_join_payload(&self, partial: &Map<String, Value>) {
        self.join_push.update_payload(|payload| {
            if let Payload::Json(Value::Object(map)) = payload {
                for (key, value) in partial {
                    map.insert(key.clone(), value.clone());
                }
            }
        });
    }

    pub(crate) fn clear_join_payload_key(&self, key: &str) {
        self.join_push.update_payload(|payload| {
            if let Payload::Json(Value::Object(map)) = payload {
                map.remove(key);
            }
        });
    }
}

impl Channel {
    pub(crate) fn new(
        topic: &str,
        config: ChannelConfig,
        socket: Weak<SocketInner>,
        realtime: &RealtimeConfig,
    ) -> Self {
        let topic = channel_topic(topic);
        let timeout = realtime.timeout();
        let backoff = stepped_backoff(realtime.reconnect_after_ms.clone());
        let join_payload = base_join_payload(&config);

        let inner = Arc::new_cyclic(|me: &Weak<ChannelInner>| {
            let rejoin_target = me.clone();
            ChannelInner {
                topic,
                config,
                timeout,
                socket,
                me: me.clone(),
                join_push: Push::new(me.clone(), events::JOIN, join_payload, timeout),
                rejoin_timer: Timer::new(
                    move || {
                        if let Some(channel) = rejoin_target.upgrade() {
                            channel.rejoin_until_connected();
                        }
                    },
                    backoff,
                ),
                presence: Presence::new(me.clone()),
                core: Mutex::new(ChannelCore {
                    state: ChannelState::Closed,
                    joined_once: false,
                    push_buffer: Vec::new(),
                    bindings: Vec::new(),
                    subscribe_callback: None,
                    close_callbacks: Vec::new(),
                    error_callbacks: Vec::new(),
                }),
                replies: Mutex::new(HashMap::new()),
            }
        });
        inner.install_join_hooks();
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &ChannelInner {
        &self.inner
    }

    pub(crate) fn is(&self, inner: &ChannelInner) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), inner)
    }

    /// Full wire topic, including the `realtime:` prefix
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_ref()
    }

    /// Payload sent with the next join
    pub fn join_payload(&self) -> Payload {
        self.inner.join_push.payload()
    }

    pub fn presence(&self) -> &Presence {
        &self.inner.presence
    }

    /// Register a callback for `event`, narrowed by `filter`
    pub fn on<E, F>(&self, event: E, filter: BindingFilter, callback: F) -> &Self
    where
        E: Into<BindingEvent>,
        F: Fn(&Payload, Option<&str>) + Send + Sync + 'static,
    {
        let binding = Binding::new(event.into(), filter, Arc::new(callback));
        self.inner.core.lock().bindings.push(binding);
        self
    }

    /// Remove every binding registered with exactly this event and filter
    pub fn off<E: Into<BindingEvent>>(&self, event: E, filter: &BindingFilter) -> &Self {
        let event = event.into();
        self.inner
            .core
            .lock()
            .bindings
            .retain(|b| !(b.event == event && &b.filter == filter));
        self
    }

    pub fn on_close<F>(&self, callback: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.core.lock().close_callbacks.push(Arc::new(callback));
        self
    }

    pub fn on_error<F>(&self, callback: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.core.lock().error_callbacks.push(Arc::new(callback));
        self
    }

    /// Join the topic
    ///
    /// # Errors
    /// Returns `Error::SubscribeMultipleTimes` on a second call.
    pub fn subscribe(&self) -> Result<&Self> {
        self.inner.subscribe(None, None)?;
        Ok(self)
    }

    /// Join the topic, reporting every subscription status change
    ///
    /// # Errors
    /// Returns `Error::SubscribeMultipleTimes` on a second call.
    pub fn subscribe_with<F>(&self, callback: F, timeout: Option<Duration>) -> Result<&Self>
    where
        F: Fn(SubscribeStatus) + Send + Sync + 'static,
    {
        self.inner.subscribe(Some(Arc::new(callback)), timeout)?;
        Ok(self)
    }

    /// Send `event`, or buffer it until the join completes
    ///
    /// # Errors
    /// Returns `Error::PushBeforeJoin` if the channel was never subscribed or
    /// has been closed.
    pub fn push(
        &self,
        event: &str,
        payload: impl Into<Payload>,
        timeout: Option<Duration>,
    ) -> Result<Push> {
        self.inner.push(event, payload.into(), timeout)
    }

    /// Broadcast `payload` under `event` to the other members of the topic
    ///
    /// # Errors
    /// Same as [`Channel::push`].
    pub fn send_broadcast(&self, event: &str, payload: Value) -> Result<Push> {
        self.push(
            events::BROADCAST,
            json!({"type": "broadcast", "event": event, "payload": payload}),
            None,
        )
    }

    /// Start tracking this client's presence with `payload` as its meta
    ///
    /// # Errors
    /// Same as [`Channel::push`].
    pub fn track(&self, payload: Value) -> Result<Push> {
        self.push(
            events::PRESENCE,
            json!({"type": "presence", "event": "track", "payload": payload}),
            None,
        )
    }

    /// # Errors
    /// Same as [`Channel::push`].
    pub fn untrack(&self) -> Result<Push> {
        self.push(
            events::PRESENCE,
            json!({"type": "presence", "event": "untrack"}),
            None,
        )
    }

    /// Leave the topic. The returned push resolves once the leave completes.
    pub fn unsubscribe(&self, timeout: Option<Duration>) -> Push {
        self.inner.unsubscribe(timeout)
    }

    /// Merge `partial` into the stored join payload
    pub fn update_join_payload(&self, partial: &Map<String, Value>) {
        self.inner.update_join_payload(partial);
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.inner.topic)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
