//! Outbound messages awaiting a single terminal reply
//!
//! A `Push` resolves exactly once per send cycle with `ok`, `error` or
//! `timeout`. The first recorded outcome wins; later triggers are ignored,
//! so a server reply that arrives after the client-side timeout is dropped.
//! Callbacks attached after the outcome is known are replayed immediately.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use realtime_common::types::{Message, Payload};

use crate::channel::ChannelInner;

/// Terminal status of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushStatus {
    Ok,
    Error,
    Timeout,
}

impl PushStatus {
    /// Parse the `status` field of a `phx_reply`
    pub fn from_wire(status: &str) -> Option<Self> {
        match status {
            "ok" => Some(Self::Ok),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

/// The recorded outcome of a push
#[derive(Debug, Clone, PartialEq)]
pub struct PushReply {
    pub status: PushStatus,
    pub response: Value,
}

/// Callback invoked with the reply's `response`
pub type ReplyCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct PushState {
    reference: Option<String>,
    received: Option<PushReply>,
    hooks: Vec<(PushStatus, ReplyCallback)>,
    timeout_task: Option<JoinHandle<()>>,
}

pub(crate) struct PushInner {
    channel: Weak<ChannelInner>,
    event: String,
    payload: Mutex<Payload>,
    timeout: Mutex<Duration>,
    state: Mutex<PushState>,
}

/// A single outbound message and its reply hooks
#[derive(Clone)]
pub struct Push {
    inner: Arc<PushInner>,
}

impl Push {
    pub(crate) fn new(
        channel: Weak<ChannelInner>,
        event: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PushInner {
                channel,
                event: event.to_string(),
                payload: Mutex::new(payload),
                timeout: Mutex::new(timeout),
                state: Mutex::new(PushState::default()),
            }),
        }
    }

    pub fn event(&self) -> &str {
        &self.inner.event
    }

    pub fn payload(&self) -> Payload {
        self.inner.payload.lock().clone()
    }

    /// Ref assigned when the push was last sent or buffered
    pub fn reference(&self) -> Option<String> {
        self.inner.state.lock().reference.clone()
    }

    pub fn timeout(&self) -> Duration {
        *self.inner.timeout.lock()
    }

    /// The terminal reply, if one has been recorded
    pub fn received(&self) -> Option<PushReply> {
        self.inner.state.lock().received.clone()
    }

    pub(crate) fn update_payload<F>(&self, f: F)
    where
        F: FnOnce(&mut Payload),
    {
        let mut payload = self.inner.payload.lock();
        f(&mut *payload);
    }

    fn has_received(&self, status: PushStatus) -> bool {
        self.inner
            .state
            .lock()
            .received
            .as_ref()
            .is_some_and(|r| r.status == status)
    }

    /// Send the push if its channel can currently push. Returns false when
    /// the push was not sent.
    pub fn send(&self) -> bool {
        let Some(channel) = self.inner.channel.upgrade() else {
            return false;
        };
        if !channel.can_push() {
            debug!("push {} {} deferred: channel cannot push", channel.topic(), self.event());
            return false;
        }
        self.transmit();
        true
    }

    /// Send without the channel-state check; join and leave pushes go out
    /// while the channel is still joining or already leaving.
    pub(crate) fn transmit(&self) {
        if self.has_received(PushStatus::Timeout) {
            return;
        }
        let Some(channel) = self.inner.channel.upgrade() else {
            return;
        };

        self.start_timeout();
        let reference = self.inner.state.lock().reference.clone();

        let message = Message {
            topic: channel.topic().to_string(),
            event: self.inner.event.clone(),
            payload: self.payload(),
            reference,
            join_ref: channel.join_ref(),
        };
        channel.socket_push(message);
    }

    /// Reset the send cycle and transmit again with a new ref
    pub(crate) fn resend(&self, timeout: Duration) {
        *self.inner.timeout.lock() = timeout;
        self.cancel_ref_event();
        {
            let mut state = self.inner.state.lock();
            state.reference = None;
            state.received = None;
        }
        self.transmit();
    }

    /// Assign a fresh ref, register for its reply, and arm the timeout
    pub(crate) fn start_timeout(&self) {
        self.cancel_timeout();
        self.cancel_ref_event();

        let Some(channel) = self.inner.channel.upgrade() else {
            return;
        };
        let Some(reference) = channel.make_ref() else {
            return;
        };
        channel.register_reply(&reference, self.clone());
        self.inner.state.lock().reference = Some(reference);

        let timeout = self.timeout();
        let push = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            push.trigger(PushStatus::Timeout, Value::Object(serde_json::Map::new()));
        });
        self.inner.state.lock().timeout_task = Some(task);
    }

    /// Register a callback for `status`. If that outcome has already been
    /// recorded the callback runs immediately with the stored response.
    pub fn receive<F>(&self, status: PushStatus, callback: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let callback: ReplyCallback = Arc::new(callback);
        let replay = {
            let mut state = self.inner.state.lock();
            state.hooks.push((status, Arc::clone(&callback)));
            state
                .received
                .as_ref()
                .filter(|r| r.status == status)
                .map(|r| r.response.clone())
        };
        if let Some(response) = replay {
            callback(&response);
        }
        self
    }

    /// Record the terminal outcome and run its callbacks. Ignored when an
    /// outcome is already recorded for this send cycle.
    pub fn trigger(&self, status: PushStatus, response: Value) {
        let (reference, callbacks) = {
            let mut state = self.inner.state.lock();
            if state.received.is_some() {
                return;
            }
            state.received = Some(PushReply {
                status,
                response: response.clone(),
            });
            if let Some(task) = state.timeout_task.take() {
                task.abort();
            }
            let callbacks: Vec<ReplyCallback> = state
                .hooks
                .iter()
                .filter(|(s, _)| *s == status)
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            (state.reference.clone(), callbacks)
        };

        if let (Some(reference), Some(channel)) = (reference, self.inner.channel.upgrade()) {
            channel.forget_reply(&reference);
        }
        for callback in callbacks {
            callback(&response);
        }
    }

    /// Route a `phx_reply` payload `{status, response}` to `trigger`
    pub(crate) fn match_reply(&self, payload: &Value) {
        let Some(status) = payload
            .get("status")
            .and_then(Value::as_str)
            .and_then(PushStatus::from_wire)
        else {
            debug!("ignoring reply with unknown status for {}", self.event());
            return;
        };
        let response = payload
            .get("response")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        self.trigger(status, response);
    }

    /// Drop the reply registration and timeout without recording an outcome
    pub(crate) fn destroy(&self) {
        self.cancel_ref_event();
        self.cancel_timeout();
    }

    fn cancel_timeout(&self) {
        if let Some(task) = self.inner.state.lock().timeout_task.take() {
            task.abort();
        }
    }

    fn cancel_ref_event(&self) {
        let reference = self.inner.state.lock().reference.clone();
        if let (Some(reference), Some(channel)) = (reference, self.inner.channel.upgrade()) {
            channel.forget_reply(&reference);
        }
    }

    /// Wait for the terminal outcome of the current send cycle
    pub async fn outcome(&self) -> PushReply {
        let (tx, rx) = oneshot::channel::<PushReply>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        for status in [PushStatus::Ok, PushStatus::Error, PushStatus::Timeout] {
            let slot = Arc::clone(&slot);
            self.receive(status, move |response| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(PushReply {
                        status,
                        response: response.clone(),
                    });
                }
            });
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => PushReply {
                status: PushStatus::Timeout,
                response: Value::Object(serde_json::Map::new()),
            },
        }
    }
}

impl std::fmt::Debug for Push {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Push")
            .field("event", &self.inner.event)
            .field("ref", &state.reference)
            .field("received", &state.received)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detached_push() -> Push {
        Push::new(Weak::new(), "shout", Payload::empty(), Duration::from_secs(10))
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Value) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        (count, move |_: &Value| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_first_trigger_wins() {
        let push = detached_push();
        let (ok, ok_cb) = counter();
        let (err, err_cb) = counter();
        let (timeout, timeout_cb) = counter();
        push.receive(PushStatus::Ok, ok_cb)
            .receive(PushStatus::Error, err_cb)
            .receive(PushStatus::Timeout, timeout_cb);

        push.trigger(PushStatus::Error, json!({"reason": "denied"}));
        push.trigger(PushStatus::Ok, json!({}));
        push.trigger(PushStatus::Timeout, json!({}));
        push.trigger(PushStatus::Error, json!({"reason": "again"}));

        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(err.load(Ordering::SeqCst), 1);
        assert_eq!(timeout.load(Ordering::SeqCst), 0);
        assert_eq!(
            push.received(),
            Some(PushReply {
                status: PushStatus::Error,
                response: json!({"reason": "denied"})
            })
        );
    }

    #[test]
    fn test_late_receive_replays() {
        let push = detached_push();
        push.trigger(PushStatus::Ok, json!({"n": 1}));

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        push.receive(PushStatus::Ok, move |resp| {
            *seen_clone.lock() = Some(resp.clone());
        });
        assert_eq!(*seen.lock(), Some(json!({"n": 1})));

        let (err, err_cb) = counter();
        push.receive(PushStatus::Error, err_cb);
        assert_eq!(err.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_match_reply_parses_status() {
        let push = detached_push();
        let (ok, ok_cb) = counter();
        push.receive(PushStatus::Ok, ok_cb);

        push.match_reply(&json!({"status": "bogus"}));
        assert!(push.received().is_none());

        push.match_reply(&json!({"status": "ok"}));
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(push.received().unwrap().response, json!({}));
    }

    #[tokio::test]
    async fn test_outcome_after_trigger() {
        let push = detached_push();
        push.trigger(PushStatus::Timeout, json!({}));
        let reply = push.outcome().await;
        assert_eq!(reply.status, PushStatus::Timeout);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(PushStatus::from_wire("ok"), Some(PushStatus::Ok));
        assert_eq!(PushStatus::from_wire("nope"), None);
        assert_eq!(PushStatus::Error.as_str(), "error");
    }
}
