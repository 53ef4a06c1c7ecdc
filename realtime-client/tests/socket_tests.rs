//! Socket connection management against a scripted server

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

use async_trait::async_trait;
use url::Url;

use realtime_client::{
    ChannelState, Connection, ConnectionState, Frame, Outbound, PushStatus, Transport,
};
use realtime_common::types::{events, ProtocolVersion, PHOENIX_TOPIC};
use realtime_common::error::{Error, Result};
use realtime_common::{ChannelConfig, Message, Payload, RealtimeConfig};

use common::{connected, joined, quiet_config, settle};

/// Records every attempt and refuses it
struct Refusing {
    attempts: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl Transport for Refusing {
    async fn connect(&self, _url: &Url) -> Result<Connection> {
        self.attempts.lock().push(Instant::now());
        Err(Error::ConnectionFailed("refused".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_open_callbacks_and_state() {
    let (transport, mut hub) = common::mock_transport(ProtocolVersion::V1);
    let socket =
        realtime_client::Socket::with_transport(common::ENDPOINT, quiet_config(), transport)
            .unwrap();
    let opened = Arc::new(AtomicUsize::new(0));
    let opened_clone = opened.clone();
    socket.on_open(move || {
        opened_clone.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(socket.connection_state(), ConnectionState::Closed);

    socket.connect();
    assert_eq!(socket.connection_state(), ConnectionState::Connecting);
    socket.connect();

    let _server = hub.accept().await;
    settle().await;
    assert!(socket.is_connected());
    assert_eq!(opened.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_reply_keeps_connection() {
    let config = RealtimeConfig {
        heartbeat_interval_ms: 1_000,
        ..RealtimeConfig::default()
    };
    let (socket, _hub, mut server) = connected(config).await;

    for _ in 0..3 {
        let heartbeat = server.next_any().await;
        assert_eq!(heartbeat.topic, PHOENIX_TOPIC);
        assert_eq!(heartbeat.event, events::HEARTBEAT);
        server.reply(&heartbeat, "ok", json!({}));
        settle().await;
    }
    assert!(socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_missed_heartbeat_closes_and_reconnects() {
    let config = RealtimeConfig {
        heartbeat_interval_ms: 1_000,
        ..RealtimeConfig::default()
    };
    let (socket, mut hub, mut server) = connected(config).await;
    let closes = Arc::new(AtomicUsize::new(0));
    let closes_clone = closes.clone();
    socket.on_close(move |_, reason| {
        assert_eq!(reason, "heartbeat timeout");
        closes_clone.fetch_add(1, Ordering::SeqCst);
    });

    let start = Instant::now();
    let heartbeat = server.next_any().await;
    assert_eq!(heartbeat.event, events::HEARTBEAT);

    match server.next_outbound().await {
        Outbound::Close { reason, .. } => assert_eq!(reason, "heartbeat timeout"),
        other => panic!("expected close, got {other:?}"),
    }
    assert!(start.elapsed().as_millis().abs_diff(2_000) <= 5);
    settle().await;
    assert_eq!(socket.connection_state(), ConnectionState::Closed);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    let _reconnected = hub.accept().await;
    settle().await;
    assert!(socket.is_connected());
    assert!(start.elapsed().as_millis().abs_diff(3_000) <= 5);
}

#[tokio::test(start_paused = true)]
async fn test_socket_close_errors_channels_then_rejoins() {
    let (socket, mut hub, mut server) = connected(quiet_config()).await;
    let channel = joined(&socket, &mut server, "room").await;

    server.close(1006);
    settle().await;
    assert_eq!(socket.connection_state(), ConnectionState::Closed);
    assert_eq!(channel.state(), ChannelState::Errored);

    let mut server = hub.accept().await;
    settle().await;
    assert!(socket.is_connected());

    let rejoin = server.next_message().await;
    assert_eq!(rejoin.event, events::JOIN);
    assert_eq!(rejoin.topic, "realtime:room");
    server.reply(&rejoin, "ok", json!({}));
    settle().await;
    assert!(channel.is_joined());
}

#[tokio::test(start_paused = true)]
async fn test_presence_resyncs_after_reconnect() {
    let (socket, mut hub, mut server) = connected(quiet_config()).await;
    let channel = joined(&socket, &mut server, "room").await;
    let presence = channel.presence();

    server.send(Message::new(
        "realtime:room",
        events::PRESENCE_STATE,
        json!({
            "u1": {"metas": [{"phx_ref": "a"}]},
            "u2": {"metas": [{"phx_ref": "b"}]},
        }),
    ));
    settle().await;
    assert!(!presence.in_pending_sync_state());
    assert_eq!(presence.state().len(), 2);

    let leaves = Arc::new(Mutex::new(Vec::new()));
    let log = leaves.clone();
    presence.on_leave(move |key, _, _| log.lock().push(key.to_string()));

    server.close(1006);
    settle().await;
    let mut server = hub.accept().await;
    let rejoin = server.next_message().await;
    assert_eq!(rejoin.event, events::JOIN);
    assert!(presence.in_pending_sync_state());

    server.send(Message::new(
        "realtime:room",
        events::PRESENCE_DIFF,
        json!({"joins": {"u3": {"metas": [{"phx_ref": "c"}]}}, "leaves": {}}),
    ));
    settle().await;
    assert_eq!(presence.pending_diffs(), 1);
    assert!(!presence.state().contains_key("u3"));

    server.reply(&rejoin, "ok", json!({}));
    server.send(Message::new(
        "realtime:room",
        events::PRESENCE_STATE,
        json!({"u1": {"metas": [{"phx_ref": "a"}]}}),
    ));
    settle().await;

    assert_eq!(*leaves.lock(), vec!["u2".to_string()]);
    assert_eq!(
        presence.state().keys().cloned().collect::<Vec<_>>(),
        vec!["u1".to_string(), "u3".to_string()]
    );
    assert_eq!(presence.pending_diffs(), 0);
    assert!(!presence.in_pending_sync_state());
}

#[tokio::test(start_paused = true)]
async fn test_successful_open_resets_reconnect_backoff() {
    let (socket, mut hub, server) = connected(quiet_config()).await;
    let start = Instant::now();

    server.close(1006);
    settle().await;
    let second = hub.accept().await;
    settle().await;
    assert!(start.elapsed().as_millis().abs_diff(1_000) <= 5);

    second.close(1006);
    settle().await;
    let _third = hub.accept().await;
    settle().await;
    assert!(start.elapsed().as_millis().abs_diff(2_000) <= 5);
    assert!(socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_failed_connects_back_off() {
    let config = RealtimeConfig {
        reconnect_after_ms: vec![1_000, 2_000, 5_000],
        ..quiet_config()
    };
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let socket = realtime_client::Socket::with_transport(
        common::ENDPOINT,
        config,
        Arc::new(Refusing {
            attempts: attempts.clone(),
        }),
    )
    .unwrap();
    let start = Instant::now();
    socket.connect();

    tokio::time::sleep(Duration::from_millis(13_500)).await;
    let offsets: Vec<u128> = attempts
        .lock()
        .iter()
        .map(|at: &Instant| at.duration_since(start).as_millis())
        .collect();
    assert_eq!(offsets.len(), 5);
    for (offset, expected) in offsets.iter().zip([0u128, 1_000, 3_000, 8_000, 13_000]) {
        assert!(offset.abs_diff(expected) <= 5, "{offset} vs {expected}");
    }
    assert_eq!(socket.connection_state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_reconnecting() {
    let (socket, mut hub, mut server) = connected(quiet_config()).await;
    let channel = joined(&socket, &mut server, "room").await;

    socket.disconnect(Some(1000), Some("bye"));
    match server.next_outbound().await {
        Outbound::Close { code, reason } => {
            assert_eq!(code, 1000);
            assert_eq!(reason, "bye");
        }
        other => panic!("expected close, got {other:?}"),
    }
    assert_eq!(socket.connection_state(), ConnectionState::Closed);
    assert!(channel.is_joined());

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    assert!(hub.accepted_nothing());
}

#[tokio::test(start_paused = true)]
async fn test_set_auth_pushes_token_to_joined_channels() {
    let (socket, _hub, mut server) = connected(quiet_config()).await;
    let channel = joined(&socket, &mut server, "room").await;
    let idle = socket.channel("idle", ChannelConfig::default());

    socket.set_auth(Some("fresh-token".into()));
    let refresh = server.next_message().await;
    assert_eq!(refresh.topic, "realtime:room");
    assert_eq!(refresh.event, events::ACCESS_TOKEN);
    assert_eq!(refresh.payload.get("access_token"), Some(&json!("fresh-token")));

    settle().await;
    assert!(server.try_next().is_none());
    assert_eq!(
        channel.join_payload().get("access_token"),
        Some(&json!("fresh-token"))
    );
    assert_eq!(
        idle.join_payload().get("access_token"),
        Some(&json!("fresh-token"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_remove_channel_disconnects_when_empty() {
    let (socket, _hub, mut server) = connected(quiet_config()).await;
    let channel = joined(&socket, &mut server, "room").await;

    let remover = socket.clone();
    let removal = tokio::spawn(async move { remover.remove_channel(&channel).await });

    let leave = server.next_message().await;
    assert_eq!(leave.event, events::LEAVE);
    server.reply(&leave, "ok", json!({}));

    assert_eq!(removal.await.unwrap(), PushStatus::Ok);
    assert!(socket.channels().is_empty());
    assert_eq!(socket.connection_state(), ConnectionState::Closed);
    assert!(matches!(server.next_outbound().await, Outbound::Close { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_remove_all_channels() {
    let (socket, _hub, mut server) = connected(quiet_config()).await;
    joined(&socket, &mut server, "a").await;
    joined(&socket, &mut server, "b").await;

    let remover = socket.clone();
    let removal = tokio::spawn(async move { remover.remove_all_channels().await });

    for _ in 0..2 {
        let leave = server.next_message().await;
        assert_eq!(leave.event, events::LEAVE);
        server.reply(&leave, "ok", json!({}));
    }

    assert_eq!(removal.await.unwrap(), vec![PushStatus::Ok, PushStatus::Ok]);
    assert!(socket.channels().is_empty());
    assert!(!socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_message_callbacks_see_every_frame() {
    let (socket, _hub, server) = connected(quiet_config()).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = seen.clone();
    socket.on_message(move |_| {
        seen_clone.fetch_add(1, Ordering::SeqCst);
    });

    server.send(realtime_common::Message::new("realtime:nobody", "shout", json!({})));
    server.send(realtime_common::Message::new(PHOENIX_TOPIC, "notice", json!({})));
    settle().await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_v2_binary_broadcast_round_trip() {
    let config = RealtimeConfig {
        protocol: ProtocolVersion::V2,
        ..quiet_config()
    };
    let (socket, _hub, mut server) = connected(config).await;
    let channel = joined(&socket, &mut server, "bin").await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    channel.on("blob", realtime_client::BindingFilter::none(), move |payload, _| {
        received_clone.lock().push(payload.clone());
    });

    channel
        .push("blob", Payload::from(vec![1u8, 2, 3]), None)
        .unwrap();
    match server.next_outbound().await {
        Outbound::Frame(Frame::Binary(bytes)) => {
            assert_eq!(bytes[0], 0);
            assert!(bytes.ends_with(b"realtime:binblob\x01\x02\x03"));
        }
        other => panic!("expected binary push, got {other:?}"),
    }

    let mut broadcast = vec![2u8, 12, 4];
    broadcast.extend_from_slice(b"realtime:bin");
    broadcast.extend_from_slice(b"blob");
    broadcast.push(9);
    server.send_frame(Frame::Binary(broadcast.into()));
    settle().await;
    assert_eq!(*received.lock(), vec![Payload::from(vec![9u8])]);
}
