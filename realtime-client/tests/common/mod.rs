//! In-memory transport and a scripted server for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use realtime_client::{
    Channel, Connection, Frame, Outbound, Serializer, Socket, Transport, TransportEvent,
};
use realtime_common::error::{Error, Result};
use realtime_common::types::{events, Message, ProtocolVersion};
use realtime_common::{ChannelConfig, RealtimeConfig};

pub const ENDPOINT: &str = "ws://localhost:4000/socket";

/// Hands every accepted connection to the test through a `MockHub`
pub struct MockTransport {
    accepted: mpsc::UnboundedSender<MockServer>,
    version: ProtocolVersion,
}

pub struct MockHub {
    accepted: mpsc::UnboundedReceiver<MockServer>,
}

pub fn mock_transport(version: ProtocolVersion) -> (Arc<MockTransport>, MockHub) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockTransport {
            accepted: tx,
            version,
        }),
        MockHub { accepted: rx },
    )
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _url: &Url) -> Result<Connection> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.accepted
            .send(MockServer {
                from_client: out_rx,
                to_client: in_tx,
                serializer: Serializer::new(self.version),
            })
            .map_err(|_| Error::ConnectionFailed("hub dropped".into()))?;
        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl MockHub {
    pub async fn accept(&mut self) -> MockServer {
        self.accepted.recv().await.expect("transport dropped")
    }

    pub fn accepted_nothing(&mut self) -> bool {
        self.accepted.try_recv().is_err()
    }
}

/// Server end of one mock connection
pub struct MockServer {
    from_client: mpsc::UnboundedReceiver<Outbound>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    serializer: Serializer,
}

impl MockServer {
    pub async fn next_outbound(&mut self) -> Outbound {
        self.from_client.recv().await.expect("client hung up")
    }

    /// Next frame from the client, heartbeats included
    pub async fn next_any(&mut self) -> Message {
        match self.next_outbound().await {
            Outbound::Frame(frame) => self.serializer.decode(&frame).expect("decodable frame"),
            Outbound::Close { code, reason } => panic!("unexpected close {code}: {reason}"),
        }
    }

    /// Next non-heartbeat frame from the client
    pub async fn next_message(&mut self) -> Message {
        loop {
            let message = self.next_any().await;
            if message.event != events::HEARTBEAT {
                return message;
            }
        }
    }

    /// Next non-heartbeat frame that has already arrived
    pub fn try_next(&mut self) -> Option<Message> {
        while let Ok(outbound) = self.from_client.try_recv() {
            if let Outbound::Frame(frame) = outbound {
                let message = self.serializer.decode(&frame).expect("decodable frame");
                if message.event != events::HEARTBEAT {
                    return Some(message);
                }
            }
        }
        None
    }

    pub fn send(&self, message: Message) {
        let frame = self.serializer.encode(&message).expect("encodable message");
        self.send_frame(frame);
    }

    pub fn send_frame(&self, frame: Frame) {
        self.to_client
            .send(TransportEvent::Frame(frame))
            .expect("client reader alive");
    }

    pub fn reply(&self, to: &Message, status: &str, response: Value) {
        self.send(Message::reply(to, status, response));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(TransportEvent::Closed {
            code: Some(code),
            reason: "server closed".into(),
        });
    }
}

/// Let spawned tasks run without advancing the clock
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Defaults with heartbeats pushed out of the way
pub fn quiet_config() -> RealtimeConfig {
    RealtimeConfig {
        heartbeat_interval_ms: 3_600_000,
        ..RealtimeConfig::default()
    }
}

pub async fn connected(config: RealtimeConfig) -> (Socket, MockHub, MockServer) {
    let (transport, mut hub) = mock_transport(config.protocol);
    let socket = Socket::with_transport(ENDPOINT, config, transport).expect("valid socket");
    socket.connect();
    let server = hub.accept().await;
    settle().await;
    (socket, hub, server)
}

pub async fn joined(socket: &Socket, server: &mut MockServer, topic: &str) -> Channel {
    let channel = socket.channel(topic, ChannelConfig::default());
    channel.subscribe().expect("first subscribe");
    let join = server.next_message().await;
    assert_eq!(join.event, events::JOIN);
    server.reply(&join, "ok", json!({}));
    settle().await;
    channel
}
