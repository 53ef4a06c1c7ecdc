//! Transport seam between the socket and the physical connection
//!
//! A `Transport` opens a connection and hands back a pair of channel
//! endpoints. The socket never touches the WebSocket stream directly, so
//! tests can drive it with an in-memory transport.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error};
use url::Url;

use realtime_common::error::{Error, Result};

/// Normal closure status code
pub const CLOSE_NORMAL: u16 = 1000;

/// A raw frame as carried by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Instructions from the socket to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    Close { code: u16, reason: String },
}

/// Events raised by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// An open connection
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections to a realtime endpoint
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `url`
    ///
    /// # Errors
    /// Returns `Error::ConnectionFailed` if the connection cannot be opened.
    async fn connect(&self, url: &Url) -> Result<Connection>;
}

/// WebSocket transport backed by tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> Result<Connection> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let writer_events = in_tx.clone();
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                let (message, closing) = match outbound {
                    Outbound::Frame(Frame::Text(text)) => (WsMessage::Text(text), false),
                    Outbound::Frame(Frame::Binary(bytes)) => {
                        (WsMessage::Binary(bytes.to_vec()), false)
                    }
                    Outbound::Close { code, reason } => (
                        WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })),
                        true,
                    ),
                };

                if let Err(e) = sink.send(message).await {
                    error!("WebSocket write failed: {}", e);
                    let _ = writer_events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let event = match message {
                    Ok(WsMessage::Text(text)) => TransportEvent::Frame(Frame::Text(text)),
                    Ok(WsMessage::Binary(bytes)) => {
                        TransportEvent::Frame(Frame::Binary(Bytes::from(bytes)))
                    }
                    Ok(WsMessage::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                            .unwrap_or((None, String::new()));
                        let _ = in_tx.send(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("WebSocket read failed: {}", e);
                        let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                        let _ = in_tx.send(TransportEvent::Closed {
                            code: None,
                            reason: e.to_string(),
                        });
                        return;
                    }
                };
                if in_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(TransportEvent::Closed {
                code: None,
                reason: "stream ended".to_string(),
            });
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
