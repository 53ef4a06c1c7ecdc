//! Frame encoding and decoding for both protocol versions
//!
//! `1.0.0` frames are JSON objects. `2.0.0` frames are JSON arrays
//! `[join_ref, ref, topic, event, payload]`, except binary payloads which use
//! a compact length-prefixed layout:
//!
//! ```text
//! push (0):      kind | join_ref_len | ref_len | topic_len | event_len | strings.. | bytes
//! reply (1):     kind | join_ref_len | ref_len | topic_len | status_len | strings.. | bytes
//! broadcast (2): kind | topic_len | event_len | strings.. | bytes
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use realtime_common::error::{Error, Result};
use realtime_common::types::{events, Message, Payload, ProtocolVersion};

use crate::transport::Frame;

const KIND_PUSH: u8 = 0;
const KIND_REPLY: u8 = 1;
const KIND_BROADCAST: u8 = 2;

/// Version 1 wire shape
#[derive(Debug, Serialize, Deserialize)]
struct ObjectFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

/// Version 2 wire shape
type ArrayFrame = (Option<String>, Option<String>, String, String, Value);

/// Encodes and decodes frames for one protocol version
#[derive(Debug, Clone, Copy, Default)]
pub struct Serializer {
    version: ProtocolVersion,
}

impl Serializer {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    /// Encode `message` into a frame
    ///
    /// # Errors
    /// Returns `Error::Protocol` for binary payloads under `1.0.0` or for
    /// fields too long for the binary header.
    pub fn encode(&self, message: &Message) -> Result<Frame> {
        match (&message.payload, self.version) {
            (Payload::Json(payload), ProtocolVersion::V1) => {
                let frame = ObjectFrame {
                    topic: message.topic.clone(),
                    event: message.event.clone(),
                    payload: payload.clone(),
                    reference: message.reference.clone(),
                    join_ref: message.join_ref.clone(),
                };
                Ok(Frame::Text(serde_json::to_string(&frame)?))
            }
            (Payload::Json(payload), ProtocolVersion::V2) => {
                let frame: ArrayFrame = (
                    message.join_ref.clone(),
                    message.reference.clone(),
                    message.topic.clone(),
                    message.event.clone(),
                    payload.clone(),
                );
                Ok(Frame::Text(serde_json::to_string(&frame)?))
            }
            (Payload::Binary(bytes), ProtocolVersion::V2) => {
                Ok(Frame::Binary(encode_binary_push(message, bytes)?))
            }
            (Payload::Binary(_), ProtocolVersion::V1) => Err(Error::Protocol(
                "binary payloads require protocol 2.0.0".to_string(),
            )),
        }
    }

    /// Decode a frame into a message
    ///
    /// # Errors
    /// Returns `Error::Serialization` for malformed JSON and
    /// `Error::Protocol` for malformed binary frames.
    pub fn decode(&self, frame: &Frame) -> Result<Message> {
        match frame {
            Frame::Text(text) => self.decode_text(text),
            Frame::Binary(bytes) => decode_binary(bytes),
        }
    }

    fn decode_text(&self, text: &str) -> Result<Message> {
        match self.version {
            ProtocolVersion::V1 => {
                let frame: ObjectFrame = serde_json::from_str(text)?;
                Ok(Message {
                    topic: frame.topic,
                    event: frame.event,
                    payload: Payload::Json(frame.payload),
                    reference: frame.reference,
                    join_ref: frame.join_ref,
                })
            }
            ProtocolVersion::V2 => {
                let (join_ref, reference, topic, event, payload): ArrayFrame =
                    serde_json::from_str(text)?;
                Ok(Message {
                    topic,
                    event,
                    payload: Payload::Json(payload),
                    reference,
                    join_ref,
                })
            }
        }
    }
}

fn header_len(field: &str, value: &str) -> Result<u8> {
    u8::try_from(value.len())
        .map_err(|_| Error::Protocol(format!("{field} exceeds 255 bytes in binary frame")))
}

fn encode_binary_push(message: &Message, payload: &Bytes) -> Result<Bytes> {
    let join_ref = message.join_ref.as_deref().unwrap_or("");
    let reference = message.reference.as_deref().unwrap_or("");

    let mut buf = BytesMut::with_capacity(
        5 + join_ref.len()
            + reference.len()
            + message.topic.len()
            + message.event.len()
            + payload.len(),
    );
    buf.put_u8(KIND_PUSH);
    buf.put_u8(header_len("join_ref", join_ref)?);
    buf.put_u8(header_len("ref", reference)?);
    buf.put_u8(header_len("topic", &message.topic)?);
    buf.put_u8(header_len("event", &message.event)?);
    buf.put_slice(join_ref.as_bytes());
    buf.put_slice(reference.as_bytes());
    buf.put_slice(message.topic.as_bytes());
    buf.put_slice(message.event.as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Cursor over a binary frame
struct Reader<'a> {
    bytes: &'a Bytes,
    offset: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8> {
        let value = *self
            .bytes
            .get(self.offset)
            .ok_or_else(|| Error::Protocol("truncated binary header".to_string()))?;
        self.offset += 1;
        Ok(value)
    }

    fn string(&mut self, len: u8) -> Result<String> {
        let end = self.offset + usize::from(len);
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| Error::Protocol("truncated binary frame".to_string()))?;
        self.offset = end;
        String::from_utf8(slice.to_vec())
            .map_err(|e| Error::Protocol(format!("invalid utf-8 in binary frame: {e}")))
    }

    fn rest(&self) -> Bytes {
        self.bytes.slice(self.offset..)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn decode_binary(bytes: &Bytes) -> Result<Message> {
    let mut reader = Reader { bytes, offset: 0 };
    match reader.u8()? {
        KIND_PUSH => {
            let join_ref_len = reader.u8()?;
            let topic_len = reader.u8()?;
            let event_len = reader.u8()?;
            let join_ref = reader.string(join_ref_len)?;
            let topic = reader.string(topic_len)?;
            let event = reader.string(event_len)?;
            Ok(Message {
                topic,
                event,
                payload: Payload::Binary(reader.rest()),
                reference: None,
                join_ref: non_empty(join_ref),
            })
        }
        KIND_REPLY => {
            let join_ref_len = reader.u8()?;
            let ref_len = reader.u8()?;
            let topic_len = reader.u8()?;
            let status_len = reader.u8()?;
            let join_ref = reader.string(join_ref_len)?;
            let reference = reader.string(ref_len)?;
            let topic = reader.string(topic_len)?;
            let status = reader.string(status_len)?;
            let body = reader.rest();
            let response: Value = if body.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_slice(&body)?
            };
            Ok(Message {
                topic,
                event: events::REPLY.to_string(),
                payload: Payload::Json(serde_json::json!({
                    "status": status,
                    "response": response
                })),
                reference: non_empty(reference),
                join_ref: non_empty(join_ref),
            })
        }
        KIND_BROADCAST => {
            let topic_len = reader.u8()?;
            let event_len = reader.u8()?;
            let topic = reader.string(topic_len)?;
            let event = reader.string(event_len)?;
            Ok(Message {
                topic,
                event,
                payload: Payload::Binary(reader.rest()),
                reference: None,
                join_ref: None,
            })
        }
        kind => Err(Error::Protocol(format!("unknown binary frame kind {kind}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push_message() -> Message {
        Message::new("realtime:room", "shout", json!({"body": "hi"}))
            .with_ref("7")
            .with_join_ref(Some("1".into()))
    }

    #[test]
    fn test_v1_encodes_object() {
        let frame = Serializer::new(ProtocolVersion::V1)
            .encode(&push_message())
            .unwrap();
        let Frame::Text(text) = frame else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({
                "topic": "realtime:room",
                "event": "shout",
                "payload": {"body": "hi"},
                "ref": "7",
                "join_ref": "1"
            })
        );
    }

    #[test]
    fn test_v1_decodes_null_ref() {
        let serializer = Serializer::new(ProtocolVersion::V1);
        let msg = serializer
            .decode(&Frame::Text(
                r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":null}"#
                    .to_string(),
            ))
            .unwrap();
        assert_eq!(msg.topic, "phoenix");
        assert!(msg.reference.is_none());
        assert!(msg.join_ref.is_none());
    }

    #[test]
    fn test_v2_encodes_array() {
        let frame = Serializer::new(ProtocolVersion::V2)
            .encode(&push_message())
            .unwrap();
        assert_eq!(
            frame,
            Frame::Text(r#"["1","7","realtime:room","shout",{"body":"hi"}]"#.to_string())
        );
    }

    #[test]
    fn test_v2_decodes_array_with_nulls() {
        let msg = Serializer::new(ProtocolVersion::V2)
            .decode(&Frame::Text(
                r#"[null,null,"realtime:room","presence_diff",{"joins":{},"leaves":{}}]"#.to_string(),
            ))
            .unwrap();
        assert_eq!(msg.event, "presence_diff");
        assert!(msg.join_ref.is_none());
    }

    #[test]
    fn test_binary_push_layout() {
        let msg = Message::new("t", "ev", Bytes::from_static(&[9, 8, 7]))
            .with_ref("12")
            .with_join_ref(Some("1".into()));
        let Frame::Binary(bytes) = Serializer::new(ProtocolVersion::V2).encode(&msg).unwrap()
        else {
            panic!("expected binary frame");
        };
        assert_eq!(
            bytes.as_ref(),
            &[0, 1, 2, 1, 2, b'1', b'1', b'2', b't', b'e', b'v', 9, 8, 7]
        );
    }

    #[test]
    fn test_binary_rejected_on_v1() {
        let msg = Message::new("t", "ev", vec![1u8, 2, 3]);
        let err = Serializer::new(ProtocolVersion::V1).encode(&msg).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_binary_topic_too_long() {
        let topic = "x".repeat(256);
        let msg = Message::new(&topic, "ev", vec![1u8]);
        assert!(Serializer::new(ProtocolVersion::V2).encode(&msg).is_err());
    }

    #[test]
    fn test_decode_binary_broadcast() {
        let mut raw = vec![KIND_BROADCAST, 4, 3];
        raw.extend_from_slice(b"room");
        raw.extend_from_slice(b"pos");
        raw.extend_from_slice(&[1, 2]);
        let msg = Serializer::new(ProtocolVersion::V2)
            .decode(&Frame::Binary(Bytes::from(raw)))
            .unwrap();
        assert_eq!(msg.topic, "room");
        assert_eq!(msg.event, "pos");
        assert_eq!(msg.payload, Payload::Binary(Bytes::from_static(&[1, 2])));
    }

    #[test]
    fn test_decode_binary_reply() {
        let mut raw = vec![KIND_REPLY, 1, 2, 4, 2];
        raw.extend_from_slice(b"1");
        raw.extend_from_slice(b"10");
        raw.extend_from_slice(b"room");
        raw.extend_from_slice(b"ok");
        raw.extend_from_slice(br#"{"n":1}"#);
        let msg = Serializer::new(ProtocolVersion::V2)
            .decode(&Frame::Binary(Bytes::from(raw)))
            .unwrap();
        assert_eq!(msg.event, events::REPLY);
        assert_eq!(msg.reference.as_deref(), Some("10"));
        assert_eq!(msg.payload.get("status"), Some(&json!("ok")));
        assert_eq!(msg.payload.get("response"), Some(&json!({"n": 1})));
    }

    #[test]
    fn test_decode_truncated_binary() {
        let raw = Bytes::from_static(&[KIND_BROADCAST, 10, 3, b'a']);
        assert!(Serializer::new(ProtocolVersion::V2)
            .decode(&Frame::Binary(raw))
            .is_err());
    }
}
