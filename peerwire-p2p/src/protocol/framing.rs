//! Length-prefixed message framing codec.
//!
//! Messages are framed as:
//! - 4 bytes: network magic `AB CD EF 88`
//! - 4 bytes: reserved checksum, always zero, not validated
//! - 4 bytes: little-endian body length
//! - N bytes: UTF-8 JSON `{"type", "timestamp", "payload"}`

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{HEADER_SIZE, MAX_MESSAGE_SIZE, NETWORK_MAGIC};
use crate::error::{P2pError, P2pResult};
use crate::protocol::messages::unix_timestamp;
use crate::protocol::Message;

/// Reserved header field, written as zeros.
const RESERVED_CHECKSUM: [u8; 4] = [0u8; 4];

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Reserved checksum bytes as received.
    pub checksum: [u8; 4],
    /// Declared body length.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parse the first `HEADER_SIZE` bytes of `src`.
    pub fn parse(src: &[u8]) -> P2pResult<Self> {
        if src.len() < HEADER_SIZE {
            return Err(P2pError::MalformedFrame {
                reason: format!("header needs {} bytes, got {}", HEADER_SIZE, src.len()),
            });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&src[0..4]);
        if magic != NETWORK_MAGIC {
            return Err(P2pError::MalformedFrame {
                reason: format!("bad magic {:02x?}", magic),
            });
        }

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&src[4..8]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&src[8..12]);

        Ok(Self {
            checksum,
            payload_len: u32::from_le_bytes(length),
        })
    }

    /// Total frame size including the header.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }
}

/// Serialized shape of a message on the wire.
#[derive(Serialize)]
struct WireMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    timestamp: u64,
    payload: &'a Map<String, Value>,
}

/// Stateless translation between messages and frames.
///
/// Splitting a byte stream into frames is the job of
/// [`StreamReassembler`](crate::protocol::StreamReassembler).
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec with the default size limit.
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Create a codec with a custom body size limit.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Encode a message into a complete frame, stamping the current time.
    pub fn encode_message(&self, message: &Message) -> P2pResult<Bytes> {
        let mut dst = BytesMut::new();
        self.encode_into(message, unix_timestamp(), &mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode exactly one complete frame.
    pub fn decode_message(&self, frame: &[u8]) -> P2pResult<Message> {
        let header = FrameHeader::parse(frame)?;
        let body = &frame[HEADER_SIZE..];

        if body.len() != header.payload_len as usize {
            return Err(P2pError::MalformedFrame {
                reason: format!(
                    "declared body length {} but frame carries {}",
                    header.payload_len,
                    body.len()
                ),
            });
        }

        let text = std::str::from_utf8(body)
            .map_err(|e| P2pError::InvalidPayload(format!("body is not UTF-8: {}", e)))?;
        let message: Message = serde_json::from_str(text)
            .map_err(|e| P2pError::InvalidPayload(format!("body is not a message: {}", e)))?;

        if message.kind.is_empty() {
            return Err(P2pError::InvalidPayload("empty message type".to_string()));
        }

        Ok(message)
    }

    fn encode_into(&self, message: &Message, timestamp: u64, dst: &mut BytesMut) -> P2pResult<()> {
        let wire = WireMessage {
            kind: &message.kind,
            timestamp,
            payload: &message.payload,
        };
        let body = serde_json::to_vec(&wire).map_err(|e| P2pError::Encoding(e.to_string()))?;
        let length = body.len();

        if length > self.max_message_size {
            return Err(P2pError::MessageTooLarge {
                size: length,
                max: self.max_message_size,
            });
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_slice(&NETWORK_MAGIC);
        dst.put_slice(&RESERVED_CHECKSUM);
        dst.put_u32_le(length as u32);
        dst.put_slice(&body);

        Ok(())
    }
}

/// Encode a message with the default codec.
pub fn encode_frame(message: &Message) -> P2pResult<Bytes> {
    FrameCodec::new().encode_message(message)
}

/// Decode a complete frame with the default codec.
pub fn decode_frame(frame: &[u8]) -> P2pResult<Message> {
    FrameCodec::new().decode_message(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::NodeId;
    use serde_json::json;

    fn raw_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&NETWORK_MAGIC);
        frame.extend_from_slice(&[0u8; 4]);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_header_layout() {
        let frame = encode_frame(&Message::ping()).unwrap();

        assert_eq!(&frame[0..4], &[0xAB, 0xCD, 0xEF, 0x88]);
        assert_eq!(&frame[4..8], &[0, 0, 0, 0]);
        let declared = u32::from_le_bytes(frame[8..12].try_into().unwrap()) as usize;
        assert_eq!(declared, frame.len() - HEADER_SIZE);
    }

    #[test]
    fn test_body_field_order() {
        let frame = encode_frame(&Message::ping()).unwrap();
        let body = std::str::from_utf8(&frame[HEADER_SIZE..]).unwrap();

        assert!(body.starts_with(r#"{"type":"ping","timestamp":"#));
        assert!(body.ends_with(r#","payload":{}}"#));
    }

    #[test]
    fn test_roundtrip_preserves_type_and_payload() {
        let payload = json!({
            "text": "hi",
            "nested": {"list": [1, 2.5, null, true], "s": "ü"},
        });
        let original = Message::with_payload("chat", payload.as_object().unwrap().clone());

        let decoded = decode_frame(&encode_frame(&original).unwrap()).unwrap();
        assert_eq!(decoded.kind, original.kind);
        assert_eq!(decoded.payload, original.payload);
        assert!(decoded.timestamp > 0);
    }

    #[test]
    fn test_roundtrip_hello() {
        let original = Message::hello(NodeId::new(100));
        let decoded = decode_frame(&encode_frame(&original).unwrap()).unwrap();
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn test_reserved_field_not_validated() {
        let mut frame = encode_frame(&Message::pong()).unwrap().to_vec();
        frame[4..8].copy_from_slice(&[1, 2, 3, 4]);

        let decoded = decode_frame(&frame).unwrap();
        assert!(decoded.is("pong"));
    }

    #[test]
    fn test_invalid_magic() {
        let mut frame = encode_frame(&Message::ping()).unwrap().to_vec();
        frame[0] = 0xFF;

        assert!(matches!(decode_frame(&frame), Err(P2pError::MalformedFrame { .. })));
    }

    #[test]
    fn test_length_mismatch() {
        let mut frame = encode_frame(&Message::ping()).unwrap().to_vec();
        frame.push(b' ');

        assert!(matches!(decode_frame(&frame), Err(P2pError::MalformedFrame { .. })));
    }

    #[test]
    fn test_short_header() {
        assert!(matches!(
            decode_frame(&NETWORK_MAGIC),
            Err(P2pError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let frame = raw_frame(&[0xFF, 0xFE, 0xFD]);
        assert!(matches!(decode_frame(&frame), Err(P2pError::InvalidPayload(_))));
    }

    #[test]
    fn test_invalid_json() {
        let frame = raw_frame(b"{not json");
        assert!(matches!(decode_frame(&frame), Err(P2pError::InvalidPayload(_))));
    }

    #[test]
    fn test_missing_type() {
        let frame = raw_frame(br#"{"timestamp": 1, "payload": {}}"#);
        assert!(matches!(decode_frame(&frame), Err(P2pError::InvalidPayload(_))));
    }

    #[test]
    fn test_empty_type() {
        let frame = raw_frame(br#"{"type": "", "timestamp": 1, "payload": {}}"#);
        assert!(matches!(decode_frame(&frame), Err(P2pError::InvalidPayload(_))));
    }

    #[test]
    fn test_payload_defaults_to_empty() {
        let frame = raw_frame(br#"{"type": "ping", "timestamp": 1}"#);
        let decoded = decode_frame(&frame).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.timestamp, 1);
    }

    #[test]
    fn test_encode_too_large() {
        let codec = FrameCodec::with_max_message_size(16);
        let msg = Message::with_payload(
            "chat",
            json!({"text": "this body is well over sixteen bytes"})
                .as_object()
                .unwrap()
                .clone(),
        );

        assert!(matches!(
            codec.encode_message(&msg),
            Err(P2pError::MessageTooLarge { max: 16, .. })
        ));
    }
}
