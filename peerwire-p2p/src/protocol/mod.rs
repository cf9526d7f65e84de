//! P2P protocol layer.
//!
//! This module contains:
//! - Message definitions and the built-in type tags
//! - Magic-tagged, length-prefixed framing codec
//! - Stream reassembly with magic-marker resync
//! - Hello handshake and duplicate-connection ordering rule

pub mod framing;
pub mod handshake;
pub mod messages;
pub mod reassembly;

// Re-export main types
pub use framing::{decode_frame, encode_frame, FrameCodec, FrameHeader};
pub use handshake::{
    exchange_hello, is_canonical, resolve_duplicate, DuplicateResolution, HandshakeState,
};
pub use messages::{
    parse_new_node, HelloPayload, Message, HELLO, NOTIFY_NEW_NODE, PING, PONG,
};
pub use reassembly::{FrameReader, StreamReassembler};
