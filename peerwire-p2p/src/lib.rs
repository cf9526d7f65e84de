//! Framed message protocol and peer-connection state machine for a small
//! peer-to-peer network.
//!
//! This crate provides:
//!
//! - A magic-tagged, length-prefixed frame format carrying JSON messages
//! - Stream reassembly that survives partial reads and leading noise
//! - A hello handshake that resolves duplicate connections between two
//!   nodes using only local state
//! - A registry of live peers with broadcast and isolated failure handling
//! - A pluggable per-message-type handler table
//!
//! # Architecture
//!
//! Each established peer runs a receive task and a writer task. The registry
//! is the only state those tasks share.
//!
//! ```text
//! Main Task (P2pNode::run())
//! ├── Listener (accept inbound, one handshake task per transport)
//! ├── Keepalive timer (broadcast ping)
//! ├── Peer 1: receive task (frames -> handlers), writer task (queue -> socket)
//! └── Peer 2: receive task, writer task
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use peerwire_p2p::{Message, P2pConfig, P2pNode};
//!
//! let config = P2pConfig::new("127.0.0.1:17890".parse().unwrap());
//! let node = P2pNode::bind(config).await?;
//!
//! let handle = node.handle();
//! handle.register_handler("chat", |ctx, msg| async move {
//!     println!("{}: {:?}", ctx.peer.node_id(), msg.payload.get("text"));
//!     Ok(())
//! });
//!
//! node.run().await?;
//! ```

pub mod config;
pub mod error;

pub mod protocol;
pub mod peer;
pub mod registry;
pub mod node;

// Re-export main types
pub use config::{P2pConfig, HEADER_SIZE, MAX_MESSAGE_SIZE, NETWORK_MAGIC};
pub use error::{P2pError, P2pResult};
pub use node::{NodeHandle, P2pNode};
pub use peer::{
    ConnectInfo, ConnectionDirection, HandlerContext, HandlerTable, NodeId, PeerConnection,
    PeerSnapshot, Transport,
};
pub use protocol::{FrameCodec, Message, StreamReassembler};
pub use registry::PeerRegistry;
