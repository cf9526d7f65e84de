//! Peer connection management.
//!
//! This module provides:
//! - Peer identification and metadata
//! - Per-peer receive loop and writer task
//! - Message-type handler table

pub mod connection;
pub mod dispatch;
pub mod info;

// Re-export main types
pub use connection::{BoxedReader, BoxedWriter, PeerCommand, PeerConnection, Transport};
pub use dispatch::{Handler, HandlerContext, HandlerTable};
pub use info::{ConnectInfo, ConnectionDirection, NodeId, PeerSnapshot};
