//! Peerwire node library.
//!
//! This library provides the components for building and running a Peerwire
//! node: CLI and configuration, the `chat` application message, the stdin
//! console, seed tracker discovery and shutdown coordination. It is used by the `peerwire-node`
//! binary and can also be used for testing and embedding.

pub mod chat;
pub mod cli;
pub mod config;
pub mod console;
pub mod node;
pub mod seed;
pub mod shutdown;
