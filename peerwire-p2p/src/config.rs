//! P2P configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Magic marker opening every frame on the wire.
pub const NETWORK_MAGIC: [u8; 4] = [0xAB, 0xCD, 0xEF, 0x88];

/// Header size: 4 bytes magic + 4 bytes reserved checksum + 4 bytes length.
pub const HEADER_SIZE: usize = 12;

/// Default maximum frame body size in bytes (4 MiB).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:17890";

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default handshake timeout (waiting for the peer's hello).
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default keepalive ping interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// How long a closed connection keeps writing frames queued before the
/// close. A peer that stops reading loses whatever is left after this.
pub const CLOSE_LINGER: Duration = Duration::from_millis(250);

/// Configuration for the P2P node.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Address to bind the listener to. The bound port is the node id.
    pub bind_addr: SocketAddr,

    /// Peers to dial on startup.
    pub bootstrap_peers: Vec<SocketAddr>,

    /// Timeout for establishing outbound TCP connections.
    pub connect_timeout: Duration,

    /// Timeout for receiving the peer's hello.
    pub handshake_timeout: Duration,

    /// Interval between keepalive pings. `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,

    /// Largest frame body accepted or produced.
    pub max_message_size: usize,

    /// Dial peers announced via `notify_new_node`.
    pub relay_new_nodes: bool,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 17890)),
            bootstrap_peers: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            max_message_size: MAX_MESSAGE_SIZE,
            relay_new_nodes: true,
        }
    }
}

impl P2pConfig {
    /// Create a new configuration with the specified bind address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Add bootstrap peers to connect to on startup.
    pub fn with_bootstrap_peers(mut self, peers: Vec<SocketAddr>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the keepalive interval, or disable keepalive with `None`.
    pub fn with_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the maximum frame body size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Enable or disable dialing of announced peers.
    pub fn with_relay_new_nodes(mut self, relay: bool) -> Self {
        self.relay_new_nodes = relay;
        self
    }
}
