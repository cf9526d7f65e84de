//! Peer identification and connection metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Identity of a node on the network.
///
/// A node is identified by its listening port. Ids are totally ordered, and
/// the ordering decides which of two racing connections survives a handshake.
/// Port-based identity only distinguishes nodes sharing one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Create a node id from a listening port.
    pub fn new(port: u16) -> Self {
        Self(port)
    }

    /// The listening port this id stands for.
    pub fn port(&self) -> u16 {
        self.0
    }
}

impl From<u16> for NodeId {
    fn from(port: u16) -> Self {
        Self(port)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Direction of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionDirection {
    /// We initiated the connection.
    Outbound,
    /// Peer connected to us.
    Inbound,
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Outbound => write!(f, "outbound"),
            ConnectionDirection::Inbound => write!(f, "inbound"),
        }
    }
}

/// Where a peer can be reached, as announced in `notify_new_node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    /// Address of the remote end of the transport.
    pub ip: IpAddr,
    /// The peer's listening port.
    pub port: u16,
    /// The peer's node id.
    pub node_id: NodeId,
}

impl ConnectInfo {
    /// Build connect info from the transport's remote address and the
    /// listening port declared in the peer's hello.
    pub fn new(remote_addr: SocketAddr, listen_port: u16) -> Self {
        Self {
            ip: remote_addr.ip(),
            port: listen_port,
            node_id: NodeId::new(listen_port),
        }
    }

    /// Socket address the peer listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for ConnectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.node_id, self.ip, self.port)
    }
}

/// Snapshot of a registered peer for external reporting.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// Where the peer can be reached.
    pub connect_info: ConnectInfo,
    /// Direction of the surviving connection.
    pub direction: ConnectionDirection,
    /// When the connection was established.
    pub connected_at: Instant,
}

impl fmt::Display for PeerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, up {}s",
            self.connect_info,
            self.direction,
            self.connected_at.elapsed().as_secs()
        )
    }
}
