//! Registry of established peer connections.
//!
//! The registry is the only state shared between connection tasks. Every
//! mutation happens under one mutex and never awaits, so the duplicate check
//! and the insert that follows it cannot interleave with another handshake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{P2pError, P2pResult};
use crate::peer::{NodeId, PeerConnection, PeerSnapshot};
use crate::protocol::{resolve_duplicate, DuplicateResolution, FrameCodec, Message};

/// Live peer connections keyed by node id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<NodeId, Arc<PeerConnection>>>,
    codec: FrameCodec,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that encodes broadcasts with `codec`.
    pub fn with_codec(codec: FrameCodec) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            codec,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, Arc<PeerConnection>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a connection, closing any other connection it replaces.
    pub fn register(&self, conn: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        let replaced = self.lock().insert(conn.node_id(), conn.clone());
        if let Some(old) = &replaced {
            if old.serial() != conn.serial() {
                old.close();
            }
        }
        replaced
    }

    /// Apply the duplicate-connection rule and register `conn` if it wins.
    ///
    /// The lookup and the insert happen under a single lock acquisition.
    pub fn admit(&self, conn: &Arc<PeerConnection>, local_id: NodeId) -> P2pResult<DuplicateResolution> {
        let node_id = conn.node_id();
        let mut peers = self.lock();

        let existing = peers.get(&node_id).map(|c| c.direction());
        let resolution = resolve_duplicate(existing, conn.direction(), local_id, node_id);

        match resolution {
            DuplicateResolution::Reject => {
                tracing::debug!(
                    peer = %node_id,
                    direction = %conn.direction(),
                    "Rejecting duplicate connection"
                );
                return Err(P2pError::HandshakeRejected(format!(
                    "{} connection to {} loses to the existing one",
                    conn.direction(),
                    node_id
                )));
            }
            DuplicateResolution::Replace => {
                tracing::debug!(
                    peer = %node_id,
                    direction = %conn.direction(),
                    "Replacing existing connection"
                );
            }
            DuplicateResolution::Accept => {}
        }

        if let Some(old) = peers.insert(node_id, conn.clone()) {
            old.close();
        }
        Ok(resolution)
    }

    /// Remove and close the connection registered for `node_id`.
    pub fn remove(&self, node_id: NodeId) -> Option<Arc<PeerConnection>> {
        let removed = self.lock().remove(&node_id);
        if let Some(conn) = &removed {
            conn.close();
            tracing::info!(peer = %node_id, "Peer removed");
        }
        removed
    }

    /// Close `conn` and drop its registry entry if the entry still refers to
    /// it. A replaced connection tearing down never evicts its replacement.
    pub fn remove_connection(&self, conn: &Arc<PeerConnection>) -> bool {
        let node_id = conn.node_id();
        let removed = {
            let mut peers = self.lock();
            match peers.get(&node_id) {
                Some(current) if current.serial() == conn.serial() => {
                    peers.remove(&node_id);
                    true
                }
                _ => false,
            }
        };

        conn.close();
        if removed {
            tracing::info!(peer = %node_id, "Peer removed");
        }
        removed
    }

    pub fn get(&self, node_id: NodeId) -> Option<Arc<PeerConnection>> {
        self.lock().get(&node_id).cloned()
    }

    /// Send a message to one registered peer.
    pub fn send_to(&self, node_id: NodeId, message: &Message) -> P2pResult<()> {
        let conn = self.get(node_id).ok_or(P2pError::UnknownPeer(node_id))?;
        conn.send(message)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.lock().contains_key(&node_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Snapshot of every registered peer, ordered by node id.
    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        let mut snapshots: Vec<PeerSnapshot> = self.lock().values().map(|c| c.snapshot()).collect();
        snapshots.sort_by_key(|s| s.connect_info.node_id);
        snapshots
    }

    /// Send a message to every registered peer except `exclude`.
    ///
    /// The message is encoded once. A peer whose queue is gone is removed and
    /// the broadcast continues with the others. Returns the number of peers
    /// the frame was queued for.
    pub fn broadcast(&self, message: &Message, exclude: Option<NodeId>) -> P2pResult<usize> {
        let frame = self.codec.encode_message(message)?;
        let targets: Vec<Arc<PeerConnection>> = self
            .lock()
            .values()
            .filter(|c| Some(c.node_id()) != exclude)
            .cloned()
            .collect();

        let mut delivered = 0;
        for conn in targets {
            match conn.send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(peer = %conn.node_id(), error = %e, "Failed to broadcast to peer");
                    self.remove_connection(&conn);
                }
            }
        }

        tracing::trace!(message = %message, peers = delivered, "Broadcast");
        Ok(delivered)
    }

    /// Remove and close every connection.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<PeerConnection>> = self.lock().drain().map(|(_, c)| c).collect();
        for conn in &drained {
            conn.close();
        }
        drained.len()
    }
}
