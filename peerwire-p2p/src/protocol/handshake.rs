//! Hello handshake and duplicate-connection resolution.
//!
//! The handshake protocol:
//! 1. Both sides send `hello` carrying their node id as soon as the
//!    transport exists.
//! 2. Each side waits for exactly one frame, which must be the peer's
//!    `hello`.
//! 3. The declared identity is validated and checked against the registry.
//!
//! Two nodes that dial each other at the same time end up with two
//! transports for one peer pair. Each side keeps the connection initiated by
//! the smaller id and drops the other, deciding from local state only.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{P2pError, P2pResult};
use crate::peer::{ConnectionDirection, NodeId};
use crate::protocol::framing::FrameCodec;
use crate::protocol::messages::{HelloPayload, HELLO};
use crate::protocol::reassembly::FrameReader;
use crate::protocol::Message;

/// Handshake state machine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Transport open, nothing sent.
    #[default]
    Connecting,
    /// Our hello is on the wire, waiting for the peer's.
    HelloSent,
    /// Peer's hello received and its identity validated.
    HelloReceived(NodeId),
    /// Registered in the peer registry.
    Established(NodeId),
    /// Handshake failed; the transport is closed.
    Rejected(String),
}

impl HandshakeState {
    /// Create initial handshake state.
    pub fn new() -> Self {
        Self::Connecting
    }

    /// Record that our hello was sent.
    pub fn sent_hello(&mut self) -> P2pResult<()> {
        match self {
            Self::Connecting => {
                *self = Self::HelloSent;
                Ok(())
            }
            _ => Err(P2pError::HandshakeRejected(format!(
                "cannot send hello in state {:?}",
                self
            ))),
        }
    }

    /// Process the first frame received from the peer.
    ///
    /// The frame must be a `hello` whose node id equals its listen port and
    /// differs from ours.
    pub fn received_hello(&mut self, message: &Message, local_id: NodeId) -> P2pResult<NodeId> {
        if !matches!(self, Self::HelloSent) {
            return Err(P2pError::HandshakeRejected(format!(
                "unexpected hello in state {:?}",
                self
            )));
        }

        if !message.is(HELLO) {
            return Err(P2pError::UnexpectedMessage {
                expected: HELLO.to_string(),
                actual: message.kind.clone(),
            });
        }

        let hello: HelloPayload = message.parse_payload()?;
        let remote_id = hello.identity()?;
        if remote_id == local_id {
            return Err(P2pError::SelfConnection);
        }

        *self = Self::HelloReceived(remote_id);
        Ok(remote_id)
    }

    /// Record that the peer was admitted to the registry.
    pub fn established(&mut self) -> P2pResult<NodeId> {
        match self {
            Self::HelloReceived(id) => {
                let id = *id;
                *self = Self::Established(id);
                Ok(id)
            }
            _ => Err(P2pError::HandshakeRejected(format!(
                "cannot establish in state {:?}",
                self
            ))),
        }
    }

    /// Move to the terminal failure state.
    pub fn reject(&mut self, error: &P2pError) {
        *self = Self::Rejected(error.to_string());
    }

    /// Check if handshake is complete.
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established(_))
    }

    /// Check if handshake failed.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Remote node id, once known.
    pub fn remote_id(&self) -> Option<NodeId> {
        match self {
            Self::HelloReceived(id) | Self::Established(id) => Some(*id),
            _ => None,
        }
    }
}

/// Whether a connection in `direction` between `local` and `remote` was
/// initiated by the smaller id.
pub fn is_canonical(direction: ConnectionDirection, local: NodeId, remote: NodeId) -> bool {
    match direction {
        ConnectionDirection::Outbound => local < remote,
        ConnectionDirection::Inbound => local > remote,
    }
}

/// Outcome of checking a new connection against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateResolution {
    /// No existing entry; register the new connection.
    Accept,
    /// Close the existing entry and register the new connection.
    Replace,
    /// Keep the existing entry and close the new connection.
    Reject,
}

/// Decide what happens to a new connection to `remote`.
///
/// `existing` is the direction of the connection already registered for
/// `remote`, if any. A canonical new connection always wins. A non-canonical
/// one only replaces an existing link that was also non-canonical (a redial
/// in the same direction). Both ends see the same canonical direction, so
/// they keep the same link.
pub fn resolve_duplicate(
    existing: Option<ConnectionDirection>,
    direction: ConnectionDirection,
    local: NodeId,
    remote: NodeId,
) -> DuplicateResolution {
    match existing {
        None => DuplicateResolution::Accept,
        Some(_) if is_canonical(direction, local, remote) => DuplicateResolution::Replace,
        Some(existing) if !is_canonical(existing, local, remote) => DuplicateResolution::Replace,
        Some(_) => DuplicateResolution::Reject,
    }
}

/// Send our hello and wait for the peer's.
///
/// The wait is bounded by `timeout`. Bytes that arrive after the peer's hello
/// stay in the reader's carry buffer.
pub async fn exchange_hello<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    codec: &FrameCodec,
    local_id: NodeId,
    timeout: Duration,
    state: &mut HandshakeState,
) -> P2pResult<NodeId>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let hello = codec.encode_message(&Message::hello(local_id))?;
    writer.write_all(&hello).await?;
    writer.flush().await?;
    state.sent_hello()?;

    let frame = match tokio::time::timeout(timeout, reader.next_frame()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            return Err(P2pError::HandshakeRejected(
                "transport closed before hello".to_string(),
            ))
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(P2pError::HandshakeTimeout),
    };

    let message = codec.decode_message(&frame)?;
    tracing::trace!(message = %message, "Received handshake frame");
    state.received_hello(&message, local_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::encode_frame;
    use crate::protocol::reassembly::StreamReassembler;
    use serde_json::json;
    use tokio::io::{duplex, split};

    const SMALL: NodeId = NodeId(5);
    const LARGE: NodeId = NodeId(9);

    #[test]
    fn test_canonical_direction() {
        assert!(is_canonical(ConnectionDirection::Outbound, SMALL, LARGE));
        assert!(is_canonical(ConnectionDirection::Inbound, LARGE, SMALL));
        assert!(!is_canonical(ConnectionDirection::Inbound, SMALL, LARGE));
        assert!(!is_canonical(ConnectionDirection::Outbound, LARGE, SMALL));
    }

    #[test]
    fn test_resolve_without_existing() {
        for direction in [ConnectionDirection::Outbound, ConnectionDirection::Inbound] {
            assert_eq!(
                resolve_duplicate(None, direction, SMALL, LARGE),
                DuplicateResolution::Accept
            );
        }
    }

    #[test]
    fn test_resolve_race_on_both_ends() {
        // Node 5 holds its inbound link from 9; its own dial to 9 finishes.
        assert_eq!(
            resolve_duplicate(
                Some(ConnectionDirection::Inbound),
                ConnectionDirection::Outbound,
                SMALL,
                LARGE
            ),
            DuplicateResolution::Replace
        );
        // Node 5 holds its dial to 9; the inbound link from 9 finishes.
        assert_eq!(
            resolve_duplicate(
                Some(ConnectionDirection::Outbound),
                ConnectionDirection::Inbound,
                SMALL,
                LARGE
            ),
            DuplicateResolution::Reject
        );
        // Node 9 holds its dial to 5; the inbound link from 5 finishes.
        assert_eq!(
            resolve_duplicate(
                Some(ConnectionDirection::Outbound),
                ConnectionDirection::Inbound,
                LARGE,
                SMALL
            ),
            DuplicateResolution::Replace
        );
        // Node 9 holds the inbound link from 5; its own dial to 5 finishes.
        assert_eq!(
            resolve_duplicate(
                Some(ConnectionDirection::Inbound),
                ConnectionDirection::Outbound,
                LARGE,
                SMALL
            ),
            DuplicateResolution::Reject
        );
    }

    #[test]
    fn test_resolve_redial_in_rejected_direction() {
        // Node 9 dials 5 again while its first dial is still registered.
        assert_eq!(
            resolve_duplicate(
                Some(ConnectionDirection::Outbound),
                ConnectionDirection::Outbound,
                LARGE,
                SMALL
            ),
            DuplicateResolution::Replace
        );
        // Node 5 sees the same redial arrive inbound.
        assert_eq!(
            resolve_duplicate(
                Some(ConnectionDirection::Inbound),
                ConnectionDirection::Inbound,
                SMALL,
                LARGE
            ),
            DuplicateResolution::Replace
        );
        // A canonical link is never displaced by a non-canonical one.
        assert_eq!(
            resolve_duplicate(
                Some(ConnectionDirection::Outbound),
                ConnectionDirection::Inbound,
                SMALL,
                LARGE
            ),
            DuplicateResolution::Reject
        );
    }

    #[test]
    fn test_state_transitions() {
        let mut state = HandshakeState::new();
        assert_eq!(state, HandshakeState::Connecting);

        state.sent_hello().unwrap();
        assert_eq!(state, HandshakeState::HelloSent);

        let remote = state.received_hello(&Message::hello(LARGE), SMALL).unwrap();
        assert_eq!(remote, LARGE);
        assert_eq!(state.remote_id(), Some(LARGE));

        assert_eq!(state.established().unwrap(), LARGE);
        assert!(state.is_established());
    }

    #[test]
    fn test_hello_before_sending_is_rejected() {
        let mut state = HandshakeState::new();
        assert!(state.received_hello(&Message::hello(LARGE), SMALL).is_err());
    }

    #[test]
    fn test_first_message_must_be_hello() {
        let mut state = HandshakeState::new();
        state.sent_hello().unwrap();

        let result = state.received_hello(&Message::ping(), SMALL);
        assert!(matches!(result, Err(P2pError::UnexpectedMessage { .. })));

        state.reject(&result.unwrap_err());
        assert!(state.is_rejected());
        assert!(state.remote_id().is_none());
    }

    #[test]
    fn test_identity_mismatch() {
        let mut state = HandshakeState::new();
        state.sent_hello().unwrap();

        let payload = json!({"node_id": 9, "listen_port": 10});
        let msg = Message::with_payload(HELLO, payload.as_object().unwrap().clone());
        assert!(matches!(
            state.received_hello(&msg, SMALL),
            Err(P2pError::InvalidIdentity { node_id: 9, listen_port: 10 })
        ));
    }

    #[test]
    fn test_hello_from_self() {
        let mut state = HandshakeState::new();
        state.sent_hello().unwrap();
        assert!(matches!(
            state.received_hello(&Message::hello(SMALL), SMALL),
            Err(P2pError::SelfConnection)
        ));
    }

    #[tokio::test]
    async fn test_exchange_hello_keeps_trailing_bytes() {
        let (local, remote) = duplex(1024);
        let (local_read, mut local_write) = split(local);
        let (remote_read, mut remote_write) = split(remote);

        // Remote side: hello immediately followed by a ping.
        let mut bytes = encode_frame(&Message::hello(LARGE)).unwrap().to_vec();
        bytes.extend_from_slice(&encode_frame(&Message::ping()).unwrap());
        remote_write.write_all(&bytes).await.unwrap();

        let mut reader = FrameReader::new(local_read, StreamReassembler::new());
        let mut state = HandshakeState::new();
        let remote_id = exchange_hello(
            &mut reader,
            &mut local_write,
            &FrameCodec::new(),
            SMALL,
            Duration::from_secs(5),
            &mut state,
        )
        .await
        .unwrap();

        assert_eq!(remote_id, LARGE);
        assert_eq!(state, HandshakeState::HelloReceived(LARGE));

        // Our hello reached the remote side.
        let mut remote_reader = FrameReader::new(remote_read, StreamReassembler::new());
        let frame = remote_reader.next_frame().await.unwrap().unwrap();
        assert!(FrameCodec::new().decode_message(&frame).unwrap().is(HELLO));

        // The ping that followed the hello was not lost.
        let next = reader.next_frame().await.unwrap().unwrap();
        assert!(FrameCodec::new().decode_message(&next).unwrap().is("ping"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_hello_timeout() {
        let (local, _remote) = duplex(1024);
        let (local_read, mut local_write) = split(local);
        let mut reader = FrameReader::new(local_read, StreamReassembler::new());
        let mut state = HandshakeState::new();

        let result = exchange_hello(
            &mut reader,
            &mut local_write,
            &FrameCodec::new(),
            SMALL,
            Duration::from_secs(15),
            &mut state,
        )
        .await;

        assert!(matches!(result, Err(P2pError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_exchange_hello_peer_closes() {
        let (local, remote) = duplex(1024);
        let (local_read, mut local_write) = split(local);
        drop(remote);
        let mut reader = FrameReader::new(local_read, StreamReassembler::new());
        let mut state = HandshakeState::new();

        let result = exchange_hello(
            &mut reader,
            &mut local_write,
            &FrameCodec::new(),
            SMALL,
            Duration::from_secs(5),
            &mut state,
        )
        .await;

        assert!(result.is_err());
    }
}
