//! A live link to one peer.
//!
//! Each established connection runs two tasks:
//!
//! ```text
//! receive task: FrameReader -> FrameCodec -> HandlerTable, sequential per peer
//! writer task:  PeerCommand queue -> transport write half
//! ```
//!
//! Either task ending for any reason removes the connection from the
//! registry. Nothing that goes wrong on one connection escapes it. Closing
//! cancels the receive task at once and gives the writer [`CLOSE_LINGER`] to
//! drain its queue; after that the transport is dropped even if the peer
//! stopped reading.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::CLOSE_LINGER;
use crate::error::{P2pError, P2pResult};
use crate::node::NodeHandle;
use crate::peer::{ConnectInfo, ConnectionDirection, HandlerContext, NodeId, PeerSnapshot};
use crate::protocol::{FrameCodec, FrameReader, Message};
use crate::registry::PeerRegistry;

/// Read half of a transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A raw bidirectional byte stream to a peer, before the handshake.
pub struct Transport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Address of the remote end.
    pub remote_addr: SocketAddr,
}

impl Transport {
    /// Wrap any bidirectional stream, such as one end of `tokio::io::duplex`.
    pub fn new<S>(stream: S, remote_addr: SocketAddr) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote_addr,
        }
    }

    /// Wrap a connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> P2pResult<Self> {
        let remote_addr = stream.peer_addr()?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %remote_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote_addr,
        })
    }
}

/// Commands queued for the writer task.
#[derive(Debug)]
pub enum PeerCommand {
    /// Write an encoded frame.
    Send(Bytes),
    /// Flush what is queued, then shut the transport down.
    Close,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// An established connection to a peer.
pub struct PeerConnection {
    /// Distinguishes this connection from earlier or later ones to the same peer.
    serial: u64,
    connect_info: ConnectInfo,
    direction: ConnectionDirection,
    connected_at: Instant,
    codec: FrameCodec,
    /// Queue to the writer task (unbounded so senders never block).
    command_tx: mpsc::UnboundedSender<PeerCommand>,
    closed: AtomicBool,
    /// Cancelled on close; bounds how long the writer may keep draining.
    closing: CancellationToken,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Create a connection that has completed its hello exchange.
    ///
    /// No task runs until [`PeerConnection::spawn`] is called with the
    /// returned command receiver. Frames sent before that are queued.
    pub fn new(
        connect_info: ConnectInfo,
        direction: ConnectionDirection,
        codec: FrameCodec,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            connect_info,
            direction,
            connected_at: Instant::now(),
            codec,
            command_tx,
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
            receive_task: Mutex::new(None),
        });
        (conn, command_rx)
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn node_id(&self) -> NodeId {
        self.connect_info.node_id
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn connect_info(&self) -> &ConnectInfo {
        &self.connect_info
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            connect_info: self.connect_info.clone(),
            direction: self.direction,
            connected_at: self.connected_at,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Encode a message and queue it for this peer.
    ///
    /// Encoding errors are returned. A failed write shows up later as the
    /// connection being removed, not as an error here.
    pub fn send(&self, message: &Message) -> P2pResult<()> {
        let frame = self.codec.encode_message(message)?;
        self.send_frame(frame)
    }

    /// Queue an already encoded frame.
    pub fn send_frame(&self, frame: Bytes) -> P2pResult<()> {
        if self.is_closed() {
            return Err(P2pError::ConnectionClosed);
        }
        self.command_tx
            .send(PeerCommand::Send(frame))
            .map_err(|_| P2pError::ConnectionClosed)
    }

    /// Close the connection. Safe to call any number of times.
    ///
    /// Frames queued before the call are still written if the peer reads
    /// them within [`CLOSE_LINGER`]; the receive task is cancelled
    /// immediately.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.command_tx.send(PeerCommand::Close);
        self.closing.cancel();

        let task = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        tracing::trace!(peer = %self.node_id(), serial = self.serial, "Connection closed");
    }

    /// Start the receive and writer tasks.
    pub fn spawn(
        self: &Arc<Self>,
        reader: FrameReader<BoxedReader>,
        writer: BoxedWriter,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
        node: NodeHandle,
    ) {
        tokio::spawn(write_loop(
            self.clone(),
            writer,
            commands,
            node.registry().clone(),
        ));

        let task = tokio::spawn(receive_loop(self.clone(), reader, node));

        let mut slot = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            // Closed between construction and spawn.
            task.abort();
        } else {
            *slot = Some(task);
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("serial", &self.serial)
            .field("connect_info", &self.connect_info)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn receive_loop(conn: Arc<PeerConnection>, mut reader: FrameReader<BoxedReader>, node: NodeHandle) {
    let peer = conn.node_id();

    let outcome = async {
        while let Some(frame) = reader.next_frame().await? {
            let message = conn.codec.decode_message(&frame)?;
            tracing::trace!(peer = %peer, message = %message, "Received message");
            node.dispatch(HandlerContext::new(conn.clone(), node.clone()), message)
                .await?;
        }
        Ok::<(), P2pError>(())
    }
    .await;

    match outcome {
        Ok(()) => tracing::debug!(peer = %peer, "Peer closed the connection"),
        Err(e) if e.is_protocol_violation() => {
            tracing::warn!(peer = %peer, error = %e, "Protocol violation, dropping peer")
        }
        Err(e) => tracing::debug!(peer = %peer, error = %e, "Connection terminated"),
    }

    node.registry().remove_connection(&conn);
}

async fn write_loop(
    conn: Arc<PeerConnection>,
    mut writer: BoxedWriter,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    registry: Arc<PeerRegistry>,
) {
    let peer = conn.node_id();

    let linger = async {
        conn.closing.cancelled().await;
        sleep(CLOSE_LINGER).await;
    };

    let result = tokio::select! {
        result = write_queued(&mut writer, &mut commands) => result,
        _ = linger => {
            tracing::debug!(peer = %peer, "Peer not draining, dropping queued frames");
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::debug!(peer = %peer, error = %e, "Write failed");
        registry.remove_connection(&conn);
    }

    match timeout(CLOSE_LINGER, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::trace!(peer = %peer, error = %e, "Error shutting down transport"),
        Err(_) => tracing::trace!(peer = %peer, "Transport shutdown timed out"),
    }
}

/// Write queued frames in order until `Close` or the queue ends.
async fn write_queued(
    writer: &mut BoxedWriter,
    commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
) -> std::io::Result<()> {
    while let Some(command) = commands.recv().await {
        match command {
            PeerCommand::Send(frame) => {
                writer.write_all(&frame).await?;
                writer.flush().await?;
            }
            PeerCommand::Close => break,
        }
    }
    Ok(())
}
