//! Main P2P node orchestrator.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};

use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};
use crate::peer::{
    ConnectInfo, ConnectionDirection, Handler, HandlerContext, HandlerTable, NodeId,
    PeerConnection, Transport,
};
use crate::protocol::{
    exchange_hello, parse_new_node, FrameCodec, FrameReader, HandshakeState, Message,
    StreamReassembler, NOTIFY_NEW_NODE, PING, PONG,
};
use crate::registry::PeerRegistry;

/// State shared by the node and every connection task.
struct NodeShared {
    local_addr: SocketAddr,
    local_id: NodeId,
    config: P2pConfig,
    codec: FrameCodec,
    registry: Arc<PeerRegistry>,
    handlers: RwLock<HandlerTable>,
    /// Node ids with an outbound dial in flight.
    dialing: Mutex<HashSet<NodeId>>,
    stopped: AtomicBool,
}

/// Cloneable handle to a node.
///
/// Connection tasks and handlers reach the registry and the handler table
/// through this handle. A handle can also be used on its own, without a
/// listener, to drive in-memory transports.
#[derive(Clone)]
pub struct NodeHandle {
    shared: Arc<NodeShared>,
}

impl NodeHandle {
    /// Create a handle for a node listening on `local_addr`, with the
    /// built-in handlers installed.
    pub fn new(local_addr: SocketAddr, config: P2pConfig) -> Self {
        let codec = FrameCodec::with_max_message_size(config.max_message_size);
        Self {
            shared: Arc::new(NodeShared {
                local_addr,
                local_id: NodeId::new(local_addr.port()),
                registry: Arc::new(PeerRegistry::with_codec(codec.clone())),
                codec,
                handlers: RwLock::new(builtin_handlers()),
                dialing: Mutex::new(HashSet::new()),
                stopped: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.shared.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &P2pConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.shared.registry
    }

    /// Connect info of every registered peer, ordered by node id.
    pub fn peers(&self) -> Vec<ConnectInfo> {
        self.registry()
            .snapshots()
            .into_iter()
            .map(|s| s.connect_info)
            .collect()
    }

    /// Whether [`NodeHandle::shutdown`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Register a handler for a message type, replacing any existing one
    /// (built-in handlers included).
    pub fn register_handler<F, Fut>(&self, kind: impl Into<String>, handler: F) -> Option<Handler>
    where
        F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = P2pResult<()>> + Send + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(kind, handler)
    }

    /// Message types with a registered handler.
    pub fn handler_kinds(&self) -> Vec<String> {
        let handlers = self.shared.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.kinds().into_iter().map(String::from).collect()
    }

    /// Run the handler registered for the message's type.
    pub async fn dispatch(&self, ctx: HandlerContext, message: Message) -> P2pResult<()> {
        let pending = self
            .shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dispatch(ctx, message);
        pending.await
    }

    /// Send a message to every registered peer except `exclude`.
    pub fn broadcast(&self, message: &Message, exclude: Option<NodeId>) -> P2pResult<usize> {
        self.registry().broadcast(message, exclude)
    }

    /// Send a message to one registered peer.
    pub fn send_to(&self, peer: NodeId, message: &Message) -> P2pResult<()> {
        self.registry().send_to(peer, message)
    }

    /// Dial a peer and run the handshake.
    pub async fn connect(&self, addr: SocketAddr) -> P2pResult<Arc<PeerConnection>> {
        if self.is_stopped() {
            return Err(P2pError::Shutdown);
        }

        let target = NodeId::new(addr.port());
        if target == self.local_id() {
            return Err(P2pError::SelfConnection);
        }

        let _dial = DialGuard::acquire(&self.shared.dialing, target).ok_or_else(|| {
            P2pError::HandshakeRejected(format!("dial to {} already in progress", target))
        })?;

        tracing::debug!(addr = %addr, "Connecting to peer");

        let stream = match timeout(self.config().connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(P2pError::Io(e)),
            Err(_) => return Err(P2pError::ConnectionTimeout { addr }),
        };

        let transport = Transport::from_tcp(stream)?;
        self.establish(transport, ConnectionDirection::Outbound).await
    }

    /// Run the handshake on a transport the remote side opened.
    pub async fn accept_transport(&self, transport: Transport) -> P2pResult<Arc<PeerConnection>> {
        self.establish(transport, ConnectionDirection::Inbound).await
    }

    /// Run the handshake on a transport and register the resulting
    /// connection.
    ///
    /// On success the connection's tasks are running, it is in the registry,
    /// and every other peer has been sent a `notify_new_node` for it. On
    /// failure the transport is shut down and nothing is registered.
    pub async fn establish(
        &self,
        transport: Transport,
        direction: ConnectionDirection,
    ) -> P2pResult<Arc<PeerConnection>> {
        let Transport {
            reader,
            mut writer,
            remote_addr,
        } = transport;
        let config = self.config();
        let mut reader = FrameReader::new(
            reader,
            StreamReassembler::with_max_message_size(config.max_message_size),
        );
        let mut state = HandshakeState::new();

        let hello = exchange_hello(
            &mut reader,
            &mut writer,
            &self.shared.codec,
            self.local_id(),
            config.handshake_timeout,
            &mut state,
        )
        .await;

        let remote_id = match hello {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(addr = %remote_addr, direction = %direction, error = %e, "Handshake failed");
                state.reject(&e);
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };

        let info = ConnectInfo::new(remote_addr, remote_id.port());
        let (conn, commands) = PeerConnection::new(info, direction, self.shared.codec.clone());

        let admitted = if self.is_stopped() {
            Err(P2pError::Shutdown)
        } else {
            self.registry().admit(&conn, self.local_id())
        };
        if let Err(e) = admitted {
            state.reject(&e);
            let _ = writer.shutdown().await;
            return Err(e);
        }

        state.established()?;
        conn.spawn(reader, writer, commands, self.clone());

        if self.is_stopped() {
            self.registry().remove_connection(&conn);
            return Err(P2pError::Shutdown);
        }

        tracing::info!(
            peer = %remote_id,
            addr = %remote_addr,
            direction = %direction,
            "Peer established"
        );

        let announcement = Message::notify_new_node(conn.connect_info())?;
        self.broadcast(&announcement, Some(remote_id))?;

        Ok(conn)
    }

    /// Stop accepting peers and close every connection.
    pub fn shutdown(&self) -> usize {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let closed = self.registry().close_all();
        tracing::info!(peers = closed, "Closed all peer connections");
        closed
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("local_addr", &self.shared.local_addr)
            .field("peers", &self.registry().len())
            .finish()
    }
}

/// Marks a node id as being dialed until dropped.
struct DialGuard<'a> {
    dialing: &'a Mutex<HashSet<NodeId>>,
    target: NodeId,
}

impl<'a> DialGuard<'a> {
    fn acquire(dialing: &'a Mutex<HashSet<NodeId>>, target: NodeId) -> Option<Self> {
        let inserted = dialing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target);
        inserted.then_some(Self { dialing, target })
    }
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.dialing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.target);
    }
}

fn builtin_handlers() -> HandlerTable {
    let mut handlers = HandlerTable::new();

    handlers.register(PING, |ctx: HandlerContext, _message: Message| async move {
        ctx.peer.send(&Message::pong())
    });

    handlers.register(PONG, |ctx: HandlerContext, _message: Message| async move {
        tracing::trace!(peer = %ctx.peer.node_id(), "Received pong");
        Ok(())
    });

    handlers.register(NOTIFY_NEW_NODE, handle_new_node);

    handlers
}

/// Dial a node announced by a peer unless it is already known.
async fn handle_new_node(ctx: HandlerContext, message: Message) -> P2pResult<()> {
    let info = parse_new_node(&message)?;
    let node = ctx.node;

    if info.node_id == node.local_id() || node.registry().contains(info.node_id) {
        tracing::trace!(peer = %info.node_id, "Announced node already known");
        return Ok(());
    }

    if !node.config().relay_new_nodes {
        tracing::debug!(peer = %info.node_id, from = %ctx.peer.node_id(), "Ignoring announced node");
        return Ok(());
    }

    tracing::debug!(peer = %info.node_id, from = %ctx.peer.node_id(), "Connecting to announced node");
    spawn_dial(node, info.listen_addr());
    Ok(())
}

fn spawn_dial(node: NodeHandle, addr: SocketAddr) {
    tokio::spawn(async move {
        match node.connect(addr).await {
            Ok(conn) => {
                tracing::debug!(peer = %conn.node_id(), addr = %addr, "Outbound connection established")
            }
            Err(e) => tracing::debug!(addr = %addr, error = %e, "Outbound connection failed"),
        }
    });
}

async fn accept_inbound(node: NodeHandle, stream: TcpStream, addr: SocketAddr) {
    let transport = match Transport::from_tcp(stream) {
        Ok(transport) => transport,
        Err(e) => {
            tracing::debug!(addr = %addr, error = %e, "Dropping inbound connection");
            return;
        }
    };

    if let Err(e) = node.accept_transport(transport).await {
        tracing::debug!(addr = %addr, error = %e, "Inbound connection failed");
    }
}

/// Main P2P node.
pub struct P2pNode {
    listener: TcpListener,
    handle: NodeHandle,
    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
    /// Shutdown signal sender (for cloning).
    shutdown_tx: mpsc::Sender<()>,
}

impl P2pNode {
    /// Bind the listener. The node id is the port actually bound, so binding
    /// port 0 yields an OS-assigned id.
    pub async fn bind(config: P2pConfig) -> P2pResult<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handle = NodeHandle::new(local_addr, config);
        tracing::info!(addr = %local_addr, node = %handle.local_id(), "P2P node listening");

        Ok(Self {
            listener,
            handle,
            shutdown_rx,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn local_id(&self) -> NodeId {
        self.handle.local_id()
    }

    /// Get a handle usable while the node runs.
    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Get the shutdown sender for external shutdown signals.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the P2P node until a shutdown signal arrives.
    pub async fn run(self) -> P2pResult<()> {
        let P2pNode {
            listener,
            handle,
            mut shutdown_rx,
            shutdown_tx: _shutdown_tx,
        } = self;

        for addr in handle.config().bootstrap_peers.iter().copied() {
            spawn_dial(handle.clone(), addr);
        }

        let mut keepalive = handle
            .config()
            .keepalive_interval
            .map(|period| interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                // Handle shutdown
                _ = shutdown_rx.recv() => {
                    tracing::info!("P2P node shutting down");
                    break;
                }

                // Accept inbound connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::debug!(addr = %addr, "Accepted inbound");
                            tokio::spawn(accept_inbound(handle.clone(), stream, addr));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept error");
                        }
                    }
                }

                // Keepalive timer
                _ = async {
                    match keepalive.as_mut() {
                        Some(timer) => {
                            timer.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    match handle.broadcast(&Message::ping(), None) {
                        Ok(sent) => tracing::trace!(peers = sent, "Sent keepalive"),
                        Err(e) => tracing::warn!(error = %e, "Keepalive broadcast failed"),
                    }
                }
            }
        }

        handle.shutdown();
        Ok(())
    }
}
