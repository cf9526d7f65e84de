//! Seed tracker discovery.
//!
//! A seed is a rendezvous server where nodes register their listen address
//! and learn which other nodes registered before them. Every exchange is one
//! newline-terminated request on its own TCP connection:
//!
//! ```text
//! REGISTER <port>       -> JSON array of "ip:port" strings, one line
//! UNREGISTER <ip:port>  -> no reply
//! ```
//!
//! The seed records a registration under the connection's source IP and the
//! declared port. A node is forgotten only when it unregisters.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

use peerwire_p2p::{NodeHandle, NodeId};

use crate::shutdown::ShutdownGuard;

/// Longest request or reply line accepted.
const MAX_LINE: usize = 64 * 1024;

/// Time allowed for connecting and for each line of an exchange.
pub const SEED_TIMEOUT: Duration = Duration::from_secs(5);

type LineStream = Framed<TcpStream, LinesCodec>;

fn line_stream(stream: TcpStream) -> LineStream {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE))
}

async fn read_line(lines: &mut LineStream) -> anyhow::Result<Option<String>> {
    match timeout(SEED_TIMEOUT, lines.next()).await {
        Ok(Some(line)) => Ok(Some(line?)),
        Ok(None) => Ok(None),
        Err(_) => bail!("no line within {:?}", SEED_TIMEOUT),
    }
}

/// A request to the seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedRequest {
    /// Record the sender as listening on `port`; reply with the others.
    Register { port: u16 },
    /// Forget a node.
    Unregister { addr: SocketAddr },
}

impl SeedRequest {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("REGISTER"), Some(port), None) => Ok(Self::Register {
                port: port.parse().with_context(|| format!("bad port {:?}", port))?,
            }),
            (Some("UNREGISTER"), Some(addr), None) => Ok(Self::Unregister {
                addr: addr.parse().with_context(|| format!("bad address {:?}", addr))?,
            }),
            _ => bail!("unrecognized seed request {:?}", line),
        }
    }
}

impl fmt::Display for SeedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { port } => write!(f, "REGISTER {}", port),
            Self::Unregister { addr } => write!(f, "UNREGISTER {}", addr),
        }
    }
}

/// Nodes known to a seed.
#[derive(Debug, Default)]
pub struct SeedDirectory {
    known: Mutex<BTreeSet<SocketAddr>>,
}

impl SeedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `addr` and return every other known node.
    pub fn register(&self, addr: SocketAddr) -> Vec<SocketAddr> {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        let others = known.iter().copied().filter(|a| *a != addr).collect();
        known.insert(addr);
        others
    }

    /// Forget `addr`. Returns whether it was known.
    pub fn unregister(&self, addr: SocketAddr) -> bool {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr)
    }

    pub fn known(&self) -> Vec<SocketAddr> {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}

/// The seed tracker server.
pub struct SeedServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    directory: Arc<SeedDirectory>,
}

impl SeedServer {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding seed listener on {}", addr))?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Seed tracker listening");

        Ok(Self {
            listener,
            local_addr,
            directory: Arc::new(SeedDirectory::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn directory(&self) -> Arc<SeedDirectory> {
        self.directory.clone()
    }

    /// Serve requests until shutdown.
    pub async fn run(self, mut shutdown: ShutdownGuard) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    tracing::info!("Seed tracker shutting down");
                    break;
                }

                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => {
                        tokio::spawn(serve_request(self.directory.clone(), stream, addr));
                    }
                    Err(e) => tracing::warn!(error = %e, "Seed accept error"),
                },
            }
        }
    }
}

async fn serve_request(directory: Arc<SeedDirectory>, stream: TcpStream, addr: SocketAddr) {
    let mut lines = line_stream(stream);

    let result = async {
        let Some(line) = read_line(&mut lines).await? else {
            return Ok(());
        };

        match SeedRequest::parse(&line)? {
            SeedRequest::Register { port } => {
                let node = SocketAddr::new(addr.ip(), port);
                let others = directory.register(node);
                lines.send(serde_json::to_string(&others)?).await?;
                tracing::info!(node = %node, peers = others.len(), "Registered node");
            }
            SeedRequest::Unregister { addr: node } => {
                if directory.unregister(node) {
                    tracing::info!(node = %node, "Unregistered node");
                } else {
                    tracing::warn!(node = %node, "Unregister for unknown node");
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(addr = %addr, error = %e, "Seed request failed");
    }
}

/// Talks to a seed on behalf of a node listening on `listen_port`.
#[derive(Debug, Clone)]
pub struct SeedClient {
    seed: SocketAddr,
    listen_port: u16,
}

impl SeedClient {
    pub fn new(seed: SocketAddr, listen_port: u16) -> Self {
        Self { seed, listen_port }
    }

    pub fn seed_addr(&self) -> SocketAddr {
        self.seed
    }

    /// Register with the seed and return the other nodes it knows.
    ///
    /// Registering again is harmless, so this also serves to refresh the
    /// list.
    pub async fn register(&self) -> anyhow::Result<Vec<SocketAddr>> {
        let mut lines = self.open().await?;
        lines
            .send(SeedRequest::Register { port: self.listen_port }.to_string())
            .await?;

        let reply = read_line(&mut lines)
            .await?
            .ok_or_else(|| anyhow!("seed {} closed without a reply", self.seed))?;
        let entries: Vec<String> =
            serde_json::from_str(&reply).context("seed reply is not a JSON list")?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    tracing::warn!(entry = %entry, "Ignoring bad seed entry");
                    None
                }
            })
            .collect())
    }

    /// Ask the seed to forget this node.
    ///
    /// The address sent uses the local IP of the connection to the seed,
    /// which is the IP the seed recorded at registration.
    pub async fn unregister(&self) -> anyhow::Result<()> {
        let mut lines = self.open().await?;
        let ip = lines.get_ref().local_addr()?.ip();
        let addr = SocketAddr::new(ip, self.listen_port);
        lines.send(SeedRequest::Unregister { addr }.to_string()).await?;
        Ok(())
    }

    async fn open(&self) -> anyhow::Result<LineStream> {
        let stream = timeout(SEED_TIMEOUT, TcpStream::connect(self.seed))
            .await
            .map_err(|_| anyhow!("connecting to seed {} timed out", self.seed))?
            .with_context(|| format!("connecting to seed {}", self.seed))?;
        Ok(line_stream(stream))
    }
}

/// Dial every discovered node that is neither us nor already connected.
/// Returns how many dials were started.
pub fn dial_discovered(node: &NodeHandle, peers: &[SocketAddr]) -> usize {
    let mut started = 0;
    for &addr in peers {
        let id = NodeId::new(addr.port());
        if id == node.local_id() || node.registry().contains(id) {
            continue;
        }

        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = node.connect(addr).await {
                tracing::debug!(addr = %addr, error = %e, "Dial to discovered node failed");
            }
        });
        started += 1;
    }
    started
}
