//! Command-line argument parsing.

use std::net::SocketAddr;

use clap::Parser;

/// Peerwire P2P node.
#[derive(Parser, Debug, Clone)]
#[command(name = "peerwire-node")]
#[command(about = "Peer-to-peer messaging node")]
#[command(version)]
pub struct Cli {
    /// P2P listen address. The port is this node's id.
    #[arg(long, default_value = "127.0.0.1:17890")]
    pub listen: SocketAddr,

    /// Comma-separated list of peers to connect to on startup.
    #[arg(long, value_delimiter = ',')]
    pub peers: Option<Vec<SocketAddr>>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Seconds between keepalive pings (0 disables keepalive).
    #[arg(long, default_value_t = 90)]
    pub keepalive_secs: u64,

    /// Seconds to wait for a peer's hello.
    #[arg(long, default_value_t = 15)]
    pub handshake_timeout_secs: u64,

    /// Do not read commands from stdin.
    #[arg(long)]
    pub no_console: bool,

    /// Seed tracker to register with on startup.
    #[arg(long)]
    pub seed: Option<SocketAddr>,

    /// Run as a seed tracker on the listen address instead of a node.
    #[arg(long, conflicts_with_all = ["seed", "peers"])]
    pub seed_server: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
