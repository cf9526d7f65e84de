//! Node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use peerwire_p2p::config::{DEFAULT_BIND_ADDR, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL};
use peerwire_p2p::P2pConfig;

use crate::cli::Cli;

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// P2P listen address.
    pub p2p_addr: SocketAddr,

    /// Peers to connect to on startup.
    pub bootstrap_peers: Vec<SocketAddr>,

    /// Keepalive ping interval, if enabled.
    pub keepalive_interval: Option<Duration>,

    /// Handshake timeout.
    pub handshake_timeout: Duration,

    /// Read console commands from stdin.
    pub console_enabled: bool,

    /// Log level.
    pub log_level: String,

    /// Seed tracker to register with, if any.
    pub seed_addr: Option<SocketAddr>,

    /// Serve as a seed tracker on `p2p_addr` instead of running a node.
    pub serve_seed: bool,
}

impl NodeConfig {
    /// Create a node configuration from CLI arguments.
    pub fn from_cli(cli: &Cli) -> Self {
        let keepalive_interval = match cli.keepalive_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Self {
            p2p_addr: cli.listen,
            bootstrap_peers: cli.peers.clone().unwrap_or_default(),
            keepalive_interval,
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            console_enabled: !cli.no_console,
            log_level: cli.log_level.clone(),
            seed_addr: cli.seed,
            serve_seed: cli.seed_server,
        }
    }

    /// Build P2P configuration from node config.
    pub fn p2p_config(&self) -> P2pConfig {
        P2pConfig::new(self.p2p_addr)
            .with_bootstrap_peers(self.bootstrap_peers.clone())
            .with_keepalive_interval(self.keepalive_interval)
            .with_handshake_timeout(self.handshake_timeout)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            p2p_addr: SocketAddr::from(([127, 0, 0, 1], 17890)),
            bootstrap_peers: Vec::new(),
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            console_enabled: true,
            log_level: "info".to_string(),
            seed_addr: None,
            serve_seed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.p2p_addr, DEFAULT_BIND_ADDR.parse::<SocketAddr>().unwrap());
        assert!(config.console_enabled);
        assert!(config.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_from_cli() {
        let cli = Cli::parse_from([
            "peerwire-node",
            "--listen",
            "127.0.0.1:17891",
            "--peers",
            "127.0.0.1:17890",
            "--keepalive-secs",
            "0",
            "--handshake-timeout-secs",
            "5",
            "--no-console",
            "--seed",
            "127.0.0.1:17800",
        ]);
        let config = NodeConfig::from_cli(&cli);

        assert_eq!(config.p2p_addr.port(), 17891);
        assert_eq!(config.bootstrap_peers.len(), 1);
        assert!(config.keepalive_interval.is_none());
        assert!(!config.console_enabled);
        assert_eq!(config.seed_addr, Some("127.0.0.1:17800".parse().unwrap()));
        assert!(!config.serve_seed);

        let p2p = config.p2p_config();
        assert_eq!(p2p.bind_addr.port(), 17891);
        assert_eq!(p2p.bootstrap_peers, config.bootstrap_peers);
        assert_eq!(p2p.handshake_timeout, Duration::from_secs(5));
        assert!(p2p.keepalive_interval.is_none());
    }

    #[test]
    fn test_cli_defaults_match_library() {
        let config = NodeConfig::from_cli(&Cli::parse_from(["peerwire-node"]));
        assert_eq!(config.keepalive_interval, Some(DEFAULT_KEEPALIVE_INTERVAL));
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }
}
