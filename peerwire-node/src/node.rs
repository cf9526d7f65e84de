//! Node orchestrator.
//!
//! Runs the P2P node, the chat handler, seed registration and the console,
//! and tears them down together on shutdown. With `serve_seed` set it runs
//! a seed tracker instead.

use peerwire_p2p::{NodeHandle, P2pNode};

use crate::chat::register_chat_handler;
use crate::config::NodeConfig;
use crate::console::{run_console, Console};
use crate::seed::{dial_discovered, SeedClient, SeedServer};
use crate::shutdown::{wait_for_signal, Shutdown, ShutdownGuard, ShutdownReason};

/// The main node structure.
pub struct Node {
    /// Node configuration.
    config: NodeConfig,

    /// Shared shutdown trigger.
    shutdown: Shutdown,
}

impl Node {
    /// Create a new node with the given configuration.
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            shutdown: Shutdown::new(),
        }
    }

    /// Handle that stops a running node.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until a signal, `quit` on the console, or a trigger on
    /// [`Node::shutdown_handle`].
    pub async fn run(&self) -> anyhow::Result<()> {
        if self.config.serve_seed {
            self.run_seed().await
        } else {
            self.run_node().await
        }
    }

    async fn run_node(&self) -> anyhow::Result<()> {
        let p2p_node = P2pNode::bind(self.config.p2p_config()).await?;
        let handle = p2p_node.handle();
        let local_id = p2p_node.local_id();

        tracing::info!("Starting Peerwire node...");
        tracing::info!("  Node id: {}", local_id);
        tracing::info!("  P2P address: {}", p2p_node.local_addr());
        tracing::info!("  Bootstrap peers: {}", self.config.bootstrap_peers.len());

        register_chat_handler(&handle, move |from, text| {
            println!("[{}] {}", from, text);
        });

        // Guards are taken before their tasks exist.
        let mut guard = self.shutdown.guard();
        let console_guard = self.shutdown.guard();

        let p2p_shutdown = p2p_node.shutdown_handle();
        let p2p_task = tokio::spawn(async move {
            match p2p_node.run().await {
                Ok(()) => tracing::info!("P2P node stopped gracefully"),
                Err(e) => tracing::error!("P2P node error: {}", e),
            }
        });

        let seed = self
            .config
            .seed_addr
            .map(|addr| SeedClient::new(addr, local_id.port()));
        if let Some(seed) = &seed {
            join_via_seed(&handle, seed).await;
        }

        let console_task = self.config.console_enabled.then(|| {
            let console = Console::new(handle.clone(), seed.clone());
            tokio::spawn(run_console(console, console_guard, self.shutdown.clone()))
        });

        let reason = self.wait_for_stop(&mut guard).await?;
        tracing::info!(reason = %reason, "Shutting down node...");

        if let Some(seed) = &seed {
            match seed.unregister().await {
                Ok(()) => tracing::info!(seed = %seed.seed_addr(), "Unregistered from seed"),
                Err(e) => tracing::warn!(seed = %seed.seed_addr(), error = %e, "Seed unregister failed"),
            }
        }

        let _ = p2p_shutdown.send(()).await;
        let _ = p2p_task.await;

        if let Some(task) = console_task {
            let _ = task.await;
        }

        tracing::info!(node = %local_id, "Node shutdown complete");
        Ok(())
    }

    async fn run_seed(&self) -> anyhow::Result<()> {
        let server = SeedServer::bind(self.config.p2p_addr).await?;
        let mut guard = self.shutdown.guard();
        let server_task = tokio::spawn(server.run(self.shutdown.guard()));

        let reason = self.wait_for_stop(&mut guard).await?;
        tracing::info!(reason = %reason, "Stopping seed tracker...");

        let _ = server_task.await;
        Ok(())
    }

    /// Wait for a signal or any other trigger. A signal is passed on to
    /// every guard.
    async fn wait_for_stop(&self, guard: &mut ShutdownGuard) -> anyhow::Result<ShutdownReason> {
        let reason = tokio::select! {
            signal = wait_for_signal() => {
                let reason = signal?;
                self.shutdown.trigger(reason);
                reason
            }
            reason = guard.wait() => reason.unwrap_or(ShutdownReason::Requested),
        };
        Ok(reason)
    }

    /// Get the node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}

/// Register with the seed and dial what it returns. A missing seed is not
/// fatal; the node keeps running on its bootstrap peers.
async fn join_via_seed(node: &NodeHandle, seed: &SeedClient) {
    match seed.register().await {
        Ok(known) => {
            let dialing = dial_discovered(node, &known);
            tracing::info!(
                seed = %seed.seed_addr(),
                known = known.len(),
                dialing,
                "Registered with seed"
            );
        }
        Err(e) => tracing::warn!(seed = %seed.seed_addr(), error = %e, "Seed registration failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quiet_config() -> NodeConfig {
        NodeConfig {
            p2p_addr: "127.0.0.1:0".parse().unwrap(),
            keepalive_interval: None,
            console_enabled: false,
            ..NodeConfig::default()
        }
    }

    async fn stop_when_running(node: Node) -> anyhow::Result<()> {
        let shutdown = node.shutdown_handle();
        let run = tokio::spawn(async move { node.run().await });

        // Keep triggering until the running node has subscribed.
        let stopped = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                shutdown.trigger(ShutdownReason::Requested);
                if run.is_finished() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            run.await
        })
        .await;

        stopped.expect("node did not stop").unwrap()
    }

    #[tokio::test]
    async fn test_node_stops_on_shutdown_handle() {
        stop_when_running(Node::new(quiet_config())).await.unwrap();
    }

    #[tokio::test]
    async fn test_seed_server_mode_stops_on_shutdown_handle() {
        let node = Node::new(NodeConfig {
            serve_seed: true,
            ..quiet_config()
        });
        stop_when_running(node).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_seed_does_not_stop_node() {
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed_addr = unused.local_addr().unwrap();
        drop(unused);

        let node = Node::new(NodeConfig {
            seed_addr: Some(seed_addr),
            ..quiet_config()
        });
        stop_when_running(node).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_error_is_reported() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = Node::new(NodeConfig {
            p2p_addr: taken.local_addr().unwrap(),
            ..quiet_config()
        });

        assert!(node.run().await.is_err());
    }
}
