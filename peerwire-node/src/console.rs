//! Interactive console on stdin.
//!
//! Stdin is read on a dedicated thread and lines are forwarded over a
//! channel, so a pending blocking read never holds up the runtime.

use std::fmt::Write as _;
use std::io::BufRead;
use std::net::SocketAddr;
use std::ops::ControlFlow;

use tokio::sync::mpsc;

use peerwire_p2p::{ConnectInfo, NodeHandle, NodeId, PeerSnapshot};

use crate::chat::chat_message;
use crate::seed::{dial_discovered, SeedClient};
use crate::shutdown::{Shutdown, ShutdownGuard, ShutdownReason};

const HELP: &str = "commands: bc <text> | send <node_id> <text> | peers | stat | \
                    peerlist | renewpeers | help | quit";

const SEND_USAGE: &str = "usage: send <node_id|ip:port> <text>";

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send a chat line to every peer.
    Broadcast(String),
    /// Send a chat line to one peer.
    Send { to: NodeId, text: String },
    /// List where connected peers listen.
    Peers,
    /// Print the peer table.
    Stat,
    /// Register with the seed and print what it knows.
    PeerList,
    /// Register with the seed and dial every node it lists.
    RenewPeers,
    Help,
    Quit,
    Empty,
    /// A known command used wrongly.
    Invalid(&'static str),
    Unknown(String),
}

/// Parse a `send` target: a bare id or a peer's `ip:port`.
fn parse_target(target: &str) -> Option<NodeId> {
    if let Ok(port) = target.parse::<u16>() {
        return Some(NodeId::new(port));
    }
    target.parse::<SocketAddr>().ok().map(|addr| NodeId::new(addr.port()))
}

/// Parse one input line.
pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word {
        "" => Command::Empty,
        "bc" if !rest.is_empty() => Command::Broadcast(rest.to_string()),
        "send" => match rest.split_once(char::is_whitespace) {
            Some((target, text)) => match parse_target(target) {
                Some(to) => Command::Send {
                    to,
                    text: text.trim().to_string(),
                },
                None => Command::Invalid(SEND_USAGE),
            },
            None => Command::Invalid(SEND_USAGE),
        },
        "peers" => Command::Peers,
        "stat" => Command::Stat,
        "peerlist" => Command::PeerList,
        "renewpeers" => Command::RenewPeers,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    }
}

/// Render the peer table printed by `stat`.
pub fn format_stat(local_id: NodeId, peers: &[PeerSnapshot]) -> String {
    let mut out = format!("{}: {} peer(s)", local_id, peers.len());
    for peer in peers {
        let _ = write!(out, "\n  {}", peer);
    }
    out
}

/// Render the listing printed by `peers`.
pub fn format_peers(peers: &[ConnectInfo]) -> String {
    if peers.is_empty() {
        return "no peers".to_string();
    }
    peers
        .iter()
        .map(|peer| format!("{} {}", peer.node_id, peer.listen_addr()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Executes console commands against a running node.
#[derive(Clone)]
pub struct Console {
    node: NodeHandle,
    seed: Option<SeedClient>,
}

impl Console {
    pub fn new(node: NodeHandle, seed: Option<SeedClient>) -> Self {
        Self { node, seed }
    }

    /// Execute a command. Returns `Break` on quit.
    pub async fn execute(&self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Broadcast(text) => {
                match chat_message(text).and_then(|m| self.node.broadcast(&m, None)) {
                    Ok(sent) => println!("sent to {} peer(s)", sent),
                    Err(e) => println!("broadcast failed: {}", e),
                }
            }
            Command::Send { to, text } => {
                match chat_message(text).and_then(|m| self.node.send_to(to, &m)) {
                    Ok(()) => println!("sent to {}", to),
                    Err(e) => println!("send failed: {}", e),
                }
            }
            Command::Peers => println!("{}", format_peers(&self.node.peers())),
            Command::Stat => println!(
                "{}",
                format_stat(self.node.local_id(), &self.node.registry().snapshots())
            ),
            Command::PeerList => {
                if let Some(known) = self.ask_seed().await {
                    println!("seed knows {} other node(s)", known.len());
                    for addr in known {
                        println!("  {}", addr);
                    }
                }
            }
            Command::RenewPeers => {
                if let Some(known) = self.ask_seed().await {
                    let dialing = dial_discovered(&self.node, &known);
                    println!("dialing {} of {} node(s) from seed", dialing, known.len());
                }
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => return ControlFlow::Break(()),
            Command::Empty => {}
            Command::Invalid(usage) => println!("{}", usage),
            Command::Unknown(line) => println!("unknown command: {} ({})", line, HELP),
        }
        ControlFlow::Continue(())
    }

    async fn ask_seed(&self) -> Option<Vec<SocketAddr>> {
        let Some(seed) = &self.seed else {
            println!("no seed configured (start with --seed <addr>)");
            return None;
        };
        match seed.register().await {
            Ok(known) => Some(known),
            Err(e) => {
                println!("seed {} unavailable: {:#}", seed.seed_addr(), e);
                None
            }
        }
    }
}

/// Forward stdin lines from a dedicated thread.
fn spawn_input_thread() -> std::io::Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

/// Run the console until `quit`, end of input, or shutdown.
///
/// `guard` must be taken before this task is spawned. `quit` triggers
/// `shutdown`; end of input only stops the console.
pub async fn run_console(console: Console, mut guard: ShutdownGuard, shutdown: Shutdown) {
    let mut lines = match spawn_input_thread() {
        Ok(lines) => lines,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to start console");
            return;
        }
    };

    println!("{}", HELP);

    loop {
        tokio::select! {
            _ = guard.wait() => break,

            line = lines.recv() => {
                let Some(line) = line else {
                    tracing::debug!("Console input closed");
                    break;
                };
                if console.execute(parse_command(&line)).await.is_break() {
                    shutdown.trigger(ShutdownReason::ConsoleQuit);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerwire_p2p::ConnectionDirection;
    use std::time::Instant;

    fn idle_console() -> Console {
        let node = NodeHandle::new("127.0.0.1:17890".parse().unwrap(), Default::default());
        Console::new(node, None)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("bc hello world"), Command::Broadcast("hello world".into()));
        assert_eq!(parse_command("  bc   spaced  "), Command::Broadcast("spaced".into()));
        assert_eq!(parse_command("stat"), Command::Stat);
        assert_eq!(parse_command("peers"), Command::Peers);
        assert_eq!(parse_command("peerlist"), Command::PeerList);
        assert_eq!(parse_command("renewpeers"), Command::RenewPeers);
        assert_eq!(parse_command("quit"), Command::Quit);
        assert_eq!(parse_command("exit"), Command::Quit);
        assert_eq!(parse_command("help"), Command::Help);
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(parse_command("bc"), Command::Unknown("bc".into()));
        assert_eq!(parse_command("mine 3"), Command::Unknown("mine 3".into()));
    }

    #[test]
    fn test_parse_send() {
        assert_eq!(
            parse_command("send 17891 hi  there"),
            Command::Send { to: NodeId::new(17891), text: "hi  there".into() }
        );
        assert_eq!(
            parse_command("send 127.0.0.1:17892 hi"),
            Command::Send { to: NodeId::new(17892), text: "hi".into() }
        );
        assert_eq!(parse_command("send 17891"), Command::Invalid(SEND_USAGE));
        assert_eq!(parse_command("send"), Command::Invalid(SEND_USAGE));
        assert_eq!(parse_command("send bob hi"), Command::Invalid(SEND_USAGE));
        assert_eq!(parse_command("send 70000 hi"), Command::Invalid(SEND_USAGE));
    }

    #[test]
    fn test_format_stat() {
        let peers = vec![PeerSnapshot {
            connect_info: ConnectInfo::new("127.0.0.1:50000".parse().unwrap(), 17891),
            direction: ConnectionDirection::Inbound,
            connected_at: Instant::now(),
        }];

        let out = format_stat(NodeId::new(17890), &peers);
        assert_eq!(
            out,
            "node-17890: 1 peer(s)\n  node-17891 (127.0.0.1:17891), inbound, up 0s"
        );
        assert_eq!(format_stat(NodeId::new(17890), &[]), "node-17890: 0 peer(s)");
    }

    #[test]
    fn test_format_peers() {
        let peers = vec![
            ConnectInfo::new("127.0.0.1:50000".parse().unwrap(), 17891),
            ConnectInfo::new("10.0.0.2:50001".parse().unwrap(), 17892),
        ];
        assert_eq!(
            format_peers(&peers),
            "node-17891 127.0.0.1:17891\nnode-17892 10.0.0.2:17892"
        );
        assert_eq!(format_peers(&[]), "no peers");
    }

    #[tokio::test]
    async fn test_execute_quit_breaks() {
        let console = idle_console();
        assert!(console.execute(Command::Quit).await.is_break());
        assert!(console.execute(Command::Stat).await.is_continue());
        assert!(console
            .execute(Command::Broadcast("nobody listening".into()))
            .await
            .is_continue());
    }

    #[tokio::test]
    async fn test_execute_without_seed_or_peer_continues() {
        let console = idle_console();
        let send = Command::Send { to: NodeId::new(17999), text: "anyone?".into() };
        assert!(console.execute(send).await.is_continue());
        assert!(console.execute(Command::PeerList).await.is_continue());
        assert!(console.execute(Command::RenewPeers).await.is_continue());
        assert!(console.execute(Command::Invalid(SEND_USAGE)).await.is_continue());
    }
}
