//! End-to-end tests for the chat application on top of the P2P layer.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use peerwire_node::chat::{chat_message, register_chat_handler, CHAT};
use peerwire_node::console::{parse_command, Console};
use peerwire_node::seed::{dial_discovered, SeedClient, SeedServer};
use peerwire_node::shutdown::{Shutdown, ShutdownReason};
use peerwire_p2p::{NodeHandle, NodeId, P2pConfig, P2pNode, P2pResult};

struct ChatNode {
    handle: NodeHandle,
    addr: SocketAddr,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<P2pResult<()>>,
    inbox: mpsc::UnboundedReceiver<(NodeId, String)>,
}

impl ChatNode {
    async fn recv(&mut self) -> Option<(NodeId, String)> {
        timeout(Duration::from_secs(5), self.inbox.recv()).await.ok().flatten()
    }

    async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        let _ = timeout(Duration::from_secs(2), self.task).await;
    }
}

async fn start_chat_node() -> ChatNode {
    let config = P2pConfig::new("127.0.0.1:0".parse().unwrap())
        .with_keepalive_interval(None)
        .with_handshake_timeout(Duration::from_secs(3));
    let node = P2pNode::bind(config).await.expect("Failed to bind node");

    let (tx, inbox) = mpsc::unbounded_channel();
    register_chat_handler(&node.handle(), move |from, text| {
        let _ = tx.send((from, text));
    });

    ChatNode {
        handle: node.handle(),
        addr: node.local_addr(),
        shutdown: node.shutdown_handle(),
        task: tokio::spawn(node.run()),
        inbox,
    }
}

async fn wait_for_peers(node: &NodeHandle, count: usize) -> bool {
    for _ in 0..100 {
        if node.registry().len() == count {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[test]
fn test_chat_wire_payload() {
    let message = chat_message("hello").unwrap();
    assert_eq!(message.kind, CHAT);
    assert_eq!(serde_json::Value::Object(message.payload), json!({ "text": "hello" }));
}

#[tokio::test]
async fn test_console_broadcast_reaches_every_peer() {
    let a = start_chat_node().await;
    let mut b = start_chat_node().await;
    let mut c = start_chat_node().await;

    a.handle.connect(b.addr).await.unwrap();
    a.handle.connect(c.addr).await.unwrap();
    assert!(wait_for_peers(&a.handle, 2).await);

    let console = Console::new(a.handle.clone(), None);
    let flow = console.execute(parse_command("bc hi all")).await;
    assert!(flow.is_continue());

    assert_eq!(b.recv().await, Some((a.handle.local_id(), "hi all".to_string())));
    assert_eq!(c.recv().await, Some((a.handle.local_id(), "hi all".to_string())));

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn test_chat_without_text_drops_sender() {
    let a = start_chat_node().await;
    let b = start_chat_node().await;

    let conn = a.handle.connect(b.addr).await.unwrap();
    assert!(wait_for_peers(&b.handle, 1).await);

    conn.send(&peerwire_p2p::Message::new(CHAT)).unwrap();

    assert!(wait_for_peers(&b.handle, 0).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_console_send_reaches_only_target() {
    let a = start_chat_node().await;
    let mut b = start_chat_node().await;
    let mut c = start_chat_node().await;

    a.handle.connect(b.addr).await.unwrap();
    a.handle.connect(c.addr).await.unwrap();
    assert!(wait_for_peers(&a.handle, 2).await);

    let console = Console::new(a.handle.clone(), None);
    let line = format!("send {} just for you", c.handle.local_id().port());
    assert!(console.execute(parse_command(&line)).await.is_continue());

    assert_eq!(c.recv().await, Some((a.handle.local_id(), "just for you".to_string())));

    // A follow-up broadcast is the first thing b sees.
    console.execute(parse_command("bc everyone")).await;
    assert_eq!(b.recv().await, Some((a.handle.local_id(), "everyone".to_string())));
    assert_eq!(c.recv().await, Some((a.handle.local_id(), "everyone".to_string())));

    // Unknown target: reported, nothing sent, links intact.
    assert!(console.execute(parse_command("send 1 nobody")).await.is_continue());
    assert!(a.handle.send_to(NodeId::new(1), &chat_message("x").unwrap()).is_err());
    assert_eq!(a.handle.registry().len(), 2);

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn test_seed_discovery_connects_nodes() {
    let shutdown = Shutdown::new();
    let server = SeedServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let seed_addr = server.local_addr();
    let seed_task = tokio::spawn(server.run(shutdown.guard()));

    let mut a = start_chat_node().await;
    let b = start_chat_node().await;

    let seed_a = SeedClient::new(seed_addr, a.addr.port());
    let seed_b = SeedClient::new(seed_addr, b.addr.port());

    assert!(seed_a.register().await.unwrap().is_empty());
    let known = seed_b.register().await.unwrap();
    assert_eq!(known, vec![a.addr]);

    assert_eq!(dial_discovered(&b.handle, &known), 1);
    assert!(wait_for_peers(&a.handle, 1).await);
    assert!(wait_for_peers(&b.handle, 1).await);

    // Already connected: nothing new to dial.
    assert_eq!(dial_discovered(&b.handle, &known), 0);

    b.handle.broadcast(&chat_message("found you").unwrap(), None).unwrap();
    assert_eq!(a.recv().await, Some((b.handle.local_id(), "found you".to_string())));

    seed_a.unregister().await.unwrap();
    shutdown.trigger(ShutdownReason::Requested);
    timeout(Duration::from_secs(2), seed_task).await.unwrap().unwrap();

    a.stop().await;
    b.stop().await;
}
