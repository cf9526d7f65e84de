//! Message-type dispatch table.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::P2pResult;
use crate::node::NodeHandle;
use crate::peer::PeerConnection;
use crate::protocol::Message;

/// What a handler gets to work with besides the message itself.
#[derive(Clone)]
pub struct HandlerContext {
    /// Connection the message arrived on.
    pub peer: Arc<PeerConnection>,
    /// The local node.
    pub node: NodeHandle,
}

impl HandlerContext {
    pub fn new(peer: Arc<PeerConnection>, node: NodeHandle) -> Self {
        Self { peer, node }
    }
}

/// A message handler.
///
/// Returning an error terminates the connection the message arrived on.
pub type Handler =
    Arc<dyn Fn(HandlerContext, Message) -> BoxFuture<'static, P2pResult<()>> + Send + Sync>;

fn boxed<F, Fut>(handler: F) -> Handler
where
    F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = P2pResult<()>> + Send + 'static,
{
    Arc::new(move |ctx: HandlerContext, message: Message| handler(ctx, message).boxed())
}

async fn log_unknown(ctx: HandlerContext, message: Message) -> P2pResult<()> {
    tracing::debug!(
        peer = %ctx.peer.node_id(),
        kind = %message.kind,
        "No handler for message type, ignoring"
    );
    Ok(())
}

/// Mapping from message type to handler, with a fallback for unknown types.
#[derive(Clone)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
    fallback: Handler,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    /// Create an empty table whose fallback logs and ignores the message.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: boxed(log_unknown),
        }
    }

    /// Register a handler for `kind`, returning the one it replaces.
    pub fn register<F, Fut>(&mut self, kind: impl Into<String>, handler: F) -> Option<Handler>
    where
        F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = P2pResult<()>> + Send + 'static,
    {
        self.handlers.insert(kind.into(), boxed(handler))
    }

    /// Remove the handler for `kind`.
    pub fn unregister(&mut self, kind: &str) -> Option<Handler> {
        self.handlers.remove(kind)
    }

    /// Replace the handler used for unregistered types.
    pub fn set_fallback<F, Fut>(&mut self, handler: F)
    where
        F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = P2pResult<()>> + Send + 'static,
    {
        self.fallback = boxed(handler);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered message types, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Start handling a message.
    ///
    /// The returned future does not borrow the table, so the table may be
    /// locked only while the handler is looked up.
    pub fn dispatch(&self, ctx: HandlerContext, message: Message) -> BoxFuture<'static, P2pResult<()>> {
        let handler = self.handlers.get(&message.kind).unwrap_or(&self.fallback);
        handler(ctx, message)
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.kinds())
            .finish()
    }
}
