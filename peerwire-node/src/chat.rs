//! The `chat` application message.

use serde::{Deserialize, Serialize};

use peerwire_p2p::{Message, NodeHandle, NodeId, P2pError, P2pResult};

/// Message type of chat lines.
pub const CHAT: &str = "chat";

/// Payload of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub text: String,
}

/// Build a chat message carrying `text`.
pub fn chat_message(text: impl Into<String>) -> P2pResult<Message> {
    Message::from_payload(CHAT, &ChatPayload { text: text.into() })
}

/// Register a handler that passes every incoming chat line to `on_chat`.
///
/// A chat message without a text field drops the sending peer.
pub fn register_chat_handler<F>(node: &NodeHandle, on_chat: F)
where
    F: Fn(NodeId, String) + Send + Sync + Clone + 'static,
{
    node.register_handler(CHAT, move |ctx, message| {
        let on_chat = on_chat.clone();
        async move {
            let chat: ChatPayload = message.parse_payload()?;
            on_chat(ctx.peer.node_id(), chat.text);
            Ok::<(), P2pError>(())
        }
    });
}
