//! P2P protocol messages.
//!
//! Every message is a type tag, a timestamp and an open JSON object payload.
//! The tag selects the handler on the receiving side; tags other than the
//! ones defined here are application-defined.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{P2pError, P2pResult};
use crate::peer::{ConnectInfo, NodeId};

/// Handshake message, the first frame sent on every connection.
pub const HELLO: &str = "hello";
/// Keepalive request.
pub const PING: &str = "ping";
/// Keepalive reply.
pub const PONG: &str = "pong";
/// Membership announcement for a newly established peer.
pub const NOTIFY_NEW_NODE: &str = "notify_new_node";

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Type tag. Never empty on a decoded message.
    #[serde(rename = "type")]
    pub kind: String,
    /// Seconds since the Unix epoch, stamped when the message is encoded.
    #[serde(default)]
    pub timestamp: u64,
    /// Message body.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Current Unix time in seconds.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Message {
    /// Create a message with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self::with_payload(kind, Map::new())
    }

    /// Create a message with the given payload object.
    pub fn with_payload(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            timestamp: 0,
            payload,
        }
    }

    /// Create a message from any serializable payload.
    ///
    /// The payload must serialize to a JSON object.
    pub fn from_payload<T: Serialize>(kind: impl Into<String>, payload: &T) -> P2pResult<Self> {
        match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => Ok(Self::with_payload(kind, map)),
            Ok(other) => Err(P2pError::Encoding(format!(
                "payload must be a JSON object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(P2pError::Encoding(e.to_string())),
        }
    }

    /// Deserialize the payload into a typed structure.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> P2pResult<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| P2pError::InvalidPayload(format!("{} payload: {}", self.kind, e)))
    }

    /// Whether this message carries the given type tag.
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Handshake hello announcing our identity.
    pub fn hello(local_id: NodeId) -> Self {
        let mut payload = Map::new();
        payload.insert("node_id".into(), Value::from(local_id.port()));
        payload.insert("listen_port".into(), Value::from(local_id.port()));
        Self::with_payload(HELLO, payload)
    }

    /// Keepalive ping.
    pub fn ping() -> Self {
        Self::new(PING)
    }

    /// Keepalive pong.
    pub fn pong() -> Self {
        Self::new(PONG)
    }

    /// Announcement of a newly established peer.
    pub fn notify_new_node(info: &ConnectInfo) -> P2pResult<Self> {
        Self::from_payload(NOTIFY_NEW_NODE, info)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            let keys: Vec<&str> = self.payload.keys().map(String::as_str).collect();
            write!(f, "{}({})", self.kind, keys.join(","))
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Payload of the `hello` handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Sender's node id.
    pub node_id: u64,
    /// Sender's listening port. Must equal `node_id`.
    pub listen_port: u64,
}

impl HelloPayload {
    /// Validate the declared identity and return it.
    pub fn identity(&self) -> P2pResult<NodeId> {
        if self.node_id != self.listen_port {
            return Err(P2pError::InvalidIdentity {
                node_id: self.node_id,
                listen_port: self.listen_port,
            });
        }
        u16::try_from(self.listen_port)
            .map(NodeId::new)
            .map_err(|_| P2pError::InvalidPayload(format!("listen port {} out of range", self.listen_port)))
    }
}

/// Validate a `notify_new_node` payload.
pub fn parse_new_node(message: &Message) -> P2pResult<ConnectInfo> {
    let info: ConnectInfo = message.parse_payload()?;
    if info.node_id.port() != info.port {
        return Err(P2pError::InvalidIdentity {
            node_id: info.node_id.port() as u64,
            listen_port: info.port as u64,
        });
    }
    Ok(info)
}
