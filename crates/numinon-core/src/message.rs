//! Outbound requests and inbound server messages.

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Outbound message identifier.
pub type MessageId = Uuid;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Request kinds understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "connect")]
    Connect,
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "auth:request")]
    AuthRequest,
    #[serde(rename = "auth:response")]
    AuthResponse,
    #[serde(rename = "auth:error")]
    AuthError,
    #[serde(rename = "agent:list")]
    AgentList,
    #[serde(rename = "agent:connected")]
    AgentConnected,
    #[serde(rename = "agent:disconnected")]
    AgentDisconnected,
    #[serde(rename = "agent:update")]
    AgentUpdate,
    #[serde(rename = "task:execute")]
    TaskExecute,
    #[serde(rename = "task:result")]
    TaskResult,
    #[serde(rename = "task:status")]
    TaskStatus,
    #[serde(rename = "task:cancel")]
    TaskCancel,
    #[serde(rename = "listener:create")]
    ListenerCreate,
    #[serde(rename = "listener:delete")]
    ListenerDelete,
    #[serde(rename = "listener:update")]
    ListenerUpdate,
    #[serde(rename = "listener:list")]
    ListenerList,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "notification")]
    Notification,
}

impl MessageType {
    const ALL: [Self; 21] = [
        Self::Connect,
        Self::Disconnect,
        Self::Ping,
        Self::Pong,
        Self::AuthRequest,
        Self::AuthResponse,
        Self::AuthError,
        Self::AgentList,
        Self::AgentConnected,
        Self::AgentDisconnected,
        Self::AgentUpdate,
        Self::TaskExecute,
        Self::TaskResult,
        Self::TaskStatus,
        Self::TaskCancel,
        Self::ListenerCreate,
        Self::ListenerDelete,
        Self::ListenerUpdate,
        Self::ListenerList,
        Self::Error,
        Self::Notification,
    ];

    /// Wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::AuthRequest => "auth:request",
            Self::AuthResponse => "auth:response",
            Self::AuthError => "auth:error",
            Self::AgentList => "agent:list",
            Self::AgentConnected => "agent:connected",
            Self::AgentDisconnected => "agent:disconnected",
            Self::AgentUpdate => "agent:update",
            Self::TaskExecute => "task:execute",
            Self::TaskResult => "task:result",
            Self::TaskStatus => "task:status",
            Self::TaskCancel => "task:cancel",
            Self::ListenerCreate => "listener:create",
            Self::ListenerDelete => "listener:delete",
            Self::ListenerUpdate => "listener:update",
            Self::ListenerList => "listener:list",
            Self::Error => "error",
            Self::Notification => "notification",
        }
    }

    /// Whether the controller answers this kind with a correlated response.
    #[must_use]
    pub const fn expects_response(self) -> bool {
        matches!(self, Self::AuthRequest | Self::TaskExecute)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known request kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown message type: {0}")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownMessageType(s.to_string()))
    }
}

/// A request waiting for, or undergoing, delivery to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Unique identifier, fixed at creation.
    pub id: MessageId,
    /// Request kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Opaque request body.
    #[serde(default)]
    pub payload: Value,
    /// Creation time (ms since epoch).
    pub enqueued_at: i64,
    /// Failed delivery attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

impl OutboundMessage {
    /// Create a message with a fresh id.
    #[must_use]
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            enqueued_at: now_millis(),
            attempts: 0,
        }
    }
}

/// Inbound server envelope as relayed by the transport host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// A server event handed to subscribers. Never stored by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Message kind, e.g. `task:result`.
    pub name: String,
    pub data: Value,
}

impl From<WireMessage> for InboundEvent {
    fn from(msg: WireMessage) -> Self {
        Self {
            name: msg.kind,
            data: msg.payload,
        }
    }
}
