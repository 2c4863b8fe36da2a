//! Capability the session consumes from the transport host.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::OutboundMessage;

/// Identifier the host assigns to a dispatched task.
pub type TaskId = String;

/// A task to run on a remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub agent_id: String,
    /// e.g. `cmd`, `upload`, `download`.
    pub task_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl TaskRequest {
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        task_type: impl Into<String>,
        parameters: HashMap<String, Value>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            parameters,
            timeout: None,
        }
    }
}

/// The host's own view of its connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub connected: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub queue_size: usize,
    #[serde(default)]
    pub pending_calls: usize,
}

/// Transport host error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("Host rejected request: {0}")]
    Rejected(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Host unavailable: {0}")]
    Unavailable(String),
    #[error("Response timeout")]
    Timeout,
    #[error("Transport error: {0}")]
    Other(String),
}

/// Requests the session can issue to the transport host.
///
/// The host also pushes notifications (phase changes, latency samples,
/// inbound messages); those travel separately through the event bus.
#[async_trait]
pub trait TransportHost: Send + Sync {
    /// Open the channel to `url`, carrying an opaque credential if given.
    async fn connect(&self, url: &str, credential: Option<&str>) -> Result<(), HostError>;

    /// Close the channel.
    async fn disconnect(&self) -> Result<(), HostError>;

    /// Deliver one message. Kinds that expect a response return it.
    async fn send(&self, message: &OutboundMessage) -> Result<Option<Value>, HostError>;

    /// Run a task on an agent, returning the host-assigned id.
    async fn dispatch_task(&self, request: &TaskRequest) -> Result<TaskId, HostError>;

    /// Host-side connection status.
    async fn query_status(&self) -> Result<HostStatus, HostError>;
}
