//! Read and observe layer for UI consumers.
//!
//! `PresentationAdapter` never mutates session state. It keeps a bounded
//! history per configured message kind, fed from the session's
//! `message:<kind>` re-publishes while active, and forwards the four
//! session operations.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use futures::stream::BoxStream;
use numinon_core::{
    ConnectionStatus, EventPayload, InboundEvent, MessageHistory, MessageType, SubscriptionHandle,
    TaskId, message::UnknownMessageType, names,
};
use numinon_session::{ConnectError, DisconnectError, SendError, SendReceipt, SessionManager, TaskError};
use serde_json::Value;
use thiserror::Error;
use tokio_stream::wrappers::WatchStream;

/// Failure of a send issued by kind name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    UnknownKind(#[from] UnknownMessageType),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Observer over one session.
///
/// The bus allows one handler per name, so at most one active adapter
/// should exist per session.
pub struct PresentationAdapter {
    session: SessionManager,
    histories: HashMap<String, Arc<MessageHistory>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl std::fmt::Debug for PresentationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationAdapter")
            .field("kinds", &self.histories.keys().collect::<Vec<_>>())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl PresentationAdapter {
    /// Create an inactive adapter with a history for each kind the session relays.
    #[must_use]
    pub fn new(session: SessionManager) -> Self {
        let capacity = session.config().history_capacity;
        let histories = session
            .config()
            .message_kinds
            .iter()
            .map(|kind| (kind.clone(), Arc::new(MessageHistory::new(capacity))))
            .collect();
        Self {
            session,
            histories,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionHandle>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start recording message histories. Idempotent.
    pub fn activate(&self) {
        let mut handles = self.handles();
        if !handles.is_empty() {
            return;
        }
        let bus = self.session.bus();
        for (kind, history) in &self.histories {
            let history = Arc::clone(history);
            handles.push(bus.subscribe(names::consumer(kind), move |payload| {
                if let EventPayload::Message(event) = payload {
                    history.push(event.clone());
                }
            }));
        }
        tracing::debug!(count = handles.len(), "Presentation adapter activated");
    }

    /// Remove every subscription this adapter registered.
    pub fn deactivate(&self) {
        let mut handles = self.handles();
        if handles.is_empty() {
            return;
        }
        let bus = self.session.bus();
        for handle in handles.drain(..) {
            bus.unsubscribe(&handle);
        }
        tracing::debug!("Presentation adapter deactivated");
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.handles().is_empty()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.session.is_reconnecting()
    }

    #[must_use]
    pub fn average_latency_ms(&self) -> u64 {
        self.session.average_latency_ms()
    }

    /// Current status followed by every change.
    #[must_use]
    pub fn status_stream(&self) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.session.watch_status())
    }

    /// Retained messages of `kind`, oldest first. Empty for unknown kinds.
    #[must_use]
    pub fn history(&self, kind: &str) -> Vec<InboundEvent> {
        self.histories
            .get(kind)
            .map(|h| h.snapshot())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn latest(&self, kind: &str) -> Option<InboundEvent> {
        self.histories.get(kind).and_then(|h| h.latest())
    }

    /// Retained messages of `kind` followed by live ones.
    #[must_use]
    pub fn history_stream(&self, kind: &str) -> Option<BoxStream<'static, InboundEvent>> {
        self.histories.get(kind).map(|h| h.history_plus_stream())
    }

    /// Forward to [`SessionManager::connect`].
    ///
    /// # Errors
    /// See [`ConnectError`].
    pub async fn connect(&self, url: &str) -> Result<(), ConnectError> {
        self.session.connect(url).await
    }

    /// Forward to [`SessionManager::disconnect`]. On success the message
    /// histories are cleared.
    ///
    /// # Errors
    /// See [`DisconnectError`].
    pub async fn disconnect(&self) -> Result<(), DisconnectError> {
        self.session.disconnect().await?;
        for history in self.histories.values() {
            history.clear();
        }
        Ok(())
    }

    /// Send by kind name, e.g. `"task:execute"`.
    ///
    /// # Errors
    /// Returns [`RequestError::UnknownKind`] if `kind` is not a request
    /// kind, otherwise see [`SessionManager::send`].
    pub async fn send(&self, kind: &str, payload: Value) -> Result<SendReceipt, RequestError> {
        let kind: MessageType = kind.parse()?;
        Ok(self.session.send(kind, payload).await?)
    }

    /// Forward to [`SessionManager::dispatch_task`].
    ///
    /// # Errors
    /// See [`TaskError`].
    pub async fn dispatch_task(
        &self,
        agent_id: &str,
        task_type: &str,
        parameters: HashMap<String, Value>,
    ) -> Result<TaskId, TaskError> {
        self.session
            .dispatch_task(agent_id, task_type, parameters)
            .await
    }
}

impl Drop for PresentationAdapter {
    fn drop(&mut self) {
        self.deactivate();
    }
}
