//! Session manager: the single owner of connection state.
//!
//! A `SessionManager` is a cheap, cloneable handle. On construction it
//! subscribes to the transport host's phase, latency and inbound-message
//! events on the [`EventBus`]; its handlers hold only a weak reference, and
//! the subscriptions are removed when the last handle is dropped.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use numinon_core::{
    ConnectionPhase, ConnectionStatus, ConsoleConfig, DrainReport, EventBus, EventPayload,
    HostError, HostStatus, InboundEvent, LatencyWindow, MessageId, MessageQueue, MessageType,
    OutboundMessage, PhaseEvent, PingSample, QueueStats, SessionConfig, SubscriptionHandle,
    TaskId, TaskRequest, TransportHost, names,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::machine::{ConnectRejection, DisconnectRejection, StateMachine, Step};

/// Connect failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("Connection already active ({0})")]
    AlreadyActive(ConnectionPhase),
    #[error("Disconnect in progress")]
    DisconnectInProgress,
    #[error("Connection failed: {0}")]
    Transport(String),
    /// A `disconnect()` landed while the attempt was in flight.
    #[error("Connection attempt aborted by disconnect")]
    Aborted,
}

impl From<ConnectRejection> for ConnectError {
    fn from(r: ConnectRejection) -> Self {
        match r {
            ConnectRejection::AlreadyActive(phase) => Self::AlreadyActive(phase),
            ConnectRejection::DisconnectInProgress => Self::DisconnectInProgress,
        }
    }
}

/// Disconnect failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectError {
    #[error("Already disconnecting")]
    AlreadyDisconnecting,
    #[error("Disconnect failed: {0}")]
    Transport(String),
}

impl From<DisconnectRejection> for DisconnectError {
    fn from(r: DisconnectRejection) -> Self {
        match r {
            DisconnectRejection::AlreadyDisconnecting => Self::AlreadyDisconnecting,
        }
    }
}

/// A send that failed now.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Queued; the next drain retries it.
    #[error("Delivery of {id} failed, queued for retry: {reason}")]
    RetryScheduled { id: MessageId, reason: String },
    /// The failure used up the retry budget; the message is gone.
    #[error("Delivery of {id} failed, retries exhausted: {reason}")]
    Dropped { id: MessageId, reason: String },
}

/// Task dispatch failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("Not connected ({0})")]
    NotConnected(ConnectionPhase),
    #[error("Task dispatch failed: {0}")]
    Transport(String),
}

/// Why a message was queued instead of sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueReason {
    NotConnected,
    /// Earlier messages are still waiting; sending now would reorder them.
    Backlog,
}

/// Successful outcome of [`SessionManager::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum SendReceipt {
    Delivered { id: MessageId, response: Option<Value> },
    Queued { id: MessageId, reason: QueueReason },
}

impl SendReceipt {
    #[must_use]
    pub const fn id(&self) -> MessageId {
        match self {
            Self::Delivered { id, .. } | Self::Queued { id, .. } => *id,
        }
    }

    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

struct SessionState {
    machine: StateMachine,
    latency: LatencyWindow,
    latency_ms: Option<u64>,
    last_ping_at: Option<i64>,
    pending_tasks: HashMap<TaskId, TaskRequest>,
}

impl SessionState {
    fn status(&self) -> ConnectionStatus {
        let phase = self.machine.phase();
        ConnectionStatus {
            phase,
            server_url: self.machine.server_url().map(String::from),
            last_ping_at: self.last_ping_at,
            latency_ms: self.latency_ms.filter(|_| phase.is_usable()),
            last_error: self.machine.last_error().map(String::from),
            reconnect_attempt: self.machine.reconnect_attempt(),
        }
    }

    fn reset_latency(&mut self) {
        self.latency.clear();
        self.latency_ms = None;
    }

    /// Clears latency state if `step` left a usable phase.
    fn settle(&mut self, step: Step) -> Step {
        if step.transition().is_some_and(|t| t.left_usable()) {
            self.reset_latency();
        }
        step
    }
}

struct Inner {
    host: Arc<dyn TransportHost>,
    bus: EventBus,
    config: SessionConfig,
    credential: Option<String>,
    state: Mutex<SessionState>,
    queue: tokio::sync::Mutex<MessageQueue>,
    status_tx: watch::Sender<ConnectionStatus>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let handles = std::mem::take(
            self.subscriptions
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in &handles {
            self.bus.unsubscribe(handle);
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn phase(&self) -> ConnectionPhase {
        self.lock_state().machine.phase()
    }

    /// Push the current status to watchers. Call with the state lock held
    /// so snapshots reach the channel in mutation order.
    fn commit(&self, state: &SessionState) -> ConnectionStatus {
        let status = state.status();
        self.status_tx.send_replace(status.clone());
        status
    }

    /// Re-publish a committed status on the bus. Call without the lock.
    fn announce(&self, status: ConnectionStatus) {
        self.bus
            .publish_payload(names::STATUS, &EventPayload::Status(status));
    }

    fn log_step(step: Step, cause: &str) {
        match step {
            Step::Moved(t) => tracing::info!(from = %t.from, to = %t.to, cause, "Connection phase changed"),
            Step::Unchanged(phase) => tracing::debug!(%phase, cause, "Phase unchanged"),
            Step::Ignored(reason) => tracing::warn!(?reason, cause, "Ignored phase input"),
        }
    }

    fn on_phase(self: &Arc<Self>, event: &PhaseEvent) {
        let (step, status) = {
            let mut state = self.lock_state();
            let step = state.machine.apply(event);
            let step = state.settle(step);

            let link_lost = step
                .transition()
                .is_some_and(|t| t.to == ConnectionPhase::Disconnected)
                || (matches!(event, PhaseEvent::ReconnectFailed { .. }) && !step.is_ignored());
            if link_lost && !state.pending_tasks.is_empty() {
                tracing::warn!(count = state.pending_tasks.len(), "Link lost, abandoning pending tasks");
                state.pending_tasks.clear();
            }

            let status = (!step.is_ignored()).then(|| self.commit(&state));
            (step, status)
        };

        Self::log_step(step, event.name());
        let Some(status) = status else {
            return;
        };
        self.announce(status);

        if step.transition().is_some_and(|t| t.entered_usable()) {
            self.spawn_drain();
        }
    }

    fn on_latency(&self, sample: PingSample) {
        let status = {
            let mut state = self.lock_state();
            if !state.machine.phase().is_usable() {
                tracing::debug!(latency_ms = sample.latency_ms, "Latency sample while not connected, ignored");
                return;
            }
            state.latency.push(sample);
            state.latency_ms = Some(sample.latency_ms);
            state.last_ping_at = Some(sample.timestamp);
            self.commit(&state)
        };
        self.announce(status);
    }

    fn on_inbound(&self, consumer_name: &str, event: &InboundEvent) {
        tracing::debug!(kind = %event.name, "Received server message");

        if event.name == MessageType::TaskResult.as_str() {
            if let Some(task_id) = event.data.get("taskId").and_then(Value::as_str) {
                if self.lock_state().pending_tasks.remove(task_id).is_some() {
                    tracing::debug!(%task_id, "Task result correlated");
                }
            }
        }

        self.bus
            .publish_payload(consumer_name, &EventPayload::Message(event.clone()));
    }

    /// Drain on a background task; notification handlers cannot await.
    fn spawn_drain(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    inner.drain().await;
                });
            }
            Err(_) => {
                tracing::debug!("No async runtime, queued messages wait for the next send");
            }
        }
    }

    async fn drain(&self) -> DrainReport {
        let mut queue = self.queue.lock().await;
        self.drain_locked(&mut queue).await
    }

    async fn drain_locked(&self, queue: &mut MessageQueue) -> DrainReport {
        if queue.is_empty() || !self.phase().is_usable() {
            return DrainReport {
                remaining: queue.len(),
                ..DrainReport::default()
            };
        }

        tracing::info!(count = queue.len(), "Processing queued messages");
        let host = &self.host;
        let report = queue
            .drain_in_order(|msg| async move { host.send(&msg).await.map(|_| ()) })
            .await;

        if let Some(failure) = &report.failure {
            tracing::warn!(
                id = %failure.id,
                reason = %failure.reason,
                dropped = failure.dropped,
                remaining = report.remaining,
                "Failed to send queued message"
            );
        }
        report
    }
}

/// Orchestrates the transport host, state machine and outbound queue.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a session and subscribe it to the host's events on `bus`.
    #[must_use]
    pub fn new(host: Arc<dyn TransportHost>, bus: EventBus, config: SessionConfig) -> Self {
        Self::build(host, bus, config, None)
    }

    /// Create a session from the full console config, carrying its credential.
    #[must_use]
    pub fn from_config(host: Arc<dyn TransportHost>, bus: EventBus, config: &ConsoleConfig) -> Self {
        Self::build(
            host,
            bus,
            config.session.clone(),
            config.connection.credential.clone(),
        )
    }

    fn build(
        host: Arc<dyn TransportHost>,
        bus: EventBus,
        config: SessionConfig,
        credential: Option<String>,
    ) -> Self {
        let state = SessionState {
            machine: StateMachine::new(),
            latency: LatencyWindow::new(config.latency_window),
            latency_ms: None,
            last_ping_at: None,
            pending_tasks: HashMap::new(),
        };
        let (status_tx, _) = watch::channel(state.status());
        let queue = MessageQueue::new(config.queue_capacity, config.max_delivery_attempts);

        let inner = Arc::new(Inner {
            host,
            bus,
            config,
            credential,
            state: Mutex::new(state),
            queue: tokio::sync::Mutex::new(queue),
            status_tx,
            subscriptions: Mutex::new(Vec::new()),
        });

        let handles = Self::subscribe_events(&inner);
        *inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handles;

        Self { inner }
    }

    fn subscribe_events(inner: &Arc<Inner>) -> Vec<SubscriptionHandle> {
        let bus = &inner.bus;
        let mut handles = Vec::new();

        for name in names::PHASE_EVENTS {
            let weak: Weak<Inner> = Arc::downgrade(inner);
            handles.push(bus.subscribe(name, move |payload| {
                if let (Some(inner), EventPayload::Phase(event)) = (weak.upgrade(), payload) {
                    inner.on_phase(event);
                }
            }));
        }

        let weak = Arc::downgrade(inner);
        handles.push(bus.subscribe(names::LATENCY, move |payload| {
            if let (Some(inner), EventPayload::Latency(sample)) = (weak.upgrade(), payload) {
                inner.on_latency(*sample);
            }
        }));

        for kind in &inner.config.message_kinds {
            let weak = Arc::downgrade(inner);
            let consumer_name = names::consumer(kind);
            handles.push(bus.subscribe(names::inbound(kind), move |payload| {
                if let (Some(inner), EventPayload::Message(event)) = (weak.upgrade(), payload) {
                    inner.on_inbound(&consumer_name, event);
                }
            }));
        }

        tracing::debug!(count = handles.len(), "Session subscribed to transport events");
        handles
    }

    /// Connect to `url`.
    ///
    /// On success the outbound queue is drained before returning.
    ///
    /// # Errors
    /// Rejects if a connection is already active or a disconnect is in
    /// progress (no host call is made). Returns
    /// [`ConnectError::Transport`] if the host fails, leaving the phase at
    /// `Error`, and [`ConnectError::Aborted`] if a disconnect intervened.
    pub async fn connect(&self, url: &str) -> Result<(), ConnectError> {
        let status = {
            let mut state = self.inner.lock_state();
            let transition = state.machine.begin_connect(url).map_err(|rejection| {
                tracing::warn!(%url, %rejection, "Connect rejected");
                ConnectError::from(rejection)
            })?;
            Inner::log_step(Step::Moved(transition), "connect");
            self.inner.commit(&state)
        };
        self.inner.announce(status);

        tracing::info!(%url, "Connecting to controller");
        let result = self
            .inner
            .host
            .connect(url, self.inner.credential.as_deref())
            .await;
        let reason = result.as_ref().err().map(ToString::to_string);

        let (step, status) = {
            let mut state = self.inner.lock_state();
            let step = state
                .machine
                .complete_connect(reason.as_deref().map_or(Ok(()), Err));
            let step = state.settle(step);
            let status = (!step.is_ignored()).then(|| self.inner.commit(&state));
            (step, status)
        };
        Inner::log_step(step, "connect result");

        let Some(status) = status else {
            tracing::info!(%url, "Connect attempt superseded by disconnect");
            return Err(ConnectError::Aborted);
        };
        self.inner.announce(status);

        match reason {
            None => {
                let report = self.inner.drain().await;
                tracing::info!(
                    %url,
                    drained = report.delivered.len(),
                    remaining = report.remaining,
                    "Connected"
                );
                Ok(())
            }
            Some(reason) => {
                tracing::error!(%url, %reason, "Connection failed");
                Err(ConnectError::Transport(reason))
            }
        }
    }

    /// Disconnect. On success the queue and latency window are cleared.
    ///
    /// # Errors
    /// Rejects if already disconnecting. Returns
    /// [`DisconnectError::Transport`] if the host fails, leaving the phase
    /// at `Error`.
    pub async fn disconnect(&self) -> Result<(), DisconnectError> {
        let status = {
            let mut state = self.inner.lock_state();
            let transition = state.machine.begin_disconnect().map_err(|rejection| {
                tracing::warn!(%rejection, "Disconnect rejected");
                DisconnectError::from(rejection)
            })?;
            let step = state.settle(Step::Moved(transition));
            Inner::log_step(step, "disconnect");
            self.inner.commit(&state)
        };
        self.inner.announce(status);

        match self.inner.host.disconnect().await {
            Ok(()) => {
                // Queue held across the phase change; `send` locks in the same order.
                let mut queue = self.inner.queue.lock().await;
                let cleared = queue.len();
                let (step, status) = {
                    let mut state = self.inner.lock_state();
                    let step = state.machine.complete_disconnect(Ok(()));
                    queue.clear();
                    state.reset_latency();
                    state.pending_tasks.clear();
                    (step, self.inner.commit(&state))
                };
                drop(queue);
                Inner::log_step(step, "disconnect result");
                self.inner.announce(status);
                tracing::info!(cleared, "Disconnected");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                let (step, status) = {
                    let mut state = self.inner.lock_state();
                    let step = state.machine.complete_disconnect(Err(&reason));
                    let step = state.settle(step);
                    (step, self.inner.commit(&state))
                };
                Inner::log_step(step, "disconnect result");
                self.inner.announce(status);
                tracing::error!(%reason, "Disconnect failed");
                Err(DisconnectError::Transport(reason))
            }
        }
    }

    /// Send a message, queueing it if it cannot go out now.
    ///
    /// While not connected the message is queued and the host is not
    /// called. While connected, any backlog is drained first so the new
    /// message never overtakes an earlier one.
    ///
    /// # Errors
    /// Returns [`SendError::RetryScheduled`] if the host fails to deliver
    /// and the message has been queued for the next drain, or
    /// [`SendError::Dropped`] if the failure exhausted its retry budget.
    pub async fn send(&self, kind: MessageType, payload: Value) -> Result<SendReceipt, SendError> {
        let message = OutboundMessage::new(kind, payload);
        let id = message.id;
        let mut queue = self.inner.queue.lock().await;

        if !self.inner.phase().is_usable() {
            tracing::debug!(%id, %kind, "Not connected, message queued");
            queue.enqueue(message);
            return Ok(SendReceipt::Queued {
                id,
                reason: QueueReason::NotConnected,
            });
        }

        if !queue.is_empty() {
            self.inner.drain_locked(&mut queue).await;
            if !queue.is_empty() {
                tracing::debug!(%id, %kind, backlog = queue.len(), "Backlog pending, message queued");
                queue.enqueue(message);
                return Ok(SendReceipt::Queued {
                    id,
                    reason: QueueReason::Backlog,
                });
            }
        }

        match self.inner.host.send(&message).await {
            Ok(response) => {
                tracing::debug!(%id, %kind, "Sent message");
                Ok(SendReceipt::Delivered { id, response })
            }
            Err(e) => {
                let reason = e.to_string();
                if queue.requeue_failed(message) {
                    tracing::warn!(%id, %kind, %reason, "Send failed, queued for retry");
                    Err(SendError::RetryScheduled { id, reason })
                } else {
                    tracing::warn!(%id, %kind, %reason, "Send failed, retries exhausted");
                    Err(SendError::Dropped { id, reason })
                }
            }
        }
    }

    /// Run a task on an agent. Requires a live connection; never queued.
    ///
    /// # Errors
    /// Returns [`TaskError::NotConnected`] without calling the host if the
    /// phase is not usable, or [`TaskError::Transport`] if the host fails.
    pub async fn dispatch_task(
        &self,
        agent_id: &str,
        task_type: &str,
        parameters: HashMap<String, Value>,
    ) -> Result<TaskId, TaskError> {
        let phase = self.inner.phase();
        if !phase.is_usable() {
            tracing::warn!(%agent_id, %task_type, %phase, "Task dispatch rejected, not connected");
            return Err(TaskError::NotConnected(phase));
        }

        let request = TaskRequest::new(agent_id, task_type, parameters);
        match self.inner.host.dispatch_task(&request).await {
            Ok(task_id) => {
                tracing::info!(%agent_id, %task_type, %task_id, "Task dispatched");
                self.inner
                    .lock_state()
                    .pending_tasks
                    .insert(task_id.clone(), request);
                Ok(task_id)
            }
            Err(e) => {
                tracing::error!(%agent_id, %task_type, error = %e, "Task dispatch failed");
                Err(TaskError::Transport(e.to_string()))
            }
        }
    }

    /// Ask the host for its own view of the connection.
    ///
    /// # Errors
    /// Returns the host's error if the query fails.
    pub async fn host_status(&self) -> Result<HostStatus, HostError> {
        self.inner.host.query_status().await.inspect_err(|e| {
            tracing::warn!(error = %e, "Host status query failed");
        })
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock_state().status()
    }

    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        self.inner.phase()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase().is_usable()
    }

    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.phase() == ConnectionPhase::Reconnecting
    }

    /// Receiver that observes every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    #[must_use]
    pub fn average_latency_ms(&self) -> u64 {
        self.inner.lock_state().latency.average_ms()
    }

    #[must_use]
    pub fn latency_samples(&self) -> Vec<PingSample> {
        self.inner.lock_state().latency.samples()
    }

    /// Ids of dispatched tasks still waiting for a result.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<TaskId> {
        self.inner
            .lock_state()
            .pending_tasks
            .keys()
            .cloned()
            .collect()
    }

    /// Read-only copy of the outbound queue, oldest first.
    pub async fn queued_messages(&self) -> Vec<OutboundMessage> {
        self.inner.queue.lock().await.snapshot()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.inner.queue.lock().await.stats()
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[derive(Default)]
    struct MockHost {
        connect_calls: AtomicUsize,
        fail_connect: Mutex<Option<String>>,
        fail_sends: AtomicBool,
        send_calls: AtomicUsize,
        fail_disconnect: AtomicBool,
        sent: Mutex<Vec<OutboundMessage>>,
        tasks: Mutex<Vec<TaskRequest>>,
        credential: Mutex<Option<String>>,
        gate: Option<Arc<Notify>>,
        disconnect_gate: Option<Arc<Notify>>,
    }

    impl MockHost {
        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::default()
            }
        }

        fn sent_kinds(&self) -> Vec<MessageType> {
            self.sent.lock().unwrap().iter().map(|m| m.kind).collect()
        }

        fn sent_payloads(&self) -> Vec<Value> {
            self.sent.lock().unwrap().iter().map(|m| m.payload.clone()).collect()
        }
    }

    #[async_trait]
    impl TransportHost for MockHost {
        async fn connect(&self, _url: &str, credential: Option<&str>) -> Result<(), HostError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            *self.credential.lock().unwrap() = credential.map(String::from);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match self.fail_connect.lock().unwrap().take() {
                Some(reason) => Err(HostError::Unavailable(reason)),
                None => Ok(()),
            }
        }

        async fn disconnect(&self) -> Result<(), HostError> {
            if let Some(gate) = &self.disconnect_gate {
                gate.notified().await;
            }
            if self.fail_disconnect.load(Ordering::SeqCst) {
                return Err(HostError::Other("close failed".into()));
            }
            Ok(())
        }

        async fn send(&self, message: &OutboundMessage) -> Result<Option<Value>, HostError> {
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(HostError::Other("write error".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(message
                .kind
                .expects_response()
                .then(|| json!({"ack": message.id.to_string()})))
        }

        async fn dispatch_task(&self, request: &TaskRequest) -> Result<TaskId, HostError> {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(request.clone());
            Ok(format!("task_{}", tasks.len()))
        }

        async fn query_status(&self) -> Result<HostStatus, HostError> {
            Ok(HostStatus {
                connected: true,
                url: Some("ws://host".into()),
                queue_size: 0,
                pending_calls: 0,
            })
        }
    }

    fn session_with(host: &Arc<MockHost>) -> (SessionManager, EventBus) {
        session_with_config(host, SessionConfig::default())
    }

    fn session_with_config(host: &Arc<MockHost>, config: SessionConfig) -> (SessionManager, EventBus) {
        let bus = EventBus::new();
        let dyn_host: Arc<dyn TransportHost> = host.clone();
        let session = SessionManager::new(dyn_host, bus.clone(), config);
        (session, bus)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_send_while_disconnected_queues_without_host_call() {
        let host = Arc::new(MockHost::default());
        let (session, _bus) = session_with(&host);

        let receipt = assert_ok!(session.send(MessageType::Ping, Value::Null).await);
        assert!(matches!(
            receipt,
            SendReceipt::Queued {
                reason: QueueReason::NotConnected,
                ..
            }
        ));
        assert!(host.sent.lock().unwrap().is_empty());
        assert_eq!(session.queued_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_queued_ping_delivered_once_after_connect() {
        let host = Arc::new(MockHost::default());
        let (session, _bus) = session_with(&host);

        let receipt = session.send(MessageType::Ping, Value::Null).await.unwrap();
        assert!(!receipt.is_delivered());

        assert_ok!(session.connect("ws://host").await);
        assert_eq!(session.phase(), ConnectionPhase::Connected);
        assert_eq!(host.sent_kinds(), vec![MessageType::Ping]);
        assert_eq!(host.sent.lock().unwrap()[0].id, receipt.id());
        assert!(session.queued_messages().await.is_empty());

        settle().await;
        assert_eq!(host.sent_kinds(), vec![MessageType::Ping]);
    }

    #[tokio::test]
    async fn test_queued_messages_drain_in_enqueue_order() {
        let host = Arc::new(MockHost::default());
        let (session, _bus) = session_with(&host);

        for n in 1..=3 {
            session.send(MessageType::Notification, json!(n)).await.unwrap();
        }
        session.connect("ws://host").await.unwrap();
        assert_eq!(host.sent_payloads(), vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_connect_while_connecting_is_rejected() {
        let gate = Arc::new(Notify::new());
        let host = Arc::new(MockHost::gated(Arc::clone(&gate)));
        let (session, _bus) = session_with(&host);

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.connect("ws://host").await }
        });
        settle().await;
        assert_eq!(session.phase(), ConnectionPhase::Connecting);

        let second = session.connect("ws://host").await;
        assert_eq!(second, Err(ConnectError::AlreadyActive(ConnectionPhase::Connecting)));
        assert_eq!(host.connect_calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        assert_ok!(first.await.unwrap());
        assert_eq!(session.phase(), ConnectionPhase::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_aborts_attempt() {
        let gate = Arc::new(Notify::new());
        let host = Arc::new(MockHost::gated(Arc::clone(&gate)));
        let (session, bus) = session_with(&host);

        let attempt = tokio::spawn({
            let session = session.clone();
            async move { session.connect("ws://host").await }
        });
        settle().await;

        assert_ok!(session.disconnect().await);
        assert_eq!(session.phase(), ConnectionPhase::Disconnected);

        // A late notification from the abandoned attempt.
        bus.publish(names::CONNECTED, json!({"url": "ws://host"})).unwrap();
        gate.notify_one();

        assert_eq!(attempt.await.unwrap(), Err(ConnectError::Aborted));
        assert_eq!(session.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_moves_to_error_and_recovers() {
        let host = Arc::new(MockHost::default());
        *host.fail_connect.lock().unwrap() = Some("refused".into());
        let (session, _bus) = session_with(&host);

        let err = assert_err!(session.connect("ws://host").await);
        assert!(matches!(err, ConnectError::Transport(ref r) if r.contains("refused")));
        let status = session.status();
        assert_eq!(status.phase, ConnectionPhase::Error);
        assert!(status.last_error.is_some());

        assert_ok!(session.connect("ws://host").await);
        let status = session.status();
        assert_eq!(status.phase, ConnectionPhase::Connected);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test]
    async fn test_failed_send_is_queued_and_retried_in_order() {
        let host = Arc::new(MockHost::default());
        let (session, _bus) = session_with(&host);
        session.connect("ws://host").await.unwrap();

        host.fail_sends.store(true, Ordering::SeqCst);
        let err = assert_err!(session.send(MessageType::Notification, json!(1)).await);
        let SendError::RetryScheduled { id, .. } = err else {
            panic!("expected retry, got {err:?}");
        };
        assert_eq!(session.phase(), ConnectionPhase::Connected);
        let queued = session.queued_messages().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, id);
        assert_eq!(queued[0].attempts, 1);

        host.fail_sends.store(false, Ordering::SeqCst);
        let receipt = session.send(MessageType::Notification, json!(2)).await.unwrap();
        assert!(receipt.is_delivered());
        assert_eq!(host.sent_payloads(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_failed_send_at_retry_bound_is_dropped() {
        let host = Arc::new(MockHost::default());
        let config = SessionConfig {
            max_delivery_attempts: Some(1),
            ..SessionConfig::default()
        };
        let (session, _bus) = session_with_config(&host, config);
        session.connect("ws://host").await.unwrap();

        host.fail_sends.store(true, Ordering::SeqCst);
        let err = assert_err!(session.send(MessageType::Notification, json!(1)).await);
        assert!(matches!(err, SendError::Dropped { .. }));
        assert!(session.queued_messages().await.is_empty());
        assert_eq!(session.queue_stats().await.dropped, 1);

        host.fail_sends.store(false, Ordering::SeqCst);
        let receipt = session.send(MessageType::Notification, json!(2)).await.unwrap();
        assert!(receipt.is_delivered());
        assert_eq!(host.send_calls.load(Ordering::SeqCst), 2);
        assert_eq!(host.sent_payloads(), vec![json!(2)]);
    }

    #[tokio::test]
    async fn test_backlog_that_cannot_clear_keeps_new_message_behind() {
        let host = Arc::new(MockHost::default());
        let (session, _bus) = session_with(&host);
        session.connect("ws://host").await.unwrap();

        host.fail_sends.store(true, Ordering::SeqCst);
        let _ = session.send(MessageType::Notification, json!(1)).await;
        let receipt = session.send(MessageType::Notification, json!(2)).await.unwrap();
        assert!(matches!(
            receipt,
            SendReceipt::Queued {
                reason: QueueReason::Backlog,
                ..
            }
        ));
        let order: Vec<Value> = session
            .queued_messages()
            .await
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(order, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_delivered_send_returns_response() {
        let host = Arc::new(MockHost::default());
        let (session, _bus) = session_with(&host);
        session.connect("ws://host").await.unwrap();

        let receipt = session.send(MessageType::AuthRequest, json!({"token": "t"})).await.unwrap();
        let SendReceipt::Delivered { id, response } = receipt else {
            panic!("expected delivery");
        };
        assert_eq!(response, Some(json!({"ack": id.to_string()})));
    }

    #[tokio::test]
    async fn test_reconnecting_records_attempt_and_clears_latency() {
        let host = Arc::new(MockHost::default());
        let (session, bus) = session_with(&host);
        session.connect("ws://host").await.unwrap();

        bus.publish(names::LATENCY, json!({"latency": 42, "timestamp": 1000})).unwrap();
        assert_eq!(session.latency_samples().len(), 1);
        assert_eq!(session.status().latency_ms, Some(42));
        assert_eq!(session.status().last_ping_at, Some(1000));

        bus.publish(names::RECONNECTING, json!({"attempt": 3, "delay": 15})).unwrap();
        let status = session.status();
        assert_eq!(status.phase, ConnectionPhase::Reconnecting);
        assert_eq!(status.reconnect_attempt, 3);
        assert_eq!(status.latency_ms, None);
        assert!(session.latency_samples().is_empty());
        assert!(session.is_reconnecting());
    }

    #[tokio::test]
    async fn test_latency_ignored_while_disconnected() {
        let host = Arc::new(MockHost::default());
        let (session, bus) = session_with(&host);
        bus.publish(names::LATENCY, json!({"latency": 10})).unwrap();
        assert!(session.latency_samples().is_empty());
        assert_eq!(session.average_latency_ms(), 0);
    }

    #[tokio::test]
    async fn test_host_reconnect_drains_queue() {
        let host = Arc::new(MockHost::default());
        let (session, bus) = session_with(&host);
        session.connect("ws://host").await.unwrap();

        bus.publish(names::RECONNECTING, json!({"attempt": 1})).unwrap();
        session.send(MessageType::Ping, Value::Null).await.unwrap();
        assert!(host.sent.lock().unwrap().is_empty());

        bus.publish(names::CONNECTED, json!({"url": "ws://host"})).unwrap();
        settle().await;
        assert_eq!(host.sent_kinds(), vec![MessageType::Ping]);
        assert_eq!(session.status().reconnect_attempt, 0);
    }

    #[tokio::test]
    async fn test_phase_tracks_last_notification() {
        let host = Arc::new(MockHost::default());
        let (session, bus) = session_with(&host);
        session.connect("ws://host").await.unwrap();

        bus.publish(names::AUTHENTICATED, Value::Null).unwrap();
        assert_eq!(session.phase(), ConnectionPhase::Authenticated);
        bus.publish(names::ERROR, json!({"error": "reset"})).unwrap();
        assert_eq!(session.phase(), ConnectionPhase::Error);
        assert_eq!(session.status().last_error.as_deref(), Some("reset"));
        bus.publish(names::DISCONNECTED, Value::Null).unwrap();
        assert_eq!(session.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_clears_queue_and_latency() {
        let host = Arc::new(MockHost::default());
        let (session, bus) = session_with(&host);
        session.connect("ws://host").await.unwrap();
        bus.publish(names::LATENCY, json!({"latency": 5})).unwrap();
        host.fail_sends.store(true, Ordering::SeqCst);
        let _ = session.send(MessageType::Ping, Value::Null).await;

        assert_ok!(session.disconnect().await);
        assert_eq!(session.phase(), ConnectionPhase::Disconnected);
        assert!(session.queued_messages().await.is_empty());
        assert!(session.latency_samples().is_empty());
    }

    #[tokio::test]
    async fn test_send_during_disconnect_does_not_survive_it() {
        let gate = Arc::new(Notify::new());
        let host = Arc::new(MockHost {
            disconnect_gate: Some(Arc::clone(&gate)),
            ..MockHost::default()
        });
        let (session, _bus) = session_with(&host);
        session.connect("ws://host").await.unwrap();

        let closing = tokio::spawn({
            let session = session.clone();
            async move { session.disconnect().await }
        });
        settle().await;
        assert_eq!(session.phase(), ConnectionPhase::Disconnecting);

        let receipt = session.send(MessageType::Ping, Value::Null).await.unwrap();
        assert!(!receipt.is_delivered());

        gate.notify_one();
        assert_ok!(closing.await.unwrap());
        assert_eq!(session.phase(), ConnectionPhase::Disconnected);
        assert!(session.queued_messages().await.is_empty());
        assert!(host.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_disconnect_reports_error() {
        let host = Arc::new(MockHost::default());
        let (session, _bus) = session_with(&host);
        session.connect("ws://host").await.unwrap();
        host.fail_disconnect.store(true, Ordering::SeqCst);

        let err = assert_err!(session.disconnect().await);
        assert!(matches!(err, DisconnectError::Transport(_)));
        assert_eq!(session.phase(), ConnectionPhase::Error);
    }

    #[tokio::test]
    async fn test_dispatch_task_requires_connection() {
        let host = Arc::new(MockHost::default());
        let (session, _bus) = session_with(&host);

        let err = assert_err!(session.dispatch_task("agent_001", "cmd", HashMap::new()).await);
        assert_eq!(err, TaskError::NotConnected(ConnectionPhase::Disconnected));
        assert!(host.tasks.lock().unwrap().is_empty());
        assert!(session.queued_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_task_result_is_relayed_and_correlated() {
        let host = Arc::new(MockHost::default());
        let (session, bus) = session_with(&host);
        session.connect("ws://host").await.unwrap();

        let params = HashMap::from([("command".to_string(), json!("whoami"))]);
        let task_id = session.dispatch_task("agent_001", "cmd", params).await.unwrap();
        assert_eq!(session.pending_tasks(), vec![task_id.clone()]);

        let relayed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&relayed);
        bus.subscribe(names::consumer("task:result"), move |p| {
            if let EventPayload::Message(event) = p {
                sink.lock().unwrap().push(event.clone());
            }
        });

        bus.publish(
            &names::inbound("task:result"),
            json!({"id": "m1", "type": "task:result", "payload": {"taskId": task_id, "success": true}}),
        )
        .unwrap();

        let relayed = relayed.lock().unwrap();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].data["success"], true);
        assert!(session.pending_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_host_link_loss_abandons_pending_tasks() {
        let host = Arc::new(MockHost::default());
        let (session, bus) = session_with(&host);

        session.connect("ws://host").await.unwrap();
        session.dispatch_task("agent_001", "cmd", HashMap::new()).await.unwrap();
        bus.publish(names::DISCONNECTED, Value::Null).unwrap();
        assert!(session.pending_tasks().is_empty());

        session.connect("ws://host").await.unwrap();
        session.dispatch_task("agent_001", "cmd", HashMap::new()).await.unwrap();
        bus.publish(names::RECONNECTING, json!({"attempt": 1})).unwrap();
        assert_eq!(session.pending_tasks().len(), 1);
        bus.publish(names::RECONNECT_FAILED, json!({"attempts": 10})).unwrap();
        assert_eq!(session.phase(), ConnectionPhase::Error);
        assert!(session.pending_tasks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_status_watch_matches_state_under_concurrent_notifications() {
        for _ in 0..200 {
            let host = Arc::new(MockHost::default());
            let (session, bus) = session_with(&host);
            let rx = session.watch_status();

            let notifier = tokio::spawn(async move {
                for _ in 0..5 {
                    let _ = bus.publish(names::AUTHENTICATED, Value::Null);
                    tokio::task::yield_now().await;
                }
            });
            session.connect("ws://host").await.unwrap();
            notifier.await.unwrap();

            assert_eq!(*rx.borrow(), session.status());
        }
    }

    #[tokio::test]
    async fn test_status_watch_sees_changes() {
        let host = Arc::new(MockHost::default());
        let (session, _bus) = session_with(&host);
        let mut rx = session.watch_status();
        assert_eq!(rx.borrow().phase, ConnectionPhase::Disconnected);

        session.connect("ws://host").await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().phase, ConnectionPhase::Connected);
    }

    #[tokio::test]
    async fn test_credential_is_carried_on_connect() {
        let host = Arc::new(MockHost::default());
        let mut config = ConsoleConfig::default();
        config.connection.credential = Some("opaque".into());
        let dyn_host: Arc<dyn TransportHost> = host.clone();
        let session = SessionManager::from_config(dyn_host, EventBus::new(), &config);

        session.connect("ws://host").await.unwrap();
        assert_eq!(host.credential.lock().unwrap().as_deref(), Some("opaque"));
        assert!(assert_ok!(session.host_status().await).connected);
    }

    #[test]
    fn test_dropping_session_removes_subscriptions() {
        let host: Arc<dyn TransportHost> = Arc::new(MockHost::default());
        let bus = EventBus::new();
        let session = SessionManager::new(host, bus.clone(), SessionConfig::default());
        assert!(bus.is_subscribed(names::CONNECTED));
        assert!(bus.is_subscribed(&names::inbound("notification")));

        let clone = session.clone();
        drop(session);
        assert!(bus.is_subscribed(names::CONNECTED));
        drop(clone);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_notifications_without_runtime_do_not_panic() {
        let host: Arc<dyn TransportHost> = Arc::new(MockHost::default());
        let bus = EventBus::new();
        let session = SessionManager::new(host, bus.clone(), SessionConfig::default());
        bus.publish(names::CONNECTED, Value::Null).unwrap();
        assert!(session.is_connected());
    }
}
