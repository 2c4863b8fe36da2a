//! In-process transport host.
//!
//! Stands in for the real socket owner: answers requests immediately and
//! pushes notifications through a [`NotificationSender`]. Faults and link
//! drops are scripted by the caller.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use numinon_core::{
    HostError, HostStatus, MessageType, OutboundMessage, ReconnectPolicy, TaskId, TaskRequest,
    TransportHost, WireMessage,
};
use serde_json::{Value, json};

use crate::{protocol::Notification, pump::NotificationSender};

#[derive(Debug, Default)]
struct LoopbackState {
    url: Option<String>,
    connected: bool,
    fail_next_connect: Option<String>,
    failing_sends: usize,
    sent: Vec<OutboundMessage>,
    pending: Vec<(TaskId, TaskRequest)>,
    next_task: u64,
}

/// Scriptable transport host.
#[derive(Debug)]
pub struct LoopbackHost {
    notifications: NotificationSender,
    policy: ReconnectPolicy,
    state: Mutex<LoopbackState>,
}

impl LoopbackHost {
    #[must_use]
    pub fn new(notifications: NotificationSender, policy: ReconnectPolicy) -> Self {
        Self {
            notifications,
            policy,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            tracing::debug!("Notification pump closed, dropping notification");
        }
    }

    /// Make the next `connect` fail with `reason`.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.lock().fail_next_connect = Some(reason.into());
    }

    /// Make the next `count` sends fail.
    pub fn fail_sends(&self, count: usize) {
        self.lock().failing_sends = count;
    }

    /// Lose the link and announce reconnect `attempt`.
    ///
    /// Once the policy's attempts are exhausted, announces
    /// `ws:reconnect:failed` instead.
    pub fn drop_link(&self, attempt: u32) {
        self.lock().connected = false;
        match self.policy.delay_for(attempt) {
            Some(delay) => {
                tracing::info!(attempt, delay_secs = delay.as_secs(), "Loopback link dropped");
                self.emit(Notification::reconnecting(attempt, delay.as_secs()));
            }
            None => {
                tracing::warn!(attempt, "Loopback reconnect attempts exhausted");
                self.emit(Notification::reconnect_failed(self.policy.max_attempts));
            }
        }
    }

    /// Bring a dropped link back.
    pub fn restore_link(&self) {
        let url = {
            let mut state = self.lock();
            state.connected = true;
            state.url.clone().unwrap_or_default()
        };
        self.emit(Notification::connected(&url));
    }

    /// Push a server message of `kind`.
    pub fn push_inbound(&self, kind: MessageType, payload: Value) {
        let wire = WireMessage {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.as_str().to_string(),
            timestamp: None,
            payload,
        };
        self.emit(Notification::message(&wire));
    }

    /// Complete a dispatched task, pushing its `task:result`.
    ///
    /// Returns false if `task_id` is not pending.
    pub fn complete_task(&self, task_id: &str, output: Value) -> bool {
        let found = {
            let mut state = self.lock();
            let before = state.pending.len();
            state.pending.retain(|(id, _)| id != task_id);
            state.pending.len() != before
        };
        if found {
            self.push_inbound(
                MessageType::TaskResult,
                json!({"taskId": task_id, "success": true, "output": output}),
            );
        }
        found
    }

    pub fn report_latency(&self, latency_ms: u64) {
        self.emit(Notification::latency(latency_ms));
    }

    /// Messages delivered so far, in delivery order.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.lock().sent.clone()
    }

    /// Tasks dispatched and not yet completed.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<(TaskId, TaskRequest)> {
        self.lock().pending.clone()
    }
}

#[async_trait]
impl TransportHost for LoopbackHost {
    async fn connect(&self, url: &str, credential: Option<&str>) -> Result<(), HostError> {
        let failure = {
            let mut state = self.lock();
            state.url = Some(url.to_string());
            let failure = state.fail_next_connect.take();
            state.connected = failure.is_none();
            failure
        };

        if let Some(reason) = failure {
            self.emit(Notification::error(&reason));
            return Err(HostError::Unavailable(reason));
        }

        self.emit(Notification::connected(url));
        if credential.is_some() {
            self.emit(Notification::authenticated());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), HostError> {
        {
            let mut state = self.lock();
            state.connected = false;
            state.pending.clear();
        }
        self.emit(Notification::disconnected());
        Ok(())
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Option<Value>, HostError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(HostError::NotConnected);
        }
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(HostError::Other("simulated write failure".into()));
        }
        state.sent.push(message.clone());

        let response = match message.kind {
            MessageType::AuthRequest => Some(json!({"success": true})),
            MessageType::TaskExecute => Some(json!({"accepted": true, "id": message.id})),
            _ => None,
        };
        Ok(response)
    }

    async fn dispatch_task(&self, request: &TaskRequest) -> Result<TaskId, HostError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(HostError::NotConnected);
        }
        state.next_task += 1;
        let task_id = format!("task_{:04}", state.next_task);
        state.pending.push((task_id.clone(), request.clone()));
        Ok(task_id)
    }

    async fn query_status(&self) -> Result<HostStatus, HostError> {
        let state = self.lock();
        Ok(HostStatus {
            connected: state.connected,
            url: state.url.clone(),
            queue_size: 0,
            pending_calls: state.pending.len(),
        })
    }
}
