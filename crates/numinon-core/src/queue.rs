//! Bounded FIFO of outbound messages awaiting delivery.

use std::{collections::VecDeque, fmt::Display, future::Future};

use crate::message::{MessageId, OutboundMessage};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Result of a [`MessageQueue::drain_in_order`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages delivered and removed, in order.
    pub delivered: Vec<MessageId>,
    /// The message that stopped the pass, if any.
    pub failure: Option<DrainFailure>,
    /// Messages still queued afterwards.
    pub remaining: usize,
}

impl DrainReport {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// The first failed delivery of a drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainFailure {
    pub id: MessageId,
    pub reason: String,
    /// Set when the failure exhausted the message's retry budget.
    pub dropped: bool,
}

/// Overflow and retry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    /// Messages evicted because the queue was full.
    pub evicted: u64,
    /// Messages dropped after too many failed attempts.
    pub dropped: u64,
}

/// Bounded FIFO with oldest-first eviction.
///
/// Drains stop at the first failure so that commands which depend on an
/// earlier one are never delivered ahead of it.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    items: VecDeque<OutboundMessage>,
    capacity: usize,
    max_attempts: Option<u32>,
    evicted: u64,
    dropped: u64,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, None)
    }
}

impl MessageQueue {
    /// Create a queue. `max_attempts` of `None` retries forever.
    #[must_use]
    pub fn new(capacity: usize, max_attempts: Option<u32>) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            max_attempts,
            evicted: 0,
            dropped: 0,
        }
    }

    /// Append a message. Returns the evicted oldest message if the queue was full.
    pub fn enqueue(&mut self, message: OutboundMessage) -> Option<OutboundMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            tracing::warn!(id = %old.id, kind = %old.kind, "Message queue full, evicted oldest entry");
        }
        self.items.push_back(message);
        evicted
    }

    /// Queue a message whose immediate delivery just failed.
    ///
    /// Bumps its attempt count. Returns false, dropping the message, if that
    /// exhausts the retry budget.
    pub fn requeue_failed(&mut self, mut message: OutboundMessage) -> bool {
        message.attempts = message.attempts.saturating_add(1);
        if self.exhausted(message.attempts) {
            tracing::warn!(id = %message.id, attempts = message.attempts, "Dropping message after exhausting retries");
            self.dropped += 1;
            return false;
        }
        self.enqueue(message);
        true
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Deliver queued messages oldest-first until one fails.
    ///
    /// Delivered messages are removed before the next is attempted. The
    /// failing message stays at the head with its attempt count bumped,
    /// unless that exhausts the retry budget, in which case it is dropped.
    pub async fn drain_in_order<F, Fut, E>(&mut self, mut sender: F) -> DrainReport
    where
        F: FnMut(OutboundMessage) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut report = DrainReport::default();

        while let Some(head) = self.items.front() {
            let id = head.id;
            match sender(head.clone()).await {
                Ok(()) => {
                    self.items.pop_front();
                    report.delivered.push(id);
                }
                Err(e) => {
                    let dropped = self.record_failure();
                    report.failure = Some(DrainFailure {
                        id,
                        reason: e.to_string(),
                        dropped,
                    });
                    break;
                }
            }
        }

        report.remaining = self.items.len();
        report
    }

    fn record_failure(&mut self) -> bool {
        let Some(head) = self.items.front_mut() else {
            return false;
        };
        head.attempts = head.attempts.saturating_add(1);
        let attempts = head.attempts;
        let exhausted = self.exhausted(attempts);
        if exhausted {
            if let Some(msg) = self.items.pop_front() {
                tracing::warn!(id = %msg.id, attempts = msg.attempts, "Dropping message after exhausting retries");
            }
            self.dropped += 1;
        }
        exhausted
    }

    /// Read-only copy, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<OutboundMessage> {
        self.items.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.items.len(),
            capacity: self.capacity,
            evicted: self.evicted,
            dropped: self.dropped,
        }
    }
}
