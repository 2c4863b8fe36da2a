//! Bounded inbound-event history with live broadcast.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::message::InboundEvent;

/// Default number of events retained per history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

const LIVE_CHANNEL_CAPACITY: usize = 256;

/// Last `capacity` events of one kind, in arrival order.
///
/// Observers can read a snapshot or follow a stream that yields the
/// retained history and then switches to live events.
pub struct MessageHistory {
    entries: RwLock<VecDeque<InboundEvent>>,
    capacity: usize,
    sender: broadcast::Sender<InboundEvent>,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl std::fmt::Debug for MessageHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHistory")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl MessageHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(32))),
            capacity,
            sender,
        }
    }

    /// Record an event, dropping the oldest beyond capacity.
    pub fn push(&self, event: InboundEvent) {
        let _ = self.sender.send(event.clone()); // live listeners

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Snapshot, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InboundEvent> {
        self.read(|e| e.iter().cloned().collect())
    }

    /// Snapshot, newest first.
    #[must_use]
    pub fn newest_first(&self) -> Vec<InboundEvent> {
        self.read(|e| e.iter().rev().cloned().collect())
    }

    #[must_use]
    pub fn latest(&self) -> Option<InboundEvent> {
        self.read(|e| e.back().cloned())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read(VecDeque::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Receiver for live events only.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.sender.subscribe()
    }

    /// Stream that yields retained history first, then live events.
    ///
    /// Live events a slow reader falls behind on are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, InboundEvent> {
        let rx = self.subscribe();
        let history = self.snapshot();

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }

    fn read<T>(&self, f: impl FnOnce(&VecDeque<InboundEvent>) -> T) -> T {
        f(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }
}
