//! Serialized delivery of host notifications onto the event bus.
//!
//! The transport host may emit from any task or thread; every notification
//! goes through one channel and is published by a single consumer, so bus
//! handlers never observe two notifications at once and see them in emit
//! order.

use futures::{Stream, StreamExt};
use numinon_core::{Delivery, EventBus};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::protocol::Notification;

/// Producer side handed to the transport host.
pub type NotificationSender = mpsc::UnboundedSender<Notification>;

/// Single consumer that publishes notifications in arrival order.
pub struct NotificationPump {
    bus: EventBus,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl std::fmt::Debug for NotificationPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationPump").finish_non_exhaustive()
    }
}

impl NotificationPump {
    #[must_use]
    pub fn new(bus: EventBus) -> (NotificationSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { bus, rx })
    }

    fn dispatch(&self, notification: Notification) {
        let Notification { name, data } = notification;
        match self.bus.publish(&name, data) {
            Ok(Delivery::Delivered) => tracing::debug!(%name, "Notification delivered"),
            Ok(Delivery::NoSubscriber) => tracing::debug!(%name, "No subscriber for notification"),
            Err(e) => tracing::warn!(%name, error = %e, "Dropped malformed notification"),
        }
    }

    /// Publish until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(notification) = self.rx.recv().await {
            self.dispatch(notification);
        }
        tracing::info!("Notification channel closed");
    }

    /// Run on a background task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Publish whatever is already queued, without waiting. Returns the count.
    pub fn flush(&mut self) -> usize {
        let mut count = 0;
        while let Ok(notification) = self.rx.try_recv() {
            self.dispatch(notification);
            count += 1;
        }
        count
    }
}

/// Feed an external notification stream into the pump.
///
/// Ends when the stream ends or the pump has gone away.
pub fn spawn_forwarder<S>(sender: NotificationSender, stream: S) -> JoinHandle<()>
where
    S: Stream<Item = Notification> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::pin!(stream);

        while let Some(notification) = stream.next().await {
            if sender.send(notification).is_err() {
                tracing::debug!("Notification pump gone, forwarder stopping");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use numinon_core::{EventPayload, PhaseEvent, names};
    use serde_json::json;

    use super::*;

    fn recorder(bus: &EventBus, name: &str) -> Arc<Mutex<Vec<EventPayload>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(name, move |p| sink.lock().unwrap().push(p.clone()));
        seen
    }

    #[test]
    fn test_flush_publishes_in_emit_order() {
        let bus = EventBus::new();
        let seen = recorder(&bus, names::RECONNECTING);
        let (tx, mut pump) = NotificationPump::new(bus);

        for attempt in 1..=3 {
            tx.send(Notification::reconnecting(attempt, 5)).unwrap();
        }
        assert_eq!(pump.flush(), 3);

        let attempts: Vec<u32> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| match p {
                EventPayload::Phase(PhaseEvent::Reconnecting { attempt }) => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(pump.flush(), 0);
    }

    #[test]
    fn test_malformed_notification_is_dropped() {
        let bus = EventBus::new();
        let seen = recorder(&bus, names::RECONNECTING);
        let (tx, mut pump) = NotificationPump::new(bus);

        tx.send(Notification::new(names::RECONNECTING, json!({"attempt": "x"})))
            .unwrap();
        tx.send(Notification::reconnecting(1, 5)).unwrap();
        assert_eq!(pump.flush(), 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_ends_when_senders_drop() {
        let bus = EventBus::new();
        let seen = recorder(&bus, names::DISCONNECTED);
        let (tx, pump) = NotificationPump::new(bus);
        let handle = pump.spawn();

        tx.send(Notification::disconnected()).unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forwarder_feeds_pump() {
        let bus = EventBus::new();
        let seen = recorder(&bus, names::LATENCY);
        let (tx, mut pump) = NotificationPump::new(bus);

        let stream = futures::stream::iter([Notification::latency(5), Notification::latency(7)]);
        spawn_forwarder(tx, stream).await.unwrap();

        assert_eq!(pump.flush(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
