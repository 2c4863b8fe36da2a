//! Single-process publish/subscribe registry keyed by event name.
//!
//! # Duplicate subscriptions
//!
//! Each name has at most one handler. Subscribing a name that already has a
//! handler **replaces** it; the replacement is logged at `warn` and the
//! displaced handle becomes inert (unsubscribing it will not remove the new
//! handler). There is no fan-out: a published event reaches exactly the
//! handler registered at the moment of dispatch.
//!
//! # Dispatch
//!
//! `publish` runs the handler synchronously on the caller's task. The
//! registry lock is released before the handler runs, so handlers may
//! publish or subscribe themselves. Ordering across publishers is the
//! caller's concern; the notification pump delivers host events one at a
//! time.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde_json::Value;

use crate::event::{BusError, EventPayload};

/// Event handler.
pub type Handler = Arc<dyn Fn(&EventPayload) + Send + Sync>;

/// Identifies one registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    name: String,
    id: u64,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Nobody was subscribed; the event was discarded.
    NoSubscriber,
}

struct Registered {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Registered>,
}

/// Cloneable handle to a shared registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.len())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for `name`, replacing any existing handler.
    pub fn subscribe<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        let name = name.into();
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;

        let previous = registry.handlers.insert(
            name.clone(),
            Registered {
                id,
                handler: Arc::new(handler),
            },
        );
        drop(registry);

        if let Some(previous) = previous {
            tracing::warn!(
                event = %name,
                replaced = previous.id,
                "Duplicate subscription replaced existing handler"
            );
        }

        SubscriptionHandle { name, id }
    }

    /// Remove a registration. Unknown or replaced handles are a no-op.
    ///
    /// Returns whether a handler was removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut registry = self.registry();
        let current = registry.handlers.get(&handle.name).map(|r| r.id);
        if current == Some(handle.id) {
            registry.handlers.remove(&handle.name);
            true
        } else {
            false
        }
    }

    /// Decode `data` against the registered shape for `name` and dispatch it.
    ///
    /// # Errors
    /// Returns [`BusError`] if `name` is a known event and `data` does not
    /// match its shape. Nothing is dispatched in that case.
    pub fn publish(&self, name: &str, data: Value) -> Result<Delivery, BusError> {
        let payload = EventPayload::decode(name, data)?;
        Ok(self.publish_payload(name, &payload))
    }

    /// Dispatch an already-decoded payload.
    pub fn publish_payload(&self, name: &str, payload: &EventPayload) -> Delivery {
        let handler = self
            .registry()
            .handlers
            .get(name)
            .map(|r| Arc::clone(&r.handler));

        match handler {
            Some(handler) => {
                handler(payload);
                Delivery::Delivered
            }
            None => {
                tracing::trace!(event = %name, "No subscriber");
                Delivery::NoSubscriber
            }
        }
    }

    #[must_use]
    pub fn is_subscribed(&self, name: &str) -> bool {
        self.registry().handlers.contains_key(name)
    }

    /// Number of registered names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry().handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
