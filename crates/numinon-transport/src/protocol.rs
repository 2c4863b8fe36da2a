//! Notifications pushed from the transport host to the console.

use numinon_core::{WireMessage, message::now_millis, names};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A named notification with a JSON body, as emitted by the transport host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl Notification {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    #[must_use]
    pub fn connecting(url: &str) -> Self {
        Self::new(names::CONNECTING, json!({"url": url, "timestamp": now_millis()}))
    }

    #[must_use]
    pub fn connected(url: &str) -> Self {
        Self::new(names::CONNECTED, json!({"url": url, "timestamp": now_millis()}))
    }

    #[must_use]
    pub fn authenticated() -> Self {
        Self::new(names::AUTHENTICATED, json!({"timestamp": now_millis()}))
    }

    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(names::DISCONNECTED, json!({"timestamp": now_millis()}))
    }

    /// `delay_secs` is informational; the session only reads `attempt`.
    #[must_use]
    pub fn reconnecting(attempt: u32, delay_secs: u64) -> Self {
        Self::new(
            names::RECONNECTING,
            json!({"attempt": attempt, "delay": delay_secs}),
        )
    }

    #[must_use]
    pub fn reconnect_failed(attempts: u32) -> Self {
        Self::new(names::RECONNECT_FAILED, json!({"attempts": attempts}))
    }

    #[must_use]
    pub fn error(message: &str) -> Self {
        Self::new(names::ERROR, json!({"error": message, "timestamp": now_millis()}))
    }

    #[must_use]
    pub fn latency(latency_ms: u64) -> Self {
        Self::new(
            names::LATENCY,
            json!({"latency": latency_ms, "timestamp": now_millis()}),
        )
    }

    /// Inbound server message, published under `ws:message:<type>`.
    #[must_use]
    pub fn message(wire: &WireMessage) -> Self {
        Self::new(names::inbound(&wire.kind), json!(wire))
    }
}

#[cfg(test)]
mod tests {
    use numinon_core::{EventPayload, PhaseEvent};

    use super::*;

    #[test]
    fn test_constructors_decode_to_expected_payloads() {
        let n = Notification::reconnecting(2, 10);
        assert_eq!(
            EventPayload::decode(&n.name, n.data).unwrap(),
            EventPayload::Phase(PhaseEvent::Reconnecting { attempt: 2 })
        );

        let n = Notification::error("refused");
        assert_eq!(
            EventPayload::decode(&n.name, n.data).unwrap(),
            EventPayload::Phase(PhaseEvent::Error {
                message: "refused".into()
            })
        );

        let n = Notification::latency(33);
        let EventPayload::Latency(sample) = EventPayload::decode(&n.name, n.data).unwrap() else {
            panic!("expected latency");
        };
        assert_eq!(sample.latency_ms, 33);
    }

    #[test]
    fn test_message_notification_uses_inbound_name() {
        let wire = WireMessage {
            id: "m1".into(),
            kind: "agent:update".into(),
            timestamp: None,
            payload: json!({"agentId": "a1"}),
        };
        let n = Notification::message(&wire);
        assert_eq!(n.name, "ws:message:agent:update");

        let EventPayload::Message(event) = EventPayload::decode(&n.name, n.data).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(event.name, "agent:update");
        assert_eq!(event.data["agentId"], "a1");
    }

    #[test]
    fn test_notification_serializes_as_name_and_data() {
        let n = Notification::reconnect_failed(10);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["name"], names::RECONNECT_FAILED);
        assert_eq!(json["data"]["attempts"], 10);
    }
}
