//! Event names and the payload shape registered for each.
//!
//! Transport-host notifications arrive as a name plus a JSON body. Known
//! names are decoded into [`EventPayload`] variants at the bus boundary so
//! downstream handlers never inspect raw JSON for phase or latency data.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
    ConnectionStatus,
    latency::PingSample,
    message::{InboundEvent, WireMessage, now_millis},
};

/// Event names pushed by the transport host and used by consumers.
pub mod names {
    pub const CONNECTING: &str = "ws:connecting";
    pub const CONNECTED: &str = "ws:connected";
    pub const AUTHENTICATED: &str = "ws:authenticated";
    pub const DISCONNECTED: &str = "ws:disconnected";
    pub const RECONNECTING: &str = "ws:reconnecting";
    pub const RECONNECT_FAILED: &str = "ws:reconnect:failed";
    pub const ERROR: &str = "ws:error";
    pub const LATENCY: &str = "ws:latency";
    /// Status snapshots republished by the session.
    pub const STATUS: &str = "session:status";

    /// Every connection-phase notification name.
    pub const PHASE_EVENTS: [&str; 7] = [
        CONNECTING,
        CONNECTED,
        AUTHENTICATED,
        DISCONNECTED,
        RECONNECTING,
        RECONNECT_FAILED,
        ERROR,
    ];

    const INBOUND_PREFIX: &str = "ws:message:";
    const CONSUMER_PREFIX: &str = "message:";

    /// Name under which the host pushes inbound messages of `kind`.
    #[must_use]
    pub fn inbound(kind: &str) -> String {
        format!("{INBOUND_PREFIX}{kind}")
    }

    /// Consumer-facing name for inbound messages of `kind`.
    #[must_use]
    pub fn consumer(kind: &str) -> String {
        format!("{CONSUMER_PREFIX}{kind}")
    }

    #[must_use]
    pub fn inbound_kind(name: &str) -> Option<&str> {
        name.strip_prefix(INBOUND_PREFIX)
    }

    #[must_use]
    pub fn consumer_kind(name: &str) -> Option<&str> {
        name.strip_prefix(CONSUMER_PREFIX)
    }
}

/// A connection-phase notification from the transport host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    Connecting { url: Option<String> },
    Connected { url: Option<String> },
    Authenticated,
    Disconnected,
    Reconnecting { attempt: u32 },
    ReconnectFailed { attempts: u32 },
    Error { message: String },
}

impl PhaseEvent {
    /// Notification name for this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connecting { .. } => names::CONNECTING,
            Self::Connected { .. } => names::CONNECTED,
            Self::Authenticated => names::AUTHENTICATED,
            Self::Disconnected => names::DISCONNECTED,
            Self::Reconnecting { .. } => names::RECONNECTING,
            Self::ReconnectFailed { .. } => names::RECONNECT_FAILED,
            Self::Error { .. } => names::ERROR,
        }
    }
}

/// Decoded event data, keyed by the event name it was published under.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Phase(PhaseEvent),
    Latency(PingSample),
    Message(InboundEvent),
    Status(ConnectionStatus),
    /// Any name without a registered shape.
    Custom(Value),
}

/// Raised when a known event name carries a body of the wrong shape.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid payload for {name}: {source}")]
    InvalidPayload {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize, Default)]
struct UrlBody {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct ReconnectingBody {
    attempt: u32,
}

#[derive(Deserialize)]
struct ReconnectFailedBody {
    attempts: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "message")]
    error: String,
}

#[derive(Deserialize)]
struct LatencyBody {
    latency: u64,
    #[serde(default)]
    timestamp: Option<i64>,
}

impl EventPayload {
    /// Decode `data` according to the shape registered for `name`.
    ///
    /// # Errors
    /// Returns [`BusError::InvalidPayload`] if `name` is known and `data`
    /// does not match its shape.
    pub fn decode(name: &str, data: Value) -> Result<Self, BusError> {
        let invalid = |source| BusError::InvalidPayload {
            name: name.to_string(),
            source,
        };

        let payload = match name {
            names::CONNECTING => {
                let body = parse_or_default::<UrlBody>(data).map_err(invalid)?;
                Self::Phase(PhaseEvent::Connecting { url: body.url })
            }
            names::CONNECTED => {
                let body = parse_or_default::<UrlBody>(data).map_err(invalid)?;
                Self::Phase(PhaseEvent::Connected { url: body.url })
            }
            names::AUTHENTICATED => Self::Phase(PhaseEvent::Authenticated),
            names::DISCONNECTED => Self::Phase(PhaseEvent::Disconnected),
            names::RECONNECTING => {
                let body: ReconnectingBody = serde_json::from_value(data).map_err(invalid)?;
                Self::Phase(PhaseEvent::Reconnecting {
                    attempt: body.attempt,
                })
            }
            names::RECONNECT_FAILED => {
                let body: ReconnectFailedBody = serde_json::from_value(data).map_err(invalid)?;
                Self::Phase(PhaseEvent::ReconnectFailed {
                    attempts: body.attempts,
                })
            }
            names::ERROR => {
                // Hosts send either `{"error": ...}` or a bare string.
                let message = match data {
                    Value::String(s) => s,
                    other => serde_json::from_value::<ErrorBody>(other)
                        .map_err(invalid)?
                        .error,
                };
                Self::Phase(PhaseEvent::Error { message })
            }
            names::LATENCY => {
                let body: LatencyBody = serde_json::from_value(data).map_err(invalid)?;
                Self::Latency(PingSample {
                    timestamp: body.timestamp.unwrap_or_else(now_millis),
                    latency_ms: body.latency,
                })
            }
            names::STATUS => Self::Status(serde_json::from_value(data).map_err(invalid)?),
            _ => {
                if let Some(kind) = names::inbound_kind(name).or_else(|| names::consumer_kind(name)) {
                    Self::Message(decode_message(kind, data).map_err(invalid)?)
                } else {
                    Self::Custom(data)
                }
            }
        };

        Ok(payload)
    }
}

fn parse_or_default<T>(data: Value) -> Result<T, serde_json::Error>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if data.is_null() {
        Ok(T::default())
    } else {
        serde_json::from_value(data)
    }
}

/// Inbound messages normally arrive as a full envelope; a bare body is
/// accepted and attributed to the kind named by the event.
fn decode_message(kind: &str, data: Value) -> Result<InboundEvent, serde_json::Error> {
    let is_envelope = data
        .as_object()
        .is_some_and(|o| o.get("type").is_some_and(Value::is_string));

    if is_envelope {
        let wire: WireMessage = serde_json::from_value(data)?;
        Ok(InboundEvent::from(wire))
    } else {
        Ok(InboundEvent {
            name: kind.to_string(),
            data,
        })
    }
}
