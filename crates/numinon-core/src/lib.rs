//! Core building blocks for the operator console session layer.
//!
//! This crate provides:
//! - `EventBus` - Name-keyed publish/subscribe with typed payloads
//! - `MessageQueue` - Bounded FIFO of outbound messages with ordered drain
//! - `MessageHistory` - Bounded inbound history with live streaming
//! - `LatencyWindow` - Rolling ping samples
//! - `TransportHost` - The capability consumed from the transport host
//! - `ConsoleConfig` - Configuration

pub mod bus;
pub mod config;
pub mod event;
pub mod history;
pub mod latency;
pub mod message;
pub mod phase;
pub mod queue;
pub mod traits;

pub use bus::{Delivery, EventBus, SubscriptionHandle};
pub use config::{ConsoleConfig, ReconnectPolicy, SessionConfig};
pub use event::{BusError, EventPayload, PhaseEvent, names};
pub use history::MessageHistory;
pub use latency::{LatencyWindow, PingSample};
pub use message::{InboundEvent, MessageId, MessageType, OutboundMessage, WireMessage};
pub use phase::{ConnectionPhase, ConnectionStatus};
pub use queue::{DrainReport, MessageQueue, QueueStats};
pub use traits::{HostError, HostStatus, TaskId, TaskRequest, TransportHost};
