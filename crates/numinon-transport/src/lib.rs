//! Transport-facing plumbing for the operator console.
//!
//! Provides:
//! - Notification shape and constructors
//! - `NotificationPump` - Serialized delivery onto the event bus
//! - `LoopbackHost` - In-process transport host
//! - `PresentationAdapter` - Read/observe layer for UI consumers

pub mod loopback;
pub mod presentation;
pub mod protocol;
pub mod pump;

pub use loopback::LoopbackHost;
pub use presentation::{PresentationAdapter, RequestError};
pub use protocol::Notification;
pub use pump::{NotificationPump, NotificationSender, spawn_forwarder};
