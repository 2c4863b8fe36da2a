//! Connection lifecycle for the operator console.
//!
//! Provides:
//! - `StateMachine` - Legal connection-phase transitions
//! - `SessionManager` - Owns the phase, queue and latency window

pub mod machine;
pub mod manager;

pub use machine::{ConnectRejection, DisconnectRejection, IgnoreReason, StateMachine, Step, Transition};
pub use manager::{
    ConnectError, DisconnectError, QueueReason, SendError, SendReceipt, SessionManager, TaskError,
};
