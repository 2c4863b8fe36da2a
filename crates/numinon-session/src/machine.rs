//! Connection state machine.
//!
//! ```text
//!                 connect()                 host ok / `connected`
//!  Disconnected ───────────► Connecting ─────────────────────────► Connected
//!    ▲   ▲                      │  ▲                                 │    │
//!    │   │        host err /    │  │ `connecting`      `authenticated`│    │
//!    │   │        `error`       ▼  │                                 ▼    │
//!    │   └──────────────────── Error ◄──── `reconnect:failed` ── Authenticated
//!    │                          ▲                                      │
//!    │ host ok / `disconnected` │ `error`      `reconnecting`          │
//!    └──────── Disconnecting ◄──┴──────── disconnect() ◄───────────────┘
//!                                          (from any phase)
//! ```
//!
//! After a local `disconnect()` every phase notification except
//! `disconnected` is ignored until the next local `connect()`, so a late
//! `connected` that lost the race cannot resurrect the session.

use numinon_core::{ConnectionPhase, PhaseEvent};
use thiserror::Error;

/// A phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionPhase,
    pub to: ConnectionPhase,
}

impl Transition {
    /// Whether this transition made the connection usable.
    #[must_use]
    pub const fn entered_usable(&self) -> bool {
        !self.from.is_usable() && self.to.is_usable()
    }

    /// Whether this transition left a usable phase.
    #[must_use]
    pub const fn left_usable(&self) -> bool {
        self.from.is_usable() && !self.to.is_usable()
    }
}

/// Why an input did not change the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// A local disconnect is in effect.
    AfterLocalDisconnect,
    /// The edge is not defined from the current phase.
    InvalidEdge,
}

/// Result of feeding an input to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The phase changed.
    Moved(Transition),
    /// Accepted, phase unchanged (other status fields may have changed).
    Unchanged(ConnectionPhase),
    /// Rejected without mutating anything.
    Ignored(IgnoreReason),
}

impl Step {
    #[must_use]
    pub const fn transition(&self) -> Option<Transition> {
        match self {
            Self::Moved(t) => Some(*t),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }
}

/// A local `connect()` that cannot start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectRejection {
    #[error("Connection already active ({0})")]
    AlreadyActive(ConnectionPhase),
    #[error("Disconnect in progress")]
    DisconnectInProgress,
}

/// A local `disconnect()` that cannot start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DisconnectRejection {
    #[error("Already disconnecting")]
    AlreadyDisconnecting,
}

/// Owns the phase and the fields tied to it.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    phase: ConnectionPhase,
    server_url: Option<String>,
    last_error: Option<String>,
    reconnect_attempt: u32,
    local_disconnect: bool,
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    #[must_use]
    pub fn server_url(&self) -> Option<&str> {
        self.server_url.as_deref()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub const fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    fn move_to(&mut self, to: ConnectionPhase) -> Step {
        let from = self.phase;
        self.phase = to;
        if from == to {
            Step::Unchanged(to)
        } else {
            Step::Moved(Transition { from, to })
        }
    }

    fn enter_connected(&mut self) -> Step {
        self.last_error = None;
        self.reconnect_attempt = 0;
        self.move_to(ConnectionPhase::Connected)
    }

    fn enter_error(&mut self, message: String) -> Step {
        self.last_error = Some(message);
        self.move_to(ConnectionPhase::Error)
    }

    /// Local `connect()`: `Disconnected | Error` → `Connecting`.
    ///
    /// # Errors
    /// Rejects without mutating state from any other phase.
    pub fn begin_connect(&mut self, url: &str) -> Result<Transition, ConnectRejection> {
        match self.phase {
            ConnectionPhase::Disconnected | ConnectionPhase::Error => {}
            ConnectionPhase::Disconnecting => return Err(ConnectRejection::DisconnectInProgress),
            active => return Err(ConnectRejection::AlreadyActive(active)),
        }
        self.local_disconnect = false;
        self.server_url = Some(url.to_string());
        let from = self.phase;
        self.phase = ConnectionPhase::Connecting;
        Ok(Transition {
            from,
            to: ConnectionPhase::Connecting,
        })
    }

    /// Host answered a local connect.
    pub fn complete_connect(&mut self, result: Result<(), &str>) -> Step {
        if self.local_disconnect {
            return Step::Ignored(IgnoreReason::AfterLocalDisconnect);
        }
        match result {
            // `authenticated` may already have arrived; don't step back from it.
            Ok(()) if self.phase.is_usable() => Step::Unchanged(self.phase),
            Ok(()) => self.enter_connected(),
            Err(reason) => self.enter_error(reason.to_string()),
        }
    }

    /// Local `disconnect()`: any phase except `Disconnecting` → `Disconnecting`.
    ///
    /// # Errors
    /// Rejects if a disconnect is already in progress.
    pub fn begin_disconnect(&mut self) -> Result<Transition, DisconnectRejection> {
        if self.phase == ConnectionPhase::Disconnecting {
            return Err(DisconnectRejection::AlreadyDisconnecting);
        }
        self.local_disconnect = true;
        let from = self.phase;
        self.phase = ConnectionPhase::Disconnecting;
        Ok(Transition {
            from,
            to: ConnectionPhase::Disconnecting,
        })
    }

    /// Host answered a local disconnect.
    pub fn complete_disconnect(&mut self, result: Result<(), &str>) -> Step {
        match result {
            Ok(()) => {
                self.reconnect_attempt = 0;
                self.move_to(ConnectionPhase::Disconnected)
            }
            Err(reason) => self.enter_error(reason.to_string()),
        }
    }

    /// Apply a transport notification.
    pub fn apply(&mut self, event: &PhaseEvent) -> Step {
        if self.local_disconnect && !matches!(event, PhaseEvent::Disconnected) {
            return Step::Ignored(IgnoreReason::AfterLocalDisconnect);
        }

        match event {
            PhaseEvent::Connecting { url } => {
                if let Some(url) = url {
                    self.server_url = Some(url.clone());
                }
                self.move_to(ConnectionPhase::Connecting)
            }
            PhaseEvent::Connected { url } => {
                if let Some(url) = url {
                    self.server_url = Some(url.clone());
                }
                self.enter_connected()
            }
            PhaseEvent::Authenticated => {
                if self.phase.is_usable() {
                    self.move_to(ConnectionPhase::Authenticated)
                } else {
                    Step::Ignored(IgnoreReason::InvalidEdge)
                }
            }
            PhaseEvent::Disconnected => {
                self.reconnect_attempt = 0;
                self.move_to(ConnectionPhase::Disconnected)
            }
            PhaseEvent::Reconnecting { attempt } => {
                self.reconnect_attempt = *attempt;
                self.move_to(ConnectionPhase::Reconnecting)
            }
            PhaseEvent::ReconnectFailed { attempts } => {
                self.reconnect_attempt = *attempts;
                self.enter_error(format!("Reconnection failed after {attempts} attempts"))
            }
            PhaseEvent::Error { message } => self.enter_error(message.clone()),
        }
    }
}
