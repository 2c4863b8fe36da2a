//! Connection phase and the status snapshot handed to observers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The single authoritative connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Disconnecting,
    Reconnecting,
    Error,
}

impl ConnectionPhase {
    /// Whether sends may go straight to the transport host.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }

    /// Whether a connect attempt is in flight or already established.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Authenticated | Self::Reconnecting
        )
    }

    /// Whether a local `connect()` is accepted from this phase.
    #[must_use]
    pub const fn accepts_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Disconnecting => "disconnecting",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only connection status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    pub server_url: Option<String>,
    /// Time of the last latency sample (ms since epoch).
    pub last_ping_at: Option<i64>,
    /// Only set while the phase is usable.
    pub latency_ms: Option<u64>,
    pub last_error: Option<String>,
    /// Attempt number reported by the last `reconnecting` notification.
    pub reconnect_attempt: u32,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.phase.is_usable()
    }

    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.phase == ConnectionPhase::Reconnecting
    }
}
