use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Room-level connection status as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    /// Hosting and waiting for guests, or dialing the host.
    Connecting,
    Connected,
    Reconnecting { attempt: u32, max_attempts: u32 },
    Error { message: String },
    /// The host closed the room.
    Dissolved,
}

impl ConnectionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected
                | ConnectionStatus::Error { .. }
                | ConnectionStatus::Dissolved
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Reconnecting {
                attempt,
                max_attempts,
            } => write!(f, "reconnecting ({attempt}/{max_attempts})"),
            ConnectionStatus::Error { message } => write!(f, "error: {message}"),
            ConnectionStatus::Dissolved => write!(f, "room dissolved"),
        }
    }
}

/// Membership of the room this node is in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoomState {
    pub code: Option<String>,
    pub is_host: bool,
    /// Rendezvous endpoint of the host; `None` when hosting.
    pub host_endpoint: Option<String>,
    pub peers: BTreeSet<String>,
    pub dissolved: bool,
}

impl RoomState {
    pub fn hosting(code: String) -> Self {
        Self {
            code: Some(code),
            is_host: true,
            ..Self::default()
        }
    }

    pub fn guest(code: Option<String>, host_endpoint: String) -> Self {
        Self {
            code,
            host_endpoint: Some(host_endpoint),
            ..Self::default()
        }
    }

    /// Mark the room as closed by its host. Membership is dropped; the code
    /// and host endpoint stay so the closed room can still be shown.
    pub fn dissolve(&mut self) {
        self.dissolved = true;
        self.peers.clear();
    }

    /// False once the host dissolved the room.
    pub fn is_active(&self) -> bool {
        !self.dissolved
    }
}
