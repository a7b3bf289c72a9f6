use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a channel connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// A socket is being opened.
    Connecting,
    /// The socket is open and frames flow both ways.
    Connected,
    /// No socket and no pending attempt. Initial and terminal state.
    #[default]
    Disconnected,
    /// Waiting on the backoff timer before the next attempt.
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
