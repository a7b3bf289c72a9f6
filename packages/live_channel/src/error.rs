//! Error types for the channel client.
//!
//! None of these escape the public runtime methods of [`ChannelClient`](crate::ChannelClient):
//! connection failures drive the reconnect path and decode failures are logged
//! and dropped. They surface at construction and configuration time, and at
//! the [`Connector`](crate::transport::Connector) seam.

use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid target url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,

    #[error("no tokio runtime is running")]
    NoRuntime,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChannelError {
    pub fn invalid_url(url: &str, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for failures that happened before any socket existed.
    pub fn is_construction_failure(&self) -> bool {
        matches!(self, Self::InvalidUrl { .. })
    }
}

impl From<tungstenite::Error> for ChannelError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            tungstenite::Error::Url(e) => Self::InvalidUrl {
                url: String::new(),
                reason: e.to_string(),
            },
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<figment::Error> for ChannelError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Reasons an incoming frame is rejected before dispatch.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no event field")]
    MissingEvent,

    #[error("event field must be a string")]
    EventNotString,

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[source] serde_json::Error),
}
