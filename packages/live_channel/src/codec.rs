//! Wire format for the event channel.
//!
//! Every frame is a JSON text frame shaped as
//! `{ "event": "<string>", "data": <any>, "timestamp"?: "<ISO-8601>" }`.
//! Nothing outside this module knows that shape.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// Client heartbeat probe.
pub const EVENT_PING: &str = "ping";
/// Server job-progress update.
pub const EVENT_PROGRESS: &str = "progress";
/// Server terminal success for a job.
pub const EVENT_COMPLETED: &str = "completed";
/// Server terminal failure for a job.
pub const EVENT_ERROR: &str = "error";

/// The unit exchanged over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    /// Build an outgoing envelope stamped with the current time.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }

    /// The heartbeat probe: `ping` with `{ts: <epoch-ms>}`.
    pub fn ping() -> Self {
        Self::new(
            EVENT_PING,
            serde_json::json!({ "ts": Utc::now().timestamp_millis() }),
        )
    }

    /// Typed view over the known event names.
    pub fn kind(&self) -> ChannelEvent {
        ChannelEvent::from_envelope(self)
    }
}

/// Known events plus a catch-all for everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Ping { ts: Option<i64> },
    Progress(Value),
    Completed(Value),
    Error { message: Option<String>, data: Value },
    Other { event: String, data: Value },
}

impl ChannelEvent {
    fn from_envelope(envelope: &Envelope) -> Self {
        let data = envelope.data.clone();
        match envelope.event.as_str() {
            EVENT_PING => Self::Ping {
                ts: data.get("ts").and_then(Value::as_i64),
            },
            EVENT_PROGRESS => Self::Progress(data),
            EVENT_COMPLETED => Self::Completed(data),
            EVENT_ERROR => Self::Error {
                message: data
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                data,
            },
            other => Self::Other {
                event: other.to_string(),
                data,
            },
        }
    }

    pub fn event_name(&self) -> &str {
        match self {
            Self::Ping { .. } => EVENT_PING,
            Self::Progress(_) => EVENT_PROGRESS,
            Self::Completed(_) => EVENT_COMPLETED,
            Self::Error { .. } => EVENT_ERROR,
            Self::Other { event, .. } => event,
        }
    }
}

/// Serialize an envelope into a text frame payload.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(CodecError::Serialize)
}

/// Stamp and serialize an outgoing call in one step.
pub fn encode_call(event: &str, data: Value) -> Result<String, CodecError> {
    encode(&Envelope::new(event, data))
}

/// Parse and validate an incoming text frame.
///
/// The payload must be a JSON object with a string `event`. `data` defaults
/// to `null`; a non-string `timestamp` is discarded rather than rejected since
/// it is informational only.
pub fn decode(raw: &str) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_str(raw).map_err(CodecError::Malformed)?;
    let Value::Object(mut map) = value else {
        return Err(CodecError::NotAnObject);
    };

    let event = match map.remove("event") {
        Some(Value::String(event)) => event,
        Some(_) => return Err(CodecError::EventNotString),
        None => return Err(CodecError::MissingEvent),
    };
    let data = map.remove("data").unwrap_or(Value::Null);
    let timestamp = match map.remove("timestamp") {
        Some(Value::String(ts)) => Some(ts),
        _ => None,
    };

    Ok(Envelope {
        event,
        data,
        timestamp,
    })
}
