//! Live Channel - resilient client for a server-push event channel
//!
//! A [`ChannelClient`] owns one WebSocket connection to a backend that pushes
//! JSON envelopes (`{"event": ..., "data": ..., "timestamp": ...}`). It keeps
//! the connection alive with a periodic ping, reconnects with capped
//! exponential backoff when the socket fails, and fans incoming envelopes out
//! to listeners registered by event name.
//!
//! # Example
//!
//! ```no_run
//! use live_channel::{ChannelClient, ChannelConfig, ConnectionState};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), live_channel::ChannelError> {
//!     let client = ChannelClient::new(ChannelConfig::new("ws://localhost:8000/ws"))?;
//!
//!     let progress = client.on("progress", |data| println!("progress: {data}"));
//!     client.on_state_change(|state| println!("channel is {state}"));
//!
//!     client.connect();
//!     if client
//!         .wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
//!         .await
//!     {
//!         client.send("subscribe", &serde_json::json!({"job": "ingest-1"}));
//!     }
//!
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     progress.unsubscribe();
//!     client.destroy();
//!     Ok(())
//! }
//! ```

mod client;
pub mod codec;
pub mod config;
mod error;
pub mod heartbeat;
pub mod reconnect;
mod registry;
mod state;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use client::ChannelClient;
pub use codec::{ChannelEvent, Envelope};
pub use config::{ChannelConfig, ChannelFileConfig, load_config, resolve_target_url};
pub use error::{ChannelError, CodecError};
pub use heartbeat::{HeartbeatMonitor, HeartbeatTick};
pub use reconnect::{BackoffPolicy, ReconnectScheduler, ScheduleOutcome};
pub use registry::{ListenerRegistry, Subscription, WILDCARD};
pub use state::ConnectionState;
pub use transport::{ConnectTarget, Connection, Connector, Frame, WebSocketConnector};
