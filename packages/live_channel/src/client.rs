//! Connection controller.
//!
//! [`ChannelClient`] is a synchronous handle. All socket and timer work
//! happens in a driver task that owns the socket, the heartbeat monitor and
//! the reconnect scheduler; the handle talks to it over a command channel and
//! reads the current state from a `watch` channel.
//!
//! The manual-close flag is shared: the handle sets it *before* queueing the
//! command, so a close event the driver is already handling can no longer
//! schedule a reconnect once `disconnect()` has returned.

use std::future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::codec::{self, Envelope};
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatTick};
use crate::reconnect::{BackoffPolicy, ReconnectScheduler, ScheduleOutcome};
use crate::registry::{ListenerRegistry, Subscription};
use crate::state::ConnectionState;
use crate::transport::{ConnectTarget, Connection, Connector, Frame, WebSocketConnector};

/// Upper bound on the close handshake during an intentional disconnect.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Send(String),
    Destroy,
}

/// Handle to one logical channel. Construct once and share by reference.
pub struct ChannelClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    registry: ListenerRegistry,
    manual_close: Arc<AtomicBool>,
    destroyed: AtomicBool,
    url: String,
}

impl ChannelClient {
    /// Client over `tokio-tungstenite`. Must be called inside a tokio runtime.
    pub fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ChannelError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let registry = ListenerRegistry::new();
        let manual_close = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            target: config.target(),
            connector,
            commands: command_rx,
            state: state_tx,
            registry: registry.clone(),
            manual_close: manual_close.clone(),
            socket: None,
            opening: None,
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval, config.heartbeat_timeout),
            reconnect: ReconnectScheduler::new(
                BackoffPolicy::new(config.reconnect_base_delay, config.reconnect_max_delay),
                config.max_reconnect_attempts,
            ),
        };
        runtime.spawn(driver.run());

        Ok(Self {
            commands: command_tx,
            state: state_rx,
            registry,
            manual_close,
            destroyed: AtomicBool::new(false),
            url: config.url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the socket. No-op while connected or already connecting.
    pub fn connect(&self) {
        if self.refuse_if_destroyed("connect") {
            return;
        }
        self.manual_close.store(false, Ordering::SeqCst);
        self.command(Command::Connect);
    }

    /// Close intentionally. Pending reconnects and heartbeats are cancelled
    /// and no new attempt will be made until `connect()`/`reconnect()`.
    pub fn disconnect(&self) {
        if self.refuse_if_destroyed("disconnect") {
            return;
        }
        self.manual_close.store(true, Ordering::SeqCst);
        self.command(Command::Disconnect);
    }

    /// Close, then open a fresh socket with a full attempt budget.
    pub fn reconnect(&self) {
        if self.refuse_if_destroyed("reconnect") {
            return;
        }
        self.manual_close.store(false, Ordering::SeqCst);
        self.command(Command::Reconnect);
    }

    /// Disconnect and drop every listener and observer. Terminal.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manual_close.store(true, Ordering::SeqCst);
        self.command(Command::Destroy);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Best-effort publish. Returns whether the frame was handed to the
    /// socket; nothing is queued while disconnected.
    pub fn send<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> bool {
        if self.refuse_if_destroyed("send") {
            return false;
        }
        let state = self.state();
        if state != ConnectionState::Connected {
            warn!(event, state = %state, "channel not connected; dropping message");
            return false;
        }
        // The driver may not have processed a pending disconnect yet.
        if self.manual_close.load(Ordering::SeqCst) {
            warn!(event, "channel closing; dropping message");
            return false;
        }
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!(event, error = %e, "unserializable payload; dropping message");
                return false;
            }
        };
        match codec::encode_call(event, data) {
            Ok(frame) => self.command(Command::Send(frame)),
            Err(e) => {
                warn!(event, error = %e, "failed to encode message");
                false
            }
        }
    }

    /// Subscribe to `event`. [`WILDCARD`](crate::WILDCARD) receives every
    /// envelope as a JSON value.
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.registry.on(event, callback)
    }

    /// Subscribe to every envelope.
    pub fn on_any<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.registry.on_any(callback)
    }

    /// Remove all listeners for `event`, or for every event.
    pub fn off(&self, event: Option<&str>) {
        self.registry.off(event);
    }

    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.registry.on_state_change(callback)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the client is in `target`. Returns false on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        )
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    fn command(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            warn!(url = %self.url, "channel driver has stopped");
            return false;
        }
        true
    }

    fn refuse_if_destroyed(&self, op: &str) -> bool {
        let destroyed = self.is_destroyed();
        if destroyed {
            warn!(op, "channel client already destroyed");
        }
        destroyed
    }
}

/// Owns the socket and both timers. Lives until `destroy()` or until every
/// handle is dropped.
struct Driver {
    target: ConnectTarget,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    registry: ListenerRegistry,
    manual_close: Arc<AtomicBool>,
    socket: Option<Connection>,
    opening: Option<BoxFuture<'static, Result<Connection, ChannelError>>>,
    heartbeat: HeartbeatMonitor,
    reconnect: ReconnectScheduler,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        self.shutdown("client dropped").await;
                        break;
                    }
                },

                result = opened(&mut self.opening) => {
                    self.opening = None;
                    self.handle_open(result);
                }

                frame = next_frame(&mut self.socket) => self.handle_frame(frame),

                tick = self.heartbeat.tick() => self.handle_heartbeat(tick).await,

                () = self.reconnect.fired() => self.handle_reconnect_timer(),
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect => {
                if self.socket.is_some() || self.opening.is_some() {
                    let state = *self.state.borrow();
                    debug!(%state, "connect ignored; socket already open");
                    return ControlFlow::Continue(());
                }
                self.reconnect.cancel();
                self.reconnect.reset();
                self.open_socket();
            }
            Command::Disconnect => {
                self.shutdown("client disconnect").await;
            }
            Command::Reconnect => {
                self.shutdown("client reconnect").await;
                self.reconnect.reset();
                self.open_socket();
            }
            Command::Send(frame) => self.write(frame).await,
            Command::Destroy => {
                self.shutdown("client destroyed").await;
                self.registry.close();
                debug!(url = %self.target.url, "channel destroyed");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn open_socket(&mut self) {
        self.transition(ConnectionState::Connecting);
        debug!(url = %self.target.url, "opening channel socket");
        self.opening = Some(self.connector.connect(&self.target));
    }

    fn handle_open(&mut self, result: Result<Connection, ChannelError>) {
        match result {
            Ok(connection) => {
                self.socket = Some(connection);
                self.reconnect.reset();
                self.transition(ConnectionState::Connected);
                self.heartbeat.start();
                info!(url = %self.target.url, "channel connected");
            }
            Err(e) => {
                warn!(url = %self.target.url, error = %e, "channel connection failed");
                self.connection_lost();
            }
        }
    }

    fn handle_frame(&mut self, frame: Result<Frame, ChannelError>) {
        match frame {
            Ok(Frame::Text(raw)) => {
                self.heartbeat.record_inbound();
                match codec::decode(&raw) {
                    Ok(envelope) => self.registry.dispatch(&envelope),
                    Err(e) => warn!(error = %e, len = raw.len(), "dropping malformed frame"),
                }
            }
            Ok(Frame::Control) => self.heartbeat.record_inbound(),
            Ok(Frame::Close { code, reason }) => {
                info!(code = ?code, reason = %reason, "channel closed by peer");
                self.connection_lost();
            }
            Err(e) => {
                warn!(error = %e, "channel socket error");
                self.connection_lost();
            }
        }
    }

    async fn handle_heartbeat(&mut self, tick: HeartbeatTick) {
        match tick {
            HeartbeatTick::Probe => {
                if self.manual_close.load(Ordering::SeqCst) || self.socket.is_none() {
                    return;
                }
                match codec::encode(&Envelope::ping()) {
                    Ok(frame) => self.write(frame).await,
                    Err(e) => warn!(error = %e, "failed to encode heartbeat"),
                }
            }
            HeartbeatTick::Stale { silent_for } => {
                warn!(
                    silent_ms = silent_for.as_millis() as u64,
                    "no traffic from peer; dropping stale connection"
                );
                self.connection_lost();
            }
        }
    }

    fn handle_reconnect_timer(&mut self) {
        if self.manual_close.load(Ordering::SeqCst) {
            return;
        }
        if self.socket.is_some() || self.opening.is_some() {
            return;
        }
        info!(
            url = %self.target.url,
            attempt = self.reconnect.attempts(),
            "reconnection attempt"
        );
        self.open_socket();
    }

    async fn write(&mut self, frame: String) {
        let Some(socket) = self.socket.as_mut() else {
            debug!("socket gone before write; dropping frame");
            return;
        };
        if let Err(e) = socket.sink.send(Frame::Text(frame)).await {
            warn!(error = %e, "channel write failed");
            self.connection_lost();
        }
    }

    /// The socket died (or never opened). Reconnect unless the close was ours.
    fn connection_lost(&mut self) {
        self.socket = None;
        self.opening = None;
        self.heartbeat.stop();
        self.transition(ConnectionState::Disconnected);

        if self.manual_close.load(Ordering::SeqCst) {
            debug!("manual close; not reconnecting");
            return;
        }

        match self.reconnect.schedule() {
            ScheduleOutcome::Scheduled { attempt, delay } => {
                info!(
                    url = %self.target.url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.transition(ConnectionState::Reconnecting);
            }
            ScheduleOutcome::Exhausted { attempts } => {
                warn!(
                    url = %self.target.url,
                    attempts,
                    "reconnect attempts exhausted; staying disconnected"
                );
            }
        }
    }

    /// Intentional close: cancel both timers, close with 1000, go `disconnected`.
    async fn shutdown(&mut self, reason: &str) {
        self.reconnect.cancel();
        self.heartbeat.stop();
        self.opening = None;
        if let Some(mut socket) = self.socket.take() {
            let close = async {
                socket.sink.send(Frame::close_normal(reason)).await?;
                socket.sink.close().await
            };
            match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
                Ok(Ok(())) => debug!(reason, "channel closed"),
                Ok(Err(e)) => debug!(reason, error = %e, "close handshake failed"),
                Err(_) => debug!(reason, "close handshake timed out"),
            }
        }
        self.transition(ConnectionState::Disconnected);
    }

    fn transition(&mut self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev == next {
            return;
        }
        debug!(from = %prev, to = %next, "channel state changed");
        self.registry.notify_state(next);
    }
}

async fn opened(
    opening: &mut Option<BoxFuture<'static, Result<Connection, ChannelError>>>,
) -> Result<Connection, ChannelError> {
    match opening.as_mut() {
        Some(fut) => fut.await,
        None => future::pending().await,
    }
}

/// A stream that ends without a close frame is a failure close.
async fn next_frame(socket: &mut Option<Connection>) -> Result<Frame, ChannelError> {
    match socket.as_mut() {
        Some(connection) => connection
            .stream
            .next()
            .await
            .unwrap_or(Err(ChannelError::Closed)),
        None => future::pending().await,
    }
}
