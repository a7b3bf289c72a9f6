//! In-memory connector for controller tests.
//!
//! Every successful `connect` hands the test a [`MockPeer`] standing in for
//! the server end of that socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::codec::{self, Envelope};
use crate::error::ChannelError;
use crate::state::ConnectionState;
use crate::transport::{ConnectTarget, Connection, Connector, Frame};
use crate::ChannelClient;

/// Server end of one mock socket.
pub struct MockPeer {
    to_client: fmpsc::UnboundedSender<Result<Frame, ChannelError>>,
    from_client: fmpsc::UnboundedReceiver<Frame>,
}

impl MockPeer {
    pub fn push_raw(&self, raw: &str) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Text(raw.to_string())));
    }

    pub fn push(&self, event: &str, data: Value) {
        let raw = codec::encode(&Envelope::new(event, data)).expect("encode");
        self.push_raw(&raw);
    }

    /// A protocol-level pong with no application payload.
    pub fn push_control(&self) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Control));
    }

    /// The peer closes the socket with a close frame.
    pub fn close(&self, code: u16) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Close {
            code: Some(code),
            reason: "server closing".to_string(),
        }));
    }

    /// Next frame written by the client, `None` once the client side closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_client.next().await
    }

    /// Next text frame decoded as an envelope.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.next_frame().await? {
                Frame::Text(raw) => return Some(codec::decode(&raw).expect("client sent valid frame")),
                Frame::Close { .. } => return None,
                Frame::Control => continue,
            }
        }
    }

    /// True when the client has dropped its half without further frames.
    pub fn client_closed(&mut self) -> bool {
        matches!(self.from_client.try_next(), Ok(None))
    }
}

pub struct MockConnector {
    attempts: AtomicUsize,
    refuse: AtomicBool,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            attempts: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            peers,
        });
        (connector, rx)
    }

    /// Make every following attempt fail before a socket exists.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect(&self, _target: &ConnectTarget) -> BoxFuture<'static, Result<Connection, ChannelError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err::<Connection, _>(ChannelError::Transport("connection refused".into()))
            });
        }

        let (client_tx, peer_rx) = fmpsc::unbounded::<Frame>();
        let (peer_tx, client_rx) = fmpsc::unbounded::<Result<Frame, ChannelError>>();
        let _ = self.peers.send(MockPeer {
            to_client: peer_tx,
            from_client: peer_rx,
        });

        let sink = client_tx.sink_map_err(|_| ChannelError::Closed);
        let conn = Connection::new(Box::pin(sink), Box::pin(client_rx));
        Box::pin(async move { Ok(conn) })
    }
}

/// Collect every state transition the client reports.
pub fn record_states(client: &ChannelClient) -> Arc<std::sync::Mutex<Vec<ConnectionState>>> {
    let states = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = states.clone();
    client.on_state_change(move |s| sink.lock().unwrap().push(s));
    states
}

/// Wait (on the test clock) until the client reports `state`.
pub async fn expect_state(client: &ChannelClient, state: ConnectionState) {
    assert!(
        client.wait_for_state(state, Duration::from_secs(5)).await,
        "client never reached {state}, stuck in {}",
        client.state()
    );
}
