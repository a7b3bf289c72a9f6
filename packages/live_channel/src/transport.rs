//! Socket seam between the controller and the wire.
//!
//! The controller only sees [`Frame`]s flowing through a [`Connection`]; the
//! [`Connector`] decides how a connection is opened. [`WebSocketConnector`]
//! is the production implementation over `tokio-tungstenite`.

use std::pin::Pin;
use std::sync::Once;

use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use crate::error::ChannelError;

/// Normal-closure code used for intentional disconnects.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub url: String,
    pub protocols: Vec<String>,
}

/// What the controller reads from and writes to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: Option<u16>, reason: String },
    /// Protocol-level ping or pong. No payload; only proves the peer is alive.
    Control,
}

impl Frame {
    pub fn close_normal(reason: impl Into<String>) -> Self {
        Self::Close {
            code: Some(NORMAL_CLOSURE),
            reason: reason.into(),
        }
    }

    fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Close { code, reason } => Message::Close(code.map(|code| CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
            Frame::Control => Message::Pong(Default::default()),
        }
    }

    /// Text and close frames pass through. Pings and pongs are answered by
    /// tungstenite itself and surface only as [`Frame::Control`]; binary
    /// frames are not part of the protocol.
    fn from_message(msg: Result<Message, tungstenite::Error>) -> Option<Result<Frame, ChannelError>> {
        match msg {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
            Ok(Message::Close(frame)) => Some(Ok(match frame {
                Some(frame) => Frame::Close {
                    code: Some(u16::from(frame.code)),
                    reason: frame.reason.as_str().to_owned(),
                },
                None => Frame::Close {
                    code: None,
                    reason: String::new(),
                },
            })),
            Ok(Message::Binary(bytes)) => {
                debug!(len = bytes.len(), "ignoring binary frame");
                None
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => Some(Ok(Frame::Control)),
            Ok(Message::Frame(_)) => None,
            Err(e) => Some(Err(e.into())),
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ChannelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ChannelError>> + Send>>;

/// One open socket, split into its write and read halves.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens a fresh socket for every attempt. A connection is never reused.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, target: &ConnectTarget) -> BoxFuture<'static, Result<Connection, ChannelError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, target: &ConnectTarget) -> BoxFuture<'static, Result<Connection, ChannelError>> {
        let target = target.clone();
        install_crypto_provider();
        Box::pin(async move {
            let request = build_request(&target)?;
            let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| match ChannelError::from(e) {
                    ChannelError::InvalidUrl { reason, .. } => {
                        ChannelError::invalid_url(&target.url, reason)
                    }
                    other => other,
                })?;

            let (write, read) = ws_stream.split();
            let sink = write
                .sink_map_err(ChannelError::from)
                .with(|frame: Frame| future::ready(Ok::<_, ChannelError>(frame.into_message())));
            let stream = read.filter_map(|msg| future::ready(Frame::from_message(msg)));

            Ok(Connection::new(Box::pin(sink), Box::pin(stream)))
        })
    }
}

/// `wss://` handshakes need a process-wide rustls provider.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Err means the application installed its own provider first.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Validate the target and attach the sub-protocol header.
pub fn build_request(
    target: &ConnectTarget,
) -> Result<tungstenite::handshake::client::Request, ChannelError> {
    let mut request = target
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ChannelError::invalid_url(&target.url, e))?;

    if !target.protocols.is_empty() {
        let value = HeaderValue::from_str(&target.protocols.join(", "))
            .map_err(|e| ChannelError::invalid_url(&target.url, e))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(request)
}
