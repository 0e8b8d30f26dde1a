//! WebSocket transport implementation using `tokio-tungstenite`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SERVER};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};

use crate::{
    Connection, MessageKind, MessageReader, MessageWriter, TransportError,
};

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Header slots offered to `httparse`; matches tungstenite's own limit.
const MAX_HEADERS: usize = 124;

/// Pause between peeks while the request head is still incomplete.
const PEEK_INTERVAL: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// HandshakeConfig
// ---------------------------------------------------------------------------

/// Settings applied while upgrading an accepted TCP stream.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Value of the `Server` header on the handshake response.
    pub server_name: String,

    /// Upper bound on the HTTP upgrade request head, in bytes.
    pub max_request_head_bytes: usize,

    /// Largest inbound message accepted. `None` means unlimited.
    pub max_message_size: Option<usize>,

    /// How long a client gets to send its request and finish the upgrade.
    pub handshake_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            server_name: "wsrelay".to_string(),
            max_request_head_bytes: 8 * 1024,
            max_message_size: Some(16 << 20),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl HandshakeConfig {
    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = self.max_message_size;
        config
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Listens for TCP connections that are expected to upgrade to WebSocket.
pub struct WebSocketListener {
    listener: TcpListener,
    config: Arc<HandshakeConfig>,
}

impl WebSocketListener {
    /// Binds a new listener to the given address.
    pub async fn bind(
        addr: &str,
        config: HandshakeConfig,
    ) -> Result<Self, TransportError> {
        let listener =
            TcpListener::bind(addr).await.map_err(TransportError::Accept)?;
        tracing::info!(addr, "WebSocket listener bound");
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits for the next TCP connection.
    ///
    /// Nothing is read from the stream here, so a slow client cannot stall
    /// the accept loop.
    pub async fn accept(&self) -> Result<Incoming, TransportError> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        tracing::debug!(%peer_addr, "accepted TCP connection");
        Ok(Incoming {
            stream,
            peer_addr,
            config: Arc::clone(&self.config),
        })
    }
}

/// A freshly accepted TCP stream whose upgrade request is still unread.
pub struct Incoming {
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<HandshakeConfig>,
}

impl Incoming {
    /// Returns the remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Parses the HTTP upgrade request head to learn the request path.
    ///
    /// The head is only peeked at, so the WebSocket handshake still reads
    /// the full request from the socket.
    pub async fn read_request(self) -> Result<PendingWebSocket, TransportError> {
        let path = tokio::time::timeout(
            self.config.handshake_timeout,
            peek_request_path(&self.stream, self.config.max_request_head_bytes),
        )
        .await
        .map_err(|_| {
            TransportError::Handshake(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out reading upgrade request",
            ))
        })??;

        Ok(PendingWebSocket {
            stream: self.stream,
            path,
            peer_addr: self.peer_addr,
            config: self.config,
        })
    }
}

/// Peeks at `stream` until a complete request head can be parsed.
async fn peek_request_path(
    stream: &TcpStream,
    max: usize,
) -> Result<String, TransportError> {
    let mut buf = vec![0u8; max];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await.map_err(TransportError::Handshake)?;
        if n == 0 {
            return Err(TransportError::Eof);
        }
        if let Some(path) = parse_request_path(&buf[..n])? {
            return Ok(path);
        }
        if n == buf.len() {
            return Err(TransportError::Handshake(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("upgrade request head exceeds {max} bytes"),
            )));
        }
        // Peek returns immediately while any bytes are buffered, so wait
        // for more to arrive instead of spinning.
        if n == seen {
            tokio::time::sleep(PEEK_INTERVAL).await;
        }
        seen = n;
    }
}

/// Parses a request head and returns the path of its target, without the
/// query. Returns `Ok(None)` while the head is incomplete.
///
/// Both origin-form (`/chat`) and absolute-form (`http://host/chat`)
/// targets are accepted.
fn parse_request_path(head: &[u8]) -> Result<Option<String>, TransportError> {
    let invalid = |e: Box<dyn std::error::Error + Send + Sync>| {
        TransportError::Handshake(io::Error::new(io::ErrorKind::InvalidData, e))
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(head) {
        Ok(httparse::Status::Partial) => return Ok(None),
        Ok(httparse::Status::Complete(_)) => {}
        Err(e) => return Err(invalid(e.into())),
    }

    let target = request.path.ok_or_else(|| invalid("missing request target".into()))?;
    let uri: Uri = target.parse().map_err(|e| invalid(Box::new(e)))?;
    let path = uri.path();
    if !path.starts_with('/') {
        return Err(invalid("request target has no absolute path".into()));
    }
    Ok(Some(path.to_string()))
}

// ---------------------------------------------------------------------------
// PendingWebSocket
// ---------------------------------------------------------------------------

/// An accepted connection whose path is known but whose WebSocket
/// handshake has not run yet.
pub struct PendingWebSocket {
    stream: TcpStream,
    path: String,
    peer_addr: SocketAddr,
    config: Arc<HandshakeConfig>,
}

impl PendingWebSocket {
    /// The request path the client asked to upgrade.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Connection for PendingWebSocket {
    type Reader = WebSocketReader;
    type Writer = WebSocketWriter;

    async fn handshake(
        self,
    ) -> Result<(WebSocketReader, WebSocketWriter), TransportError> {
        let server_name = self.config.server_name.clone();
        let decorate = move |_req: &Request,
                             mut resp: Response|
              -> Result<Response, ErrorResponse> {
            if let Ok(value) = HeaderValue::from_str(&server_name) {
                resp.headers_mut().insert(SERVER, value);
            }
            Ok(resp)
        };

        let ws = tokio::time::timeout(
            self.config.handshake_timeout,
            tokio_tungstenite::accept_hdr_async_with_config(
                self.stream,
                decorate,
                Some(self.config.websocket_config()),
            ),
        )
        .await
        .map_err(|_| {
            TransportError::Handshake(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake timed out",
            ))
        })?
        .map_err(|e| map_ws_error(e, TransportError::Handshake))?;

        tracing::debug!(
            peer_addr = %self.peer_addr,
            path = %self.path,
            "WebSocket handshake complete"
        );

        let (sink, stream) = ws.split();
        Ok((WebSocketReader { stream }, WebSocketWriter { sink }))
    }
}

// ---------------------------------------------------------------------------
// Reader / Writer halves
// ---------------------------------------------------------------------------

/// The receiving half of an upgraded WebSocket.
pub struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

impl MessageReader for WebSocketReader {
    async fn read_message(
        &mut self,
        buf: &mut Vec<u8>,
    ) -> Result<MessageKind, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    buf.extend_from_slice(text.as_bytes());
                    return Ok(MessageKind::Text);
                }
                Some(Ok(Message::Binary(data))) => {
                    buf.extend_from_slice(&data);
                    return Ok(MessageKind::Binary);
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::Closed);
                }
                Some(Ok(_)) => continue, // ping/pong/raw frame
                Some(Err(e)) => return Err(map_ws_error(e, TransportError::Read)),
            }
        }
    }
}

/// The sending half of an upgraded WebSocket.
pub struct WebSocketWriter {
    sink: SplitSink<WsStream, Message>,
}

impl MessageWriter for WebSocketWriter {
    async fn write_message(
        &mut self,
        kind: MessageKind,
        payload: Arc<[u8]>,
    ) -> Result<(), TransportError> {
        let msg = match kind {
            MessageKind::Text => {
                let text = Utf8Bytes::try_from(Bytes::from_owner(payload))
                    .map_err(|_| TransportError::InvalidText)?;
                Message::Text(text)
            }
            MessageKind::Binary => Message::Binary(Bytes::from_owner(payload)),
        };
        self.sink
            .send(msg)
            .await
            .map_err(|e| map_ws_error(e, TransportError::Write))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| map_ws_error(e, TransportError::Write))
    }
}

/// Classifies a tungstenite error, keeping closure-class conditions apart
/// from genuine faults.
fn map_ws_error(
    e: WsError,
    fault: fn(io::Error) -> TransportError,
) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            TransportError::Closed
        }
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::Eof
        }
        WsError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
            TransportError::Eof
        }
        WsError::Io(io) => fault(io),
        WsError::Capacity(c) => TransportError::MessageTooLarge(c.to_string()),
        other => fault(io::Error::new(io::ErrorKind::InvalidData, other)),
    }
}
