//! Integration tests for the session lifecycle.
//!
//! A `MockConnection` stands in for the network: the test plays the peer
//! by pushing inbound results into a channel and watching what the session
//! writes. A `RecordingRouter` turns every dispatched event into a value the
//! test can await, so ordering and counts can be asserted exactly.

use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use wsrelay_session::{
    CloseContext, ErrorContext, MessageContext, MessageKind, OpenContext,
    Router, Session, SessionId, SessionRegistry, SessionState, CLOSE_TIMEOUT,
};
use wsrelay_transport::{
    Connection, MessageReader, MessageWriter, TransportError,
};

// =========================================================================
// Mock transport
// =========================================================================

type Inbound = Result<(MessageKind, Vec<u8>), TransportError>;

#[derive(Debug, PartialEq)]
enum Written {
    Message(MessageKind, Vec<u8>),
    Close,
}

struct MockConnection {
    handshake_failure: Option<TransportError>,
    fail_writes: bool,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    written: mpsc::UnboundedSender<Written>,
    buffer_lens: Arc<Mutex<Vec<usize>>>,
}

/// The test's side of a mock connection.
struct Peer {
    inbound: mpsc::UnboundedSender<Inbound>,
    written: mpsc::UnboundedReceiver<Written>,
    /// Length of the session's read buffer at the start of every read.
    buffer_lens: Arc<Mutex<Vec<usize>>>,
}

impl Peer {
    fn send(&self, kind: MessageKind, data: &[u8]) {
        self.inbound.send(Ok((kind, data.to_vec()))).unwrap();
    }

    fn fail(&self, err: TransportError) {
        self.inbound.send(Err(err)).unwrap();
    }

    async fn next_written(&mut self) -> Written {
        tokio::time::timeout(Duration::from_secs(2), self.written.recv())
            .await
            .expect("timed out waiting for a write")
            .expect("writer dropped")
    }
}

fn mock(handshake_ok: bool, fail_writes: bool) -> (MockConnection, Peer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let buffer_lens = Arc::new(Mutex::new(Vec::new()));
    (
        MockConnection {
            handshake_failure: (!handshake_ok).then(|| {
                TransportError::Handshake(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "not a websocket request",
                ))
            }),
            fail_writes,
            inbound: inbound_rx,
            written: written_tx,
            buffer_lens: Arc::clone(&buffer_lens),
        },
        Peer {
            inbound: inbound_tx,
            written: written_rx,
            buffer_lens,
        },
    )
}

/// A connection whose handshake fails with `err`.
fn failing_handshake(err: TransportError) -> (MockConnection, Peer) {
    let (mut conn, peer) = mock(true, false);
    conn.handshake_failure = Some(err);
    (conn, peer)
}

struct MockReader {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    buffer_lens: Arc<Mutex<Vec<usize>>>,
}

struct MockWriter {
    fail_writes: bool,
    written: mpsc::UnboundedSender<Written>,
}

impl Connection for MockConnection {
    type Reader = MockReader;
    type Writer = MockWriter;

    async fn handshake(self) -> Result<(MockReader, MockWriter), TransportError> {
        if let Some(e) = self.handshake_failure {
            return Err(e);
        }
        Ok((
            MockReader {
                inbound: self.inbound,
                buffer_lens: self.buffer_lens,
            },
            MockWriter {
                fail_writes: self.fail_writes,
                written: self.written,
            },
        ))
    }
}

impl MessageReader for MockReader {
    async fn read_message(
        &mut self,
        buf: &mut Vec<u8>,
    ) -> Result<MessageKind, TransportError> {
        self.buffer_lens.lock().unwrap().push(buf.len());
        match self.inbound.recv().await {
            Some(Ok((kind, data))) => {
                buf.extend_from_slice(&data);
                Ok(kind)
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Eof),
        }
    }
}

impl MessageWriter for MockWriter {
    async fn write_message(
        &mut self,
        kind: MessageKind,
        payload: Arc<[u8]>,
    ) -> Result<(), TransportError> {
        if self.fail_writes {
            return Err(TransportError::Write(io::Error::from(
                io::ErrorKind::BrokenPipe,
            )));
        }
        let _ = self.written.send(Written::Message(kind, payload.to_vec()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.written.send(Written::Close);
        Ok(())
    }
}

// =========================================================================
// Recording router
// =========================================================================

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Open { id: SessionId, registered: bool },
    Message { id: SessionId, kind: MessageKind, payload: Vec<u8> },
    Error { id: SessionId, registered: bool },
    Close { id: SessionId, registered: bool },
}

struct RecordingRouter {
    registry: SessionRegistry,
    events: mpsc::UnboundedSender<Event>,
    opened: Mutex<Vec<Weak<Session>>>,
    echo: bool,
}

impl RecordingRouter {
    fn new(
        registry: &SessionRegistry,
        echo: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            registry: registry.clone(),
            events,
            opened: Mutex::new(Vec::new()),
            echo,
        });
        (router, rx)
    }

    fn is_registered(&self, session: &Session) -> bool {
        self.registry.resolve(session.id().as_str()).is_some()
    }
}

impl Router for RecordingRouter {
    fn dispatch_open(&self, path: &str, ctx: OpenContext<'_>) {
        assert_eq!(path, ctx.path);
        self.opened.lock().unwrap().push(Arc::downgrade(ctx.session));
        let _ = self.events.send(Event::Open {
            id: ctx.session.id().clone(),
            registered: self.is_registered(ctx.session),
        });
    }

    fn dispatch_message(&self, _path: &str, ctx: MessageContext<'_>) {
        if self.echo {
            ctx.session.send(ctx.payload, ctx.kind).unwrap();
        }
        let _ = self.events.send(Event::Message {
            id: ctx.session.id().clone(),
            kind: ctx.kind,
            payload: ctx.payload.to_vec(),
        });
    }

    fn dispatch_error(&self, _path: &str, ctx: ErrorContext<'_>) {
        assert!(!ctx.error.is_normal_closure());
        let _ = self.events.send(Event::Error {
            id: ctx.session.id().clone(),
            registered: self.is_registered(ctx.session),
        });
    }

    fn dispatch_close(&self, _path: &str, ctx: CloseContext<'_>) {
        assert!(ctx.cause.is_normal_closure());
        let _ = self.events.send(Event::Close {
            id: ctx.session.id().clone(),
            registered: self.is_registered(ctx.session),
        });
    }
}

// =========================================================================
// Helpers
// =========================================================================

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("router dropped")
}

/// Asserts no further event arrives within a short window.
async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<Event>) {
    let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(
        !matches!(result, Ok(Some(_))),
        "unexpected event: {result:?}"
    );
}

/// Serves `conn` on a background task and waits for its `open` event.
async fn open_session(
    conn: MockConnection,
    router: &Arc<RecordingRouter>,
    registry: &SessionRegistry,
    events: &mut mpsc::UnboundedReceiver<Event>,
) -> (SessionId, tokio::task::JoinHandle<()>) {
    let handle = tokio::spawn(Session::serve(
        conn,
        "/chat",
        Arc::clone(router) as Arc<dyn Router>,
        registry.clone(),
    ));
    match next_event(events).await {
        Event::Open { id, registered } => {
            assert!(registered, "session must be registered before open");
            (id, handle)
        }
        other => panic!("expected Open, got {other:?}"),
    }
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_clean_disconnect_yields_messages_then_one_close() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn, peer) = mock(true, false);

    let (id, handle) = open_session(conn, &router, &registry, &mut events).await;
    let session = registry.resolve(id.as_str()).expect("registered");
    assert_eq!(session.path(), "/chat");
    assert_eq!(session.state(), SessionState::Active);

    peer.send(MessageKind::Text, b"hello");
    peer.send(MessageKind::Binary, &[0, 1, 2, 255]);
    peer.fail(TransportError::Closed);

    assert_eq!(
        next_event(&mut events).await,
        Event::Message {
            id: id.clone(),
            kind: MessageKind::Text,
            payload: b"hello".to_vec(),
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Message {
            id: id.clone(),
            kind: MessageKind::Binary,
            payload: vec![0, 1, 2, 255],
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Close {
            id: id.clone(),
            registered: false,
        }
    );

    handle.await.unwrap();
    assert_no_event(&mut events).await;
    assert!(registry.is_empty());
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_read_buffer_empty_before_every_read() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn, peer) = mock(true, false);

    let (_id, handle) = open_session(conn, &router, &registry, &mut events).await;
    for i in 0..5u8 {
        peer.send(MessageKind::Binary, &vec![i; 10 + i as usize]);
    }
    peer.fail(TransportError::Closed);
    handle.await.unwrap();

    let lens = peer.buffer_lens.lock().unwrap().clone();
    assert_eq!(lens.len(), 6, "five messages plus the closing read");
    assert!(lens.iter().all(|&len| len == 0), "buffer leaked: {lens:?}");
}

#[tokio::test]
async fn test_end_of_stream_is_close_not_error() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn, peer) = mock(true, false);

    let (id, handle) = open_session(conn, &router, &registry, &mut events).await;
    peer.fail(TransportError::Eof);

    assert_eq!(
        next_event(&mut events).await,
        Event::Close {
            id,
            registered: false,
        }
    );
    handle.await.unwrap();
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn test_connection_reset_yields_one_error_and_unregisters() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn, peer) = mock(true, false);

    let (id, handle) = open_session(conn, &router, &registry, &mut events).await;
    peer.fail(TransportError::Read(io::Error::from(
        io::ErrorKind::ConnectionReset,
    )));

    assert_eq!(
        next_event(&mut events).await,
        Event::Error {
            id,
            registered: false,
        }
    );
    handle.await.unwrap();
    assert_no_event(&mut events).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_handshake_failure_dispatches_one_error_without_open() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn, _peer) = mock(false, false);

    Session::serve(
        conn,
        "/chat",
        Arc::clone(&router) as Arc<dyn Router>,
        registry.clone(),
    )
    .await;

    assert!(matches!(
        next_event(&mut events).await,
        Event::Error {
            registered: false,
            ..
        }
    ));
    assert_no_event(&mut events).await;
    assert!(registry.is_empty());
    assert!(router.opened.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_hangup_during_handshake_dispatches_close() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn, _peer) = failing_handshake(TransportError::Eof);

    Session::serve(conn, "/chat", router as Arc<dyn Router>, registry.clone())
        .await;

    assert!(matches!(
        next_event(&mut events).await,
        Event::Close {
            registered: false,
            ..
        }
    ));
    assert_no_event(&mut events).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_echo_from_router_reaches_peer_with_kind() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, true);
    let (conn, mut peer) = mock(true, false);

    let (_id, _handle) = open_session(conn, &router, &registry, &mut events).await;
    peer.send(MessageKind::Text, b"ping");
    peer.send(MessageKind::Binary, &[9, 9]);

    assert_eq!(
        peer.next_written().await,
        Written::Message(MessageKind::Text, b"ping".to_vec())
    );
    assert_eq!(
        peer.next_written().await,
        Written::Message(MessageKind::Binary, vec![9, 9])
    );
}

#[tokio::test]
async fn test_write_failure_yields_one_error_and_stops_reading() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn, peer) = mock(true, true);

    let (id, handle) = open_session(conn, &router, &registry, &mut events).await;
    let session = registry.resolve(id.as_str()).unwrap();
    session.send_text("doomed").unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::Error {
            id: id.clone(),
            registered: false,
        }
    );
    // The read loop exits even though the peer never closed.
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("serve should return")
        .unwrap();

    // A late inbound result must not produce a second terminal event.
    let _ = peer.inbound.send(Err(TransportError::Closed));
    assert_no_event(&mut events).await;
    assert!(matches!(
        session.send_text("after"),
        Err(wsrelay_session::SessionError::NotActive { .. })
    ));
}

#[tokio::test]
async fn test_local_close_sends_close_then_dispatches_close() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn, mut peer) = mock(true, false);

    let (id, handle) = open_session(conn, &router, &registry, &mut events).await;
    let session = registry.resolve(id.as_str()).unwrap();

    session.send_text("bye").unwrap();
    session.close();
    assert_eq!(session.state(), SessionState::Closing);

    assert_eq!(
        peer.next_written().await,
        Written::Message(MessageKind::Text, b"bye".to_vec())
    );
    assert_eq!(peer.next_written().await, Written::Close);

    // The peer acknowledges the close.
    peer.fail(TransportError::Closed);
    assert_eq!(
        next_event(&mut events).await,
        Event::Close {
            id,
            registered: false,
        }
    );
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_local_close_times_out() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn, mut peer) = mock(true, false);

    let (id, handle) = open_session(conn, &router, &registry, &mut events).await;
    let session = registry.resolve(id.as_str()).unwrap();
    let started = tokio::time::Instant::now();

    session.close();
    assert_eq!(peer.next_written().await, Written::Close);

    // The peer keeps the connection open but never answers.
    let event = tokio::time::timeout(CLOSE_TIMEOUT * 2, events.recv())
        .await
        .expect("close should time out")
        .expect("router dropped");

    assert_eq!(
        event,
        Event::Close {
            id,
            registered: false,
        }
    );
    assert!(started.elapsed() >= CLOSE_TIMEOUT);
    assert_eq!(session.state(), SessionState::Closed);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_batch_send_counts_live_sessions_only() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn_a, mut peer_a) = mock(true, false);
    let (conn_c, mut peer_c) = mock(true, false);

    let (a, _ha) = open_session(conn_a, &router, &registry, &mut events).await;
    let (c, _hc) = open_session(conn_c, &router, &registry, &mut events).await;

    let delivered = registry.send_to(
        [a.as_str(), "not-a-session", c.as_str()],
        &b"fan-out"[..],
        MessageKind::Text,
    );

    assert_eq!(delivered, 2);
    assert_eq!(
        peer_a.next_written().await,
        Written::Message(MessageKind::Text, b"fan-out".to_vec())
    );
    assert_eq!(
        peer_c.next_written().await,
        Written::Message(MessageKind::Text, b"fan-out".to_vec())
    );
    assert!(registry.send(a.as_str(), vec![1u8], MessageKind::Binary));
    assert!(!registry.send("not-a-session", vec![1u8], MessageKind::Binary));
}

#[tokio::test]
async fn test_session_freed_after_terminal_event() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);
    let (conn, peer) = mock(true, false);

    let (_id, handle) = open_session(conn, &router, &registry, &mut events).await;
    let weak = router.opened.lock().unwrap()[0].clone();
    assert!(weak.upgrade().is_some());

    peer.fail(TransportError::Closed);
    handle.await.unwrap();

    // The write task drops its handle once it observes shutdown.
    let freed = tokio::time::timeout(Duration::from_secs(2), async {
        while weak.upgrade().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(freed.is_ok(), "session still referenced after close");
}

#[tokio::test]
async fn test_many_sessions_have_distinct_registry_entries() {
    let registry = SessionRegistry::new();
    let (router, mut events) = RecordingRouter::new(&registry, false);

    let mut peers = Vec::new();
    let mut ids = std::collections::HashSet::new();
    for _ in 0..50 {
        let (conn, peer) = mock(true, false);
        let (id, _handle) = open_session(conn, &router, &registry, &mut events).await;
        assert!(ids.insert(id), "duplicate session id");
        peers.push(peer);
    }
    assert_eq!(registry.len(), 50);

    for peer in &peers {
        peer.fail(TransportError::Closed);
    }
    for _ in 0..50 {
        assert!(matches!(
            next_event(&mut events).await,
            Event::Close { registered: false, .. }
        ));
    }
    assert!(registry.is_empty());
}
