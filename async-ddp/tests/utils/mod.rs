//! Shared harness for the integration tests: a scripted in-memory server
//! behind the transport connector seam.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use ddp::client::{Client, ClientBuilder, MemoryKeyStorage};
use ddp::core::comms::{Connector, Transport, TransportPollResult};
use ddp::core::messages::{parse_frame, ClientMessage, InboundFrame};
use ddp::sync::Mutex;
use ddp::types::Error;

pub const TEST_ENDPOINT: &str = "ws://localhost:3000/websocket";

const WAIT: Duration = Duration::from_millis(2000);

struct MockServerInner {
    /// Every frame the client sent, tagged with its connection index.
    sent: Mutex<Vec<(usize, Value)>>,
    client_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connects: AtomicUsize,
}

/// Handle to the scripted server. Tests read what the client sent and push
/// raw frames back.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<MockServerInner>,
}

impl MockServer {
    pub fn new() -> (MockServer, MockConnector) {
        let server = MockServer {
            inner: Arc::new(MockServerInner {
                sent: Mutex::new(Vec::new()),
                client_tx: Mutex::new(None),
                connects: AtomicUsize::new(0),
            }),
        };
        let connector = MockConnector {
            server: server.clone(),
        };
        (server, connector)
    }

    /// Push a frame to the client on the current connection.
    pub fn send(&self, frame: Value) {
        let tx = self.inner.client_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(frame.to_string());
        }
    }

    /// Kill the current connection; the client sees a transport close.
    pub fn drop_connection(&self) {
        *self.inner.client_tx.lock() = None;
    }

    /// Number of connections the client has opened, 1-based.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Frames sent on connection `conn` (0-based), in order.
    pub fn frames_for(&self, conn: usize) -> Vec<Value> {
        self.inner
            .sent
            .lock()
            .iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Frames on `conn` with the given `msg` discriminant.
    pub fn msgs_for(&self, conn: usize, msg: &str) -> Vec<Value> {
        self.frames_for(conn)
            .into_iter()
            .filter(|v| v["msg"] == msg)
            .collect()
    }

    /// Wait until the client has sent a frame on `conn` matching `pred`,
    /// returning it.
    pub async fn wait_for_frame(
        &self,
        conn: usize,
        pred: impl Fn(&Value) -> bool,
    ) -> Value {
        timeout(WAIT, async {
            loop {
                if let Some(found) = self.frames_for(conn).into_iter().find(|v| pred(v)) {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    /// Wait for the next frame with the given `msg` discriminant.
    pub async fn wait_for_msg(&self, conn: usize, msg: &str) -> Value {
        self.wait_for_frame(conn, |v| v["msg"] == msg).await
    }

    /// Wait until the client opens connection number `n` (1-based) and
    /// sends its `connect` frame, then answer it with `connected`.
    pub async fn accept_connection(&self, n: usize, session_id: &str) -> Value {
        let connect = timeout(WAIT, async {
            loop {
                if self.connects() >= n {
                    let frames = self.msgs_for(n - 1, "connect");
                    if let Some(frame) = frames.first() {
                        return frame.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for a connect frame");
        self.send(json!({"msg": "connected", "session": session_id}));
        connect
    }
}

#[derive(Clone)]
pub struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    ) -> Result<Box<dyn Transport>, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.server.inner.client_tx.lock() = Some(tx);
        let conn = self.server.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            outgoing,
            incoming: rx,
            server: self.server.clone(),
            conn,
        }))
    }
}

pub struct MockTransport {
    outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    incoming: mpsc::UnboundedReceiver<String>,
    server: MockServer,
    conn: usize,
}

#[async_trait]
impl Transport for MockTransport {
    async fn poll(&mut self) -> TransportPollResult {
        tokio::select! {
            out = self.outgoing.recv() => match out {
                Some(message) => {
                    let value = serde_json::to_value(&message).expect("client frame serializes");
                    self.server.inner.sent.lock().push((self.conn, value));
                    TransportPollResult::OutgoingMessageSent
                }
                None => TransportPollResult::Closed("closed by client".into()),
            },
            inc = self.incoming.recv() => match inc {
                Some(text) => match parse_frame(&text) {
                    Ok(frame) => TransportPollResult::IncomingFrame(frame),
                    Err(_) => TransportPollResult::IncomingFrame(InboundFrame::Ignored),
                },
                None => TransportPollResult::Closed("connection closed by peer".into()),
            }
        }
    }
}

/// A client wired to a fresh scripted server, with a short reconnect
/// interval so reconnection tests run fast.
pub fn test_builder() -> (ClientBuilder, MockServer, Arc<MemoryKeyStorage>) {
    let (server, connector) = MockServer::new();
    let storage = Arc::new(MemoryKeyStorage::default());
    let builder = Client::builder(TEST_ENDPOINT)
        .key_storage(storage.clone())
        .connector(Arc::new(connector))
        .reconnect_interval(Duration::from_millis(25));
    (builder, server, storage)
}

/// Build an auto-connecting client and complete the first handshake.
pub async fn connected_client(session_id: &str) -> (Arc<Client>, MockServer) {
    let (builder, server, _storage) = test_builder();
    let client = Arc::new(builder.build().expect("client builds"));
    server.accept_connection(1, session_id).await;
    assert!(
        timeout(WAIT, client.wait_for_connection()).await.unwrap_or(false),
        "client should reach the connected state"
    );
    (client, server)
}

/// Poll `pred` until it holds, panicking after the shared test timeout.
pub async fn eventually(pred: impl Fn() -> bool) {
    timeout(WAIT, async {
        loop {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not become true in time");
}

/// Give in-flight tasks a moment to settle before asserting a negative.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
