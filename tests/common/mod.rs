// Common test utilities for integration tests
// This module contains shared code for all integration tests

#![allow(dead_code)]

// Standard library imports
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

// External crate imports
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::LevelFilter;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_tungstenite::tungstenite::Message as WsMessage;

// Import the crate functionality
use parley::inbox::transport::{Connector, Incoming, PushStream, TransportError};
use parley::inbox::{ConversationSource, LoadError};
use parley::models::{ConversationSummary, Direction};
use parley::InboxSnapshot;

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

//------------------------------------------------------------------------------
// FRAMES AND ROWS
//------------------------------------------------------------------------------

/// JSON push frame for a message event
pub fn message_frame(phone: &str, name: &str, is_new: Option<bool>, text: &str, timestamp: &str, direction: Direction) -> String {
    let (event, direction) = match direction {
        Direction::Incoming => ("message_incoming", "incoming"),
        Direction::Outgoing => ("message_outgoing", "outgoing"),
    };
    let mut contact = json!({ "id": 1, "phone": phone, "name": name });
    if let Some(is_new) = is_new {
        contact["is_new"] = json!(is_new);
        contact["exists"] = json!(!is_new);
    }
    json!({
        "event": event,
        "data": {
            "phone": phone,
            "name": name,
            "contact": contact,
            "message": { "text": text, "timestamp": timestamp, "direction": direction }
        }
    })
    .to_string()
}

pub fn incoming_frame(phone: &str, is_new: Option<bool>, text: &str) -> String {
    message_frame(phone, "", is_new, text, "2024-01-01T10:05:00Z", Direction::Incoming)
}

pub fn summary(phone: &str, name: &str, message_count: u64) -> ConversationSummary {
    ConversationSummary {
        phone: phone.to_string(),
        name: Some(name.to_string()),
        last_message: Some("hi".to_string()),
        last_timestamp: Some("2024-01-01T10:00:00Z".to_string()),
        message_count,
        direction: Direction::Incoming,
    }
}

//------------------------------------------------------------------------------
// MOCK TRANSPORT
//------------------------------------------------------------------------------

impl MockPeer {
    /// Deliver a text frame to the client
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), mpsc::error::SendError<Incoming>> {
        self.frames.send(Incoming::Text(text.into()))
    }

    /// Deliver transport-level traffic that carries no text
    pub fn send_activity(&self) -> Result<(), mpsc::error::SendError<Incoming>> {
        self.frames.send(Incoming::Activity)
    }
}

/// Test side of one mock push channel
pub struct MockPeer {
    /// Frames delivered to the client. Dropping this closes the channel.
    pub frames: mpsc::UnboundedSender<Incoming>,
    /// Frames the client sent (heartbeats)
    pub sent: mpsc::UnboundedReceiver<String>,
}

struct MockStream {
    incoming: mpsc::UnboundedReceiver<Incoming>,
    outgoing: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl PushStream for MockStream {
    async fn recv(&mut self) -> Option<Result<Incoming, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        // The peer may already be gone; heartbeats are best effort here
        let _ = self.outgoing.send(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.incoming.close();
        Ok(())
    }
}

/// Connector that hands every opened channel to the test
pub struct MockConnector {
    attempts: AtomicUsize,
    fail: AtomicBool,
    hang: AtomicBool,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                hang: AtomicBool::new(false),
                peers_tx,
            }),
            peers_rx,
        )
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_hanging(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushStream>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("refused: {}", url)));
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let _ = self.peers_tx.send(MockPeer { frames: frames_tx, sent: sent_rx });
        Ok(Box::new(MockStream { incoming: frames_rx, outgoing: sent_tx }))
    }
}

/// Wait for the next opened mock channel
pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
    tokio::time::timeout(Duration::from_secs(120), peers.recv())
        .await
        .expect("Timed out waiting for a connection attempt")
        .expect("Connector dropped")
}

//------------------------------------------------------------------------------
// SCRIPTED CONVERSATION SOURCE
//------------------------------------------------------------------------------

/// Source that returns queued results, optionally gated by a semaphore.
/// With an empty queue it never resolves.
pub struct ScriptedSource {
    results: Mutex<VecDeque<Result<Vec<ConversationSummary>, LoadError>>>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(results: Vec<Result<Vec<ConversationSummary>, LoadError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into_iter().collect()),
            gate: None,
            calls: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Like `new`, but every load waits for a permit on the returned semaphore
    pub fn gated(results: Vec<Result<Vec<ConversationSummary>, LoadError>>) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(Self {
            results: Mutex::new(results.into_iter().collect()),
            gate: Some(gate.clone()),
            calls: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
        });
        (source, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// True once a load future was dropped before finishing
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct CancelFlag {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for CancelFlag {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ConversationSource for ScriptedSource {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = CancelFlag { flag: self.cancelled.clone(), armed: true };

        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }

        let next = self.results.lock().unwrap().pop_front();
        match next {
            Some(result) => {
                guard.armed = false;
                result
            }
            None => std::future::pending().await,
        }
    }
}

//------------------------------------------------------------------------------
// SNAPSHOT HELPERS
//------------------------------------------------------------------------------

pub async fn wait_for_snapshot<F>(rx: &mut watch::Receiver<InboxSnapshot>, predicate: F) -> InboxSnapshot
where
    F: FnMut(&InboxSnapshot) -> bool,
{
    let snapshot = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(predicate))
        .await
        .expect("Timed out waiting for inbox snapshot")
        .expect("Inbox stopped while waiting");
    snapshot.clone()
}

/// Let every spawned task run until it blocks
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

//------------------------------------------------------------------------------
// LOCAL WEBSOCKET SERVER
//------------------------------------------------------------------------------

/// A push server accepting one client at a time on 127.0.0.1
pub struct PushServer {
    pub base_url: String,
    /// Request paths of accepted clients, in order
    pub paths: mpsc::UnboundedReceiver<String>,
    /// Frames to send to the current client
    pub frames: mpsc::UnboundedSender<String>,
    /// Text frames received from clients
    pub received: mpsc::UnboundedReceiver<String>,
}

pub async fn spawn_push_server() -> PushServer {
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind push server");
    let addr = listener.local_addr().expect("local addr");
    let (paths_tx, paths_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel::<String>();
    let (received_tx, received_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let frames_rx = Arc::new(tokio::sync::Mutex::new(frames_rx));
        while let Ok((tcp, _)) = listener.accept().await {
            let paths_tx = paths_tx.clone();
            let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let _ = paths_tx.send(request.uri().path().to_string());
                Ok(response)
            };
            let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                continue;
            };
            let (mut sink, mut stream) = ws.split();
            let mut frames = frames_rx.lock().await;
            loop {
                tokio::select! {
                    frame = frames.recv() => match frame {
                        Some(text) => {
                            if sink.send(WsMessage::text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => return,
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            let _ = received_tx.send(text.as_str().to_owned());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    },
                }
            }
        }
    });

    PushServer {
        base_url: format!("ws://{}/ws", addr),
        paths: paths_rx,
        frames: frames_tx,
        received: received_rx,
    }
}
