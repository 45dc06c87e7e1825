// Push connection management for Parley
// Contains the connect/reconnect loop, heartbeat and liveness handling

use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::inbox::events::{MessageEvent, PushFrame, PING_FRAME};
use crate::inbox::transport::{Connector, Incoming, PushStream, TransportError};
use crate::models::ConnectionState;

/// How long `stop` waits for the connection task before aborting it
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Push connection was already started")]
    AlreadyStarted,
}

/// Delay schedule between reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Same delay after every failure, no retry cap
    Fixed(Duration),
    /// `base * 2^(attempt - 1)` capped at `max`, optionally jittered
    Backoff {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(Duration::from_secs(3))
    }
}

impl ReconnectPolicy {
    /// Capped exponential backoff starting at 1s and capped at 60s, with jitter
    pub fn exponential() -> Self {
        ReconnectPolicy::Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            ReconnectPolicy::Fixed(delay) => *delay,
            ReconnectPolicy::Backoff { base, max, jitter } => {
                let base_ms = base.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                let shift = attempt.saturating_sub(1);
                let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
                let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

                if *jitter && delay_ms > 1 {
                    // Equal jitter: keep half, randomize the other half
                    let half = delay_ms / 2;
                    let spread = rand::thread_rng().gen_range(0..=delay_ms - half);
                    Duration::from_millis(half + spread)
                } else {
                    Duration::from_millis(delay_ms)
                }
            }
        }
    }
}

/// Tunables for the push connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

/// Why a single open session ended
enum SessionEnd {
    Stopped,
    Dropped,
    Failed(TransportError),
}

/// Persistent push channel with an explicit `start`/`stop` lifecycle.
///
/// Once started, the connection keeps itself open until `stop` is called:
/// every unexpected close schedules a reconnect according to the configured
/// policy. Decoded message events are delivered on the receiver returned by
/// `start`; pings and malformed frames never leave this module.
pub struct PushConnection {
    url: String,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    stopping_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    started: bool,
}

impl PushConnection {
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (stopping_tx, _) = watch::channel(false);
        Self {
            url: url.into(),
            connector,
            config,
            state_tx,
            stopping_tx,
            task: None,
            started: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping_tx.borrow()
    }

    /// Spawn the connection task. Can only be called once per connection.
    pub fn start(&mut self) -> Result<mpsc::Receiver<MessageEvent>, ConnectionError> {
        if self.started {
            return Err(ConnectionError::AlreadyStarted);
        }
        self.started = true;

        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let worker = ConnectionWorker {
            url: self.url.clone(),
            connector: self.connector.clone(),
            config: self.config.clone(),
            state_tx: self.state_tx.clone(),
            stopping: self.stopping_tx.subscribe(),
            events_tx,
        };

        info!("Starting push connection to {}", self.url);
        self.task = Some(tokio::spawn(worker.run()));
        Ok(events_rx)
    }

    /// Stop the connection for good.
    ///
    /// The stopping flag is raised before the socket is closed, so a pending
    /// reconnect timer or an in-flight connect attempt never opens a new
    /// channel afterwards.
    pub async fn stop(&mut self) {
        self.stopping_tx.send_replace(true);

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
                Ok(Ok(())) => debug!("Push connection task finished"),
                Ok(Err(e)) => error!("Push connection task failed: {}", e),
                Err(_) => {
                    warn!("Push connection task did not stop within {:?}, aborting", STOP_TIMEOUT);
                    task.abort();
                }
            }
        }
        self.state_tx.send_replace(ConnectionState::Closed);
    }
}

impl Drop for PushConnection {
    fn drop(&mut self) {
        self.stopping_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct ConnectionWorker {
    url: String,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    stopping: watch::Receiver<bool>,
    events_tx: mpsc::Sender<MessageEvent>,
}

impl ConnectionWorker {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            if *self.stopping.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let attempt = tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stopping) => break,
                result = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&self.url)) => {
                    result.unwrap_or(Err(TransportError::Timeout))
                }
            };

            match attempt {
                Ok(stream) => {
                    info!("Push connection open: {}", self.url);
                    failures = 0;
                    self.set_state(ConnectionState::Open);
                    match self.pump(stream).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Dropped => warn!("Push connection closed by peer"),
                        SessionEnd::Failed(e) => {
                            error!("Push connection failed: {}", e);
                            self.set_state(ConnectionState::Error);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to open push connection to {}: {}", self.url, e);
                    self.set_state(ConnectionState::Error);
                }
            }

            self.set_state(ConnectionState::Closed);
            failures = failures.saturating_add(1);
            let delay = self.config.reconnect.delay_for(failures);
            info!("Reconnecting push connection in {:?} (attempt {})", delay, failures);

            tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stopping) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("Push connection task exiting");
        self.set_state(ConnectionState::Closed);
    }

    /// Drive one open session until it ends
    async fn pump(&mut self, mut stream: Box<dyn PushStream>) -> SessionEnd {
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut last_seen = Instant::now();

        let end = loop {
            let idle_deadline = last_seen + self.config.idle_timeout;

            tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stopping) => break SessionEnd::Stopped,
                frame = stream.recv() => match frame {
                    Some(Ok(Incoming::Text(text))) => {
                        last_seen = Instant::now();
                        if !self.dispatch(&text).await {
                            break SessionEnd::Stopped;
                        }
                    }
                    Some(Ok(Incoming::Activity)) => last_seen = Instant::now(),
                    Some(Err(e)) => break SessionEnd::Failed(e),
                    None => break SessionEnd::Dropped,
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = stream.send(PING_FRAME.to_string()).await {
                        break SessionEnd::Failed(e);
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    break SessionEnd::Failed(TransportError::Idle(self.config.idle_timeout));
                }
            }
        };

        if let Err(e) = stream.close().await {
            debug!("Error closing push channel: {}", e);
        }
        end
    }

    /// Decode and forward one frame. Returns false once nobody listens anymore
    /// or a stop was requested while waiting for room in the event channel.
    async fn dispatch(&mut self, text: &str) -> bool {
        match PushFrame::parse(text) {
            Ok(PushFrame::Ping) => {
                debug!("Received ping");
                true
            }
            Ok(PushFrame::Message(event)) => tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stopping) => false,
                sent = self.events_tx.send(event) => sent.is_ok(),
            },
            Ok(PushFrame::Other(name)) => {
                debug!("Ignoring push event '{}'", name);
                true
            }
            Err(e) => {
                warn!("Dropping malformed push frame: {}", e);
                true
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Push connection state {} -> {}", current, state);
                *current = state;
                true
            }
        });
    }
}

/// Resolves once the stopping flag is raised (or its sender is gone)
async fn wait_for_stop(stopping: &mut watch::Receiver<bool>) {
    let _ = stopping.wait_for(|stopping| *stopping).await;
}
