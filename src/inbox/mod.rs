// Live inbox for Parley
// This file serves as the entry point for the conversation inbox: it wires the
// bulk load, the push connection and the reconciler together behind a single
// writer task.

use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub mod api;
pub mod connection;
pub mod events;
pub mod phone;
pub mod reconciler;
pub mod transport;

pub use api::{ConversationSource, HttpConversationSource, LoadError};
pub use connection::{ConnectionConfig, PushConnection, ReconnectPolicy};
pub use events::{MessageEvent, PushFrame};
pub use phone::normalize_phone;
pub use reconciler::{ApplyOutcome, ConversationReconciler};
pub use transport::{Connector, WebSocketConnector};

use crate::models::{ConnectionState, Conversation, ConversationSummary, LoadState};

/// Default cap on events held back while the bulk load is pending
pub const DEFAULT_PENDING_EVENT_LIMIT: usize = 1024;

#[derive(Debug, Error)]
pub enum InboxError {
    /// Configuration cannot produce a usable inbox
    #[error("Invalid inbox configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Connection(#[from] connection::ConnectionError),

    /// The driver task is gone
    #[error("Inbox has been stopped")]
    Stopped,
}

/// Everything needed to run one tenant's inbox
#[derive(Debug, Clone)]
pub struct InboxConfig {
    pub tenant_id: String,
    pub api_base_url: String,
    pub push_base_url: String,
    pub token: Option<String>,
    pub connection: ConnectionConfig,
    pub pending_event_limit: usize,
}

impl InboxConfig {
    pub fn new(tenant_id: &str, api_base_url: &str, push_base_url: &str) -> Self {
        Self {
            tenant_id: tenant_id.trim().to_string(),
            api_base_url: api_base_url.trim().to_string(),
            push_base_url: push_base_url.trim().to_string(),
            token: None,
            connection: ConnectionConfig::default(),
            pending_event_limit: DEFAULT_PENDING_EVENT_LIMIT,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Push channel URL for this tenant: `{push_base_url}/{tenant_id}`
    pub fn push_url(&self) -> Result<String, InboxError> {
        if self.tenant_id.is_empty() {
            return Err(InboxError::Config("tenant id is required".to_string()));
        }
        if self.tenant_id.contains('/') {
            return Err(InboxError::Config(format!(
                "tenant id '{}' must be a single path segment",
                self.tenant_id
            )));
        }
        if self.push_base_url.is_empty() {
            return Err(InboxError::Config("push URL is required".to_string()));
        }
        Ok(format!(
            "{}/{}",
            self.push_base_url.trim_end_matches('/'),
            self.tenant_id
        ))
    }

    pub fn conversation_source(&self) -> HttpConversationSource {
        HttpConversationSource::new(&self.api_base_url, &self.tenant_id, self.token.clone())
    }
}

/// Read-only view of the inbox handed to the view layer
#[derive(Debug, Clone, PartialEq)]
pub struct InboxSnapshot {
    pub conversations: Vec<Conversation>, // Most recent first
    pub selected: Option<String>,
    pub load: LoadState,
    pub connection: ConnectionState,
}

impl InboxSnapshot {
    fn initial(connection: ConnectionState) -> Self {
        Self {
            conversations: Vec::new(),
            selected: None,
            load: LoadState::Loading,
            connection,
        }
    }

    pub fn get(&self, phone: &str) -> Option<&Conversation> {
        let key = normalize_phone(phone)?;
        self.conversations.iter().find(|c| c.phone == key)
    }

    pub fn unread_count(&self, phone: &str) -> u32 {
        self.get(phone).map(|c| c.unread_count).unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    pub fn selected_conversation(&self) -> Option<&Conversation> {
        self.selected.as_deref().and_then(|phone| self.get(phone))
    }
}

enum InboxCommand {
    Select(String, oneshot::Sender<bool>),
    RetryLoad(oneshot::Sender<bool>),
    Stop,
}

/// Handle to a running inbox.
///
/// All mutation happens on one driver task; this handle only sends commands
/// and reads published snapshots. Dropping the handle stops the driver.
pub struct Inbox {
    commands: mpsc::Sender<InboxCommand>,
    snapshot_rx: watch::Receiver<InboxSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl Inbox {
    /// Start loading conversations and connect the push channel.
    pub fn start(
        config: InboxConfig,
        source: Arc<dyn ConversationSource>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, InboxError> {
        let url = config.push_url()?;
        let mut connection = PushConnection::new(url, connector, config.connection.clone());
        let events_rx = connection.start()?;
        let state_rx = connection.subscribe_state();

        let (commands, commands_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(InboxSnapshot::initial(connection.state()));

        info!("Starting inbox for tenant {}", config.tenant_id);
        let driver = InboxDriver {
            reconciler: ConversationReconciler::new(),
            source,
            connection,
            events_rx,
            state_rx,
            commands_rx,
            snapshot_tx,
            load_state: LoadState::Loading,
            pending: VecDeque::new(),
            pending_limit: config.pending_event_limit.max(1),
        };

        Ok(Self {
            commands,
            snapshot_rx,
            task: Some(tokio::spawn(driver.run())),
        })
    }

    pub fn snapshot(&self) -> InboxSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InboxSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.snapshot_rx.borrow().conversations.clone()
    }

    pub fn unread_count(&self, phone: &str) -> u32 {
        self.snapshot_rx.borrow().unread_count(phone)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshot_rx.borrow().connection
    }

    pub fn load_state(&self) -> LoadState {
        self.snapshot_rx.borrow().load.clone()
    }

    /// Make `phone` the active conversation; its unread count drops to 0.
    /// Returns whether the conversation is listed.
    pub async fn select_conversation(&self, phone: &str) -> Result<bool, InboxError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(InboxCommand::Select(phone.to_string(), reply_tx))
            .await
            .map_err(|_| InboxError::Stopped)?;
        reply_rx.await.map_err(|_| InboxError::Stopped)
    }

    /// Re-run the bulk load after a failure. Returns whether a load was started.
    pub async fn retry_load(&self) -> Result<bool, InboxError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(InboxCommand::RetryLoad(reply_tx))
            .await
            .map_err(|_| InboxError::Stopped)?;
        reply_rx.await.map_err(|_| InboxError::Stopped)
    }

    /// Cancel any in-flight load, stop the push connection and end the driver.
    pub async fn stop(mut self) {
        if self.commands.send(InboxCommand::Stop).await.is_err() {
            debug!("Inbox driver already gone");
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Inbox driver task failed: {}", e);
            }
        }
    }
}

type LoadFuture = BoxFuture<'static, Result<Vec<ConversationSummary>, LoadError>>;

struct InboxDriver {
    reconciler: ConversationReconciler,
    source: Arc<dyn ConversationSource>,
    connection: PushConnection,
    events_rx: mpsc::Receiver<MessageEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    commands_rx: mpsc::Receiver<InboxCommand>,
    snapshot_tx: watch::Sender<InboxSnapshot>,
    load_state: LoadState,
    pending: VecDeque<MessageEvent>,
    pending_limit: usize,
}

impl InboxDriver {
    async fn run(mut self) {
        let mut load: Option<LoadFuture> = Some(self.begin_load());
        self.publish();

        loop {
            tokio::select! {
                result = poll_load(&mut load) => {
                    load = None;
                    self.finish_load(result);
                }
                Some(event) = self.events_rx.recv() => self.on_event(event),
                Ok(()) = self.state_rx.changed() => self.publish(),
                command = self.commands_rx.recv() => match command {
                    Some(InboxCommand::Select(phone, reply)) => {
                        let found = self.reconciler.select(&phone);
                        debug!("Selected conversation {} (listed: {})", phone, found);
                        self.publish();
                        let _ = reply.send(found);
                    }
                    Some(InboxCommand::RetryLoad(reply)) => {
                        let retrying = matches!(self.load_state, LoadState::Failed(_));
                        if retrying {
                            info!("Retrying conversation load");
                            load = Some(self.begin_load());
                            self.publish();
                        } else {
                            debug!("Ignoring retry, load state is {:?}", self.load_state);
                        }
                        let _ = reply.send(retrying);
                    }
                    Some(InboxCommand::Stop) | None => break,
                },
            }
        }

        // The loop no longer polls the load, so it cannot land while the socket closes
        self.connection.stop().await;
        drop(load);
        self.publish();
        info!("Inbox stopped");
    }

    fn begin_load(&mut self) -> LoadFuture {
        self.load_state = LoadState::Loading;
        let source = self.source.clone();
        Box::pin(async move { source.fetch_conversations().await })
    }

    fn finish_load(&mut self, result: Result<Vec<ConversationSummary>, LoadError>) {
        match result {
            Ok(summaries) => {
                self.reconciler.replace_all(summaries);
                self.load_state = LoadState::Ready;
                if self.reconciler.is_empty() && self.pending.is_empty() {
                    info!("No conversations yet, waiting for push events");
                }
                if !self.pending.is_empty() {
                    info!("Replaying {} events received during the load", self.pending.len());
                }
                while let Some(event) = self.pending.pop_front() {
                    self.reconciler.apply(&event);
                }
            }
            Err(e) => {
                error!("Conversation load failed: {}", e);
                self.load_state = LoadState::Failed(e.to_string());
            }
        }
        self.publish();
    }

    fn on_event(&mut self, event: MessageEvent) {
        if self.load_state != LoadState::Ready {
            if self.pending.len() >= self.pending_limit {
                warn!("Pending event buffer full, dropping oldest event");
                self.pending.pop_front();
            }
            self.pending.push_back(event);
            return;
        }

        let outcome = self.reconciler.apply(&event);
        debug!("Applied push event for {:?}: {:?}", event.phone_key(), outcome);
        if outcome != ApplyOutcome::Dropped {
            self.publish();
        }
    }

    fn publish(&self) {
        let snapshot = InboxSnapshot {
            conversations: self.reconciler.conversations().to_vec(),
            selected: self.reconciler.selected().map(str::to_string),
            load: self.load_state.clone(),
            connection: *self.state_rx.borrow(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

/// Resolves with the load result, or never when no load is running
async fn poll_load(load: &mut Option<LoadFuture>) -> Result<Vec<ConversationSummary>, LoadError> {
    match load {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}
