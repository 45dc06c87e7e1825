// Bulk conversation listing for Parley
// Contains the source seam used for the initial load and its HTTP client

use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::{header::AUTHORIZATION, Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::ConversationSummary;

pub const TENANT_HEADER: &str = "X-Tenant-Id";
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Errors raised by the bulk conversation load
#[derive(Debug, Error)]
pub enum LoadError {
    /// Request never produced a response
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("Server returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// Body did not match the expected listing shape
    #[error("Could not decode conversation list: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Produces the full conversation listing for the initial load
#[async_trait]
pub trait ConversationSource: Send + Sync {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, LoadError>;
}

/// Both listing shapes the backends return
#[derive(Deserialize)]
#[serde(untagged)]
enum ListingBody {
    Bare(Vec<ConversationSummary>),
    Wrapped { conversations: Vec<ConversationSummary> },
}

/// `GET {base_url}/conversations` scoped to one tenant
#[derive(Debug, Clone)]
pub struct HttpConversationSource {
    client: Client,
    base_url: String,
    tenant_id: String,
    token: Option<String>,
}

impl HttpConversationSource {
    pub fn new(base_url: &str, tenant_id: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tenant_id: tenant_id.to_string(),
            token,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/conversations", self.base_url)
    }
}

#[async_trait]
impl ConversationSource for HttpConversationSource {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, LoadError> {
        let url = self.endpoint();
        let request_id = Uuid::new_v4().to_string();
        debug!("Fetching conversations from {} (request {})", url, request_id);

        let mut request = self
            .client
            .get(&url)
            .header(TENANT_HEADER, &self.tenant_id)
            .header(REQUEST_ID_HEADER, &request_id);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            error!("Conversation listing failed ({}) for request {}: {}", status, request_id, body);
            return Err(LoadError::Status { status, body });
        }

        let conversations = match serde_json::from_str::<ListingBody>(&body)? {
            ListingBody::Bare(rows) => rows,
            ListingBody::Wrapped { conversations } => conversations,
        };
        info!("Fetched {} conversations (request {})", conversations.len(), request_id);
        Ok(conversations)
    }
}
