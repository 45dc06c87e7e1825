use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub phone: String,                  // Normalized key, no leading '+'
    pub display_name: String,
    pub last_message_text: String,
    pub last_message_timestamp: String, // As delivered (ISO-8601 or equivalent)
    pub message_count: u64,
    pub last_direction: Direction,
    pub unread_count: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Incoming,
    Outgoing,
}

/// One row of the bulk conversation listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_timestamp: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Error,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LoadState {
    Loading,
    Ready,
    Failed(String), // Reason shown to the user next to the retry hint
}

impl Conversation {
    /// Timestamp parsed as RFC 3339 when possible, used for display only
    pub fn parsed_timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::parse_from_rfc3339(&self.last_message_timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&chrono::Utc))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}
