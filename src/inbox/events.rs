// Push event decoding for Parley
// Turns text frames from the push channel into typed events

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::inbox::phone::normalize_phone;
use crate::models::Direction;

/// Liveness frame sent by the server (and by us as a heartbeat)
pub const PING_FRAME: &str = "ping";

pub const EVENT_MESSAGE_INCOMING: &str = "message_incoming";
pub const EVENT_MESSAGE_OUTGOING: &str = "message_outgoing";

/// Errors raised while decoding a push frame
#[derive(Debug, Error)]
pub enum EventError {
    /// Frame was neither the ping literal nor valid JSON
    #[error("Invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Message event without a `data` object
    #[error("Event '{0}' has no data payload")]
    MissingData(String),

    /// Message event whose phone normalizes to nothing
    #[error("Event '{0}' carries no usable phone")]
    MissingPhone(String),
}

/// A decoded push frame
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    Ping,
    Message(MessageEvent),
    Other(String), // Event name we do not handle
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Contact descriptor nested in message events
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContactDescriptor {
    #[serde(default)]
    pub id: Option<Value>, // Numeric or string depending on the backend
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub is_new: Option<bool>,
    #[serde(default)]
    pub exists: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub direction: Option<Direction>,
}

/// One inbound or outbound chat message pushed by the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub contact: Option<ContactDescriptor>,
    pub message: EventMessage,
}

impl MessageEvent {
    /// Normalized conversation key, falling back to the contact's phone
    pub fn phone_key(&self) -> Option<String> {
        normalize_phone(&self.phone).or_else(|| {
            self.contact
                .as_ref()
                .and_then(|c| c.phone.as_deref())
                .and_then(normalize_phone)
        })
    }

    /// Display name carried by the event, if it is non-empty
    pub fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn direction(&self) -> Direction {
        self.message.direction.unwrap_or_default()
    }

    /// True only when the contact descriptor explicitly says `is_new: false`
    pub fn is_known_contact(&self) -> bool {
        matches!(
            self.contact.as_ref().and_then(|c| c.is_new),
            Some(false)
        )
    }
}

impl PushFrame {
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let trimmed = text.trim();
        if trimmed == PING_FRAME {
            return Ok(PushFrame::Ping);
        }

        let envelope: Envelope = serde_json::from_str(trimmed)?;
        let direction = match envelope.event.as_str() {
            EVENT_MESSAGE_INCOMING => Direction::Incoming,
            EVENT_MESSAGE_OUTGOING => Direction::Outgoing,
            _ => return Ok(PushFrame::Other(envelope.event)),
        };

        let data = envelope
            .data
            .ok_or_else(|| EventError::MissingData(envelope.event.clone()))?;
        let mut event: MessageEvent = serde_json::from_value(data)?;

        if event.phone_key().is_none() {
            return Err(EventError::MissingPhone(envelope.event));
        }
        // The payload direction wins; the event name is the fallback
        if event.message.direction.is_none() {
            event.message.direction = Some(direction);
        }

        Ok(PushFrame::Message(event))
    }
}
