// Re-export needed modules for testing
pub mod models;
pub mod inbox;    // Conversation list, push connection and bulk load
pub mod session;  // Tenant and endpoint resolution

// Re-export main types for convenience
pub use models::*;
pub use inbox::{Inbox, InboxConfig, InboxSnapshot};  // Expose the Inbox directly

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_wire_format() {
        let incoming: Direction = serde_json::from_str("\"incoming\"").unwrap();
        let outgoing: Direction = serde_json::from_str("\"outgoing\"").unwrap();
        assert_eq!(incoming, Direction::Incoming);
        assert_eq!(outgoing, Direction::Outgoing);
        assert_eq!(Direction::default(), Direction::Incoming);
    }

    #[test]
    fn test_summary_defaults() {
        // Only the phone is mandatory in a listing row
        let summary: ConversationSummary = serde_json::from_str(r#"{"phone":"+91900"}"#).unwrap();
        assert_eq!(summary.name, None);
        assert_eq!(summary.last_message, None);
        assert_eq!(summary.message_count, 0);
        assert_eq!(summary.direction, Direction::Incoming);
    }

    #[test]
    fn test_summary_full_row() {
        let summary: ConversationSummary = serde_json::from_str(
            r#"{"phone":"+91900","name":"Asha","last_message":"hi",
                "last_timestamp":"2024-01-01T10:00:00Z","message_count":3,"direction":"outgoing"}"#,
        )
        .unwrap();
        assert_eq!(summary.name.as_deref(), Some("Asha"));
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.direction, Direction::Outgoing);
    }

    #[test]
    fn test_parsed_timestamp() {
        let mut conversation = Conversation {
            phone: "91900".to_string(),
            display_name: "Asha".to_string(),
            last_message_text: "hi".to_string(),
            last_message_timestamp: "2024-01-01T10:00:00Z".to_string(),
            message_count: 1,
            last_direction: Direction::Incoming,
            unread_count: 0,
        };
        let parsed = conversation.parsed_timestamp().expect("RFC 3339 timestamp");
        assert_eq!(parsed.timestamp(), 1704103200);

        conversation.last_message_timestamp = "yesterday".to_string();
        assert_eq!(conversation.parsed_timestamp(), None);
    }

    #[test]
    fn test_connection_state_labels() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }
}
