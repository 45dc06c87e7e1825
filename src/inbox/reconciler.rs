// Conversation list reconciliation for Parley
// Keeps the ordered conversation list in sync with the bulk load and push events

use log::{debug, info};

use crate::inbox::events::MessageEvent;
use crate::inbox::phone::normalize_phone;
use crate::models::{Conversation, ConversationSummary, Direction};

/// What applying one push event did to the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// An existing conversation was updated and moved to the front
    Updated { previous_index: usize },
    /// A new conversation was inserted at the front
    Inserted,
    /// The event left the list untouched
    Dropped,
}

/// Ordered, most-recent-first list of conversations with per-conversation
/// unread counters.
///
/// The reconciler has no interior locking. It expects a single owner that
/// feeds it the bulk load, push events and selection changes one at a time;
/// inside Parley that owner is the inbox driver task.
#[derive(Debug, Default)]
pub struct ConversationReconciler {
    conversations: Vec<Conversation>,
    selected: Option<String>,
}

impl ConversationReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list with the result of a bulk load.
    ///
    /// Order is taken from the listing. Rows whose phone normalizes to the
    /// same key collapse onto the first occurrence, and rows without a usable
    /// phone are skipped.
    pub fn replace_all(&mut self, summaries: Vec<ConversationSummary>) {
        let mut conversations: Vec<Conversation> = Vec::with_capacity(summaries.len());

        for summary in summaries {
            let Some(phone) = normalize_phone(&summary.phone) else {
                debug!("Skipping listed conversation without a phone: {:?}", summary);
                continue;
            };
            if conversations.iter().any(|c| c.phone == phone) {
                debug!("Skipping duplicate listed conversation for {}", phone);
                continue;
            }

            let display_name = summary
                .name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| phone.clone());

            conversations.push(Conversation {
                phone,
                display_name,
                last_message_text: summary.last_message.unwrap_or_default(),
                last_message_timestamp: summary.last_timestamp.unwrap_or_default(),
                message_count: summary.message_count,
                last_direction: summary.direction,
                unread_count: 0,
            });
        }

        info!("Conversation list replaced with {} entries", conversations.len());
        self.conversations = conversations;
    }

    /// Apply one push event.
    pub fn apply(&mut self, event: &MessageEvent) -> ApplyOutcome {
        let Some(phone) = event.phone_key() else {
            debug!("Ignoring push event without a phone");
            return ApplyOutcome::Dropped;
        };
        let direction = event.direction();
        let is_selected = self.selected.as_deref() == Some(phone.as_str());

        let outcome = match self.position(&phone) {
            Some(index) => {
                let mut conversation = self.conversations.remove(index);
                if let Some(name) = event.display_name() {
                    conversation.display_name = name.to_string();
                }
                conversation.last_message_text = event.message.text.clone();
                conversation.last_message_timestamp = event.message.timestamp.clone();
                conversation.last_direction = direction;
                conversation.message_count += 1;
                self.conversations.insert(0, conversation);
                ApplyOutcome::Updated { previous_index: index }
            }
            None if event.is_known_contact() => {
                debug!(
                    "Dropping event for {}: contact is known server-side but not listed locally",
                    phone
                );
                return ApplyOutcome::Dropped;
            }
            None => {
                let display_name = event
                    .display_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| phone.clone());
                self.conversations.insert(
                    0,
                    Conversation {
                        phone: phone.clone(),
                        display_name,
                        last_message_text: event.message.text.clone(),
                        last_message_timestamp: event.message.timestamp.clone(),
                        message_count: 1,
                        last_direction: direction,
                        unread_count: 0,
                    },
                );
                ApplyOutcome::Inserted
            }
        };

        // Position 0 is the conversation we just touched
        let front = &mut self.conversations[0];
        if is_selected {
            front.unread_count = 0;
        } else if direction == Direction::Incoming {
            front.unread_count += 1;
        }

        outcome
    }

    /// Mark a conversation as the active one and clear its unread counter.
    ///
    /// The selection is remembered even when the phone is not listed yet, so
    /// messages arriving for it later are counted as read. Returns whether the
    /// conversation is currently in the list.
    pub fn select(&mut self, phone: &str) -> bool {
        let Some(key) = normalize_phone(phone) else {
            self.selected = None;
            return false;
        };

        let found = match self.position(&key) {
            Some(index) => {
                self.conversations[index].unread_count = 0;
                true
            }
            None => false,
        };
        self.selected = Some(key);
        found
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
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

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.conversations.iter().position(|c| c.phone == key)
    }
}
