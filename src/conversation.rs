use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::protocol::{ChatMessage, ChatRole, WireMessage};

const TITLE_MAX_CHARS: usize = 50;

/// Metadata about a conversation
#[derive(Clone, Debug, Serialize)]
pub struct ConversationMetadata {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

impl ConversationMetadata {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: "New Conversation".to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
        }
    }
}

/// Append-only transcript shared by every turn of one conversation.
#[derive(Clone, Debug)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
    pub metadata: ConversationMetadata,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            metadata: ConversationMetadata::fresh(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        // Title comes from the first user message
        if self.messages.is_empty() && message.role == ChatRole::User {
            self.metadata.title = generate_title(&message.content);
        }

        self.messages.push(message);
        self.metadata.message_count = self.messages.len();
        self.metadata.updated_at = Utc::now();
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    /// Start over with a new id. Callers must hold no active turn.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.metadata = ConversationMetadata::fresh();
    }

    /// Messages in request order, ready to send.
    pub fn to_wire(&self) -> Vec<WireMessage> {
        self.messages.iter().map(ChatMessage::to_wire).collect()
    }
}

/// Generate a title from the first user message
pub fn generate_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    if trimmed.is_empty() {
        return "New Conversation".to_string();
    }

    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_string();
    }

    // Cut on a char boundary, then back off to the last word break.
    let cut = trimmed
        .char_indices()
        .nth(TITLE_MAX_CHARS)
        .map(|(idx, _)| idx)
        .unwrap_or(trimmed.len());
    let truncated = &trimmed[..cut];
    match truncated.rfind(' ') {
        Some(last_space) if last_space > 0 => format!("{}...", truncated[..last_space].trim_end()),
        _ => format!("{}...", truncated),
    }
}
