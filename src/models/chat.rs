//! Conversation summary models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageKind, SenderProfile};

/// Preview of the most recent message with a counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

/// One inbox row per counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub counterpart_id: String,
    pub profile: SenderProfile,
    pub last_message: Option<LastMessage>,
    /// Messages from the counterpart to the local user not yet read.
    pub unread_count: u32,
}

impl ConversationSummary {
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|m| m.created_at)
    }
}
