//! Message-related models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SenderProfile;

/// Prefix of client-assigned identifiers for messages not yet persisted.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Order-independent identifier for a pair of participants.
///
/// Canonical form: the two user ids sorted and joined with `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn between(a: &str, b: &str) -> Self {
        if a <= b {
            Self(format!("{}_{}", a, b))
        } else {
            Self(format!("{}_{}", b, a))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload kind. Non-text kinds carry a storage URL in `content`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    File,
}

impl MessageKind {
    /// Whether the payload is a binary asset that must be uploaded first.
    pub fn is_binary(self) -> bool {
        !matches!(self, MessageKind::Text)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::File => "file",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "video" => Ok(MessageKind::Video),
            "file" => Ok(MessageKind::File),
            other => Err(format!(
                "Unknown message kind: {}. Use: text, image, video, file",
                other
            )),
        }
    }
}

/// Delivery lifecycle of a message.
///
/// `Pending` exists only for client-origin messages awaiting the insert.
/// `Delivered` is synonymous with `Sent`: the backend has no delivery receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryState {
    /// Move to `next` if that is a legal transition, returning the resulting state.
    ///
    /// Forward moves along pending -> sent -> delivered -> read are allowed,
    /// as are pending -> failed and failed -> pending (retry). Anything else
    /// leaves the state untouched.
    pub fn advance(self, next: DeliveryState) -> DeliveryState {
        use DeliveryState::*;
        match (self, next) {
            (Pending, Failed) | (Failed, Pending) => next,
            (Failed, _) | (_, Failed) => self,
            (current, next) if next > current => next,
            _ => self,
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_key: ConversationKey,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    pub read_flag: bool,
    pub sender_profile: SenderProfile,
}

impl Message {
    /// Build an optimistic, client-origin message with a temporary id.
    pub fn pending(new: &NewMessage, created_at: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4()),
            conversation_key: ConversationKey::between(&new.sender_id, &new.receiver_id),
            sender_id: new.sender_id.clone(),
            receiver_id: new.receiver_id.clone(),
            content: new.content.clone(),
            kind: new.kind,
            created_at,
            delivery_state: DeliveryState::Pending,
            read_flag: false,
            sender_profile: SenderProfile::placeholder(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    pub fn is_addressed_to(&self, user_id: &str) -> bool {
        self.receiver_id == user_id
    }

    /// The other participant, seen from `local_user`.
    pub fn counterpart_of(&self, local_user: &str) -> &str {
        if self.sender_id == local_user {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    /// Flag as read by the receiver.
    pub fn mark_read(&mut self) {
        self.read_flag = true;
        self.delivery_state = self.delivery_state.advance(DeliveryState::Read);
    }
}

/// Insert payload for a new message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

/// Realtime change notification delivered by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageEvent {
    Insert(Message),
}

impl MessageEvent {
    pub fn message(&self) -> &Message {
        match self {
            MessageEvent::Insert(m) => m,
        }
    }
}
