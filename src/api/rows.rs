//! Row shapes of the `messages` relation and the summary procedure.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::{
    ConversationKey, ConversationSummary, DeliveryState, LastMessage, Message, MessageKind,
    SenderProfile,
};

/// Columns requested for message reads, with the sender profile embedded.
pub const MESSAGE_SELECT: &str =
    "id,sender_id,receiver_id,content,type,created_at,read,sender:profiles!messages_sender_id_fkey(username,avatar_url)";

#[derive(Debug, Deserialize)]
pub struct ProfileRow {
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

impl From<ProfileRow> for SenderProfile {
    fn from(row: ProfileRow) -> Self {
        match row.username {
            Some(username) if !username.trim().is_empty() => SenderProfile {
                username,
                avatar_url: row.avatar_url,
            },
            _ => SenderProfile {
                avatar_url: row.avatar_url,
                ..SenderProfile::placeholder()
            },
        }
    }
}

/// A `messages` row as returned by REST reads and realtime payloads.
#[derive(Debug, Deserialize)]
pub struct MessageRow {
    pub id: serde_json::Value,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<MessageKind>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: Option<bool>,
    #[serde(default)]
    pub sender: Option<ProfileRow>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        // ids may be uuid strings or bigint sequences depending on the schema
        let id = match row.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let read_flag = row.read.unwrap_or(false);
        Message {
            id,
            conversation_key: ConversationKey::between(&row.sender_id, &row.receiver_id),
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content.unwrap_or_default(),
            kind: row.kind.unwrap_or_default(),
            created_at: row.created_at,
            delivery_state: if read_flag {
                DeliveryState::Read
            } else {
                DeliveryState::Sent
            },
            read_flag,
            sender_profile: row.sender.map(SenderProfile::from).unwrap_or_default(),
        }
    }
}

/// Decode a JSON array of rows, skipping (and logging) rows that cannot be decoded
/// instead of failing the whole page.
pub fn decode_messages(rows: Vec<serde_json::Value>) -> Vec<Message> {
    rows.into_iter()
        .filter_map(|value| match serde_json::from_value::<MessageRow>(value) {
            Ok(row) => Some(Message::from(row)),
            Err(e) => {
                tracing::warn!("Skipping malformed message row: {}", e);
                None
            }
        })
        .collect()
}

/// A row of `get_conversation_summaries(p_user_id)`.
#[derive(Debug, Deserialize)]
pub struct SummaryRow {
    pub counterpart_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_type: Option<MessageKind>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: Option<i64>,
}

impl From<SummaryRow> for ConversationSummary {
    fn from(row: SummaryRow) -> Self {
        let last_message = row.last_message_at.map(|created_at| LastMessage {
            content: row.last_message.unwrap_or_default(),
            kind: row.last_message_type.unwrap_or_default(),
            created_at,
        });
        ConversationSummary {
            counterpart_id: row.counterpart_id,
            profile: SenderProfile::from(ProfileRow {
                username: row.username,
                avatar_url: row.avatar_url,
            }),
            last_message,
            unread_count: row
                .unread_count
                .unwrap_or(0)
                .clamp(0, i64::from(u32::MAX)) as u32,
        }
    }
}
