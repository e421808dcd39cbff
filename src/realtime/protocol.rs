//! Phoenix channel frames used by the realtime change feed.
//!
//! Every frame is a JSON object `{topic, event, payload, ref, join_ref}`.
//! Row inserts arrive as `postgres_changes` events whose payload carries
//! `data.record` with the inserted row.

use serde::{Deserialize, Serialize};

use crate::api::rows::MessageRow;
use crate::api::InsertFilter;
use crate::models::{Message, MessageEvent};

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_CHANGES: &str = "postgres_changes";

const MESSAGES_TABLE: &str = "messages";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    /// `phx_join` for `topic` with one INSERT binding per filter column.
    pub fn join(topic: &str, filter: &InsertFilter, access_token: &str, reference: u64) -> Self {
        let bindings: Vec<serde_json::Value> = filter
            .any_of
            .iter()
            .map(|(column, value)| {
                serde_json::json!({
                    "event": "INSERT",
                    "schema": "public",
                    "table": MESSAGES_TABLE,
                    "filter": format!("{}=eq.{}", column, value),
                })
            })
            .collect();

        Self {
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload: serde_json::json!({
                "config": {
                    "broadcast": { "self": false, "ack": false },
                    "presence": { "key": "" },
                    "postgres_changes": bindings,
                },
                "access_token": access_token,
            }),
            reference: Some(reference.to_string()),
            join_ref: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: u64) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: serde_json::json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    pub fn leave(topic: &str, reference: u64) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: serde_json::json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    /// Status of a `phx_reply` (`"ok"` / `"error"`), if this is one.
    pub fn reply_status(&self) -> Option<&str> {
        if self.event != EVENT_REPLY {
            return None;
        }
        self.payload.get("status").and_then(|s| s.as_str())
    }

    /// Whether the server tore the channel down.
    pub fn is_channel_failure(&self) -> bool {
        self.event == EVENT_ERROR || self.event == EVENT_CLOSE
    }

    /// Decode an inserted `messages` row carried by a `postgres_changes` frame.
    pub fn message_event(&self) -> Option<MessageEvent> {
        if self.event != EVENT_CHANGES {
            return None;
        }
        let data = self.payload.get("data")?;
        if data.get("type").and_then(|t| t.as_str()) != Some("INSERT") {
            return None;
        }
        if data.get("table").and_then(|t| t.as_str()) != Some(MESSAGES_TABLE) {
            return None;
        }
        let record = data.get("record")?.clone();
        match serde_json::from_value::<MessageRow>(record) {
            Ok(row) => Some(MessageEvent::Insert(Message::from(row))),
            Err(e) => {
                tracing::warn!("Dropping malformed realtime record: {}", e);
                None
            }
        }
    }

    pub fn encode(&self) -> String {
        // Serializing a struct of strings and JSON values cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_has_binding_per_filter() {
        let frame = Frame::join("realtime:messages-u1", &InsertFilter::participant("u1"), "jwt", 1);
        let bindings = frame.payload["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0]["filter"], "receiver_id=eq.u1");
        assert_eq!(bindings[1]["filter"], "sender_id=eq.u1");
        assert_eq!(frame.payload["access_token"], "jwt");

        let text = frame.encode();
        assert!(text.contains("\"ref\":\"1\""));
        assert_eq!(Frame::decode(&text), Some(frame));
    }

    #[test]
    fn test_decode_insert_event() {
        let text = r#"{
            "topic": "realtime:messages-u1",
            "event": "postgres_changes",
            "ref": null,
            "payload": {
                "data": {
                    "type": "INSERT",
                    "schema": "public",
                    "table": "messages",
                    "commit_timestamp": "2024-05-01T10:00:00Z",
                    "record": {
                        "id": "m9",
                        "sender_id": "u2",
                        "receiver_id": "u1",
                        "content": "yo",
                        "type": "text",
                        "created_at": "2024-05-01T10:00:00.123456+00:00",
                        "read": false
                    }
                },
                "ids": [1]
            }
        }"#;
        let frame = Frame::decode(text).unwrap();
        let MessageEvent::Insert(msg) = frame.message_event().unwrap();
        assert_eq!(msg.id, "m9");
        assert!(msg.sender_profile.is_placeholder());
        assert!(msg.is_addressed_to("u1"));
    }

    #[test]
    fn test_reply_status_and_failures() {
        let reply = Frame::decode(
            r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"2"}"#,
        )
        .unwrap();
        assert_eq!(reply.reply_status(), Some("ok"));
        assert!(reply.message_event().is_none());

        let err = Frame::decode(r#"{"topic":"t","event":"phx_error","payload":{},"ref":null}"#)
            .unwrap();
        assert!(err.is_channel_failure());
        assert_eq!(err.reply_status(), None);
    }
}
