//! In-memory gateway used by unit tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{mpsc, Notify};

use super::gateway::{GatewayError, InsertFilter, MessagePage, RemoteDataGateway, Subscription};
use crate::models::{
    ConversationKey, ConversationSummary, DeliveryState, LastMessage, Message, MessageEvent,
    NewMessage, SenderProfile,
};

/// Emulates the `messages` relation, the summary procedure and the change feed.
#[derive(Default)]
pub struct FakeGateway {
    rows: Mutex<Vec<Message>>,
    profiles: Mutex<HashMap<String, SenderProfile>>,
    subscribers: Mutex<Vec<(InsertFilter, mpsc::UnboundedSender<MessageEvent>)>>,
    next_id: AtomicUsize,
    /// Rows the backend returns but the client cannot decode
    corrupt: Mutex<HashSet<String>>,
    pub fail_inserts: AtomicBool,
    pub fail_fetches: AtomicBool,
    pub fail_uploads: AtomicBool,
    pub fetch_calls: AtomicUsize,
    pub mark_read_calls: AtomicUsize,
    pub summary_calls: AtomicUsize,
    insert_gate: Mutex<Option<Arc<Notify>>>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fixed base instant so seeded history sorts deterministically before "now".
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_profile(&self, user: &str, username: &str) {
        lock(&self.profiles).insert(
            user.to_string(),
            SenderProfile {
                username: username.to_string(),
                avatar_url: Some(format!("https://cdn.test/{}.png", user)),
            },
        );
    }

    fn profile_of(&self, user: &str) -> SenderProfile {
        lock(&self.profiles).get(user).cloned().unwrap_or_default()
    }

    fn assign_id(&self) -> String {
        format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Insert a historical row `minutes` after the base time.
    pub fn seed(&self, sender: &str, receiver: &str, content: &str, minutes: i64) -> Message {
        let msg = Message {
            id: self.assign_id(),
            conversation_key: ConversationKey::between(sender, receiver),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: content.to_string(),
            kind: Default::default(),
            created_at: base_time() + Duration::minutes(minutes),
            delivery_state: DeliveryState::Sent,
            read_flag: false,
            sender_profile: self.profile_of(sender),
        };
        lock(&self.rows).push(msg.clone());
        msg
    }

    /// A server-origin row that is not persisted, for feeding realtime events directly.
    pub fn remote_row(&self, sender: &str, receiver: &str, content: &str, minutes: i64) -> Message {
        let msg = self.seed(sender, receiver, content, minutes);
        lock(&self.rows).retain(|m| m.id != msg.id);
        msg
    }

    /// Make a stored row undecodable: it still occupies its place in a page.
    pub fn corrupt(&self, id: &str) {
        lock(&self.corrupt).insert(id.to_string());
    }

    pub fn rows(&self) -> Vec<Message> {
        lock(&self.rows).clone()
    }

    /// Hold every insert open until the returned notifier fires.
    pub fn gate_inserts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.insert_gate) = Some(Arc::clone(&gate));
        gate
    }

    /// Hold every page fetch open until the returned notifier fires.
    pub fn gate_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.fetch_gate) = Some(Arc::clone(&gate));
        gate
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    fn broadcast(&self, msg: &Message) {
        for (filter, tx) in lock(&self.subscribers).iter() {
            if filter.matches(msg) {
                let _ = tx.send(MessageEvent::Insert(msg.clone()));
            }
        }
    }

    fn unavailable() -> GatewayError {
        GatewayError::Unavailable("simulated outage".to_string())
    }
}

#[async_trait]
impl RemoteDataGateway for FakeGateway {
    async fn fetch_messages_page(
        &self,
        user_a: &str,
        user_b: &str,
        offset: usize,
        limit: usize,
    ) -> Result<MessagePage, GatewayError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.fetch_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let key = ConversationKey::between(user_a, user_b);
        let mut rows: Vec<Message> = lock(&self.rows)
            .iter()
            .filter(|m| m.conversation_key == key)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        let window: Vec<Message> = rows.into_iter().skip(offset).take(limit).collect();
        let row_count = window.len();
        let corrupt = lock(&self.corrupt);
        Ok(MessagePage {
            messages: window
                .into_iter()
                .filter(|m| !corrupt.contains(&m.id))
                .collect(),
            row_count,
        })
    }

    async fn insert_message(&self, new: &NewMessage) -> Result<Message, GatewayError> {
        let gate = lock(&self.insert_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let msg = Message {
            id: self.assign_id(),
            conversation_key: ConversationKey::between(&new.sender_id, &new.receiver_id),
            sender_id: new.sender_id.clone(),
            receiver_id: new.receiver_id.clone(),
            content: new.content.clone(),
            kind: new.kind,
            created_at: Utc::now(),
            delivery_state: DeliveryState::Sent,
            read_flag: false,
            sender_profile: self.profile_of(&new.sender_id),
        };
        lock(&self.rows).push(msg.clone());
        self.broadcast(&msg);
        Ok(msg)
    }

    async fn mark_messages_read(
        &self,
        receiver_id: &str,
        sender_id: &str,
    ) -> Result<(), GatewayError> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        for m in lock(&self.rows).iter_mut() {
            if m.receiver_id == receiver_id && m.sender_id == sender_id && !m.read_flag {
                m.mark_read();
            }
        }
        Ok(())
    }

    async fn fetch_conversation_summaries(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, GatewayError> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let mut by_counterpart: HashMap<String, ConversationSummary> = HashMap::new();
        let rows = lock(&self.rows).clone();
        for m in rows
            .iter()
            .filter(|m| m.sender_id == user_id || m.receiver_id == user_id)
        {
            let counterpart = m.counterpart_of(user_id).to_string();
            let entry = by_counterpart
                .entry(counterpart.clone())
                .or_insert_with(|| ConversationSummary {
                    counterpart_id: counterpart.clone(),
                    profile: self.profile_of(&counterpart),
                    last_message: None,
                    unread_count: 0,
                });
            if entry.last_activity().map_or(true, |t| m.created_at >= t) {
                entry.last_message = Some(LastMessage {
                    content: m.content.clone(),
                    kind: m.kind,
                    created_at: m.created_at,
                });
            }
            if m.receiver_id == user_id && !m.read_flag {
                entry.unread_count += 1;
            }
        }
        Ok(by_counterpart.into_values().collect())
    }

    async fn subscribe_to_message_inserts(
        &self,
        filter: InsertFilter,
        events: mpsc::UnboundedSender<MessageEvent>,
    ) -> Result<Subscription, GatewayError> {
        lock(&self.subscribers).push((filter, events));
        let (subscription, _cancel_rx) = Subscription::detached();
        Ok(subscription)
    }

    async fn upload_binary_asset(&self, local_path: &Path) -> Result<String, GatewayError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("blob");
        Ok(format!("https://storage.test/chat-media/{}", name))
    }
}
