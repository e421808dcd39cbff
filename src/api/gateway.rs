//! The narrow interface the chat core consumes from the backend.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::models::{ConversationSummary, Message, MessageEvent, NewMessage};

/// Failures talking to the hosted backend.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("401 Unauthorized for {0}")]
    Unauthorized(String),
    #[error("HTTP {status} for {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("realtime channel error: {0}")]
    Realtime(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(_)
            | GatewayError::Realtime(_)
            | GatewayError::Unavailable(_) => true,
            GatewayError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// One page of history as returned by the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    /// Rows that decoded, ascending by creation time
    pub messages: Vec<Message>,
    /// Rows the backend returned, including any that failed to decode.
    /// Pagination advances by this count.
    pub row_count: usize,
}

/// Which inserted rows a subscription should receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertFilter {
    /// Column equality filters, e.g. `("receiver_id", user)`. A row matching
    /// any of them is delivered.
    pub any_of: Vec<(String, String)>,
}

impl InsertFilter {
    /// Rows the user sent or received.
    pub fn participant(user_id: &str) -> Self {
        Self {
            any_of: vec![
                ("receiver_id".to_string(), user_id.to_string()),
                ("sender_id".to_string(), user_id.to_string()),
            ],
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.any_of.iter().any(|(column, value)| match column.as_str() {
            "receiver_id" => &message.receiver_id == value,
            "sender_id" => &message.sender_id == value,
            _ => false,
        })
    }
}

/// Handle to a running change-feed subscription.
pub struct Subscription {
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a task that watches `cancel_rx` and stops once it flips to true.
    pub fn new(cancel_tx: watch::Sender<bool>, task: Option<JoinHandle<()>>) -> Self {
        Self { cancel_tx, task }
    }

    /// A subscription whose delivery is driven by something other than a task.
    pub fn detached() -> (Self, watch::Receiver<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (Self::new(cancel_tx, None), cancel_rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Stop delivering events. Idempotent.
    pub fn cancel(&mut self) {
        let _ = self.cancel_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Backend operations used by the chat core.
#[async_trait]
pub trait RemoteDataGateway: Send + Sync {
    /// One page of messages between two users, ascending by creation time.
    async fn fetch_messages_page(
        &self,
        user_a: &str,
        user_b: &str,
        offset: usize,
        limit: usize,
    ) -> Result<MessagePage, GatewayError>;

    /// Persist a message; the server assigns `id` and `created_at`.
    async fn insert_message(&self, new: &NewMessage) -> Result<Message, GatewayError>;

    /// Mark every unread message from `sender_id` to `receiver_id` as read.
    async fn mark_messages_read(&self, receiver_id: &str, sender_id: &str)
        -> Result<(), GatewayError>;

    /// Server-side aggregated inbox rows for `user_id`.
    async fn fetch_conversation_summaries(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, GatewayError>;

    /// Push every inserted row matching `filter` onto `events`, in server order.
    async fn subscribe_to_message_inserts(
        &self,
        filter: InsertFilter,
        events: mpsc::UnboundedSender<MessageEvent>,
    ) -> Result<Subscription, GatewayError>;

    /// Upload a local file and return its remote URL.
    async fn upload_binary_asset(&self, local_path: &Path) -> Result<String, GatewayError>;
}
