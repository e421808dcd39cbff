//! Inbox projection: one summary per counterpart, most recent first.
//!
//! The server-side aggregation is authoritative. Local overlays only bridge
//! the gap until the next (debounced) refresh lands.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;

use super::ChatError;
use crate::api::RemoteDataGateway;
use crate::models::{ConversationSummary, LastMessage, Message};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Default)]
struct ProjectorState {
    local_user: Option<String>,
    summaries: Vec<ConversationSummary>,
    /// Sequence number handed to the next refresh
    next_seq: u64,
    /// Sequence number of the refresh whose result is displayed
    applied_seq: u64,
}

struct ProjectorInner {
    gateway: Arc<dyn RemoteDataGateway>,
    state: Mutex<ProjectorState>,
    activity_tx: mpsc::UnboundedSender<()>,
}

/// Cloneable handle; all clones share one summary list and one debounce worker.
#[derive(Clone)]
pub struct ConversationListProjector {
    inner: Arc<ProjectorInner>,
}

impl ConversationListProjector {
    /// Create the projector and spawn its debounce worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(gateway: Arc<dyn RemoteDataGateway>, debounce: Duration) -> Self {
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ProjectorInner {
            gateway,
            state: Mutex::new(ProjectorState::default()),
            activity_tx,
        });
        tokio::spawn(debounce_loop(Arc::downgrade(&inner), activity_rx, debounce));
        Self { inner }
    }

    fn state(&self) -> MutexGuard<'_, ProjectorState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-derive every summary from the server, replacing the cached list.
    ///
    /// On failure the previous list is left untouched.
    pub async fn refresh(&self, local_user: &str) -> Result<Vec<ConversationSummary>, ChatError> {
        let seq = {
            let mut state = self.state();
            state.local_user = Some(local_user.to_string());
            state.next_seq += 1;
            state.next_seq
        };

        let mut summaries = self
            .inner
            .gateway
            .fetch_conversation_summaries(local_user)
            .await?;
        sort_most_recent_first(&mut summaries);

        let mut state = self.state();
        if seq > state.applied_seq {
            state.applied_seq = seq;
            state.summaries = summaries;
            tracing::debug!("Inbox refreshed: {} conversations", state.summaries.len());
        } else {
            tracing::debug!("Dropping out-of-order inbox refresh #{}", seq);
        }
        Ok(state.summaries.clone())
    }

    /// Hint that messages arrived; schedules one debounced `refresh`.
    pub fn notify_message_activity(&self) {
        if self.inner.activity_tx.send(()).is_err() {
            tracing::error!("Projector worker gone -- activity hint dropped");
        }
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.state().summaries.clone()
    }

    pub fn summary(&self, counterpart: &str) -> Option<ConversationSummary> {
        self.state()
            .summaries
            .iter()
            .find(|s| s.counterpart_id == counterpart)
            .cloned()
    }

    pub fn unread_count(&self, counterpart: &str) -> u32 {
        self.summary(counterpart).map_or(0, |s| s.unread_count)
    }

    pub fn total_unread(&self) -> u32 {
        self.state().summaries.iter().map(|s| s.unread_count).sum()
    }

    /// Optimistically fold a new message into the summaries.
    ///
    /// No-op until the first refresh has established the local user.
    pub fn overlay_incoming(&self, message: &Message) {
        let mut state = self.state();
        let Some(local_user) = state.local_user.clone() else {
            return;
        };
        if message.sender_id != local_user && message.receiver_id != local_user {
            return;
        }
        let counterpart = message.counterpart_of(&local_user).to_string();
        let unread = message.is_addressed_to(&local_user) && !message.read_flag;

        let pos = match state
            .summaries
            .iter()
            .position(|s| s.counterpart_id == counterpart)
        {
            Some(pos) => pos,
            None => {
                let profile = if message.sender_id == counterpart {
                    message.sender_profile.clone()
                } else {
                    Default::default()
                };
                state.summaries.push(ConversationSummary {
                    counterpart_id: counterpart,
                    profile,
                    last_message: None,
                    unread_count: 0,
                });
                state.summaries.len() - 1
            }
        };

        let summary = &mut state.summaries[pos];
        if summary
            .last_activity()
            .map_or(true, |t| message.created_at >= t)
        {
            summary.last_message = Some(LastMessage {
                content: message.content.clone(),
                kind: message.kind,
                created_at: message.created_at,
            });
        }
        if unread {
            summary.unread_count += 1;
        }
        sort_most_recent_first(&mut state.summaries);
    }

    /// Optimistically clear the unread badge of `counterpart`.
    pub fn overlay_read(&self, counterpart: &str) {
        let mut state = self.state();
        if let Some(s) = state
            .summaries
            .iter_mut()
            .find(|s| s.counterpart_id == counterpart)
        {
            s.unread_count = 0;
        }
    }

    /// Forget everything (sign-out).
    pub fn clear(&self) {
        let mut state = self.state();
        state.local_user = None;
        state.summaries.clear();
        // results of refreshes already in flight must not resurrect the list
        state.applied_seq = state.next_seq;
    }
}

/// Most recent activity first; conversations without messages last.
fn sort_most_recent_first(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
}

/// Collapse bursts of activity hints into one refresh per debounce window.
async fn debounce_loop(
    inner: Weak<ProjectorInner>,
    mut activity_rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
) {
    while activity_rx.recv().await.is_some() {
        let window = time::sleep(debounce);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                more = activity_rx.recv() => {
                    if more.is_none() {
                        return;
                    }
                }
            }
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let projector = ConversationListProjector { inner };
        let local_user = projector.state().local_user.clone();
        match local_user {
            Some(user) => {
                if let Err(e) = projector.refresh(&user).await {
                    tracing::warn!("Debounced inbox refresh failed: {}", e);
                }
            }
            None => tracing::debug!("Activity before first inbox refresh, ignoring"),
        }
    }
}
