//! One signed-in user's chat state: engine, inbox and change feed.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{
    ChatError, ConversationCache, ConversationListProjector, EventOutcome, MessageStateEngine,
};
use crate::api::{InsertFilter, RemoteDataGateway, Subscription};
use crate::config::ChatSettings;
use crate::models::{Message, MessageEvent};

pub struct ChatSession {
    local_user: String,
    engine: MessageStateEngine,
    projector: ConversationListProjector,
    events: mpsc::UnboundedReceiver<MessageEvent>,
    subscription: Subscription,
}

impl ChatSession {
    /// Build the engine and projector for `local_user` and subscribe to every
    /// message they send or receive. The inbox is refreshed once up front;
    /// a failure there is logged and left to the next activity-driven refresh.
    pub async fn start(
        gateway: Arc<dyn RemoteDataGateway>,
        local_user: &str,
        settings: &ChatSettings,
    ) -> Result<Self, ChatError> {
        let projector =
            ConversationListProjector::new(Arc::clone(&gateway), settings.refresh_debounce());
        let engine = MessageStateEngine::new(
            Arc::clone(&gateway),
            ConversationCache::new(settings.cache_freshness()),
        )
        .with_page_size(settings.page_size)
        .with_projector(projector.clone());

        let (events_tx, events) = mpsc::unbounded_channel();
        let subscription = gateway
            .subscribe_to_message_inserts(InsertFilter::participant(local_user), events_tx)
            .await?;
        tracing::info!("Chat session started for {}", local_user);

        if let Err(e) = projector.refresh(local_user).await {
            tracing::warn!("Initial inbox refresh failed: {}", e);
        }

        Ok(Self {
            local_user: local_user.to_string(),
            engine,
            projector,
            events,
            subscription,
        })
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn engine(&self) -> &MessageStateEngine {
        &self.engine
    }

    pub fn projector(&self) -> &ConversationListProjector {
        &self.projector
    }

    /// Wait for the next change notification and apply it.
    ///
    /// Returns `None` once the feed has ended.
    pub async fn next_event(&mut self) -> Option<(Message, EventOutcome)> {
        let event = self.events.recv().await?;
        let message = event.message().clone();
        let outcome = self.engine.apply_realtime_event(event);
        Some((message, outcome))
    }

    /// Stop the feed and forget everything held for this user.
    pub fn sign_out(mut self) {
        self.subscription.cancel();
        self.engine.reset(true);
        self.projector.clear();
        tracing::info!("Chat session for {} signed out", self.local_user);
    }
}
