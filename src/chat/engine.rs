//! Message state engine: optimistic sends, paginated history, realtime
//! reconciliation and read tracking for the open conversations.
//!
//! State lives behind a mutex that is only ever held between suspension
//! points, so each mutation is atomic within one event-loop turn while
//! concurrent operations interleave only where they await the network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use super::{ChatError, ConversationCache, ConversationListProjector};
use crate::api::{GatewayError, MessagePage, RemoteDataGateway};
use crate::models::{ConversationKey, DeliveryState, Message, MessageEvent, MessageKind, NewMessage};

pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Server ids remembered for de-duplicating change notifications.
const RECENT_ID_CAPACITY: usize = 1024;

/// Result of a `load_history` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was merged into the conversation.
    Loaded { fetched: usize, has_more: bool },
    /// Another non-reset load for this conversation is in flight.
    AlreadyLoading,
    /// The conversation was closed or reloaded while this page was in flight.
    Discarded,
}

/// Result of applying one realtime event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Inserted into an open conversation.
    Applied,
    /// Already present by id.
    Duplicate,
    /// No open conversation for it. Folded into the cached list, if any,
    /// and passed on to the inbox.
    NotOpen,
}

#[derive(Debug)]
struct Conversation {
    local_user: String,
    counterpart: String,
    messages: Vec<Message>,
    /// Full pages consumed so far
    page_cursor: usize,
    has_more_data: bool,
    /// Ticket of the load whose result will be accepted
    loading: Option<u64>,
}

impl Conversation {
    fn new(local_user: &str, counterpart: &str, seed: Vec<Message>) -> Self {
        Self {
            local_user: local_user.to_string(),
            counterpart: counterpart.to_string(),
            messages: seed,
            page_cursor: 0,
            has_more_data: true,
            loading: None,
        }
    }
}

/// Bounded set of server ids already folded in; oldest evicted first.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    /// Record `id`. Returns false if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= RECENT_ID_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

#[derive(Debug)]
struct EngineState {
    conversations: HashMap<ConversationKey, Conversation>,
    cache: ConversationCache,
    recent: RecentIds,
    next_ticket: u64,
}

impl EngineState {
    /// Get the conversation, opening it (seeded from the cache) if needed.
    fn open(&mut self, local_user: &str, counterpart: &str) -> &mut Conversation {
        let key = ConversationKey::between(local_user, counterpart);
        let cache = &self.cache;
        self.conversations.entry(key).or_insert_with_key(|key| {
            let (cached, _) = cache.get(key);
            Conversation::new(local_user, counterpart, cached.to_vec())
        })
    }

    /// Mutate the list of `key` wherever it lives, keeping the cache in step.
    fn with_list(&mut self, key: &ConversationKey, f: impl FnOnce(&mut Vec<Message>)) {
        match self.conversations.get_mut(key) {
            Some(conv) => {
                f(&mut conv.messages);
                self.cache.put(key.clone(), conv.messages.clone());
            }
            None => self.cache.modify(key, f),
        }
    }

    /// Look a message up in the open conversations, then in the cache.
    fn find(&self, id: &str) -> Option<&Message> {
        self.conversations
            .values()
            .flat_map(|c| c.messages.iter())
            .find(|m| m.id == id)
            .or_else(|| self.cache.find(id))
    }
}

/// Single source of truth for messages of the open conversations.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageStateEngine {
    gateway: Arc<dyn RemoteDataGateway>,
    projector: Option<ConversationListProjector>,
    page_size: usize,
    state: Arc<Mutex<EngineState>>,
}

impl MessageStateEngine {
    pub fn new(gateway: Arc<dyn RemoteDataGateway>, cache: ConversationCache) -> Self {
        Self {
            gateway,
            projector: None,
            page_size: DEFAULT_PAGE_SIZE,
            state: Arc::new(Mutex::new(EngineState {
                conversations: HashMap::new(),
                cache,
                recent: RecentIds::default(),
                next_ticket: 1,
            })),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Route inbox hints and overlays to `projector`.
    pub fn with_projector(mut self, projector: ConversationListProjector) -> Self {
        self.projector = Some(projector);
        self
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Conversation lifecycle
    // -----------------------------------------------------------------------

    /// Mark a conversation as being viewed and return what the cache holds for it.
    pub fn open_conversation(
        &self,
        local_user: &str,
        counterpart: &str,
    ) -> Result<(Vec<Message>, bool), ChatError> {
        require_counterpart(counterpart)?;
        let mut state = self.state();
        let key = ConversationKey::between(local_user, counterpart);
        let (_, fresh) = state.cache.get(&key);
        let messages = state.open(local_user, counterpart).messages.clone();
        Ok((messages, fresh))
    }

    /// Stop viewing a conversation. Pages still in flight for it are dropped on arrival.
    pub fn close_conversation(&self, key: &ConversationKey) {
        let mut state = self.state();
        if let Some(conv) = state.conversations.remove(key) {
            state.cache.put(key.clone(), conv.messages);
            tracing::debug!("Closed conversation {}", key);
        }
    }

    pub fn is_open(&self, key: &ConversationKey) -> bool {
        self.state().conversations.contains_key(key)
    }

    pub fn messages(&self, key: &ConversationKey) -> Vec<Message> {
        self.state()
            .conversations
            .get(key)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn has_more_data(&self, key: &ConversationKey) -> bool {
        self.state()
            .conversations
            .get(key)
            .map_or(false, |c| c.has_more_data)
    }

    pub fn is_loading(&self, key: &ConversationKey) -> bool {
        self.state()
            .conversations
            .get(key)
            .map_or(false, |c| c.loading.is_some())
    }

    /// Cache lookup, for rendering before any load.
    pub fn cached(&self, key: &ConversationKey) -> (Vec<Message>, bool) {
        let state = self.state();
        let (messages, fresh) = state.cache.get(key);
        (messages.to_vec(), fresh)
    }

    /// Drop all in-memory conversations; the cache survives unless `clear_cache`.
    pub fn reset(&self, clear_cache: bool) {
        let mut state = self.state();
        state.conversations.clear();
        if clear_cache {
            state.cache.invalidate_all();
            state.recent.clear();
        }
        tracing::debug!("Engine reset (cache cleared: {})", clear_cache);
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Fetch the next page of history (or the first page again when `reset`).
    ///
    /// Unread messages addressed to `local_user` in the page are marked read
    /// remotely before the page becomes visible, and arrive already flagged.
    pub async fn load_history(
        &self,
        local_user: &str,
        counterpart: &str,
        reset: bool,
    ) -> Result<LoadOutcome, ChatError> {
        require_counterpart(counterpart)?;
        let key = ConversationKey::between(local_user, counterpart);

        let (ticket, offset) = {
            let mut state = self.state();
            let ticket = state.next_ticket;
            state.next_ticket += 1;

            let conv = state.open(local_user, counterpart);
            if conv.loading.is_some() && !reset {
                tracing::debug!("History load for {} already in flight", key);
                return Ok(LoadOutcome::AlreadyLoading);
            }
            conv.loading = Some(ticket);
            let offset = if reset { 0 } else { conv.page_cursor * self.page_size };
            (ticket, offset)
        };

        tracing::debug!("Loading history for {} (offset {}, reset {})", key, offset, reset);
        let MessagePage {
            messages: mut page,
            row_count,
        } = match self
            .gateway
            .fetch_messages_page(local_user, counterpart, offset, self.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                let mut state = self.state();
                if let Some(conv) = state.conversations.get_mut(&key) {
                    if conv.loading == Some(ticket) {
                        conv.loading = None;
                    }
                }
                return Err(e.into());
            }
        };

        if !self.is_current_load(&key, ticket) {
            tracing::debug!("Discarding stale history page for {}", key);
            return Ok(LoadOutcome::Discarded);
        }

        let has_unread = page
            .iter()
            .any(|m| is_unread_from(m, local_user, counterpart));
        let marked = has_unread
            && match self.gateway.mark_messages_read(local_user, counterpart).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Failed to mark {} as read: {}", key, e);
                    false
                }
            };

        // undecodable rows still count towards the page, or paging would stall
        let fetched = page.len();
        let has_more = row_count >= self.page_size;

        {
            let mut guard = self.state();
            let state = &mut *guard;
            let conv = match state.conversations.get_mut(&key) {
                Some(conv) if conv.loading == Some(ticket) => conv,
                _ => {
                    tracing::debug!("Discarding stale history page for {}", key);
                    return Ok(LoadOutcome::Discarded);
                }
            };
            conv.loading = None;

            if marked {
                for m in page.iter_mut().chain(conv.messages.iter_mut()) {
                    if is_unread_from(m, local_user, counterpart) {
                        m.mark_read();
                    }
                }
            }

            if reset {
                conv.messages = merge_reset(std::mem::take(&mut conv.messages), page);
                conv.page_cursor = 0;
            } else {
                for m in page {
                    upsert(&mut conv.messages, m);
                }
            }
            // a partial page is fetched again next time so newer rows are not skipped
            if has_more {
                conv.page_cursor += 1;
            }
            conv.has_more_data = has_more;
            fill_placeholder_profiles(&mut conv.messages);
            state.cache.put(key.clone(), conv.messages.clone());
        }

        if marked {
            if let Some(projector) = &self.projector {
                projector.overlay_read(counterpart);
            }
        }

        Ok(LoadOutcome::Loaded { fetched, has_more })
    }

    fn is_current_load(&self, key: &ConversationKey, ticket: u64) -> bool {
        self.state()
            .conversations
            .get(key)
            .map_or(false, |c| c.loading == Some(ticket))
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Optimistically append a message, persist it, and reconcile in place.
    ///
    /// For image/video/file kinds `content` is a local path that is uploaded
    /// first. On failure the entry stays in the list as `failed`.
    pub async fn send(
        &self,
        local_user: &str,
        counterpart: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        require_counterpart(counterpart)?;

        let new = NewMessage {
            sender_id: local_user.to_string(),
            receiver_id: counterpart.to_string(),
            content: content.to_string(),
            kind,
        };

        let pending = {
            let mut guard = self.state();
            let state = &mut *guard;
            let conv = state.open(local_user, counterpart);
            let mut pending = Message::pending(&new, provisional_timestamp(&conv.messages));
            if let Some(profile) = known_profile(&conv.messages, local_user) {
                pending.sender_profile = profile;
            }
            insert_ordered(&mut conv.messages, pending.clone());
            let key = pending.conversation_key.clone();
            let snapshot = conv.messages.clone();
            state.cache.put(key, snapshot);
            pending
        };
        tracing::debug!("Queued {} for {}", pending.id, counterpart);

        self.persist(pending).await
    }

    /// Re-issue a `failed` message.
    pub async fn retry_send(&self, temp_id: &str) -> Result<Message, ChatError> {
        let pending = {
            let mut state = self.state();
            let msg = state
                .find(temp_id)
                .cloned()
                .ok_or_else(|| ChatError::UnknownMessage(temp_id.to_string()))?;
            if msg.delivery_state != DeliveryState::Failed {
                return Err(ChatError::NotFailed(temp_id.to_string()));
            }
            let key = msg.conversation_key.clone();
            state.with_list(&key, |list| {
                if let Some(m) = list.iter_mut().find(|m| m.id == temp_id) {
                    m.delivery_state = m.delivery_state.advance(DeliveryState::Pending);
                }
            });
            Message {
                delivery_state: DeliveryState::Pending,
                ..msg
            }
        };
        tracing::info!("Retrying {}", temp_id);
        self.persist(pending).await
    }

    /// Remove a `failed` message the caller chose not to retry.
    pub fn discard_failed(&self, temp_id: &str) -> Result<(), ChatError> {
        let mut state = self.state();
        let msg = state
            .find(temp_id)
            .cloned()
            .ok_or_else(|| ChatError::UnknownMessage(temp_id.to_string()))?;
        if msg.delivery_state != DeliveryState::Failed {
            return Err(ChatError::NotFailed(temp_id.to_string()));
        }
        state.with_list(&msg.conversation_key, |list| list.retain(|m| m.id != temp_id));
        Ok(())
    }

    async fn persist(&self, pending: Message) -> Result<Message, ChatError> {
        let key = pending.conversation_key.clone();
        let temp_id = pending.id.clone();
        let mut new = NewMessage {
            sender_id: pending.sender_id.clone(),
            receiver_id: pending.receiver_id.clone(),
            content: pending.content.clone(),
            kind: pending.kind,
        };

        if new.kind.is_binary() && !is_remote_url(&new.content) {
            let url = match self
                .gateway
                .upload_binary_asset(Path::new(&new.content))
                .await
            {
                Ok(url) => url,
                Err(e) => return Err(self.fail_send(&key, &temp_id, e)),
            };
            // a retry after a failed insert must not upload again
            self.state().with_list(&key, |list| {
                if let Some(m) = list.iter_mut().find(|m| m.id == temp_id) {
                    m.content = url.clone();
                }
            });
            new.content = url;
        }

        let persisted = match self.gateway.insert_message(&new).await {
            Ok(persisted) => persisted,
            Err(e) => return Err(self.fail_send(&key, &temp_id, e)),
        };
        tracing::debug!("{} persisted as {}", temp_id, persisted.id);

        let reconciled = persisted.clone();
        {
            let mut state = self.state();
            state.recent.insert(&persisted.id);
            state.with_list(&key, |list| replace_temporary(list, &temp_id, reconciled));
        }

        if let Some(projector) = &self.projector {
            projector.overlay_incoming(&persisted);
            projector.notify_message_activity();
        }
        Ok(persisted)
    }

    fn fail_send(&self, key: &ConversationKey, temp_id: &str, source: GatewayError) -> ChatError {
        tracing::warn!("Send of {} failed: {}", temp_id, source);
        self.state().with_list(key, |list| {
            if let Some(m) = list.iter_mut().find(|m| m.id == temp_id) {
                m.delivery_state = m.delivery_state.advance(DeliveryState::Failed);
            }
        });
        ChatError::SendFailed {
            temp_id: temp_id.to_string(),
            source,
        }
    }

    // -----------------------------------------------------------------------
    // Realtime and read state
    // -----------------------------------------------------------------------

    /// Apply one change notification. Idempotent by message id.
    ///
    /// An unread message landing in an open conversation is marked read at
    /// once; the remote update runs on a spawned task, so this must be called
    /// from within a Tokio runtime.
    pub fn apply_realtime_event(&self, event: MessageEvent) -> EventOutcome {
        let MessageEvent::Insert(mut msg) = event;
        let mut mark_remote: Option<(String, String)> = None;

        let outcome = {
            let mut guard = self.state();
            let state = &mut *guard;
            let first_seen = state.recent.insert(&msg.id);
            match state.conversations.get_mut(&msg.conversation_key) {
                Some(conv) => {
                    if conv.messages.iter().any(|m| m.id == msg.id) {
                        EventOutcome::Duplicate
                    } else {
                        if msg.sender_profile.is_placeholder() {
                            if let Some(p) = known_profile(&conv.messages, &msg.sender_id) {
                                msg.sender_profile = p;
                            }
                        }
                        if msg.is_addressed_to(&conv.local_user) && !msg.read_flag {
                            msg.mark_read();
                            mark_remote = Some((conv.local_user.clone(), conv.counterpart.clone()));
                        }
                        insert_ordered(&mut conv.messages, msg.clone());
                        state
                            .cache
                            .put(msg.conversation_key.clone(), conv.messages.clone());
                        EventOutcome::Applied
                    }
                }
                None => {
                    let key = msg.conversation_key.clone();
                    let (cached, _) = state.cache.get(&key);
                    if !first_seen || cached.iter().any(|m| m.id == msg.id) {
                        EventOutcome::Duplicate
                    } else {
                        // keep a closed but cached conversation current
                        let row = msg.clone();
                        state.cache.modify(&key, |list| {
                            let mut row = row;
                            if row.sender_profile.is_placeholder() {
                                if let Some(p) = known_profile(list, &row.sender_id) {
                                    row.sender_profile = p;
                                }
                            }
                            insert_ordered(list, row);
                        });
                        EventOutcome::NotOpen
                    }
                }
            }
        };

        tracing::debug!("Realtime {} -> {:?}", msg.id, outcome);

        if outcome == EventOutcome::Duplicate {
            return outcome;
        }

        if let Some(projector) = &self.projector {
            projector.overlay_incoming(&msg);
            projector.notify_message_activity();
        }

        if let Some((local_user, counterpart)) = mark_remote {
            let gateway = Arc::clone(&self.gateway);
            let projector = self.projector.clone();
            tokio::spawn(async move {
                match gateway.mark_messages_read(&local_user, &counterpart).await {
                    Ok(()) => {
                        if let Some(projector) = projector {
                            projector.overlay_read(&counterpart);
                            projector.notify_message_activity();
                        }
                    }
                    Err(e) => tracing::warn!("Failed to mark incoming message read: {}", e),
                }
            });
        }

        outcome
    }

    /// Mark everything from `counterpart` to `local_user` as read, remotely in
    /// one batch, then mirror it into the list and the cache.
    pub async fn mark_read(&self, local_user: &str, counterpart: &str) -> Result<(), ChatError> {
        require_counterpart(counterpart)?;
        self.gateway
            .mark_messages_read(local_user, counterpart)
            .await?;

        let key = ConversationKey::between(local_user, counterpart);
        self.state().with_list(&key, |list| {
            for m in list.iter_mut() {
                if is_unread_from(m, local_user, counterpart) {
                    m.mark_read();
                }
            }
        });

        if let Some(projector) = &self.projector {
            projector.overlay_read(counterpart);
        }
        Ok(())
    }
}

fn require_counterpart(counterpart: &str) -> Result<(), ChatError> {
    if counterpart.trim().is_empty() {
        Err(ChatError::EmptyCounterpart)
    } else {
        Ok(())
    }
}

fn is_unread_from(m: &Message, local_user: &str, counterpart: &str) -> bool {
    m.receiver_id == local_user && m.sender_id == counterpart && !m.read_flag
}

fn is_remote_url(content: &str) -> bool {
    content.starts_with("https://") || content.starts_with("http://")
}

/// Creation time for an optimistic entry: now, but never before the last entry.
fn provisional_timestamp(list: &[Message]) -> DateTime<Utc> {
    let now = Utc::now();
    match list.last() {
        Some(last) if last.created_at >= now => last.created_at + Duration::milliseconds(1),
        _ => now,
    }
}

/// Most recent non-placeholder profile of `user` in the list.
fn known_profile(list: &[Message], user: &str) -> Option<crate::models::SenderProfile> {
    list.iter()
        .rev()
        .find(|m| m.sender_id == user && !m.sender_profile.is_placeholder())
        .map(|m| m.sender_profile.clone())
}

fn fill_placeholder_profiles(list: &mut [Message]) {
    let missing: Vec<usize> = list
        .iter()
        .enumerate()
        .filter(|(_, m)| m.sender_profile.is_placeholder())
        .map(|(i, _)| i)
        .collect();
    for i in missing {
        if let Some(profile) = known_profile(list, &list[i].sender_id) {
            list[i].sender_profile = profile;
        }
    }
}

/// Insert after every entry with the same or an earlier timestamp.
fn insert_ordered(list: &mut Vec<Message>, msg: Message) {
    let pos = list.partition_point(|m| m.created_at <= msg.created_at);
    list.insert(pos, msg);
}

/// Fold a server row into an existing entry; read state never regresses.
fn merge_into(existing: &mut Message, incoming: Message) {
    let read_flag = existing.read_flag || incoming.read_flag;
    let delivery_state = existing.delivery_state.advance(incoming.delivery_state);
    let profile = if incoming.sender_profile.is_placeholder() {
        std::mem::take(&mut existing.sender_profile)
    } else {
        incoming.sender_profile.clone()
    };
    *existing = Message {
        read_flag,
        delivery_state,
        sender_profile: profile,
        ..incoming
    };
}

/// Merge by id, inserting in order when new.
fn upsert(list: &mut Vec<Message>, incoming: Message) {
    match list.iter_mut().find(|m| m.id == incoming.id) {
        Some(existing) => merge_into(existing, incoming),
        None => insert_ordered(list, incoming),
    }
}

/// Replace the list with a freshly fetched first page, keeping local entries
/// the page cannot know about: unsent ones and anything newer than the page.
fn merge_reset(previous: Vec<Message>, page: Vec<Message>) -> Vec<Message> {
    let newest_fetched = page.last().map(|m| m.created_at);
    let mut merged = Vec::with_capacity(page.len());
    let mut previous_by_id: HashMap<String, Message> =
        previous.into_iter().map(|m| (m.id.clone(), m)).collect();

    for incoming in page {
        match previous_by_id.remove(&incoming.id) {
            Some(mut existing) => {
                merge_into(&mut existing, incoming);
                merged.push(existing);
            }
            None => merged.push(incoming),
        }
    }

    let mut kept: Vec<Message> = previous_by_id
        .into_values()
        .filter(|m| m.is_temporary() || newest_fetched.map_or(true, |t| m.created_at > t))
        .collect();
    kept.sort_by_key(|m| m.created_at);
    for m in kept {
        insert_ordered(&mut merged, m);
    }
    merged
}

/// Swap a temporary entry for its persisted row, collapsing with an echo
/// that may already have arrived through the change feed.
fn replace_temporary(list: &mut Vec<Message>, temp_id: &str, persisted: Message) {
    let temp_pos = list.iter().position(|m| m.id == temp_id);
    let echo_pos = list.iter().position(|m| m.id == persisted.id);

    match (temp_pos, echo_pos) {
        (Some(t), Some(e)) => {
            merge_into(&mut list[e], persisted);
            list.remove(t);
        }
        (Some(t), None) => {
            let mut persisted = persisted;
            persisted.delivery_state = persisted.delivery_state.max(DeliveryState::Sent);
            if persisted.sender_profile.is_placeholder() {
                persisted.sender_profile = list[t].sender_profile.clone();
            }
            list[t] = persisted;
            let out_of_order = (t > 0 && list[t - 1].created_at > list[t].created_at)
                || (t + 1 < list.len() && list[t + 1].created_at < list[t].created_at);
            if out_of_order {
                let m = list.remove(t);
                insert_ordered(list, m);
            }
        }
        (None, Some(e)) => merge_into(&mut list[e], persisted),
        // the conversation was reset meanwhile; the feed or the next load brings it back
        (None, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeGateway;
    use crate::chat::DEFAULT_DEBOUNCE;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;
    use tokio_test::{assert_err, assert_ok};

    const ME: &str = "me";
    const ANN: &str = "ann";

    fn engine(fake: &Arc<FakeGateway>) -> MessageStateEngine {
        MessageStateEngine::new(fake.clone(), ConversationCache::default()).with_page_size(3)
    }

    fn key() -> ConversationKey {
        ConversationKey::between(ME, ANN)
    }

    fn assert_sorted_unique(list: &[Message]) {
        assert!(list.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        let ids: HashSet<&str> = list.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids.len(), list.len(), "duplicate ids in {:?}", list);
    }

    #[tokio::test]
    async fn test_empty_conversation() {
        let fake = FakeGateway::new();
        let engine = engine(&fake);
        let outcome = assert_ok!(engine.load_history(ME, ANN, true).await);
        assert_eq!(outcome, LoadOutcome::Loaded { fetched: 0, has_more: false });
        assert!(engine.messages(&key()).is_empty());
        assert!(!engine.has_more_data(&key()));
    }

    #[tokio::test]
    async fn test_empty_counterpart_rejected() {
        let fake = FakeGateway::new();
        let engine = engine(&fake);
        assert!(matches!(
            engine.load_history(ME, "  ", true).await,
            Err(ChatError::EmptyCounterpart)
        ));
        assert!(matches!(
            engine.send(ME, "", "hi", MessageKind::Text).await,
            Err(ChatError::EmptyCounterpart)
        ));
        assert!(matches!(
            engine.send(ME, ANN, "   ", MessageKind::Text).await,
            Err(ChatError::EmptyContent)
        ));
    }

    #[tokio::test]
    async fn test_pagination_sorted_without_duplicates() {
        let fake = FakeGateway::new();
        for i in 0..7 {
            let (from, to) = if i % 2 == 0 { (ANN, ME) } else { (ME, ANN) };
            fake.seed(from, to, &format!("m{}", i), i);
        }
        let engine = engine(&fake);

        assert_ok!(engine.load_history(ME, ANN, true).await);
        assert!(engine.has_more_data(&key()));
        assert_ok!(engine.load_history(ME, ANN, false).await);
        let last = assert_ok!(engine.load_history(ME, ANN, false).await);
        assert_eq!(last, LoadOutcome::Loaded { fetched: 1, has_more: false });
        // a repeated call re-reads the partial page and must not duplicate it
        assert_ok!(engine.load_history(ME, ANN, false).await);

        let list = engine.messages(&key());
        assert_eq!(list.len(), 7);
        assert_sorted_unique(&list);
        let contents: Vec<&str> = list.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4", "m5", "m6"]);
    }

    #[tokio::test]
    async fn test_load_marks_incoming_read() {
        let fake = FakeGateway::new();
        fake.seed(ANN, ME, "unread", 1);
        fake.seed(ME, ANN, "mine", 2);
        let engine = engine(&fake);

        assert_ok!(engine.load_history(ME, ANN, true).await);
        assert_eq!(fake.mark_read_calls.load(Ordering::SeqCst), 1);

        let list = engine.messages(&key());
        assert!(list[0].read_flag);
        assert_eq!(list[0].delivery_state, DeliveryState::Read);
        assert!(!list[1].read_flag);
        assert!(fake.rows().iter().filter(|m| m.receiver_id == ME).all(|m| m.read_flag));

        let (cached, fresh) = engine.cached(&key());
        assert!(fresh);
        assert!(cached[0].read_flag);
    }

    #[tokio::test]
    async fn test_concurrent_load_is_guarded() {
        let fake = FakeGateway::new();
        fake.seed(ANN, ME, "a", 1);
        let engine = engine(&fake);
        let gate = fake.gate_fetches();

        let first = engine.load_history(ME, ANN, false);
        let second = async {
            tokio::task::yield_now().await;
            assert!(engine.is_loading(&key()));
            let outcome = engine.load_history(ME, ANN, false).await;
            gate.notify_one();
            outcome
        };
        let (first, second) = tokio::join!(first, second);
        assert_eq!(assert_ok!(second), LoadOutcome::AlreadyLoading);
        assert_eq!(assert_ok!(first), LoadOutcome::Loaded { fetched: 1, has_more: false });
        assert_eq!(fake.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_page_discarded_after_close() {
        let fake = FakeGateway::new();
        fake.seed(ANN, ME, "a", 1);
        let engine = engine(&fake);
        let gate = fake.gate_fetches();

        let load = engine.load_history(ME, ANN, true);
        let close = async {
            tokio::task::yield_now().await;
            engine.close_conversation(&key());
            gate.notify_one();
        };
        let (outcome, _) = tokio::join!(load, close);
        assert_eq!(assert_ok!(outcome), LoadOutcome::Discarded);
        assert!(!engine.is_open(&key()));
        // nothing read remotely for a conversation nobody is looking at
        assert_eq!(fake.mark_read_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_state_unchanged() {
        let fake = FakeGateway::new();
        fake.seed(ANN, ME, "a", 1);
        let engine = engine(&fake);
        assert_ok!(engine.load_history(ME, ANN, true).await);

        fake.fail_fetches.store(true, Ordering::SeqCst);
        let err = assert_err!(engine.load_history(ME, ANN, true).await);
        assert!(err.is_recoverable());
        assert_eq!(engine.messages(&key()).len(), 1);
        assert!(!engine.is_loading(&key()));
    }

    #[tokio::test]
    async fn test_send_is_visible_before_persisting() {
        let fake = FakeGateway::new();
        let engine = engine(&fake);
        let gate = fake.gate_inserts();

        let send = engine.send(ME, ANN, "  hello ", MessageKind::Text);
        let observe = async {
            tokio::task::yield_now().await;
            let list = engine.messages(&key());
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].content, "hello");
            assert_eq!(list[0].delivery_state, DeliveryState::Pending);
            assert!(list[0].is_temporary());
            gate.notify_one();
        };
        let (sent, _) = tokio::join!(send, observe);
        let sent = assert_ok!(sent);

        let list = engine.messages(&key());
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, sent.id);
        assert_eq!(list[0].delivery_state, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn test_two_rapid_sends_keep_order() {
        let fake = FakeGateway::new();
        let engine = engine(&fake);
        let (hi, there) = tokio::join!(
            engine.send(ME, ANN, "hi", MessageKind::Text),
            engine.send(ME, ANN, "there", MessageKind::Text)
        );
        assert_ok!(hi);
        assert_ok!(there);

        let list = engine.messages(&key());
        let contents: Vec<&str> = list.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "there"]);
        assert!(list.iter().all(|m| m.delivery_state == DeliveryState::Sent));
        assert_sorted_unique(&list);
    }

    #[tokio::test]
    async fn test_send_then_echo_collapses() {
        let fake = FakeGateway::new();
        let engine = engine(&fake);
        assert_ok!(engine.load_history(ME, ANN, true).await);

        let sent = assert_ok!(engine.send(ME, ANN, "yo", MessageKind::Text).await);
        let outcome = engine.apply_realtime_event(MessageEvent::Insert(sent.clone()));
        assert_eq!(outcome, EventOutcome::Duplicate);

        let list = engine.messages(&key());
        assert_eq!(list.len(), 1);
        assert!(matches!(
            list[0].delivery_state,
            DeliveryState::Sent | DeliveryState::Read
        ));
    }

    #[tokio::test]
    async fn test_echo_before_insert_response_collapses() {
        let fake = FakeGateway::new();
        let engine = engine(&fake);
        let gate = fake.gate_inserts();

        let send = engine.send(ME, ANN, "race", MessageKind::Text);
        let echo = async {
            tokio::task::yield_now().await;
            // the feed delivers the persisted row before the insert call returns
            let row = Message {
                id: "srv-1".to_string(),
                conversation_key: key(),
                sender_id: ME.to_string(),
                receiver_id: ANN.to_string(),
                content: "race".to_string(),
                kind: MessageKind::Text,
                created_at: Utc::now(),
                delivery_state: DeliveryState::Sent,
                read_flag: false,
                sender_profile: Default::default(),
            };
            assert_eq!(
                engine.apply_realtime_event(MessageEvent::Insert(row)),
                EventOutcome::Applied
            );
            assert_eq!(engine.messages(&key()).len(), 2);
            gate.notify_one();
        };
        let (sent, _) = tokio::join!(send, echo);
        let sent = assert_ok!(sent);
        assert_eq!(sent.id, "srv-1");

        let list = engine.messages(&key());
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "srv-1");
        assert!(!list[0].is_temporary());
    }

    #[tokio::test]
    async fn test_failed_send_stays_visible() {
        let fake = FakeGateway::new();
        fake.fail_inserts.store(true, Ordering::SeqCst);
        let engine = engine(&fake);

        let err = assert_err!(engine.send(ME, ANN, "lost?", MessageKind::Text).await);
        let temp_id = match err {
            ChatError::SendFailed { temp_id, .. } => temp_id,
            other => panic!("unexpected error: {:?}", other),
        };

        let list = engine.messages(&key());
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].content, "lost?");
        assert_eq!(list[0].delivery_state, DeliveryState::Failed);

        fake.fail_inserts.store(false, Ordering::SeqCst);
        let sent = assert_ok!(engine.retry_send(&temp_id).await);
        let list = engine.messages(&key());
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, sent.id);
        assert_eq!(list[0].delivery_state, DeliveryState::Sent);
        assert!(matches!(
            engine.retry_send(&sent.id).await,
            Err(ChatError::NotFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_discard_failed() {
        let fake = FakeGateway::new();
        fake.fail_inserts.store(true, Ordering::SeqCst);
        let engine = engine(&fake);
        let temp_id = match engine.send(ME, ANN, "nope", MessageKind::Text).await {
            Err(ChatError::SendFailed { temp_id, .. }) => temp_id,
            other => panic!("unexpected: {:?}", other),
        };
        assert_ok!(engine.discard_failed(&temp_id));
        assert!(engine.messages(&key()).is_empty());
        assert!(matches!(
            engine.discard_failed(&temp_id),
            Err(ChatError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_binary_send_uploads_first() {
        let fake = FakeGateway::new();
        let engine = engine(&fake);
        let sent = assert_ok!(
            engine
                .send(ME, ANN, "/tmp/photos/cat.png", MessageKind::Image)
                .await
        );
        assert_eq!(sent.content, "https://storage.test/chat-media/cat.png");
        assert_eq!(sent.kind, MessageKind::Image);

        fake.fail_uploads.store(true, Ordering::SeqCst);
        assert_err!(engine.send(ME, ANN, "/tmp/clip.mp4", MessageKind::Video).await);
        let list = engine.messages(&key());
        assert_eq!(list.last().unwrap().delivery_state, DeliveryState::Failed);
        assert_eq!(list.last().unwrap().content, "/tmp/clip.mp4");
    }

    #[tokio::test]
    async fn test_realtime_is_idempotent_and_marks_read() {
        let fake = FakeGateway::new();
        fake.set_profile(ANN, "Ann");
        fake.seed(ANN, ME, "earlier", 0);
        let engine = engine(&fake);
        assert_ok!(engine.load_history(ME, ANN, true).await);

        let row = fake.seed(ANN, ME, "live", 10);
        let bare = Message {
            sender_profile: Default::default(),
            ..row
        };
        assert_eq!(
            engine.apply_realtime_event(MessageEvent::Insert(bare.clone())),
            EventOutcome::Applied
        );
        let once = engine.messages(&key());
        assert_eq!(
            engine.apply_realtime_event(MessageEvent::Insert(bare)),
            EventOutcome::Duplicate
        );
        assert_eq!(engine.messages(&key()), once);

        let live = once.last().unwrap();
        assert!(live.read_flag);
        assert_eq!(live.sender_profile.username, "Ann");

        // remote mark-read runs on a spawned task
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(fake.rows().iter().all(|m| m.read_flag));
    }

    #[tokio::test]
    async fn test_realtime_for_closed_conversation_updates_inbox_only() {
        let fake = FakeGateway::new();
        let projector = ConversationListProjector::new(fake.clone(), DEFAULT_DEBOUNCE);
        let engine = engine(&fake).with_projector(projector.clone());
        assert_ok!(projector.refresh(ME).await);
        assert_ok!(engine.load_history(ME, ANN, true).await);

        let row = fake.seed("zed", ME, "psst", 5);
        assert_eq!(
            engine.apply_realtime_event(MessageEvent::Insert(row)),
            EventOutcome::NotOpen
        );
        assert!(engine.messages(&key()).is_empty());
        assert!(engine.messages(&ConversationKey::between(ME, "zed")).is_empty());
        assert_eq!(projector.unread_count("zed"), 1);

        // the authoritative refresh agrees with the overlay
        assert_ok!(projector.refresh(ME).await);
        assert_eq!(projector.unread_count("zed"), 1);
    }

    #[tokio::test]
    async fn test_mark_read_then_refresh_clears_unread() {
        let fake = FakeGateway::new();
        fake.seed(ANN, ME, "one", 1);
        fake.seed(ANN, ME, "two", 2);
        let projector = ConversationListProjector::new(fake.clone(), DEFAULT_DEBOUNCE);
        let engine = engine(&fake).with_projector(projector.clone());
        assert_ok!(projector.refresh(ME).await);
        assert_eq!(projector.unread_count(ANN), 2);

        assert_ok!(engine.mark_read(ME, ANN).await);
        assert_eq!(projector.unread_count(ANN), 0);
        assert_ok!(projector.refresh(ME).await);
        assert_eq!(projector.unread_count(ANN), 0);
    }

    #[tokio::test]
    async fn test_reset_keeps_newer_realtime_rows() {
        let fake = FakeGateway::new();
        fake.seed(ANN, ME, "old", 0);
        let engine = engine(&fake);
        let gate = fake.gate_fetches();

        let load = engine.load_history(ME, ANN, true);
        let live = async {
            tokio::task::yield_now().await;
            // arrives through the feed while the stale page is in flight
            let row = fake.remote_row(ANN, ME, "new", 30);
            engine.apply_realtime_event(MessageEvent::Insert(row));
            gate.notify_one();
        };
        let (outcome, _) = tokio::join!(load, live);
        assert_ok!(outcome);

        let contents: Vec<String> = engine
            .messages(&key())
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["old", "new"]);
    }

    #[tokio::test]
    async fn test_reset_engine_keeps_cache_unless_asked() {
        let fake = FakeGateway::new();
        fake.seed(ANN, ME, "a", 1);
        let engine = engine(&fake);
        assert_ok!(engine.load_history(ME, ANN, true).await);

        engine.reset(false);
        assert!(!engine.is_open(&key()));
        let (cached, _) = engine.cached(&key());
        assert_eq!(cached.len(), 1);

        let (seeded, fresh) = assert_ok!(engine.open_conversation(ME, ANN));
        assert_eq!(seeded.len(), 1);
        assert!(fresh);

        engine.reset(true);
        assert!(engine.cached(&key()).0.is_empty());
    }

    #[tokio::test]
    async fn test_realtime_updates_closed_but_cached_conversation() {
        let fake = FakeGateway::new();
        fake.set_profile(ANN, "Ann");
        fake.seed(ANN, ME, "old", 0);
        let engine = engine(&fake);
        assert_ok!(engine.load_history(ME, ANN, true).await);
        engine.close_conversation(&key());

        let row = Message {
            sender_profile: Default::default(),
            ..fake.remote_row(ANN, ME, "new", 30)
        };
        assert_eq!(
            engine.apply_realtime_event(MessageEvent::Insert(row.clone())),
            EventOutcome::NotOpen
        );
        assert_eq!(
            engine.apply_realtime_event(MessageEvent::Insert(row)),
            EventOutcome::Duplicate
        );

        let (cached, fresh) = engine.cached(&key());
        assert!(fresh);
        let contents: Vec<&str> = cached.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["old", "new"]);
        assert_eq!(cached[1].sender_profile.username, "Ann");
        // not viewed, so still unread
        assert!(!cached[1].read_flag);

        let (reopened, _) = assert_ok!(engine.open_conversation(ME, ANN));
        assert_eq!(reopened.len(), 2);
        assert_sorted_unique(&reopened);
    }

    #[tokio::test]
    async fn test_redelivered_event_counts_once_in_inbox() {
        let fake = FakeGateway::new();
        let projector = ConversationListProjector::new(fake.clone(), DEFAULT_DEBOUNCE);
        let engine = engine(&fake).with_projector(projector.clone());
        assert_ok!(projector.refresh(ME).await);

        let row = fake.seed("zed", ME, "psst", 5);
        assert_eq!(
            engine.apply_realtime_event(MessageEvent::Insert(row.clone())),
            EventOutcome::NotOpen
        );
        let once = projector.summaries();
        assert_eq!(
            engine.apply_realtime_event(MessageEvent::Insert(row)),
            EventOutcome::Duplicate
        );
        assert_eq!(projector.summaries(), once);
        assert_eq!(projector.unread_count("zed"), 1);
    }

    #[tokio::test]
    async fn test_undecodable_row_does_not_stall_paging() {
        let fake = FakeGateway::new();
        let mut ids = Vec::new();
        for i in 0..7 {
            ids.push(fake.seed(ANN, ME, &format!("m{}", i), i).id);
        }
        fake.corrupt(&ids[1]);
        let engine = engine(&fake);

        let first = assert_ok!(engine.load_history(ME, ANN, true).await);
        assert_eq!(first, LoadOutcome::Loaded { fetched: 2, has_more: true });
        assert!(engine.has_more_data(&key()));
        assert_ok!(engine.load_history(ME, ANN, false).await);
        let last = assert_ok!(engine.load_history(ME, ANN, false).await);
        assert_eq!(last, LoadOutcome::Loaded { fetched: 1, has_more: false });

        let list = engine.messages(&key());
        assert_eq!(list.len(), 6);
        assert_sorted_unique(&list);
        assert_eq!(list.last().unwrap().content, "m6");
        assert!(list.iter().all(|m| m.content != "m1"));
    }

    #[tokio::test]
    async fn test_failed_send_recoverable_after_close() {
        let fake = FakeGateway::new();
        fake.fail_inserts.store(true, Ordering::SeqCst);
        let engine = engine(&fake);
        let mut failed = Vec::new();
        for text in ["first", "second"] {
            match engine.send(ME, ANN, text, MessageKind::Text).await {
                Err(ChatError::SendFailed { temp_id, .. }) => failed.push(temp_id),
                other => panic!("unexpected: {:?}", other),
            }
        }
        engine.close_conversation(&key());
        fake.fail_inserts.store(false, Ordering::SeqCst);

        let sent = assert_ok!(engine.retry_send(&failed[0]).await);
        assert_ok!(engine.discard_failed(&failed[1]));

        let (cached, _) = engine.cached(&key());
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, sent.id);
        assert_eq!(cached[0].delivery_state, DeliveryState::Sent);
        assert!(!engine.is_open(&key()));
    }
}
