//! Per-conversation message cache with a freshness window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::{ConversationKey, Message};

pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    messages: Vec<Message>,
    last_updated: Instant,
}

/// Most recently known ordered message list per conversation.
///
/// Purely in-memory; merging is the engine's job, `put` replaces.
#[derive(Debug, Clone)]
pub struct ConversationCache {
    entries: HashMap<ConversationKey, CacheEntry>,
    freshness: Duration,
}

impl Default for ConversationCache {
    fn default() -> Self {
        Self::new(DEFAULT_FRESHNESS)
    }
}

impl ConversationCache {
    pub fn new(freshness: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            freshness,
        }
    }

    /// Cached messages and whether they are still within the freshness window.
    /// A miss yields an empty slice that is not fresh.
    pub fn get(&self, key: &ConversationKey) -> (&[Message], bool) {
        match self.entries.get(key) {
            Some(entry) => (
                entry.messages.as_slice(),
                entry.last_updated.elapsed() < self.freshness,
            ),
            None => (&[][..], false),
        }
    }

    /// Replace the stored list and its timestamp.
    pub fn put(&mut self, key: ConversationKey, messages: Vec<Message>) {
        self.entries.insert(
            key,
            CacheEntry {
                messages,
                last_updated: Instant::now(),
            },
        );
    }

    /// Look a message up by id across every cached conversation.
    pub fn find(&self, id: &str) -> Option<&Message> {
        self.entries
            .values()
            .flat_map(|e| e.messages.iter())
            .find(|m| m.id == id)
    }

    /// Edit the cached list of `key` in place, restamping it. No-op on a miss.
    pub fn modify(&mut self, key: &ConversationKey, f: impl FnOnce(&mut Vec<Message>)) {
        if let Some(entry) = self.entries.get_mut(key) {
            f(&mut entry.messages);
            entry.last_updated = Instant::now();
        }
    }

    pub fn invalidate(&mut self, key: &ConversationKey) {
        self.entries.remove(key);
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
