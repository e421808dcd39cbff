//! User profile models

use serde::{Deserialize, Serialize};

/// Display name shown when a row arrives without its profile.
pub const UNKNOWN_USERNAME: &str = "Unknown User";

/// Denormalized profile snapshot attached to messages and summaries.
///
/// Not authoritative; refreshed whenever a fuller row is seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub username: String,
    pub avatar_url: Option<String>,
}

impl SenderProfile {
    pub fn placeholder() -> Self {
        Self {
            username: UNKNOWN_USERNAME.to_string(),
            avatar_url: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.username == UNKNOWN_USERNAME && self.avatar_url.is_none()
    }
}

impl Default for SenderProfile {
    fn default() -> Self {
        Self::placeholder()
    }
}
