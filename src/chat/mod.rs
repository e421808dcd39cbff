//! Client-side chat core: message state, inbox projection and caching.

mod cache;
mod engine;
mod error;
mod projector;
mod session;

pub use cache::{ConversationCache, DEFAULT_FRESHNESS};
pub use engine::{EventOutcome, LoadOutcome, MessageStateEngine, DEFAULT_PAGE_SIZE};
pub use error::ChatError;
pub use projector::{ConversationListProjector, DEFAULT_DEBOUNCE};
pub use session::ChatSession;
