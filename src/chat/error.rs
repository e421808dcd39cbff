//! Errors surfaced by the chat core.

use thiserror::Error;

use crate::api::GatewayError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("no counterpart given")]
    EmptyCounterpart,
    #[error("no message with id {0}")]
    UnknownMessage(String),
    #[error("message {0} has not failed")]
    NotFailed(String),
    /// The optimistic entry stays in the list in the `failed` state.
    #[error("sending message {temp_id} failed: {source}")]
    SendFailed {
        temp_id: String,
        #[source]
        source: GatewayError,
    },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl ChatError {
    /// Whether the caller may retry the same operation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ChatError::SendFailed { .. } => true,
            ChatError::Gateway(e) => e.is_transient(),
            _ => false,
        }
    }
}
