use thiserror::Error;

use crate::attachments::AttachmentError;
use crate::pty::PtyError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to start session: {0}")]
    Spawn(#[from] PtyError),

    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("Rate limit exceeded. Slow down.")]
    RateLimitExceeded,

    #[error("{0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("attachment error: {0}")]
    Attachment(#[from] AttachmentError),

    #[error("bridge coordinator is not running")]
    CoordinatorGone,
}

impl BridgeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
