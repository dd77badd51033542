use koe_core::errors::DialogueError;
use koe_core::ids::ChatSessionId;
use koe_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Dialogue(#[from] DialogueError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The session changed underneath this turn (finalized, abandoned, or
    /// advanced by another worker).
    #[error("session {0} is no longer active")]
    StaleSession(ChatSessionId),
}

impl ChatError {
    pub fn empty_reply() -> Self {
        Self::Dialogue(DialogueError::Transient("engine returned an empty reply".into()))
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Dialogue(e) => e.error_kind(),
            Self::Store(_) => "store",
            Self::StaleSession(_) => "stale_session",
        }
    }
}
