use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::DialogueError;
use crate::summary::SummaryRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for ChatRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown chat role: {other}")),
        }
    }
}

/// One message of a session's ordered history, as handed to the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: ChatRole,
    pub content: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Text-generation collaborator used by the chat flow.
#[async_trait]
pub trait DialogueEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Generate the next assistant reply. `history` is ordered oldest-first
    /// and already ends with `new_message`.
    async fn dialog_turn(
        &self,
        new_message: &str,
        history: &[HistoryEntry],
    ) -> Result<String, DialogueError>;

    /// Extract the structured summary of a finished conversation.
    async fn extract_summary(
        &self,
        history: &[HistoryEntry],
    ) -> Result<SummaryRecord, DialogueError>;
}
