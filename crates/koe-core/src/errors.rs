use std::time::Duration;

/// Failures of the dialogue engine collaborator.
///
/// Both variants are soft: the caller never commits state on either, and the
/// user can retry by sending another message.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DialogueError {
    /// Engine unreachable, timed out, or answered with nothing usable.
    #[error("dialogue engine unavailable: {0}")]
    Transient(String),

    #[error("dialogue engine timed out after {0:?}")]
    Timeout(Duration),

    /// Structured summary did not match the expected shape.
    #[error("malformed engine output: {0}")]
    MalformedOutput(String),
}

impl DialogueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Timeout(_) => "timeout",
            Self::MalformedOutput(_) => "malformed_output",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DialogueError::Transient("connection refused".into()).is_transient());
        assert!(DialogueError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(!DialogueError::MalformedOutput("not json".into()).is_transient());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(DialogueError::Timeout(Duration::from_secs(1)).error_kind(), "timeout");
        assert_eq!(
            DialogueError::MalformedOutput(String::new()).error_kind(),
            "malformed_output"
        );
    }
}
