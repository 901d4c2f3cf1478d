use atelier_contracts::{StoreError, ValidationError};
use thiserror::Error;

use crate::mask::MaskError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Network failure, timeout or non-success HTTP status. Never retried here.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call completed but its payload cannot produce a record.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Persisting failed after the remote side effect already happened.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("mask error: {0}")]
    Mask(#[from] MaskError),

    #[error("composite error: {0}")]
    Composite(String),

    #[error("user {0} already has an operation in flight")]
    Busy(String),
}

impl EngineError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn composite(msg: impl Into<String>) -> Self {
        Self::Composite(msg.into())
    }

    /// Short stable label for event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
            Self::Mask(_) => "mask",
            Self::Composite(_) => "composite",
            Self::Busy(_) => "busy",
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(error_chain_text(&err, 512))
    }
}

pub(crate) fn error_chain_text(
    err: &(dyn std::error::Error + 'static),
    max_chars: usize,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut cursor = Some(err);
    while let Some(cause) = cursor {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(|last| last != trimmed).unwrap_or(true) {
            parts.push(trimmed.to_string());
        }
        cursor = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use atelier_contracts::ValidationError;

    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(EngineError::transport("x").to_string().starts_with("transport error:"));
        assert!(EngineError::protocol("x").to_string().starts_with("protocol error:"));
        let err = EngineError::from(ValidationError::EmptyPrompt);
        assert_eq!(err.kind(), "validation");
        assert_eq!(err.to_string(), "validation error: prompt must not be empty");
    }

    #[test]
    fn chain_text_joins_sources() {
        let inner = std::io::Error::other("connection reset");
        let outer = StoreError::Io(inner);
        let text = error_chain_text(&outer, 512);
        assert!(text.contains("store io error"));
        assert!(text.contains("connection reset"));
        assert_eq!(truncate_text("abcdef", 3), "abc…");
    }
}
