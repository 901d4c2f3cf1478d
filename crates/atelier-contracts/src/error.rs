use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record id already exists: {0}")]
    DuplicateId(String),

    #[error("record {id} rejected: {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of `LineageStore::validate_index` when the pick is not usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("unknown id")]
    UnknownId,

    #[error("no images")]
    NoImages,

    #[error("index out of range, only {count} images")]
    OutOfRange { count: usize },
}

/// Rejections raised before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("unsupported style: {0}")]
    UnsupportedStyle(String),

    #[error("unsupported ratio: {0}")]
    UnsupportedRatio(String),

    #[error("record {0} is missing continuation ids")]
    MissingContinuation(String),

    #[error("record {0} has no reply id to regenerate from")]
    MissingReplyId(String),

    #[error("{0} records cannot be regenerated")]
    NotRegenerable(String),

    #[error("no active conversation; generate an image first")]
    NoActiveSession,

    #[error("image {id}: {source}")]
    Index {
        id: String,
        #[source]
        source: IndexError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_error_messages_state_the_image_count() {
        assert_eq!(IndexError::UnknownId.to_string(), "unknown id");
        assert_eq!(IndexError::NoImages.to_string(), "no images");
        assert_eq!(
            IndexError::OutOfRange { count: 4 }.to_string(),
            "index out of range, only 4 images"
        );
    }

    #[test]
    fn validation_index_wraps_the_store_reason() {
        let err = ValidationError::Index {
            id: "17".to_string(),
            source: IndexError::OutOfRange { count: 2 },
        };
        assert_eq!(err.to_string(), "image 17: index out of range, only 2 images");
    }
}
