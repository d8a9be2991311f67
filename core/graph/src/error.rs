use std::fmt;

use thiserror::Error;

/// Broad classification used by callers to decide how to react to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad arguments; raised before any I/O and never worth retrying
    Validation,
    /// Programming errors such as duplicate keys or runaway setter redirection
    Integrity,
    /// Failure inside a database call or while decoding stored data
    Storage,
    /// A load matched nothing
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid key '{0}': keys may only contain letters, numbers, underscores, hyphens and periods")]
    InvalidKey(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Duplicate key: '{incoming}' conflicts with existing topic '{existing}'")]
    DuplicateKey { existing: String, incoming: String },
    #[error("Setting attribute '{key}' was redirected more than {limit} times")]
    SetterRecursion { key: String, limit: usize },
    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),
    #[error("Topic not found: {0}")]
    NotFound(String),
    #[error("Storage error during {operation} of '{topic}': {message}")]
    Storage {
        operation: String,
        topic: String,
        message: String,
    },
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl TopicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TopicError::InvalidArgument(_) => ErrorKind::Validation,
            TopicError::InvalidKey(_) => ErrorKind::Validation,
            TopicError::InvalidOperation(_) => ErrorKind::Validation,
            TopicError::DuplicateKey { .. } => ErrorKind::Integrity,
            TopicError::SetterRecursion { .. } => ErrorKind::Integrity,
            TopicError::ReferentialIntegrity(_) => ErrorKind::Integrity,
            TopicError::NotFound(_) => ErrorKind::NotFound,
            TopicError::Storage { .. } => ErrorKind::Storage,
            TopicError::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// Wrap a storage-layer failure with the operation and topic it hit
    pub fn storage<E: fmt::Display>(operation: &str, topic: &str, err: E) -> Self {
        TopicError::Storage {
            operation: operation.to_string(),
            topic: topic.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TopicError {
    fn from(src: serde_json::Error) -> TopicError {
        TopicError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

pub type Result<T> = std::result::Result<T, TopicError>;
