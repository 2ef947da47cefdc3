/// Error types for the conversation core
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connectivity or backend failure; the operation may succeed if retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum ChatError {
    /// Bad input to an operation. Reported synchronously, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }

    /// Stable machine-readable kind, used in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::NotFound { .. } => "not_found",
            ChatError::TransientStore(_) => "unavailable",
            ChatError::Serialization(_) => "bad_frame",
            ChatError::Io(_) | ChatError::Dispatch(_) => "internal",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::TransientStore(_))
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => ChatError::TransientStore(reason),
            StoreError::NotFound { entity, id } => ChatError::NotFound { entity, id },
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
