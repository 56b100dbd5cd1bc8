use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordinationError>;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Version mismatch on {path}: expected {expected}")]
    VersionMismatch { path: String, expected: i64 },

    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Watch stream error: {0}")]
    WatchError(String),

    #[error("Watch channel closed")]
    WatchChannelClosed,

    #[error("Storage backend error: {0}")]
    StorageError(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

impl CoordinationError {
    /// Errors worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::TransportError(_)
                | CoordinationError::StorageError(_)
                | CoordinationError::Unknown(_)
        )
    }
}
