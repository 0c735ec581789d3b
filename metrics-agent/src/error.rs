//! Error taxonomy for delivery, buffering, collection and the command relay

use thiserror::Error;

/// Failures of the on-disk buffer (or any other local state file)
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Failures of one metrics delivery
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connect failure, timeout, broken body
    #[error("Network error: {0}")]
    Network(String),
    /// Non-2xx answer other than an authentication rejection
    #[error("Server rejected request with status {status}: {body}")]
    Server { status: u16, body: String },
    /// 401/403: retrying with the same key cannot succeed
    #[error("Authentication rejected with status {0}")]
    Unauthorized(u16),
    /// 400/413/422: the server will never accept this payload
    #[error("Payload rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    /// Malformed batch; a caller bug, never buffered
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Buffer unwritable; the batch has nowhere left to go
    #[error("Local storage error: {0}")]
    Storage(#[from] StorageError),
}

impl DeliveryError {
    /// Worth another attempt after a delay
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Network(_) | DeliveryError::Server { .. })
    }

    /// Delivery failed but the batch can wait in the buffer
    pub fn is_bufferable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Network(_) | DeliveryError::Server { .. } | DeliveryError::Unauthorized(_)
        )
    }
}

/// A collector's `collect()` failing
#[derive(Debug, Clone, Error)]
pub enum CollectorError {
    #[error("{0}")]
    Failed(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("invalid entry: {0}")]
    InvalidEntry(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("collector panicked")]
    Panicked,
}

/// Failures talking to the command server
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Server rejected request with status {status}: {body}")]
    Server { status: u16, body: String },
    #[error("Authentication rejected with status {0}")]
    Unauthorized(u16),
    /// 404 on a client-scoped endpoint: the server forgot us
    #[error("Client {0} is unknown to the server")]
    UnknownClient(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("State error: {0}")]
    State(#[from] StorageError),
}

/// Failures of a single command handler
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("unsupported command")]
    Unsupported,
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("not supported on this platform")]
    PlatformUnsupported,
}

impl ExecutionError {
    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        ExecutionError::InvalidArgument {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
