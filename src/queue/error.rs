use redis::RedisError;
use thiserror::Error;

/// Errors raised by the key-value store adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store operation timed out")]
    Timeout,

    #[error("corrupt queue entry: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Connection problems and timeouts are worth retrying; corrupt data
    /// never is.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Corrupt(_))
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Connection(err.to_string())
        }
    }
}

/// Errors surfaced by the task queue itself.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("task {0} not found in dead-letter queue")]
    NotFound(String),

    #[error("queue already has a subscriber")]
    AlreadySubscribed,
}

/// Failure returned by a task handler.
///
/// The retry policy classifies the failure by its message: messages
/// containing `invalid`, `not found`, `permission denied` or
/// `validation failed` (case-insensitive) are terminal, everything else is
/// retried with backoff.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
