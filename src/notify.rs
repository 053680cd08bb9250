use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Failure to hand a message to the transport. Treated as transient by the
/// retry policy.
#[derive(Error, Debug)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

impl From<NotifyError> for crate::queue::error::HandlerError {
    fn from(err: NotifyError) -> Self {
        crate::queue::error::HandlerError::new(err.to_string())
    }
}

/// Outbound notification capability. The crate renders the message text;
/// the transport (messaging integration, SMTP, ...) lives outside and is
/// handed in as this trait object.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), NotifyError>;
}

/// Discards every message. Useful when a service runs without a transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn send(&self, _recipient: &str, _text: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Logs every message at info level instead of delivering it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), NotifyError> {
        info!(recipient, text, "notification");
        Ok(())
    }
}
