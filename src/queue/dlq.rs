use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::queue::error::QueueError;
use crate::queue::store::QueueStore;
use crate::queue::task::{unix_score, Task};

pub const DEFAULT_LIST_LIMIT: usize = 50;

/// A task whose execution failed terminally, as stored in the dead-letter
/// container.
///
/// The wrapped task is kept as raw JSON: the container must be able to hold
/// payloads that no longer (or never did) parse as a [`Task`], such as
/// corrupted entries parked by the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTask {
    pub task: Value,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
}

impl FailedTask {
    /// Id of the wrapped task, when it carries one.
    pub fn task_id(&self) -> Option<&str> {
        self.task.get("id").and_then(Value::as_str)
    }

    /// The wrapped task decoded back into the typed model.
    pub fn decode_task(&self) -> Result<Task, serde_json::Error> {
        serde_json::from_value(self.task.clone())
    }
}

/// Aggregate view of the dead-letter container.
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub count: u64,
    pub oldest_failure: Option<DateTime<Utc>>,
    pub newest_failure: Option<DateTime<Utc>>,
}

/// Durable container of terminally failed tasks, ordered by failure time.
///
/// Recording never propagates an error to the caller: a failed failure must
/// not block the consumer loop, so store problems are logged and swallowed.
#[derive(Clone)]
pub struct DeadLetterStore {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterStore {
    pub fn new(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Park a failed task. Errors are logged, never returned.
    pub async fn record(&self, task: &Task, error_message: &str) {
        let failed_at = self.clock.now();
        let entry = match serde_json::to_value(task) {
            Ok(task_value) => FailedTask {
                task: task_value,
                error: error_message.to_string(),
                failed_at,
                attempts: task.attempts,
            },
            Err(e) => {
                error!(task_id = %task.id, error = %e, "failed to serialize task for DLQ");
                return;
            }
        };
        self.write(entry, &task.id).await;
    }

    /// Park a payload that could not be deserialized at all. The raw text is
    /// preserved under a synthesized id so it can still be inspected and
    /// deleted.
    pub async fn record_raw(&self, payload: &str, error_message: &str) {
        let failed_at = self.clock.now();
        let id = format!("corrupted_{}", failed_at.timestamp_nanos_opt().unwrap_or(0));
        let entry = FailedTask {
            task: serde_json::json!({ "id": id, "raw": payload }),
            error: error_message.to_string(),
            failed_at,
            attempts: 0,
        };
        self.write(entry, &id).await;
    }

    async fn write(&self, entry: FailedTask, task_id: &str) {
        let payload = match serde_json::to_string(&entry) {
            Ok(p) => p,
            Err(e) => {
                error!(task_id, error = %e, "failed to serialize DLQ entry");
                return;
            }
        };
        let score = unix_score(entry.failed_at);
        match self.store.dlq_record(&payload, score).await {
            Ok(()) => info!(task_id, error = %entry.error, "task moved to DLQ"),
            Err(e) => error!(task_id, error = %e, "failed to send task to DLQ"),
        }
    }

    /// Failed tasks, most recent first, capped at `limit` (0 means the
    /// default of 50). Entries that no longer parse are skipped with a
    /// warning.
    pub async fn list(&self, limit: usize) -> Result<Vec<FailedTask>, QueueError> {
        let limit = if limit == 0 { DEFAULT_LIST_LIMIT } else { limit };
        let entries = self.store.dlq_scan_desc().await?;
        let mut failed = Vec::new();
        for raw in entries.into_iter().take(limit) {
            match serde_json::from_str::<FailedTask>(&raw) {
                Ok(entry) => failed.push(entry),
                Err(e) => warn!(error = %e, "skipping unparseable DLQ entry"),
            }
        }
        Ok(failed)
    }

    /// Put a failed task back on the ready list with a fresh attempt budget,
    /// removing it from the container in the same pipeline.
    pub async fn requeue(&self, task_id: &str) -> Result<(), QueueError> {
        let entries = self.store.dlq_scan_desc().await?;
        for raw in entries {
            let Ok(entry) = serde_json::from_str::<FailedTask>(&raw) else {
                continue;
            };
            if entry.task_id() != Some(task_id) {
                continue;
            }

            let mut task = entry.task.clone();
            task["attempts"] = Value::from(0);
            task["execute_at"] = Value::from(self.clock.now().to_rfc3339());
            let task_payload = serde_json::to_string(&task)?;

            self.store.dlq_requeue(&raw, &task_payload).await?;
            info!(task_id, "task requeued from DLQ");
            return Ok(());
        }
        Err(QueueError::NotFound(task_id.to_string()))
    }

    /// Permanently drop the entry for `task_id`.
    pub async fn delete(&self, task_id: &str) -> Result<(), QueueError> {
        let entries = self.store.dlq_scan_desc().await?;
        for raw in entries {
            let Ok(entry) = serde_json::from_str::<FailedTask>(&raw) else {
                continue;
            };
            if entry.task_id() == Some(task_id) {
                self.store.dlq_remove(&raw).await?;
                info!(task_id, "task deleted from DLQ");
                return Ok(());
            }
        }
        Err(QueueError::NotFound(task_id.to_string()))
    }

    /// Drop the whole container, returning how many entries it held.
    pub async fn purge(&self) -> Result<u64, QueueError> {
        let removed = self.store.dlq_purge().await?;
        info!(removed, "DLQ purged");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<DlqStats, QueueError> {
        let count = self.store.dlq_len().await?;
        let entries = self.store.dlq_scan_desc().await?;

        let newest_failure = entries
            .first()
            .and_then(|raw| serde_json::from_str::<FailedTask>(raw).ok())
            .map(|e| e.failed_at);
        let oldest_failure = entries
            .last()
            .and_then(|raw| serde_json::from_str::<FailedTask>(raw).ok())
            .map(|e| e.failed_at);

        Ok(DlqStats {
            count,
            oldest_failure,
            newest_failure,
        })
    }
}
