use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::queue::error::StoreError;

/// Redis key layout for one queue instance. Every key derives from the
/// configured namespace so that services sharing a store never collide.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    pub ready: String,
    pub delayed: String,
    pub processing: String,
    pub dlq: String,
    pub metrics_snapshot: String,
    metrics_prefix: String,
}

impl QueueKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            ready: format!("{namespace}:tasks"),
            delayed: format!("{namespace}:tasks:delayed"),
            processing: format!("{namespace}:tasks:processing"),
            dlq: format!("{namespace}:dlq"),
            metrics_snapshot: format!("{namespace}:queue:metrics"),
            metrics_prefix: format!("{namespace}:metrics"),
        }
    }

    /// Explicit container names, for deployments that cannot follow the
    /// derived layout.
    pub fn custom(
        ready: impl Into<String>,
        delayed: impl Into<String>,
        processing: impl Into<String>,
        dlq: impl Into<String>,
        metrics_prefix: impl Into<String>,
    ) -> Self {
        let metrics_prefix = metrics_prefix.into();
        Self {
            ready: ready.into(),
            delayed: delayed.into(),
            processing: processing.into(),
            dlq: dlq.into(),
            metrics_snapshot: format!("{metrics_prefix}:queue:snapshot"),
            metrics_prefix,
        }
    }

    pub fn metric(&self, name: &str) -> String {
        format!("{}:{name}", self.metrics_prefix)
    }
}

/// Sizes of the four task containers, fetched in one round-trip.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueDepths {
    pub ready: u64,
    pub delayed: u64,
    pub processing: u64,
    pub dlq: u64,
}

/// Semantic surface the queue and the dead-letter store need from the
/// underlying key-value store.
///
/// `payload` arguments are opaque serialized tasks; the adapter never parses
/// them. Implementations: [`RedisStore`](crate::queue::redis::RedisStore) in
/// production, [`MemoryStore`](crate::queue::testing::MemoryStore) in tests.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Left-push one payload onto the ready list.
    async fn push_ready(&self, payload: &str) -> Result<(), StoreError>;

    /// Add one payload to the delayed set, scored by its execution time.
    async fn add_delayed(&self, payload: &str, score: f64) -> Result<(), StoreError>;

    /// Mixed batch enqueue in a single pipeline.
    async fn enqueue_many(
        &self,
        ready: &[String],
        delayed: &[(String, f64)],
    ) -> Result<(), StoreError>;

    /// Blocking right-pop from ready, left-push to processing. Returns
    /// `None` when the timeout elapses without a task.
    async fn pop_to_processing(&self, timeout: Duration) -> Result<Option<String>, StoreError>;

    /// Remove one occurrence of the payload from the processing list.
    async fn ack_processing(&self, payload: &str) -> Result<(), StoreError>;

    /// Move everything left on the processing list back to ready, returning
    /// the number of entries recovered. Used after a restart.
    async fn requeue_processing(&self) -> Result<u64, StoreError>;

    /// Move all delayed entries scored at or below `now` to the ready list
    /// and drop them from the delayed set, in one pipeline. Returns the
    /// number of promoted tasks.
    async fn promote_due(&self, now: f64) -> Result<u64, StoreError>;

    /// Container sizes in a single pipeline.
    async fn depths(&self) -> Result<QueueDepths, StoreError>;

    /// Increment a named counter; the key carries a 24-hour TTL.
    async fn incr_metric(&self, name: &str, by: i64) -> Result<(), StoreError>;

    /// Store the serialized metrics snapshot under the snapshot key.
    async fn store_snapshot(&self, payload: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn dlq_record(&self, payload: &str, score: f64) -> Result<(), StoreError>;

    /// All dead-letter entries, newest failure first.
    async fn dlq_scan_desc(&self) -> Result<Vec<String>, StoreError>;

    async fn dlq_remove(&self, payload: &str) -> Result<u64, StoreError>;

    /// Atomically push a repaired task onto the ready list and drop its
    /// dead-letter entry.
    async fn dlq_requeue(&self, entry: &str, task_payload: &str) -> Result<(), StoreError>;

    async fn dlq_len(&self) -> Result<u64, StoreError>;

    /// Drop the dead-letter container, returning how many entries it held.
    async fn dlq_purge(&self) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Delete every container this queue owns.
    async fn purge_all(&self) -> Result<(), StoreError>;
}
