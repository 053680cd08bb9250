//! In-memory [`QueueStore`] used by the crate's own tests and available to
//! downstream crates that want to exercise queue-driven flows without Redis.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::queue::error::StoreError;
use crate::queue::store::{QueueDepths, QueueStore};

const POP_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct Inner {
    ready: VecDeque<String>,
    processing: Vec<String>,
    delayed: Vec<(String, f64)>,
    dlq: Vec<(String, f64)>,
    counters: HashMap<String, i64>,
    snapshot: Option<String>,
}

/// Process-local store with the same semantics as the Redis adapter: FIFO
/// ready/processing lists, score-ordered delayed and dead-letter sets. The
/// blocking pop is emulated by polling, which cooperates with Tokio's paused
/// test clock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter value recorded via `incr_metric`, for assertions.
    pub fn metric(&self, name: &str) -> i64 {
        self.inner
            .lock()
            .unwrap()
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Last metrics snapshot stored by the monitor, for assertions.
    pub fn snapshot(&self) -> Option<String> {
        self.inner.lock().unwrap().snapshot.clone()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push_ready(&self, payload: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .ready
            .push_front(payload.to_string());
        Ok(())
    }

    async fn add_delayed(&self, payload: &str, score: f64) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .delayed
            .push((payload.to_string(), score));
        Ok(())
    }

    async fn enqueue_many(
        &self,
        ready: &[String],
        delayed: &[(String, f64)],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for payload in ready {
            inner.ready.push_front(payload.clone());
        }
        for entry in delayed {
            inner.delayed.push(entry.clone());
        }
        Ok(())
    }

    async fn pop_to_processing(&self, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(payload) = inner.ready.pop_back() {
                    inner.processing.push(payload.clone());
                    return Ok(Some(payload));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(POP_POLL_INTERVAL).await;
        }
    }

    async fn ack_processing(&self, payload: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.processing.iter().position(|p| p == payload) {
            inner.processing.remove(pos);
        }
        Ok(())
    }

    async fn requeue_processing(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stranded = std::mem::take(&mut inner.processing);
        let count = stranded.len() as u64;
        for payload in stranded {
            inner.ready.push_front(payload);
        }
        Ok(count)
    }

    async fn promote_due(&self, now: f64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut due: Vec<(String, f64)> = Vec::new();
        inner.delayed.retain(|(payload, score)| {
            if *score <= now {
                due.push((payload.clone(), *score));
                false
            } else {
                true
            }
        });
        due.sort_by(|a, b| a.1.total_cmp(&b.1));
        let count = due.len() as u64;
        for (payload, _) in due {
            inner.ready.push_front(payload);
        }
        Ok(count)
    }

    async fn depths(&self) -> Result<QueueDepths, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(QueueDepths {
            ready: inner.ready.len() as u64,
            delayed: inner.delayed.len() as u64,
            processing: inner.processing.len() as u64,
            dlq: inner.dlq.len() as u64,
        })
    }

    async fn incr_metric(&self, name: &str, by: i64) -> Result<(), StoreError> {
        *self
            .inner
            .lock()
            .unwrap()
            .counters
            .entry(name.to_string())
            .or_insert(0) += by;
        Ok(())
    }

    async fn store_snapshot(&self, payload: &str, _ttl: Duration) -> Result<(), StoreError> {
        self.inner.lock().unwrap().snapshot = Some(payload.to_string());
        Ok(())
    }

    async fn dlq_record(&self, payload: &str, score: f64) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .dlq
            .push((payload.to_string(), score));
        Ok(())
    }

    async fn dlq_scan_desc(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut entries = inner.dlq.clone();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(entries.into_iter().map(|(payload, _)| payload).collect())
    }

    async fn dlq_remove(&self, payload: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.dlq.len();
        inner.dlq.retain(|(p, _)| p != payload);
        Ok((before - inner.dlq.len()) as u64)
    }

    async fn dlq_requeue(&self, entry: &str, task_payload: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.dlq.retain(|(p, _)| p != entry);
        inner.ready.push_front(task_payload.to_string());
        Ok(())
    }

    async fn dlq_len(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().unwrap().dlq.len() as u64)
    }

    async fn dlq_purge(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.dlq.len() as u64;
        inner.dlq.clear();
        Ok(count)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn purge_all(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ready.clear();
        inner.processing.clear();
        inner.delayed.clear();
        inner.dlq.clear();
        Ok(())
    }
}
