use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::queue::dlq::DeadLetterStore;
use crate::queue::error::{HandlerError, QueueError};
use crate::queue::retry::RetryPolicy;
use crate::queue::store::QueueStore;
use crate::queue::task::{unix_score, Task};

const SNAPSHOT_TTL: Duration = Duration::from_secs(120);
const POP_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Consumer-side contract. The handler is invoked once per attempt and must
/// be idempotent per task id: execution is at-least-once, and a crash between
/// a successful run and the processing-list acknowledgement replays the task
/// on recovery.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

/// Producer-side contract, implemented by [`TaskQueue`] and by test stubs.
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    async fn publish(&self, task: Task) -> Result<(), QueueError>;
}

/// Point-in-time sizes of the queue containers.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub delayed: u64,
    pub processing: u64,
    pub dlq: u64,
    pub timestamp: DateTime<Utc>,
}

struct Shared {
    store: Arc<dyn QueueStore>,
    dlq: DeadLetterStore,
    retry: RetryPolicy,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Shared {
    async fn bump_metric(&self, name: &str, by: i64) {
        if !self.config.enable_metrics {
            return;
        }
        if let Err(e) = self.store.incr_metric(name, by).await {
            debug!(metric = name, error = %e, "failed to increment queue metric");
        }
    }

    async fn ack(&self, payload: &str) {
        if let Err(e) = self.store.ack_processing(payload).await {
            error!(error = %e, "failed to remove task from processing list");
        }
    }
}

/// Reliable delayed task queue over a key-value store.
///
/// Immediate tasks live on a FIFO ready list, scheduled tasks in a sorted set
/// scored by execution time. [`subscribe`](TaskQueue::subscribe) starts three
/// background workers: a promoter that moves due delayed tasks onto the ready
/// list, a consumer that executes tasks with retry and ships terminal
/// failures to the dead-letter store, and a monitor that snapshots container
/// depths. A task's position in a container is its state; nothing else is
/// persisted about in-flight work.
pub struct TaskQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    subscribed: AtomicBool,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Build a queue around an explicit time source. Tests use this with
    /// [`ManualClock`](crate::clock::ManualClock).
    pub fn with_clock(
        store: Arc<dyn QueueStore>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dlq = DeadLetterStore::new(store.clone(), clock.clone());
        let retry = RetryPolicy::new(config.base_delay);
        Self {
            shared: Arc::new(Shared {
                store,
                dlq,
                retry,
                config,
                clock,
                cancel: CancellationToken::new(),
            }),
            workers: Mutex::new(Vec::new()),
            subscribed: AtomicBool::new(false),
        }
    }

    /// Send one task to the queue. Defaults are applied first: a generated
    /// id when empty, the creation stamp, the configured retry budget. Tasks
    /// whose `execute_at` is unset or already past go straight to the ready
    /// list, everything else to the delayed set.
    pub async fn publish(&self, mut task: Task) -> Result<(), QueueError> {
        let now = self.shared.clock.now();
        task.apply_defaults(now, self.shared.config.max_retries);
        let payload = serde_json::to_string(&task)?;

        match task.execute_at {
            Some(at) if at > now => {
                self.shared
                    .store
                    .add_delayed(&payload, unix_score(at))
                    .await?;
                self.shared.bump_metric("tasks_delayed", 1).await;
                info!(
                    task_id = %task.id,
                    task_type = task.kind.name(),
                    execute_at = %at.to_rfc3339(),
                    "task scheduled for later execution"
                );
            }
            _ => {
                self.shared.store.push_ready(&payload).await?;
                self.shared.bump_metric("tasks_queued", 1).await;
                info!(
                    task_id = %task.id,
                    task_type = task.kind.name(),
                    "task published to ready list"
                );
            }
        }
        Ok(())
    }

    /// Publish several tasks in one pipelined round-trip. Tasks that fail to
    /// serialize are skipped with a warning and do not abort their siblings.
    pub async fn publish_batch(&self, tasks: Vec<Task>) -> Result<(), QueueError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let now = self.shared.clock.now();
        let mut ready = Vec::new();
        let mut delayed = Vec::new();

        for mut task in tasks {
            task.apply_defaults(now, self.shared.config.max_retries);
            let payload = match serde_json::to_string(&task) {
                Ok(p) => p,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "skipping unserializable task in batch");
                    continue;
                }
            };
            match task.execute_at {
                Some(at) if at > now => delayed.push((payload, unix_score(at))),
                _ => ready.push(payload),
            }
        }

        self.shared.store.enqueue_many(&ready, &delayed).await?;
        if !ready.is_empty() {
            self.shared
                .bump_metric("tasks_queued", ready.len() as i64)
                .await;
        }
        if !delayed.is_empty() {
            self.shared
                .bump_metric("tasks_delayed", delayed.len() as i64)
                .await;
        }
        info!(
            ready = ready.len(),
            delayed = delayed.len(),
            "published task batch"
        );
        Ok(())
    }

    /// Start consuming: spawns the delayed promoter, the consumer and the
    /// metrics monitor, then returns. At most one subscriber per queue.
    pub fn subscribe(&self, handler: Arc<dyn TaskHandler>) -> Result<(), QueueError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadySubscribed);
        }

        let mut workers = self.workers.lock().unwrap();
        workers.push(tokio::spawn(promoter_loop(self.shared.clone())));
        workers.push(tokio::spawn(consumer_loop(self.shared.clone(), handler)));
        workers.push(tokio::spawn(metrics_loop(self.shared.clone())));
        info!("task queue subscriber started");
        Ok(())
    }

    /// One promotion pass outside the ticker, for callers that need the
    /// delayed scan right now.
    pub async fn promote_due(&self) -> Result<u64, QueueError> {
        let now = unix_score(self.shared.clock.now());
        Ok(self.shared.store.promote_due(now).await?)
    }

    /// Push everything stranded on the processing list back to ready.
    /// Intended for startup, before [`subscribe`](TaskQueue::subscribe):
    /// tasks interrupted by a crash replay from the ready list.
    pub async fn recover_in_flight(&self) -> Result<u64, QueueError> {
        let recovered = self.shared.store.requeue_processing().await?;
        if recovered > 0 {
            info!(recovered, "recovered in-flight tasks from previous run");
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let depths = self.shared.store.depths().await?;
        Ok(QueueStats {
            ready: depths.ready,
            delayed: depths.delayed,
            processing: depths.processing,
            dlq: depths.dlq,
            timestamp: self.shared.clock.now(),
        })
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.shared.dlq
    }

    pub async fn health_check(&self) -> Result<(), QueueError> {
        Ok(self.shared.store.ping().await?)
    }

    /// Delete every container this queue owns. Destructive.
    pub async fn purge(&self) -> Result<(), QueueError> {
        self.shared.store.purge_all().await?;
        info!("all queue containers purged");
        Ok(())
    }

    /// Signal the workers to stop and wait for them to finish their current
    /// iteration.
    pub async fn close(&self) {
        info!("stopping task queue");
        self.shared.cancel.cancel();
        let drained: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap();
            workers.drain(..).collect()
        };
        for handle in drained {
            let _ = handle.await;
        }
        info!("task queue stopped");
    }
}

#[async_trait]
impl TaskPublisher for TaskQueue {
    async fn publish(&self, task: Task) -> Result<(), QueueError> {
        TaskQueue::publish(self, task).await
    }
}

enum Outcome {
    Completed(Task),
    Dead(Task, HandlerError),
    Cancelled(Task),
}

async fn promoter_loop(shared: Arc<Shared>) {
    debug!("delayed promoter started");
    let mut ticker = interval(shared.config.promote_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = unix_score(shared.clock.now());
        match shared.store.promote_due(now).await {
            Ok(0) => {}
            Ok(moved) => {
                shared
                    .bump_metric("tasks_delayed_processed", moved as i64)
                    .await;
                info!(moved, "promoted delayed tasks to ready list");
            }
            Err(e) => error!(error = %e, "failed to promote delayed tasks"),
        }
    }
    debug!("delayed promoter stopped");
}

async fn consumer_loop(shared: Arc<Shared>, handler: Arc<dyn TaskHandler>) {
    debug!("consumer loop started");
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        let popped = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            res = shared.store.pop_to_processing(shared.config.queue_timeout) => res,
        };

        let payload = match popped {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "failed to pop task from ready list");
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = sleep(POP_ERROR_BACKOFF) => {}
                }
                continue;
            }
        };

        let task = match serde_json::from_str::<Task>(&payload) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "malformed task payload, parking in DLQ");
                if shared.config.enable_dlq {
                    shared
                        .dlq
                        .record_raw(&payload, &format!("invalid task format: {e}"))
                        .await;
                    shared.bump_metric("tasks_dlq", 1).await;
                }
                shared.ack(&payload).await;
                continue;
            }
        };

        let outcome = execute_with_retry(&shared, task, handler.as_ref()).await;
        let cancelled = matches!(&outcome, Outcome::Cancelled(_));
        match outcome {
            Outcome::Completed(task) => {
                shared.bump_metric("tasks_success", 1).await;
                shared
                    .bump_metric(&format!("tasks_success_{}", task.kind.name()), 1)
                    .await;
                info!(task_id = %task.id, attempts = task.attempts, "task completed");
            }
            Outcome::Dead(task, err) => {
                error!(
                    task_id = %task.id,
                    attempts = task.attempts,
                    error = %err,
                    "task failed permanently"
                );
                if shared.config.enable_dlq {
                    shared.dlq.record(&task, err.message()).await;
                    shared.bump_metric("tasks_dlq", 1).await;
                }
            }
            Outcome::Cancelled(task) => {
                warn!(task_id = %task.id, "shutdown interrupted retry backoff");
                if shared.config.enable_dlq {
                    shared
                        .dlq
                        .record(&task, "queue shutdown during retry")
                        .await;
                }
            }
        }
        // The processing list is the only recovery anchor; clear it on every
        // terminal outcome.
        shared.ack(&payload).await;
        if cancelled {
            break;
        }
    }
    debug!("consumer loop stopped");
}

async fn execute_with_retry(shared: &Shared, mut task: Task, handler: &dyn TaskHandler) -> Outcome {
    loop {
        task.attempts += 1;
        debug!(
            task_id = %task.id,
            task_type = task.kind.name(),
            attempt = task.attempts,
            max_retries = task.max_retries,
            "executing task"
        );

        let err = match handler.handle(&task).await {
            Ok(()) => return Outcome::Completed(task),
            Err(err) => err,
        };

        shared.bump_metric("tasks_failure", 1).await;
        shared
            .bump_metric(&format!("tasks_failure_{}", task.kind.name()), 1)
            .await;

        let (retry, delay) = shared.retry.should_retry(&task, &err);
        if !retry {
            return Outcome::Dead(task, err);
        }

        warn!(
            task_id = %task.id,
            attempt = task.attempts,
            max_retries = task.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "task failed, retrying"
        );

        let jitter = Duration::from_micros(rand::thread_rng().gen_range(0..1000));
        tokio::select! {
            _ = shared.cancel.cancelled() => return Outcome::Cancelled(task),
            _ = sleep(delay + jitter) => {}
        }
    }
}

async fn metrics_loop(shared: Arc<Shared>) {
    if !shared.config.enable_metrics {
        return;
    }
    debug!("metrics monitor started");
    let mut ticker = interval(shared.config.metrics_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match shared.store.depths().await {
            Ok(depths) => {
                let snapshot = serde_json::json!({
                    "queue_main_len": depths.ready,
                    "queue_delayed_len": depths.delayed,
                    "queue_processing_len": depths.processing,
                    "queue_dlq_len": depths.dlq,
                    "timestamp": shared.clock.now().timestamp(),
                });
                if let Err(e) = shared
                    .store
                    .store_snapshot(&snapshot.to_string(), SNAPSHOT_TTL)
                    .await
                {
                    error!(error = %e, "failed to store queue metrics snapshot");
                }
                if depths.ready > shared.config.dlq_threshold {
                    warn!(
                        ready = depths.ready,
                        threshold = shared.config.dlq_threshold,
                        "ready list size exceeds threshold"
                    );
                }
            }
            Err(e) => error!(error = %e, "failed to collect queue metrics"),
        }
    }
    debug!("metrics monitor stopped");
}
