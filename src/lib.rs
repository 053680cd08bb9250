//! Booker-Q: a Redis-backed delayed task queue and the event-booking
//! reservation engine built on top of it.
//!
//! The crate is the shared core of a family of small web services. It
//! provides:
//! - **A reliable task queue** over Redis: immediate tasks on a FIFO ready
//!   list, scheduled tasks in a sorted set scored by execution time, a
//!   background promoter that moves due tasks across, and a consumer that
//!   executes tasks with exponential-backoff retry
//! - **A dead-letter store** for tasks that fail terminally, with list,
//!   requeue, delete, purge and stats operations
//! - **A reservation engine** that books a finite number of seats per event
//!   under concurrent demand, enforces the pending → confirmed / expired /
//!   cancelled lifecycle with a confirmation deadline, and drives that
//!   lifecycle through the queue
//! - **Safety-net workers** (a minute-cadence scheduler and a slow cleanup
//!   worker) that sweep overdue pending bookings even when the queue is
//!   down, making the system self-healing
//! - **Postgres persistence** for events, users and bookings, with seat
//!   capacity and duplicate-booking invariants enforced inside transactions
//!
//! Handler execution is at-least-once; every task handler in this crate is
//! idempotent per task id, and the expire transition in particular can be
//! fired by the queue, the scheduler and the cleanup worker for the same
//! booking without harm.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use booker_q::{
//!     create_redis_pool, BookSeatsRequest, BookingConfig, BookingService, CleanupWorker,
//!     DatabaseConfig, ExpirationScheduler, LogSink, PgBookingRepository, PgEventRepository,
//!     PgUserRepository, QueueConfig, QueueKeys, RedisConfig, RedisStore, SystemClock,
//!     TaskQueue, TaskRouter, WorkerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let clock = Arc::new(SystemClock);
//!
//!     // Task queue over Redis.
//!     let queue_config = QueueConfig::default();
//!     let pool = create_redis_pool(&RedisConfig::default()).await?;
//!     let store = Arc::new(RedisStore::new(pool, QueueKeys::new(&queue_config.namespace)));
//!     let queue = Arc::new(TaskQueue::new(store, queue_config));
//!     queue.recover_in_flight().await?;
//!
//!     // Relational store.
//!     let db = booker_q::store::postgres::connect(&DatabaseConfig::default()).await?;
//!     booker_q::store::postgres::run_migrations(&db).await?;
//!     let bookings = Arc::new(PgBookingRepository::new(db.clone(), clock.clone()));
//!     let events = Arc::new(PgEventRepository::new(db.clone(), clock.clone()));
//!     let users = Arc::new(PgUserRepository::new(db.clone(), clock.clone()));
//!
//!     // Reservation engine, wired to the queue and a notification sink.
//!     let sink = Arc::new(LogSink);
//!     let service = Arc::new(
//!         BookingService::new(bookings, events.clone(), users.clone(), BookingConfig::default())
//!             .with_queue(queue.clone())
//!             .with_sink(sink.clone()),
//!     );
//!     let router = Arc::new(TaskRouter::new(
//!         service.clone(),
//!         events,
//!         users,
//!         sink,
//!         clock.clone(),
//!     ));
//!     queue.subscribe(router)?;
//!
//!     // Safety-net workers.
//!     let worker_config = WorkerConfig::default();
//!     let cancel = CancellationToken::new();
//!     ExpirationScheduler::new(
//!         service.clone(),
//!         worker_config.scheduler_interval,
//!         cancel.child_token(),
//!     )
//!     .spawn();
//!     CleanupWorker::new(
//!         service.clone(),
//!         clock,
//!         worker_config.cleanup_interval,
//!         cancel.child_token(),
//!     )
//!     .spawn();
//!
//!     // Reserve three seats; the engine writes the pending booking and
//!     // schedules the expire/remind/notify tasks.
//!     let booking = service
//!         .book_seats(BookSeatsRequest {
//!             event_id: 1,
//!             user_id: 1,
//!             seats: 3,
//!             timeout_minutes: None,
//!         })
//!         .await?;
//!     service.confirm_booking(booking.id).await?;
//!
//!     cancel.cancel();
//!     queue.close().await;
//!     Ok(())
//! }
//! ```

pub mod booking;
pub mod clock;
pub mod config;
pub mod notify;
pub mod queue;
pub mod store;

pub use booking::handlers::TaskRouter;
pub use booking::model::{
    Booking, BookingDetails, BookingError, BookingStatus, Event, EventWithAvailability,
    NewBooking, NewEvent, NewUser, OverdueBooking, User,
};
pub use booking::scheduler::ExpirationScheduler;
pub use booking::service::{BookSeatsRequest, BookingService};
pub use booking::worker::CleanupWorker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BookingConfig, DatabaseConfig, QueueConfig, RedisConfig, WorkerConfig};
pub use notify::{LogSink, NoopSink, NotificationSink, NotifyError};
pub use queue::dlq::{DeadLetterStore, DlqStats, FailedTask};
pub use queue::error::{HandlerError, QueueError, StoreError};
pub use queue::queue::{QueueStats, TaskHandler, TaskPublisher, TaskQueue};
pub use queue::redis::{create_redis_pool, RedisStore};
pub use queue::retry::RetryPolicy;
pub use queue::store::{QueueDepths, QueueKeys, QueueStore};
pub use queue::task::{NotificationKind, Task, TaskKind};
pub use store::booking::PgBookingRepository;
pub use store::event::PgEventRepository;
pub use store::user::PgUserRepository;
pub use store::{BookingRepository, EventRepository, UserRepository};
