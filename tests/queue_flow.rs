//! Queue-driven flows with the full stack wired together: the promoter, the
//! consumer, the task router, the reservation engine and the dead-letter
//! store, all over in-memory backends under a paused Tokio clock.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use tokio::time::sleep;

use booker_q::queue::testing::MemoryStore;
use booker_q::store::memory::MemoryDatabase;
use booker_q::{
    Booking, BookSeatsRequest, BookingConfig, BookingService, BookingStatus, Clock,
    EventRepository, ManualClock, NewEvent, NewUser, NotificationKind, NotificationSink,
    NotifyError, QueueConfig, Task, TaskKind, TaskQueue, TaskRouter, UserRepository,
};

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), NotifyError> {
        self.messages
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string()));
        Ok(())
    }
}

struct Stack {
    queue: Arc<TaskQueue>,
    store: Arc<MemoryStore>,
    db: Arc<MemoryDatabase>,
    service: Arc<BookingService>,
    sink: Arc<RecordingSink>,
    clock: ManualClock,
}

/// Wire the whole system together and start consuming.
fn stack() -> Stack {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 11, 14, 12, 0, 0).unwrap());
    let store = Arc::new(MemoryStore::new());
    let config = QueueConfig {
        queue_timeout: StdDuration::from_millis(50),
        base_delay: StdDuration::from_millis(100),
        promote_interval: StdDuration::from_secs(10),
        ..QueueConfig::default()
    };
    let queue = Arc::new(TaskQueue::with_clock(
        store.clone(),
        config,
        Arc::new(clock.clone()),
    ));

    let db = Arc::new(MemoryDatabase::new(Arc::new(clock.clone())));
    let sink = Arc::new(RecordingSink::default());
    let service = Arc::new(
        BookingService::new(db.clone(), db.clone(), db.clone(), BookingConfig::default())
            .with_queue(queue.clone())
            .with_sink(sink.clone())
            .with_clock(Arc::new(clock.clone())),
    );
    let router = Arc::new(TaskRouter::new(
        service.clone(),
        db.clone(),
        db.clone(),
        sink.clone(),
        Arc::new(clock.clone()),
    ));
    queue.subscribe(router).unwrap();

    Stack {
        queue,
        store,
        db,
        service,
        sink,
        clock,
    }
}

async fn seed_event(stack: &Stack, total_seats: i32) -> i64 {
    EventRepository::create(
        stack.db.as_ref(),
        NewEvent {
            title: "Rust Meetup".to_string(),
            description: String::new(),
            date: stack.clock.now() + Duration::days(7),
            total_seats,
        },
    )
    .await
    .unwrap()
    .id
}

async fn seed_user(stack: &Stack, email: &str, handle: Option<&str>) -> i64 {
    UserRepository::create(
        stack.db.as_ref(),
        NewUser {
            email: email.to_string(),
            name: "Ada".to_string(),
            messaging_id: handle.map(str::to_string),
        },
    )
    .await
    .unwrap()
    .id
}

async fn book(stack: &Stack, event_id: i64, user_id: i64, timeout_minutes: i32) -> Booking {
    stack
        .service
        .book_seats(BookSeatsRequest {
            event_id,
            user_id,
            seats: 2,
            timeout_minutes: Some(timeout_minutes),
        })
        .await
        .unwrap()
}

// Polls every 250 virtual milliseconds, enough to march the paused clock
// through the promoter's ten-second tick within the iteration bound.
async fn wait_for_status(stack: &Stack, booking_id: i64, status: BookingStatus) {
    for _ in 0..2000 {
        if stack.service.get_booking(booking_id).await.unwrap().status == status {
            return;
        }
        sleep(StdDuration::from_millis(250)).await;
    }
    panic!("booking {booking_id} never reached {status}");
}

async fn wait_for_dlq(stack: &Stack, count: u64) {
    for _ in 0..2000 {
        if stack.queue.stats().await.unwrap().dlq == count {
            return;
        }
        sleep(StdDuration::from_millis(250)).await;
    }
    panic!("DLQ never reached {count} entries");
}

#[tokio::test(start_paused = true)]
async fn queue_expires_booking_after_its_deadline() {
    let stack = stack();
    let event_id = seed_event(&stack, 5).await;
    let user_id = seed_user(&stack, "ada@example.com", Some("@ada")).await;

    let booking = book(&stack, event_id, user_id, 1).await;
    assert_eq!(booking.status, BookingStatus::Pending);

    // Past the deadline the promoter moves the expire task across and the
    // handler flips the booking.
    stack.clock.set(booking.expires_at + Duration::seconds(1));
    wait_for_status(&stack, booking.id, BookingStatus::Expired).await;

    // Seats are available again.
    let event = EventRepository::get(stack.db.as_ref(), event_id).await.unwrap();
    assert_eq!(event.available_seats, 5);

    // The user heard about it.
    let messages = stack.sink.messages();
    assert!(messages
        .iter()
        .any(|(to, text)| to == "@ada" && text.contains("deadline passed")));

    stack.queue.close().await;
}

#[tokio::test(start_paused = true)]
async fn expire_task_survives_confirmation_as_a_no_op() {
    let stack = stack();
    let event_id = seed_event(&stack, 5).await;
    let user_id = seed_user(&stack, "ada@example.com", Some("@ada")).await;

    let booking = book(&stack, event_id, user_id, 30).await;
    stack.service.confirm_booking(booking.id).await.unwrap();

    // Let the deadline pass; the queued expire task fires and must leave
    // the confirmed booking alone.
    stack.clock.set(booking.expires_at + Duration::seconds(1));
    for _ in 0..40 {
        sleep(StdDuration::from_secs(1)).await;
    }

    assert_eq!(
        stack.service.get_booking(booking.id).await.unwrap().status,
        BookingStatus::Confirmed
    );
    assert_eq!(stack.queue.stats().await.unwrap().dlq, 0);

    stack.queue.close().await;
}

#[tokio::test(start_paused = true)]
async fn reminder_fires_fifteen_minutes_before_the_deadline() {
    let stack = stack();
    let event_id = seed_event(&stack, 5).await;
    let user_id = seed_user(&stack, "ada@example.com", Some("@ada")).await;

    let booking = book(&stack, event_id, user_id, 30).await;

    stack
        .clock
        .set(booking.expires_at - Duration::minutes(14));
    for _ in 0..40 {
        sleep(StdDuration::from_secs(1)).await;
        if stack
            .sink
            .messages()
            .iter()
            .any(|(_, text)| text.contains("Confirm it to keep your seats"))
        {
            break;
        }
    }

    let messages = stack.sink.messages();
    assert!(messages
        .iter()
        .any(|(to, text)| to == "@ada" && text.contains("Confirm it to keep your seats")));
    // Still pending: a reminder is not a transition.
    assert_eq!(
        stack.service.get_booking(booking.id).await.unwrap().status,
        BookingStatus::Pending
    );

    stack.queue.close().await;
}

#[tokio::test(start_paused = true)]
async fn expire_task_for_missing_booking_lands_in_the_dlq() {
    let stack = stack();

    let task = Task::new(TaskKind::ExpireBooking {
        booking_id: 404,
        event_id: 1,
        user_id: 1,
        expires_at: stack.clock.now(),
    })
    .with_id("expire_booking_404");
    stack.queue.publish(task).await.unwrap();

    wait_for_dlq(&stack, 1).await;
    stack.queue.close().await;

    // No retries: not-found is terminal, so the handler ran exactly once.
    assert_eq!(stack.store.metric("tasks_failure"), 1);

    let failed = stack.queue.dead_letters().list(0).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task_id(), Some("expire_booking_404"));
    assert!(failed[0].error.contains("not found"));
    assert_eq!(failed[0].attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn cleanup_task_sweeps_overdue_bookings() {
    let stack = stack();
    let event_id = seed_event(&stack, 5).await;
    let user_id = seed_user(&stack, "ada@example.com", None).await;

    let booking = book(&stack, event_id, user_id, 1).await;

    // Drop the booking's own expire task so only the bulk sweep can act.
    stack.queue.purge().await.unwrap();

    stack.clock.set(booking.expires_at + Duration::hours(2));
    stack
        .queue
        .publish(Task::new(TaskKind::CleanupExpired {
            expired_before: None,
        }))
        .await
        .unwrap();

    wait_for_status(&stack, booking.id, BookingStatus::Expired).await;
    stack.queue.close().await;
}

#[tokio::test(start_paused = true)]
async fn event_cancellation_notifies_confirmed_attendees() {
    let stack = stack();
    let event_id = seed_event(&stack, 10).await;
    let confirmed_user = seed_user(&stack, "ada@example.com", Some("@ada")).await;
    let pending_user = seed_user(&stack, "bob@example.com", Some("@bob")).await;

    let confirmed = book(&stack, event_id, confirmed_user, 30).await;
    stack.service.confirm_booking(confirmed.id).await.unwrap();
    let _pending = book(&stack, event_id, pending_user, 30).await;

    stack
        .queue
        .publish(Task::new(TaskKind::SendNotification(
            NotificationKind::EventCancelled {
                event_id,
                reason: Some("venue flooded".to_string()),
            },
        )))
        .await
        .unwrap();

    for _ in 0..100 {
        sleep(StdDuration::from_millis(100)).await;
        if stack
            .sink
            .messages()
            .iter()
            .any(|(_, text)| text.contains("venue flooded"))
        {
            break;
        }
    }
    stack.queue.close().await;

    let messages = stack.sink.messages();
    let cancellations: Vec<_> = messages
        .iter()
        .filter(|(_, text)| text.contains("venue flooded"))
        .collect();
    assert_eq!(cancellations.len(), 1);
    assert_eq!(cancellations[0].0, "@ada");
}

#[tokio::test(start_paused = true)]
async fn dead_letter_requeue_gives_a_task_a_fresh_budget() {
    let stack = stack();

    let task = Task::new(TaskKind::ExpireBooking {
        booking_id: 404,
        event_id: 1,
        user_id: 1,
        expires_at: stack.clock.now(),
    })
    .with_id("expire_booking_404");
    stack.queue.publish(task).await.unwrap();
    wait_for_dlq(&stack, 1).await;

    // The booking still does not exist, so the requeued task fails again
    // and comes straight back: the queue never loses it.
    stack.queue.dead_letters().requeue("expire_booking_404").await.unwrap();
    wait_for_dlq(&stack, 1).await;

    let failed = stack.queue.dead_letters().list(0).await.unwrap();
    assert_eq!(failed[0].task_id(), Some("expire_booking_404"));
    assert_eq!(failed[0].attempts, 1);

    stack.queue.close().await;
}
