use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::booking::model::{
    Booking, BookingDetails, BookingError, BookingStatus, OverdueBooking,
};
use crate::clock::{Clock, SystemClock};
use crate::config::BookingConfig;
use crate::notify::NotificationSink;
use crate::queue::error::QueueError;
use crate::queue::queue::TaskPublisher;
use crate::queue::task::{NotificationKind, Task, TaskKind};
use crate::store::{BookingRepository, EventRepository, UserRepository};

/// Input to [`BookingService::book_seats`].
#[derive(Debug, Clone)]
pub struct BookSeatsRequest {
    pub event_id: i64,
    pub user_id: i64,
    pub seats: i32,
    /// Confirmation window in minutes; the configured default applies when
    /// absent or zero.
    pub timeout_minutes: Option<i32>,
}

/// The reservation engine: transactional seat allocation with a deadline,
/// driven to its terminal states by the task queue and the sweep workers.
///
/// The engine validates and fails fast; the repositories re-check every
/// invariant inside their transactions, so concurrent requests racing for
/// the last seats serialize there and the loser gets a deterministic
/// insufficient-seats error.
pub struct BookingService {
    bookings: Arc<dyn BookingRepository>,
    events: Arc<dyn EventRepository>,
    users: Arc<dyn UserRepository>,
    queue: Option<Arc<dyn TaskPublisher>>,
    sink: Option<Arc<dyn NotificationSink>>,
    clock: Arc<dyn Clock>,
    config: BookingConfig,
}

impl BookingService {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        events: Arc<dyn EventRepository>,
        users: Arc<dyn UserRepository>,
        config: BookingConfig,
    ) -> Self {
        Self {
            bookings,
            events,
            users,
            queue: None,
            sink: None,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Attach the task queue. Without one the engine still works; the sweep
    /// workers then carry expiration alone.
    pub fn with_queue(mut self, queue: Arc<dyn TaskPublisher>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Attach a notification transport for sweep-side expiration notices.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reserve seats: validates the event, user and capacity, writes a
    /// pending booking with its deadline in one transaction, then publishes
    /// the expire/remind/notify tasks. Publish failures are logged and do
    /// not roll back the booking; the sweep workers are the safety net.
    pub async fn book_seats(&self, req: BookSeatsRequest) -> Result<Booking, BookingError> {
        if req.seats < 1 {
            return Err(BookingError::Validation(
                "seats must be at least 1".to_string(),
            ));
        }
        if req.seats > self.config.max_seats_per_booking {
            return Err(BookingError::Validation(format!(
                "seats may not exceed {} per booking",
                self.config.max_seats_per_booking
            )));
        }
        let timeout_minutes = match req.timeout_minutes {
            None | Some(0) => self.config.default_timeout_minutes,
            Some(t) if !(1..=1440).contains(&t) => {
                return Err(BookingError::Validation(
                    "reservation timeout must be between 1 and 1440 minutes".to_string(),
                ));
            }
            Some(t) => t,
        };

        let event = self.events.get(req.event_id).await?;
        let now = self.clock.now();
        if event.event.date <= now {
            return Err(BookingError::EventInPast);
        }
        if event.available_seats < req.seats {
            return Err(BookingError::InsufficientSeats {
                requested: req.seats,
                available: event.available_seats,
            });
        }

        self.users.get(req.user_id).await?;

        if self
            .bookings
            .get_active_by_event_and_user(req.event_id, req.user_id)
            .await?
            .is_some()
        {
            return Err(BookingError::DuplicateBooking);
        }

        let booking = self
            .bookings
            .create(crate::booking::model::NewBooking {
                event_id: req.event_id,
                user_id: req.user_id,
                seats: req.seats,
                timeout_minutes,
            })
            .await?;

        info!(
            booking_id = booking.id,
            event_id = booking.event_id,
            user_id = booking.user_id,
            seats = booking.seats,
            expires_at = %booking.expires_at.to_rfc3339(),
            "booking created"
        );

        if let Some(queue) = &self.queue {
            if let Err(e) = self.schedule_booking_tasks(queue.as_ref(), &booking).await {
                warn!(booking_id = booking.id, error = %e, "failed to schedule booking tasks");
            }
        }

        Ok(booking)
    }

    async fn schedule_booking_tasks(
        &self,
        queue: &dyn TaskPublisher,
        booking: &Booking,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();

        let expire = Task::new(TaskKind::ExpireBooking {
            booking_id: booking.id,
            event_id: booking.event_id,
            user_id: booking.user_id,
            expires_at: booking.expires_at,
        })
        .with_id(format!("expire_booking_{}_{}", booking.id, now.timestamp()))
        .at(booking.expires_at)
        .with_max_retries(3);
        queue.publish(expire).await?;

        let reminder_at = booking.expires_at - Duration::minutes(15);
        if reminder_at > now {
            let reminder = Task::new(TaskKind::ReminderNotification {
                booking_id: booking.id,
                event_id: booking.event_id,
                user_id: booking.user_id,
            })
            .with_id(format!("reminder_booking_{}_{}", booking.id, now.timestamp()))
            .at(reminder_at)
            .with_max_retries(2);
            queue.publish(reminder).await?;
        }

        let created = Task::new(TaskKind::SendNotification(NotificationKind::BookingCreated {
            booking_id: booking.id,
            event_id: booking.event_id,
            user_id: booking.user_id,
        }))
        .with_id(format!(
            "notification_booking_created_{}_{}",
            booking.id,
            now.timestamp()
        ))
        .at(now + Duration::seconds(5))
        .with_max_retries(3);
        queue.publish(created).await?;

        Ok(())
    }

    /// Confirm a pending booking before its deadline. Capacity is re-checked
    /// under the repository transaction because other bookings may have been
    /// confirmed since this one was created. Confirming past the deadline
    /// drives the booking to expired and fails.
    pub async fn confirm_booking(&self, booking_id: i64) -> Result<(), BookingError> {
        let booking = self.bookings.get(booking_id).await?;

        if booking.status != BookingStatus::Pending {
            return Err(BookingError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::Confirmed,
            });
        }

        let now = self.clock.now();
        if now > booking.expires_at {
            self.bookings
                .update_status(booking_id, BookingStatus::Expired)
                .await?;
            info!(booking_id, "confirmation arrived past the deadline, booking expired");
            return Err(BookingError::BookingExpired);
        }

        self.bookings
            .update_status(booking_id, BookingStatus::Confirmed)
            .await?;
        info!(booking_id, "booking confirmed");

        if let Some(queue) = &self.queue {
            let task = Task::new(TaskKind::SendNotification(
                NotificationKind::BookingConfirmed {
                    booking_id,
                    event_id: booking.event_id,
                    user_id: booking.user_id,
                },
            ))
            .with_id(format!(
                "notification_booking_confirmed_{}_{}",
                booking_id,
                now.timestamp()
            ))
            .at(now + Duration::seconds(2))
            .with_max_retries(3);
            if let Err(e) = queue.publish(task).await {
                warn!(booking_id, error = %e, "failed to schedule confirmation notification");
            }
        }

        Ok(())
    }

    /// Cancel a booking. A no-op when the booking is already cancelled or
    /// expired.
    pub async fn cancel_booking(&self, booking_id: i64, reason: &str) -> Result<(), BookingError> {
        let booking = self.bookings.get(booking_id).await?;

        match booking.status {
            BookingStatus::Cancelled | BookingStatus::Expired => {
                debug!(booking_id, "booking already terminal, cancel is a no-op");
                return Ok(());
            }
            BookingStatus::Pending | BookingStatus::Confirmed => {}
        }

        self.bookings
            .update_status(booking_id, BookingStatus::Cancelled)
            .await?;
        info!(booking_id, reason, "booking cancelled");

        if let Some(queue) = &self.queue {
            let message = match self.events.get(booking.event_id).await {
                Ok(event) => format!(
                    "Booking #{} for '{}' was cancelled: {}.",
                    booking_id, event.event.title, reason
                ),
                Err(_) => format!("Booking #{booking_id} was cancelled: {reason}."),
            };
            let task = Task::new(TaskKind::SendNotification(NotificationKind::CustomMessage {
                user_ids: vec![booking.user_id],
                message,
            }))
            .with_id(format!(
                "notification_booking_cancelled_{}_{}",
                booking_id,
                self.clock.now().timestamp()
            ))
            .with_max_retries(3);
            if let Err(e) = queue.publish(task).await {
                warn!(booking_id, error = %e, "failed to schedule cancellation notification");
            }
        }

        Ok(())
    }

    /// Drive a pending booking to expired; a no-op for any other status, so
    /// the queue handler, the scheduler and the cleanup worker can all fire
    /// for the same booking safely.
    pub async fn expire_booking(&self, booking_id: i64) -> Result<(), BookingError> {
        let booking = self.bookings.get(booking_id).await?;
        if booking.status != BookingStatus::Pending {
            debug!(booking_id, status = %booking.status, "booking not pending, expire is a no-op");
            return Ok(());
        }
        self.bookings
            .update_status(booking_id, BookingStatus::Expired)
            .await?;
        info!(booking_id, "booking expired");
        Ok(())
    }

    /// Bulk sweep: flip every pending booking whose deadline has passed to
    /// expired, notifying each affected user. Continues past individual
    /// failures and returns the number expired.
    pub async fn cancel_expired_bookings(&self) -> Result<u64, BookingError> {
        let now = self.clock.now();
        let overdue = self.bookings.list_overdue_pending(now).await?;
        let mut expired = 0u64;

        for row in &overdue {
            if let Err(e) = self
                .bookings
                .update_status(row.booking_id, BookingStatus::Expired)
                .await
            {
                warn!(booking_id = row.booking_id, error = %e, "failed to expire overdue booking");
                continue;
            }
            expired += 1;
            self.notify_expired(row).await;
        }

        if expired > 0 {
            info!(expired, "expired overdue bookings");
        }
        Ok(expired)
    }

    async fn notify_expired(&self, row: &OverdueBooking) {
        let Some(sink) = &self.sink else { return };
        let Some(handle) = &row.messaging_id else { return };
        let text = format!(
            "Booking #{} for '{}' expired and was released.",
            row.booking_id, row.event_title
        );
        if let Err(e) = sink.send(handle, &text).await {
            warn!(booking_id = row.booking_id, error = %e, "failed to send expiration notice");
        }
    }

    /// Pending bookings whose deadline passed before `before`.
    pub async fn overdue_bookings(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<OverdueBooking>, BookingError> {
        self.bookings.list_overdue_pending(before).await
    }

    /// Change the seat count of a pending booking, bounded by the event's
    /// current availability. The deadline stays as it was.
    pub async fn update_booking_seats(
        &self,
        booking_id: i64,
        seats: i32,
    ) -> Result<(), BookingError> {
        if seats < 1 {
            return Err(BookingError::Validation(
                "seats must be at least 1".to_string(),
            ));
        }
        if seats > self.config.max_seats_per_booking {
            return Err(BookingError::Validation(format!(
                "seats may not exceed {} per booking",
                self.config.max_seats_per_booking
            )));
        }

        let booking = self.bookings.get(booking_id).await?;
        if booking.status != BookingStatus::Pending {
            return Err(BookingError::Validation(
                "seat changes are only allowed while pending".to_string(),
            ));
        }

        let event = self.events.get(booking.event_id).await?;
        let delta = seats - booking.seats;
        if delta > event.available_seats {
            return Err(BookingError::InsufficientSeats {
                requested: seats,
                available: event.available_seats,
            });
        }

        self.bookings.update_seats(booking_id, seats).await?;
        info!(booking_id, seats, "booking seats updated");
        Ok(())
    }

    pub async fn get_booking(&self, booking_id: i64) -> Result<Booking, BookingError> {
        self.bookings.get(booking_id).await
    }

    pub async fn user_bookings(&self, user_id: i64) -> Result<Vec<Booking>, BookingError> {
        self.bookings.list_by_user(user_id).await
    }

    pub async fn event_bookings(&self, event_id: i64) -> Result<Vec<Booking>, BookingError> {
        self.bookings.list_by_event(event_id).await
    }

    /// Whether `seats` could currently be booked for the event.
    pub async fn check_availability(
        &self,
        event_id: i64,
        seats: i32,
    ) -> Result<bool, BookingError> {
        if seats < 1 {
            return Err(BookingError::Validation(
                "seats must be at least 1".to_string(),
            ));
        }
        let event = self.events.get(event_id).await?;
        if event.event.date <= self.clock.now() {
            return Err(BookingError::EventInPast);
        }
        Ok(event.available_seats >= seats)
    }

    /// One booking joined with its event, user and deadline view.
    pub async fn booking_details(&self, booking_id: i64) -> Result<BookingDetails, BookingError> {
        let booking = self.bookings.get(booking_id).await?;
        let event = self.events.get(booking.event_id).await?;
        let user = self.users.get(booking.user_id).await?;

        let (seconds_left, is_expired, can_confirm) = if booking.status == BookingStatus::Pending {
            let left = (booking.expires_at - self.clock.now()).num_seconds();
            if left >= 0 {
                (Some(left), false, true)
            } else {
                (None, true, false)
            }
        } else {
            (None, false, false)
        };

        Ok(BookingDetails {
            booking,
            event,
            user,
            seconds_left,
            is_expired,
            can_confirm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::model::{NewEvent, NewUser};
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryDatabase;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Publisher that records what the engine schedules.
    #[derive(Default)]
    struct RecordingPublisher {
        tasks: Mutex<Vec<Task>>,
    }

    impl RecordingPublisher {
        fn tasks(&self) -> Vec<Task> {
            self.tasks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskPublisher for RecordingPublisher {
        async fn publish(&self, task: Task) -> Result<(), QueueError> {
            self.tasks.lock().unwrap().push(task);
            Ok(())
        }
    }

    struct Fixture {
        service: BookingService,
        db: Arc<MemoryDatabase>,
        publisher: Arc<RecordingPublisher>,
        clock: ManualClock,
        event_id: i64,
        user_id: i64,
    }

    async fn fixture(total_seats: i32) -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 11, 14, 12, 0, 0).unwrap());
        let db = Arc::new(MemoryDatabase::new(Arc::new(clock.clone())));
        let publisher = Arc::new(RecordingPublisher::default());

        let event = EventRepository::create(
            db.as_ref(),
            NewEvent {
                title: "Rust Meetup".to_string(),
                description: "monthly".to_string(),
                date: clock.now() + Duration::days(7),
                total_seats,
            },
        )
        .await
        .unwrap();
        let user = UserRepository::create(
            db.as_ref(),
            NewUser {
                email: "ada@example.com".to_string(),
                name: "Ada".to_string(),
                messaging_id: Some("@ada".to_string()),
            },
        )
        .await
        .unwrap();

        let service = BookingService::new(
            db.clone(),
            db.clone(),
            db.clone(),
            BookingConfig::default(),
        )
        .with_queue(publisher.clone())
        .with_clock(Arc::new(clock.clone()));

        Fixture {
            service,
            db,
            publisher,
            clock,
            event_id: event.id,
            user_id: user.id,
        }
    }

    fn request(f: &Fixture, seats: i32) -> BookSeatsRequest {
        BookSeatsRequest {
            event_id: f.event_id,
            user_id: f.user_id,
            seats,
            timeout_minutes: None,
        }
    }

    #[tokio::test]
    async fn booking_creates_pending_claim_and_three_tasks() {
        let f = fixture(10).await;
        let booking = f.service.book_seats(request(&f, 3)).await.unwrap();

        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.expires_at, f.clock.now() + Duration::minutes(30));

        let tasks = f.publisher.tasks();
        assert_eq!(tasks.len(), 3);
        assert!(matches!(tasks[0].kind, TaskKind::ExpireBooking { .. }));
        assert_eq!(tasks[0].execute_at, Some(booking.expires_at));
        assert!(matches!(tasks[1].kind, TaskKind::ReminderNotification { .. }));
        assert_eq!(
            tasks[1].execute_at,
            Some(booking.expires_at - Duration::minutes(15))
        );
        assert!(matches!(
            tasks[2].kind,
            TaskKind::SendNotification(NotificationKind::BookingCreated { .. })
        ));
    }

    #[tokio::test]
    async fn short_timeouts_skip_the_reminder() {
        let f = fixture(10).await;
        let mut req = request(&f, 1);
        req.timeout_minutes = Some(10);
        f.service.book_seats(req).await.unwrap();

        let tasks = f.publisher.tasks();
        assert_eq!(tasks.len(), 2);
        assert!(!tasks
            .iter()
            .any(|t| matches!(t.kind, TaskKind::ReminderNotification { .. })));
    }

    #[tokio::test]
    async fn duplicate_active_booking_is_rejected() {
        let f = fixture(10).await;
        f.service.book_seats(request(&f, 2)).await.unwrap();
        assert!(matches!(
            f.service.book_seats(request(&f, 1)).await,
            Err(BookingError::DuplicateBooking)
        ));
    }

    #[tokio::test]
    async fn booking_every_last_seat_succeeds_once() {
        let f = fixture(3).await;
        let booking = f.service.book_seats(request(&f, 3)).await.unwrap();
        f.service.confirm_booking(booking.id).await.unwrap();

        let other = UserRepository::create(
            f.db.as_ref(),
            NewUser {
                email: "bob@example.com".to_string(),
                name: "Bob".to_string(),
                messaging_id: None,
            },
        )
        .await
        .unwrap();
        let err = f
            .service
            .book_seats(BookSeatsRequest {
                event_id: f.event_id,
                user_id: other.id,
                seats: 1,
                timeout_minutes: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BookingError::InsufficientSeats {
                requested: 1,
                available: 0
            }
        ));
    }

    #[tokio::test]
    async fn confirm_exactly_at_the_deadline_succeeds() {
        let f = fixture(10).await;
        let booking = f.service.book_seats(request(&f, 2)).await.unwrap();

        f.clock.set(booking.expires_at);
        f.service.confirm_booking(booking.id).await.unwrap();
        assert_eq!(
            f.service.get_booking(booking.id).await.unwrap().status,
            BookingStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn confirm_past_the_deadline_expires_the_booking() {
        let f = fixture(10).await;
        let booking = f.service.book_seats(request(&f, 2)).await.unwrap();

        f.clock.set(booking.expires_at + Duration::seconds(1));
        assert!(matches!(
            f.service.confirm_booking(booking.id).await,
            Err(BookingError::BookingExpired)
        ));
        assert_eq!(
            f.service.get_booking(booking.id).await.unwrap().status,
            BookingStatus::Expired
        );
    }

    #[tokio::test]
    async fn confirming_twice_is_a_conflict() {
        let f = fixture(10).await;
        let booking = f.service.book_seats(request(&f, 2)).await.unwrap();
        f.service.confirm_booking(booking.id).await.unwrap();
        assert!(matches!(
            f.service.confirm_booking(booking.id).await,
            Err(BookingError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn expire_is_idempotent_and_absorbing() {
        let f = fixture(10).await;
        let booking = f.service.book_seats(request(&f, 2)).await.unwrap();

        f.service.expire_booking(booking.id).await.unwrap();
        f.service.expire_booking(booking.id).await.unwrap();
        assert_eq!(
            f.service.get_booking(booking.id).await.unwrap().status,
            BookingStatus::Expired
        );
        // Cancel after expiry stays expired.
        f.service.cancel_booking(booking.id, "test").await.unwrap();
        assert_eq!(
            f.service.get_booking(booking.id).await.unwrap().status,
            BookingStatus::Expired
        );
    }

    #[tokio::test]
    async fn deadline_never_moves() {
        let f = fixture(10).await;
        let booking = f.service.book_seats(request(&f, 2)).await.unwrap();
        let deadline = booking.expires_at;

        f.service.update_booking_seats(booking.id, 4).await.unwrap();
        let after = f.service.get_booking(booking.id).await.unwrap();
        assert_eq!(after.seats, 4);
        assert_eq!(after.expires_at, deadline);
    }

    #[tokio::test]
    async fn seat_update_respects_availability() {
        let f = fixture(5).await;
        let booking = f.service.book_seats(request(&f, 2)).await.unwrap();

        let other = UserRepository::create(
            f.db.as_ref(),
            NewUser {
                email: "bob@example.com".to_string(),
                name: "Bob".to_string(),
                messaging_id: None,
            },
        )
        .await
        .unwrap();
        let second = f
            .service
            .book_seats(BookSeatsRequest {
                event_id: f.event_id,
                user_id: other.id,
                seats: 3,
                timeout_minutes: None,
            })
            .await
            .unwrap();
        f.service.confirm_booking(second.id).await.unwrap();

        assert!(matches!(
            f.service.update_booking_seats(booking.id, 5).await,
            Err(BookingError::InsufficientSeats { .. })
        ));
        f.service.update_booking_seats(booking.id, 2).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_expires_only_overdue_pending() {
        let f = fixture(10).await;
        let booking = f.service.book_seats(request(&f, 2)).await.unwrap();

        assert_eq!(f.service.cancel_expired_bookings().await.unwrap(), 0);

        f.clock.set(booking.expires_at + Duration::seconds(1));
        assert_eq!(f.service.cancel_expired_bookings().await.unwrap(), 1);
        assert_eq!(
            f.service.get_booking(booking.id).await.unwrap().status,
            BookingStatus::Expired
        );

        // A second sweep finds nothing.
        assert_eq!(f.service.cancel_expired_bookings().await.unwrap(), 0);
    }
}
