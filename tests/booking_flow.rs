//! End-to-end reservation flows over the in-memory store: the happy path,
//! the concurrent last-seat race, capacity under serial confirmation, and
//! expiration through the sweep workers with the queue out of the picture.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use booker_q::store::memory::MemoryDatabase;
use booker_q::queue::testing::MemoryStore;
use booker_q::{
    BookSeatsRequest, BookingConfig, BookingError, BookingService, BookingStatus, CleanupWorker,
    Clock, EventRepository, ExpirationScheduler, ManualClock, NewEvent, NewUser, QueueConfig,
    TaskQueue, UserRepository,
};

struct World {
    db: Arc<MemoryDatabase>,
    service: Arc<BookingService>,
    queue: Arc<TaskQueue>,
    clock: ManualClock,
}

fn world() -> World {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 11, 14, 12, 0, 0).unwrap());
    let db = Arc::new(MemoryDatabase::new(Arc::new(clock.clone())));
    let store = Arc::new(MemoryStore::new());
    let config = QueueConfig {
        queue_timeout: StdDuration::from_millis(50),
        ..QueueConfig::default()
    };
    let queue = Arc::new(TaskQueue::with_clock(
        store,
        config,
        Arc::new(clock.clone()),
    ));
    let service = Arc::new(
        BookingService::new(db.clone(), db.clone(), db.clone(), BookingConfig::default())
            .with_queue(queue.clone())
            .with_clock(Arc::new(clock.clone())),
    );
    World {
        db,
        service,
        queue,
        clock,
    }
}

async fn seed_event(world: &World, total_seats: i32) -> i64 {
    EventRepository::create(
        world.db.as_ref(),
        NewEvent {
            title: "Rust Meetup".to_string(),
            description: "monthly meetup".to_string(),
            date: world.clock.now() + Duration::days(7),
            total_seats,
        },
    )
    .await
    .unwrap()
    .id
}

async fn seed_user(world: &World, email: &str) -> i64 {
    UserRepository::create(
        world.db.as_ref(),
        NewUser {
            email: email.to_string(),
            name: email.split('@').next().unwrap_or("user").to_string(),
            messaging_id: None,
        },
    )
    .await
    .unwrap()
    .id
}

fn request(event_id: i64, user_id: i64, seats: i32) -> BookSeatsRequest {
    BookSeatsRequest {
        event_id,
        user_id,
        seats,
        timeout_minutes: None,
    }
}

// Sleeps two virtual seconds per poll so that paused-clock tests march
// through the scheduler's minute tick and the cleanup worker's half-hour
// tick in a bounded number of iterations.
async fn wait_for_status(service: &BookingService, booking_id: i64, status: BookingStatus) {
    for _ in 0..2000 {
        if service.get_booking(booking_id).await.unwrap().status == status {
            return;
        }
        sleep(StdDuration::from_secs(2)).await;
    }
    panic!("booking {booking_id} never reached {status}");
}

#[tokio::test]
async fn happy_path_book_then_confirm() {
    let world = world();
    let event_id = seed_event(&world, 10).await;
    let user_id = seed_user(&world, "ada@example.com").await;

    let booking = world
        .service
        .book_seats(request(event_id, user_id, 3))
        .await
        .unwrap();

    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.expires_at, world.clock.now() + Duration::minutes(30));

    // Expire at the deadline, remind at deadline minus fifteen minutes,
    // notify shortly after creation: all three are scheduled for later.
    let stats = world.queue.stats().await.unwrap();
    assert_eq!(stats.delayed, 3);
    assert_eq!(stats.ready, 0);

    world.service.confirm_booking(booking.id).await.unwrap();
    assert_eq!(
        world.service.get_booking(booking.id).await.unwrap().status,
        BookingStatus::Confirmed
    );

    let event = EventRepository::get(world.db.as_ref(), event_id).await.unwrap();
    assert_eq!(event.booked_seats, 3);
    assert_eq!(event.available_seats, 7);
}

#[tokio::test]
async fn concurrent_last_seat_race_books_exactly_once() {
    let world = world();
    let event_id = seed_event(&world, 1).await;
    let u1 = seed_user(&world, "u1@example.com").await;
    let u2 = seed_user(&world, "u2@example.com").await;

    let (first, second) = tokio::join!(
        world.service.book_seats(request(event_id, u1, 1)),
        world.service.book_seats(request(event_id, u2, 1)),
    );

    let outcomes = [first, second];
    let won = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(won, 1, "exactly one booking must win the last seat");

    let lost = outcomes
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(BookingError::InsufficientSeats { .. })
            )
        })
        .count();
    assert_eq!(lost, 1, "the loser gets a deterministic capacity conflict");
}

#[tokio::test]
async fn pending_claims_count_against_creation_capacity() {
    let world = world();
    let event_id = seed_event(&world, 10).await;
    let ada = seed_user(&world, "a@x.com").await;
    let bob = seed_user(&world, "b@x.com").await;
    let eve = seed_user(&world, "c@x.com").await;

    world
        .service
        .book_seats(request(event_id, ada, 4))
        .await
        .unwrap();
    world
        .service
        .book_seats(request(event_id, bob, 4))
        .await
        .unwrap();

    // Two pending claims hold 8 of 10 seats; a third request for 4 loses
    // even though nothing is confirmed yet.
    let err = world
        .service
        .book_seats(request(event_id, eve, 4))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::InsufficientSeats {
            requested: 4,
            available: 2
        }
    ));
}

#[tokio::test]
async fn confirmed_seats_never_exceed_capacity() {
    let world = world();
    let event_id = seed_event(&world, 10).await;
    let ada = seed_user(&world, "a@x.com").await;
    let bob = seed_user(&world, "b@x.com").await;

    let first = world
        .service
        .book_seats(request(event_id, ada, 4))
        .await
        .unwrap();
    let second = world
        .service
        .book_seats(request(event_id, bob, 4))
        .await
        .unwrap();

    // Seat updates are checked against confirmed availability only, so the
    // pending claims can overcommit the event. Confirmation must not.
    world
        .service
        .update_booking_seats(first.id, 8)
        .await
        .unwrap();

    world.service.confirm_booking(first.id).await.unwrap();
    assert!(matches!(
        world.service.confirm_booking(second.id).await,
        Err(BookingError::InsufficientSeats { .. })
    ));

    let event = EventRepository::get(world.db.as_ref(), event_id).await.unwrap();
    assert_eq!(event.booked_seats, 8);
    assert_eq!(event.available_seats, 2);
}

#[tokio::test]
async fn one_active_booking_per_user_and_event() {
    let world = world();
    let event_id = seed_event(&world, 10).await;
    let user_id = seed_user(&world, "ada@example.com").await;

    let first = world
        .service
        .book_seats(request(event_id, user_id, 1))
        .await
        .unwrap();
    assert!(matches!(
        world.service.book_seats(request(event_id, user_id, 1)).await,
        Err(BookingError::DuplicateBooking)
    ));

    // Once the first claim is terminal the user may book again.
    world
        .service
        .cancel_booking(first.id, "changed plans")
        .await
        .unwrap();
    world
        .service
        .book_seats(request(event_id, user_id, 2))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn scheduler_sweep_expires_overdue_booking_without_the_queue() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 11, 14, 12, 0, 0).unwrap());
    let db = Arc::new(MemoryDatabase::new(Arc::new(clock.clone())));
    // No queue attached: expiration rests entirely on the sweep.
    let service = Arc::new(
        BookingService::new(db.clone(), db.clone(), db.clone(), BookingConfig::default())
            .with_clock(Arc::new(clock.clone())),
    );

    let event = EventRepository::create(
        db.as_ref(),
        NewEvent {
            title: "Workshop".to_string(),
            description: String::new(),
            date: clock.now() + Duration::days(1),
            total_seats: 5,
        },
    )
    .await
    .unwrap();
    let user = UserRepository::create(
        db.as_ref(),
        NewUser {
            email: "ada@example.com".to_string(),
            name: "Ada".to_string(),
            messaging_id: None,
        },
    )
    .await
    .unwrap();

    let booking = service
        .book_seats(BookSeatsRequest {
            event_id: event.id,
            user_id: user.id,
            seats: 2,
            timeout_minutes: Some(1),
        })
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    ExpirationScheduler::new(
        service.clone(),
        StdDuration::from_secs(60),
        cancel.child_token(),
    )
    .spawn();

    clock.set(booking.expires_at + Duration::seconds(1));
    wait_for_status(&service, booking.id, BookingStatus::Expired).await;

    // Availability is restored once expired.
    let event = EventRepository::get(db.as_ref(), event.id).await.unwrap();
    assert_eq!(event.available_seats, 5);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn cleanup_worker_expires_what_the_scheduler_missed() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 11, 14, 12, 0, 0).unwrap());
    let db = Arc::new(MemoryDatabase::new(Arc::new(clock.clone())));
    let service = Arc::new(
        BookingService::new(db.clone(), db.clone(), db.clone(), BookingConfig::default())
            .with_clock(Arc::new(clock.clone())),
    );

    let event = EventRepository::create(
        db.as_ref(),
        NewEvent {
            title: "Workshop".to_string(),
            description: String::new(),
            date: clock.now() + Duration::days(1),
            total_seats: 5,
        },
    )
    .await
    .unwrap();
    let user = UserRepository::create(
        db.as_ref(),
        NewUser {
            email: "ada@example.com".to_string(),
            name: "Ada".to_string(),
            messaging_id: None,
        },
    )
    .await
    .unwrap();
    let booking = service
        .book_seats(BookSeatsRequest {
            event_id: event.id,
            user_id: user.id,
            seats: 1,
            timeout_minutes: Some(1),
        })
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    CleanupWorker::new(
        service.clone(),
        Arc::new(clock.clone()),
        StdDuration::from_secs(30 * 60),
        cancel.child_token(),
    )
    .spawn();

    clock.set(booking.expires_at + Duration::minutes(5));
    wait_for_status(&service, booking.id, BookingStatus::Expired).await;

    cancel.cancel();
}
