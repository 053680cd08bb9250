//! Relational persistence for events, users and bookings.
//!
//! The traits are the seams the reservation engine works against; the
//! Postgres implementations own all transactional invariants (seat capacity,
//! one active booking per user and event, terminal-state absorption), and the
//! in-memory implementation mirrors them for tests.

pub mod booking;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod user;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::booking::model::{
    Booking, BookingError, BookingStatus, Event, EventWithAvailability, NewBooking, NewEvent,
    NewUser, OverdueBooking, User,
};

#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Insert a pending booking. A single serialized check-then-insert
    /// (event-row lock in Postgres, the state mutex in memory) rejects a
    /// duplicate active booking for the same user and event, counts the
    /// seats already claimed by pending and confirmed bookings so that
    /// requests racing for the last seats get exactly one winner, and
    /// computes the deadline from the request's timeout.
    async fn create(&self, new: NewBooking) -> Result<Booking, BookingError>;

    async fn get(&self, id: i64) -> Result<Booking, BookingError>;

    /// The user's pending or confirmed booking for the event, if any.
    async fn get_active_by_event_and_user(
        &self,
        event_id: i64,
        user_id: i64,
    ) -> Result<Option<Booking>, BookingError>;

    /// Apply a state-machine transition. A pending-to-confirmed move
    /// re-checks capacity inside the transaction because the set of
    /// confirmed bookings may have grown since the booking was created.
    async fn update_status(&self, id: i64, status: BookingStatus) -> Result<(), BookingError>;

    /// Change the seat count of a pending booking. The deadline is never
    /// touched.
    async fn update_seats(&self, id: i64, seats: i32) -> Result<(), BookingError>;

    async fn delete(&self, id: i64) -> Result<(), BookingError>;

    async fn list_by_event(&self, event_id: i64) -> Result<Vec<Booking>, BookingError>;

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Booking>, BookingError>;

    async fn list_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>, BookingError>;

    /// Pending bookings whose deadline passed before `before`, joined with
    /// the user handle and event title the notification path needs. Ordered
    /// oldest deadline first.
    async fn list_overdue_pending(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<OverdueBooking>, BookingError>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Insert an event. The date must lie in the future.
    async fn create(&self, new: NewEvent) -> Result<Event, BookingError>;

    async fn get(&self, id: i64) -> Result<EventWithAvailability, BookingError>;

    async fn list(&self) -> Result<Vec<EventWithAvailability>, BookingError>;

    /// Update an event. `total_seats` may never drop below the seats already
    /// confirmed, checked inside the transaction.
    async fn update(&self, event: &Event) -> Result<(), BookingError>;

    /// Delete an event, refused while any booking references it.
    async fn delete(&self, id: i64) -> Result<(), BookingError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, new: NewUser) -> Result<User, BookingError>;

    async fn get(&self, id: i64) -> Result<User, BookingError>;

    async fn get_by_email(&self, email: &str) -> Result<User, BookingError>;

    async fn update(&self, user: &User) -> Result<(), BookingError>;

    /// Delete a user, refused while they hold an active booking.
    async fn delete(&self, id: i64) -> Result<(), BookingError>;
}
