use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::error::HandlerError;

/// Lifecycle of a booking.
///
/// Only `Pending` accepts `confirm` and `expire`; `cancel` is accepted from
/// `Pending` or `Confirmed`. `Confirmed`, `Cancelled` and `Expired` are
/// absorbing: no operation leads back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Expired => "expired",
        }
    }

    /// Pending and confirmed bookings hold a claim on seats.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    /// Same-status transitions are permitted as no-ops.
    pub fn can_transition_to(&self, to: BookingStatus) -> bool {
        if *self == to {
            return true;
        }
        match self {
            BookingStatus::Pending => matches!(
                to,
                BookingStatus::Confirmed | BookingStatus::Cancelled | BookingStatus::Expired
            ),
            BookingStatus::Confirmed => matches!(to, BookingStatus::Cancelled),
            BookingStatus::Cancelled | BookingStatus::Expired => false,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "expired" => Ok(BookingStatus::Expired),
            other => Err(BookingError::Database(format!(
                "unknown booking status {other:?}"
            ))),
        }
    }
}

/// A claim on a number of seats of an event, subject to a confirmation
/// deadline. `expires_at` is fixed at creation and never updated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: i64,
    pub event_id: i64,
    pub user_id: i64,
    pub seats: i32,
    pub status: BookingStatus,
    pub expires_at: DateTime<Utc>,
    /// Confirmation window in minutes, recorded for audit.
    pub reservation_timeout: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to booking creation; the repository computes the deadline and
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub event_id: i64,
    pub user_id: i64,
    pub seats: i32,
    pub timeout_minutes: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub date: DateTime<Utc>,
    pub total_seats: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub title: String,
    pub description: String,
    pub date: DateTime<Utc>,
    pub total_seats: i32,
}

/// Read model: an event joined with the sum of its confirmed seats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventWithAvailability {
    #[serde(flatten)]
    pub event: Event,
    pub booked_seats: i32,
    pub available_seats: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    /// Handle on the external messaging transport, when the user linked one.
    pub messaging_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub messaging_id: Option<String>,
}

/// Row shape of the overdue-pending scan: the booking key data joined with
/// what the notification path needs.
#[derive(Debug, Clone)]
pub struct OverdueBooking {
    pub booking_id: i64,
    pub event_id: i64,
    pub user_id: i64,
    pub seats: i32,
    pub expires_at: DateTime<Utc>,
    pub event_title: String,
    pub user_name: String,
    pub messaging_id: Option<String>,
}

/// Detailed view of one booking for client display.
#[derive(Debug, Clone, Serialize)]
pub struct BookingDetails {
    pub booking: Booking,
    pub event: EventWithAvailability,
    pub user: User,
    /// Seconds until the confirmation deadline, for pending bookings that
    /// have not yet passed it.
    pub seconds_left: Option<i64>,
    pub is_expired: bool,
    pub can_confirm: bool,
}

/// Errors of the reservation engine and its data adapter.
///
/// Display strings double as the handler-error messages fed to the queue's
/// retry policy, so the not-found and validation variants spell out the
/// fragments that make them terminal.
#[derive(Error, Debug)]
pub enum BookingError {
    #[error("event not found")]
    EventNotFound,

    #[error("booking not found")]
    BookingNotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("validation failed: event date cannot be in the past")]
    EventInPast,

    #[error("user already has an active booking for this event")]
    DuplicateBooking,

    #[error("not enough available seats: requested {requested}, available {available}")]
    InsufficientSeats { requested: i32, available: i32 },

    #[error("booking has expired")]
    BookingExpired,

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("email {0} is already registered")]
    DuplicateEmail(String),

    #[error("total seats cannot drop below the {booked} already confirmed")]
    SeatsBelowBooked { booked: i32 },

    #[error("event has existing bookings")]
    EventHasBookings,

    #[error("user has active bookings")]
    UserHasActiveBookings,

    #[error("database error: {0}")]
    Database(String),
}

impl From<BookingError> for HandlerError {
    fn from(err: BookingError) -> Self {
        HandlerError::new(err.to_string())
    }
}

impl From<sqlx::Error> for BookingError {
    fn from(err: sqlx::Error) -> Self {
        BookingError::Database(err.to_string())
    }
}
