use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::booking::model::{
    Booking, BookingError, BookingStatus, NewBooking, OverdueBooking,
};
use crate::clock::Clock;
use crate::store::BookingRepository;

const BOOKING_COLUMNS: &str =
    "id, event_id, user_id, seats, status, expires_at, reservation_timeout, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: i64,
    event_id: i64,
    user_id: i64,
    seats: i32,
    status: String,
    expires_at: DateTime<Utc>,
    reservation_timeout: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = BookingError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            event_id: row.event_id,
            user_id: row.user_id,
            seats: row.seats,
            status: row.status.parse()?,
            expires_at: row.expires_at,
            reservation_timeout: row.reservation_timeout,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OverdueRow {
    booking_id: i64,
    event_id: i64,
    user_id: i64,
    seats: i32,
    expires_at: DateTime<Utc>,
    event_title: String,
    user_name: String,
    messaging_id: Option<String>,
}

pub struct PgBookingRepository {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Fetch one booking under a row-level lock inside the caller's
    /// transaction. Admin flows that need serialized updates go through
    /// here.
    pub async fn get_with_lock(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
    ) -> Result<Booking, BookingError> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 FOR UPDATE");
        let row: Option<BookingRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.ok_or(BookingError::BookingNotFound)?.try_into()
    }

    async fn confirmed_seats(
        tx: &mut Transaction<'_, Postgres>,
        event_id: i64,
    ) -> Result<i32, BookingError> {
        let confirmed: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(seats), 0) FROM bookings
             WHERE event_id = $1 AND status = 'confirmed'",
        )
        .bind(event_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(confirmed as i32)
    }

    /// Seats held by pending or confirmed bookings.
    async fn active_seats(
        tx: &mut Transaction<'_, Postgres>,
        event_id: i64,
    ) -> Result<i32, BookingError> {
        let active: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(seats), 0) FROM bookings
             WHERE event_id = $1 AND status IN ('pending', 'confirmed')",
        )
        .bind(event_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(active as i32)
    }

    /// Fetch the event's capacity under a row lock. Taking the event row
    /// lock first serializes concurrent seat checks for the same event, so
    /// the recount that follows sees every committed and in-progress claim.
    async fn lock_total_seats(
        tx: &mut Transaction<'_, Postgres>,
        event_id: i64,
    ) -> Result<i32, BookingError> {
        let total: Option<i32> =
            sqlx::query_scalar("SELECT total_seats FROM events WHERE id = $1 FOR UPDATE")
                .bind(event_id)
                .fetch_optional(&mut **tx)
                .await?;
        total.ok_or(BookingError::EventNotFound)
    }
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn create(&self, new: NewBooking) -> Result<Booking, BookingError> {
        let mut tx = self.pool.begin().await?;

        let total = Self::lock_total_seats(&mut tx, new.event_id).await?;

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM bookings
             WHERE event_id = $1 AND user_id = $2 AND status IN ('pending', 'confirmed')",
        )
        .bind(new.event_id)
        .bind(new.user_id)
        .fetch_one(&mut *tx)
        .await?;
        if existing > 0 {
            return Err(BookingError::DuplicateBooking);
        }

        // Pending claims count here: of two requests racing for the last
        // seats, the one that acquires the event lock second sees the
        // winner's pending row and loses deterministically.
        let available = total - Self::active_seats(&mut tx, new.event_id).await?;
        if new.seats > available {
            return Err(BookingError::InsufficientSeats {
                requested: new.seats,
                available,
            });
        }

        let now = self.clock.now();
        let expires_at = now + Duration::minutes(i64::from(new.timeout_minutes));
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO bookings
                (event_id, user_id, seats, status, expires_at, reservation_timeout,
                 created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(new.event_id)
        .bind(new.user_id)
        .bind(new.seats)
        .bind(BookingStatus::Pending.as_str())
        .bind(expires_at)
        .bind(new.timeout_minutes)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Booking {
            id,
            event_id: new.event_id,
            user_id: new.user_id,
            seats: new.seats,
            status: BookingStatus::Pending,
            expires_at,
            reservation_timeout: new.timeout_minutes,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, id: i64) -> Result<Booking, BookingError> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
        let row: Option<BookingRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(BookingError::BookingNotFound)?.try_into()
    }

    async fn get_active_by_event_and_user(
        &self,
        event_id: i64,
        user_id: i64,
    ) -> Result<Option<Booking>, BookingError> {
        let sql = format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE event_id = $1 AND user_id = $2 AND status IN ('pending', 'confirmed')
             ORDER BY created_at DESC
             LIMIT 1"
        );
        let row: Option<BookingRow> = sqlx::query_as(&sql)
            .bind(event_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn update_status(&self, id: i64, status: BookingStatus) -> Result<(), BookingError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, i32, String)> =
            sqlx::query_as("SELECT event_id, seats, status FROM bookings WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let (event_id, seats, current) = row.ok_or(BookingError::BookingNotFound)?;
        let current: BookingStatus = current.parse()?;

        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(BookingError::InvalidTransition {
                from: current,
                to: status,
            });
        }

        // Confirmations re-check capacity against the confirmed set: other
        // bookings may have been confirmed since this one was created.
        if current == BookingStatus::Pending && status == BookingStatus::Confirmed {
            let total = Self::lock_total_seats(&mut tx, event_id).await?;
            let confirmed = Self::confirmed_seats(&mut tx, event_id).await?;
            if confirmed + seats > total {
                return Err(BookingError::InsufficientSeats {
                    requested: seats,
                    available: total - confirmed,
                });
            }
        }

        sqlx::query("UPDATE bookings SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(self.clock.now())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_seats(&self, id: i64, seats: i32) -> Result<(), BookingError> {
        let mut tx = self.pool.begin().await?;

        let booking = self.get_with_lock(&mut tx, id).await?;
        if booking.status != BookingStatus::Pending {
            return Err(BookingError::Validation(
                "seat changes are only allowed while pending".to_string(),
            ));
        }

        sqlx::query("UPDATE bookings SET seats = $1, updated_at = $2 WHERE id = $3")
            .bind(seats)
            .bind(self.clock.now())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), BookingError> {
        let result = sqlx::query("DELETE FROM bookings WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BookingError::BookingNotFound);
        }
        Ok(())
    }

    async fn list_by_event(&self, event_id: i64) -> Result<Vec<Booking>, BookingError> {
        let sql = format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE event_id = $1 ORDER BY created_at DESC"
        );
        let rows: Vec<BookingRow> = sqlx::query_as(&sql)
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Booking>, BookingError> {
        let sql = format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let rows: Vec<BookingRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn list_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>, BookingError> {
        let sql = format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE status = $1 ORDER BY created_at DESC"
        );
        let rows: Vec<BookingRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn list_overdue_pending(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<OverdueBooking>, BookingError> {
        let rows: Vec<OverdueRow> = sqlx::query_as(
            "SELECT b.id AS booking_id, b.event_id, b.user_id, b.seats, b.expires_at,
                    e.title AS event_title, u.name AS user_name, u.messaging_id
             FROM bookings b
             JOIN users u ON b.user_id = u.id
             JOIN events e ON b.event_id = e.id
             WHERE b.status = 'pending' AND b.expires_at < $1
             ORDER BY b.expires_at ASC",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| OverdueBooking {
                booking_id: row.booking_id,
                event_id: row.event_id,
                user_id: row.user_id,
                seats: row.seats,
                expires_at: row.expires_at,
                event_title: row.event_title,
                user_name: row.user_name,
                messaging_id: row.messaging_id,
            })
            .collect())
    }
}
