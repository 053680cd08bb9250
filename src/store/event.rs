use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::booking::model::{
    BookingError, Event, EventWithAvailability, NewEvent,
};
use crate::clock::Clock;
use crate::store::EventRepository;

const AVAILABILITY_QUERY: &str =
    "SELECT e.id, e.title, e.description, e.date, e.total_seats, e.created_at, e.updated_at,
            COALESCE(SUM(CASE WHEN b.status = 'confirmed' THEN b.seats ELSE 0 END), 0) AS booked_seats
     FROM events e
     LEFT JOIN bookings b ON e.id = b.event_id";

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    title: String,
    description: String,
    date: DateTime<Utc>,
    total_seats: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    booked_seats: i64,
}

impl From<EventRow> for EventWithAvailability {
    fn from(row: EventRow) -> Self {
        let booked_seats = row.booked_seats as i32;
        EventWithAvailability {
            available_seats: row.total_seats - booked_seats,
            booked_seats,
            event: Event {
                id: row.id,
                title: row.title,
                description: row.description,
                date: row.date,
                total_seats: row.total_seats,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
        }
    }
}

pub struct PgEventRepository {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgEventRepository {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn create(&self, new: NewEvent) -> Result<Event, BookingError> {
        let now = self.clock.now();
        if new.date <= now {
            return Err(BookingError::EventInPast);
        }
        if new.total_seats <= 0 {
            return Err(BookingError::Validation(
                "total seats must be positive".to_string(),
            ));
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO events (title, description, date, total_seats, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.date)
        .bind(new.total_seats)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(Event {
            id,
            title: new.title,
            description: new.description,
            date: new.date,
            total_seats: new.total_seats,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, id: i64) -> Result<EventWithAvailability, BookingError> {
        let sql = format!("{AVAILABILITY_QUERY} WHERE e.id = $1 GROUP BY e.id");
        let row: Option<EventRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(EventWithAvailability::from)
            .ok_or(BookingError::EventNotFound)
    }

    async fn list(&self) -> Result<Vec<EventWithAvailability>, BookingError> {
        let sql = format!("{AVAILABILITY_QUERY} GROUP BY e.id ORDER BY e.date");
        let rows: Vec<EventRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(EventWithAvailability::from).collect())
    }

    async fn update(&self, event: &Event) -> Result<(), BookingError> {
        let mut tx = self.pool.begin().await?;

        // total_seats may never drop below what is already confirmed.
        let booked: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(seats), 0) FROM bookings
             WHERE event_id = $1 AND status = 'confirmed'",
        )
        .bind(event.id)
        .fetch_one(&mut *tx)
        .await?;
        if i64::from(event.total_seats) < booked {
            return Err(BookingError::SeatsBelowBooked {
                booked: booked as i32,
            });
        }

        let result = sqlx::query(
            "UPDATE events
             SET title = $1, description = $2, date = $3, total_seats = $4, updated_at = $5
             WHERE id = $6",
        )
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.date)
        .bind(event.total_seats)
        .bind(self.clock.now())
        .bind(event.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BookingError::EventNotFound);
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), BookingError> {
        let mut tx = self.pool.begin().await?;

        let bookings: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM bookings WHERE event_id = $1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        if bookings > 0 {
            return Err(BookingError::EventHasBookings);
        }

        let result = sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BookingError::EventNotFound);
        }

        tx.commit().await?;
        Ok(())
    }
}
