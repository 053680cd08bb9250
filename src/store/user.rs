use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::booking::model::{BookingError, NewUser, User};
use crate::clock::Clock;
use crate::store::UserRepository;

const USER_COLUMNS: &str = "id, email, name, messaging_id, created_at";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    name: String,
    messaging_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            name: row.name,
            messaging_id: row.messaging_id,
            created_at: row.created_at,
        }
    }
}

pub struct PgUserRepository {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgUserRepository {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, new: NewUser) -> Result<User, BookingError> {
        let now = self.clock.now();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (email, name, messaging_id, created_at)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(&new.email)
        .bind(&new.name)
        .bind(&new.messaging_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                BookingError::DuplicateEmail(new.email.clone())
            } else {
                BookingError::Database(e.to_string())
            }
        })?;

        Ok(User {
            id,
            email: new.email,
            name: new.name,
            messaging_id: new.messaging_id,
            created_at: now,
        })
    }

    async fn get(&self, id: i64) -> Result<User, BookingError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row: Option<UserRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::from).ok_or(BookingError::UserNotFound)
    }

    async fn get_by_email(&self, email: &str) -> Result<User, BookingError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row: Option<UserRow> = sqlx::query_as(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::from).ok_or(BookingError::UserNotFound)
    }

    async fn update(&self, user: &User) -> Result<(), BookingError> {
        let result = sqlx::query("UPDATE users SET name = $1, messaging_id = $2 WHERE id = $3")
            .bind(&user.name)
            .bind(&user.messaging_id)
            .bind(user.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BookingError::UserNotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), BookingError> {
        let mut tx = self.pool.begin().await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM bookings
             WHERE user_id = $1 AND status IN ('pending', 'confirmed')",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            return Err(BookingError::UserHasActiveBookings);
        }

        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BookingError::UserNotFound);
        }

        tx.commit().await?;
        Ok(())
    }
}
