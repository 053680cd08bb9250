use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::booking::model::{Booking, BookingStatus};
use crate::booking::service::BookingService;
use crate::clock::Clock;
use crate::notify::NotificationSink;
use crate::queue::error::HandlerError;
use crate::queue::queue::TaskHandler;
use crate::queue::task::{NotificationKind, Task, TaskKind};
use crate::store::{EventRepository, UserRepository};

const DEFAULT_REMINDER_HOURS: f64 = 24.0;

fn format_date(date: DateTime<Utc>) -> String {
    date.format("%d.%m.%Y %H:%M").to_string()
}

/// Routes queue tasks to the reservation engine and the notification sink.
///
/// Every branch is idempotent per task id: expiration checks the current
/// status before transitioning, and the notification branches tolerate
/// duplicate delivery. Users without a messaging handle are skipped.
pub struct TaskRouter {
    service: Arc<BookingService>,
    events: Arc<dyn EventRepository>,
    users: Arc<dyn UserRepository>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl TaskRouter {
    pub fn new(
        service: Arc<BookingService>,
        events: Arc<dyn EventRepository>,
        users: Arc<dyn UserRepository>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service,
            events,
            users,
            sink,
            clock,
        }
    }

    async fn expire_booking(&self, booking_id: i64) -> Result<(), HandlerError> {
        let booking = self.service.get_booking(booking_id).await?;

        if booking.status != BookingStatus::Pending {
            debug!(
                booking_id,
                status = %booking.status,
                "booking no longer pending, skipping expiration"
            );
            return Ok(());
        }
        if self.clock.now() < booking.expires_at {
            debug!(
                booking_id,
                expires_at = %booking.expires_at.to_rfc3339(),
                "booking not yet due, skipping expiration"
            );
            return Ok(());
        }

        self.service.expire_booking(booking_id).await?;

        if let Err(e) = self.send_expiration_notice(&booking).await {
            warn!(booking_id, error = %e, "failed to send expiration notice");
        }
        Ok(())
    }

    async fn send_expiration_notice(&self, booking: &Booking) -> Result<(), HandlerError> {
        let event = self.events.get(booking.event_id).await?;
        let user = self.users.get(booking.user_id).await?;
        if let Some(handle) = &user.messaging_id {
            let text = format!(
                "Booking #{} for '{}' was released: the confirmation deadline passed.",
                booking.id, event.event.title
            );
            self.sink.send(handle, &text).await?;
        }
        Ok(())
    }

    async fn remind_booking(&self, booking_id: i64) -> Result<(), HandlerError> {
        let booking = self.service.get_booking(booking_id).await?;
        if booking.status != BookingStatus::Pending {
            return Ok(());
        }
        let minutes_left = (booking.expires_at - self.clock.now()).num_minutes();
        if minutes_left <= 0 {
            return Ok(());
        }

        let event = self.events.get(booking.event_id).await?;
        let user = self.users.get(booking.user_id).await?;
        if let Some(handle) = &user.messaging_id {
            let text = format!(
                "Booking #{} for '{}' expires in {} minute(s). Confirm it to keep your seats.",
                booking.id, event.event.title, minutes_left
            );
            self.sink.send(handle, &text).await?;
        }
        info!(booking_id, minutes_left, "reminder dispatched");
        Ok(())
    }

    async fn send_notification(&self, kind: &NotificationKind) -> Result<(), HandlerError> {
        match kind {
            NotificationKind::BookingCreated { booking_id, .. } => {
                let booking = self.service.get_booking(*booking_id).await?;
                let event = self.events.get(booking.event_id).await?;
                let user = self.users.get(booking.user_id).await?;
                if let Some(handle) = &user.messaging_id {
                    let text = format!(
                        "Booking #{} created for '{}' on {}: {} seat(s). Confirm before {}.",
                        booking.id,
                        event.event.title,
                        format_date(event.event.date),
                        booking.seats,
                        format_date(booking.expires_at)
                    );
                    self.sink.send(handle, &text).await?;
                }
                Ok(())
            }
            NotificationKind::BookingConfirmed { booking_id, .. } => {
                let booking = self.service.get_booking(*booking_id).await?;
                let event = self.events.get(booking.event_id).await?;
                let user = self.users.get(booking.user_id).await?;
                if let Some(handle) = &user.messaging_id {
                    let text = format!(
                        "Booking #{} for '{}' on {} is confirmed. See you there!",
                        booking.id,
                        event.event.title,
                        format_date(event.event.date)
                    );
                    self.sink.send(handle, &text).await?;
                }
                Ok(())
            }
            NotificationKind::EventCancelled { event_id, reason } => {
                self.event_cancelled(*event_id, reason.as_deref()).await
            }
            NotificationKind::CustomMessage { user_ids, message } => {
                self.custom_message(user_ids, message).await
            }
        }
    }

    async fn event_cancelled(
        &self,
        event_id: i64,
        reason: Option<&str>,
    ) -> Result<(), HandlerError> {
        let reason = reason.unwrap_or("organizational reasons");
        let event = self.events.get(event_id).await?;
        let bookings = self.service.event_bookings(event_id).await?;

        let mut sent = 0u32;
        for booking in bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Confirmed)
        {
            let user = match self.users.get(booking.user_id).await {
                Ok(user) => user,
                Err(e) => {
                    warn!(user_id = booking.user_id, error = %e, "skipping cancellation notice");
                    continue;
                }
            };
            let Some(handle) = &user.messaging_id else {
                continue;
            };
            let text = format!(
                "'{}' on {} was cancelled: {}. Your booking #{} no longer applies.",
                event.event.title,
                format_date(event.event.date),
                reason,
                booking.id
            );
            match self.sink.send(handle, &text).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(user_id = user.id, error = %e, "failed to send cancellation notice")
                }
            }
        }

        info!(event_id, sent, "event cancellation notices dispatched");
        Ok(())
    }

    async fn custom_message(&self, user_ids: &[i64], message: &str) -> Result<(), HandlerError> {
        if user_ids.is_empty() {
            debug!("custom message without recipients, skipping");
            return Ok(());
        }

        let mut sent = 0u32;
        for user_id in user_ids {
            let user = match self.users.get(*user_id).await {
                Ok(user) => user,
                Err(e) => {
                    warn!(user_id, error = %e, "skipping custom message recipient");
                    continue;
                }
            };
            let Some(handle) = &user.messaging_id else {
                continue;
            };
            match self.sink.send(handle, message).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(user_id, error = %e, "failed to send custom message"),
            }
        }

        info!(sent, total = user_ids.len(), "custom messages dispatched");
        Ok(())
    }

    async fn cleanup_expired(
        &self,
        expired_before: Option<DateTime<Utc>>,
    ) -> Result<(), HandlerError> {
        let cutoff = expired_before.unwrap_or_else(|| self.clock.now() - Duration::hours(1));
        let overdue = self.service.overdue_bookings(cutoff).await?;
        info!(count = overdue.len(), cutoff = %cutoff.to_rfc3339(), "bulk cleanup started");

        let mut expired = 0u32;
        for row in &overdue {
            match self.service.expire_booking(row.booking_id).await {
                Ok(()) => expired += 1,
                Err(e) => {
                    warn!(booking_id = row.booking_id, error = %e, "failed to expire booking")
                }
            }
        }

        info!(expired, total = overdue.len(), "bulk cleanup finished");
        Ok(())
    }

    async fn event_reminder(&self, event_id: i64, hours: f64) -> Result<(), HandlerError> {
        let event = self.events.get(event_id).await?;
        let bookings = self.service.event_bookings(event_id).await?;

        let mut sent = 0u32;
        for booking in bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Confirmed)
        {
            let user = match self.users.get(booking.user_id).await {
                Ok(user) => user,
                Err(e) => {
                    warn!(user_id = booking.user_id, error = %e, "skipping event reminder");
                    continue;
                }
            };
            let Some(handle) = &user.messaging_id else {
                continue;
            };
            let text = format!(
                "'{}' starts in {:.0} hour(s). Booking #{}, {} seat(s).",
                event.event.title, hours, booking.id, booking.seats
            );
            match self.sink.send(handle, &text).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(user_id = user.id, error = %e, "failed to send event reminder"),
            }
        }

        info!(event_id, sent, "event reminders dispatched");
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for TaskRouter {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        info!(
            task_id = %task.id,
            task_type = task.kind.name(),
            attempt = task.attempts,
            max_retries = task.max_retries,
            "handling task"
        );

        match &task.kind {
            TaskKind::ExpireBooking { booking_id, .. } => self.expire_booking(*booking_id).await,
            TaskKind::ReminderNotification { booking_id, .. } => {
                self.remind_booking(*booking_id).await
            }
            TaskKind::SendNotification(kind) => self.send_notification(kind).await,
            TaskKind::CleanupExpired { expired_before } => {
                self.cleanup_expired(*expired_before).await
            }
            TaskKind::EventReminder {
                event_id,
                reminder_hours,
            } => {
                self.event_reminder(*event_id, reminder_hours.unwrap_or(DEFAULT_REMINDER_HOURS))
                    .await
            }
        }
    }
}
