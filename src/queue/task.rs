use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of work the queue knows how to route, together with each
/// variant's payload.
///
/// On the wire a task kind is the `type` tag plus a `data` object, so a
/// serialized [`Task`] matches the JSON contract consumed by the sibling
/// services:
///
/// ```json
/// {"id":"expire_booking_7_1700000000","type":"expire_booking",
///  "data":{"booking_id":7,"event_id":3,"user_id":2,
///          "expires_at":"2024-11-14T22:13:20Z"},
///  "execute_at":"2024-11-14T22:13:20Z", ...}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskKind {
    /// Drive a pending booking past its deadline to `expired`.
    ExpireBooking {
        booking_id: i64,
        event_id: i64,
        user_id: i64,
        expires_at: DateTime<Utc>,
    },
    /// Remind the user shortly before their confirmation deadline.
    ReminderNotification {
        booking_id: i64,
        event_id: i64,
        user_id: i64,
    },
    /// Out-of-band notification dispatch.
    SendNotification(NotificationKind),
    /// Bulk sweep of pending bookings whose deadline passed before the
    /// cutoff. Defaults to one hour ago when the cutoff is missing.
    CleanupExpired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expired_before: Option<DateTime<Utc>>,
    },
    /// Remind confirmed attendees ahead of the event itself.
    EventReminder {
        event_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reminder_hours: Option<f64>,
    },
}

impl TaskKind {
    /// Wire name of the type tag, used in logs and metric keys.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::ExpireBooking { .. } => "expire_booking",
            TaskKind::ReminderNotification { .. } => "reminder_notification",
            TaskKind::SendNotification(_) => "send_notification",
            TaskKind::CleanupExpired { .. } => "cleanup_expired",
            TaskKind::EventReminder { .. } => "event_reminder",
        }
    }
}

/// Payload contract of `send_notification` tasks, discriminated by
/// `notification_type` inside the data object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notification_type", rename_all = "snake_case")]
pub enum NotificationKind {
    BookingCreated {
        booking_id: i64,
        event_id: i64,
        user_id: i64,
    },
    BookingConfirmed {
        booking_id: i64,
        event_id: i64,
        user_id: i64,
    },
    EventCancelled {
        event_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    CustomMessage {
        user_ids: Vec<i64>,
        message: String,
    },
}

/// A unit of work owned by the queue.
///
/// The id is stable across retries; `attempts` is incremented by the queue
/// alone, once per handler invocation. A task whose `execute_at` lies in the
/// future is held in the delayed set and never appears on the ready list
/// before its time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    /// Absolute execution time. `None` means "now".
    #[serde(default)]
    pub execute_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub max_retries: u32,
}

impl Task {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: String::new(),
            kind,
            execute_at: None,
            created_at: None,
            attempts: 0,
            max_retries: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Schedule the task for a specific instant instead of "now".
    pub fn at(mut self, execute_at: DateTime<Utc>) -> Self {
        self.execute_at = Some(execute_at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether the task belongs on the ready list as of `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execute_at.map_or(true, |at| at <= now)
    }

    /// Fill in publish-time defaults: a generated id when empty, the creation
    /// stamp, and the configured retry budget when none was set.
    pub(crate) fn apply_defaults(&mut self, now: DateTime<Utc>, default_max_retries: u32) {
        if self.id.trim().is_empty() {
            self.id = format!("task_{}", Uuid::new_v4().simple());
        }
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        if self.max_retries == 0 {
            self.max_retries = default_max_retries;
        }
    }
}

/// Sorted-set score for a delayed task: unix seconds with sub-second
/// precision, matching what the other services write.
pub(crate) fn unix_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 14, 22, 13, 20).unwrap()
    }

    #[test]
    fn expire_booking_wire_format() {
        let task = Task::new(TaskKind::ExpireBooking {
            booking_id: 7,
            event_id: 3,
            user_id: 2,
            expires_at: sample_time(),
        })
        .with_id("expire_booking_7_1700000000")
        .at(sample_time())
        .with_max_retries(3);

        let json: serde_json::Value = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "expire_booking");
        assert_eq!(json["data"]["booking_id"], 7);
        assert_eq!(json["data"]["expires_at"], "2024-11-14T22:13:20Z");
        assert_eq!(json["id"], "expire_booking_7_1700000000");
        assert_eq!(json["max_retries"], 3);
        assert_eq!(json["attempts"], 0);

        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn notification_payload_is_discriminated_by_notification_type() {
        let task = Task::new(TaskKind::SendNotification(NotificationKind::BookingCreated {
            booking_id: 1,
            event_id: 2,
            user_id: 3,
        }));

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "send_notification");
        assert_eq!(json["data"]["notification_type"], "booking_created");
        assert_eq!(json["data"]["booking_id"], 1);
    }

    #[test]
    fn custom_message_round_trip() {
        let task = Task::new(TaskKind::SendNotification(NotificationKind::CustomMessage {
            user_ids: vec![4, 5],
            message: "maintenance window tonight".to_string(),
        }));
        let raw = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn optional_payload_fields_default() {
        let raw = r#"{"id":"t1","type":"cleanup_expired","data":{}}"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(
            task.kind,
            TaskKind::CleanupExpired {
                expired_before: None
            }
        );
        assert_eq!(task.attempts, 0);
        assert!(task.execute_at.is_none());

        let raw = r#"{"id":"t2","type":"event_reminder","data":{"event_id":9}}"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(
            task.kind,
            TaskKind::EventReminder {
                event_id: 9,
                reminder_hours: None
            }
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{"id":"t1","type":"reminder_notification",
            "data":{"booking_id":1,"event_id":2,"user_id":3,"extra":"x"},
            "shard":"a"}"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(
            task.kind,
            TaskKind::ReminderNotification {
                booking_id: 1,
                event_id: 2,
                user_id: 3
            }
        );
    }

    #[test]
    fn unknown_type_tag_fails() {
        let raw = r#"{"id":"t1","type":"mint_tokens","data":{}}"#;
        assert!(serde_json::from_str::<Task>(raw).is_err());
    }

    #[test]
    fn defaults_assign_id_stamp_and_retry_budget() {
        let mut task = Task::new(TaskKind::CleanupExpired {
            expired_before: None,
        });
        task.apply_defaults(sample_time(), 3);
        assert!(task.id.starts_with("task_"));
        assert_eq!(task.created_at, Some(sample_time()));
        assert_eq!(task.max_retries, 3);

        // An explicit budget survives.
        let mut task = Task::new(TaskKind::CleanupExpired {
            expired_before: None,
        })
        .with_max_retries(5);
        task.apply_defaults(sample_time(), 3);
        assert_eq!(task.max_retries, 5);
    }

    #[test]
    fn due_when_unset_or_past() {
        let now = sample_time();
        let task = Task::new(TaskKind::CleanupExpired {
            expired_before: None,
        });
        assert!(task.is_due(now));
        assert!(task.clone().at(now).is_due(now));
        assert!(!task.at(now + chrono::Duration::seconds(1)).is_due(now));
    }
}
