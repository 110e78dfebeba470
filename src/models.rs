use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::queue::QueueService;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub queue: Arc<QueueService>,
    pub queue_slot_minutes: i64,
}

/* -------------------------
   API envelopes
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
    pub message: String,
}

/* -------------------------
   Appointment status
--------------------------*/

/// Stored as smallint:
/// 0 Pending, 1 Confirmed, 2 Completed, 3 Canceled, 4 No-show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum AppointmentStatus {
    Pending = 0,
    Confirmed = 1,
    Completed = 2,
    Canceled = 3,
    #[serde(rename = "No-show")]
    NoShow = 4,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 5] = [
        AppointmentStatus::Pending,
        AppointmentStatus::Confirmed,
        AppointmentStatus::Completed,
        AppointmentStatus::Canceled,
        AppointmentStatus::NoShow,
    ];

    /// Statuses that still hold a place in the day's queue.
    pub const ACTIVE: [AppointmentStatus; 2] = [AppointmentStatus::Pending, AppointmentStatus::Confirmed];

    pub fn is_active(self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "Pending",
            AppointmentStatus::Confirmed => "Confirmed",
            AppointmentStatus::Completed => "Completed",
            AppointmentStatus::Canceled => "Canceled",
            AppointmentStatus::NoShow => "No-show",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        AppointmentStatus::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    /// Pending -> Confirmed -> Completed, or Pending/Confirmed -> Canceled/No-show.
    /// Terminal statuses never move again.
    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Confirmed) => true,
            (Confirmed, Completed) => true,
            (Pending | Confirmed, Canceled | NoShow) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Appointment {
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub scheduled_date: NaiveDate,
    pub status: AppointmentStatus,
    pub queue_number: Option<i32>,
    pub called_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub scheduled_date: NaiveDate,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct NotificationRecord {
    pub notification_id: Uuid,
    pub appointment_id: Uuid,
    pub queue_number: Option<i32>,
    pub message: String,
    pub is_sent: bool,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Set when the patient opens the notification in the app.
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub notification_id: Uuid,
    pub appointment_id: Uuid,
    pub queue_number: Option<i32>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/* -------------------------
   Queue views
--------------------------*/

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuePosition {
    pub appointment_id: Uuid,
    pub scheduled_date: NaiveDate,
    pub queue_number: Option<i32>,
    pub people_ahead: i64,
    pub total_in_queue: i64,
    pub in_active_queue: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub date: NaiveDate,
    pub pending: i64,
    pub confirmed: i64,
    pub completed: i64,
    pub canceled: i64,
    pub no_show: i64,
    pub total: i64,
    pub active: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ReorderItem {
    pub appointment_id: Uuid,
    pub queue_number: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalledAppointment {
    pub appointment: Appointment,
    pub notification_id: Uuid,
    pub notified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_display_names() {
        for s in AppointmentStatus::ALL {
            assert_eq!(AppointmentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(AppointmentStatus::parse("no-show"), Some(AppointmentStatus::NoShow));
        assert_eq!(AppointmentStatus::parse("arrived"), None);
    }

    #[test]
    fn terminal_statuses_are_frozen() {
        use AppointmentStatus::*;
        for from in [Completed, Canceled, NoShow] {
            for to in AppointmentStatus::ALL {
                assert_eq!(from.can_transition_to(to), from == to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn active_statuses_follow_the_lifecycle() {
        use AppointmentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(NoShow));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Canceled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Confirmed.can_transition_to(Pending));
    }

    #[test]
    fn no_show_serializes_with_hyphen() {
        let json = serde_json::to_string(&AppointmentStatus::NoShow).unwrap();
        assert_eq!(json, "\"No-show\"");
    }
}
