//! Shared fixtures for the queue service tests: an in-memory store, a fixed
//! clock and recording fakes for the outbound collaborators.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use doral_queue_server::models::{Appointment, AppointmentStatus};
use doral_queue_server::queue::{
    AuditLogService, BookingRequest, FixedClock, MemoryAppointmentStore, NotificationService, QueueService,
    QueueSettings,
};

pub fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
}

pub fn next_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 3).unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Called { appointment_id: Uuid, people_ahead: i64 },
    StatusChanged { appointment_id: Uuid, status: AppointmentStatus },
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
    failures_left: AtomicU32,
}

impl RecordingNotifier {
    /// The next `n` deliveries fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, event: Sent) -> anyhow::Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("gateway unreachable");
        }
        self.sent.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl NotificationService for RecordingNotifier {
    async fn notify_called(&self, appointment: &Appointment, people_ahead: i64) -> anyhow::Result<()> {
        self.record(Sent::Called {
            appointment_id: appointment.appointment_id,
            people_ahead,
        })
    }

    async fn notify_status_changed(&self, appointment: &Appointment) -> anyhow::Result<()> {
        self.record(Sent::StatusChanged {
            appointment_id: appointment.appointment_id,
            status: appointment.status,
        })
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    entries: Mutex<Vec<(Option<Uuid>, String)>>,
}

impl RecordingAudit {
    pub fn entries(&self) -> Vec<(Option<Uuid>, String)> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditLogService for RecordingAudit {
    async fn log(&self, actor_user_id: Option<Uuid>, action: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .push((actor_user_id, action.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub store: MemoryAppointmentStore,
    pub notifier: Arc<RecordingNotifier>,
    pub audit: Arc<RecordingAudit>,
    pub svc: Arc<QueueService>,
}

pub fn harness() -> Harness {
    let store = MemoryAppointmentStore::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let audit = Arc::new(RecordingAudit::default());
    let svc = QueueService::new(
        Arc::new(store.clone()),
        notifier.clone(),
        audit.clone(),
        Arc::new(FixedClock::on(day())),
        QueueSettings {
            notify_max_attempts: 2,
            notify_retry_delay: Duration::ZERO,
            history_max_days: 31,
        },
    );
    Harness {
        store,
        notifier,
        audit,
        svc: Arc::new(svc),
    }
}

impl Harness {
    pub async fn book_on(&self, date: NaiveDate) -> Appointment {
        self.book_for(Uuid::new_v4(), date).await
    }

    pub async fn book_for(&self, patient_id: Uuid, date: NaiveDate) -> Appointment {
        self.svc
            .book(BookingRequest {
                patient_id,
                scheduled_date: date,
                created_by: None,
            })
            .await
            .unwrap()
    }

    pub async fn book(&self) -> Appointment {
        self.book_on(day()).await
    }

    pub async fn number_of(&self, appointment_id: Uuid) -> Option<i32> {
        self.store
            .appointments()
            .await
            .into_iter()
            .find(|a| a.appointment_id == appointment_id)
            .and_then(|a| a.queue_number)
    }
}

/// A row written straight into the store, bypassing numbering.
pub fn seeded(status: AppointmentStatus, queue_number: Option<i32>, minute: u32) -> Appointment {
    let at = Utc.with_ymd_and_hms(2026, 3, 2, 7, minute, 0).unwrap();
    Appointment {
        appointment_id: Uuid::new_v4(),
        patient_id: Uuid::new_v4(),
        scheduled_date: day(),
        status,
        queue_number,
        called_at: None,
        created_by: None,
        created_at: at,
        updated_at: at,
        deleted_at: None,
    }
}
