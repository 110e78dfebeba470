use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::models::{Appointment, AppointmentStatus, NewAppointment, NewNotification, NotificationRecord};
use crate::queue::error::StoreError;
use crate::queue::store::{AppointmentStore, StoreTx};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    appointments: BTreeMap<Uuid, Appointment>,
    notifications: BTreeMap<Uuid, NotificationRecord>,
}

#[derive(Debug, Default)]
struct Faults {
    commit_failures: AtomicU32,
    queue_conflicts: AtomicU32,
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-process appointment store with the same transactional behaviour as the
/// Postgres adapter.
///
/// A transaction holds the whole store exclusively and works on a private copy
/// that replaces the shared state on commit, so writers are fully serialised.
#[derive(Clone, Default)]
pub struct MemoryAppointmentStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Faults>,
}

impl MemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` commits fail with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, n: u32) {
        self.faults.commit_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` queue-number writes fail with [`StoreError::Conflict`].
    pub fn inject_queue_conflicts(&self, n: u32) {
        self.faults.queue_conflicts.store(n, Ordering::SeqCst);
    }

    /// Writes a row as-is, bypassing the queue rules.
    pub async fn seed(&self, appointment: Appointment) {
        let mut state = self.state.lock().await;
        state.appointments.insert(appointment.appointment_id, appointment);
    }

    /// All rows, soft-deleted ones included.
    pub async fn appointments(&self) -> Vec<Appointment> {
        let state = self.state.lock().await;
        state.appointments.values().cloned().collect()
    }

    pub async fn notifications(&self) -> Vec<NotificationRecord> {
        let state = self.state.lock().await;
        let mut out: Vec<NotificationRecord> = state.notifications.values().cloned().collect();
        out.sort_by_key(|n| n.created_at);
        out
    }
}

#[async_trait]
impl AppointmentStore for MemoryAppointmentStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            faults: self.faults.clone(),
        }))
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    faults: Arc<Faults>,
}

impl MemoryTx {
    fn live_mut(&mut self, appointment_id: Uuid) -> Result<&mut Appointment, StoreError> {
        self.working
            .appointments
            .get_mut(&appointment_id)
            .filter(|a| a.deleted_at.is_none())
            .ok_or_else(|| StoreError::RowNotFound(format!("appointment {appointment_id}")))
    }

    fn live(&self) -> impl Iterator<Item = &Appointment> {
        self.working.appointments.values().filter(|a| a.deleted_at.is_none())
    }
}

fn queue_order(rows: &mut [Appointment]) {
    rows.sort_by(|a, b| {
        a.scheduled_date
            .cmp(&b.scheduled_date)
            .then(a.queue_number.cmp(&b.queue_number))
            .then(a.created_at.cmp(&b.created_at))
    });
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_date(&mut self, _date: NaiveDate) -> Result<(), StoreError> {
        // The transaction already owns the whole store.
        Ok(())
    }

    async fn find_by_id(&mut self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError> {
        Ok(self.live().find(|a| a.appointment_id == appointment_id).cloned())
    }

    async fn find_by_id_for_update(&mut self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError> {
        self.find_by_id(appointment_id).await
    }

    async fn find_by_patient(&mut self, patient_id: Uuid, limit: i64) -> Result<Vec<Appointment>, StoreError> {
        let mut rows: Vec<Appointment> = self.live().filter(|a| a.patient_id == patient_id).cloned().collect();
        rows.sort_by(|a, b| {
            b.scheduled_date
                .cmp(&a.scheduled_date)
                .then(a.queue_number.cmp(&b.queue_number))
        });
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn find_by_date_and_status(
        &mut self,
        date: NaiveDate,
        statuses: &[AppointmentStatus],
    ) -> Result<Vec<Appointment>, StoreError> {
        let mut rows: Vec<Appointment> = self
            .live()
            .filter(|a| a.scheduled_date == date && statuses.contains(&a.status))
            .cloned()
            .collect();
        queue_order(&mut rows);
        Ok(rows)
    }

    async fn find_in_range(&mut self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Appointment>, StoreError> {
        let mut rows: Vec<Appointment> = self
            .live()
            .filter(|a| a.scheduled_date >= start && a.scheduled_date <= end)
            .cloned()
            .collect();
        queue_order(&mut rows);
        Ok(rows)
    }

    async fn max_queue_number_for_date(&mut self, date: NaiveDate) -> Result<Option<i32>, StoreError> {
        Ok(self
            .live()
            .filter(|a| a.scheduled_date == date)
            .filter_map(|a| a.queue_number)
            .max())
    }

    async fn count_by_status(&mut self, date: NaiveDate) -> Result<Vec<(AppointmentStatus, i64)>, StoreError> {
        let mut counts: BTreeMap<AppointmentStatus, i64> = BTreeMap::new();
        for a in self.live().filter(|a| a.scheduled_date == date) {
            *counts.entry(a.status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn insert(&mut self, new: &NewAppointment) -> Result<Appointment, StoreError> {
        if self.working.appointments.contains_key(&new.appointment_id) {
            return Err(StoreError::Conflict(format!(
                "appointment {} already exists",
                new.appointment_id
            )));
        }
        let row = Appointment {
            appointment_id: new.appointment_id,
            patient_id: new.patient_id,
            scheduled_date: new.scheduled_date,
            status: AppointmentStatus::Pending,
            queue_number: None,
            called_at: None,
            created_by: new.created_by,
            created_at: new.created_at,
            updated_at: new.created_at,
            deleted_at: None,
        };
        self.working.appointments.insert(row.appointment_id, row.clone());
        Ok(row)
    }

    async fn update_status(
        &mut self,
        appointment_id: Uuid,
        expected: AppointmentStatus,
        status: AppointmentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let row = self.live_mut(appointment_id)?;
        if row.status != expected {
            return Err(StoreError::Stale(format!(
                "appointment {appointment_id} is no longer {expected}"
            )));
        }
        row.status = status;
        row.updated_at = at;
        Ok(())
    }

    async fn mark_called(&mut self, appointment_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let row = self.live_mut(appointment_id)?;
        row.called_at = Some(at);
        row.updated_at = at;
        Ok(())
    }

    async fn update_queue_number(
        &mut self,
        appointment_id: Uuid,
        queue_number: Option<i32>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let date = self.live_mut(appointment_id)?.scheduled_date;

        if let Some(n) = queue_number {
            if take(&self.faults.queue_conflicts) {
                return Err(StoreError::Conflict(format!("queue number {n} on {date} (injected)")));
            }
            let taken = self.live().any(|a| {
                a.appointment_id != appointment_id && a.scheduled_date == date && a.queue_number == Some(n)
            });
            if taken {
                return Err(StoreError::Conflict(format!("queue number {n} on {date} is taken")));
            }
        }

        let row = self.live_mut(appointment_id)?;
        row.queue_number = queue_number;
        row.updated_at = at;
        Ok(())
    }

    async fn update_scheduled_date(
        &mut self,
        appointment_id: Uuid,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let row = self.live_mut(appointment_id)?;
        row.scheduled_date = date;
        row.queue_number = None;
        row.called_at = None;
        row.updated_at = at;
        Ok(())
    }

    async fn soft_delete(&mut self, appointment_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let row = self.live_mut(appointment_id)?;
        row.deleted_at = Some(at);
        row.updated_at = at;
        Ok(())
    }

    async fn insert_notification(&mut self, new: &NewNotification) -> Result<(), StoreError> {
        self.working.notifications.insert(
            new.notification_id,
            NotificationRecord {
                notification_id: new.notification_id,
                appointment_id: new.appointment_id,
                queue_number: new.queue_number,
                message: new.message.clone(),
                is_sent: false,
                created_at: new.created_at,
                sent_at: None,
                read_at: None,
            },
        );
        Ok(())
    }

    async fn mark_notification_sent(&mut self, notification_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(n) = self.working.notifications.get_mut(&notification_id) {
            n.is_sent = true;
            n.sent_at = Some(at);
        }
        Ok(())
    }

    async fn find_notifications_for_patient(
        &mut self,
        patient_id: Uuid,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        let owned = |n: &&NotificationRecord| {
            self.working
                .appointments
                .get(&n.appointment_id)
                .is_some_and(|a| a.patient_id == patient_id)
        };
        let mut rows: Vec<NotificationRecord> = self.working.notifications.values().filter(owned).cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn mark_notification_read(
        &mut self,
        patient_id: Uuid,
        notification_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        let MemoryState {
            appointments,
            notifications,
        } = &mut self.working;
        let Some(n) = notifications.get_mut(&notification_id) else {
            return Ok(None);
        };
        if !appointments
            .get(&n.appointment_id)
            .is_some_and(|a| a.patient_id == patient_id)
        {
            return Ok(None);
        }
        n.read_at.get_or_insert(at);
        Ok(Some(n.clone()))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if take(&self.faults.commit_failures) {
            return Err(StoreError::Unavailable("commit failed (injected)".into()));
        }
        let MemoryTx { mut guard, working, .. } = *self;
        *guard = working;
        Ok(())
    }
}
