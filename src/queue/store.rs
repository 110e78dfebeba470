use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{Appointment, AppointmentStatus, NewAppointment, NewNotification, NotificationRecord};
use crate::queue::error::StoreError;

/// Transactional access to the appointment table.
///
/// Every read and write of the queue happens inside a [`StoreTx`]. A
/// transaction that is dropped without [`StoreTx::commit`] is rolled back.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// One open store transaction.
///
/// Queries never return soft-deleted appointments. Lists are ordered by
/// `queue_number` ascending with unnumbered rows first, then `created_at`.
#[async_trait]
pub trait StoreTx: Send {
    /// Serialises writers for `date` until this transaction ends.
    async fn lock_date(&mut self, date: NaiveDate) -> Result<(), StoreError>;

    async fn find_by_id(&mut self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError>;

    /// Like [`StoreTx::find_by_id`], but holds a row lock until the transaction
    /// ends. Take date locks before row locks.
    async fn find_by_id_for_update(&mut self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError>;

    /// A patient's appointments, latest date first.
    async fn find_by_patient(&mut self, patient_id: Uuid, limit: i64) -> Result<Vec<Appointment>, StoreError>;

    async fn find_by_date_and_status(
        &mut self,
        date: NaiveDate,
        statuses: &[AppointmentStatus],
    ) -> Result<Vec<Appointment>, StoreError>;

    /// Inclusive on both ends, ordered by date then queue number.
    async fn find_in_range(&mut self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Appointment>, StoreError>;

    async fn max_queue_number_for_date(&mut self, date: NaiveDate) -> Result<Option<i32>, StoreError>;

    async fn count_by_status(&mut self, date: NaiveDate) -> Result<Vec<(AppointmentStatus, i64)>, StoreError>;

    /// Inserts with `status = Pending` and no queue number.
    async fn insert(&mut self, new: &NewAppointment) -> Result<Appointment, StoreError>;

    /// Compare-and-set: fails with [`StoreError::Stale`] unless the row still
    /// has status `expected`.
    async fn update_status(
        &mut self,
        appointment_id: Uuid,
        expected: AppointmentStatus,
        status: AppointmentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_called(&mut self, appointment_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Conflict`] when another live appointment on the
    /// same date already holds `queue_number`.
    async fn update_queue_number(
        &mut self,
        appointment_id: Uuid,
        queue_number: Option<i32>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Moves the appointment to `date`, clearing its queue number and called marker.
    async fn update_scheduled_date(
        &mut self,
        appointment_id: Uuid,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn soft_delete(&mut self, appointment_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn insert_notification(&mut self, new: &NewNotification) -> Result<(), StoreError>;

    async fn mark_notification_sent(&mut self, notification_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Notifications about a patient's appointments, newest first.
    async fn find_notifications_for_patient(
        &mut self,
        patient_id: Uuid,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>, StoreError>;

    /// Sets `read_at` on a notification belonging to `patient_id`. Returns
    /// `None` when no such notification exists for that patient.
    async fn mark_notification_read(
        &mut self,
        patient_id: Uuid,
        notification_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
