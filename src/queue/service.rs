use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::models::{
    Appointment, AppointmentStatus, CalledAppointment, NewAppointment, NewNotification, NotificationRecord,
    QueuePosition, QueueStats, ReorderItem,
};
use crate::queue::audit::AuditLogService;
use crate::queue::clock::Clock;
use crate::queue::error::QueueError;
use crate::queue::notify::NotificationService;
use crate::queue::store::{AppointmentStore, StoreTx};

const MAX_NOTIFY_WINDOW: usize = 50;
const PATIENT_APPOINTMENTS_LIMIT: i64 = 50;
const PATIENT_NOTIFICATIONS_LIMIT: i64 = 30;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub notify_max_attempts: u32,
    pub notify_retry_delay: Duration,
    pub history_max_days: i64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            notify_max_attempts: 2,
            notify_retry_delay: Duration::from_millis(250),
            history_max_days: 92,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub patient_id: Uuid,
    pub scheduled_date: NaiveDate,
    /// Staff user for walk-ins; `None` for patient self-booking.
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppointmentChanges {
    pub scheduled_date: Option<NaiveDate>,
    pub status: Option<AppointmentStatus>,
}

/// Daily queue numbering, next-in-line selection, positions, reordering and
/// per-day statistics over the appointment store.
///
/// All state lives in the store; nothing about a queue is cached here.
pub struct QueueService {
    store: Arc<dyn AppointmentStore>,
    notifier: Arc<dyn NotificationService>,
    audit_log: Arc<dyn AuditLogService>,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl QueueService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        notifier: Arc<dyn NotificationService>,
        audit_log: Arc<dyn AuditLogService>,
        clock: Arc<dyn Clock>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            store,
            notifier,
            audit_log,
            clock,
            settings,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /* ============================================================
       Queue number assignment
       ============================================================ */

    /// Creates a Pending appointment and gives it the next queue number of its
    /// date, both in one transaction.
    pub async fn book(&self, req: BookingRequest) -> Result<Appointment, QueueError> {
        self.ensure_not_past("scheduled_date", req.scheduled_date)?;

        let req = &req;
        let appointment = retry_on_conflict("book", move || self.try_book(req)).await?;

        tracing::info!(
            appointment_id = %appointment.appointment_id,
            date = %appointment.scheduled_date,
            queue_number = ?appointment.queue_number,
            walk_in = req.created_by.is_some(),
            "appointment booked"
        );
        self.record_audit(
            req.created_by,
            format!(
                "Appointment {} booked for {} (queue #{})",
                appointment.appointment_id,
                appointment.scheduled_date,
                display_number(appointment.queue_number)
            ),
        )
        .await;

        Ok(appointment)
    }

    async fn try_book(&self, req: &BookingRequest) -> Result<Appointment, QueueError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        tx.lock_date(req.scheduled_date).await?;

        let inserted = tx
            .insert(&NewAppointment {
                appointment_id: Uuid::new_v4(),
                patient_id: req.patient_id,
                scheduled_date: req.scheduled_date,
                created_by: req.created_by,
                created_at: now,
            })
            .await?;

        let number = assign_in_tx(&mut *tx, &inserted, now).await?;
        tx.commit().await?;

        Ok(Appointment {
            queue_number: Some(number),
            updated_at: now,
            ..inserted
        })
    }

    /// Gives an unnumbered active appointment the next number of its date.
    /// An appointment that already holds a number keeps it.
    pub async fn assign_queue(&self, appointment_id: Uuid) -> Result<i32, QueueError> {
        retry_on_conflict("assign_queue", move || self.try_assign(appointment_id)).await
    }

    async fn try_assign(&self, appointment_id: Uuid) -> Result<i32, QueueError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let appointment = lock_appointment(&mut *tx, appointment_id).await?;

        if let Some(n) = appointment.queue_number {
            return Ok(n);
        }
        if appointment.status.is_terminal() {
            return Err(QueueError::validation(
                "appointment_id",
                format!("appointment is {}; only active appointments get a queue number", appointment.status),
            ));
        }

        let number = assign_in_tx(&mut *tx, &appointment, now).await?;
        tx.commit().await?;
        tracing::info!(%appointment_id, date = %appointment.scheduled_date, queue_number = number, "queue number assigned");
        Ok(number)
    }

    /* ============================================================
       Next in line
       ============================================================ */

    /// Lowest-numbered active appointment of `date` (default today) that has
    /// not been called yet. `None` means the queue is empty.
    pub async fn next_in_queue(&self, date: Option<NaiveDate>) -> Result<Option<Appointment>, QueueError> {
        let date = date.unwrap_or_else(|| self.clock.today());
        let mut tx = self.store.begin().await?;
        let next = next_uncalled(&mut *tx, date).await?;
        tx.commit().await?;
        Ok(next)
    }

    /// Calls the next patient: Pending becomes Confirmed, the appointment is
    /// marked called and a notification record is written, all in one
    /// transaction. Delivery happens after commit and cannot undo the call.
    pub async fn call_next(
        &self,
        date: Option<NaiveDate>,
        actor: Option<Uuid>,
    ) -> Result<Option<CalledAppointment>, QueueError> {
        let date = date.unwrap_or_else(|| self.clock.today());
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        tx.lock_date(date).await?;

        // Re-check the candidate under its row lock. A cancel or complete that
        // committed after the scan sends us back to scan again.
        let next = loop {
            let Some(candidate) = next_uncalled(&mut *tx, date).await? else {
                return Ok(None);
            };
            match tx.find_by_id_for_update(candidate.appointment_id).await? {
                Some(row) if row.status.is_active() && row.called_at.is_none() && row.scheduled_date == date => {
                    break row;
                }
                _ => {
                    tracing::debug!(appointment_id = %candidate.appointment_id, "next candidate changed, rescanning");
                }
            }
        };

        if next.status == AppointmentStatus::Pending {
            tx.update_status(
                next.appointment_id,
                AppointmentStatus::Pending,
                AppointmentStatus::Confirmed,
                now,
            )
            .await?;
        }
        tx.mark_called(next.appointment_id, now).await?;

        let notification_id = Uuid::new_v4();
        tx.insert_notification(&NewNotification {
            notification_id,
            appointment_id: next.appointment_id,
            queue_number: next.queue_number,
            message: format!(
                "You're next. Please be ready. Queue #: {}",
                display_number(next.queue_number)
            ),
            created_at: now,
        })
        .await?;
        tx.commit().await?;

        let called = Appointment {
            status: AppointmentStatus::Confirmed,
            called_at: Some(now),
            updated_at: now,
            ..next
        };

        tracing::info!(
            %date,
            appointment_id = %called.appointment_id,
            queue_number = ?called.queue_number,
            "patient called"
        );
        self.record_audit(
            actor,
            format!("Called queue #{} for {date}", display_number(called.queue_number)),
        )
        .await;

        let notified = self
            .deliver("called", notification_id, &called, || self.notifier.notify_called(&called, 0))
            .await;

        Ok(Some(CalledAppointment {
            appointment: called,
            notification_id,
            notified,
        }))
    }

    /// Sends a turn notification to the first `window` waiting patients of
    /// `date`, each with their own count of people ahead. Returns how many
    /// were delivered.
    pub async fn notify_upcoming(&self, date: Option<NaiveDate>, window: usize) -> Result<usize, QueueError> {
        if window == 0 || window > MAX_NOTIFY_WINDOW {
            return Err(QueueError::validation(
                "window",
                format!("window must be between 1 and {MAX_NOTIFY_WINDOW}"),
            ));
        }
        let date = date.unwrap_or_else(|| self.clock.today());
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let active = tx
            .find_by_date_and_status(date, &AppointmentStatus::ACTIVE)
            .await?;

        let mut outgoing: Vec<(Uuid, Appointment, i64)> = Vec::new();
        for a in active.iter().filter(|a| a.called_at.is_none()).take(window) {
            let n = a.queue_number.ok_or_else(|| missing_number(a))?;
            let ahead = count_ahead(&active, n);
            let notification_id = Uuid::new_v4();
            tx.insert_notification(&NewNotification {
                notification_id,
                appointment_id: a.appointment_id,
                queue_number: a.queue_number,
                message: format!("Your turn is coming up. People ahead of you: {ahead}. Queue #: {n}"),
                created_at: now,
            })
            .await?;
            outgoing.push((notification_id, a.clone(), ahead));
        }
        tx.commit().await?;

        let mut delivered = 0;
        for (notification_id, appointment, ahead) in &outgoing {
            if self
                .deliver("upcoming", *notification_id, appointment, || {
                    self.notifier.notify_called(appointment, *ahead)
                })
                .await
            {
                delivered += 1;
            }
        }

        tracing::info!(%date, queued = outgoing.len(), delivered, "upcoming notifications processed");
        Ok(delivered)
    }

    /* ============================================================
       Position
       ============================================================ */

    pub async fn queue_position(&self, appointment_id: Uuid) -> Result<QueuePosition, QueueError> {
        let mut tx = self.store.begin().await?;
        let appointment = tx
            .find_by_id(appointment_id)
            .await?
            .ok_or_else(|| appointment_not_found(appointment_id))?;
        let active = tx
            .find_by_date_and_status(appointment.scheduled_date, &AppointmentStatus::ACTIVE)
            .await?;
        tx.commit().await?;

        let total_in_queue = active.len() as i64;

        if !appointment.status.is_active() {
            return Ok(QueuePosition {
                appointment_id,
                scheduled_date: appointment.scheduled_date,
                queue_number: appointment.queue_number,
                people_ahead: 0,
                total_in_queue,
                in_active_queue: false,
            });
        }

        let n = appointment
            .queue_number
            .ok_or_else(|| missing_number(&appointment))?;

        Ok(QueuePosition {
            appointment_id,
            scheduled_date: appointment.scheduled_date,
            queue_number: Some(n),
            people_ahead: count_ahead(&active, n),
            total_in_queue,
            in_active_queue: true,
        })
    }

    /* ============================================================
       Reorder
       ============================================================ */

    /// Rewrites queue numbers for a batch of appointments of one date.
    /// Either every pair is applied or none is.
    pub async fn reorder(
        &self,
        date: NaiveDate,
        items: &[ReorderItem],
        actor: Option<Uuid>,
    ) -> Result<(), QueueError> {
        validate_reorder(items)?;

        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        tx.lock_date(date).await?;

        for item in items {
            let appointment = tx
                .find_by_id(item.appointment_id)
                .await?
                .ok_or_else(|| appointment_not_found(item.appointment_id))?;
            if appointment.scheduled_date != date {
                return Err(QueueError::validation(
                    "appointments",
                    format!(
                        "appointment {} is scheduled on {}, not {date}",
                        item.appointment_id, appointment.scheduled_date
                    ),
                ));
            }
        }

        let batch: HashSet<Uuid> = items.iter().map(|i| i.appointment_id).collect();
        let requested: HashSet<i32> = items.iter().map(|i| i.queue_number).collect();

        let same_day = tx
            .find_by_date_and_status(date, &AppointmentStatus::ALL)
            .await?;
        for other in same_day.iter().filter(|a| !batch.contains(&a.appointment_id)) {
            if let Some(n) = other.queue_number {
                if requested.contains(&n) {
                    return Err(QueueError::validation(
                        "appointments",
                        format!("queue number {n} is already held by appointment {}", other.appointment_id),
                    ));
                }
            }
        }

        // Release the old numbers first so swaps inside the batch never collide.
        for item in items {
            tx.update_queue_number(item.appointment_id, None, now).await?;
        }
        for item in items {
            tx.update_queue_number(item.appointment_id, Some(item.queue_number), now)
                .await?;
        }
        tx.commit().await?;

        tracing::info!(%date, moved = items.len(), "queue reordered");
        self.record_audit(actor, format!("Queue reordered for date: {date}")).await;
        Ok(())
    }

    /* ============================================================
       Statistics and listings
       ============================================================ */

    pub async fn queue_stats(&self, date: Option<NaiveDate>) -> Result<QueueStats, QueueError> {
        let date = date.unwrap_or_else(|| self.clock.today());
        let mut tx = self.store.begin().await?;
        let counts = tx.count_by_status(date).await?;
        tx.commit().await?;

        let mut stats = QueueStats {
            date,
            pending: 0,
            confirmed: 0,
            completed: 0,
            canceled: 0,
            no_show: 0,
            total: 0,
            active: 0,
        };
        for (status, n) in counts {
            match status {
                AppointmentStatus::Pending => stats.pending += n,
                AppointmentStatus::Confirmed => stats.confirmed += n,
                AppointmentStatus::Completed => stats.completed += n,
                AppointmentStatus::Canceled => stats.canceled += n,
                AppointmentStatus::NoShow => stats.no_show += n,
            }
            stats.total += n;
        }
        stats.active = stats.pending + stats.confirmed;
        Ok(stats)
    }

    /// Active appointments of `date` in serving order.
    pub async fn active_queue(&self, date: Option<NaiveDate>) -> Result<Vec<Appointment>, QueueError> {
        let date = date.unwrap_or_else(|| self.clock.today());
        let mut tx = self.store.begin().await?;
        let rows = tx
            .find_by_date_and_status(date, &AppointmentStatus::ACTIVE)
            .await?;
        tx.commit().await?;
        Ok(rows)
    }

    pub async fn list(
        &self,
        date: NaiveDate,
        status: Option<AppointmentStatus>,
    ) -> Result<Vec<Appointment>, QueueError> {
        let statuses: Vec<AppointmentStatus> = match status {
            Some(s) => vec![s],
            None => AppointmentStatus::ALL.to_vec(),
        };
        let mut tx = self.store.begin().await?;
        let rows = tx.find_by_date_and_status(date, &statuses).await?;
        tx.commit().await?;
        Ok(rows)
    }

    pub async fn history(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Appointment>, QueueError> {
        if end < start {
            return Err(QueueError::validation("end_date", "end_date must be >= start_date"));
        }
        let span = (end - start).num_days() + 1;
        if span > self.settings.history_max_days {
            return Err(QueueError::validation(
                "end_date",
                format!("range must not exceed {} days", self.settings.history_max_days),
            ));
        }
        let mut tx = self.store.begin().await?;
        let rows = tx.find_in_range(start, end).await?;
        tx.commit().await?;
        Ok(rows)
    }

    pub async fn get(&self, appointment_id: Uuid) -> Result<Appointment, QueueError> {
        let mut tx = self.store.begin().await?;
        let appointment = tx
            .find_by_id(appointment_id)
            .await?
            .ok_or_else(|| appointment_not_found(appointment_id))?;
        tx.commit().await?;
        Ok(appointment)
    }

    /* ============================================================
       Status changes, reschedule, delete
       ============================================================ */

    /// Reschedules and/or changes status in one transaction. A new date runs
    /// queue assignment again on that date; the old date keeps a gap.
    pub async fn update(
        &self,
        appointment_id: Uuid,
        changes: AppointmentChanges,
        actor: Option<Uuid>,
    ) -> Result<Appointment, QueueError> {
        if changes.scheduled_date.is_none() && changes.status.is_none() {
            return Err(QueueError::validation("body", "nothing to update"));
        }
        if let Some(date) = changes.scheduled_date {
            self.ensure_not_past("scheduled_date", date)?;
        }

        let changes = &changes;
        let (before, after, notification_id) =
            retry_on_conflict("update", move || self.try_update(appointment_id, changes)).await?;

        if before.scheduled_date != after.scheduled_date {
            tracing::info!(
                %appointment_id,
                from = %before.scheduled_date,
                to = %after.scheduled_date,
                queue_number = ?after.queue_number,
                "appointment rescheduled"
            );
            self.record_audit(
                actor,
                format!(
                    "Appointment {appointment_id} rescheduled from {} to {} (queue #{})",
                    before.scheduled_date,
                    after.scheduled_date,
                    display_number(after.queue_number)
                ),
            )
            .await;
        }

        if before.status != after.status {
            tracing::info!(%appointment_id, from = %before.status, to = %after.status, "appointment status changed");
            self.record_audit(
                actor,
                format!("Appointment {appointment_id} marked as {}", after.status),
            )
            .await;
            if let Some(notification_id) = notification_id {
                self.deliver("status_changed", notification_id, &after, || {
                    self.notifier.notify_status_changed(&after)
                })
                .await;
            }
        }

        Ok(after)
    }

    async fn try_update(
        &self,
        appointment_id: Uuid,
        changes: &AppointmentChanges,
    ) -> Result<(Appointment, Appointment, Option<Uuid>), QueueError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let seen = tx
            .find_by_id(appointment_id)
            .await?
            .ok_or_else(|| appointment_not_found(appointment_id))?;
        let mut dates = vec![seen.scheduled_date];
        if let Some(date) = changes.scheduled_date {
            dates.push(date);
        }
        dates.sort_unstable();
        dates.dedup();
        for date in dates {
            tx.lock_date(date).await?;
        }

        let before = tx
            .find_by_id_for_update(appointment_id)
            .await?
            .ok_or_else(|| appointment_not_found(appointment_id))?;
        if before.scheduled_date != seen.scheduled_date {
            return Err(QueueError::Conflict(format!(
                "appointment {appointment_id} was rescheduled concurrently"
            )));
        }
        let mut after = before.clone();

        if let Some(status) = changes.status {
            if !before.status.can_transition_to(status) {
                return Err(QueueError::validation(
                    "status",
                    format!("cannot change status from {} to {}", before.status, status),
                ));
            }
        }

        if let Some(date) = changes.scheduled_date {
            if date != before.scheduled_date {
                if before.status.is_terminal() {
                    return Err(QueueError::validation(
                        "scheduled_date",
                        format!("a {} appointment cannot be rescheduled", before.status),
                    ));
                }
                tx.update_scheduled_date(appointment_id, date, now).await?;
                after.scheduled_date = date;
                after.queue_number = None;
                after.called_at = None;

                let n = assign_in_tx(&mut *tx, &after, now).await?;
                after.queue_number = Some(n);
                after.updated_at = now;
            }
        }

        let mut notification_id = None;
        if let Some(status) = changes.status {
            if status != before.status {
                tx.update_status(appointment_id, before.status, status, now)
                    .await?;
                after.status = status;
                after.updated_at = now;

                let id = Uuid::new_v4();
                tx.insert_notification(&NewNotification {
                    notification_id: id,
                    appointment_id,
                    queue_number: after.queue_number,
                    message: format!(
                        "Your appointment on {} is now {}.",
                        after.scheduled_date, after.status
                    ),
                    created_at: now,
                })
                .await?;
                notification_id = Some(id);
            }
        }

        tx.commit().await?;
        Ok((before, after, notification_id))
    }

    pub async fn complete(&self, appointment_id: Uuid, actor: Option<Uuid>) -> Result<Appointment, QueueError> {
        self.update(
            appointment_id,
            AppointmentChanges {
                status: Some(AppointmentStatus::Completed),
                ..AppointmentChanges::default()
            },
            actor,
        )
        .await
    }

    pub async fn mark_no_show(&self, appointment_id: Uuid, actor: Option<Uuid>) -> Result<Appointment, QueueError> {
        self.update(
            appointment_id,
            AppointmentChanges {
                status: Some(AppointmentStatus::NoShow),
                ..AppointmentChanges::default()
            },
            actor,
        )
        .await
    }

    /// Soft delete. The queue number becomes a gap.
    pub async fn delete(&self, appointment_id: Uuid, actor: Option<Uuid>) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let appointment = lock_appointment(&mut *tx, appointment_id).await?;
        tx.soft_delete(appointment_id, now).await?;
        tx.commit().await?;

        tracing::info!(%appointment_id, date = %appointment.scheduled_date, "appointment deleted");
        self.record_audit(actor, format!("Appointment {appointment_id} deleted")).await;
        Ok(())
    }

    /* ============================================================
       Patient views
       ============================================================ */

    pub async fn patient_appointments(&self, patient_id: Uuid) -> Result<Vec<Appointment>, QueueError> {
        let mut tx = self.store.begin().await?;
        let rows = tx.find_by_patient(patient_id, PATIENT_APPOINTMENTS_LIMIT).await?;
        tx.commit().await?;
        Ok(rows)
    }

    pub async fn patient_notifications(&self, patient_id: Uuid) -> Result<Vec<NotificationRecord>, QueueError> {
        let mut tx = self.store.begin().await?;
        let rows = tx
            .find_notifications_for_patient(patient_id, PATIENT_NOTIFICATIONS_LIMIT)
            .await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Marks a notification read. Notifications about other patients'
    /// appointments are reported as not found.
    pub async fn mark_notification_read(
        &self,
        patient_id: Uuid,
        notification_id: Uuid,
    ) -> Result<NotificationRecord, QueueError> {
        let mut tx = self.store.begin().await?;
        let record = tx
            .mark_notification_read(patient_id, notification_id, self.clock.now())
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("notification {notification_id}")))?;
        tx.commit().await?;
        Ok(record)
    }

    /* ============================================================
       Helpers
       ============================================================ */

    fn ensure_not_past(&self, field: &'static str, date: NaiveDate) -> Result<(), QueueError> {
        let today = self.clock.today();
        if date < today {
            return Err(QueueError::validation(
                field,
                format!("{date} is in the past (today is {today})"),
            ));
        }
        Ok(())
    }

    async fn record_audit(&self, actor: Option<Uuid>, action: String) {
        if let Err(e) = self.audit_log.log(actor, &action).await {
            tracing::warn!(error = %format!("{e:#}"), %action, "audit log write failed");
        }
    }

    /// Tries delivery up to the configured number of attempts and marks the
    /// notification record sent on success.
    async fn deliver<F, Fut>(
        &self,
        kind: &'static str,
        notification_id: Uuid,
        appointment: &Appointment,
        mut send: F,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let attempts = self.settings.notify_max_attempts.max(1);
        for attempt in 1..=attempts {
            match send().await {
                Ok(()) => {
                    self.mark_sent(notification_id, self.clock.now()).await;
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        kind,
                        appointment_id = %appointment.appointment_id,
                        %notification_id,
                        attempt,
                        attempts,
                        error = %format!("{e:#}"),
                        "notification delivery failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.notify_retry_delay).await;
                    }
                }
            }
        }
        false
    }

    async fn mark_sent(&self, notification_id: Uuid, at: DateTime<Utc>) {
        let result = async {
            let mut tx = self.store.begin().await?;
            tx.mark_notification_sent(notification_id, at).await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(%notification_id, error = %e, "could not mark notification as sent");
        }
    }
}

/// Runs `attempt`, and once more if it reports a queue-number conflict.
async fn retry_on_conflict<T, F, Fut>(op: &'static str, mut attempt: F) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    match attempt().await {
        Err(QueueError::Conflict(first)) => {
            tracing::warn!(op, conflict = %first, "concurrent write conflict, retrying");
            match attempt().await {
                Err(QueueError::Conflict(second)) => Err(QueueError::Conflict(format!(
                    "{op}: still contended after retry ({second})"
                ))),
                other => other,
            }
        }
        other => other,
    }
}

/// Date lock first, then the row lock, so every writer takes them in the same order.
async fn lock_appointment(tx: &mut dyn StoreTx, appointment_id: Uuid) -> Result<Appointment, QueueError> {
    let seen = tx
        .find_by_id(appointment_id)
        .await?
        .ok_or_else(|| appointment_not_found(appointment_id))?;
    tx.lock_date(seen.scheduled_date).await?;

    let locked = tx
        .find_by_id_for_update(appointment_id)
        .await?
        .ok_or_else(|| appointment_not_found(appointment_id))?;
    if locked.scheduled_date != seen.scheduled_date {
        return Err(QueueError::Conflict(format!(
            "appointment {appointment_id} was rescheduled concurrently"
        )));
    }
    Ok(locked)
}

/// max + 1 over the live appointments of the date, under the date lock.
async fn assign_in_tx(tx: &mut dyn StoreTx, appointment: &Appointment, at: DateTime<Utc>) -> Result<i32, QueueError> {
    let date = appointment.scheduled_date;
    tx.lock_date(date).await?;

    let max = tx.max_queue_number_for_date(date).await?.unwrap_or(0);
    let next = max
        .checked_add(1)
        .ok_or_else(|| QueueError::DataIntegrity(format!("queue number overflow on {date}")))?;

    tx.update_queue_number(appointment.appointment_id, Some(next), at)
        .await?;
    Ok(next)
}

async fn next_uncalled(tx: &mut dyn StoreTx, date: NaiveDate) -> Result<Option<Appointment>, QueueError> {
    let active = tx
        .find_by_date_and_status(date, &AppointmentStatus::ACTIVE)
        .await?;

    let mut best: Option<(i32, Appointment)> = None;
    for a in active.into_iter().filter(|a| a.called_at.is_none()) {
        let n = a.queue_number.ok_or_else(|| missing_number(&a))?;
        let better = match &best {
            Some((current, _)) => n < *current,
            None => true,
        };
        if better {
            best = Some((n, a));
        }
    }
    Ok(best.map(|(_, a)| a))
}

fn count_ahead(active: &[Appointment], queue_number: i32) -> i64 {
    active
        .iter()
        .filter(|a| a.queue_number.is_some_and(|q| q < queue_number))
        .count() as i64
}

fn validate_reorder(items: &[ReorderItem]) -> Result<(), QueueError> {
    if items.is_empty() {
        return Err(QueueError::validation("appointments", "at least one appointment is required"));
    }

    let mut ids = HashSet::new();
    let mut numbers = HashSet::new();
    for item in items {
        if item.queue_number < 1 {
            return Err(QueueError::validation(
                "queue_number",
                format!("queue number for {} must be >= 1", item.appointment_id),
            ));
        }
        if !ids.insert(item.appointment_id) {
            return Err(QueueError::validation(
                "appointment_id",
                format!("appointment {} appears more than once", item.appointment_id),
            ));
        }
        if !numbers.insert(item.queue_number) {
            return Err(QueueError::validation(
                "queue_number",
                format!("queue number {} is requested more than once", item.queue_number),
            ));
        }
    }
    Ok(())
}

fn appointment_not_found(appointment_id: Uuid) -> QueueError {
    QueueError::NotFound(format!("appointment {appointment_id}"))
}

fn missing_number(a: &Appointment) -> QueueError {
    QueueError::DataIntegrity(format!(
        "active appointment {} on {} has no queue number",
        a.appointment_id, a.scheduled_date
    ))
}

fn display_number(n: Option<i32>) -> String {
    n.map(|n| n.to_string()).unwrap_or_else(|| "-".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::audit::MockAuditLogService;
    use crate::queue::clock::FixedClock;
    use crate::queue::memory_store::MemoryAppointmentStore;
    use crate::queue::notify::MockNotificationService;
    use assert_matches::assert_matches;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn quiet_audit() -> MockAuditLogService {
        let mut audit = MockAuditLogService::new();
        audit.expect_log().returning(|_, _| Ok(()));
        audit
    }

    fn service_with(
        store: &MemoryAppointmentStore,
        notifier: MockNotificationService,
        audit: MockAuditLogService,
    ) -> QueueService {
        QueueService::new(
            Arc::new(store.clone()),
            Arc::new(notifier),
            Arc::new(audit),
            Arc::new(FixedClock::on(day())),
            QueueSettings {
                notify_max_attempts: 3,
                notify_retry_delay: Duration::ZERO,
                history_max_days: 31,
            },
        )
    }

    fn booking() -> BookingRequest {
        BookingRequest {
            patient_id: Uuid::new_v4(),
            scheduled_date: day(),
            created_by: None,
        }
    }

    #[tokio::test]
    async fn call_next_keeps_the_call_when_delivery_keeps_failing() {
        let store = MemoryAppointmentStore::new();
        let mut notifier = MockNotificationService::new();
        notifier
            .expect_notify_called()
            .times(3)
            .returning(|_, _| Err(anyhow::anyhow!("sms gateway down")));
        let svc = service_with(&store, notifier, quiet_audit());

        let booked = svc.book(booking()).await.unwrap();
        let called = svc.call_next(Some(day()), None).await.unwrap().unwrap();

        assert!(!called.notified);
        assert_eq!(called.appointment.appointment_id, booked.appointment_id);

        let stored = svc.get(booked.appointment_id).await.unwrap();
        assert_eq!(stored.status, AppointmentStatus::Confirmed);
        assert!(stored.called_at.is_some());

        let notifications = store.notifications().await;
        assert_eq!(notifications.len(), 1);
        assert!(!notifications[0].is_sent);
    }

    #[tokio::test]
    async fn delivered_call_marks_the_notification_sent() {
        let store = MemoryAppointmentStore::new();
        let mut notifier = MockNotificationService::new();
        notifier
            .expect_notify_called()
            .withf(|_, ahead| *ahead == 0)
            .times(1)
            .returning(|_, _| Ok(()));
        let svc = service_with(&store, notifier, quiet_audit());

        svc.book(booking()).await.unwrap();
        let called = svc.call_next(None, None).await.unwrap().unwrap();

        assert!(called.notified);
        let notifications = store.notifications().await;
        assert!(notifications[0].is_sent);
        assert_eq!(notifications[0].queue_number, Some(1));
    }

    #[tokio::test]
    async fn audit_failures_do_not_fail_booking() {
        let store = MemoryAppointmentStore::new();
        let mut audit = MockAuditLogService::new();
        audit
            .expect_log()
            .returning(|_, _| Err(anyhow::anyhow!("audit table locked")));
        let svc = service_with(&store, MockNotificationService::new(), audit);

        let booked = svc.book(booking()).await.unwrap();
        assert_eq!(booked.queue_number, Some(1));
    }

    #[tokio::test]
    async fn status_change_notifies_once_and_same_status_is_silent() {
        let store = MemoryAppointmentStore::new();
        let mut notifier = MockNotificationService::new();
        notifier
            .expect_notify_status_changed()
            .withf(|a| a.status == AppointmentStatus::Canceled)
            .times(1)
            .returning(|_| Ok(()));
        let svc = service_with(&store, notifier, quiet_audit());

        let booked = svc.book(booking()).await.unwrap();
        let same = AppointmentChanges {
            status: Some(AppointmentStatus::Pending),
            ..AppointmentChanges::default()
        };
        svc.update(booked.appointment_id, same, None).await.unwrap();

        let cancel = AppointmentChanges {
            status: Some(AppointmentStatus::Canceled),
            ..AppointmentChanges::default()
        };
        let updated = svc.update(booked.appointment_id, cancel, None).await.unwrap();
        assert_eq!(updated.status, AppointmentStatus::Canceled);
        assert_eq!(updated.queue_number, Some(1));

        let notifications = store.notifications().await;
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].is_sent);
    }

    #[tokio::test]
    async fn failed_status_notification_stays_unsent() {
        let store = MemoryAppointmentStore::new();
        let mut notifier = MockNotificationService::new();
        notifier
            .expect_notify_status_changed()
            .times(3)
            .returning(|_| Err(anyhow::anyhow!("sms gateway down")));
        let svc = service_with(&store, notifier, quiet_audit());

        let booked = svc.book(booking()).await.unwrap();
        let cancel = AppointmentChanges {
            status: Some(AppointmentStatus::Canceled),
            ..AppointmentChanges::default()
        };
        let updated = svc.update(booked.appointment_id, cancel, None).await.unwrap();
        assert_eq!(updated.status, AppointmentStatus::Canceled);

        let notifications = store.notifications().await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].appointment_id, booked.appointment_id);
        assert!(notifications[0].message.contains("Canceled"));
        assert!(!notifications[0].is_sent);
    }

    #[tokio::test]
    async fn reorder_is_audited_with_the_date() {
        let store = MemoryAppointmentStore::new();
        let mut audit = MockAuditLogService::new();
        audit
            .expect_log()
            .withf(|_, action| action.starts_with("Appointment "))
            .times(2)
            .returning(|_, _| Ok(()));
        audit
            .expect_log()
            .withf(|_, action| action == "Queue reordered for date: 2026-03-02")
            .times(1)
            .returning(|_, _| Ok(()));
        let svc = service_with(&store, MockNotificationService::new(), audit);

        let a = svc.book(booking()).await.unwrap();
        let b = svc.book(booking()).await.unwrap();
        svc.reorder(
            day(),
            &[
                ReorderItem { appointment_id: a.appointment_id, queue_number: 2 },
                ReorderItem { appointment_id: b.appointment_id, queue_number: 1 },
            ],
            None,
        )
        .await
        .unwrap();
    }

    #[test]
    fn reorder_validation_rejects_bad_batches() {
        let id = Uuid::new_v4();
        assert_matches!(validate_reorder(&[]), Err(QueueError::Validation { .. }));
        assert_matches!(
            validate_reorder(&[ReorderItem { appointment_id: id, queue_number: 0 }]),
            Err(QueueError::Validation { field: "queue_number", .. })
        );
        assert_matches!(
            validate_reorder(&[
                ReorderItem { appointment_id: id, queue_number: 1 },
                ReorderItem { appointment_id: id, queue_number: 2 },
            ]),
            Err(QueueError::Validation { field: "appointment_id", .. })
        );
        assert_matches!(
            validate_reorder(&[
                ReorderItem { appointment_id: Uuid::new_v4(), queue_number: 3 },
                ReorderItem { appointment_id: Uuid::new_v4(), queue_number: 3 },
            ]),
            Err(QueueError::Validation { field: "queue_number", .. })
        );
    }

    #[tokio::test]
    async fn conflict_is_retried_once() {
        let mut calls = 0;
        let result: Result<i32, QueueError> = retry_on_conflict("test", || {
            calls += 1;
            let n = calls;
            async move {
                if n == 1 {
                    Err(QueueError::Conflict("taken".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }
}
