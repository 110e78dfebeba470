use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Appointment, AppointmentStatus, NewAppointment, NewNotification, NotificationRecord};
use crate::queue::error::StoreError;
use crate::queue::store::{AppointmentStore, StoreTx};

/// First key of the two-key advisory lock; the second key is the day number.
const QUEUE_LOCK_NAMESPACE: i32 = 0x5155; // "QU"

const NOTIFICATION_COLUMNS: &str = r#"
    n.notification_id,
    n.appointment_id,
    n.queue_number,
    n.message,
    n.is_sent,
    n.created_at,
    n.sent_at,
    n.read_at
"#;

const APPOINTMENT_COLUMNS: &str = r#"
    appointment_id,
    patient_id,
    scheduled_date,
    status,
    queue_number,
    called_at,
    created_by,
    created_at,
    updated_at,
    deleted_at
"#;

#[derive(Clone)]
pub struct PgAppointmentStore {
    db: PgPool,
}

impl PgAppointmentStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AppointmentStore for PgAppointmentStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.db.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }
}

pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

fn expect_one(rows_affected: u64, appointment_id: Uuid) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::RowNotFound(format!("appointment {appointment_id}")))
    } else {
        Ok(())
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn lock_date(&mut self, date: NaiveDate) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(QUEUE_LOCK_NAMESPACE)
            .bind(date.num_days_from_ce())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn find_by_id(&mut self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let sql = format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointment WHERE appointment_id = $1 AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, Appointment>(&sql)
            .bind(appointment_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn find_by_id_for_update(&mut self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let sql = format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointment WHERE appointment_id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        let row = sqlx::query_as::<_, Appointment>(&sql)
            .bind(appointment_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn find_by_patient(&mut self, patient_id: Uuid, limit: i64) -> Result<Vec<Appointment>, StoreError> {
        let sql = format!(
            r#"
            SELECT {APPOINTMENT_COLUMNS}
            FROM appointment
            WHERE patient_id = $1
              AND deleted_at IS NULL
            ORDER BY scheduled_date DESC, queue_number ASC NULLS FIRST
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, Appointment>(&sql)
            .bind(patient_id)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn find_by_date_and_status(
        &mut self,
        date: NaiveDate,
        statuses: &[AppointmentStatus],
    ) -> Result<Vec<Appointment>, StoreError> {
        let codes: Vec<i16> = statuses.iter().map(|s| *s as i16).collect();
        let sql = format!(
            r#"
            SELECT {APPOINTMENT_COLUMNS}
            FROM appointment
            WHERE scheduled_date = $1
              AND status = ANY($2)
              AND deleted_at IS NULL
            ORDER BY queue_number ASC NULLS FIRST, created_at ASC
            "#
        );
        let rows = sqlx::query_as::<_, Appointment>(&sql)
            .bind(date)
            .bind(codes)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn find_in_range(&mut self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Appointment>, StoreError> {
        let sql = format!(
            r#"
            SELECT {APPOINTMENT_COLUMNS}
            FROM appointment
            WHERE scheduled_date BETWEEN $1 AND $2
              AND deleted_at IS NULL
            ORDER BY scheduled_date ASC, queue_number ASC NULLS FIRST, created_at ASC
            "#
        );
        let rows = sqlx::query_as::<_, Appointment>(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn max_queue_number_for_date(&mut self, date: NaiveDate) -> Result<Option<i32>, StoreError> {
        let max: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT MAX(queue_number)
            FROM appointment
            WHERE scheduled_date = $1
              AND deleted_at IS NULL
            "#,
        )
        .bind(date)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(max)
    }

    async fn count_by_status(&mut self, date: NaiveDate) -> Result<Vec<(AppointmentStatus, i64)>, StoreError> {
        let rows = sqlx::query_as::<_, (AppointmentStatus, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM appointment
            WHERE scheduled_date = $1
              AND deleted_at IS NULL
            GROUP BY status
            "#,
        )
        .bind(date)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn insert(&mut self, new: &NewAppointment) -> Result<Appointment, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO appointment (
              appointment_id,
              patient_id,
              scheduled_date,
              status,
              queue_number,
              created_by,
              created_at,
              updated_at
            )
            VALUES ($1, $2, $3, $4, NULL, $5, $6, $6)
            RETURNING {APPOINTMENT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, Appointment>(&sql)
            .bind(new.appointment_id)
            .bind(new.patient_id)
            .bind(new.scheduled_date)
            .bind(AppointmentStatus::Pending)
            .bind(new.created_by)
            .bind(new.created_at)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn update_status(
        &mut self,
        appointment_id: Uuid,
        expected: AppointmentStatus,
        status: AppointmentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE appointment
            SET status = $3, updated_at = $4
            WHERE appointment_id = $1
              AND status = $2
              AND deleted_at IS NULL
            "#,
        )
        .bind(appointment_id)
        .bind(expected)
        .bind(status)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Stale(format!(
                "appointment {appointment_id} is no longer {expected}"
            )));
        }
        Ok(())
    }

    async fn mark_called(&mut self, appointment_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE appointment
            SET called_at = $2, updated_at = $2
            WHERE appointment_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(appointment_id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        expect_one(res.rows_affected(), appointment_id)
    }

    async fn update_queue_number(
        &mut self,
        appointment_id: Uuid,
        queue_number: Option<i32>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE appointment
            SET queue_number = $2, updated_at = $3
            WHERE appointment_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(appointment_id)
        .bind(queue_number)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        expect_one(res.rows_affected(), appointment_id)
    }

    async fn update_scheduled_date(
        &mut self,
        appointment_id: Uuid,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE appointment
            SET scheduled_date = $2,
                queue_number = NULL,
                called_at = NULL,
                updated_at = $3
            WHERE appointment_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(appointment_id)
        .bind(date)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        expect_one(res.rows_affected(), appointment_id)
    }

    async fn soft_delete(&mut self, appointment_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE appointment
            SET deleted_at = $2, updated_at = $2
            WHERE appointment_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(appointment_id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        expect_one(res.rows_affected(), appointment_id)
    }

    async fn insert_notification(&mut self, new: &NewNotification) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO queue_notification (
              notification_id,
              appointment_id,
              queue_number,
              message,
              is_sent,
              created_at
            )
            VALUES ($1, $2, $3, $4, false, $5)
            "#,
        )
        .bind(new.notification_id)
        .bind(new.appointment_id)
        .bind(new.queue_number)
        .bind(&new.message)
        .bind(new.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn mark_notification_sent(&mut self, notification_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE queue_notification
            SET is_sent = true, sent_at = $2
            WHERE notification_id = $1
            "#,
        )
        .bind(notification_id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_notifications_for_patient(
        &mut self,
        patient_id: Uuid,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM queue_notification n
            JOIN appointment a ON a.appointment_id = n.appointment_id
            WHERE a.patient_id = $1
            ORDER BY n.created_at DESC, n.notification_id DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, NotificationRecord>(&sql)
            .bind(patient_id)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn mark_notification_read(
        &mut self,
        patient_id: Uuid,
        notification_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        let sql = format!(
            r#"
            UPDATE queue_notification n
            SET read_at = COALESCE(n.read_at, $3)
            FROM appointment a
            WHERE n.notification_id = $1
              AND a.appointment_id = n.appointment_id
              AND a.patient_id = $2
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, NotificationRecord>(&sql)
            .bind(notification_id)
            .bind(patient_id)
            .bind(at)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
