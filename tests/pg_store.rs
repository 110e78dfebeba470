//! Postgres-backed queue tests. They need a server to create scratch
//! databases on:
//!
//! ```sh
//! DATABASE_URL=postgres://... cargo test --test pg_store -- --ignored
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use common::{day, RecordingNotifier};
use doral_queue_server::models::{AppointmentStatus, NewAppointment};
use doral_queue_server::queue::{
    AppointmentChanges, AppointmentStore, BookingRequest, FixedClock, PgAppointmentStore, PgAuditLog, QueueError,
    QueueService, QueueSettings, StoreError,
};

fn pg_service(pool: &PgPool) -> Arc<QueueService> {
    Arc::new(QueueService::new(
        Arc::new(PgAppointmentStore::new(pool.clone())),
        Arc::new(RecordingNotifier::default()),
        Arc::new(PgAuditLog::new(pool.clone())),
        Arc::new(FixedClock::on(day())),
        QueueSettings {
            notify_max_attempts: 1,
            notify_retry_delay: Duration::ZERO,
            history_max_days: 31,
        },
    ))
}

fn booking() -> BookingRequest {
    BookingRequest {
        patient_id: Uuid::new_v4(),
        scheduled_date: day(),
        created_by: None,
    }
}

fn unnumbered() -> NewAppointment {
    NewAppointment {
        appointment_id: Uuid::new_v4(),
        patient_id: Uuid::new_v4(),
        scheduled_date: day(),
        created_by: None,
        created_at: Utc::now(),
    }
}

fn cancel() -> AppointmentChanges {
    AppointmentChanges {
        status: Some(AppointmentStatus::Canceled),
        ..AppointmentChanges::default()
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_bookings_are_numbered_one_through_k(pool: PgPool) {
    let svc = pg_service(&pool);
    let k = 20;

    let mut handles = Vec::new();
    for _ in 0..k {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move { svc.book(booking()).await }));
    }

    let mut numbers = Vec::new();
    for handle in handles {
        numbers.push(handle.await.unwrap().unwrap().queue_number.unwrap());
    }
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=k).collect::<Vec<i32>>());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn duplicate_number_on_a_date_is_a_conflict(pool: PgPool) {
    let store = PgAppointmentStore::new(pool);
    let at = Utc::now();

    let mut tx = store.begin().await.unwrap();
    let a = tx.insert(&unnumbered()).await.unwrap();
    let b = tx.insert(&unnumbered()).await.unwrap();
    tx.update_queue_number(a.appointment_id, Some(1), at)
        .await
        .unwrap();

    let err = tx
        .update_queue_number(b.appointment_id, Some(1), at)
        .await
        .unwrap_err();
    assert_matches!(err, StoreError::Conflict(_));
    assert_matches!(QueueError::from(err), QueueError::Conflict(_));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn stale_status_write_cannot_revive_a_canceled_appointment(pool: PgPool) {
    let svc = pg_service(&pool);
    let store = PgAppointmentStore::new(pool.clone());
    let booked = svc.book(booking()).await.unwrap();

    // A writer that read the row while it was still Pending...
    let mut late = store.begin().await.unwrap();
    let seen = late.find_by_id(booked.appointment_id).await.unwrap().unwrap();
    assert_eq!(seen.status, AppointmentStatus::Pending);

    // ...loses to a cancel that commits first.
    let canceled = svc.update(booked.appointment_id, cancel(), None).await.unwrap();
    assert_eq!(canceled.status, AppointmentStatus::Canceled);

    let err = late
        .update_status(
            booked.appointment_id,
            AppointmentStatus::Pending,
            AppointmentStatus::Confirmed,
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert_matches!(err, StoreError::Stale(_));
    drop(late);

    let stored = svc.get(booked.appointment_id).await.unwrap();
    assert_eq!(stored.status, AppointmentStatus::Canceled);
    assert_eq!(stored.called_at, None);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn cancel_racing_call_next_always_ends_canceled(pool: PgPool) {
    let svc = pg_service(&pool);
    let store = PgAppointmentStore::new(pool.clone());
    let booked = svc.book(booking()).await.unwrap();

    // Hold the date so both writers queue up behind it.
    let mut gate = store.begin().await.unwrap();
    gate.lock_date(day()).await.unwrap();

    let caller = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.call_next(Some(day()), None).await })
    };
    let canceler = {
        let svc = svc.clone();
        let id = booked.appointment_id;
        tokio::spawn(async move { svc.update(id, cancel(), None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.commit().await.unwrap();

    caller.await.unwrap().unwrap();
    canceler.await.unwrap().unwrap();

    let stored = svc.get(booked.appointment_id).await.unwrap();
    assert_eq!(stored.status, AppointmentStatus::Canceled);
    assert_eq!(svc.next_in_queue(Some(day())).await.unwrap(), None);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn racing_assign_queue_calls_share_one_number(pool: PgPool) {
    let svc = pg_service(&pool);
    let store = PgAppointmentStore::new(pool.clone());
    svc.book(booking()).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let legacy = tx.insert(&unnumbered()).await.unwrap();
    tx.commit().await.unwrap();

    let mut gate = store.begin().await.unwrap();
    gate.lock_date(day()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let svc = svc.clone();
        let id = legacy.appointment_id;
        handles.push(tokio::spawn(async move { svc.assign_queue(id).await }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.commit().await.unwrap();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 2);
    }
    let stored = svc.get(legacy.appointment_id).await.unwrap();
    assert_eq!(stored.queue_number, Some(2));
    assert_eq!(svc.book(booking()).await.unwrap().queue_number, Some(3));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn patient_inbox_is_scoped_and_read_is_sticky(pool: PgPool) {
    let svc = pg_service(&pool);
    let patient = Uuid::new_v4();
    svc.book(BookingRequest {
        patient_id: patient,
        ..booking()
    })
    .await
    .unwrap();
    svc.book(booking()).await.unwrap();

    let called = svc.call_next(Some(day()), None).await.unwrap().unwrap();
    assert_eq!(called.appointment.patient_id, patient);

    let inbox = svc.patient_notifications(patient).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].notification_id, called.notification_id);

    assert_matches!(
        svc.mark_notification_read(Uuid::new_v4(), called.notification_id).await,
        Err(QueueError::NotFound(_))
    );
    let read = svc
        .mark_notification_read(patient, called.notification_id)
        .await
        .unwrap();
    let again = svc
        .mark_notification_read(patient, called.notification_id)
        .await
        .unwrap();
    assert!(read.read_at.is_some());
    assert_eq!(again.read_at, read.read_at);

    let mine = svc.patient_appointments(patient).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].queue_number, Some(1));
}
