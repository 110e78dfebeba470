use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::models::Appointment;

/// Outbound patient notifications. Delivery is best-effort: an `Err` is
/// logged and retried by the caller, never propagated to the queue operation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify_called(&self, appointment: &Appointment, people_ahead: i64) -> anyhow::Result<()>;

    async fn notify_status_changed(&self, appointment: &Appointment) -> anyhow::Result<()>;
}

/// Writes notifications to the log only. Used when no delivery endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationService for LogNotifier {
    async fn notify_called(&self, appointment: &Appointment, people_ahead: i64) -> anyhow::Result<()> {
        tracing::info!(
            appointment_id = %appointment.appointment_id,
            patient_id = %appointment.patient_id,
            queue_number = ?appointment.queue_number,
            people_ahead,
            "queue turn notification"
        );
        Ok(())
    }

    async fn notify_status_changed(&self, appointment: &Appointment) -> anyhow::Result<()> {
        tracing::info!(
            appointment_id = %appointment.appointment_id,
            patient_id = %appointment.patient_id,
            status = %appointment.status,
            "appointment status notification"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WebhookEvent<'a> {
    Called {
        appointment_id: Uuid,
        patient_id: Uuid,
        scheduled_date: chrono::NaiveDate,
        queue_number: Option<i32>,
        people_ahead: i64,
    },
    StatusChanged {
        appointment_id: Uuid,
        patient_id: Uuid,
        scheduled_date: chrono::NaiveDate,
        status: &'a str,
    },
}

/// Posts notification events as JSON to an external delivery service (SMS/e-mail gateway).
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("building notification http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, event: &WebhookEvent<'_>) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .context("notification webhook unreachable")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("notification webhook returned {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationService for WebhookNotifier {
    async fn notify_called(&self, appointment: &Appointment, people_ahead: i64) -> anyhow::Result<()> {
        self.post(&WebhookEvent::Called {
            appointment_id: appointment.appointment_id,
            patient_id: appointment.patient_id,
            scheduled_date: appointment.scheduled_date,
            queue_number: appointment.queue_number,
            people_ahead,
        })
        .await
    }

    async fn notify_status_changed(&self, appointment: &Appointment) -> anyhow::Result<()> {
        self.post(&WebhookEvent::StatusChanged {
            appointment_id: appointment.appointment_id,
            patient_id: appointment.patient_id,
            scheduled_date: appointment.scheduled_date,
            status: appointment.status.as_str(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    #[test]
    fn called_event_is_tagged() {
        let event = WebhookEvent::Called {
            appointment_id: Uuid::nil(),
            patient_id: Uuid::nil(),
            scheduled_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            queue_number: Some(4),
            people_ahead: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "called");
        assert_eq!(json["queue_number"], 4);
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        let appointment = Appointment {
            appointment_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            scheduled_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            status: crate::models::AppointmentStatus::Confirmed,
            queue_number: Some(1),
            called_at: None,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        assert!(LogNotifier.notify_called(&appointment, 2).await.is_ok());
        assert!(LogNotifier.notify_status_changed(&appointment).await.is_ok());
    }
}
