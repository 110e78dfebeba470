use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, Appointment},
};
use axum::Router;
use chrono::NaiveDate;
use uuid::Uuid;

pub mod appointment_routes;
pub mod patient_routes;
pub mod queue_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", appointment_routes::router())
        .nest("/api/v1", queue_routes::router())
        .nest("/api/v1", patient_routes::router())
        .with_state(state)
}

/// Parses an optional `YYYY-MM-DD` query value.
pub(crate) fn parse_date(field: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| ApiError::BadRequest("VALIDATION_ERROR", format!("{field} must be YYYY-MM-DD")))
}

/// The patient record linked to a patient login.
pub(crate) async fn resolve_patient_id_by_user_id(state: &AppState, user_id: Uuid) -> Result<Uuid, ApiError> {
    let patient_id: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT patient_id
        FROM patient
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    patient_id.ok_or_else(|| {
        ApiError::BadRequest(
            "NO_PATIENT_PROFILE",
            "This account is not linked to a patient record".into(),
        )
    })
}

/// Staff see every appointment; patients only their own.
pub(crate) async fn ensure_can_view(
    state: &AppState,
    auth: &AuthContext,
    appointment: &Appointment,
) -> Result<(), ApiError> {
    if auth.is_queue_staff() {
        return Ok(());
    }
    if auth.is_patient() {
        let own = resolve_patient_id_by_user_id(state, auth.user_id).await?;
        if own == appointment.patient_id {
            return Ok(());
        }
    }
    Err(ApiError::Forbidden(
        "FORBIDDEN",
        "You can only view your own appointments".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_date_means_default() {
        assert_eq!(parse_date("date", None).unwrap(), None);
        assert_eq!(parse_date("date", Some("  ")).unwrap(), None);
    }

    #[test]
    fn dates_must_be_iso() {
        assert_eq!(
            parse_date("date", Some("2026-03-02")).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 2)
        );
        assert!(matches!(
            parse_date("date", Some("03/02/2026")),
            Err(ApiError::BadRequest("VALIDATION_ERROR", _))
        ));
    }
}
