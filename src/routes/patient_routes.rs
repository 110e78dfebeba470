// src/routes/patient_routes.rs

use axum::{
    extract::{Path, State},
    routing::{get, patch},
    Json, Router,
};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Appointment, NotificationRecord},
    routes::resolve_patient_id_by_user_id,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/patient/appointments", get(my_appointments))
        .route("/patient/notifications", get(my_notifications))
        .route("/patient/notifications/{notification_id}/read", patch(mark_notification_read))
}

async fn own_patient_id(state: &AppState, auth: &AuthContext) -> Result<Uuid, ApiError> {
    if !auth.is_patient() {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only patients have a personal appointment list".into(),
        ));
    }
    resolve_patient_id_by_user_id(state, auth.user_id).await
}

/* ============================================================
   GET /patient/appointments
   ============================================================ */

pub async fn my_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<Appointment>>>, ApiError> {
    let patient_id = own_patient_id(&state, &auth).await?;
    let rows = state.queue.patient_appointments(patient_id).await?;
    Ok(Json(ApiOk { data: rows }))
}

/* ============================================================
   GET /patient/notifications
   ============================================================ */

pub async fn my_notifications(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<NotificationRecord>>>, ApiError> {
    let patient_id = own_patient_id(&state, &auth).await?;
    let rows = state.queue.patient_notifications(patient_id).await?;
    Ok(Json(ApiOk { data: rows }))
}

/* ============================================================
   PATCH /patient/notifications/{id}/read
   ============================================================ */

pub async fn mark_notification_read(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(notification_id): Path<Uuid>,
) -> Result<Json<ApiOk<NotificationRecord>>, ApiError> {
    let patient_id = own_patient_id(&state, &auth).await?;
    let record = state
        .queue
        .mark_notification_read(patient_id, notification_id)
        .await?;
    Ok(Json(ApiOk { data: record }))
}
