// src/routes/appointment_routes.rs

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Appointment, AppointmentStatus, OkData},
    queue::{AppointmentChanges, BookingRequest},
    routes::{ensure_can_view, parse_date, resolve_patient_id_by_user_id},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", post(create_appointment).get(list_appointments))
        .route(
            "/appointments/{appointment_id}",
            get(get_appointment).patch(patch_appointment).delete(delete_appointment),
        )
        .route("/appointments/{appointment_id}/assign-queue", post(assign_queue))
        .route("/appointments/{appointment_id}/complete", post(mark_completed))
        .route("/appointments/{appointment_id}/no-show", post(mark_no_show))
}

fn parse_status(raw: &str) -> Result<AppointmentStatus, ApiError> {
    AppointmentStatus::parse(raw).ok_or_else(|| {
        ApiError::BadRequest(
            "VALIDATION_ERROR",
            "status must be one of Pending, Confirmed, Completed, Canceled, No-show".into(),
        )
    })
}

/* ============================================================
   POST /appointments
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    /// Required for staff walk-ins; patients book for themselves.
    pub patient_id: Option<Uuid>,
    pub scheduled_date: NaiveDate,
}

pub async fn create_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateAppointmentRequest>,
) -> Result<(StatusCode, Json<ApiOk<Appointment>>), ApiError> {
    let booking = if auth.is_queue_staff() {
        let patient_id = req.patient_id.ok_or_else(|| {
            ApiError::BadRequest("VALIDATION_ERROR", "patient_id is required for walk-ins".into())
        })?;
        BookingRequest {
            patient_id,
            scheduled_date: req.scheduled_date,
            created_by: Some(auth.user_id),
        }
    } else if auth.is_patient() {
        let own = resolve_patient_id_by_user_id(&state, auth.user_id).await?;
        if req.patient_id.is_some_and(|p| p != own) {
            return Err(ApiError::Forbidden(
                "FORBIDDEN",
                "Patients can only book for themselves".into(),
            ));
        }
        BookingRequest {
            patient_id: own,
            scheduled_date: req.scheduled_date,
            created_by: None,
        }
    } else {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "You do not have permission to book appointments".into(),
        ));
    };

    let appointment = state.queue.book(booking).await?;
    Ok((StatusCode::CREATED, Json(ApiOk { data: appointment })))
}

/* ============================================================
   GET /appointments?date=&status=
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub date: Option<String>,
    pub status: Option<String>,
}

pub async fn list_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListQuery>,
) -> Result<Json<ApiOk<Vec<Appointment>>>, ApiError> {
    auth.ensure_queue_staff()?;

    let date = parse_date("date", q.date.as_deref())?.unwrap_or_else(|| state.queue.today());
    let status = q
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(parse_status)
        .transpose()?;

    let rows = state.queue.list(date, status).await?;
    Ok(Json(ApiOk { data: rows }))
}

/* ============================================================
   GET /appointments/{id}
   ============================================================ */

pub async fn get_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    let appointment = state.queue.get(appointment_id).await?;
    ensure_can_view(&state, &auth, &appointment).await?;
    Ok(Json(ApiOk { data: appointment }))
}

/* ============================================================
   PATCH /appointments/{id}  (reschedule and/or status)
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct PatchAppointmentRequest {
    pub scheduled_date: Option<NaiveDate>,
    pub status: Option<String>,
}

pub async fn patch_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<PatchAppointmentRequest>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.ensure_queue_staff()?;

    let changes = AppointmentChanges {
        scheduled_date: req.scheduled_date,
        status: req.status.as_deref().map(parse_status).transpose()?,
    };

    let updated = state
        .queue
        .update(appointment_id, changes, auth.audit_actor())
        .await?;
    Ok(Json(ApiOk { data: updated }))
}

/* ============================================================
   DELETE /appointments/{id}
   ============================================================ */

pub async fn delete_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    auth.ensure_queue_staff()?;
    state.queue.delete(appointment_id, auth.audit_actor()).await?;
    Ok(Json(ApiOk {
        data: OkData {
            ok: true,
            message: "Appointment deleted successfully".into(),
        },
    }))
}

/* ============================================================
   POST /appointments/{id}/assign-queue
   ============================================================ */

#[derive(Debug, serde::Serialize)]
pub struct AssignedDto {
    pub appointment_id: Uuid,
    pub queue_number: i32,
}

pub async fn assign_queue(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AssignedDto>>, ApiError> {
    auth.ensure_queue_staff()?;
    let queue_number = state.queue.assign_queue(appointment_id).await?;
    Ok(Json(ApiOk {
        data: AssignedDto {
            appointment_id,
            queue_number,
        },
    }))
}

/* ============================================================
   Status transitions
   ============================================================ */

pub async fn mark_completed(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.ensure_queue_staff()?;
    let updated = state
        .queue
        .complete(appointment_id, auth.audit_actor())
        .await?;
    Ok(Json(ApiOk { data: updated }))
}

pub async fn mark_no_show(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.ensure_queue_staff()?;
    let updated = state
        .queue
        .mark_no_show(appointment_id, auth.audit_actor())
        .await?;
    Ok(Json(ApiOk { data: updated }))
}
