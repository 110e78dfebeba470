// src/routes/queue_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Appointment, CalledAppointment, OkData, QueuePosition, QueueStats, ReorderItem},
    routes::{ensure_can_view, parse_date},
};

const DEFAULT_NOTIFY_WINDOW: usize = 3;
const DEFAULT_HISTORY_DAYS: i64 = 7;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/queue/today", get(today_queue))
        .route("/queue/next", get(next_in_queue))
        .route("/queue/call-next", post(call_next))
        .route("/queue/position/{appointment_id}", get(queue_position))
        .route("/queue/reorder", put(reorder_queue))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/history", get(queue_history))
        .route("/queue/notify-upcoming", post(notify_upcoming))
}

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    pub date: Option<String>,
}

/* ============================================================
   GET /queue/today?date=
   ============================================================ */

pub async fn today_queue(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<DateQuery>,
) -> Result<Json<ApiOk<Vec<Appointment>>>, ApiError> {
    auth.ensure_queue_staff()?;
    let date = parse_date("date", q.date.as_deref())?;
    let rows = state.queue.active_queue(date).await?;
    Ok(Json(ApiOk { data: rows }))
}

/* ============================================================
   GET /queue/next?date=
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct NextDto {
    pub next: Option<Appointment>,
    pub message: String,
}

pub async fn next_in_queue(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<DateQuery>,
) -> Result<Json<ApiOk<NextDto>>, ApiError> {
    auth.ensure_queue_staff()?;
    let date = parse_date("date", q.date.as_deref())?;
    let next = state.queue.next_in_queue(date).await?;

    let message = match &next {
        Some(a) => format!("Next in line: queue #{}", a.queue_number.unwrap_or_default()),
        None => "No patients in queue".to_string(),
    };
    Ok(Json(ApiOk {
        data: NextDto { next, message },
    }))
}

/* ============================================================
   POST /queue/call-next?date=
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct CallNextDto {
    pub called: Option<CalledAppointment>,
    pub message: String,
}

pub async fn call_next(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<DateQuery>,
) -> Result<Json<ApiOk<CallNextDto>>, ApiError> {
    auth.ensure_queue_staff()?;
    let date = parse_date("date", q.date.as_deref())?;
    let called = state.queue.call_next(date, auth.audit_actor()).await?;

    let message = match &called {
        Some(c) if c.notified => format!(
            "Called queue #{}; patient notified",
            c.appointment.queue_number.unwrap_or_default()
        ),
        Some(c) => format!(
            "Called queue #{}; notification pending",
            c.appointment.queue_number.unwrap_or_default()
        ),
        None => "No patients in queue".to_string(),
    };
    Ok(Json(ApiOk {
        data: CallNextDto { called, message },
    }))
}

/* ============================================================
   GET /queue/position/{appointment_id}
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct PositionDto {
    #[serde(flatten)]
    pub position: QueuePosition,
    pub estimated_wait_minutes: i64,
}

pub async fn queue_position(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<PositionDto>>, ApiError> {
    if !auth.is_queue_staff() {
        let appointment = state.queue.get(appointment_id).await?;
        ensure_can_view(&state, &auth, &appointment).await?;
    }

    let position = state.queue.queue_position(appointment_id).await?;
    let estimated_wait_minutes = position.people_ahead.saturating_mul(state.queue_slot_minutes);
    Ok(Json(ApiOk {
        data: PositionDto {
            position,
            estimated_wait_minutes,
        },
    }))
}

/* ============================================================
   PUT /queue/reorder
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub date: NaiveDate,
    pub appointments: Vec<ReorderItem>,
}

pub async fn reorder_queue(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ReorderRequest>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    auth.ensure_queue_staff()?;
    state
        .queue
        .reorder(req.date, &req.appointments, auth.audit_actor())
        .await?;
    Ok(Json(ApiOk {
        data: OkData {
            ok: true,
            message: format!("Queue reordered for {}", req.date),
        },
    }))
}

/* ============================================================
   GET /queue/stats?date=
   ============================================================ */

pub async fn queue_stats(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<DateQuery>,
) -> Result<Json<ApiOk<QueueStats>>, ApiError> {
    auth.ensure_queue_staff()?;
    let date = parse_date("date", q.date.as_deref())?;
    let stats = state.queue.queue_stats(date).await?;
    Ok(Json(ApiOk { data: stats }))
}

/* ============================================================
   GET /queue/history?start_date=&end_date=
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

pub async fn queue_history(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<ApiOk<Vec<Appointment>>>, ApiError> {
    auth.ensure_queue_staff()?;

    let end = parse_date("end_date", q.end_date.as_deref())?.unwrap_or_else(|| state.queue.today());
    let start = parse_date("start_date", q.start_date.as_deref())?
        .unwrap_or(end - Duration::days(DEFAULT_HISTORY_DAYS));

    let rows = state.queue.history(start, end).await?;
    Ok(Json(ApiOk { data: rows }))
}

/* ============================================================
   POST /queue/notify-upcoming?date=&window=
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct NotifyQuery {
    pub date: Option<String>,
    pub window: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct NotifiedDto {
    pub delivered: usize,
}

pub async fn notify_upcoming(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<NotifyQuery>,
) -> Result<Json<ApiOk<NotifiedDto>>, ApiError> {
    auth.ensure_queue_staff()?;
    let date = parse_date("date", q.date.as_deref())?;
    let window = q.window.unwrap_or(DEFAULT_NOTIFY_WINDOW);
    let delivered = state.queue.notify_upcoming(date, window).await?;
    Ok(Json(ApiOk {
        data: NotifiedDto { delivered },
    }))
}
