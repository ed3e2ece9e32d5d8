//! REST routes.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use super::ApiError;
use crate::funnel::FunnelTracker;
use crate::inbound::InboundProcessor;
use crate::leads::{Channel, EventType, LeadId, NewLead};
use crate::sequence::SequenceScheduler;
use crate::store::Database;
use crate::supervisor::{ActionExecutor, ActivityStatus, Decision, Supervisor};

/// Shared state for all routes.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<dyn Database>,
    pub scheduler: Arc<SequenceScheduler>,
    pub supervisor: Arc<Supervisor>,
    pub executor: Arc<ActionExecutor>,
    pub inbound: Arc<InboundProcessor>,
    pub funnel: Arc<FunnelTracker>,
}

/// Build the router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/activities", get(list_activities))
        .route("/api/activities/{id}/approve", post(approve_activity))
        .route("/api/activities/{id}/reject", post(reject_activity))
        .route("/api/scheduler/run", post(run_scheduler))
        .route("/api/supervisor/run", post(run_supervisor))
        .route("/api/leads", post(create_lead))
        .route("/api/leads/{id}", get(get_lead))
        .route("/api/leads/{id}/replies", post(record_reply))
        .route("/api/leads/{id}/events", post(record_event))
        .route("/api/leads/{id}/lock", post(lock_stage))
        .route("/api/leads/{id}/unlock", post(unlock_stage))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}/complete", post(complete_task))
        .route("/t/open", get(track_open))
        .route("/t/click", get(track_click))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiResult<T> = Result<T, ApiError>;

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "outreach"
    }))
}

// ── Activities ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_activities(
    State(state): State<ApiState>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(|s| ActivityStatus::from_str(&s.to_uppercase()))
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let limit = query.limit.unwrap_or(50).min(500);
    let activities = state.db.list_activities(status, limit).await?;
    Ok(Json(activities))
}

async fn approve_activity(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let activity = state.executor.decide(id, Decision::Approve).await?;
    Ok(Json(activity))
}

async fn reject_activity(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let activity = state.executor.decide(id, Decision::Reject).await?;
    Ok(Json(activity))
}

// ── Triggers ────────────────────────────────────────────────────────────

async fn run_scheduler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.scheduler.run_pass().await)
}

async fn run_supervisor(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.supervisor.run_cycle().await)
}

// ── Leads ───────────────────────────────────────────────────────────────

async fn create_lead(
    State(state): State<ApiState>,
    Json(new_lead): Json<NewLead>,
) -> ApiResult<impl IntoResponse> {
    let lead = state.db.insert_lead(&new_lead).await?;
    Ok((StatusCode::CREATED, Json(lead)))
}

async fn get_lead(
    State(state): State<ApiState>,
    Path(id): Path<LeadId>,
) -> ApiResult<impl IntoResponse> {
    let lead = state
        .db
        .get_lead(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Lead {id} not found")))?;
    let history = state.db.list_stage_history(id).await?;
    let messages = state.db.list_messages(id).await?;
    Ok(Json(serde_json::json!({
        "lead": lead,
        "stage_history": history,
        "messages": messages,
    })))
}

#[derive(Debug, Deserialize)]
struct ReplyRequest {
    channel: Channel,
    text: String,
}

async fn record_reply(
    State(state): State<ApiState>,
    Path(id): Path<LeadId>,
    Json(req): Json<ReplyRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("Reply text is empty".into()));
    }
    let outcome = state.inbound.record_reply(id, req.channel, &req.text).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, Deserialize)]
struct EventRequest {
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(default)]
    metadata: serde_json::Value,
}

async fn record_event(
    State(state): State<ApiState>,
    Path(id): Path<LeadId>,
    Json(req): Json<EventRequest>,
) -> ApiResult<impl IntoResponse> {
    let event = state
        .inbound
        .record_event(id, req.event_type, req.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn lock_stage(
    State(state): State<ApiState>,
    Path(id): Path<LeadId>,
) -> ApiResult<impl IntoResponse> {
    set_lock(&state, id, true).await
}

async fn unlock_stage(
    State(state): State<ApiState>,
    Path(id): Path<LeadId>,
) -> ApiResult<impl IntoResponse> {
    set_lock(&state, id, false).await
}

async fn set_lock(state: &ApiState, id: LeadId, locked: bool) -> ApiResult<Json<crate::leads::Lead>> {
    state.funnel.set_locked(id, locked).await?;
    let lead = state
        .db
        .get_lead(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Lead {id} not found")))?;
    Ok(Json(lead))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn list_tasks(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.db.list_open_tasks().await?))
}

async fn complete_task(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.inbound.complete_task(id).await?;
    Ok(Json(task))
}

// ── Tracking ────────────────────────────────────────────────────────────

/// 1x1 transparent GIF.
const PIXEL: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

#[derive(Debug, Deserialize)]
struct TrackQuery {
    lead: Option<LeadId>,
    url: Option<String>,
}

/// Open pixel. Always answers with the image; recording is best effort.
async fn track_open(State(state): State<ApiState>, Query(query): Query<TrackQuery>) -> Response {
    if let Some(lead_id) = query.lead {
        if let Err(e) = state
            .inbound
            .record_event(lead_id, EventType::EmailOpen, serde_json::json!({}))
            .await
        {
            warn!(lead_id, error = %e, "Could not record email open");
        }
    }
    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        PIXEL,
    )
        .into_response()
}

/// Tracked link. Records the click and redirects to the original URL.
async fn track_click(
    State(state): State<ApiState>,
    Query(query): Query<TrackQuery>,
) -> ApiResult<Response> {
    let target = query
        .url
        .as_deref()
        .and_then(|raw| Url::parse(raw).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .ok_or_else(|| ApiError::BadRequest("Missing or invalid url".into()))?;

    if let Some(lead_id) = query.lead {
        let metadata = serde_json::json!({ "url": target.as_str() });
        if let Err(e) = state
            .inbound
            .record_event(lead_id, EventType::LinkClick, metadata)
            .await
        {
            warn!(lead_id, error = %e, "Could not record link click");
        }
    }
    Ok(Redirect::temporary(target.as_str()).into_response())
}
