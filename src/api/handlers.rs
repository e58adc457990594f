use std::convert::Infallible;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{NaiveDate, NaiveTime};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use ulid::Ulid;

use crate::analytics::StatsReport;
use crate::auth::CurrentActor;
use crate::engine::{Availability, Created, SlotScope, VenueGaps};
use crate::model::*;
use crate::notify::PromotionCandidate;
use crate::observability;
use crate::report::AvailableSlotsReport;
use crate::request::*;

use super::error::ApiError;
use super::extract::{JsonBody, PathParams, QueryParams};
use super::AppState;

type ApiResult<T> = Result<T, ApiError>;

// ── Query strings ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SeriesQuery {
    #[serde(default)]
    pub series: SeriesOption,
}

#[derive(Debug, Deserialize)]
pub struct VenueListQuery {
    pub branch_id: Option<Ulid>,
}

#[derive(Debug, Deserialize)]
pub struct CalendarQuery {
    pub venue_id: Ulid,
    pub date: NaiveDate,
}

/// A date plus an optional time window; the window defaults to business hours.
#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub venue_id: Option<Ulid>,
    pub branch_id: Option<Ulid>,
    pub date: NaiveDate,
    #[serde(default, with = "hhmm::option")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, with = "hhmm::option")]
    pub end_time: Option<NaiveTime>,
}

#[derive(Debug, Deserialize)]
pub struct SlotQuery {
    pub venue_id: Ulid,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub exclude: Option<Ulid>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinPlayerBody {
    #[serde(default)]
    pub user_id: Option<Ulid>,
}

#[derive(Debug, Serialize)]
pub struct ShareableReport {
    pub report: AvailableSlotsReport,
    pub share_text: String,
}

impl WindowQuery {
    fn window(&self, state: &AppState) -> ApiResult<TimeRange> {
        let business = state.engine.policy.business_window();
        let start = self.start_time.unwrap_or(business.start);
        let end = self.end_time.unwrap_or(business.end);
        validate_range(start, end)?;
        Ok(TimeRange::new(start, end))
    }
}

impl SlotQuery {
    fn slot(&self) -> ApiResult<Slot> {
        validate_range(self.start_time, self.end_time)?;
        Ok(Slot::new(self.date, self.start_time, self.end_time))
    }
}

// ── Health & registry ────────────────────────────────────

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn create_branch(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    JsonBody(req): JsonBody<CreateBranchRequest>,
) -> ApiResult<(StatusCode, Json<Branch>)> {
    let branch = state.engine.create_branch(req, &actor).await?;
    Ok((StatusCode::CREATED, Json(branch)))
}

pub async fn list_branches(State(state): State<AppState>, _actor: CurrentActor) -> Json<Vec<Branch>> {
    Json(state.engine.list_branches())
}

pub async fn create_venue(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    JsonBody(req): JsonBody<CreateVenueRequest>,
) -> ApiResult<(StatusCode, Json<Venue>)> {
    let venue = state.engine.create_venue(req, &actor).await?;
    Ok((StatusCode::CREATED, Json(venue)))
}

pub async fn list_venues(
    State(state): State<AppState>,
    _actor: CurrentActor,
    QueryParams(q): QueryParams<VenueListQuery>,
) -> Json<Vec<Venue>> {
    Json(state.engine.list_venues(q.branch_id).await)
}

// ── Bookings ─────────────────────────────────────────────

pub async fn create_booking(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    JsonBody(req): JsonBody<CreateBookingRequest>,
) -> ApiResult<(StatusCode, Json<Created>)> {
    let created = state.engine.create_booking(req, &actor).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_bookings(
    State(state): State<AppState>,
    _actor: CurrentActor,
    QueryParams(q): QueryParams<CalendarQuery>,
) -> ApiResult<Json<Vec<Booking>>> {
    Ok(Json(state.engine.list_bookings(q.venue_id, q.date).await?))
}

pub async fn get_booking(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    PathParams(id): PathParams<Ulid>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(state.engine.get_booking(id, &actor).await?))
}

pub async fn update_booking(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    PathParams(id): PathParams<Ulid>,
    QueryParams(q): QueryParams<SeriesQuery>,
    JsonBody(patch): JsonBody<BookingPatch>,
) -> ApiResult<Json<Vec<Booking>>> {
    Ok(Json(state.engine.update_booking(id, patch, &actor, q.series).await?))
}

pub async fn delete_booking(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    PathParams(id): PathParams<Ulid>,
    QueryParams(q): QueryParams<SeriesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = state.engine.delete_booking(id, &actor, q.series).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

pub async fn booking_logs(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    PathParams(id): PathParams<Ulid>,
) -> ApiResult<Json<Vec<BookingLog>>> {
    Ok(Json(state.engine.booking_logs(id, &actor).await?))
}

pub async fn check_conflict(
    State(state): State<AppState>,
    _actor: CurrentActor,
    QueryParams(q): QueryParams<SlotQuery>,
) -> ApiResult<Json<Availability>> {
    let slot = q.slot()?;
    Ok(Json(state.engine.check_conflict(q.venue_id, &slot, q.exclude).await?))
}

// ── Open matches ─────────────────────────────────────────

pub async fn convert_to_open_match(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    PathParams(id): PathParams<Ulid>,
    JsonBody(req): JsonBody<ConvertToOpenMatchRequest>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(state.engine.convert_to_open_match(id, req, &actor).await?))
}

pub async fn join_open_match(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    PathParams(id): PathParams<Ulid>,
    body: Option<JsonBody<JoinPlayerBody>>,
) -> ApiResult<Json<Booking>> {
    let user_id = body.and_then(|JsonBody(b)| b.user_id);
    Ok(Json(state.engine.join_open_match(id, user_id, &actor).await?))
}

pub async fn leave_open_match(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    PathParams((id, user_id)): PathParams<(Ulid, Ulid)>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(state.engine.leave_open_match(id, user_id, &actor).await?))
}

// ── Waitlist ─────────────────────────────────────────────

pub async fn join_waitlist(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    JsonBody(req): JsonBody<JoinWaitlistRequest>,
) -> ApiResult<(StatusCode, Json<WaitlistEntry>)> {
    let entry = state.engine.join_waitlist(req, &actor).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn leave_waitlist(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    PathParams(id): PathParams<Ulid>,
) -> ApiResult<Json<serde_json::Value>> {
    let removed = state.engine.leave_waitlist(id, &actor).await?;
    Ok(Json(json!({ "removed": removed.is_some() })))
}

pub async fn waitlist_for_slot(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    QueryParams(q): QueryParams<SlotQuery>,
) -> ApiResult<Json<Vec<PromotionCandidate>>> {
    let slot = q.slot()?;
    Ok(Json(state.engine.waitlist_for_slot(q.venue_id, &slot, &actor).await?))
}

// ── Availability & reporting ─────────────────────────────

pub async fn free_slots(
    State(state): State<AppState>,
    _actor: CurrentActor,
    QueryParams(q): QueryParams<WindowQuery>,
) -> ApiResult<Json<Vec<VenueGaps>>> {
    let window = q.window(&state)?;
    let scope = match (q.venue_id, q.branch_id) {
        (Some(_), Some(_)) => return Err(ApiError::bad_request("pass venue_id or branch_id, not both")),
        (Some(v), None) => SlotScope::Venue(v),
        (None, Some(b)) => SlotScope::Branch(b),
        (None, None) => SlotScope::All,
    };
    Ok(Json(state.engine.free_slots(scope, q.date, window).await?))
}

pub async fn dashboard(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    QueryParams(q): QueryParams<StatsQuery>,
) -> ApiResult<Json<StatsReport>> {
    Ok(Json(state.engine.dashboard_stats(q.start_date, q.end_date, &actor).await?))
}

async fn slots_report(state: &AppState, q: &WindowQuery) -> ApiResult<ShareableReport> {
    let window = q.window(state)?;
    let report = state.engine.available_slots_report(q.date, window, q.branch_id).await?;
    let share_text = report.share_text();
    Ok(ShareableReport { report, share_text })
}

pub async fn available_slots(
    State(state): State<AppState>,
    _actor: CurrentActor,
    QueryParams(q): QueryParams<WindowQuery>,
) -> ApiResult<Json<ShareableReport>> {
    Ok(Json(slots_report(&state, &q).await?))
}

/// Push the report text to the configured chat.
pub async fn share_available_slots(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    QueryParams(q): QueryParams<WindowQuery>,
) -> ApiResult<Response> {
    if !actor.is_admin() {
        return Err(ApiError(crate::engine::EngineError::Forbidden("admin role required")));
    }
    let Some(broadcast) = state.broadcast.clone() else {
        let body = json!({ "error": "unavailable", "message": "messaging is not configured" });
        return Ok((StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response());
    };
    let shareable = slots_report(&state, &q).await?;
    if let Err(e) = broadcast.sender.send(&broadcast.chat_id, &shareable.share_text).await {
        warn!("sharing available slots failed: {e}");
        let body = json!({ "error": "upstream", "message": e.to_string() });
        return Ok((StatusCode::BAD_GATEWAY, Json(body)).into_response());
    }
    info!(user_id = %actor.user_id, "available slots for {} shared", q.date);
    Ok(Json(json!({ "sent": true, "share_text": shareable.share_text })).into_response())
}

// ── Real-time events ─────────────────────────────────────

struct StreamGauge;

impl StreamGauge {
    fn open() -> Self {
        metrics::gauge!(observability::EVENT_STREAMS_ACTIVE).increment(1.0);
        StreamGauge
    }
}

impl Drop for StreamGauge {
    fn drop(&mut self) {
        metrics::gauge!(observability::EVENT_STREAMS_ACTIVE).decrement(1.0);
    }
}

/// Every booking event, as Server-Sent Events named by event type.
pub async fn events(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let gauge = StreamGauge::open();
    info!(user_id = %actor.user_id, "event stream opened");
    let stream = BroadcastStream::new(state.hub.subscribe()).filter_map(move |result| {
        let _open = &gauge;
        let event = match result {
            Ok(event) => SseEvent::default().event(event.name()).json_data(&event).ok(),
            Err(e) => {
                warn!("event stream lagging: {e}");
                None
            }
        };
        std::future::ready(event.map(Ok))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
