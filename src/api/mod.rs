//! JSON over HTTP. Every route except `/health` needs the gateway identity
//! headers; see [`crate::auth`].

mod error;
mod extract;
mod handlers;

pub use error::ApiError;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRef, MatchedPath, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::GatewayAuth;
use crate::engine::Engine;
use crate::notify::NotifyHub;
use crate::observability;
use crate::telegram::MessageSender;

/// Where shared reports go.
#[derive(Clone)]
pub struct Broadcast {
    pub sender: Arc<dyn MessageSender>,
    pub chat_id: String,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
    pub auth: Arc<GatewayAuth>,
    pub broadcast: Option<Broadcast>,
}

impl FromRef<AppState> for Arc<GatewayAuth> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        observability::HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        observability::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method,
        "path" => path
    )
    .record(started.elapsed().as_secs_f64());
    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/branches", post(handlers::create_branch).get(handlers::list_branches))
        .route("/venues", post(handlers::create_venue).get(handlers::list_venues))
        .route("/bookings", post(handlers::create_booking).get(handlers::list_bookings))
        .route("/bookings/conflicts", get(handlers::check_conflict))
        .route(
            "/bookings/:id",
            get(handlers::get_booking)
                .patch(handlers::update_booking)
                .delete(handlers::delete_booking),
        )
        .route("/bookings/:id/logs", get(handlers::booking_logs))
        .route("/bookings/:id/open-match", post(handlers::convert_to_open_match))
        .route("/bookings/:id/players", post(handlers::join_open_match))
        .route("/bookings/:id/players/:user_id", delete(handlers::leave_open_match))
        .route("/waitlist", post(handlers::join_waitlist).get(handlers::waitlist_for_slot))
        .route("/waitlist/:id", delete(handlers::leave_waitlist))
        .route("/free-slots", get(handlers::free_slots))
        .route("/stats/dashboard", get(handlers::dashboard))
        .route("/reports/available-slots", get(handlers::available_slots))
        .route("/reports/available-slots/share", post(handlers::share_available_slots))
        .route("/events", get(handlers::events))
        .route_layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
