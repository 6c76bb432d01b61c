//! HTTP surface for the back office: cost analytics and kiosk liveness.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::heartbeat::HeartbeatService;
use crate::ledger::Ledger;

pub mod handlers;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub heartbeats: HeartbeatService,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/heartbeat", post(handlers::heartbeats::announce))
        .route("/v1/heartbeats", get(handlers::heartbeats::list_online))
        .route("/v1/costs/sessions", post(handlers::costs::record_session))
        .route("/v1/costs/daily", get(handlers::costs::daily_summary))
        .route("/v1/costs/metrics", get(handlers::costs::real_time_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
