//! Kiosk liveness endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::AppState;
use crate::error::{Error, Result};
use crate::heartbeat::OnlineKiosks;
use crate::store::KioskHeartbeat;

#[derive(Debug, Deserialize)]
pub struct AnnounceRequest {
    pub gym_id: String,
    pub kiosk_slug: String,
}

// POST /v1/heartbeat
pub async fn announce(State(state): State<AppState>, Json(body): Json<AnnounceRequest>) -> Result<Json<KioskHeartbeat>> {
    if body.gym_id.trim().is_empty() {
        return Err(Error::validation("gym_id must not be empty"));
    }
    let row = state.heartbeats.announce(&body.gym_id, &body.kiosk_slug).await?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct ListOnlineParams {
    pub freshness_seconds: Option<i64>,
}

// GET /v1/heartbeats
pub async fn list_online(
    State(state): State<AppState>,
    Query(params): Query<ListOnlineParams>,
) -> Result<Json<OnlineKiosks>> {
    Ok(Json(state.heartbeats.list_online(params.freshness_seconds).await?))
}
