//! Cost analytics endpoints.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDate;
use serde::Deserialize;

use crate::api::AppState;
use crate::error::{Error, Result};
use crate::ledger::{DailyCostSummary, RealTimeMetrics, RecordSessionCost};
use crate::store::{CostFilters, SessionCostBreakdown};

// POST /v1/costs/sessions
//
// Kiosks report their own session costs here when they run against a remote
// back office instead of an embedded ledger.
pub async fn record_session(
    State(state): State<AppState>,
    Json(body): Json<RecordSessionCost>,
) -> Result<(StatusCode, Json<SessionCostBreakdown>)> {
    if body.gym_id.trim().is_empty() {
        return Err(Error::validation("gym_id must not be empty"));
    }
    if body.duration_seconds < 0 {
        return Err(Error::validation("duration_seconds must not be negative"));
    }
    let breakdown = state.ledger.record_session_cost(body).await?;
    Ok((StatusCode::CREATED, Json(breakdown)))
}

#[derive(Debug, Deserialize)]
pub struct DailySummaryParams {
    /// `YYYY-MM-DD`.
    pub date: Option<NaiveDate>,
    pub gym_id: Option<String>,
    pub franchise_id: Option<String>,
}

// GET /v1/costs/daily
pub async fn daily_summary(
    State(state): State<AppState>,
    Query(params): Query<DailySummaryParams>,
) -> Result<Json<DailyCostSummary>> {
    let date = params.date.ok_or_else(|| Error::validation("date query parameter is required"))?;
    let filters = CostFilters {
        gym_id: params.gym_id,
        franchise_id: params.franchise_id,
    };
    Ok(Json(state.ledger.daily_cost_summary(date, &filters).await?))
}

#[derive(Debug, Deserialize)]
pub struct MetricsParams {
    pub gym_id: Option<String>,
    pub franchise_id: Option<String>,
}

// GET /v1/costs/metrics
pub async fn real_time_metrics(
    State(state): State<AppState>,
    Query(params): Query<MetricsParams>,
) -> Result<Json<RealTimeMetrics>> {
    let filters = CostFilters {
        gym_id: params.gym_id,
        franchise_id: params.franchise_id,
    };
    Ok(Json(state.ledger.real_time_metrics(&filters).await?))
}
