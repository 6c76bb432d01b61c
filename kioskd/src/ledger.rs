//! Usage ledger: records per-session cost breakdowns and aggregates them
//! into daily summaries and day-over-day metrics, filterable by tenant.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::pricing::{calculate_session_cost, PricingTable, SessionUsage};
use crate::session::types::EndReason;
use crate::store::{CostFilters, SessionCostBreakdown, Store};

/// Input for recording a session's cost when it ends (or synthetically, for
/// testing). Costs are always recomputed here, never supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSessionCost {
    pub session_id: Uuid,
    pub gym_id: String,
    #[serde(default)]
    pub franchise_id: Option<String>,
    /// Defaults to now when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: i64,
    #[serde(default)]
    pub text_input_tokens: i64,
    #[serde(default)]
    pub text_output_tokens: i64,
    #[serde(default)]
    pub audio_input_seconds: f64,
    #[serde(default)]
    pub audio_output_seconds: f64,
    #[serde(default)]
    pub user_satisfaction: Option<f64>,
    #[serde(default)]
    pub error_occurred: bool,
    pub end_reason: EndReason,
}

/// Derived aggregate over one UTC day, computed on demand. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCostSummary {
    pub date: NaiveDate,
    pub gym_id: Option<String>,
    pub franchise_id: Option<String>,
    pub total_sessions: i64,
    pub total_duration_seconds: i64,
    pub text_input_tokens: i64,
    pub text_output_tokens: i64,
    pub audio_input_tokens: i64,
    pub audio_output_tokens: i64,
    pub total_cost_usd: Decimal,
    pub average_session_cost: Decimal,
    pub average_satisfaction: f64,
    /// Hour of day (0-23) with the most sessions; ties break to the lowest hour.
    pub peak_hour: u32,
    pub success_rate_percent: f64,
}

impl DailyCostSummary {
    /// Well-formed all-zero summary carrying the requested date and filters.
    /// Callers rely on this instead of a null/absent value.
    fn empty(date: NaiveDate, filters: &CostFilters) -> Self {
        DailyCostSummary {
            date,
            gym_id: filters.gym_id.clone(),
            franchise_id: filters.franchise_id.clone(),
            total_sessions: 0,
            total_duration_seconds: 0,
            text_input_tokens: 0,
            text_output_tokens: 0,
            audio_input_tokens: 0,
            audio_output_tokens: 0,
            total_cost_usd: Decimal::ZERO,
            average_session_cost: Decimal::ZERO,
            average_satisfaction: 0.0,
            peak_hour: 0,
            success_rate_percent: 0.0,
        }
    }
}

/// Day-over-day percentage deltas. A zero prior-day denominator yields a
/// delta of 0 rather than infinity or NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricChanges {
    pub sessions_percent: f64,
    pub cost_percent: f64,
    pub duration_percent: f64,
    pub satisfaction_percent: f64,
}

/// Today's and yesterday's summaries plus their deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealTimeMetrics {
    pub today: DailyCostSummary,
    pub yesterday: DailyCostSummary,
    pub changes: MetricChanges,
}

/// Persistence-facing accessor for session cost accounting.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    pricing: PricingTable,
}

fn percent_change(today: f64, yesterday: f64) -> f64 {
    if yesterday == 0.0 {
        0.0
    } else {
        (today - yesterday) / yesterday * 100.0
    }
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, pricing: PricingTable) -> Self {
        Self { store, pricing }
    }

    /// Compute costs for the given telemetry, build the full breakdown and
    /// persist it. A failed write surfaces to the caller; it is not retried
    /// silently.
    #[instrument(skip(self, request), fields(session_id = %request.session_id, gym_id = %request.gym_id), err)]
    pub async fn record_session_cost(&self, request: RecordSessionCost) -> Result<SessionCostBreakdown> {
        let usage = SessionUsage {
            duration_seconds: request.duration_seconds,
            text_input_tokens: request.text_input_tokens,
            text_output_tokens: request.text_output_tokens,
            audio_input_seconds: request.audio_input_seconds,
            audio_output_seconds: request.audio_output_seconds,
        };
        let costs = calculate_session_cost(&self.pricing, &usage);

        let breakdown = SessionCostBreakdown {
            session_id: request.session_id,
            gym_id: request.gym_id,
            franchise_id: request.franchise_id,
            timestamp: request.timestamp.unwrap_or_else(Utc::now),
            duration_seconds: request.duration_seconds.max(0),
            text_input_tokens: costs.text_input_tokens,
            text_output_tokens: costs.text_output_tokens,
            audio_input_tokens: costs.audio_input_tokens,
            audio_output_tokens: costs.audio_output_tokens,
            text_input_cost: costs.text_input_cost,
            text_output_cost: costs.text_output_cost,
            audio_input_cost: costs.audio_input_cost,
            audio_output_cost: costs.audio_output_cost,
            total_cost: costs.total_cost,
            user_satisfaction: request.user_satisfaction,
            error_occurred: request.error_occurred,
            end_reason: request.end_reason,
            is_cost_real: false,
            real_cost_updated_at: None,
        };

        self.store.insert_breakdown(&breakdown).await?;
        Ok(breakdown)
    }

    /// Aggregate all breakdowns recorded on the given UTC day.
    #[instrument(skip(self), err)]
    pub async fn daily_cost_summary(&self, date: NaiveDate, filters: &CostFilters) -> Result<DailyCostSummary> {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        let end = start + Duration::seconds(86_399);

        let rows = self.store.breakdowns_in_window(start, end, filters).await?;
        if rows.is_empty() {
            return Ok(DailyCostSummary::empty(date, filters));
        }

        let total_sessions = rows.len() as i64;
        let total_duration_seconds: i64 = rows.iter().map(|r| r.duration_seconds).sum();
        let text_input_tokens: i64 = rows.iter().map(|r| r.text_input_tokens).sum();
        let text_output_tokens: i64 = rows.iter().map(|r| r.text_output_tokens).sum();
        let audio_input_tokens: i64 = rows.iter().map(|r| r.audio_input_tokens).sum();
        let audio_output_tokens: i64 = rows.iter().map(|r| r.audio_output_tokens).sum();
        let total_cost_usd: Decimal = rows.iter().map(|r| r.total_cost).sum();
        let average_session_cost = total_cost_usd / Decimal::from(total_sessions);

        let rated: Vec<f64> = rows.iter().filter_map(|r| r.user_satisfaction).collect();
        let average_satisfaction = if rated.is_empty() {
            0.0
        } else {
            rated.iter().sum::<f64>() / rated.len() as f64
        };

        // Bucket by hour of day; a left-to-right max scan makes ties break to
        // the lowest hour.
        let mut hour_counts = [0i64; 24];
        for row in &rows {
            hour_counts[row.timestamp.hour() as usize] += 1;
        }
        let mut peak_hour = 0u32;
        let mut peak_count = hour_counts[0];
        for (hour, count) in hour_counts.iter().enumerate().skip(1) {
            if *count > peak_count {
                peak_count = *count;
                peak_hour = hour as u32;
            }
        }

        let successful = rows.iter().filter(|r| !r.error_occurred).count();
        let success_rate_percent = successful as f64 / total_sessions as f64 * 100.0;

        Ok(DailyCostSummary {
            date,
            gym_id: filters.gym_id.clone(),
            franchise_id: filters.franchise_id.clone(),
            total_sessions,
            total_duration_seconds,
            text_input_tokens,
            text_output_tokens,
            audio_input_tokens,
            audio_output_tokens,
            total_cost_usd,
            average_session_cost,
            average_satisfaction,
            peak_hour,
            success_rate_percent,
        })
    }

    /// Today's and yesterday's summaries with day-over-day percentage deltas.
    #[instrument(skip(self), err)]
    pub async fn real_time_metrics(&self, filters: &CostFilters) -> Result<RealTimeMetrics> {
        let today_date = Utc::now().date_naive();
        let yesterday_date = today_date - Duration::days(1);

        let today = self.daily_cost_summary(today_date, filters).await?;
        let yesterday = self.daily_cost_summary(yesterday_date, filters).await?;

        let changes = MetricChanges {
            sessions_percent: percent_change(today.total_sessions as f64, yesterday.total_sessions as f64),
            cost_percent: percent_change(
                today.total_cost_usd.to_f64().unwrap_or(0.0),
                yesterday.total_cost_usd.to_f64().unwrap_or(0.0),
            ),
            duration_percent: percent_change(
                today.total_duration_seconds as f64,
                yesterday.total_duration_seconds as f64,
            ),
            satisfaction_percent: percent_change(today.average_satisfaction, yesterday.average_satisfaction),
        };

        Ok(RealTimeMetrics { today, yesterday, changes })
    }
}

#[cfg(test)]
mod tests {
    use crate::store::in_memory::InMemoryStore;

    use super::*;

    fn ledger() -> (Ledger, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (Ledger::new(store.clone(), PricingTable::default()), store)
    }

    fn request_at(timestamp: DateTime<Utc>) -> RecordSessionCost {
        RecordSessionCost {
            session_id: Uuid::new_v4(),
            gym_id: "gym-paris-11".to_string(),
            franchise_id: None,
            timestamp: Some(timestamp),
            duration_seconds: 180,
            text_input_tokens: 500,
            text_output_tokens: 900,
            audio_input_seconds: 60.0,
            audio_output_seconds: 45.0,
            user_satisfaction: Some(4.0),
            error_occurred: false,
            end_reason: EndReason::Natural,
        }
    }

    #[tokio::test]
    async fn record_session_cost_recomputes_totals() {
        let (ledger, _) = ledger();

        let breakdown = ledger.record_session_cost(request_at(Utc::now())).await.unwrap();

        assert_eq!(
            breakdown.total_cost,
            breakdown.text_input_cost + breakdown.text_output_cost + breakdown.audio_input_cost + breakdown.audio_output_cost
        );
        assert!(!breakdown.is_cost_real);
        assert!(breakdown.real_cost_updated_at.is_none());
        assert_eq!(breakdown.audio_input_tokens, 1667);
    }

    #[tokio::test]
    async fn empty_day_yields_all_zero_summary() {
        let (ledger, _) = ledger();
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let filters = CostFilters {
            gym_id: Some("gym-paris-11".to_string()),
            franchise_id: None,
        };

        let summary = ledger.daily_cost_summary(date, &filters).await.unwrap();

        assert_eq!(summary.date, date);
        assert_eq!(summary.gym_id.as_deref(), Some("gym-paris-11"));
        assert_eq!(summary.total_sessions, 0);
        assert_eq!(summary.total_cost_usd, Decimal::ZERO);
        assert_eq!(summary.average_session_cost, Decimal::ZERO);
        assert_eq!(summary.peak_hour, 0);
        assert_eq!(summary.success_rate_percent, 0.0);
    }

    #[tokio::test]
    async fn daily_summary_aggregates_and_finds_peak_hour() {
        let (ledger, _) = ledger();
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let at = |h: u32| date.and_hms_opt(h, 30, 0).unwrap().and_utc();

        // Two sessions at 18h, one at 9h, one failed session at 18h.
        ledger.record_session_cost(request_at(at(9))).await.unwrap();
        ledger.record_session_cost(request_at(at(18))).await.unwrap();
        ledger.record_session_cost(request_at(at(18))).await.unwrap();
        let mut failed = request_at(at(18));
        failed.error_occurred = true;
        failed.end_reason = EndReason::Error;
        failed.user_satisfaction = None;
        ledger.record_session_cost(failed).await.unwrap();

        let summary = ledger.daily_cost_summary(date, &CostFilters::default()).await.unwrap();

        assert_eq!(summary.total_sessions, 4);
        assert_eq!(summary.peak_hour, 18);
        assert_eq!(summary.success_rate_percent, 75.0);
        assert_eq!(summary.average_satisfaction, 4.0);
        assert_eq!(summary.average_session_cost, summary.total_cost_usd / Decimal::from(4));
    }

    #[tokio::test]
    async fn peak_hour_ties_break_to_lowest_hour() {
        let (ledger, _) = ledger();
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let at = |h: u32| date.and_hms_opt(h, 0, 0).unwrap().and_utc();

        ledger.record_session_cost(request_at(at(20))).await.unwrap();
        ledger.record_session_cost(request_at(at(7))).await.unwrap();

        let summary = ledger.daily_cost_summary(date, &CostFilters::default()).await.unwrap();
        assert_eq!(summary.peak_hour, 7);
    }

    #[tokio::test]
    async fn change_percentages_guard_against_zero_denominator() {
        let (ledger, _) = ledger();

        // Sessions today, nothing yesterday.
        ledger.record_session_cost(request_at(Utc::now())).await.unwrap();
        ledger.record_session_cost(request_at(Utc::now())).await.unwrap();

        let metrics = ledger.real_time_metrics(&CostFilters::default()).await.unwrap();

        assert_eq!(metrics.today.total_sessions, 2);
        assert_eq!(metrics.yesterday.total_sessions, 0);
        assert_eq!(metrics.changes.sessions_percent, 0.0);
        assert_eq!(metrics.changes.cost_percent, 0.0);
        assert_eq!(metrics.changes.duration_percent, 0.0);
        assert_eq!(metrics.changes.satisfaction_percent, 0.0);
    }

    #[tokio::test]
    async fn change_percentages_compare_against_yesterday() {
        let (ledger, _) = ledger();
        let yesterday = Utc::now() - Duration::days(1);

        ledger.record_session_cost(request_at(yesterday)).await.unwrap();
        ledger.record_session_cost(request_at(Utc::now())).await.unwrap();
        ledger.record_session_cost(request_at(Utc::now())).await.unwrap();

        let metrics = ledger.real_time_metrics(&CostFilters::default()).await.unwrap();
        assert_eq!(metrics.changes.sessions_percent, 100.0);
    }
}
