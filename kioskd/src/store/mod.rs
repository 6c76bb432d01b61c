//! Persistence layer for cost breakdowns and kiosk heartbeats.
//!
//! Components receive an injected `Arc<dyn Store>` at construction time, so
//! each is independently testable against [`in_memory::InMemoryStore`] while
//! production wiring uses [`postgres::PgStore`]. Both persisted tables are
//! written through upsert-or-append operations keyed by a natural identity
//! (session id, gym id), so concurrent writers never need a lock beyond the
//! underlying storage's atomic upsert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::session::types::EndReason;

pub mod in_memory;
pub mod postgres;

/// Financial accounting unit: one row per ended session.
///
/// `total_cost` is always the recomputed sum of the four components.
/// `is_cost_real` starts false and is flipped to true exactly once by the
/// reconciliation job, never reverted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCostBreakdown {
    pub session_id: Uuid,
    pub gym_id: String,
    pub franchise_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: i64,
    pub text_input_tokens: i64,
    pub text_output_tokens: i64,
    pub audio_input_tokens: i64,
    pub audio_output_tokens: i64,
    pub text_input_cost: Decimal,
    pub text_output_cost: Decimal,
    pub audio_input_cost: Decimal,
    pub audio_output_cost: Decimal,
    pub total_cost: Decimal,
    pub user_satisfaction: Option<f64>,
    pub error_occurred: bool,
    pub end_reason: EndReason,
    pub is_cost_real: bool,
    pub real_cost_updated_at: Option<DateTime<Utc>>,
}

/// Liveness record, one upserted row per kiosk keyed by gym id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KioskHeartbeat {
    pub gym_id: String,
    pub kiosk_slug: String,
    pub last_heartbeat: DateTime<Utc>,
    pub status: String,
}

/// Tenant filters for cost queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostFilters {
    pub gym_id: Option<String>,
    pub franchise_id: Option<String>,
}

impl CostFilters {
    fn matches(&self, row: &SessionCostBreakdown) -> bool {
        if let Some(gym_id) = &self.gym_id {
            if &row.gym_id != gym_id {
                return false;
            }
        }
        if let Some(franchise_id) = &self.franchise_id {
            if row.franchise_id.as_ref() != Some(franchise_id) {
                return false;
            }
        }
        true
    }
}

/// One staged reconciliation update. All cost components are scaled by the
/// same ratio so `total_cost == sum(components)` keeps holding after the
/// batch is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledCost {
    pub session_id: Uuid,
    pub text_input_cost: Decimal,
    pub text_output_cost: Decimal,
    pub audio_input_cost: Decimal,
    pub audio_output_cost: Decimal,
    pub total_cost: Decimal,
}

/// Storage abstraction for the two persisted tables.
///
/// Implementations must make `apply_reconciled` atomic: the batch either
/// fully succeeds or leaves every row untouched.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a newly created cost breakdown.
    ///
    /// # Errors
    /// - `Persistence` if a breakdown with the same session id already exists
    ///   or the write fails
    async fn insert_breakdown(&self, breakdown: &SessionCostBreakdown) -> Result<()>;

    /// All breakdowns with `timestamp` in `[start, end]` matching the filters.
    async fn breakdowns_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filters: &CostFilters,
    ) -> Result<Vec<SessionCostBreakdown>>;

    /// Breakdowns in the window that have not been reconciled yet
    /// (`is_cost_real == false`).
    async fn unreconciled_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SessionCostBreakdown>>;

    /// Apply a reconciliation batch: overwrite the cost fields, set
    /// `is_cost_real = true` and `real_cost_updated_at = updated_at`.
    ///
    /// Atomic: every staged row must exist and still be unreconciled, or the
    /// whole batch fails without touching any row. Returns the number of rows
    /// updated.
    async fn apply_reconciled(&self, updates: &[ReconciledCost], updated_at: DateTime<Utc>) -> Result<u64>;

    /// Whether any unreconciled breakdown exists with `timestamp >= cutoff`.
    async fn has_unreconciled_since(&self, cutoff: DateTime<Utc>) -> Result<bool>;

    /// Upsert the liveness row for a kiosk, keyed by gym id.
    async fn upsert_heartbeat(&self, gym_id: &str, kiosk_slug: &str, now: DateTime<Utc>) -> Result<KioskHeartbeat>;

    /// All liveness rows with `last_heartbeat >= cutoff`.
    async fn heartbeats_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<KioskHeartbeat>>;
}
