//! Real-cost reconciliation: periodically replaces estimated per-session
//! costs with values consistent with the provider's authoritative billing
//! totals, via proportional redistribution.
//!
//! Providers bill in aggregate, not per session. Scaling every estimated
//! cost by the same ratio preserves relative attribution (a session
//! estimated at twice the cost of another stays at twice after the pass)
//! while making the totals match ground truth exactly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::store::{ReconciledCost, Store};

pub mod billing;

pub use billing::{BillingClient, DailyProviderCost, HttpBillingClient, ProviderUsage};

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub provider_total: Decimal,
    pub estimated_total: Decimal,
    pub sessions_updated: u64,
    /// Set when the run succeeded without writing anything, with the reason.
    pub skipped: Option<String>,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    billing: Arc<dyn BillingClient>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, billing: Arc<dyn BillingClient>) -> Self {
        Self { store, billing }
    }

    /// Whether any unreconciled breakdown exists in roughly the last 24 hours.
    /// Used to decide whether to attempt a reconciliation pass at all.
    pub async fn needs_sync(&self) -> Result<bool> {
        self.store.has_unreconciled_since(Utc::now() - Duration::hours(24)).await
    }

    /// Reconcile every unreconciled breakdown in `[start, end]` against the
    /// provider's total for that window.
    ///
    /// All-or-nothing: a failed billing fetch aborts the run before anything
    /// is staged, and a failed batch update fails the whole run with zero
    /// sessions updated.
    #[instrument(skip(self), err)]
    pub async fn reconcile_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<ReconcileReport> {
        let usage = self
            .billing
            .fetch_provider_usage(start.date_naive(), end.date_naive())
            .await?;

        let rows = self.store.unreconciled_in_window(start, end).await?;

        if rows.is_empty() {
            tracing::debug!("no unreconciled sessions in window, nothing to do");
            return Ok(ReconcileReport {
                window_start: start,
                window_end: end,
                provider_total: usage.total_usage,
                estimated_total: Decimal::ZERO,
                sessions_updated: 0,
                skipped: Some("no unreconciled sessions in window".to_string()),
            });
        }

        let estimated_total: Decimal = rows.iter().map(|r| r.total_cost).sum();
        if estimated_total.is_zero() {
            // Dividing here would corrupt every row; skip the batch instead.
            tracing::warn!(
                sessions = rows.len(),
                "estimated total is zero, skipping redistribution"
            );
            return Ok(ReconcileReport {
                window_start: start,
                window_end: end,
                provider_total: usage.total_usage,
                estimated_total,
                sessions_updated: 0,
                skipped: Some("estimated total is zero; nothing to redistribute".to_string()),
            });
        }

        let ratio = usage.total_usage / estimated_total;
        let updates: Vec<ReconciledCost> = rows
            .iter()
            .map(|row| ReconciledCost {
                session_id: row.session_id,
                text_input_cost: row.text_input_cost * ratio,
                text_output_cost: row.text_output_cost * ratio,
                audio_input_cost: row.audio_input_cost * ratio,
                audio_output_cost: row.audio_output_cost * ratio,
                total_cost: row.total_cost * ratio,
            })
            .collect();

        let sessions_updated = self
            .store
            .apply_reconciled(&updates, Utc::now())
            .await
            .map_err(|e| Error::reconciliation(format!("batch update failed, zero sessions updated: {e}")))?;

        tracing::info!(
            sessions_updated,
            provider_total = %usage.total_usage,
            estimated_total = %estimated_total,
            "reconciled session costs against provider billing"
        );

        Ok(ReconcileReport {
            window_start: start,
            window_end: end,
            provider_total: usage.total_usage,
            estimated_total,
            sessions_updated,
            skipped: None,
        })
    }

    /// Run the reconciliation daemon: on each tick, if any recent breakdown
    /// is still unreconciled, reconcile the trailing 24 hour window. Errors
    /// are logged and the loop continues.
    pub async fn run_daemon(self, period: std::time::Duration) {
        tracing::info!(period_secs = period.as_secs(), "starting reconciliation daemon");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            match self.needs_sync().await {
                Ok(false) => {
                    tracing::debug!("no recent unreconciled sessions, skipping pass");
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    tracing::error!(error = %e, "failed to check reconciliation backlog");
                    continue;
                }
            }

            let end = Utc::now();
            let start = end - Duration::hours(24);
            match self.reconcile_window(start, end).await {
                Ok(report) => {
                    if let Some(reason) = &report.skipped {
                        tracing::debug!(reason = %reason, "reconciliation pass skipped");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "reconciliation pass failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use uuid::Uuid;

    use crate::error::Error;
    use crate::ledger::{Ledger, RecordSessionCost};
    use crate::pricing::PricingTable;
    use crate::session::types::EndReason;
    use crate::store::in_memory::InMemoryStore;
    use crate::store::CostFilters;

    use super::*;

    struct FixedBilling {
        total: Decimal,
    }

    #[async_trait]
    impl BillingClient for FixedBilling {
        async fn fetch_provider_usage(&self, _start: NaiveDate, _end: NaiveDate) -> crate::error::Result<ProviderUsage> {
            Ok(ProviderUsage {
                total_usage: self.total,
                daily_costs: Vec::new(),
            })
        }
    }

    struct FailingBilling;

    #[async_trait]
    impl BillingClient for FailingBilling {
        async fn fetch_provider_usage(&self, _start: NaiveDate, _end: NaiveDate) -> crate::error::Result<ProviderUsage> {
            Err(Error::reconciliation("provider unreachable"))
        }
    }

    async fn seed_session(ledger: &Ledger, text_output_tokens: i64) -> Uuid {
        let session_id = Uuid::new_v4();
        ledger
            .record_session_cost(RecordSessionCost {
                session_id,
                gym_id: "gym-paris-11".to_string(),
                franchise_id: None,
                timestamp: Some(Utc::now() - Duration::hours(1)),
                duration_seconds: 120,
                text_input_tokens: 0,
                text_output_tokens,
                audio_input_seconds: 0.0,
                audio_output_seconds: 0.0,
                user_satisfaction: None,
                error_occurred: false,
                end_reason: EndReason::Natural,
            })
            .await
            .unwrap();
        session_id
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let end = Utc::now();
        (end - Duration::hours(24), end)
    }

    #[tokio::test]
    async fn redistribution_conserves_provider_total_and_proportions() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Ledger::new(store.clone(), PricingTable::default());

        // Second session estimated at twice the cost of the first.
        let small = seed_session(&ledger, 1000).await;
        let large = seed_session(&ledger, 2000).await;

        let provider_total = Decimal::new(9, 2); // $0.09
        let reconciler = Reconciler::new(store.clone(), Arc::new(FixedBilling { total: provider_total }));

        let (start, end) = window();
        let report = reconciler.reconcile_window(start, end).await.unwrap();
        assert_eq!(report.sessions_updated, 2);
        assert_eq!(report.skipped, None);

        let rows = store.breakdowns_in_window(start, end, &CostFilters::default()).await.unwrap();
        let real_total: Decimal = rows.iter().map(|r| r.total_cost).sum();
        assert_eq!(real_total, provider_total);

        let small_row = rows.iter().find(|r| r.session_id == small).unwrap();
        let large_row = rows.iter().find(|r| r.session_id == large).unwrap();
        assert_eq!(large_row.total_cost, small_row.total_cost * Decimal::from(2));
        assert!(rows.iter().all(|r| r.is_cost_real && r.real_cost_updated_at.is_some()));
        assert!(rows.iter().all(|r| {
            r.total_cost
                == r.text_input_cost + r.text_output_cost + r.audio_input_cost + r.audio_output_cost
        }));
    }

    #[tokio::test]
    async fn empty_window_succeeds_and_updates_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = Reconciler::new(store, Arc::new(FixedBilling { total: Decimal::ONE }));

        let (start, end) = window();
        let report = reconciler.reconcile_window(start, end).await.unwrap();

        assert_eq!(report.sessions_updated, 0);
        assert!(report.skipped.is_some());
    }

    #[tokio::test]
    async fn zero_estimated_total_skips_instead_of_dividing() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Ledger::new(store.clone(), PricingTable::default());

        // A session with no usage: estimated cost is exactly zero.
        seed_session(&ledger, 0).await;

        let reconciler = Reconciler::new(store.clone(), Arc::new(FixedBilling { total: Decimal::ONE }));
        let (start, end) = window();
        let report = reconciler.reconcile_window(start, end).await.unwrap();

        assert_eq!(report.sessions_updated, 0);
        assert_eq!(report.estimated_total, Decimal::ZERO);
        assert!(report.skipped.is_some());

        // Nothing was marked reconciled.
        let rows = store.unreconciled_in_window(start, end).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn billing_fetch_failure_aborts_without_writes() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Ledger::new(store.clone(), PricingTable::default());
        seed_session(&ledger, 1000).await;

        let reconciler = Reconciler::new(store.clone(), Arc::new(FailingBilling));
        let (start, end) = window();
        let err = reconciler.reconcile_window(start, end).await.unwrap_err();
        assert!(matches!(err, Error::Reconciliation { .. }));

        let rows = store.unreconciled_in_window(start, end).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn needs_sync_reflects_recent_backlog() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Ledger::new(store.clone(), PricingTable::default());
        let reconciler = Reconciler::new(store.clone(), Arc::new(FixedBilling { total: Decimal::ONE }));

        assert!(!reconciler.needs_sync().await.unwrap());

        seed_session(&ledger, 1000).await;
        assert!(reconciler.needs_sync().await.unwrap());

        let (start, end) = window();
        reconciler.reconcile_window(start, end).await.unwrap();
        assert!(!reconciler.needs_sync().await.unwrap());
    }
}
