//! In-memory store implementation.
//!
//! Stores everything in process memory behind `RwLock`s. Suitable for tests
//! and single-process deployments; contents are lost on restart.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{CostFilters, KioskHeartbeat, ReconciledCost, SessionCostBreakdown, Store};

/// In-memory implementation of the [`Store`] trait.
#[derive(Default)]
pub struct InMemoryStore {
    breakdowns: RwLock<HashMap<Uuid, SessionCostBreakdown>>,
    heartbeats: RwLock<HashMap<String, KioskHeartbeat>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_breakdowns(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Uuid, SessionCostBreakdown>>> {
        self.breakdowns
            .write()
            .map_err(|_| Error::persistence(anyhow::anyhow!("breakdown store lock poisoned")))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_breakdown(&self, breakdown: &SessionCostBreakdown) -> Result<()> {
        let mut breakdowns = self.lock_breakdowns()?;
        if breakdowns.contains_key(&breakdown.session_id) {
            return Err(Error::persistence(anyhow::anyhow!(
                "breakdown for session {} already exists",
                breakdown.session_id
            )));
        }
        breakdowns.insert(breakdown.session_id, breakdown.clone());
        Ok(())
    }

    async fn breakdowns_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filters: &CostFilters,
    ) -> Result<Vec<SessionCostBreakdown>> {
        let breakdowns = self
            .breakdowns
            .read()
            .map_err(|_| Error::persistence(anyhow::anyhow!("breakdown store lock poisoned")))?;

        let mut rows: Vec<SessionCostBreakdown> = breakdowns
            .values()
            .filter(|row| row.timestamp >= start && row.timestamp <= end && filters.matches(row))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.timestamp);
        Ok(rows)
    }

    async fn unreconciled_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SessionCostBreakdown>> {
        let breakdowns = self
            .breakdowns
            .read()
            .map_err(|_| Error::persistence(anyhow::anyhow!("breakdown store lock poisoned")))?;

        let mut rows: Vec<SessionCostBreakdown> = breakdowns
            .values()
            .filter(|row| !row.is_cost_real && row.timestamp >= start && row.timestamp <= end)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.timestamp);
        Ok(rows)
    }

    async fn apply_reconciled(&self, updates: &[ReconciledCost], updated_at: DateTime<Utc>) -> Result<u64> {
        let mut breakdowns = self.lock_breakdowns()?;

        // Validate the whole batch before mutating anything: all-or-nothing.
        for update in updates {
            match breakdowns.get(&update.session_id) {
                Some(row) if !row.is_cost_real => {}
                Some(_) => {
                    return Err(Error::persistence(anyhow::anyhow!(
                        "session {} is already reconciled",
                        update.session_id
                    )));
                }
                None => {
                    return Err(Error::persistence(anyhow::anyhow!(
                        "session {} not found",
                        update.session_id
                    )));
                }
            }
        }

        for update in updates {
            if let Some(row) = breakdowns.get_mut(&update.session_id) {
                row.text_input_cost = update.text_input_cost;
                row.text_output_cost = update.text_output_cost;
                row.audio_input_cost = update.audio_input_cost;
                row.audio_output_cost = update.audio_output_cost;
                row.total_cost = update.total_cost;
                row.is_cost_real = true;
                row.real_cost_updated_at = Some(updated_at);
            }
        }

        Ok(updates.len() as u64)
    }

    async fn has_unreconciled_since(&self, cutoff: DateTime<Utc>) -> Result<bool> {
        let breakdowns = self
            .breakdowns
            .read()
            .map_err(|_| Error::persistence(anyhow::anyhow!("breakdown store lock poisoned")))?;

        Ok(breakdowns.values().any(|row| !row.is_cost_real && row.timestamp >= cutoff))
    }

    async fn upsert_heartbeat(&self, gym_id: &str, kiosk_slug: &str, now: DateTime<Utc>) -> Result<KioskHeartbeat> {
        let row = KioskHeartbeat {
            gym_id: gym_id.to_string(),
            kiosk_slug: kiosk_slug.to_string(),
            last_heartbeat: now,
            status: "online".to_string(),
        };

        let mut heartbeats = self
            .heartbeats
            .write()
            .map_err(|_| Error::persistence(anyhow::anyhow!("heartbeat store lock poisoned")))?;
        heartbeats.insert(gym_id.to_string(), row.clone());
        Ok(row)
    }

    async fn heartbeats_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<KioskHeartbeat>> {
        let heartbeats = self
            .heartbeats
            .read()
            .map_err(|_| Error::persistence(anyhow::anyhow!("heartbeat store lock poisoned")))?;

        let mut rows: Vec<KioskHeartbeat> = heartbeats
            .values()
            .filter(|row| row.last_heartbeat >= cutoff)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.gym_id.cmp(&b.gym_id));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal::Decimal;

    use crate::session::types::EndReason;

    use super::*;

    fn sample_breakdown(timestamp: DateTime<Utc>) -> SessionCostBreakdown {
        SessionCostBreakdown {
            session_id: Uuid::new_v4(),
            gym_id: "gym-paris-11".to_string(),
            franchise_id: Some("franchise-alpha".to_string()),
            timestamp,
            duration_seconds: 240,
            text_input_tokens: 1000,
            text_output_tokens: 2000,
            audio_input_tokens: 3334,
            audio_output_tokens: 1667,
            text_input_cost: Decimal::new(5, 3),
            text_output_cost: Decimal::new(4, 2),
            audio_input_cost: Decimal::new(33, 2),
            audio_output_cost: Decimal::new(33, 2),
            total_cost: Decimal::new(5, 3) + Decimal::new(4, 2) + Decimal::new(33, 2) + Decimal::new(33, 2),
            user_satisfaction: Some(4.5),
            error_occurred: false,
            end_reason: EndReason::Natural,
            is_cost_real: false,
            real_cost_updated_at: None,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_session_ids() {
        let store = InMemoryStore::new();
        let breakdown = sample_breakdown(Utc::now());

        store.insert_breakdown(&breakdown).await.unwrap();
        assert!(store.insert_breakdown(&breakdown).await.is_err());
    }

    #[tokio::test]
    async fn window_queries_respect_filters() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut in_gym = sample_breakdown(now);
        in_gym.gym_id = "gym-a".to_string();
        let mut other_gym = sample_breakdown(now);
        other_gym.gym_id = "gym-b".to_string();
        store.insert_breakdown(&in_gym).await.unwrap();
        store.insert_breakdown(&other_gym).await.unwrap();

        let filters = CostFilters {
            gym_id: Some("gym-a".to_string()),
            franchise_id: None,
        };
        let rows = store
            .breakdowns_in_window(now - Duration::hours(1), now + Duration::hours(1), &filters)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].gym_id, "gym-a");
    }

    #[tokio::test]
    async fn apply_reconciled_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let breakdown = sample_breakdown(now);
        store.insert_breakdown(&breakdown).await.unwrap();

        let good = ReconciledCost {
            session_id: breakdown.session_id,
            text_input_cost: Decimal::new(1, 2),
            text_output_cost: Decimal::new(2, 2),
            audio_input_cost: Decimal::new(3, 2),
            audio_output_cost: Decimal::new(4, 2),
            total_cost: Decimal::new(10, 2),
        };
        let missing = ReconciledCost {
            session_id: Uuid::new_v4(),
            ..good.clone()
        };

        // A batch containing an unknown session must not touch the known one.
        assert!(store.apply_reconciled(&[good.clone(), missing], now).await.is_err());
        let rows = store.unreconciled_in_window(now - Duration::hours(1), now + Duration::hours(1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_cost_real);

        // A valid batch flips the flag and stamps the update time.
        let updated = store.apply_reconciled(&[good], now).await.unwrap();
        assert_eq!(updated, 1);
        let rows = store.unreconciled_in_window(now - Duration::hours(1), now + Duration::hours(1)).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn reconciled_rows_cannot_be_reconciled_again() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let breakdown = sample_breakdown(now);
        store.insert_breakdown(&breakdown).await.unwrap();

        let update = ReconciledCost {
            session_id: breakdown.session_id,
            text_input_cost: Decimal::ZERO,
            text_output_cost: Decimal::ZERO,
            audio_input_cost: Decimal::ZERO,
            audio_output_cost: Decimal::ZERO,
            total_cost: Decimal::ONE,
        };
        store.apply_reconciled(std::slice::from_ref(&update), now).await.unwrap();
        assert!(store.apply_reconciled(&[update], now).await.is_err());
    }

    #[tokio::test]
    async fn heartbeat_upsert_keeps_one_row_per_gym() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        store.upsert_heartbeat("gym-a", "kiosk-1", now - Duration::seconds(30)).await.unwrap();
        store.upsert_heartbeat("gym-a", "kiosk-1", now).await.unwrap();
        store.upsert_heartbeat("gym-b", "kiosk-2", now).await.unwrap();

        let rows = store.heartbeats_since(now - Duration::seconds(5)).await.unwrap();
        assert_eq!(rows.len(), 2);
        let gym_a = rows.iter().find(|r| r.gym_id == "gym-a").unwrap();
        assert_eq!(gym_a.last_heartbeat, now);
    }

    #[tokio::test]
    async fn has_unreconciled_since_ignores_old_and_reconciled_rows() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let old = sample_breakdown(now - Duration::hours(48));
        store.insert_breakdown(&old).await.unwrap();
        assert!(!store.has_unreconciled_since(now - Duration::hours(24)).await.unwrap());

        let recent = sample_breakdown(now - Duration::hours(1));
        store.insert_breakdown(&recent).await.unwrap();
        assert!(store.has_unreconciled_since(now - Duration::hours(24)).await.unwrap());
    }
}
