//! Postgres store implementation backed by `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{CostFilters, KioskHeartbeat, ReconciledCost, SessionCostBreakdown, Store};

/// Postgres-backed implementation of the [`Store`] trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

/// Raw row shape; `end_reason` is stored as text and parsed on read.
#[derive(FromRow)]
struct BreakdownRow {
    session_id: Uuid,
    gym_id: String,
    franchise_id: Option<String>,
    timestamp: DateTime<Utc>,
    duration_seconds: i64,
    text_input_tokens: i64,
    text_output_tokens: i64,
    audio_input_tokens: i64,
    audio_output_tokens: i64,
    text_input_cost: Decimal,
    text_output_cost: Decimal,
    audio_input_cost: Decimal,
    audio_output_cost: Decimal,
    total_cost: Decimal,
    user_satisfaction: Option<f64>,
    error_occurred: bool,
    end_reason: String,
    is_cost_real: bool,
    real_cost_updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<BreakdownRow> for SessionCostBreakdown {
    type Error = Error;

    fn try_from(row: BreakdownRow) -> Result<Self> {
        let end_reason = row
            .end_reason
            .parse()
            .map_err(|e: String| Error::persistence(anyhow::anyhow!(e)))?;

        Ok(SessionCostBreakdown {
            session_id: row.session_id,
            gym_id: row.gym_id,
            franchise_id: row.franchise_id,
            timestamp: row.timestamp,
            duration_seconds: row.duration_seconds,
            text_input_tokens: row.text_input_tokens,
            text_output_tokens: row.text_output_tokens,
            audio_input_tokens: row.audio_input_tokens,
            audio_output_tokens: row.audio_output_tokens,
            text_input_cost: row.text_input_cost,
            text_output_cost: row.text_output_cost,
            audio_input_cost: row.audio_input_cost,
            audio_output_cost: row.audio_output_cost,
            total_cost: row.total_cost,
            user_satisfaction: row.user_satisfaction,
            error_occurred: row.error_occurred,
            end_reason,
            is_cost_real: row.is_cost_real,
            real_cost_updated_at: row.real_cost_updated_at,
        })
    }
}

#[derive(FromRow)]
struct HeartbeatRow {
    gym_id: String,
    kiosk_slug: String,
    last_heartbeat: DateTime<Utc>,
    status: String,
}

impl From<HeartbeatRow> for KioskHeartbeat {
    fn from(row: HeartbeatRow) -> Self {
        KioskHeartbeat {
            gym_id: row.gym_id,
            kiosk_slug: row.kiosk_slug,
            last_heartbeat: row.last_heartbeat,
            status: row.status,
        }
    }
}

impl PgStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Run the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::persistence(anyhow::Error::from(e)))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self, breakdown), fields(session_id = %breakdown.session_id), err)]
    async fn insert_breakdown(&self, breakdown: &SessionCostBreakdown) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_cost_breakdowns (
                session_id, gym_id, franchise_id, timestamp, duration_seconds,
                text_input_tokens, text_output_tokens, audio_input_tokens, audio_output_tokens,
                text_input_cost, text_output_cost, audio_input_cost, audio_output_cost, total_cost,
                user_satisfaction, error_occurred, end_reason, is_cost_real, real_cost_updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(breakdown.session_id)
        .bind(&breakdown.gym_id)
        .bind(&breakdown.franchise_id)
        .bind(breakdown.timestamp)
        .bind(breakdown.duration_seconds)
        .bind(breakdown.text_input_tokens)
        .bind(breakdown.text_output_tokens)
        .bind(breakdown.audio_input_tokens)
        .bind(breakdown.audio_output_tokens)
        .bind(breakdown.text_input_cost)
        .bind(breakdown.text_output_cost)
        .bind(breakdown.audio_input_cost)
        .bind(breakdown.audio_output_cost)
        .bind(breakdown.total_cost)
        .bind(breakdown.user_satisfaction)
        .bind(breakdown.error_occurred)
        .bind(breakdown.end_reason.as_str())
        .bind(breakdown.is_cost_real)
        .bind(breakdown.real_cost_updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn breakdowns_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filters: &CostFilters,
    ) -> Result<Vec<SessionCostBreakdown>> {
        let rows: Vec<BreakdownRow> = sqlx::query_as(
            r#"
            SELECT session_id, gym_id, franchise_id, timestamp, duration_seconds,
                   text_input_tokens, text_output_tokens, audio_input_tokens, audio_output_tokens,
                   text_input_cost, text_output_cost, audio_input_cost, audio_output_cost, total_cost,
                   user_satisfaction, error_occurred, end_reason, is_cost_real, real_cost_updated_at
            FROM session_cost_breakdowns
            WHERE timestamp >= $1 AND timestamp <= $2
              AND ($3::text IS NULL OR gym_id = $3)
              AND ($4::text IS NULL OR franchise_id = $4)
            ORDER BY timestamp
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(&filters.gym_id)
        .bind(&filters.franchise_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SessionCostBreakdown::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn unreconciled_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SessionCostBreakdown>> {
        let rows: Vec<BreakdownRow> = sqlx::query_as(
            r#"
            SELECT session_id, gym_id, franchise_id, timestamp, duration_seconds,
                   text_input_tokens, text_output_tokens, audio_input_tokens, audio_output_tokens,
                   text_input_cost, text_output_cost, audio_input_cost, audio_output_cost, total_cost,
                   user_satisfaction, error_occurred, end_reason, is_cost_real, real_cost_updated_at
            FROM session_cost_breakdowns
            WHERE is_cost_real = FALSE AND timestamp >= $1 AND timestamp <= $2
            ORDER BY timestamp
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SessionCostBreakdown::try_from).collect()
    }

    #[instrument(skip(self, updates), fields(count = updates.len()), err)]
    async fn apply_reconciled(&self, updates: &[ReconciledCost], updated_at: DateTime<Utc>) -> Result<u64> {
        if updates.is_empty() {
            return Ok(0);
        }

        // Single transaction: either every staged update lands or none do.
        let mut tx = self.pool.begin().await?;

        for update in updates {
            let result = sqlx::query(
                r#"
                UPDATE session_cost_breakdowns
                SET text_input_cost = $2,
                    text_output_cost = $3,
                    audio_input_cost = $4,
                    audio_output_cost = $5,
                    total_cost = $6,
                    is_cost_real = TRUE,
                    real_cost_updated_at = $7
                WHERE session_id = $1 AND is_cost_real = FALSE
                "#,
            )
            .bind(update.session_id)
            .bind(update.text_input_cost)
            .bind(update.text_output_cost)
            .bind(update.audio_input_cost)
            .bind(update.audio_output_cost)
            .bind(update.total_cost)
            .bind(updated_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() != 1 {
                // Dropping the transaction rolls everything back.
                return Err(Error::persistence(anyhow::anyhow!(
                    "session {} missing or already reconciled",
                    update.session_id
                )));
            }
        }

        tx.commit().await?;
        Ok(updates.len() as u64)
    }

    #[instrument(skip(self), err)]
    async fn has_unreconciled_since(&self, cutoff: DateTime<Utc>) -> Result<bool> {
        let exists: Option<bool> = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM session_cost_breakdowns WHERE is_cost_real = FALSE AND timestamp >= $1)",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists.unwrap_or(false))
    }

    #[instrument(skip(self), err)]
    async fn upsert_heartbeat(&self, gym_id: &str, kiosk_slug: &str, now: DateTime<Utc>) -> Result<KioskHeartbeat> {
        let row: HeartbeatRow = sqlx::query_as(
            r#"
            INSERT INTO kiosk_heartbeats (gym_id, kiosk_slug, last_heartbeat, status)
            VALUES ($1, $2, $3, 'online')
            ON CONFLICT (gym_id) DO UPDATE
            SET kiosk_slug = EXCLUDED.kiosk_slug,
                last_heartbeat = EXCLUDED.last_heartbeat,
                status = EXCLUDED.status
            RETURNING gym_id, kiosk_slug, last_heartbeat, status
            "#,
        )
        .bind(gym_id)
        .bind(kiosk_slug)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    #[instrument(skip(self), err)]
    async fn heartbeats_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<KioskHeartbeat>> {
        let rows: Vec<HeartbeatRow> = sqlx::query_as(
            r#"
            SELECT gym_id, kiosk_slug, last_heartbeat, status
            FROM kiosk_heartbeats
            WHERE last_heartbeat >= $1
            ORDER BY gym_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(KioskHeartbeat::from).collect())
    }
}
