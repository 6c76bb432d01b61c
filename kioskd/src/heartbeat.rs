//! Kiosk liveness protocol.
//!
//! Kiosks upsert a single row keyed by gym id on a fixed interval; a monitor
//! derives online/offline purely from recency of `last_heartbeat`. The stored
//! `status` literal is never trusted on its own, because a kiosk that
//! silently died never writes an "offline" row.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Result;
use crate::store::{KioskHeartbeat, Store};

/// Default freshness window, in seconds, for deriving "online".
pub const DEFAULT_FRESHNESS_WINDOW_SECONDS: i64 = 45;

/// Default announce interval, in seconds.
pub const DEFAULT_ANNOUNCE_INTERVAL_SECONDS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub announce_interval_seconds: u64,
    pub freshness_window_seconds: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            announce_interval_seconds: DEFAULT_ANNOUNCE_INTERVAL_SECONDS,
            freshness_window_seconds: DEFAULT_FRESHNESS_WINDOW_SECONDS,
        }
    }
}

/// Kiosks currently considered online, by recency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineKiosks {
    pub online_count: usize,
    pub kiosks: Vec<KioskHeartbeat>,
}

#[derive(Clone)]
pub struct HeartbeatService {
    store: Arc<dyn Store>,
    config: HeartbeatConfig,
}

impl HeartbeatService {
    pub fn new(store: Arc<dyn Store>, config: HeartbeatConfig) -> Self {
        Self { store, config }
    }

    /// Announce liveness once: upsert the row keyed by gym id.
    #[instrument(skip(self), err)]
    pub async fn announce(&self, gym_id: &str, kiosk_slug: &str) -> Result<KioskHeartbeat> {
        self.store.upsert_heartbeat(gym_id, kiosk_slug, Utc::now()).await
    }

    /// Spawn the periodic announcer loop for one kiosk.
    ///
    /// A write failure is logged and the loop simply retries on the next
    /// scheduled tick; it never crashes the announcer. The loop stops when
    /// the cancellation token fires (kiosk session context teardown).
    pub fn spawn_announcer(&self, gym_id: String, kiosk_slug: String, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        let period = std::time::Duration::from_secs(self.config.announce_interval_seconds);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(gym_id = %gym_id, "heartbeat announcer stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = store.upsert_heartbeat(&gym_id, &kiosk_slug, Utc::now()).await {
                            tracing::warn!(gym_id = %gym_id, error = %e, "heartbeat write failed, retrying on next tick");
                        }
                    }
                }
            }
        })
    }

    /// All kiosks whose last announcement is within the freshness window.
    ///
    /// This is the only source of truth for "is this kiosk online".
    #[instrument(skip(self), err)]
    pub async fn list_online(&self, freshness_window_seconds: Option<i64>) -> Result<OnlineKiosks> {
        let window = freshness_window_seconds.unwrap_or(self.config.freshness_window_seconds);
        let cutoff = Utc::now() - Duration::seconds(window);

        let kiosks = self.store.heartbeats_since(cutoff).await?;
        Ok(OnlineKiosks {
            online_count: kiosks.len(),
            kiosks,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::store::in_memory::InMemoryStore;

    use super::*;

    fn service() -> (HeartbeatService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (HeartbeatService::new(store.clone(), HeartbeatConfig::default()), store)
    }

    #[tokio::test]
    async fn freshness_boundary_at_45_seconds() {
        let (service, store) = service();
        let now = Utc::now();

        // Written 44 seconds ago: online. Written 46 seconds ago: offline.
        store.upsert_heartbeat("gym-fresh", "kiosk-1", now - Duration::seconds(44)).await.unwrap();
        store.upsert_heartbeat("gym-stale", "kiosk-2", now - Duration::seconds(46)).await.unwrap();

        let online = service.list_online(None).await.unwrap();
        assert_eq!(online.online_count, 1);
        assert_eq!(online.kiosks[0].gym_id, "gym-fresh");
    }

    #[tokio::test]
    async fn announce_updates_existing_row() {
        let (service, _) = service();

        let first = service.announce("gym-a", "kiosk-1").await.unwrap();
        let second = service.announce("gym-a", "kiosk-1").await.unwrap();

        assert_eq!(first.status, "online");
        assert!(second.last_heartbeat >= first.last_heartbeat);

        let online = service.list_online(None).await.unwrap();
        assert_eq!(online.online_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn announcer_ticks_until_cancelled() {
        let (service, store) = service();
        let cancel = CancellationToken::new();

        let handle = service.spawn_announcer("gym-a".to_string(), "kiosk-1".to_string(), cancel.clone());

        // First tick fires immediately; two more after 20 seconds.
        tokio::time::sleep(std::time::Duration::from_secs(25)).await;
        let rows = store.heartbeats_since(Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(rows.len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
