//! Kiosk session lifecycle and cost/usage accounting for gym voice kiosks.
//!
//! This crate provides the non-UI core of a fitness-industry kiosk platform:
//! - A per-kiosk session state machine (badge scan, member validation, voice
//!   session, adaptive timeouts, exit-intent detection, graceful end)
//! - A cost model converting session telemetry into estimated USD cost
//! - A usage ledger persisting per-session cost breakdowns and serving daily
//!   summaries and real-time metrics
//! - A reconciliation job aligning estimated costs with provider billing totals
//! - A heartbeat protocol for deriving kiosk online/offline status by recency
//!
//! # Example
//! ```ignore
//! use kioskd::{InMemoryStore, Ledger, PricingTable};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let ledger = Ledger::new(store.clone(), PricingTable::default());
//!
//! // Record a session's cost when it ends
//! let breakdown = ledger.record_session_cost(request).await?;
//!
//! // Read back the day's aggregate
//! let summary = ledger.daily_cost_summary(date, &filters).await?;
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod ledger;
pub mod pricing;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use heartbeat::HeartbeatService;
pub use ledger::{DailyCostSummary, Ledger, RealTimeMetrics, RecordSessionCost};
pub use pricing::{calculate_session_cost, usd_to_eur, PricingTable, SessionUsage};
pub use reconcile::{BillingClient, ReconcileReport, Reconciler};
pub use session::{SessionHandle, SessionRuntime, VoiceChannel};
pub use store::in_memory::InMemoryStore;
pub use store::postgres::PgStore;
pub use store::{CostFilters, KioskHeartbeat, SessionCostBreakdown, Store};
