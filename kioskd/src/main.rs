use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use kioskd::api::{self, AppState};
use kioskd::config::{Args, Config};
use kioskd::heartbeat::HeartbeatService;
use kioskd::ledger::Ledger;
use kioskd::reconcile::{HttpBillingClient, Reconciler};
use kioskd::store::postgres::PgStore;
use kioskd::telemetry;

/// Resolves when the process is asked to stop (Ctrl+C, or SIGTERM on unix).
async fn shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing the SIGTERM handler");
        tokio::select! {
            _ = interrupt => tracing::info!("interrupt received, stopping"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received, stopping"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
        tracing::info!("interrupt received, stopping");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    // Exit after validation for CI config checks.
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry();
    tracing::debug!("{:?}", args);

    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    store.migrate().await?;

    let ledger = Ledger::new(store.clone(), config.pricing.clone());
    let heartbeats = HeartbeatService::new(store.clone(), config.heartbeat.clone());

    if let Some(api_key) = config.reconcile.billing_api_key.clone() {
        let billing = Arc::new(HttpBillingClient::new(config.reconcile.billing_base_url.clone(), api_key));
        let reconciler = Reconciler::new(store.clone(), billing);
        tokio::spawn(reconciler.run_daemon(std::time::Duration::from_secs(config.reconcile.interval_seconds)));
    } else {
        tracing::info!("no billing API key configured, reconciliation daemon disabled");
    }

    // When this process drives a physical kiosk, announce its liveness until
    // shutdown.
    let cancel = CancellationToken::new();
    if let Some(kiosk) = &config.kiosk {
        heartbeats.spawn_announcer(kiosk.gym_id.clone(), kiosk.kiosk_slug.clone(), cancel.clone());
    }

    let app = api::router(AppState { ledger, heartbeats });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "kioskd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
        .await?;

    Ok(())
}
