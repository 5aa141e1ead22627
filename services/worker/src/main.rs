//! wgfleet worker
//!
//! Runs next to a WireGuard interface and keeps its peers converged to the
//! device records in Postgres.
//!
//! ## Architecture
//!
//! - **Startup sync**: one reconciliation pass before any event is consumed
//! - **Bus consumer**: claims device events and applies them to the interface
//! - **Metadata poller**: writes live telemetry back to the records
//! - **Interface**: `wg` CLI in production, mock in development

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wgfleet_bus::{BusMedium, MemoryBackend, PubSubClient, DEFAULT_PURGE_INTERVAL};
use wgfleet_worker::config::{BusKind, Config};
use wgfleet_worker::db::{Database, DbConfig};
use wgfleet_worker::handlers::subscribe_device_handlers;
use wgfleet_worker::{
    DeviceStore, InterfaceControl, MetadataPoller, MockInterface, Reconciler, WgCommandInterface,
};

/// How long workers get to finish after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Spans get OpenTelemetry ids so bus handlers join the publisher's trace.
    let tracer_provider = SdkTracerProvider::builder().build();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .with(tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("wgfleet-worker")))
        .init();

    info!(
        vpn_cidr = %config.vpn_cidr,
        wg_interface = %config.wg_interface,
        wg_enabled = config.wg_enabled,
        bus = ?config.bus,
        "Starting wgfleet worker"
    );

    let db = Database::connect(&DbConfig::from_env()).await?;
    if config.dev_mode {
        db.migrate().await?;
    }

    let store: Arc<dyn DeviceStore> = Arc::new(db.device_store());
    let interface: Arc<dyn InterfaceControl> = if config.wg_enabled {
        Arc::new(WgCommandInterface::new(config.wg_interface.as_str()))
    } else {
        warn!("WireGuard control disabled, using mock interface");
        Arc::new(MockInterface::new())
    };

    // Converge before consuming any event.
    Reconciler::new(store.clone(), interface.clone())
        .reconcile()
        .await
        .context("initial peer sync failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    let medium: Arc<dyn BusMedium> = match config.bus {
        BusKind::Postgres => {
            let medium = Arc::new(db.bus_medium());
            handles.push(tokio::spawn({
                let medium = Arc::clone(&medium);
                let shutdown_rx = shutdown_rx.clone();
                async move {
                    medium
                        .run_purger(DEFAULT_PURGE_INTERVAL, shutdown_rx)
                        .await
                }
            }));
            medium
        }
        BusKind::Memory => {
            warn!("Using in-process bus; events are not shared with other replicas");
            Arc::new(MemoryBackend::new().connect())
        }
    };

    let poller = MetadataPoller::new(store.clone(), interface.clone(), config.metadata_interval());
    handles.push(tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { poller.run(shutdown_rx).await }
    }));

    let bus = PubSubClient::new(medium);
    subscribe_device_handlers(&bus, interface.clone()).await?;

    let mut consumer_handle = tokio::spawn({
        let bus = bus.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { bus.run(shutdown_rx).await }
    });

    let consumer_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut consumer_handle => {
            log_consumer_exit(result);
            true
        }
    };

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        // The consumer returns once its in-flight handlers have finished.
        if !consumer_done {
            log_consumer_exit(consumer_handle.await);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Workers did not stop in time");
    }

    if let Err(e) = tracer_provider.shutdown() {
        warn!(error = %e, "Tracer provider shutdown failed");
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn log_consumer_exit(result: Result<Result<(), wgfleet_bus::BusError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("Bus consumer exited"),
        Ok(Err(e)) => error!(error = %e, "Bus consumer error"),
        Err(e) => error!(error = %e, "Bus consumer task panicked"),
    }
}
