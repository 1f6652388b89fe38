//! vmctl VM Controller
//!
//! Runs the lifecycle controller against the local object store.
//!
//! ## Architecture
//!
//! - **Controller**: Routes requeues to per-resource actors and resyncs periodically
//! - **Dispatcher**: Turns finished background waits into requeues
//! - **Reconciler**: Moves each VM one step closer to its spec per pass
//! - **Provider**: Remote task and property-watch API (simulated for now)

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmctl_controller::capability::PlainScope;
use vmctl_controller::config::Config;
use vmctl_controller::session::{SessionCache, SharedConnector};
use vmctl_controller::{
    CompletionNotifier, Controller, MockProvider, ObjectStore, Reconciler, SqliteObjectStore,
};
use vmctl_reconcile::SystemClock;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmctl VM controller");
    info!(
        data_dir = %config.data_dir,
        resync_interval_secs = config.resync_interval_secs,
        retry_backoff_secs = config.retry_backoff_secs,
        task_poll_interval_secs = config.task_poll_interval_secs,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir))?;
    let store: Arc<dyn ObjectStore> = Arc::new(
        SqliteObjectStore::open(config.store_path()).context("opening object store")?,
    );

    // Create the provider (simulated for now)
    let provider = Arc::new(MockProvider::new());
    let sessions = Arc::new(SessionCache::new(Arc::new(SharedConnector::new(provider))));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (notifier, dispatcher) = CompletionNotifier::new();
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        sessions,
        notifier,
        Arc::new(PlainScope),
        Arc::new(SystemClock),
        config.reconciler(),
    ));
    let controller = Controller::new(reconciler, store, config.resync_interval());

    let dispatcher_handle = tokio::spawn(dispatcher.run(controller.requeue_sink(), shutdown_rx.clone()));
    let controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { controller.run(shutdown_rx).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = dispatcher_handle => {
            if let Err(e) = result {
                error!(error = %e, "Dispatcher task panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for controller to shut down...");
    if let Err(e) = controller_handle.await {
        error!(error = %e, "Controller task panicked");
    }

    info!("VM controller shutdown complete");
    Ok(())
}
