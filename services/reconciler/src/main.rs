//! fitsync Reconciler
//!
//! Keeps one user's subscription reconciled with the payment processor:
//! runs the recovery monitor and, when `FITSYNC_ACTIVATE_SUBSCRIPTION` is
//! set, drives that subscription through activation once at startup.
//!
//! ## Environment
//!
//! - `FITSYNC_USER_ID` - user to reconcile (required)
//! - `FITSYNC_ENDPOINT` - base URL for the document store and the functions
//! - `FITSYNC_DOCUMENTS_ENDPOINT` / `FITSYNC_FUNCTIONS_ENDPOINT` - per-service overrides
//! - `FITSYNC_BEARER_TOKEN` - bearer token sent to both
//! - `FITSYNC_STORAGE_DIR` - local snapshot directory (default `.fitsync`)
//! - `FITSYNC_MANUAL_PATCH` - `disabled`, `require_processor_confirmation` or `optimistic`
//! - `FITSYNC_METRICS_ADDR` - Prometheus listener, e.g. `0.0.0.0:9102`

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use fitsync_client::{FileLocalStore, HttpDocumentStore, HttpPaymentFunctions};
use fitsync_reconcile::{Reconciler, WorkerPort};
use fitsync_types::SyncMessage;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("fitsync_reconciler=debug".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fitsync reconciler");

    let config = Config::from_env()?;
    tracing::info!(
        user_id = %config.user_id,
        documents = config.client.documents_endpoint(),
        functions = config.client.functions_endpoint(),
        manual_patch = config.reconcile.activation.manual_patch.as_str(),
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        setup_metrics(addr)?;
    }

    let documents = Arc::new(HttpDocumentStore::new(&config.client)?);
    let functions = Arc::new(HttpPaymentFunctions::new(&config.client)?);
    let storage = Arc::new(FileLocalStore::open(&config.storage_dir)?);
    let (worker, mut inbox) = WorkerPort::channel();

    let reconciler = Reconciler::builder()
        .documents(documents)
        .functions(functions)
        .storage(storage)
        .notifier(Arc::new(worker))
        .config(config.reconcile.clone())
        .build(config.user_id.clone())?;

    // Background worker: log every reconciled record
    let worker_task = tokio::spawn(async move {
        while let Some(SyncMessage::SubscriptionUpdated { subscription }) = inbox.recv().await {
            tracing::info!(
                subscription_id = %subscription.subscription_id,
                status = %subscription.status,
                "Subscription updated"
            );
        }
    });

    match reconciler.subscription().await {
        Some(subscription) => tracing::info!(
            subscription_id = %subscription.subscription_id,
            status = %subscription.status,
            "Current subscription"
        ),
        None => tracing::warn!("No subscription record available"),
    }

    reconciler.start().await;

    if let Some(subscription_id) = config.activate.as_deref() {
        tokio::select! {
            result = reconciler.activate(subscription_id) => {
                if result.success {
                    tracing::info!(
                        subscription_id,
                        method = result.method.as_str(),
                        duration_ms = result.duration_ms(),
                        "Activation complete"
                    );
                } else {
                    tracing::warn!(
                        subscription_id,
                        method = result.method.as_str(),
                        error = result.error.as_deref().unwrap_or_default(),
                        "Activation did not converge; recovery monitor will retry"
                    );
                }
            }
            () = shutdown_signal() => {
                tracing::info!("Shutdown signal received");
                reconciler.dispose().await;
                worker_task.abort();
                return Ok(());
            }
        }
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    reconciler.dispose().await;
    worker_task.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

fn setup_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    let activation_buckets = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("fitsync_activation_duration_seconds".to_string()),
            activation_buckets,
        )?
        .install()?;

    fitsync_client::metrics::describe_metrics();
    fitsync_reconcile::metrics::describe_metrics();
    tracing::info!(%addr, "Prometheus listener started");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
