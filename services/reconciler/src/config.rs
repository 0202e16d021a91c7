//! Configuration for the reconciler service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use fitsync_client::ClientConfig;
use fitsync_reconcile::{
    ActivationConfig, ManualPatchPolicy, ReconcileConfig, RecoveryConfig,
};
use fitsync_types::UserId;

/// Reconciler service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// User whose subscription is reconciled
    pub user_id: UserId,
    /// Edge client configuration
    pub client: ClientConfig,
    /// Reconciliation settings
    pub reconcile: ReconcileConfig,
    /// Directory holding the local snapshot
    pub storage_dir: PathBuf,
    /// Subscription to activate once at startup
    pub activate: Option<String>,
    /// Prometheus listener address
    pub metrics_addr: Option<SocketAddr>,
}

fn var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_id = var("FITSYNC_USER_ID").ok_or(ConfigError::Missing("FITSYNC_USER_ID"))?;

        // Edge clients
        let mut client = ClientConfig::builder();
        if let Some(endpoint) = var("FITSYNC_ENDPOINT") {
            client = client.endpoint(endpoint);
        }
        if let Some(endpoint) = var("FITSYNC_DOCUMENTS_ENDPOINT") {
            client = client.documents_endpoint(endpoint);
        }
        if let Some(endpoint) = var("FITSYNC_FUNCTIONS_ENDPOINT") {
            client = client.functions_endpoint(endpoint);
        }
        if let Some(token) = var("FITSYNC_BEARER_TOKEN") {
            client = client.bearer_token(token);
        }
        let watch_interval_ms = parse("FITSYNC_WATCH_INTERVAL_MS", 1000_u64)?;
        let client = client
            .watch_interval(Duration::from_millis(watch_interval_ms))
            .build()?;

        // Activation
        let manual_patch = match var("FITSYNC_MANUAL_PATCH") {
            Some(raw) => raw
                .parse::<ManualPatchPolicy>()
                .map_err(|_| ConfigError::Invalid("FITSYNC_MANUAL_PATCH"))?,
            None => ManualPatchPolicy::default(),
        };
        let webhook_timeout_secs = parse("FITSYNC_WEBHOOK_TIMEOUT_SECS", 30_u64)?;
        let activation = ActivationConfig::default()
            .with_webhook_timeout(Duration::from_secs(webhook_timeout_secs))
            .with_fallbacks(parse("FITSYNC_ENABLE_FALLBACKS", true)?)
            .with_manual_patch(manual_patch)
            .with_default_price_id(var("FITSYNC_DEFAULT_PRICE_ID").unwrap_or_default());

        // Recovery
        let interval_secs = parse("FITSYNC_RECOVERY_INTERVAL_SECS", 60_u64)?;
        let threshold_secs = parse("FITSYNC_STUCK_THRESHOLD_SECS", 120_u64)?;
        let recovery = RecoveryConfig::default()
            .with_interval(Duration::from_secs(interval_secs.max(1)))
            .with_stuck_threshold(Duration::from_secs(threshold_secs))
            .with_max_recovery_attempts(parse("FITSYNC_MAX_RECOVERY_ATTEMPTS", 3_u32)?);

        let metrics_addr = match var("FITSYNC_METRICS_ADDR") {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| ConfigError::Invalid("FITSYNC_METRICS_ADDR"))?,
            ),
            None => None,
        };

        Ok(Self {
            user_id: UserId::new(user_id),
            client,
            reconcile: ReconcileConfig::default()
                .with_activation(activation)
                .with_recovery(recovery),
            storage_dir: var("FITSYNC_STORAGE_DIR")
                .map_or_else(|| PathBuf::from(".fitsync"), PathBuf::from),
            activate: var("FITSYNC_ACTIVATE_SUBSCRIPTION"),
            metrics_addr,
        })
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error(transparent)]
    Client(#[from] fitsync_client::ConfigError),
}
