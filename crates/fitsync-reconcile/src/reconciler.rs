//! Composition root
//!
//! Wires the cache, sync primitives, orchestrator and recovery monitor for
//! one user over explicitly supplied ports.

use std::sync::Arc;

use fitsync_client::{DocumentStore, LocalStore, MemoryLocalStore, PaymentFunctions};
use fitsync_types::{ActivationResult, Subscription, UserId};
use tracing::info;

use crate::activation::ActivationOrchestrator;
use crate::cache::SubscriptionCache;
use crate::clock::Clock;
use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, Result};
use crate::notify::{BroadcastChannel, FanOut, ListenerHandle, NotificationPort};
use crate::recovery::RecoveryMonitor;
use crate::sync::SubscriptionSync;

/// Builder for [`Reconciler`].
#[derive(Default)]
pub struct ReconcilerBuilder {
    documents: Option<Arc<dyn DocumentStore>>,
    functions: Option<Arc<dyn PaymentFunctions>>,
    storage: Option<Arc<dyn LocalStore>>,
    notifier: Option<Arc<dyn NotificationPort>>,
    channel: Option<BroadcastChannel>,
    config: ReconcileConfig,
    clock: Option<Clock>,
}

impl ReconcilerBuilder {
    pub fn documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn functions(mut self, functions: Arc<dyn PaymentFunctions>) -> Self {
        self.functions = Some(functions);
        self
    }

    /// Local storage for the snapshot mirror. Defaults to in-process memory.
    pub fn storage(mut self, storage: Arc<dyn LocalStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Extra port notified alongside the broadcast channel, such as a
    /// [`WorkerPort`](crate::WorkerPort).
    pub fn notifier(mut self, notifier: Arc<dyn NotificationPort>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Cross-context bus shared with other sessions.
    pub fn channel(mut self, channel: BroadcastChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn config(mut self, config: ReconcileConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the components for `user_id`.
    pub fn build(self, user_id: UserId) -> Result<Reconciler> {
        let documents = self
            .documents
            .ok_or(ReconcileError::MissingPort("documents"))?;
        let functions = self
            .functions
            .ok_or(ReconcileError::MissingPort("functions"))?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryLocalStore::new()));
        let channel = self.channel.unwrap_or_default();

        let mut fan_out = FanOut::new().with(Arc::new(channel.clone()));
        if let Some(extra) = self.notifier {
            fan_out = fan_out.with(extra);
        }
        let notifier: Arc<dyn NotificationPort> = Arc::new(fan_out);

        let mut cache = SubscriptionCache::new(
            Arc::clone(&documents),
            Arc::clone(&functions),
            storage,
            Arc::clone(&notifier),
            self.config.cache.clone(),
        );
        if let Some(clock) = self.clock {
            cache = cache.with_clock(clock);
        }

        let sync = SubscriptionSync::new(Arc::clone(&documents), cache.clone(), channel.clone())
            .with_notifier(notifier);

        let orchestrator = ActivationOrchestrator::new(
            Arc::clone(&documents),
            Arc::clone(&functions),
            cache.clone(),
            self.config.activation.clone(),
        );

        let monitor = RecoveryMonitor::new(
            user_id.clone(),
            cache.clone(),
            documents,
            functions,
            orchestrator.clone(),
            self.config.recovery.clone(),
        );

        Ok(Reconciler {
            user_id,
            cache,
            sync,
            orchestrator,
            monitor,
            channel,
            config: self.config,
        })
    }
}

/// All reconciliation components for one user.
#[derive(Debug)]
pub struct Reconciler {
    user_id: UserId,
    cache: SubscriptionCache,
    sync: SubscriptionSync,
    orchestrator: ActivationOrchestrator,
    monitor: RecoveryMonitor,
    channel: BroadcastChannel,
    config: ReconcileConfig,
}

impl Reconciler {
    #[must_use]
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::default()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn cache(&self) -> &SubscriptionCache {
        &self.cache
    }

    pub fn sync(&self) -> &SubscriptionSync {
        &self.sync
    }

    pub fn orchestrator(&self) -> &ActivationOrchestrator {
        &self.orchestrator
    }

    pub fn monitor(&self) -> &RecoveryMonitor {
        &self.monitor
    }

    pub fn channel(&self) -> &BroadcastChannel {
        &self.channel
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Drive `subscription_id` to an entitled status.
    pub async fn activate(&self, subscription_id: &str) -> ActivationResult {
        self.orchestrator.activate(&self.user_id, subscription_id).await
    }

    /// Current subscription, through the cache layers.
    pub async fn subscription(&self) -> Option<Subscription> {
        self.cache.get(&self.user_id, Default::default()).await
    }

    /// Follow the user document, keeping the cache current.
    pub async fn watch<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(Option<Subscription>) + Send + Sync + 'static,
    {
        self.cache.setup_listener(&self.user_id, callback).await
    }

    /// Start the recovery monitor.
    pub async fn start(&self) {
        self.monitor.start().await;
    }

    /// Stop the recovery monitor.
    pub async fn stop(&self) {
        self.monitor.stop().await;
    }

    /// Stop the monitor and drop every cached entry and the local snapshot.
    pub async fn dispose(self) {
        self.monitor.stop().await;
        self.cache.clear_all();
        info!(user_id = %self.user_id, "reconciler disposed");
    }
}
