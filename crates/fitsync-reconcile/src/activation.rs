//! Robust activation orchestrator
//!
//! Drives one freshly created subscription to `active`/`trialing` through
//! an escalating, strictly sequential chain:
//!
//! 1. **Webhook wait** - follow the user document until the webhook
//!    processor reports the subscription as entitled, bounded by
//!    `webhook_timeout`
//! 2. **Processor verification** - ask the processor for the status; when it
//!    reports entitled, force webhook reprocessing and re-read the document
//! 3. **Direct patch** - write an active record with a fresh plan period,
//!    gated by [`ManualPatchPolicy`]
//!
//! The whole chain is bounded by `total_timeout`. Concurrent requests for
//! the same subscription ID join the attempt already in flight.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fitsync_client::{DocumentStore, PaymentFunctions};
use fitsync_types::{
    ActivationMethod, ActivationResult, CacheSource, Subscription, SubscriptionStatus,
    TypesError, UserId,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::cache::SubscriptionCache;
use crate::config::{ActivationConfig, ManualPatchPolicy};
use crate::error::Result;
use crate::metrics::record_activation;

type PendingActivation = Shared<BoxFuture<'static, ActivationResult>>;

/// Activation orchestrator.
///
/// Cheap to clone; clones share the in-flight map.
#[derive(Clone)]
pub struct ActivationOrchestrator {
    inner: Arc<Orchestrator>,
}

struct Orchestrator {
    documents: Arc<dyn DocumentStore>,
    functions: Arc<dyn PaymentFunctions>,
    cache: SubscriptionCache,
    config: ActivationConfig,
    in_flight: DashMap<String, PendingActivation>,
    attempts: DashMap<String, u32>,
}

impl std::fmt::Debug for ActivationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationOrchestrator")
            .field("config", &self.inner.config)
            .field("in_flight", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// Clears the in-flight entry and attempt counter when the activation task
/// ends, including by panic.
struct Settled {
    inner: Arc<Orchestrator>,
    subscription_id: String,
}

impl Drop for Settled {
    fn drop(&mut self) {
        self.inner.attempts.remove(&self.subscription_id);
        self.inner.in_flight.remove(&self.subscription_id);
    }
}

enum WebhookOutcome {
    Activated(Subscription),
    TimedOut,
    Failed(String),
}

enum Verification {
    /// The document caught up after the forced reprocessing
    Activated(Subscription),
    /// The processor reports an entitled status the document does not show
    Confirmed(SubscriptionStatus),
    /// The processor reports a non-entitled status
    Unconfirmed(SubscriptionStatus),
    Failed(String),
}

impl ActivationOrchestrator {
    /// Create an orchestrator committing results through `cache`.
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        functions: Arc<dyn PaymentFunctions>,
        cache: SubscriptionCache,
        config: ActivationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Orchestrator {
                documents,
                functions,
                cache,
                config,
                in_flight: DashMap::new(),
                attempts: DashMap::new(),
            }),
        }
    }

    /// Default activation settings.
    pub fn config(&self) -> &ActivationConfig {
        &self.inner.config
    }

    /// Activate with the default settings.
    pub async fn activate(&self, user_id: &UserId, subscription_id: &str) -> ActivationResult {
        self.activate_with(user_id, subscription_id, self.inner.config.clone())
            .await
    }

    /// Activate with explicit settings.
    ///
    /// If an activation for `subscription_id` is already running, the call
    /// joins it and `config` is ignored.
    #[instrument(skip(self, config), level = "debug")]
    pub async fn activate_with(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        config: ActivationConfig,
    ) -> ActivationResult {
        let pending = match self.inner.in_flight.entry(subscription_id.to_string()) {
            Entry::Occupied(entry) => {
                debug!(subscription_id, "joining activation in flight");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let inner = Arc::clone(&self.inner);
                let user_id = user_id.clone();
                let subscription_id = subscription_id.to_string();

                // Runs to completion even if every caller stops waiting.
                let task = tokio::spawn(async move {
                    let _settled = Settled {
                        inner: Arc::clone(&inner),
                        subscription_id: subscription_id.clone(),
                    };
                    inner.run(&user_id, &subscription_id, &config).await
                });

                let pending = async move {
                    task.await.unwrap_or_else(|e| {
                        ActivationResult::failed(
                            ActivationMethod::Timeout,
                            format!("activation task failed: {e}"),
                            0,
                            Duration::ZERO,
                        )
                    })
                }
                .boxed()
                .shared();

                entry.insert(pending.clone());
                pending
            }
        };

        pending.await
    }

    /// Whether an activation for `subscription_id` is running.
    #[must_use]
    pub fn is_in_flight(&self, subscription_id: &str) -> bool {
        self.inner.in_flight.contains_key(subscription_id)
    }

    /// Fallback strategies tried so far by the running activation.
    #[must_use]
    pub fn attempts(&self, subscription_id: &str) -> u32 {
        self.inner.attempts_for(subscription_id)
    }
}

impl Orchestrator {
    async fn run(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        config: &ActivationConfig,
    ) -> ActivationResult {
        let started = Instant::now();
        self.attempts.insert(subscription_id.to_string(), 0);

        let result = match timeout(
            config.total_timeout,
            self.escalate(user_id, subscription_id, config, started),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => ActivationResult::failed(
                ActivationMethod::Timeout,
                format!(
                    "activation did not settle within {}s",
                    config.total_timeout.as_secs()
                ),
                self.attempts_for(subscription_id),
                started.elapsed(),
            ),
        };

        record_activation(&result);
        if result.success {
            info!(
                subscription_id,
                method = result.method.as_str(),
                attempts = result.attempts,
                duration_ms = result.duration_ms(),
                "subscription activated"
            );
        } else {
            warn!(
                subscription_id,
                method = result.method.as_str(),
                attempts = result.attempts,
                duration_ms = result.duration_ms(),
                error = result.error.as_deref().unwrap_or_default(),
                "subscription activation failed"
            );
        }
        result
    }

    async fn escalate(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        config: &ActivationConfig,
        started: Instant,
    ) -> ActivationResult {
        let webhook_error = match self
            .wait_for_webhook(user_id, subscription_id, config.webhook_timeout)
            .await
        {
            WebhookOutcome::Activated(subscription) => {
                return self
                    .succeed(
                        user_id,
                        ActivationMethod::Webhook,
                        subscription,
                        CacheSource::Document,
                        started,
                    )
                    .await;
            }
            WebhookOutcome::TimedOut => format!(
                "webhook not received within {}s",
                config.webhook_timeout.as_secs()
            ),
            WebhookOutcome::Failed(e) => e,
        };

        if !config.enable_fallbacks {
            return ActivationResult::failed(
                ActivationMethod::Webhook,
                webhook_error,
                0,
                started.elapsed(),
            );
        }

        debug!(subscription_id, error = %webhook_error, "webhook wait failed, verifying with processor");
        self.record_attempt(subscription_id);
        let (processor_confirmed, mut last_error) =
            match self.verify_with_processor(user_id, subscription_id).await {
                Verification::Activated(subscription) => {
                    return self
                        .succeed(
                            user_id,
                            ActivationMethod::ProcessorVerification,
                            subscription,
                            CacheSource::Processor,
                            started,
                        )
                        .await;
                }
                Verification::Confirmed(status) => (
                    true,
                    format!("processor reports {status} but the document was not updated"),
                ),
                Verification::Unconfirmed(status) => (false, format!("processor reports {status}")),
                Verification::Failed(e) => (false, e),
            };

        if config.manual_patch.allows(processor_confirmed) {
            self.record_attempt(subscription_id);
            match direct_patch(
                self.documents.as_ref(),
                user_id,
                subscription_id,
                &config.default_price_id,
                self.cache.clock().now(),
            )
            .await
            {
                Ok(subscription) => {
                    return self
                        .succeed(
                            user_id,
                            ActivationMethod::ManualActivation,
                            subscription,
                            CacheSource::Manual,
                            started,
                        )
                        .await;
                }
                Err(e) => {
                    warn!(subscription_id, error = %e, "direct activation patch failed");
                    last_error = e.to_string();
                }
            }
        } else if config.manual_patch != ManualPatchPolicy::Disabled {
            debug!(
                subscription_id,
                policy = config.manual_patch.as_str(),
                "direct patch withheld without processor confirmation"
            );
        }

        ActivationResult::failed(
            ActivationMethod::Timeout,
            format!("all activation fallbacks exhausted: {last_error}"),
            self.attempts_for(subscription_id),
            started.elapsed(),
        )
    }

    async fn succeed(
        &self,
        user_id: &UserId,
        method: ActivationMethod,
        subscription: Subscription,
        source: CacheSource,
        started: Instant,
    ) -> ActivationResult {
        let attempts = self.attempts_for(&subscription.subscription_id);
        self.cache
            .commit(user_id, subscription.clone(), source)
            .await;
        ActivationResult::succeeded(method, subscription, attempts, started.elapsed())
    }

    /// Resolves exactly once: on the first entitled snapshot, on a listener
    /// error, or at the timeout. The watch is torn down on return.
    async fn wait_for_webhook(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        limit: Duration,
    ) -> WebhookOutcome {
        let mut watch = match self.documents.listen(user_id).await {
            Ok(watch) => watch,
            Err(e) => return WebhookOutcome::Failed(format!("document listener failed: {e}")),
        };

        let waiting = async {
            while let Some(event) = watch.next().await {
                match event {
                    Ok(Some(doc)) => {
                        if let Some(subscription) = doc.subscription_for(subscription_id) {
                            if subscription.status.is_entitled() {
                                return WebhookOutcome::Activated(subscription.clone());
                            }
                            debug!(status = %subscription.status, "waiting for webhook");
                        }
                    }
                    Ok(None) => debug!("user document not created yet"),
                    Err(e) => return WebhookOutcome::Failed(format!("document listener failed: {e}")),
                }
            }
            WebhookOutcome::Failed("document listener closed".to_string())
        };

        let outcome = timeout(limit, waiting)
            .await
            .unwrap_or(WebhookOutcome::TimedOut);
        watch.close();
        outcome
    }

    async fn verify_with_processor(&self, user_id: &UserId, subscription_id: &str) -> Verification {
        let status = match self.functions.get_status(subscription_id).await {
            Ok(reply) if reply.id == subscription_id => reply.status,
            Ok(reply) => {
                warn!(subscription_id, reported = %reply.id, "processor answered for another subscription");
                return Verification::Failed(format!(
                    "processor reported status for {} instead of {subscription_id}",
                    reply.id
                ));
            }
            Err(e) => {
                warn!(subscription_id, error = %e, "processor status check failed");
                return Verification::Failed(format!("processor status check failed: {e}"));
            }
        };

        if !status.is_entitled() {
            return Verification::Unconfirmed(status);
        }

        match self.functions.force_webhook_processing(subscription_id).await {
            Ok(true) => debug!(subscription_id, "webhook reprocessing forced"),
            Ok(false) => warn!(subscription_id, "webhook reprocessing reported no success"),
            Err(e) => warn!(subscription_id, error = %e, "webhook reprocessing failed"),
        }

        match self.documents.get_user(user_id).await {
            Ok(Some(doc)) => match doc.subscription_for(subscription_id) {
                Some(subscription) if subscription.status.is_entitled() => {
                    Verification::Activated(subscription.clone())
                }
                _ => Verification::Confirmed(status),
            },
            Ok(None) => Verification::Confirmed(status),
            Err(e) => {
                warn!(subscription_id, error = %e, "document re-fetch failed");
                Verification::Confirmed(status)
            }
        }
    }

    fn record_attempt(&self, subscription_id: &str) {
        *self.attempts.entry(subscription_id.to_string()).or_insert(0) += 1;
    }

    fn attempts_for(&self, subscription_id: &str) -> u32 {
        self.attempts.get(subscription_id).map_or(0, |a| *a)
    }
}

/// Whether the processor reports `subscription_id` as active or trialing.
pub(crate) async fn processor_confirms(functions: &dyn PaymentFunctions, subscription_id: &str) -> bool {
    match functions.get_status(subscription_id).await {
        Ok(status) => status.id == subscription_id && status.status.is_entitled(),
        Err(e) => {
            warn!(subscription_id, error = %e, "processor status check failed");
            false
        }
    }
}

/// Write an active record with a plan period anchored at `now`.
///
/// Nothing here proves payment; callers gate this with [`ManualPatchPolicy`].
pub(crate) async fn direct_patch(
    documents: &dyn DocumentStore,
    user_id: &UserId,
    subscription_id: &str,
    price_id: &str,
    now: DateTime<Utc>,
) -> Result<Subscription> {
    let current = documents.get_user(user_id).await?.and_then(|d| d.subscription);

    let base = match current {
        Some(current) if current.subscription_id == subscription_id => current,
        Some(current) if current.subscription_id.is_empty() => Subscription {
            subscription_id: subscription_id.to_string(),
            ..current
        },
        Some(current) => {
            return Err(TypesError::SubscriptionMismatch {
                stored: current.subscription_id,
                target: subscription_id.to_string(),
            }
            .into());
        }
        None => Subscription::new(subscription_id, "", SubscriptionStatus::Incomplete, now),
    };

    let record = base.activated(price_id, now);
    documents.set_subscription(user_id, &record).await?;
    Ok(record)
}
