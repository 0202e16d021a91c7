//! Background recovery monitor
//!
//! Scans the user's subscription on a fixed interval and recovers it when
//! it has been `incomplete` for longer than the stuck threshold. A recovery
//! run first repeats the full activation; if that fails it tries forced
//! webhook reprocessing, then a processor-side manual sync, then the gated
//! direct patch, stopping at the first success.
//!
//! Runs are rate limited per subscription: at most `max_recovery_attempts`
//! within any rolling `recovery_cooldown` window. The window check reserves
//! the slot before the run starts, so concurrent triggers cannot exceed it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use fitsync_client::{DocumentStore, PaymentFunctions};
use fitsync_types::{
    CacheSource, ConcernLevel, RecoveryAttempt, RecoveryMethod, Subscription, SubscriptionStatus,
    UserId,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::activation::{direct_patch, processor_confirms, ActivationOrchestrator};
use crate::cache::{GetOptions, SubscriptionCache};
use crate::config::{ManualPatchPolicy, RecoveryConfig};
use crate::metrics::record_recovery;

/// Result of one scan or forced recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No subscription record could be read
    NoSubscription,
    /// Nothing to recover
    Healthy,
    /// The cooldown window is already full
    RateLimited {
        /// Runs logged within the window
        attempts: u32,
    },
    /// The subscription was reconciled
    Recovered {
        /// Strategy that succeeded
        method: RecoveryMethod,
    },
    /// Every strategy failed
    Failed {
        /// Last strategy tried
        method: RecoveryMethod,
        /// Failure description
        error: String,
    },
}

const IN_PROGRESS: &str = "recovery in progress";
const ABANDONED: &str = "recovery abandoned";

fn window(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn cutoff(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Periodic recovery for one user's subscription.
///
/// Cheap to clone; clones share the attempt log and the running loop.
#[derive(Clone)]
pub struct RecoveryMonitor {
    inner: Arc<Monitor>,
}

struct Monitor {
    user_id: UserId,
    cache: SubscriptionCache,
    documents: Arc<dyn DocumentStore>,
    functions: Arc<dyn PaymentFunctions>,
    orchestrator: ActivationOrchestrator,
    config: RecoveryConfig,
    log: DashMap<String, Vec<RecoveryAttempt>>,
    running: Mutex<Option<RunningLoop>>,
}

struct RunningLoop {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for RecoveryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryMonitor")
            .field("user_id", &self.inner.user_id)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl RecoveryMonitor {
    /// Create a stopped monitor for `user_id`.
    ///
    /// The direct patch follows the orchestrator's manual patch policy.
    pub fn new(
        user_id: UserId,
        cache: SubscriptionCache,
        documents: Arc<dyn DocumentStore>,
        functions: Arc<dyn PaymentFunctions>,
        orchestrator: ActivationOrchestrator,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Monitor {
                user_id,
                cache,
                documents,
                functions,
                orchestrator,
                config,
                log: DashMap::new(),
                running: Mutex::new(None),
            }),
        }
    }

    /// Start scanning every `interval`. A no-op while already running.
    ///
    /// The first scan happens one interval after start. A scan is awaited
    /// before the next tick is taken, and ticks missed meanwhile are skipped.
    pub async fn start(&self) {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            debug!(user_id = %self.inner.user_id, "recovery monitor already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = mpsc::channel(1);
        let monitor = self.clone();
        let period = self.inner.config.interval;

        let task = tokio::spawn(async move {
            info!(
                user_id = %monitor.inner.user_id,
                interval_secs = period.as_secs(),
                "recovery monitor started"
            );

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            outcome = monitor.tick() => {
                                debug!(?outcome, "recovery scan finished");
                            }
                        }
                    }
                }
            }

            info!(user_id = %monitor.inner.user_id, "recovery monitor stopped");
        });

        *running = Some(RunningLoop { shutdown, task });
    }

    /// Stop scanning and wait for the loop to exit. A scan in progress is
    /// abandoned and its run logged as `recovery abandoned`; an activation it
    /// started keeps running to completion.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(()).await;
        if let Err(e) = running.task.await {
            warn!(error = %e, "recovery monitor loop ended abnormally");
        }
    }

    /// Whether the scan loop is running.
    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Run one scan now.
    #[instrument(skip(self), level = "debug", fields(user_id = %self.inner.user_id))]
    pub async fn tick(&self) -> RecoveryOutcome {
        let inner = &self.inner;
        let Some(subscription) = inner.cache.get(&inner.user_id, GetOptions::fresh()).await else {
            return RecoveryOutcome::NoSubscription;
        };

        let now = inner.cache.clock().now();
        if !inner.is_stuck(&subscription, now) {
            return RecoveryOutcome::Healthy;
        }

        inner.recover(&subscription.subscription_id).await
    }

    /// Recover `subscription_id` now, regardless of its status. Still
    /// subject to the cooldown window.
    #[instrument(skip(self), level = "debug")]
    pub async fn force_recovery(&self, subscription_id: &str) -> RecoveryOutcome {
        self.inner.recover(subscription_id).await
    }

    /// Logged runs for `subscription_id` within the retention period.
    #[must_use]
    pub fn attempts(&self, subscription_id: &str) -> Vec<RecoveryAttempt> {
        let since = cutoff(self.inner.cache.clock().now(), self.inner.config.log_retention);
        self.inner
            .log
            .get(subscription_id)
            .map(|log| log.iter().filter(|a| a.timestamp > since).cloned().collect())
            .unwrap_or_default()
    }

    /// Runs for `subscription_id` within the current cooldown window.
    #[must_use]
    pub fn recent_attempts(&self, subscription_id: &str) -> u32 {
        self.inner
            .recent_attempts(subscription_id, self.inner.cache.clock().now())
    }

    /// Subscriptions with at least one logged run.
    #[must_use]
    pub fn tracked_subscriptions(&self) -> usize {
        self.inner.log.len()
    }

    /// How urgently to surface a pending activation to the user.
    #[must_use]
    pub fn concern_level(&self, subscription: &Subscription) -> ConcernLevel {
        if subscription.status != SubscriptionStatus::Incomplete {
            return ConcernLevel::None;
        }

        let inner = &self.inner;
        let now = inner.cache.clock().now();
        ConcernLevel::assess(
            subscription.age(now),
            window(inner.config.stuck_threshold),
            inner.recent_attempts(&subscription.subscription_id, now),
            inner.config.max_recovery_attempts,
        )
    }
}

/// The log record of one recovery run. Settled with the run's outcome, or
/// marked abandoned when the run is dropped before it finishes.
struct Reservation<'a> {
    monitor: &'a Monitor,
    subscription_id: String,
    started_at: DateTime<Utc>,
    settled: bool,
}

impl Reservation<'_> {
    fn settle(mut self, method: RecoveryMethod, error: Option<String>) {
        self.record(method, error);
    }

    fn record(&mut self, method: RecoveryMethod, error: Option<String>) {
        self.settled = true;
        record_recovery(method, error.is_none());

        let Some(mut log) = self.monitor.log.get_mut(&self.subscription_id) else {
            return;
        };
        let pending = log.iter_mut().rev().find(|a| {
            a.timestamp == self.started_at && a.error.as_deref() == Some(IN_PROGRESS)
        });
        if let Some(attempt) = pending {
            attempt.method = method;
            attempt.success = error.is_none();
            attempt.error = error;
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(subscription_id = %self.subscription_id, "recovery run abandoned");
            self.record(RecoveryMethod::Activation, Some(ABANDONED.to_string()));
        }
    }
}

impl Monitor {
    fn is_stuck(&self, subscription: &Subscription, now: DateTime<Utc>) -> bool {
        subscription.status == SubscriptionStatus::Incomplete
            && subscription.age(now) > window(self.config.stuck_threshold)
    }

    fn recent_attempts(&self, subscription_id: &str, now: DateTime<Utc>) -> u32 {
        let since = cutoff(now, self.config.recovery_cooldown);
        self.log.get(subscription_id).map_or(0, |log| {
            let recent = log.iter().filter(|a| a.timestamp > since).count();
            u32::try_from(recent).unwrap_or(u32::MAX)
        })
    }

    /// Drop records older than the retention period, and subscriptions left
    /// with none.
    fn prune(&self, now: DateTime<Utc>) {
        let retained = cutoff(now, self.config.log_retention);
        self.log.retain(|_, log| {
            log.retain(|a| a.timestamp > retained);
            !log.is_empty()
        });
    }

    /// Claim a slot in the cooldown window.
    fn reserve(&self, subscription_id: &str, now: DateTime<Utc>) -> Result<Reservation<'_>, u32> {
        self.prune(now);

        let since = cutoff(now, self.config.recovery_cooldown);
        let mut log = self.log.entry(subscription_id.to_string()).or_default();
        let recent = u32::try_from(log.iter().filter(|a| a.timestamp > since).count())
            .unwrap_or(u32::MAX);
        if recent >= self.config.max_recovery_attempts {
            drop(log);
            self.log.remove_if(subscription_id, |_, log| log.is_empty());
            return Err(recent);
        }

        log.push(RecoveryAttempt {
            subscription_id: subscription_id.to_string(),
            timestamp: now,
            method: RecoveryMethod::Activation,
            success: false,
            error: Some(IN_PROGRESS.to_string()),
        });
        drop(log);

        Ok(Reservation {
            monitor: self,
            subscription_id: subscription_id.to_string(),
            started_at: now,
            settled: false,
        })
    }

    async fn recover(&self, subscription_id: &str) -> RecoveryOutcome {
        let reservation = match self.reserve(subscription_id, self.cache.clock().now()) {
            Ok(reservation) => reservation,
            Err(attempts) => {
                debug!(subscription_id, attempts, "recovery rate limited");
                return RecoveryOutcome::RateLimited { attempts };
            }
        };

        info!(subscription_id, "recovering stuck subscription");
        let activation = self
            .orchestrator
            .activate(&self.user_id, subscription_id)
            .await;

        let outcome = if activation.success {
            Ok(RecoveryMethod::Activation)
        } else {
            debug!(
                subscription_id,
                error = activation.error.as_deref().unwrap_or_default(),
                "activation failed, trying alternative recovery"
            );
            self.alternatives(subscription_id).await
        };

        match outcome {
            Ok(method) => {
                reservation.settle(method, None);
                info!(subscription_id, method = method.as_str(), "subscription recovered");
                RecoveryOutcome::Recovered { method }
            }
            Err((method, error)) => {
                reservation.settle(method, Some(error.clone()));
                warn!(subscription_id, method = method.as_str(), error = %error, "recovery failed");
                RecoveryOutcome::Failed { method, error }
            }
        }
    }

    async fn alternatives(
        &self,
        subscription_id: &str,
    ) -> Result<RecoveryMethod, (RecoveryMethod, String)> {
        match self.functions.force_webhook_processing(subscription_id).await {
            Ok(true) => {
                self.announce_refreshed(subscription_id).await;
                return Ok(RecoveryMethod::ForceWebhook);
            }
            Ok(false) => debug!(subscription_id, "forced webhook reported no success"),
            Err(e) => warn!(subscription_id, error = %e, "forced webhook failed"),
        }

        let last_error = match self.functions.manual_sync(subscription_id).await {
            Ok(true) => {
                self.announce_refreshed(subscription_id).await;
                return Ok(RecoveryMethod::ManualSync);
            }
            Ok(false) => "manual sync reported no success".to_string(),
            Err(e) => format!("manual sync failed: {e}"),
        };

        let activation = self.orchestrator.config();
        let confirmed = match activation.manual_patch {
            ManualPatchPolicy::RequireProcessorConfirmation => {
                processor_confirms(self.functions.as_ref(), subscription_id).await
            }
            ManualPatchPolicy::Disabled | ManualPatchPolicy::Optimistic => false,
        };

        if !activation.manual_patch.allows(confirmed) {
            return Err((RecoveryMethod::ManualSync, last_error));
        }

        match direct_patch(
            self.documents.as_ref(),
            &self.user_id,
            subscription_id,
            &activation.default_price_id,
            self.cache.clock().now(),
        )
        .await
        {
            Ok(subscription) => {
                self.cache
                    .commit(&self.user_id, subscription, CacheSource::Manual)
                    .await;
                Ok(RecoveryMethod::DirectPatch)
            }
            Err(e) => Err((RecoveryMethod::DirectPatch, format!("direct patch failed: {e}"))),
        }
    }

    /// Re-read the document after a processor-side repair and announce the
    /// record if it now shows the subscription as entitled.
    async fn announce_refreshed(&self, subscription_id: &str) {
        let refreshed = self.cache.get(&self.user_id, GetOptions::fresh()).await;
        match refreshed {
            Some(subscription)
                if subscription.subscription_id == subscription_id
                    && subscription.status.is_entitled() =>
            {
                self.cache
                    .commit(&self.user_id, subscription, CacheSource::Document)
                    .await;
            }
            _ => debug!(subscription_id, "document not yet updated after repair"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cutoff_saturates() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(cutoff(now, Duration::from_secs(60)), now - TimeDelta::seconds(60));
        assert_eq!(cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
