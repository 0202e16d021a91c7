//! Persistence cache layer
//!
//! One cached record per user, backed by three layers that are consulted in
//! order when the in-memory entry is missing or stale:
//!
//! 1. the in-memory entry, when valid and younger than the TTL
//! 2. the authoritative document, retried with a fixed delay
//! 3. the payment processor, re-verifying the last known subscription ID
//! 4. the local-storage snapshot, when no older than `local_max_age`
//!
//! Every layer that answers refreshes the in-memory entry and the snapshot.
//!
//! # Usage
//!
//! ```ignore
//! let cache = SubscriptionCache::new(documents, functions, storage, notifier, CacheConfig::default());
//!
//! // First call reads the document
//! let sub = cache.get(&user, GetOptions::default()).await;
//!
//! // Calls within the TTL return the cached record
//! let again = cache.get(&user, GetOptions::default()).await;
//! ```

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use fitsync_client::{
    with_retry, DocumentStore, LocalStore, PaymentFunctions, RetryConfig,
    SUBSCRIPTION_SNAPSHOT_KEY,
};
use fitsync_types::{
    CacheEntry, CacheSource, Subscription, SubscriptionPatch, SyncMessage, TypesError, UserId,
};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{ReconcileError, Result};
use crate::metrics::{record_cache_hit, record_cache_miss};
use crate::notify::{ListenerHandle, NotificationPort};

/// Options for [`SubscriptionCache::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// Skip the in-memory entry even when it is fresh.
    pub force_refresh: bool,
    /// Consult the in-memory entry at all.
    pub use_cache: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            use_cache: true,
        }
    }
}

impl GetOptions {
    /// Bypass the in-memory entry.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            force_refresh: true,
            use_cache: true,
        }
    }
}

/// The record mirrored to local storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MirroredSnapshot {
    user_id: UserId,
    subscription: Subscription,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    saved_at: DateTime<Utc>,
}

/// Subscription cache with a local-storage mirror.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct SubscriptionCache {
    documents: Arc<dyn DocumentStore>,
    functions: Arc<dyn PaymentFunctions>,
    storage: Arc<dyn LocalStore>,
    notifier: Arc<dyn NotificationPort>,
    entries: Cache<UserId, CacheEntry>,
    config: CacheConfig,
    clock: Clock,
}

impl std::fmt::Debug for SubscriptionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCache")
            .field("config", &self.config)
            .field("entries", &self.entries.entry_count())
            .finish_non_exhaustive()
    }
}

impl SubscriptionCache {
    /// Create a cache over the given ports.
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        functions: Arc<dyn PaymentFunctions>,
        storage: Arc<dyn LocalStore>,
        notifier: Arc<dyn NotificationPort>,
        config: CacheConfig,
    ) -> Self {
        // Staleness is judged against `Clock`, so moka only bounds the size.
        // Stale entries are kept as the last known record for re-verification.
        let entries = Cache::builder().max_capacity(config.max_entries).build();

        Self {
            documents,
            functions,
            storage,
            notifier,
            entries,
            config,
            clock: Clock::system(),
        }
    }

    /// Use a specific clock for record timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> Clock {
        self.clock
    }

    /// Look up the user's subscription, falling through the layers in order.
    ///
    /// Returns `None` only when every layer failed.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, user_id: &UserId, options: GetOptions) -> Option<Subscription> {
        if options.use_cache && !options.force_refresh {
            if let Some(entry) = self.valid_entry(user_id).await {
                trace!(source = entry.source.as_str(), "subscription cache hit");
                record_cache_hit(entry.source);
                return Some(entry.data);
            }
        }

        let answered = self.fetch_through_layers(user_id).await;
        record_cache_miss(answered.as_ref().map(|(_, source)| *source));
        answered.map(|(subscription, _)| subscription)
    }

    async fn fetch_through_layers(&self, user_id: &UserId) -> Option<(Subscription, CacheSource)> {
        match self.fetch_document(user_id).await {
            Ok(Some(subscription)) => {
                self.put(user_id, subscription.clone(), CacheSource::Document)
                    .await;
                return Some((subscription, CacheSource::Document));
            }
            Ok(None) => debug!(user_id = %user_id, "document holds no subscription"),
            Err(e) => warn!(user_id = %user_id, error = %e, "document fetch failed"),
        }

        if let Some(subscription) = self.reverify_with_processor(user_id).await {
            self.put(user_id, subscription.clone(), CacheSource::Processor)
                .await;
            return Some((subscription, CacheSource::Processor));
        }

        if let Some(snapshot) = self.recent_snapshot(user_id) {
            debug!(user_id = %user_id, saved_at = %snapshot.saved_at, "serving local snapshot");
            // memory only: rewriting the snapshot would reset its saved_at
            let entry = CacheEntry::new(snapshot.subscription.clone(), CacheSource::Cache, self.clock.now());
            self.entries.insert(user_id.clone(), entry).await;
            return Some((snapshot.subscription, CacheSource::Cache));
        }

        None
    }

    async fn fetch_document(&self, user_id: &UserId) -> Result<Option<Subscription>> {
        let retry = RetryConfig::fixed(
            self.config.max_retries.saturating_sub(1),
            self.config.retry_delay,
        );
        let doc = with_retry(retry, || self.documents.get_user(user_id)).await?;
        Ok(doc.and_then(|d| d.subscription))
    }

    /// Ask the processor about the last known subscription ID. A no-op when
    /// no record was ever seen for this user.
    async fn reverify_with_processor(&self, user_id: &UserId) -> Option<Subscription> {
        let known = self.last_known(user_id).await?;
        if known.subscription_id.is_empty() {
            return None;
        }

        match self.functions.get_status(&known.subscription_id).await {
            Ok(status) if status.id == known.subscription_id => {
                debug!(
                    subscription_id = %status.id,
                    status = %status.status,
                    "processor re-verified subscription"
                );
                Some(Subscription {
                    status: status.status,
                    updated_at: self.clock.now(),
                    ..known
                })
            }
            Ok(status) => {
                warn!(
                    expected = %known.subscription_id,
                    reported = %status.id,
                    "processor reported a different subscription"
                );
                None
            }
            Err(e) => {
                warn!(subscription_id = %known.subscription_id, error = %e, "processor re-verification failed");
                None
            }
        }
    }

    async fn last_known(&self, user_id: &UserId) -> Option<Subscription> {
        match self.entries.get(user_id).await {
            Some(entry) => Some(entry.data),
            None => self.read_snapshot(user_id).map(|s| s.subscription),
        }
    }

    /// Merge `patch` into the stored record for `subscription_id`.
    ///
    /// The patch is stamped with a fresh `updatedAt`, validated against the
    /// stored record, written to the document, then cached, mirrored and
    /// broadcast. Returns `false` on any failure; nothing is rolled back.
    #[instrument(skip(self, patch), level = "debug")]
    pub async fn force_update(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> bool {
        match self.try_force_update(user_id, subscription_id, patch).await {
            Ok(merged) => {
                debug!(status = %merged.status, "forced subscription update");
                true
            }
            Err(e) => {
                warn!(user_id = %user_id, subscription_id, error = %e, "forced update failed");
                false
            }
        }
    }

    async fn try_force_update(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> Result<Subscription> {
        let current = self
            .documents
            .get_user(user_id)
            .await?
            .and_then(|d| d.subscription)
            .ok_or_else(|| ReconcileError::NoSubscription(user_id.to_string()))?;

        if current.subscription_id != subscription_id {
            return Err(TypesError::SubscriptionMismatch {
                stored: current.subscription_id,
                target: subscription_id.to_string(),
            }
            .into());
        }

        let patch = patch.stamped(self.clock.now());
        patch.validate(Some(&current))?;

        let merged = self.documents.merge_subscription(user_id, &patch).await?;
        self.commit(user_id, merged.clone(), CacheSource::Manual).await;
        Ok(merged)
    }

    /// Follow the user's document, keeping the cache current.
    ///
    /// `callback` receives the new record (or `None` when the document holds
    /// none) on every change. When the listener fails it receives the cached
    /// record if that is still fresh, otherwise `None`.
    pub async fn setup_listener<F>(&self, user_id: &UserId, callback: F) -> ListenerHandle
    where
        F: Fn(Option<Subscription>) + Send + Sync + 'static,
    {
        let cache = self.clone();
        let user_id = user_id.clone();

        let task = tokio::spawn(async move {
            let mut watch = match cache.documents.listen(&user_id).await {
                Ok(watch) => watch,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "failed to attach document listener");
                    callback(cache.valid_entry(&user_id).await.map(|entry| entry.data));
                    return;
                }
            };

            while let Some(event) = watch.next().await {
                match event {
                    Ok(doc) => match doc.and_then(|d| d.subscription) {
                        Some(subscription) => {
                            cache
                                .put(&user_id, subscription.clone(), CacheSource::Document)
                                .await;
                            callback(Some(subscription));
                        }
                        None => {
                            cache.clear(&user_id).await;
                            callback(None);
                        }
                    },
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "document listener failed");
                        callback(cache.valid_entry(&user_id).await.map(|entry| entry.data));
                    }
                }
            }
        });

        ListenerHandle::new(task)
    }

    /// Store a reconciled record and announce it.
    pub async fn commit(&self, user_id: &UserId, subscription: Subscription, source: CacheSource) {
        self.put(user_id, subscription.clone(), source).await;
        self.notifier
            .notify(&SyncMessage::subscription_updated(subscription));
    }

    /// Store a record in memory and in the local snapshot, without announcing it.
    pub async fn put(&self, user_id: &UserId, subscription: Subscription, source: CacheSource) {
        let now = self.clock.now();
        self.write_snapshot(user_id, &subscription, now);
        self.entries
            .insert(user_id.clone(), CacheEntry::new(subscription, source, now))
            .await;
    }

    /// The in-memory entry, fresh or not.
    pub async fn entry(&self, user_id: &UserId) -> Option<CacheEntry> {
        self.entries.get(user_id).await
    }

    /// Mark the user's entry invalid. The record stays available for
    /// processor re-verification but is no longer served.
    pub async fn invalidate(&self, user_id: &UserId) {
        if let Some(mut entry) = self.entries.get(user_id).await {
            entry.valid = false;
            self.entries.insert(user_id.clone(), entry).await;
        }
    }

    /// Drop the user's entry and, if it belongs to them, the local snapshot.
    pub async fn clear(&self, user_id: &UserId) {
        self.entries.invalidate(user_id).await;
        if self.read_snapshot(user_id).is_some() {
            self.remove_snapshot();
        }
    }

    /// Drop every entry and the local snapshot.
    pub fn clear_all(&self) {
        self.entries.invalidate_all();
        self.remove_snapshot();
    }

    async fn valid_entry(&self, user_id: &UserId) -> Option<CacheEntry> {
        self.entries
            .get(user_id)
            .await
            .filter(|entry| entry.is_fresh(self.config.ttl, self.clock.now()))
    }

    fn recent_snapshot(&self, user_id: &UserId) -> Option<MirroredSnapshot> {
        let max_age = TimeDelta::from_std(self.config.local_max_age).unwrap_or(TimeDelta::MAX);
        let now = self.clock.now();
        self.read_snapshot(user_id)
            .filter(|snapshot| now - snapshot.saved_at <= max_age)
    }

    fn read_snapshot(&self, user_id: &UserId) -> Option<MirroredSnapshot> {
        let raw = match self.storage.get(SUBSCRIPTION_SNAPSHOT_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "failed to read local snapshot");
                return None;
            }
        };

        match serde_json::from_str::<MirroredSnapshot>(&raw) {
            Ok(snapshot) if snapshot.user_id == *user_id => Some(snapshot),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "discarding unreadable local snapshot");
                None
            }
        }
    }

    fn write_snapshot(&self, user_id: &UserId, subscription: &Subscription, now: DateTime<Utc>) {
        let snapshot = MirroredSnapshot {
            user_id: user_id.clone(),
            subscription: subscription.clone(),
            saved_at: now,
        };

        let written = serde_json::to_string(&snapshot)
            .map_err(ReconcileError::from)
            .and_then(|raw| {
                self.storage
                    .set(SUBSCRIPTION_SNAPSHOT_KEY, &raw)
                    .map_err(ReconcileError::from)
            });
        if let Err(e) = written {
            warn!(error = %e, "failed to mirror subscription locally");
        }
    }

    fn remove_snapshot(&self) {
        if let Err(e) = self.storage.remove(SUBSCRIPTION_SNAPSHOT_KEY) {
            warn!(error = %e, "failed to remove local snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fitsync_types::SubscriptionStatus;

    #[test]
    fn test_snapshot_wire_format() {
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let snapshot = MirroredSnapshot {
            user_id: UserId::from("user1"),
            subscription: Subscription::new("sub_1", "cus_1", SubscriptionStatus::Active, at),
            saved_at: at,
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["userId"], "user1");
        assert_eq!(json["savedAt"], at.timestamp_millis());
        assert_eq!(json["subscription"]["subscriptionId"], "sub_1");
    }

    #[test]
    fn test_get_options() {
        let default = GetOptions::default();
        assert!(default.use_cache);
        assert!(!default.force_refresh);
        assert!(GetOptions::fresh().force_refresh);
    }
}
