//! Sync and poll primitives
//!
//! Polling of the authoritative document with exponential backoff, a single
//! immediate refresh, and broadcast/listen over the cross-context bus.

use std::sync::Arc;

use fitsync_client::DocumentStore;
use fitsync_types::{CacheSource, Subscription, SubscriptionStatus, SyncMessage, UserId};
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

use crate::cache::SubscriptionCache;
use crate::config::PollOptions;
use crate::metrics::record_poll_attempt;
use crate::notify::{BroadcastChannel, ListenerHandle, NotificationPort};

/// Polling and broadcast helpers over one document store.
#[derive(Clone)]
pub struct SubscriptionSync {
    documents: Arc<dyn DocumentStore>,
    cache: SubscriptionCache,
    channel: BroadcastChannel,
    notifier: Arc<dyn NotificationPort>,
}

impl std::fmt::Debug for SubscriptionSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSync")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl SubscriptionSync {
    /// Create sync helpers that broadcast on `channel`.
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        cache: SubscriptionCache,
        channel: BroadcastChannel,
    ) -> Self {
        let notifier: Arc<dyn NotificationPort> = Arc::new(channel.clone());
        Self {
            documents,
            cache,
            channel,
            notifier,
        }
    }

    /// Broadcast through `notifier` instead of the bare channel.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationPort>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Fetch the document until its status equals `expected`.
    ///
    /// Waits `min(initial_delay * backoff_multiplier^i, max_delay)` after
    /// fetch `i`. Gives up after `max_attempts` fetches or once `timeout`
    /// has elapsed, whichever comes first.
    #[instrument(skip(self, options), level = "debug")]
    pub async fn poll_status(
        &self,
        user_id: &UserId,
        expected: SubscriptionStatus,
        options: &PollOptions,
    ) -> Option<Subscription> {
        let polling = async {
            for attempt in 0..options.max_attempts {
                record_poll_attempt();
                if let Some(subscription) = self.refresh_now(user_id).await {
                    if subscription.status == expected {
                        debug!(attempt, "poll reached expected status");
                        return Some(subscription);
                    }
                    debug!(attempt, status = %subscription.status, "status not reached yet");
                }

                if attempt + 1 < options.max_attempts {
                    sleep(options.delay_for_attempt(attempt)).await;
                }
            }
            None
        };

        match timeout(options.timeout, polling).await {
            Ok(result) => result,
            Err(_) => {
                debug!(timeout_ms = options.timeout.as_millis() as u64, "poll timed out");
                None
            }
        }
    }

    /// One document fetch, no retry. Updates the cache on success.
    #[instrument(skip(self), level = "debug")]
    pub async fn refresh_now(&self, user_id: &UserId) -> Option<Subscription> {
        match self.documents.get_user(user_id).await {
            Ok(doc) => {
                let subscription = doc.and_then(|d| d.subscription)?;
                self.cache
                    .put(user_id, subscription.clone(), CacheSource::Document)
                    .await;
                Some(subscription)
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "refresh failed");
                None
            }
        }
    }

    /// Wait until the subscription is active or trialing.
    ///
    /// Returns at once when the current record is already entitled. Otherwise
    /// polls for `active`, broadcasting the record when it arrives, and makes
    /// one last refresh after the poll gives up.
    #[instrument(skip(self, options), level = "debug")]
    pub async fn wait_for_activation(
        &self,
        user_id: &UserId,
        options: &PollOptions,
    ) -> Option<Subscription> {
        if let Some(current) = self.refresh_now(user_id).await {
            if current.status.is_entitled() {
                return Some(current);
            }
        }

        if let Some(active) = self
            .poll_status(user_id, SubscriptionStatus::Active, options)
            .await
        {
            self.broadcast(&active);
            return Some(active);
        }

        let last = self
            .refresh_now(user_id)
            .await
            .filter(|s| s.status.is_entitled())?;
        self.broadcast(&last);
        Some(last)
    }

    /// Announce a record to every open session and the background worker.
    pub fn broadcast(&self, subscription: &Subscription) {
        self.notifier
            .notify(&SyncMessage::subscription_updated(subscription.clone()));
    }

    /// Receive records broadcast by any session, this one included.
    pub fn listen<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(Subscription) + Send + Sync + 'static,
    {
        self.channel.listen(move |message| match message {
            SyncMessage::SubscriptionUpdated { subscription } => callback(subscription),
        })
    }
}
