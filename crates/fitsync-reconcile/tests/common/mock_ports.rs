//! In-memory ports for testing

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fitsync_client::{
    ClientError, DocumentStore, DocumentWatch, PaymentFunctions, ProcessorStatus, Result,
};
use fitsync_types::{Subscription, SubscriptionPatch, SubscriptionStatus, UserDocument, UserId};
use tokio::sync::watch;

/// Test user ID
#[allow(dead_code)]
pub fn user() -> UserId {
    UserId::new("user_1")
}

/// A record with the given ID and status, last written at `updated_at`.
///
/// Timestamps are truncated to whole milliseconds, the wire precision, so
/// the record survives a broadcast round trip unchanged.
#[allow(dead_code)]
pub fn subscription(id: &str, status: SubscriptionStatus, updated_at: DateTime<Utc>) -> Subscription {
    let updated_at = DateTime::from_timestamp_millis(updated_at.timestamp_millis()).unwrap_or(updated_at);
    Subscription::new(id, "cus_1", status, updated_at)
}

#[derive(Default)]
struct Calls {
    get: AtomicU32,
    set: AtomicU32,
    merge: AtomicU32,
    listen: AtomicU32,
}

/// In-memory document store with live watches
#[derive(Default, Clone)]
pub struct MockDocumentStore {
    documents: Arc<DashMap<UserId, watch::Sender<Option<UserDocument>>>>,
    calls: Arc<Calls>,
    fail_reads: Arc<AtomicBool>,
    fail_listen: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl MockDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the user's document, notifying every watch
    pub fn put(&self, user_id: &UserId, doc: Option<UserDocument>) {
        self.documents
            .entry(user_id.clone())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(doc);
    }

    /// Replace the user's subscription record
    pub fn put_subscription(&self, user_id: &UserId, subscription: Subscription) {
        self.put(user_id, Some(UserDocument::with_subscription(subscription)));
    }

    /// Modify the stored record in place, as the webhook processor would
    pub fn update(&self, user_id: &UserId, change: impl FnOnce(&mut Subscription)) {
        let mut doc = self.document(user_id).unwrap_or_default();
        if let Some(subscription) = doc.subscription.as_mut() {
            change(subscription);
        }
        self.put(user_id, Some(doc));
    }

    pub fn document(&self, user_id: &UserId) -> Option<UserDocument> {
        self.documents
            .get(user_id)
            .and_then(|sender| sender.borrow().clone())
    }

    pub fn stored(&self, user_id: &UserId) -> Option<Subscription> {
        self.document(user_id).and_then(|doc| doc.subscription)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_listen(&self, fail: bool) {
        self.fail_listen.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> u32 {
        self.calls.get.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> u32 {
        self.calls.set.load(Ordering::SeqCst)
    }

    pub fn merge_calls(&self) -> u32 {
        self.calls.merge.load(Ordering::SeqCst)
    }

    pub fn listen_calls(&self) -> u32 {
        self.calls.listen.load(Ordering::SeqCst)
    }

    fn subscribe(&self, user_id: &UserId) -> watch::Receiver<Option<UserDocument>> {
        self.documents
            .entry(user_id.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ClientError::PermissionDenied("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserDocument>> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("document store offline".to_string()));
        }
        Ok(self.document(user_id))
    }

    async fn set_subscription(&self, user_id: &UserId, subscription: &Subscription) -> Result<()> {
        self.calls.set.fetch_add(1, Ordering::SeqCst);
        self.check_writes()?;

        let mut doc = self.document(user_id).unwrap_or_default();
        doc.subscription = Some(subscription.clone());
        self.put(user_id, Some(doc));
        Ok(())
    }

    async fn merge_subscription(
        &self,
        user_id: &UserId,
        patch: &SubscriptionPatch,
    ) -> Result<Subscription> {
        self.calls.merge.fetch_add(1, Ordering::SeqCst);
        self.check_writes()?;

        let mut doc = self
            .document(user_id)
            .ok_or_else(|| ClientError::NotFound(format!("users/{user_id}")))?;
        let subscription = doc
            .subscription
            .as_mut()
            .ok_or_else(|| ClientError::NotFound(format!("users/{user_id}/subscription")))?;
        patch.apply_to(subscription);

        let merged = subscription.clone();
        self.put(user_id, Some(doc));
        Ok(merged)
    }

    async fn listen(&self, user_id: &UserId) -> Result<DocumentWatch> {
        self.calls.listen.fetch_add(1, Ordering::SeqCst);
        if self.fail_listen.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("listener offline".to_string()));
        }

        let mut changes = self.subscribe(user_id);
        let (events, watch) = DocumentWatch::channel();
        let task = tokio::spawn(async move {
            let current = changes.borrow_and_update().clone();
            if events.send(Ok(current)).await.is_err() {
                return;
            }
            while changes.changed().await.is_ok() {
                let doc = changes.borrow_and_update().clone();
                if events.send(Ok(doc)).await.is_err() {
                    break;
                }
            }
        });
        Ok(watch.with_task(task))
    }
}

/// Scripted payment processor callables
#[derive(Default, Clone)]
pub struct MockPaymentFunctions {
    statuses: Arc<DashMap<String, SubscriptionStatus>>,
    force_webhook_succeeds: Arc<AtomicBool>,
    manual_sync_succeeds: Arc<AtomicBool>,
    replay: Option<(MockDocumentStore, UserId)>,
    panic_on_status: Arc<AtomicBool>,
    reported_id: Arc<DashMap<String, String>>,
    status_calls: Arc<AtomicU32>,
    force_calls: Arc<AtomicU32>,
    sync_calls: Arc<AtomicU32>,
}

#[allow(dead_code)]
impl MockPaymentFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful webhook replays and syncs copy the processor status into
    /// `store`, as the real callables do.
    pub fn replaying_into(mut self, store: MockDocumentStore, user_id: UserId) -> Self {
        self.replay = Some((store, user_id));
        self
    }

    /// Status the processor reports for `subscription_id`
    pub fn set_status(&self, subscription_id: &str, status: SubscriptionStatus) {
        self.statuses.insert(subscription_id.to_string(), status);
    }

    /// The next status call panics, as a broken port would
    pub fn panic_on_next_status(&self) {
        self.panic_on_status.store(true, Ordering::SeqCst);
    }

    /// Answer status calls for `asked` as if they were about `reported`
    pub fn misreport_id(&self, asked: &str, reported: &str) {
        self.reported_id.insert(asked.to_string(), reported.to_string());
    }

    pub fn force_webhook_succeeds(&self, succeeds: bool) {
        self.force_webhook_succeeds.store(succeeds, Ordering::SeqCst);
    }

    pub fn manual_sync_succeeds(&self, succeeds: bool) {
        self.manual_sync_succeeds.store(succeeds, Ordering::SeqCst);
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn force_calls(&self) -> u32 {
        self.force_calls.load(Ordering::SeqCst)
    }

    pub fn sync_calls(&self) -> u32 {
        self.sync_calls.load(Ordering::SeqCst)
    }

    fn replay(&self, subscription_id: &str) {
        let Some((store, user_id)) = &self.replay else {
            return;
        };
        let Some(status) = self.statuses.get(subscription_id).map(|s| *s) else {
            return;
        };
        store.update(user_id, |subscription| {
            if subscription.subscription_id == subscription_id {
                subscription.status = status;
            }
        });
    }
}

#[async_trait]
impl PaymentFunctions for MockPaymentFunctions {
    async fn get_status(&self, subscription_id: &str) -> Result<ProcessorStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_status.swap(false, Ordering::SeqCst) {
            panic!("status port crashed");
        }
        let status = self
            .statuses
            .get(subscription_id)
            .map(|s| *s)
            .ok_or_else(|| ClientError::NotFound(format!("subscription {subscription_id}")))?;
        let id = self
            .reported_id
            .get(subscription_id)
            .map_or_else(|| subscription_id.to_string(), |id| id.clone());
        Ok(ProcessorStatus { id, status })
    }

    async fn force_webhook_processing(&self, subscription_id: &str) -> Result<bool> {
        self.force_calls.fetch_add(1, Ordering::SeqCst);
        let succeeded = self.force_webhook_succeeds.load(Ordering::SeqCst);
        if succeeded {
            self.replay(subscription_id);
        }
        Ok(succeeded)
    }

    async fn manual_sync(&self, subscription_id: &str) -> Result<bool> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        let succeeded = self.manual_sync_succeeds.load(Ordering::SeqCst);
        if succeeded {
            self.replay(subscription_id);
        }
        Ok(succeeded)
    }
}
