//! Authoritative document store
//!
//! The per-user document is written by the webhook processor; this module
//! reads it, writes repairs to its `subscription` field, and watches it for
//! changes.
//!
//! # HTTP contract
//!
//! - `GET    {documents}/users/{user_id}` - the document, 404 when absent
//! - `PUT    {documents}/users/{user_id}/subscription` - overwrite the record
//! - `PATCH  {documents}/users/{user_id}/subscription` - merge, returns the record
//!
//! [`HttpDocumentStore::listen`] polls the document on the configured watch
//! interval and only emits when the document changed.

use std::time::Duration;

use async_trait::async_trait;
use fitsync_types::{Subscription, SubscriptionPatch, UserDocument, UserId};
use reqwest::{Method, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, warn};

use crate::metrics::{record_watch_event, Remote, RequestTimer};
use crate::transport::{error_from_response, join_url, HttpTransport};
use crate::{ClientConfig, ClientError, Result};

/// One watch notification: the current document, or the error that ended the watch.
pub type WatchEvent = Result<Option<UserDocument>>;

/// Capacity of the watch event buffer
const WATCH_BUFFER: usize = 16;

/// Document store operations
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the user's document, `None` if it does not exist
    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserDocument>>;

    /// Overwrite the document's subscription record
    async fn set_subscription(&self, user_id: &UserId, subscription: &Subscription) -> Result<()>;

    /// Merge a patch into the subscription record and return the merged record
    async fn merge_subscription(
        &self,
        user_id: &UserId,
        patch: &SubscriptionPatch,
    ) -> Result<Subscription>;

    /// Watch the user's document.
    ///
    /// The watch yields the current snapshot first, then every change.
    async fn listen(&self, user_id: &UserId) -> Result<DocumentWatch>;
}

/// Live subscription to a user document.
///
/// An `Err` event is terminal: the watch yields nothing after it. Dropping
/// the watch stops the underlying listener.
#[derive(Debug)]
pub struct DocumentWatch {
    events: mpsc::Receiver<WatchEvent>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl DocumentWatch {
    /// Wrap a receiver of watch events
    #[must_use]
    pub fn new(events: mpsc::Receiver<WatchEvent>) -> Self {
        Self {
            events,
            task: None,
            closed: false,
        }
    }

    /// A bounded channel feeding a new watch
    #[must_use]
    pub fn channel() -> (mpsc::Sender<WatchEvent>, Self) {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        (tx, Self::new(rx))
    }

    /// Tie the lifetime of a producer task to the watch
    #[must_use]
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Wait for the next event; `None` once the watch has ended.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        if self.closed {
            return None;
        }
        match self.events.recv().await {
            Some(Ok(doc)) => Some(Ok(doc)),
            Some(Err(e)) => {
                self.close();
                Some(Err(e))
            }
            None => {
                self.closed = true;
                None
            }
        }
    }

    /// Stop the watch
    pub fn close(&mut self) {
        self.closed = true;
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DocumentWatch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// HTTP document store client
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    transport: HttpTransport,
    endpoint: String,
    watch_interval: Duration,
}

impl HttpDocumentStore {
    /// Create a document store client
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            transport: HttpTransport::new(config)?,
            endpoint: config.documents_endpoint.clone(),
            watch_interval: config.watch_interval,
        })
    }

    async fn fetch(transport: &HttpTransport, endpoint: &str, user_id: &UserId) -> WatchEvent {
        let url = join_url(endpoint, &["users", user_id.as_str()])?;
        let timer = RequestTimer::start(Remote::Documents, "get_user");

        let result: WatchEvent = async {
            let response = transport.request(Method::GET, url).send().await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                s if s.is_success() => Ok(Some(response.json::<UserDocument>().await?)),
                _ => Err(error_from_response(response).await),
            }
        }
        .await;

        timer.finish(result)
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    #[instrument(skip(self), level = "debug")]
    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserDocument>> {
        Self::fetch(&self.transport, &self.endpoint, user_id).await
    }

    #[instrument(skip(self, subscription), level = "debug", fields(subscription_id = %subscription.subscription_id))]
    async fn set_subscription(&self, user_id: &UserId, subscription: &Subscription) -> Result<()> {
        let url = join_url(&self.endpoint, &["users", user_id.as_str(), "subscription"])?;
        let timer = RequestTimer::start(Remote::Documents, "set_subscription");

        let result: Result<()> = async {
            let response = self
                .transport
                .request(Method::PUT, url)
                .json(subscription)
                .send()
                .await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(error_from_response(response).await)
            }
        }
        .await;

        timer.finish(result)
    }

    #[instrument(skip(self, patch), level = "debug")]
    async fn merge_subscription(
        &self,
        user_id: &UserId,
        patch: &SubscriptionPatch,
    ) -> Result<Subscription> {
        let url = join_url(&self.endpoint, &["users", user_id.as_str(), "subscription"])?;
        let timer = RequestTimer::start(Remote::Documents, "merge_subscription");

        let result: Result<Subscription> = async {
            let response = self
                .transport
                .request(Method::PATCH, url)
                .json(patch)
                .send()
                .await?;
            if response.status().is_success() {
                Ok(response.json::<Subscription>().await?)
            } else {
                Err(error_from_response(response).await)
            }
        }
        .await;

        timer.finish(result)
    }

    #[instrument(skip(self), level = "debug")]
    async fn listen(&self, user_id: &UserId) -> Result<DocumentWatch> {
        let (tx, watch) = DocumentWatch::channel();
        let transport = self.transport.clone();
        let endpoint = self.endpoint.clone();
        let interval = self.watch_interval;
        let user_id = user_id.clone();

        let task = tokio::spawn(async move {
            let mut last: Option<Option<UserDocument>> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match Self::fetch(&transport, &endpoint, &user_id).await {
                    Ok(doc) => {
                        if last.as_ref() == Some(&doc) {
                            continue;
                        }
                        last = Some(doc.clone());
                        record_watch_event("change");
                        if tx.send(Ok(doc)).await.is_err() {
                            debug!(user_id = %user_id, "watch receiver dropped");
                            break;
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(user_id = %user_id, error = %e, "transient watch error, polling again");
                    }
                    Err(e) => {
                        record_watch_event("error");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }

            record_watch_event("closed");
        });

        Ok(watch.with_task(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_ends_after_error() {
        let (tx, mut watch) = DocumentWatch::channel();
        tx.send(Ok(None)).await.unwrap();
        tx.send(Err(ClientError::PermissionDenied("revoked".to_string())))
            .await
            .unwrap();
        tx.send(Ok(None)).await.ok();

        assert!(matches!(watch.next().await, Some(Ok(None))));
        assert!(matches!(watch.next().await, Some(Err(ClientError::PermissionDenied(_)))));
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_ends_when_sender_dropped() {
        let (tx, mut watch) = DocumentWatch::channel();
        drop(tx);
        assert!(watch.next().await.is_none());
    }
}
