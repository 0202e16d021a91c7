//! Notification ports
//!
//! Reconciled records are pushed to other open sessions and to the
//! background worker through [`NotificationPort`]. Delivery is best-effort:
//! a port with nobody listening drops the message silently.
//!
//! - [`NoopPort`] - discards everything
//! - [`BroadcastChannel`] - same-origin bus of JSON frames; every listener,
//!   the emitter's own included, receives each frame
//! - [`WorkerPort`] - fire-and-forget messages to a background worker
//! - [`FanOut`] - several ports at once

use std::sync::Arc;

use fitsync_types::SyncMessage;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Default capacity of a broadcast channel
const BROADCAST_CAPACITY: usize = 64;

/// Sink for subscription change notifications.
pub trait NotificationPort: Send + Sync {
    /// Deliver a message; never fails.
    fn notify(&self, message: &SyncMessage);
}

/// Port that drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPort;

impl NotificationPort for NoopPort {
    fn notify(&self, _message: &SyncMessage) {}
}

/// Handle to a background listener; dropping it unsubscribes.
#[derive(Debug)]
pub struct ListenerHandle {
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Stop listening.
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    /// Whether the listener task has ended on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cross-context bus carrying serialized [`SyncMessage`] frames.
///
/// Clones share the same bus.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    frames: broadcast::Sender<String>,
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(BROADCAST_CAPACITY)
    }
}

impl BroadcastChannel {
    /// Create a bus buffering up to `capacity` frames per slow listener.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (frames, _) = broadcast::channel(capacity.max(1));
        Self { frames }
    }

    /// Publish a message to every current listener.
    pub fn publish(&self, message: &SyncMessage) {
        match message.to_frame() {
            Ok(frame) => self.publish_frame(frame),
            Err(e) => warn!(error = %e, "failed to encode sync message"),
        }
    }

    /// Publish a raw frame. Other sessions may write anything to the bus.
    pub fn publish_frame(&self, frame: impl Into<String>) {
        if self.frames.send(frame.into()).is_err() {
            trace!("broadcast without listeners");
        }
    }

    /// Number of attached listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.frames.receiver_count()
    }

    /// Call `callback` for every well-formed message published from now on.
    ///
    /// Malformed frames are skipped. Must be called within a tokio runtime.
    pub fn listen<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(SyncMessage) + Send + Sync + 'static,
    {
        let mut frames = self.frames.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => match SyncMessage::from_frame(&frame) {
                        Some(message) => callback(message),
                        None => debug!("ignoring malformed sync frame"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync listener lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        ListenerHandle::new(task)
    }
}

impl NotificationPort for BroadcastChannel {
    fn notify(&self, message: &SyncMessage) {
        self.publish(message);
    }
}

/// Fire-and-forget messages to a background worker.
#[derive(Debug, Clone)]
pub struct WorkerPort {
    worker: mpsc::UnboundedSender<SyncMessage>,
}

impl WorkerPort {
    /// Create a port and the receiving end the worker drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncMessage>) {
        let (worker, rx) = mpsc::unbounded_channel();
        (Self { worker }, rx)
    }
}

impl NotificationPort for WorkerPort {
    fn notify(&self, message: &SyncMessage) {
        if self.worker.send(message.clone()).is_err() {
            trace!("no background worker registered");
        }
    }
}

/// Delivers each message to every inner port, in order.
#[derive(Clone, Default)]
pub struct FanOut {
    ports: Vec<Arc<dyn NotificationPort>>,
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("ports", &self.ports.len())
            .finish()
    }
}

impl FanOut {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port.
    #[must_use]
    pub fn with(mut self, port: Arc<dyn NotificationPort>) -> Self {
        self.ports.push(port);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl NotificationPort for FanOut {
    fn notify(&self, message: &SyncMessage) {
        for port in &self.ports {
            port.notify(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fitsync_types::{Subscription, SubscriptionStatus};
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn message(status: SubscriptionStatus) -> SyncMessage {
        SyncMessage::subscription_updated(Subscription::new("sub_1", "cus_1", status, Utc::now()))
    }

    #[tokio::test]
    async fn test_broadcast_skips_malformed_frames() {
        let channel = BroadcastChannel::default();
        let (tx, mut rx) = unbounded_channel();
        let _handle = channel.listen(move |m| {
            let _ = tx.send(m);
        });

        channel.publish_frame("not json");
        channel.publish_frame(r#"{"type":"SOMETHING_ELSE","subscription":{}}"#);
        channel.publish_frame(r#"{"type":"SUBSCRIPTION_UPDATED"}"#);
        channel.publish(&message(SubscriptionStatus::Active));

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.subscription().status, SubscriptionStatus::Active);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_detaches_listener() {
        let channel = BroadcastChannel::default();
        let handle = channel.listen(|_| {});
        assert_eq!(channel.listener_count(), 1);

        handle.unsubscribe();
        for _ in 0..10 {
            if channel.listener_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(channel.listener_count(), 0);
    }

    #[test]
    fn test_worker_port_without_worker_is_silent() {
        let (port, rx) = WorkerPort::channel();
        drop(rx);
        port.notify(&message(SubscriptionStatus::Active));
    }

    #[test]
    fn test_fan_out_reaches_every_port() {
        let (first, mut first_rx) = WorkerPort::channel();
        let (second, mut second_rx) = WorkerPort::channel();
        let fan_out = FanOut::new()
            .with(Arc::new(first))
            .with(Arc::new(NoopPort))
            .with(Arc::new(second));

        fan_out.notify(&message(SubscriptionStatus::Trialing));

        assert_eq!(fan_out.len(), 3);
        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_ok());
    }
}
