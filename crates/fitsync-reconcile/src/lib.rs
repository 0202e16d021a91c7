//! fitsync Reconcile - subscription state reconciliation
//!
//! Keeps a locally observed subscription consistent with the payment
//! processor's record across webhook delays, restarts, several open sessions
//! and stale caches.
//!
//! - [`SubscriptionCache`] - in-memory TTL cache with a local-storage mirror
//!   and a real-time listener wrapper
//! - [`SubscriptionSync`] - backoff polling, immediate refresh and
//!   cross-context broadcast
//! - [`ActivationOrchestrator`] - webhook wait, processor verification and
//!   the gated direct patch, one in-flight attempt per subscription
//! - [`RecoveryMonitor`] - periodic scan for stuck subscriptions with a
//!   rate-limited fallback chain
//! - [`Reconciler`] - composition root owning the lifecycle of all of the above
//!
//! # Example
//!
//! ```ignore
//! use fitsync_reconcile::{Reconciler, ReconcileConfig};
//!
//! let reconciler = Reconciler::builder()
//!     .documents(documents)
//!     .functions(functions)
//!     .storage(storage)
//!     .config(ReconcileConfig::default())
//!     .build(user_id)?;
//!
//! reconciler.start().await;
//! let result = reconciler.activate("sub_123").await;
//! if !result.success {
//!     tracing::warn!(error = ?result.error, "activation did not converge");
//! }
//! ```

pub mod activation;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod reconciler;
pub mod recovery;
pub mod sync;

pub use activation::ActivationOrchestrator;
pub use cache::{GetOptions, SubscriptionCache};
pub use clock::Clock;
pub use config::{
    ActivationConfig, CacheConfig, ManualPatchPolicy, PollOptions, ReconcileConfig,
    RecoveryConfig,
};
pub use error::ReconcileError;
pub use notify::{
    BroadcastChannel, FanOut, ListenerHandle, NoopPort, NotificationPort, WorkerPort,
};
pub use reconciler::{Reconciler, ReconcilerBuilder};
pub use recovery::{RecoveryMonitor, RecoveryOutcome};
pub use sync::SubscriptionSync;
