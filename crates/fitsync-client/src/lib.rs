//! fitsync Client - edge clients for the reconciliation core
//!
//! Clients for the collaborators the reconciliation pipeline consumes but
//! does not implement:
//! - the authoritative per-user document store ([`DocumentStore`])
//! - the payment processor callables ([`PaymentFunctions`])
//! - local durable key-value storage ([`LocalStore`])
//!
//! Every remote failure is translated once, at this boundary, into
//! [`ClientError`].

pub mod config;
pub mod document;
pub mod error;
pub mod functions;
pub mod metrics;
pub mod retry;
pub mod storage;
mod transport;

pub use config::{ClientConfig, ClientConfigBuilder, ConfigError};
pub use document::{DocumentStore, DocumentWatch, HttpDocumentStore, WatchEvent};
pub use error::ClientError;
pub use functions::{HttpPaymentFunctions, PaymentFunctions, ProcessorStatus};
pub use retry::{backoff_delay, with_retry, RetryConfig, RetryableError};
pub use storage::{
    FileLocalStore, LocalStore, MemoryLocalStore, StorageError, SUBSCRIPTION_SNAPSHOT_KEY,
};

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
