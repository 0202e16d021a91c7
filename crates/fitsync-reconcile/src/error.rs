//! Reconciliation errors
//!
//! Core operations report outcomes as values (`Option`, `bool`,
//! [`ActivationResult`](fitsync_types::ActivationResult)); these errors
//! travel between internal steps and are logged where a step gives up.

use fitsync_client::{ClientError, StorageError};
use fitsync_types::TypesError;
use thiserror::Error;

/// Errors raised inside the reconciliation pipeline.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Remote call failed
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Write rejected by record validation
    #[error(transparent)]
    Invalid(#[from] TypesError),

    /// Local snapshot storage failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Snapshot encoding failed
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The user document holds no subscription record
    #[error("user {0} has no subscription record")]
    NoSubscription(String),

    /// A required port was not supplied to the builder
    #[error("missing {0}")]
    MissingPort(&'static str),
}

/// Result type for reconciliation internals
pub type Result<T> = std::result::Result<T, ReconcileError>;
