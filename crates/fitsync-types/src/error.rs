//! Common error types

use thiserror::Error;

use crate::SubscriptionStatus;

/// Validation errors for subscription data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    /// Status string not recognised
    #[error("unknown subscription status: {0}")]
    UnknownStatus(String),

    /// Attempt to replace an already assigned subscription ID
    #[error("subscription id is immutable: {current} cannot become {requested}")]
    ImmutableSubscriptionId {
        /// ID currently stored
        current: String,
        /// ID the patch tried to write
        requested: String,
    },

    /// Status that only the payment processor may report
    #[error("status {0} may only be reported by the payment processor")]
    ProcessorOnlyStatus(SubscriptionStatus),

    /// Patch targets a subscription other than the stored one
    #[error("subscription mismatch: stored {stored}, target {target}")]
    SubscriptionMismatch {
        /// ID currently stored
        stored: String,
        /// ID the caller addressed
        target: String,
    },
}
