//! Cross-context sync messages

use serde::{Deserialize, Serialize};

use crate::Subscription;

/// Message exchanged between open sessions and the background worker.
///
/// Encoded as `{"type": "SUBSCRIPTION_UPDATED", "subscription": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
    /// A reconciled subscription record
    SubscriptionUpdated {
        /// The new record
        subscription: Subscription,
    },
}

impl SyncMessage {
    /// Wrap a subscription update
    #[must_use]
    pub fn subscription_updated(subscription: Subscription) -> Self {
        Self::SubscriptionUpdated { subscription }
    }

    /// The carried subscription record
    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        match self {
            Self::SubscriptionUpdated { subscription } => subscription,
        }
    }

    /// Encode as a JSON frame
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a JSON frame; `None` for anything malformed.
    #[must_use]
    pub fn from_frame(frame: &str) -> Option<Self> {
        serde_json::from_str(frame).ok()
    }
}
