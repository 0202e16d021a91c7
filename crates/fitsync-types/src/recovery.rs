//! Recovery attempt types

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Strategy used by a recovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMethod {
    /// Full activation chain
    Activation,
    /// Forced webhook reprocessing
    ForceWebhook,
    /// Processor-side manual sync
    ManualSync,
    /// Direct document patch
    DirectPatch,
}

impl RecoveryMethod {
    /// Method name for logs and metric labels
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activation => "activation",
            Self::ForceWebhook => "force_webhook",
            Self::ManualSync => "manual_sync",
            Self::DirectPatch => "direct_patch",
        }
    }
}

/// One logged recovery run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAttempt {
    /// Subscription being recovered
    pub subscription_id: String,
    /// When the run started
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Last strategy tried (the successful one on success)
    pub method: RecoveryMethod,
    /// Whether the run reconciled the subscription
    pub success: bool,
    /// Failure description
    pub error: Option<String>,
}

/// How urgently a stuck subscription should be surfaced to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcernLevel {
    /// Nothing to show
    None,
    /// Activation is taking longer than usual
    Informational,
    /// Automatic recovery gave up; offer a manual fix
    Actionable,
}

/// Stuck duration after which the user is always offered a manual fix,
/// as a multiple of the stuck threshold
const ACTIONABLE_THRESHOLD_FACTOR: i32 = 5;

impl ConcernLevel {
    /// Assess a pending activation.
    ///
    /// `stuck_for` is the time since the record was last updated, `attempts`
    /// the recovery runs logged in the current cooldown window.
    #[must_use]
    pub fn assess(
        stuck_for: TimeDelta,
        stuck_threshold: TimeDelta,
        attempts: u32,
        max_attempts: u32,
    ) -> Self {
        if attempts >= max_attempts || stuck_for >= stuck_threshold * ACTIONABLE_THRESHOLD_FACTOR {
            Self::Actionable
        } else if attempts > 0 || stuck_for > stuck_threshold {
            Self::Informational
        } else {
            Self::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concern_escalates() {
        let threshold = TimeDelta::seconds(120);

        assert_eq!(
            ConcernLevel::assess(TimeDelta::seconds(30), threshold, 0, 3),
            ConcernLevel::None
        );
        assert_eq!(
            ConcernLevel::assess(TimeDelta::seconds(150), threshold, 0, 3),
            ConcernLevel::Informational
        );
        assert_eq!(
            ConcernLevel::assess(TimeDelta::seconds(150), threshold, 3, 3),
            ConcernLevel::Actionable
        );
        assert_eq!(
            ConcernLevel::assess(TimeDelta::seconds(600), threshold, 1, 3),
            ConcernLevel::Actionable
        );
    }
}
