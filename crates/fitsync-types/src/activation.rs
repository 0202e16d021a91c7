//! Activation outcome types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Subscription;

/// How an activation request was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMethod {
    /// The authoritative document was updated by the webhook processor
    Webhook,
    /// The payment processor confirmed the subscription and the document caught up
    ProcessorVerification,
    /// The document was patched directly
    ManualActivation,
    /// Every strategy was exhausted
    Timeout,
}

impl ActivationMethod {
    /// Method name for logs and metric labels
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::ProcessorVerification => "processor_verification",
            Self::ManualActivation => "manual_activation",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ActivationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one activation request.
///
/// Callers branch on `success`; failures are never raised as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationResult {
    /// Whether the subscription ended up active or trialing
    pub success: bool,
    /// The reconciled record on success
    pub subscription: Option<Subscription>,
    /// Strategy that settled the request
    pub method: ActivationMethod,
    /// Failure description
    pub error: Option<String>,
    /// Fallback strategies attempted after the webhook wait
    pub attempts: u32,
    /// Wall-clock time spent
    #[serde(rename = "durationMs", with = "duration_millis")]
    pub duration: Duration,
}

impl ActivationResult {
    /// A successful activation
    #[must_use]
    pub fn succeeded(
        method: ActivationMethod,
        subscription: Subscription,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            success: true,
            subscription: Some(subscription),
            method,
            error: None,
            attempts,
            duration,
        }
    }

    /// A failed activation
    #[must_use]
    pub fn failed(
        method: ActivationMethod,
        error: impl Into<String>,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            subscription: None,
            method,
            error: Some(error.into()),
            attempts,
            duration,
        }
    }

    /// Duration in whole milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_result_shape() {
        let result = ActivationResult::failed(
            ActivationMethod::Webhook,
            "webhook timeout",
            0,
            Duration::from_millis(30_000),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["method"], "webhook");
        assert_eq!(json["durationMs"], 30_000);
        assert_eq!(result.duration_ms(), 30_000);
    }
}
