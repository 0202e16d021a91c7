//! Reconciliation configuration
//!
//! Every component takes its own section; [`ReconcileConfig`] bundles them
//! for the composition root.

use std::time::Duration;

use fitsync_client::backoff_delay;

/// Configuration for the subscription cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Lifetime of an in-memory entry.
    /// Default: 5 minutes
    pub ttl: Duration,

    /// Total document fetch attempts per lookup.
    /// Default: 3
    pub max_retries: u32,

    /// Fixed delay between document fetch attempts.
    /// Default: 1 second
    pub retry_delay: Duration,

    /// Oldest local-storage snapshot a lookup may fall back to.
    /// Default: 1 hour
    pub local_max_age: Duration,

    /// Maximum number of cached users.
    /// Default: 10,000
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            local_max_age: Duration::from_secs(60 * 60),
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry lifetime.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the document fetch attempts.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the delay between document fetch attempts.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the local snapshot age limit.
    #[must_use]
    pub fn with_local_max_age(mut self, age: Duration) -> Self {
        self.local_max_age = age;
        self
    }
}

/// Backoff schedule for status polling.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
    /// Document fetches before giving up.
    pub max_attempts: u32,
    /// Delay after the first fetch.
    pub initial_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Hard bound on the whole poll.
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 1.5,
            timeout: Duration::from_millis(120_000),
        }
    }
}

impl PollOptions {
    /// Create poll options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay after fetch `attempt` (zero-based):
    /// `min(initial_delay * backoff_multiplier^attempt, max_delay)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_delay,
            self.backoff_multiplier,
            self.max_delay,
            attempt,
        )
    }
}

/// When the orchestrator and the recovery monitor may write an active
/// record into the document themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManualPatchPolicy {
    /// Never patch the document directly.
    Disabled,
    /// Patch only after the processor reported the subscription as
    /// active or trialing in the same cycle.
    #[default]
    RequireProcessorConfirmation,
    /// Patch without confirmation, trusting the caller's checkout.
    Optimistic,
}

impl ManualPatchPolicy {
    /// Whether the direct patch may run, given whether the processor
    /// confirmed the subscription in this cycle.
    #[must_use]
    pub fn allows(self, processor_confirmed: bool) -> bool {
        match self {
            Self::Disabled => false,
            Self::RequireProcessorConfirmation => processor_confirmed,
            Self::Optimistic => true,
        }
    }

    /// Policy name for logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::RequireProcessorConfirmation => "require_processor_confirmation",
            Self::Optimistic => "optimistic",
        }
    }
}

impl std::str::FromStr for ManualPatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "require_processor_confirmation" | "confirmed" => Ok(Self::RequireProcessorConfirmation),
            "optimistic" => Ok(Self::Optimistic),
            other => Err(format!("unknown manual patch policy: {other}")),
        }
    }
}

/// Configuration for one activation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationConfig {
    /// How long to wait for the webhook to update the document.
    /// Default: 30 seconds
    pub webhook_timeout: Duration,

    /// Hard bound on the whole activation.
    /// Default: 120 seconds
    pub total_timeout: Duration,

    /// Whether to fall back to processor verification and the direct patch.
    /// Default: true
    pub enable_fallbacks: bool,

    /// Gate for the direct patch.
    pub manual_patch: ManualPatchPolicy,

    /// Price written by the direct patch; empty keeps the stored price.
    pub default_price_id: String,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            webhook_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(120),
            enable_fallbacks: true,
            manual_patch: ManualPatchPolicy::default(),
            default_price_id: String::new(),
        }
    }
}

impl ActivationConfig {
    /// Create an activation config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_webhook_timeout(mut self, timeout: Duration) -> Self {
        self.webhook_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_fallbacks(mut self, enabled: bool) -> Self {
        self.enable_fallbacks = enabled;
        self
    }

    #[must_use]
    pub fn with_manual_patch(mut self, policy: ManualPatchPolicy) -> Self {
        self.manual_patch = policy;
        self
    }

    #[must_use]
    pub fn with_default_price_id(mut self, price_id: impl Into<String>) -> Self {
        self.default_price_id = price_id.into();
        self
    }
}

/// Configuration for the background recovery monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    /// Time between scans.
    /// Default: 60 seconds
    pub interval: Duration,

    /// How long a record may stay incomplete before it counts as stuck.
    /// Default: 120 seconds
    pub stuck_threshold: Duration,

    /// Recovery runs allowed per subscription within the cooldown window.
    /// Default: 3
    pub max_recovery_attempts: u32,

    /// Rolling rate-limit window.
    /// Default: 5 minutes
    pub recovery_cooldown: Duration,

    /// How long attempt records are kept.
    /// Default: 24 hours
    pub log_retention: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(120),
            max_recovery_attempts: 3,
            recovery_cooldown: Duration::from_secs(5 * 60),
            log_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RecoveryConfig {
    /// Create a recovery config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_recovery_cooldown(mut self, cooldown: Duration) -> Self {
        self.recovery_cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn with_log_retention(mut self, retention: Duration) -> Self {
        self.log_retention = retention;
        self
    }
}

/// All reconciliation settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileConfig {
    pub cache: CacheConfig,
    pub poll: PollOptions,
    pub activation: ActivationConfig,
    pub recovery: RecoveryConfig,
}

impl ReconcileConfig {
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_poll(mut self, poll: PollOptions) -> Self {
        self.poll = poll;
        self
    }

    #[must_use]
    pub fn with_activation(mut self, activation: ActivationConfig) -> Self {
        self.activation = activation;
        self
    }

    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReconcileConfig::default();
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.cache.max_retries, 3);
        assert_eq!(config.poll.max_attempts, 10);
        assert_eq!(config.activation.webhook_timeout, Duration::from_secs(30));
        assert_eq!(config.activation.total_timeout, Duration::from_secs(120));
        assert!(config.activation.enable_fallbacks);
        assert_eq!(config.recovery.max_recovery_attempts, 3);
        assert_eq!(config.recovery.recovery_cooldown, Duration::from_secs(300));
    }

    #[test]
    fn test_poll_schedule() {
        let poll = PollOptions::default();
        assert_eq!(poll.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(poll.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(poll.delay_for_attempt(2), Duration::from_millis(2250));
        assert_eq!(poll.delay_for_attempt(9), Duration::from_millis(30_000));
    }

    #[test]
    fn test_manual_patch_policy() {
        assert_eq!(
            ManualPatchPolicy::default(),
            ManualPatchPolicy::RequireProcessorConfirmation
        );
        assert!(!ManualPatchPolicy::Disabled.allows(true));
        assert!(ManualPatchPolicy::RequireProcessorConfirmation.allows(true));
        assert!(!ManualPatchPolicy::RequireProcessorConfirmation.allows(false));
        assert!(ManualPatchPolicy::Optimistic.allows(false));

        assert_eq!(
            "optimistic".parse::<ManualPatchPolicy>(),
            Ok(ManualPatchPolicy::Optimistic)
        );
        assert_eq!(
            "off".parse::<ManualPatchPolicy>(),
            Ok(ManualPatchPolicy::Disabled)
        );
        assert!("sometimes".parse::<ManualPatchPolicy>().is_err());
    }
}
