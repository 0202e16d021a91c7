//! Reconciliation metrics.
//!
//! # Metrics
//!
//! - `fitsync_cache_lookups_total` - Counter of cache lookups by result and source
//! - `fitsync_activations_total` - Counter of activation results by method and outcome
//! - `fitsync_activation_duration_seconds` - Histogram of activation durations
//! - `fitsync_poll_attempts_total` - Counter of status poll fetches
//! - `fitsync_recovery_runs_total` - Counter of recovery runs by method and outcome

use fitsync_types::{ActivationResult, CacheSource, RecoveryMethod};
use metrics::{counter, histogram};

/// Metric name for cache lookups.
pub const CACHE_LOOKUPS_TOTAL: &str = "fitsync_cache_lookups_total";

/// Metric name for activation results.
pub const ACTIVATIONS_TOTAL: &str = "fitsync_activations_total";

/// Metric name for the activation duration histogram.
pub const ACTIVATION_DURATION_SECONDS: &str = "fitsync_activation_duration_seconds";

/// Metric name for status poll fetches.
pub const POLL_ATTEMPTS_TOTAL: &str = "fitsync_poll_attempts_total";

/// Metric name for recovery runs.
pub const RECOVERY_RUNS_TOTAL: &str = "fitsync_recovery_runs_total";

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Record a cache hit served from the given source.
pub fn record_cache_hit(source: CacheSource) {
    counter!(CACHE_LOOKUPS_TOTAL, "result" => "hit", "source" => source.as_str()).increment(1);
}

/// Record a cache miss, labelled with the layer that answered (or "none").
pub fn record_cache_miss(answered_by: Option<CacheSource>) {
    let source = answered_by.map_or("none", CacheSource::as_str);
    counter!(CACHE_LOOKUPS_TOTAL, "result" => "miss", "source" => source).increment(1);
}

/// Record a finished activation.
pub fn record_activation(result: &ActivationResult) {
    counter!(
        ACTIVATIONS_TOTAL,
        "method" => result.method.as_str(),
        "outcome" => outcome(result.success)
    )
    .increment(1);

    histogram!(ACTIVATION_DURATION_SECONDS, "method" => result.method.as_str())
        .record(result.duration.as_secs_f64());
}

/// Record one status poll fetch.
pub fn record_poll_attempt() {
    counter!(POLL_ATTEMPTS_TOTAL).increment(1);
}

/// Record a finished recovery run.
pub fn record_recovery(method: RecoveryMethod, success: bool) {
    counter!(
        RECOVERY_RUNS_TOTAL,
        "method" => method.as_str(),
        "outcome" => outcome(success)
    )
    .increment(1);
}

/// Describe all metrics for registration with a recorder.
pub fn describe_metrics() {
    use metrics::{describe_counter, describe_histogram, Unit};

    describe_counter!(
        CACHE_LOOKUPS_TOTAL,
        Unit::Count,
        "Subscription cache lookups by result and answering layer"
    );
    describe_counter!(
        ACTIVATIONS_TOTAL,
        Unit::Count,
        "Activation results by settling method and outcome"
    );
    describe_histogram!(
        ACTIVATION_DURATION_SECONDS,
        Unit::Seconds,
        "Wall-clock duration of activation requests"
    );
    describe_counter!(
        POLL_ATTEMPTS_TOTAL,
        Unit::Count,
        "Document fetches made while polling for a status"
    );
    describe_counter!(
        RECOVERY_RUNS_TOTAL,
        Unit::Count,
        "Recovery runs by final method and outcome"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fitsync_types::ActivationMethod;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        record_cache_hit(CacheSource::Document);
        record_cache_miss(None);
        record_poll_attempt();
        record_recovery(RecoveryMethod::ManualSync, false);
        record_activation(&ActivationResult::failed(
            ActivationMethod::Timeout,
            "exhausted",
            2,
            Duration::from_secs(1),
        ));
    }
}
