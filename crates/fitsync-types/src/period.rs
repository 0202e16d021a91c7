//! Billing period rules
//!
//! Every paid plan runs for a fixed 30 days. Periods written by the webhook
//! processor may drift slightly (clock skew, DST on the processor side), so a
//! period is accepted when its length is within one hour of the plan length.

use chrono::{DateTime, TimeDelta, Utc};

/// Plan length in days
pub const PLAN_DURATION_DAYS: i64 = 30;

/// Accepted deviation from the plan length, in seconds
pub const PERIOD_TOLERANCE_SECS: i64 = 60 * 60;

/// Fixed plan duration
#[must_use]
pub fn plan_duration() -> TimeDelta {
    TimeDelta::days(PLAN_DURATION_DAYS)
}

/// Tolerance applied by [`is_valid_period`]
#[must_use]
pub fn period_tolerance() -> TimeDelta {
    TimeDelta::seconds(PERIOD_TOLERANCE_SECS)
}

/// A full plan period anchored at `anchor`.
#[must_use]
pub fn plan_period(anchor: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (anchor, anchor + plan_duration())
}

/// Check that `[start, end]` spans one plan duration, within tolerance.
///
/// Both tolerance boundaries are inclusive.
#[must_use]
pub fn is_valid_period(start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    let deviation = (end - start) - plan_duration();
    deviation.abs() <= period_tolerance()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_plan_period_is_valid() {
        let (start, end) = plan_period(anchor());
        assert_eq!(end - start, TimeDelta::days(30));
        assert!(is_valid_period(start, end));
    }

    #[test]
    fn test_tolerance_boundaries_inclusive() {
        let start = anchor();
        let exact = start + plan_duration();

        assert!(is_valid_period(start, exact + period_tolerance()));
        assert!(is_valid_period(start, exact - period_tolerance()));
    }

    #[test]
    fn test_just_outside_tolerance_rejected() {
        let start = anchor();
        let exact = start + plan_duration();
        let one_ms = TimeDelta::milliseconds(1);

        assert!(!is_valid_period(start, exact + period_tolerance() + one_ms));
        assert!(!is_valid_period(start, exact - period_tolerance() - one_ms));
    }

    #[test]
    fn test_inverted_period_rejected() {
        let start = anchor();
        assert!(!is_valid_period(start + plan_duration(), start));
    }
}
