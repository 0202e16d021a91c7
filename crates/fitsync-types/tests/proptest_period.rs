//! Property-based tests for the billing period validator
//!
//! A period is valid exactly when its length lies within one hour of 30 days.

use chrono::{DateTime, TimeDelta};
use fitsync_types::{is_valid_period, plan_duration, plan_period, PERIOD_TOLERANCE_SECS};
use proptest::prelude::*;

const TOLERANCE_MS: i64 = PERIOD_TOLERANCE_SECS * 1000;

fn arb_anchor() -> impl Strategy<Value = i64> {
    // 2020-01-01 .. 2040-01-01 in epoch millis
    1_577_836_800_000_i64..2_208_988_800_000_i64
}

proptest! {
    /// Property: lengths within tolerance are accepted
    #[test]
    fn prop_within_tolerance_valid(
        anchor in arb_anchor(),
        offset in -TOLERANCE_MS..=TOLERANCE_MS,
    ) {
        let start = DateTime::from_timestamp_millis(anchor).unwrap();
        let end = start + plan_duration() + TimeDelta::milliseconds(offset);
        prop_assert!(is_valid_period(start, end));
    }

    /// Property: lengths outside tolerance are rejected
    #[test]
    fn prop_outside_tolerance_invalid(
        anchor in arb_anchor(),
        excess in 1_i64..10 * TOLERANCE_MS,
        negative in any::<bool>(),
    ) {
        let start = DateTime::from_timestamp_millis(anchor).unwrap();
        let offset = TOLERANCE_MS + excess;
        let offset = if negative { -offset } else { offset };
        let end = start + plan_duration() + TimeDelta::milliseconds(offset);
        prop_assert!(!is_valid_period(start, end));
    }

    /// Property: a freshly computed plan period is always valid
    #[test]
    fn prop_plan_period_valid(anchor in arb_anchor()) {
        let (start, end) = plan_period(DateTime::from_timestamp_millis(anchor).unwrap());
        prop_assert!(is_valid_period(start, end));
    }
}
