//! Subscription types
//!
//! The subscription record is mirrored in three places: the authoritative
//! per-user document, the in-memory cache and the local storage snapshot.
//! All three share the camelCase JSON shape the webhook processor writes,
//! with timestamps as epoch milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::period::{is_valid_period, plan_period};
use crate::TypesError;

/// Free workouts granted to users without an entitled subscription
pub const DEFAULT_FREE_WORKOUT_LIMIT: u32 = 3;

fn default_free_workout_limit() -> u32 {
    DEFAULT_FREE_WORKOUT_LIMIT
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Checkout finished but the first payment is not confirmed
    Incomplete,
    /// Subscription is active
    Active,
    /// In trial period
    Trialing,
    /// Payment is past due
    PastDue,
    /// Subscription was canceled
    Canceled,
    /// Payment attempts exhausted
    Unpaid,
}

impl SubscriptionStatus {
    /// Whether this status unlocks unlimited usage.
    #[must_use]
    pub fn is_entitled(self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Statuses that only the payment processor may report.
    ///
    /// Local repair paths must never write these.
    #[must_use]
    pub fn is_processor_only(self) -> bool {
        matches!(self, Self::PastDue | Self::Canceled | Self::Unpaid)
    }

    /// Wire name of the status
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(Self::Incomplete),
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            other => Err(TypesError::UnknownStatus(other.to_string())),
        }
    }
}

/// User subscription record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Processor-issued subscription ID
    pub subscription_id: String,
    /// Processor-issued customer ID
    #[serde(default)]
    pub customer_id: String,
    /// Subscription status
    pub status: SubscriptionStatus,
    /// Purchased plan price
    #[serde(default)]
    pub price_id: String,
    /// Workouts generated so far
    #[serde(default)]
    pub workout_count: u32,
    /// Free workouts consumed
    #[serde(default)]
    pub free_workouts_used: u32,
    /// Free workouts allowed without an entitled subscription
    #[serde(default = "default_free_workout_limit")]
    pub free_workout_limit: u32,
    /// Current billing period start
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub current_period_start: Option<DateTime<Utc>>,
    /// Current billing period end
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub current_period_end: Option<DateTime<Utc>>,
    /// Cancellation pending at period end
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// When the record was created
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Last write to the record
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Create a fresh record with default usage counters and no period.
    pub fn new(
        subscription_id: impl Into<String>,
        customer_id: impl Into<String>,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            customer_id: customer_id.into(),
            status,
            price_id: String::new(),
            workout_count: 0,
            free_workouts_used: 0,
            free_workout_limit: DEFAULT_FREE_WORKOUT_LIMIT,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the subscription unlocks unlimited usage
    #[must_use]
    pub fn has_unlimited_access(&self) -> bool {
        self.status.is_entitled()
    }

    /// Free workouts left before the free tier is exhausted
    #[must_use]
    pub fn remaining_free_workouts(&self) -> u32 {
        self.free_workout_limit
            .saturating_sub(self.free_workouts_used)
    }

    /// Whether the user may start another workout
    #[must_use]
    pub fn can_start_workout(&self) -> bool {
        self.has_unlimited_access() || self.remaining_free_workouts() > 0
    }

    /// Whether the stored billing period honours the plan duration
    #[must_use]
    pub fn period_is_valid(&self) -> bool {
        match (self.current_period_start, self.current_period_end) {
            (Some(start), Some(end)) => is_valid_period(start, end),
            _ => false,
        }
    }

    /// Time since the last write, as seen at `now`
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::TimeDelta {
        now - self.updated_at
    }

    /// The record as the direct activation patch writes it: active, with a
    /// full plan period anchored at `now`.
    #[must_use]
    pub fn activated(&self, price_id: &str, now: DateTime<Utc>) -> Self {
        let (start, end) = plan_period(now);
        Self {
            status: SubscriptionStatus::Active,
            price_id: if price_id.is_empty() {
                self.price_id.clone()
            } else {
                price_id.to_string()
            },
            current_period_start: Some(start),
            current_period_end: Some(end),
            cancel_at_period_end: false,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// Partial update to a subscription record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workout_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_workouts_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_workout_limit: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub current_period_start: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_at_period_end: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SubscriptionPatch {
    /// Create an empty patch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status
    #[must_use]
    pub fn with_status(mut self, status: SubscriptionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the price
    #[must_use]
    pub fn with_price_id(mut self, price_id: impl Into<String>) -> Self {
        self.price_id = Some(price_id.into());
        self
    }

    /// Set the billing period
    #[must_use]
    pub fn with_period(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.current_period_start = Some(start);
        self.current_period_end = Some(end);
        self
    }

    /// Set the pending-cancellation flag
    #[must_use]
    pub fn with_cancel_at_period_end(mut self, cancel: bool) -> Self {
        self.cancel_at_period_end = Some(cancel);
        self
    }

    /// Set the usage counters
    #[must_use]
    pub fn with_usage(mut self, workout_count: u32, free_workouts_used: u32) -> Self {
        self.workout_count = Some(workout_count);
        self.free_workouts_used = Some(free_workouts_used);
        self
    }

    /// Stamp the patch with a fresh `updatedAt`
    #[must_use]
    pub fn stamped(mut self, now: DateTime<Utc>) -> Self {
        self.updated_at = Some(now);
        self
    }

    /// Check the patch against the currently stored record.
    ///
    /// Rejects a patch that replaces an assigned subscription ID or that
    /// writes a status only the payment processor may report.
    pub fn validate(&self, current: Option<&Subscription>) -> Result<(), TypesError> {
        if let Some(status) = self.status {
            if status.is_processor_only() {
                return Err(TypesError::ProcessorOnlyStatus(status));
            }
        }

        if let (Some(requested), Some(current)) = (&self.subscription_id, current) {
            if !current.subscription_id.is_empty() && *requested != current.subscription_id {
                return Err(TypesError::ImmutableSubscriptionId {
                    current: current.subscription_id.clone(),
                    requested: requested.clone(),
                });
            }
        }

        Ok(())
    }

    /// Merge the patch into `base`.
    pub fn apply_to(&self, base: &mut Subscription) {
        if let Some(v) = &self.subscription_id {
            if base.subscription_id.is_empty() {
                base.subscription_id = v.clone();
            }
        }
        if let Some(v) = &self.customer_id {
            base.customer_id = v.clone();
        }
        if let Some(v) = self.status {
            base.status = v;
        }
        if let Some(v) = &self.price_id {
            base.price_id = v.clone();
        }
        if let Some(v) = self.workout_count {
            base.workout_count = v;
        }
        if let Some(v) = self.free_workouts_used {
            base.free_workouts_used = v;
        }
        if let Some(v) = self.free_workout_limit {
            base.free_workout_limit = v;
        }
        if let Some(v) = self.current_period_start {
            base.current_period_start = Some(v);
        }
        if let Some(v) = self.current_period_end {
            base.current_period_end = Some(v);
        }
        if let Some(v) = self.cancel_at_period_end {
            base.cancel_at_period_end = v;
        }
        if let Some(v) = self.updated_at {
            base.updated_at = v;
        }
    }
}

/// The authoritative per-user document.
///
/// Only the `subscription` field is interpreted; every other field written by
/// the server is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDocument {
    /// Subscription projection written by the webhook processor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    /// Remaining document fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UserDocument {
    /// Document holding only a subscription
    #[must_use]
    pub fn with_subscription(subscription: Subscription) -> Self {
        Self {
            subscription: Some(subscription),
            extra: serde_json::Map::new(),
        }
    }

    /// The subscription, if it carries the given ID
    #[must_use]
    pub fn subscription_for(&self, subscription_id: &str) -> Option<&Subscription> {
        self.subscription
            .as_ref()
            .filter(|s| s.subscription_id == subscription_id)
    }
}
