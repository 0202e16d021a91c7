//! Cache entry types

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::Subscription;

/// Where a cached subscription record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Authoritative per-user document
    Document,
    /// Previously cached value or local storage snapshot
    Cache,
    /// Payment processor status endpoint
    Processor,
    /// Direct activation patch
    Manual,
}

impl CacheSource {
    /// Source name for logs and metric labels
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Cache => "cache",
            Self::Processor => "processor",
            Self::Manual => "manual",
        }
    }
}

/// One cached subscription record per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cached record
    pub data: Subscription,
    /// When the entry was written
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
    /// Origin of the record
    pub source: CacheSource,
    /// Cleared when the entry is explicitly invalidated
    pub valid: bool,
}

impl CacheEntry {
    /// Create a valid entry written at `now`
    #[must_use]
    pub fn new(data: Subscription, source: CacheSource, now: DateTime<Utc>) -> Self {
        Self {
            data,
            last_updated: now,
            source,
            valid: true,
        }
    }

    /// Whether the entry is valid and younger than `ttl` at `now`.
    #[must_use]
    pub fn is_fresh(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        self.valid && now - self.last_updated < ttl
    }
}
