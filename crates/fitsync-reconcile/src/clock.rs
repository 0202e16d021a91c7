//! Wall-clock time driven by the tokio timer.
//!
//! Record timestamps (`updatedAt`, cache `last_updated`, recovery attempts)
//! are wall-clock values, while every wait in this crate goes through tokio.
//! [`Clock`] derives the former from the latter so both advance together,
//! including under a paused test runtime.

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Wall-clock source anchored to a tokio instant.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor: DateTime<Utc>,
    started: Instant,
}

impl Clock {
    /// Anchor at the current system time.
    #[must_use]
    pub fn system() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchor at a fixed wall-clock time.
    #[must_use]
    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: Instant::now(),
        }
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.started.elapsed()).unwrap_or(TimeDelta::MAX);
        self.anchor
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
