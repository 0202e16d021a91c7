//! Request metrics for the edge clients
//!
//! - `fitsync_client_requests_total{remote, operation, outcome}` where
//!   `outcome` is `ok`, `dropped`, or an error [`code`](crate::ClientError::code)
//! - `fitsync_client_request_duration_seconds{remote, operation}`
//! - `fitsync_client_watch_events_total{event}`
//!
//! Nothing is exported unless the process installs a recorder.

use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

use crate::ClientError;

pub const REQUESTS_TOTAL: &str = "fitsync_client_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "fitsync_client_request_duration_seconds";
pub const WATCH_EVENTS_TOTAL: &str = "fitsync_client_watch_events_total";

/// Which collaborator a request went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remote {
    Documents,
    Functions,
}

impl Remote {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::Functions => "functions",
        }
    }
}

/// Times one request and records it exactly once.
///
/// A guard dropped without [`finish`](Self::finish) counts as `dropped`,
/// which is how a caller-side timeout shows up.
#[must_use]
pub struct RequestTimer {
    remote: Remote,
    operation: &'static str,
    started: Instant,
    done: bool,
}

impl RequestTimer {
    pub fn start(remote: Remote, operation: &'static str) -> Self {
        Self {
            remote,
            operation,
            started: Instant::now(),
            done: false,
        }
    }

    /// Record `result` and hand it back unchanged.
    pub fn finish<T>(mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.code(),
        };
        self.record(outcome);
        result
    }

    fn record(&mut self, outcome: &'static str) {
        self.done = true;
        let remote = self.remote.label();
        counter!(REQUESTS_TOTAL, "remote" => remote, "operation" => self.operation, "outcome" => outcome)
            .increment(1);
        histogram!(REQUEST_DURATION_SECONDS, "remote" => remote, "operation" => self.operation)
            .record(self.started.elapsed().as_secs_f64());
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        if !self.done {
            self.record("dropped");
        }
    }
}

/// Count a document watch event: `change`, `error` or `closed`.
pub fn record_watch_event(event: &'static str) {
    counter!(WATCH_EVENTS_TOTAL, "event" => event).increment(1);
}

/// Register descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(
        REQUESTS_TOTAL,
        Unit::Count,
        "Requests sent to the document store and the payment callables"
    );
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests to the document store and the payment callables"
    );
    describe_counter!(
        WATCH_EVENTS_TOTAL,
        Unit::Count,
        "Events delivered by document watches"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_is_transparent() {
        let ok = RequestTimer::start(Remote::Documents, "get_user").finish(Ok(7));
        assert_eq!(ok.unwrap(), 7);

        let err = RequestTimer::start(Remote::Functions, "get_status")
            .finish::<()>(Err(ClientError::NotFound("sub_1".into())));
        assert!(matches!(err, Err(ClientError::NotFound(_))));
    }

    #[test]
    fn test_recording_without_recorder_is_a_noop() {
        describe_metrics();
        record_watch_event("closed");
        drop(RequestTimer::start(Remote::Documents, "listen"));
    }
}
