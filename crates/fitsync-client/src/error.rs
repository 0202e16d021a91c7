//! Client errors
//!
//! Every remote failure is classified once, here. The document store speaks
//! plain HTTP status codes while the callables answer with a status string
//! in their error body; both land on the same variants so the layers above
//! only ever ask two questions: what kind of failure, and is it transient.

use reqwest::StatusCode;
use thiserror::Error;

/// Errors from the document store, the callables and the HTTP transport.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The request never produced a response.
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("request timed out")]
    Timeout,

    #[error("authentication required: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The callable refused to act on the subscription in its current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A concurrent write won.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A status this client does not recognise.
    #[error("unexpected status {code}: {message}")]
    Unknown { code: String, message: String },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("malformed payload: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Whether repeating the same request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Timeout | Self::Conflict(_) | Self::RateLimited(_) | Self::Unavailable(_) => true,
            _ => false,
        }
    }

    /// Short stable name for logs and metric labels.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Timeout => "timeout",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::FailedPrecondition(_) => "failed_precondition",
            Self::Conflict(_) => "conflict",
            Self::RateLimited(_) => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
            Self::Unknown { .. } => "unknown",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
        }
    }

    pub fn connection(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            retryable,
        }
    }

    /// Classify a document store response that carried no callable error body.
    #[must_use]
    pub fn from_http_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status.as_u16() {
            400 => Self::InvalidArgument(message),
            401 => Self::Unauthenticated(message),
            403 => Self::PermissionDenied(message),
            404 => Self::NotFound(message),
            408 | 504 => Self::Timeout,
            409 => Self::Conflict(message),
            412 => Self::FailedPrecondition(message),
            429 => Self::RateLimited(message),
            502 | 503 => Self::Unavailable(message),
            500..=599 => Self::Internal(message),
            _ => Self::Unknown {
                code: status.as_u16().to_string(),
                message,
            },
        }
    }

    /// Classify a callable error status.
    ///
    /// Accepts both `FAILED_PRECONDITION` and `failed-precondition`.
    #[must_use]
    pub fn from_callable_status(status: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let code = status.trim().to_ascii_lowercase().replace('_', "-");

        match code.as_str() {
            "deadline-exceeded" => Self::Timeout,
            "unauthenticated" => Self::Unauthenticated(message),
            "permission-denied" => Self::PermissionDenied(message),
            "not-found" => Self::NotFound(message),
            "invalid-argument" | "out-of-range" => Self::InvalidArgument(message),
            "failed-precondition" => Self::FailedPrecondition(message),
            "aborted" | "already-exists" => Self::Conflict(message),
            "resource-exhausted" => Self::RateLimited(message),
            "unavailable" => Self::Unavailable(message),
            "internal" | "data-loss" => Self::Internal(message),
            _ => Self::Unknown { code, message },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        if err.is_decode() {
            return Self::Serialization(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_http_status(status, err.to_string());
        }
        // builder errors are a bad URL or header; sending again cannot help
        Self::connection(err.to_string(), !err.is_builder())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_failures_are_retryable() {
        let transient = [
            ClientError::Timeout,
            ClientError::Unavailable("down".into()),
            ClientError::RateLimited("slow down".into()),
            ClientError::Conflict("lost race".into()),
            ClientError::connection("reset by peer", true),
        ];
        for err in transient {
            assert!(err.is_retryable(), "{err} should be retryable");
        }
    }

    #[test]
    fn test_caller_mistakes_are_final() {
        let permanent = [
            ClientError::NotFound("user".into()),
            ClientError::PermissionDenied("rules".into()),
            ClientError::Unauthenticated("expired".into()),
            ClientError::FailedPrecondition("no subscription".into()),
            ClientError::Internal("crash".into()),
            ClientError::connection("bad endpoint", false),
        ];
        for err in permanent {
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }
    }

    #[test]
    fn test_http_statuses_map_to_variants() {
        let cases = [
            (StatusCode::FORBIDDEN, "permission_denied"),
            (StatusCode::NOT_FOUND, "not_found"),
            (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            (StatusCode::IM_A_TEAPOT, "unknown"),
        ];
        for (status, code) in cases {
            assert_eq!(ClientError::from_http_status(status, "body").code(), code);
        }
    }

    #[test]
    fn test_callable_status_spellings() {
        assert!(matches!(
            ClientError::from_callable_status("FAILED_PRECONDITION", "x"),
            ClientError::FailedPrecondition(_)
        ));
        assert!(matches!(
            ClientError::from_callable_status(" failed-precondition ", "x"),
            ClientError::FailedPrecondition(_)
        ));
        assert!(matches!(
            ClientError::from_callable_status("deadline-exceeded", "x"),
            ClientError::Timeout
        ));

        match ClientError::from_callable_status("SOMETHING_NEW", "x") {
            ClientError::Unknown { code, message } => {
                assert_eq!(code, "something-new");
                assert_eq!(message, "x");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
