//! Client configuration

use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryConfig;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required endpoint not provided
    #[error("missing endpoint: {0}")]
    MissingEndpoint(&'static str),

    /// Endpoint is not an http(s) URL
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint {
        /// Offending endpoint
        endpoint: String,
        /// Why it was rejected
        reason: String,
    },

    /// A timing value is out of range
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) documents_endpoint: String,
    pub(crate) functions_endpoint: String,
    pub(crate) bearer_token: Option<String>,
    pub(crate) connect_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) watch_interval: Duration,
    pub(crate) retry: RetryConfig,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("documents_endpoint", &self.documents_endpoint)
            .field("functions_endpoint", &self.functions_endpoint)
            .field(
                "bearer_token",
                &self.bearer_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("watch_interval", &self.watch_interval)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ClientConfig {
    /// Start building a configuration
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Base URL of the document store
    #[must_use]
    pub fn documents_endpoint(&self) -> &str {
        &self.documents_endpoint
    }

    /// Base URL of the callable functions
    #[must_use]
    pub fn functions_endpoint(&self) -> &str {
        &self.functions_endpoint
    }

    /// Whether requests carry a bearer token
    #[must_use]
    pub fn has_bearer_token(&self) -> bool {
        self.bearer_token.is_some()
    }

    /// Connection establishment timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Per-request timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Polling interval of document watches
    #[must_use]
    pub fn watch_interval(&self) -> Duration {
        self.watch_interval
    }

    /// Retry settings for idempotent reads
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    documents_endpoint: Option<String>,
    functions_endpoint: Option<String>,
    bearer_token: Option<String>,
    connect_timeout: Duration,
    request_timeout: Duration,
    watch_interval: Duration,
    retry: RetryConfig,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            documents_endpoint: None,
            functions_endpoint: None,
            bearer_token: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            watch_interval: Duration::from_secs(1),
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfigBuilder {
    /// Use one base URL for both the document store and the functions
    #[must_use]
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.documents_endpoint = Some(url.clone());
        self.functions_endpoint = Some(url);
        self
    }

    /// Set the document store base URL
    #[must_use]
    pub fn documents_endpoint(mut self, url: impl Into<String>) -> Self {
        self.documents_endpoint = Some(url.into());
        self
    }

    /// Set the callable functions base URL
    #[must_use]
    pub fn functions_endpoint(mut self, url: impl Into<String>) -> Self {
        self.functions_endpoint = Some(url.into());
        self
    }

    /// Authenticate requests with a bearer token
    #[must_use]
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Set the connect timeout
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-request timeout
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the document watch polling interval
    #[must_use]
    pub fn watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Set the number of retries for idempotent reads
    #[must_use]
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry = self.retry.with_max_attempts(attempts);
        self
    }

    /// Set the base retry delay
    #[must_use]
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry = self.retry.with_base_delay(delay);
        self
    }

    /// Set the maximum retry delay
    #[must_use]
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry = self.retry.with_max_delay(delay);
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let documents_endpoint = normalize_endpoint(
            self.documents_endpoint
                .ok_or(ConfigError::MissingEndpoint("documents"))?,
        )?;
        let functions_endpoint = normalize_endpoint(
            self.functions_endpoint
                .ok_or(ConfigError::MissingEndpoint("functions"))?,
        )?;

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("request_timeout"));
        }
        if self.watch_interval.is_zero() {
            return Err(ConfigError::InvalidValue("watch_interval"));
        }

        Ok(ClientConfig {
            documents_endpoint,
            functions_endpoint,
            bearer_token: self.bearer_token.filter(|t| !t.is_empty()),
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            watch_interval: self.watch_interval,
            retry: self.retry,
        })
    }
}

/// Strip trailing slashes and require an http(s) scheme.
fn normalize_endpoint(endpoint: String) -> Result<String, ConfigError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidEndpoint {
            endpoint,
            reason: "empty".to_string(),
        });
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidEndpoint {
            endpoint,
            reason: "expected http:// or https://".to_string(),
        });
    }
    Ok(trimmed.to_string())
}
