//! Shared HTTP transport
//!
//! One `reqwest::Client` per configuration, with timeouts applied and the
//! bearer token attached to every request.

use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::Deserialize;

use crate::{ClientConfig, ClientError, Result};

#[derive(Clone)]
pub(crate) struct HttpTransport {
    client: Client,
    bearer_token: Option<String>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("has_bearer_token", &self.bearer_token.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub(crate) fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::connection(format!("failed to build client: {e}"), false))?;

        Ok(Self {
            client,
            bearer_token: config.bearer_token.clone(),
        })
    }

    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Parse `base` and append path segments, percent-encoding each one.
pub(crate) fn join_url(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| ClientError::connection(format!("invalid endpoint {base}: {e}"), false))?;
    url.path_segments_mut()
        .map_err(|()| ClientError::connection(format!("endpoint cannot be a base: {base}"), false))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct CallableErrorBody {
    error: CallableError,
}

#[derive(Debug, Deserialize)]
struct CallableError {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

/// Turn a non-success response into a [`ClientError`].
///
/// Callable-style `{"error": {"status", "message"}}` bodies take precedence
/// over the HTTP status code.
pub(crate) async fn error_from_response(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match serde_json::from_str::<CallableErrorBody>(&body) {
        Ok(parsed) if !parsed.error.status.is_empty() => {
            ClientError::from_callable_status(&parsed.error.status, parsed.error.message)
        }
        _ => ClientError::from_http_status(status, body),
    }
}
