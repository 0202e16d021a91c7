//! Payment processor callables
//!
//! The reconciliation core never talks to the payment processor directly.
//! It invokes three server-side callable functions, which hold the processor
//! credentials:
//!
//! - `getSubscriptionStatus` - the processor's view of a subscription
//! - `forceWebhookProcessing` - replay the processor's webhook into the document
//! - `manualSubscriptionSync` - copy the processor record into the document
//!
//! Callables use the `{"data": ...}` request / `{"result": ...}` response
//! envelope, with `{"error": {"status", "message"}}` on failure.

use async_trait::async_trait;
use fitsync_types::SubscriptionStatus;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::metrics::{Remote, RequestTimer};
use crate::retry::{with_retry, RetryConfig};
use crate::transport::{error_from_response, join_url, HttpTransport};
use crate::{ClientConfig, Result};

/// Callable returning the processor-side status
pub const GET_STATUS_FUNCTION: &str = "getSubscriptionStatus";

/// Callable replaying the processor webhook
pub const FORCE_WEBHOOK_FUNCTION: &str = "forceWebhookProcessing";

/// Callable syncing the processor record into the document
pub const MANUAL_SYNC_FUNCTION: &str = "manualSubscriptionSync";

/// Processor-side subscription status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStatus {
    /// Processor subscription ID
    pub id: String,
    /// Status as the processor reports it
    pub status: SubscriptionStatus,
}

/// Payment processor callables
#[async_trait]
pub trait PaymentFunctions: Send + Sync {
    /// Ask the processor for the subscription's status
    async fn get_status(&self, subscription_id: &str) -> Result<ProcessorStatus>;

    /// Replay the processor webhook for the subscription
    async fn force_webhook_processing(&self, subscription_id: &str) -> Result<bool>;

    /// Copy the processor record into the user document
    async fn manual_sync(&self, subscription_id: &str) -> Result<bool>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRequest<'a> {
    subscription_id: &'a str,
}

#[derive(Serialize)]
struct CallableRequest<T> {
    data: T,
}

#[derive(Deserialize)]
struct CallableResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct SuccessReply {
    #[serde(default)]
    success: bool,
}

/// HTTP client for the callable functions
#[derive(Debug, Clone)]
pub struct HttpPaymentFunctions {
    transport: HttpTransport,
    endpoint: String,
    retry: RetryConfig,
}

impl HttpPaymentFunctions {
    /// Create a callable client
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            transport: HttpTransport::new(config)?,
            endpoint: config.functions_endpoint.clone(),
            retry: config.retry.clone(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        name: &'static str,
        subscription_id: &str,
    ) -> Result<T> {
        let url = join_url(&self.endpoint, &[name])?;
        let body = CallableRequest {
            data: SubscriptionRequest { subscription_id },
        };
        let timer = RequestTimer::start(Remote::Functions, name);

        let result: Result<T> = async {
            let response = self
                .transport
                .request(Method::POST, url)
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }
            let envelope = response.json::<CallableResponse<T>>().await?;
            Ok(envelope.result)
        }
        .await;

        timer.finish(result)
    }
}

#[async_trait]
impl PaymentFunctions for HttpPaymentFunctions {
    #[instrument(skip(self), level = "debug")]
    async fn get_status(&self, subscription_id: &str) -> Result<ProcessorStatus> {
        with_retry(self.retry.clone(), || {
            self.call::<ProcessorStatus>(GET_STATUS_FUNCTION, subscription_id)
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn force_webhook_processing(&self, subscription_id: &str) -> Result<bool> {
        let reply: SuccessReply = self.call(FORCE_WEBHOOK_FUNCTION, subscription_id).await?;
        Ok(reply.success)
    }

    #[instrument(skip(self), level = "debug")]
    async fn manual_sync(&self, subscription_id: &str) -> Result<bool> {
        let reply: SuccessReply = self.call(MANUAL_SYNC_FUNCTION, subscription_id).await?;
        Ok(reply.success)
    }
}
