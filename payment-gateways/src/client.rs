use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::IdempotencyKey;
use std::time::Duration;
use tracing::debug;

use crate::gateway::{PaymentError, PaymentResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin JSON client shared by the provider adapters.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ProviderClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> PaymentResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::GatewayUnavailable(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// POSTs `body` with the attempt's idempotency key.
    pub async fn post_json<B, R>(&self, path: &str, body: &B, key: &IdempotencyKey) -> PaymentResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(url = %url, idempotency_key = %key, "calling payment provider");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", key.as_str())
            .json(body)
            .send()
            .await
            .map_err(|e| PaymentError::GatewayUnavailable(format!("{}: {}", url, e)))?;

        decode(&url, response).await
    }

    /// GETs a provider resource. Used to read back authoritative payment state.
    pub async fn get_json<R>(&self, path: &str) -> PaymentResult<R>
    where
        R: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(url = %url, "reading from payment provider");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| PaymentError::GatewayUnavailable(format!("{}: {}", url, e)))?;

        decode(&url, response).await
    }
}

/// Transport errors, 429 and 5xx map to `GatewayUnavailable` (retryable); any other 4xx is a
/// `Declined` answer from the provider.
async fn decode<R: DeserializeOwned>(url: &str, response: reqwest::Response) -> PaymentResult<R> {
    let status = response.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(PaymentError::GatewayUnavailable(format!(
            "{} answered {}",
            url, status
        )));
    }
    if status.is_client_error() {
        let detail = response.text().await.unwrap_or_default();
        return Err(PaymentError::Declined(format!("{}: {}", status, detail)));
    }

    response
        .json::<R>()
        .await
        .map_err(|e| PaymentError::Malformed(format!("{}: {}", url, e)))
}
