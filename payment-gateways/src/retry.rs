use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::gateway::PaymentResult;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Repeats `call` while it fails with a retryable error, up to `policy.max_attempts`.
///
/// The closure must reuse the same idempotency key on every invocation.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, operation: &str, mut call: F) -> PaymentResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PaymentResult<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                warn!(operation, attempt, error = %err, "gateway call failed, retrying");
                tokio::time::sleep(policy.base_delay * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
