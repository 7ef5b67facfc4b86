//! In-process gateway for development and tests. Never talks to the network; webhooks are
//! signed with a shared secret exactly like the real adapters.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use shared::{EventStatus, Gateway, PaymentEvent, PaymentMethod};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::info;

use crate::gateway::{
    ChargeRequest, ChargeResult, IntentRequest, PaymentError, PaymentGateway, PaymentIntent,
    PaymentResult,
};
use crate::signature::{header_str, sign_hex, verify_hex};

pub const SIGNATURE_HEADER: &str = "x-mock-signature";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockWebhook {
    pub event_id: String,
    pub payment_id: String,
    pub order_reference: Option<String>,
    pub status: EventStatus,
    pub amount: BigDecimal,
    pub currency: String,
}

pub struct MockGateway {
    kind: Gateway,
    secret: String,
    charge_status: EventStatus,
    unavailable_calls: AtomicU32,
    calls: AtomicU32,
    keys: Mutex<Vec<String>>,
}

impl MockGateway {
    pub fn new(kind: Gateway, secret: impl Into<String>) -> Self {
        Self {
            kind,
            secret: secret.into(),
            charge_status: EventStatus::Completed,
            unavailable_calls: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            keys: Mutex::new(Vec::new()),
        }
    }

    /// The next `calls` outbound calls fail with `GatewayUnavailable`.
    pub fn failing_first(self, calls: u32) -> Self {
        self.unavailable_calls.store(calls, Ordering::SeqCst);
        self
    }

    pub fn with_charge_status(mut self, status: EventStatus) -> Self {
        self.charge_status = status;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn idempotency_keys(&self) -> Vec<String> {
        self.keys.lock().map(|keys| keys.clone()).unwrap_or_default()
    }

    pub fn signed(&self, webhook: &MockWebhook) -> PaymentResult<(Vec<u8>, HeaderMap)> {
        let body = serde_json::to_vec(webhook).map_err(|e| PaymentError::Malformed(e.to_string()))?;
        let signature = sign_hex(self.secret.as_bytes(), &body)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&signature)
                .map_err(|e| PaymentError::Malformed(e.to_string()))?,
        );
        Ok((body, headers))
    }

    fn record_call(&self, key: &str) -> PaymentResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut keys) = self.keys.lock() {
            keys.push(key.to_string());
        }
        let unavailable = self
            .unavailable_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if unavailable {
            return Err(PaymentError::GatewayUnavailable("mock outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn kind(&self) -> Gateway {
        self.kind
    }

    fn supports(&self, _method: PaymentMethod) -> bool {
        true
    }

    async fn create_intent(&self, request: IntentRequest<'_>) -> PaymentResult<PaymentIntent> {
        let key = request.idempotency_key.as_str();
        self.record_call(key)?;
        info!(gateway = %self.kind, idempotency_key = key, "mock intent created");

        Ok(PaymentIntent {
            gateway: self.kind,
            external_id: format!("mock-{}", key),
            redirect_url: Some(format!("https://pay.mock.test/{}", key)),
            client_token: None,
            reference: Some(format!("REF-{}", key)),
            expires_at: request.order.expires_at,
        })
    }

    async fn charge_token(&self, request: ChargeRequest<'_>) -> PaymentResult<ChargeResult> {
        let key = request.idempotency_key.as_str();
        self.record_call(key)?;

        Ok(ChargeResult {
            gateway: self.kind,
            external_id: format!("mock-charge-{}", key),
            status: self.charge_status,
            amount: request.order.total.clone(),
            currency: request.order.currency.clone(),
            raw: serde_json::json!({ "token": request.token }),
        })
    }

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<PaymentEvent> {
        let signature = header_str(headers, SIGNATURE_HEADER)?;
        verify_hex(self.secret.as_bytes(), payload, signature)?;

        let webhook: MockWebhook =
            serde_json::from_slice(payload).map_err(|e| PaymentError::Malformed(e.to_string()))?;
        let raw = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::Malformed(e.to_string()))?;

        Ok(PaymentEvent {
            gateway: self.kind,
            external_event_id: webhook.event_id,
            external_payment_id: webhook.payment_id,
            order_reference: webhook.order_reference,
            status: webhook.status,
            amount: webhook.amount,
            currency: webhook.currency,
            event_type: format!("mock.{}", webhook.status),
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn signed_webhooks_verify_and_forgeries_do_not() {
        let gateway = MockGateway::new(Gateway::CashVoucher, "s3cret");
        let webhook = MockWebhook {
            event_id: "e1".to_string(),
            payment_id: "p1".to_string(),
            order_reference: Some("o1".to_string()),
            status: EventStatus::Completed,
            amount: BigDecimal::from_str("10.00").unwrap(),
            currency: "MXN".to_string(),
        };

        let (body, headers) = gateway.signed(&webhook).unwrap();
        let event = gateway.verify_webhook(&body, &headers).await.unwrap();
        assert_eq!(event.gateway, Gateway::CashVoucher);
        assert_eq!(event.status, EventStatus::Completed);

        let other = MockGateway::new(Gateway::CashVoucher, "different");
        let (_, forged) = other.signed(&webhook).unwrap();
        assert!(matches!(
            gateway.verify_webhook(&body, &forged).await,
            Err(PaymentError::InvalidSignature(_))
        ));
    }
}
