//! Hosted card tokenization provider. Card data is tokenized client-side; we either hand the
//! client a payment-intent secret or charge a token directly.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use shared::{EventStatus, Gateway, PaymentEvent, PaymentMethod};
use std::collections::HashMap;
use std::time::Duration;

use crate::client::ProviderClient;
use crate::gateway::{
    ChargeRequest, ChargeResult, IntentRequest, PaymentError, PaymentGateway, PaymentIntent,
    PaymentResult,
};
use crate::money::{from_minor_units, to_minor_units};
use crate::signature::{check_tolerance, header_str, parse_timestamped, verify_any};

pub const SIGNATURE_HEADER: &str = "card-signature";

#[derive(Debug, Clone)]
pub struct CardConfig {
    pub api_base: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub tolerance_secs: i64,
    pub timeout: Duration,
}

pub struct HostedCardGateway {
    client: ProviderClient,
    config: CardConfig,
}

impl HostedCardGateway {
    pub fn new(config: CardConfig) -> PaymentResult<Self> {
        let client = ProviderClient::new(&config.api_base, &config.secret_key, config.timeout)?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct IntentBody<'a> {
    amount: i64,
    currency: String,
    receipt_email: &'a str,
    metadata: HashMap<&'static str, String>,
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    client_secret: String,
}

#[derive(Debug, Serialize)]
struct ChargeBody<'a> {
    amount: i64,
    currency: String,
    source: &'a str,
    description: String,
    metadata: HashMap<&'static str, String>,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    id: String,
    status: String,
    amount: i64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct CardEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: CardEventData,
}

#[derive(Debug, Deserialize)]
struct CardEventData {
    object: CardObject,
}

#[derive(Debug, Deserialize)]
struct CardObject {
    id: String,
    amount: i64,
    currency: String,
    /// Present on charge objects; refunds are reported against the charge.
    payment_intent: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn map_event_type(kind: &str) -> Option<EventStatus> {
    match kind {
        "payment_intent.succeeded" => Some(EventStatus::Completed),
        "payment_intent.processing" => Some(EventStatus::Pending),
        "payment_intent.requires_action" => Some(EventStatus::InReview),
        "payment_intent.payment_failed" | "payment_intent.canceled" => Some(EventStatus::Failed),
        "charge.refunded" => Some(EventStatus::Refunded),
        _ => None,
    }
}

fn map_charge_status(status: &str) -> PaymentResult<EventStatus> {
    match status {
        "succeeded" => Ok(EventStatus::Completed),
        "pending" => Ok(EventStatus::Pending),
        "failed" => Ok(EventStatus::Failed),
        other => Err(PaymentError::Malformed(format!("unknown charge status {}", other))),
    }
}

fn order_metadata(order_id: String) -> HashMap<&'static str, String> {
    HashMap::from([("order_id", order_id)])
}

#[async_trait]
impl PaymentGateway for HostedCardGateway {
    fn kind(&self) -> Gateway {
        Gateway::HostedCard
    }

    fn supports(&self, method: PaymentMethod) -> bool {
        method == PaymentMethod::Card
    }

    async fn create_intent(&self, request: IntentRequest<'_>) -> PaymentResult<PaymentIntent> {
        let order = request.order;
        let body = IntentBody {
            amount: to_minor_units(&order.total)?,
            currency: order.currency.to_lowercase(),
            receipt_email: &request.buyer.email,
            metadata: order_metadata(order.id.to_string()),
        };

        let intent: IntentResponse = self
            .client
            .post_json("payment_intents", &body, request.idempotency_key)
            .await?;

        Ok(PaymentIntent {
            gateway: Gateway::HostedCard,
            external_id: intent.id,
            redirect_url: None,
            client_token: Some(intent.client_secret),
            reference: None,
            expires_at: order.expires_at,
        })
    }

    async fn charge_token(&self, request: ChargeRequest<'_>) -> PaymentResult<ChargeResult> {
        let order = request.order;
        let body = ChargeBody {
            amount: to_minor_units(&order.total)?,
            currency: order.currency.to_lowercase(),
            source: request.token,
            description: format!("Order {}", order.id),
            metadata: order_metadata(order.id.to_string()),
        };

        let charge: ChargeResponse = self
            .client
            .post_json("charges", &body, request.idempotency_key)
            .await?;
        let status = map_charge_status(&charge.status)?;
        let raw = serde_json::json!({
            "id": charge.id,
            "status": charge.status,
            "amount": charge.amount,
            "currency": charge.currency,
        });

        Ok(ChargeResult {
            gateway: Gateway::HostedCard,
            external_id: charge.id,
            status,
            amount: from_minor_units(charge.amount),
            currency: charge.currency.to_uppercase(),
            raw,
        })
    }

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<PaymentEvent> {
        let header = header_str(headers, SIGNATURE_HEADER)?;
        let signature = parse_timestamped(header, "t")?;

        let mut signed = format!("{}.", signature.timestamp).into_bytes();
        signed.extend_from_slice(payload);
        verify_any(
            self.config.webhook_secret.as_bytes(),
            &signed,
            &signature.signatures,
        )?;
        check_tolerance(signature.timestamp, Utc::now(), self.config.tolerance_secs)?;

        let event: CardEvent =
            serde_json::from_slice(payload).map_err(|e| PaymentError::Malformed(e.to_string()))?;
        let status = map_event_type(&event.kind)
            .ok_or_else(|| PaymentError::Malformed(format!("unhandled card event {}", event.kind)))?;
        let raw = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::Malformed(e.to_string()))?;

        let object = event.data.object;
        Ok(PaymentEvent {
            gateway: Gateway::HostedCard,
            external_event_id: event.id,
            external_payment_id: object.payment_intent.unwrap_or(object.id),
            order_reference: object.metadata.get("order_id").cloned(),
            status,
            amount: from_minor_units(object.amount),
            currency: object.currency.to_uppercase(),
            event_type: event.kind,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::sign_hex;
    use bigdecimal::BigDecimal;
    use reqwest::header::HeaderValue;
    use std::str::FromStr;

    const SECRET: &str = "whsec_card";

    fn gateway() -> HostedCardGateway {
        HostedCardGateway::new(CardConfig {
            api_base: "http://127.0.0.1:9".to_string(),
            secret_key: "sk_test".to_string(),
            webhook_secret: SECRET.to_string(),
            tolerance_secs: 300,
            timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    fn event_body(kind: &str) -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": kind,
            "data": { "object": {
                "id": "ch_1",
                "payment_intent": "pi_1",
                "amount": 50000,
                "currency": "mxn",
                "metadata": { "order_id": "order-ref" }
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn headers_for(secret: &str, payload: &[u8], timestamp: i64) -> HeaderMap {
        let mut signed = format!("{}.", timestamp).into_bytes();
        signed.extend_from_slice(payload);
        let signature = sign_hex(secret.as_bytes(), &signed).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&format!("t={},v1={}", timestamp, signature)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn succeeded_event_normalizes() {
        let payload = event_body("payment_intent.succeeded");
        let headers = headers_for(SECRET, &payload, Utc::now().timestamp());

        let event = gateway().verify_webhook(&payload, &headers).await.unwrap();
        assert_eq!(event.status, EventStatus::Completed);
        assert_eq!(event.external_payment_id, "pi_1");
        assert_eq!(event.order_reference.as_deref(), Some("order-ref"));
        assert_eq!(event.amount, BigDecimal::from_str("500.00").unwrap());
        assert_eq!(event.currency, "MXN");
        assert_eq!(event.event_type, "payment_intent.succeeded");
    }

    #[tokio::test]
    async fn refund_and_failure_events() {
        let gw = gateway();
        for (kind, expected) in [
            ("charge.refunded", EventStatus::Refunded),
            ("payment_intent.payment_failed", EventStatus::Failed),
            ("payment_intent.processing", EventStatus::Pending),
        ] {
            let payload = event_body(kind);
            let headers = headers_for(SECRET, &payload, Utc::now().timestamp());
            let event = gw.verify_webhook(&payload, &headers).await.unwrap();
            assert_eq!(event.status, expected);
        }
    }

    #[tokio::test]
    async fn tampered_body_is_rejected() {
        let payload = event_body("payment_intent.succeeded");
        let headers = headers_for(SECRET, &payload, Utc::now().timestamp());
        let tampered = event_body("charge.refunded");

        assert!(matches!(
            gateway().verify_webhook(&tampered, &headers).await,
            Err(PaymentError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn signed_but_unknown_event_is_malformed() {
        let payload = event_body("customer.created");
        let headers = headers_for(SECRET, &payload, Utc::now().timestamp());

        assert!(matches!(
            gateway().verify_webhook(&payload, &headers).await,
            Err(PaymentError::Malformed(_))
        ));
    }
}
