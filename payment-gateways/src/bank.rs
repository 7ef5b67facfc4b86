//! Bank transfer by reference: the buyer receives an account number (CLABE) plus a reference
//! and pays from their own bank. Settlement is only ever learned through the webhook.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use shared::{EventStatus, Gateway, PaymentEvent, PaymentMethod};
use std::time::Duration;

use crate::client::ProviderClient;
use crate::gateway::{IntentRequest, PaymentError, PaymentGateway, PaymentIntent, PaymentResult};
use crate::money::{from_minor_units, to_minor_units};
use crate::signature::{header_str, verify_hex};

pub const SIGNATURE_HEADER: &str = "x-bank-signature";

#[derive(Debug, Clone)]
pub struct BankConfig {
    pub api_base: String,
    pub api_key: String,
    pub webhook_secret: String,
    pub timeout: Duration,
}

pub struct BankReferenceGateway {
    client: ProviderClient,
    config: BankConfig,
}

impl BankReferenceGateway {
    pub fn new(config: BankConfig) -> PaymentResult<Self> {
        let client = ProviderClient::new(&config.api_base, &config.api_key, config.timeout)?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct ReferenceRequest<'a> {
    amount_cents: i64,
    currency: &'a str,
    order_reference: String,
    customer_email: &'a str,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ReferenceResponse {
    id: String,
    clabe: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TransferEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    transfer: Transfer,
}

#[derive(Debug, Deserialize)]
struct Transfer {
    id: String,
    order_reference: Option<String>,
    amount_cents: i64,
    currency: String,
}

fn map_event_type(kind: &str) -> Option<EventStatus> {
    match kind {
        "transfer.received" => Some(EventStatus::Completed),
        "transfer.pending" => Some(EventStatus::Pending),
        "transfer.held" => Some(EventStatus::InReview),
        "transfer.expired" | "transfer.rejected" => Some(EventStatus::Failed),
        "transfer.reversed" => Some(EventStatus::Refunded),
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for BankReferenceGateway {
    fn kind(&self) -> Gateway {
        Gateway::BankReference
    }

    fn supports(&self, method: PaymentMethod) -> bool {
        method == PaymentMethod::BankTransfer
    }

    async fn create_intent(&self, request: IntentRequest<'_>) -> PaymentResult<PaymentIntent> {
        let order = request.order;
        let body = ReferenceRequest {
            amount_cents: to_minor_units(&order.total)?,
            currency: &order.currency,
            order_reference: order.id.to_string(),
            customer_email: &request.buyer.email,
            expires_at: order.expires_at,
        };

        let reference: ReferenceResponse = self
            .client
            .post_json("transfers/references", &body, request.idempotency_key)
            .await?;

        Ok(PaymentIntent {
            gateway: Gateway::BankReference,
            external_id: reference.id,
            redirect_url: None,
            client_token: None,
            reference: Some(reference.clabe),
            expires_at: reference.expires_at.unwrap_or(order.expires_at),
        })
    }

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<PaymentEvent> {
        let signature = header_str(headers, SIGNATURE_HEADER)?;
        verify_hex(self.config.webhook_secret.as_bytes(), payload, signature)?;

        let event: TransferEvent =
            serde_json::from_slice(payload).map_err(|e| PaymentError::Malformed(e.to_string()))?;
        let status = map_event_type(&event.kind)
            .ok_or_else(|| PaymentError::Malformed(format!("unhandled bank event {}", event.kind)))?;
        let raw = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::Malformed(e.to_string()))?;

        Ok(PaymentEvent {
            gateway: Gateway::BankReference,
            external_event_id: event.id,
            external_payment_id: event.transfer.id,
            order_reference: event.transfer.order_reference,
            status,
            amount: from_minor_units(event.transfer.amount_cents),
            currency: event.transfer.currency.to_uppercase(),
            event_type: event.kind,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::sign_hex;
    use reqwest::header::HeaderValue;

    fn gateway() -> BankReferenceGateway {
        BankReferenceGateway::new(BankConfig {
            api_base: "http://127.0.0.1:9".to_string(),
            api_key: "key".to_string(),
            webhook_secret: "bank-secret".to_string(),
            timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    fn payload(kind: &str) -> Vec<u8> {
        serde_json::json!({
            "id": "bevt-1",
            "type": kind,
            "transfer": {
                "id": "tr-5",
                "order_reference": "ref-1",
                "amount_cents": 120000,
                "currency": "MXN"
            }
        })
        .to_string()
        .into_bytes()
    }

    fn sign(body: &[u8], secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign_hex(secret.as_bytes(), body).unwrap()).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn received_transfer_is_completed() {
        let body = payload("transfer.received");
        let event = gateway()
            .verify_webhook(&body, &sign(&body, "bank-secret"))
            .await
            .unwrap();

        assert_eq!(event.status, EventStatus::Completed);
        assert_eq!(event.external_payment_id, "tr-5");
        assert_eq!(event.amount, from_minor_units(120000));
    }

    #[tokio::test]
    async fn expired_and_reversed_transfers() {
        let gw = gateway();
        let expired = payload("transfer.expired");
        let reversed = payload("transfer.reversed");

        assert_eq!(
            gw.verify_webhook(&expired, &sign(&expired, "bank-secret"))
                .await
                .unwrap()
                .status,
            EventStatus::Failed
        );
        assert_eq!(
            gw.verify_webhook(&reversed, &sign(&reversed, "bank-secret"))
                .await
                .unwrap()
                .status,
            EventStatus::Refunded
        );
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let body = payload("transfer.received");
        assert!(matches!(
            gateway().verify_webhook(&body, &sign(&body, "guess")).await,
            Err(PaymentError::InvalidSignature(_))
        ));
    }
}
