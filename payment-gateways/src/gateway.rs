//! The adapter contract every payment provider implements.
//!
//! Provider vocabulary stops here: callers only ever see [`PaymentIntent`],
//! [`ChargeResult`] and the normalized [`PaymentEvent`].

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Serialize;
use shared::{Buyer, EventStatus, Gateway, IdempotencyKey, Order, PaymentEvent, PaymentMethod};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(String),
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("malformed gateway payload: {0}")]
    Malformed(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl PaymentError {
    /// Only transport failures are worth repeating, and only with the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PaymentError::GatewayUnavailable(_))
    }
}

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Copy)]
pub struct IntentRequest<'a> {
    pub order: &'a Order,
    pub buyer: &'a Buyer,
    pub method: PaymentMethod,
    pub idempotency_key: &'a IdempotencyKey,
    pub return_url: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChargeRequest<'a> {
    pub order: &'a Order,
    pub buyer: &'a Buyer,
    pub token: &'a str,
    pub idempotency_key: &'a IdempotencyKey,
}

/// What the buyer needs in order to pay. Never a settlement by itself.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntent {
    pub gateway: Gateway,
    pub external_id: String,
    pub redirect_url: Option<String>,
    pub client_token: Option<String>,
    pub reference: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChargeResult {
    pub gateway: Gateway,
    pub external_id: String,
    pub status: EventStatus,
    pub amount: BigDecimal,
    pub currency: String,
    pub raw: serde_json::Value,
}

impl ChargeResult {
    /// A synchronous charge answer is settled through the same path as a webhook.
    pub fn into_event(self, order_reference: String) -> PaymentEvent {
        PaymentEvent {
            gateway: self.gateway,
            external_event_id: format!("charge:{}:{}", self.external_id, self.status),
            external_payment_id: self.external_id,
            order_reference: Some(order_reference),
            status: self.status,
            amount: self.amount,
            currency: self.currency,
            event_type: "charge.sync".to_string(),
            raw: self.raw,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> Gateway;

    fn supports(&self, method: PaymentMethod) -> bool;

    /// Produces a redirect URL, client token or payment reference for the buyer.
    async fn create_intent(&self, request: IntentRequest<'_>) -> PaymentResult<PaymentIntent>;

    /// Charges a client-side token. Only card-present providers support this.
    async fn charge_token(&self, _request: ChargeRequest<'_>) -> PaymentResult<ChargeResult> {
        Err(PaymentError::Unsupported(format!(
            "{} gateway does not charge tokens",
            self.kind()
        )))
    }

    /// Checks the provider signature and normalizes the notification.
    ///
    /// Every field of the returned event comes from signed material or from the provider's own
    /// API. `InvalidSignature` means the payload must not be trusted at all; `Malformed` means
    /// the signature was valid but the content is not something this adapter understands.
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<PaymentEvent>;
}
