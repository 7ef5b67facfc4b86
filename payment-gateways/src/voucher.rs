//! Cash voucher provider: the buyer prints or shows a barcode and pays at a convenience store.

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

pub const SIGNATURE_HEADER: &str = "x-voucher-signature";

#[derive(Debug, Clone)]
pub struct VoucherConfig {
    pub api_base: String,
    pub api_key: String,
    pub webhook_secret: String,
    pub timeout: Duration,
}

pub struct CashVoucherGateway {
    client: ProviderClient,
    config: VoucherConfig,
}

impl CashVoucherGateway {
    pub fn new(config: VoucherConfig) -> PaymentResult<Self> {
        let client = ProviderClient::new(&config.api_base, &config.api_key, config.timeout)?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct VoucherCustomer<'a> {
    email: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct VoucherRequest<'a> {
    amount_cents: i64,
    currency: &'a str,
    order_reference: String,
    customer: VoucherCustomer<'a>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct VoucherResponse {
    id: String,
    reference: String,
    barcode_url: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct VoucherEvent {
    event_id: String,
    event: String,
    voucher: Voucher,
}

#[derive(Debug, Deserialize)]
struct Voucher {
    id: String,
    order_reference: Option<String>,
    amount_cents: i64,
    currency: String,
}

fn map_event(kind: &str) -> Option<EventStatus> {
    match kind {
        "voucher.paid" => Some(EventStatus::Completed),
        "voucher.created" => Some(EventStatus::Pending),
        "voucher.review" => Some(EventStatus::InReview),
        "voucher.expired" | "voucher.cancelled" => Some(EventStatus::Failed),
        "voucher.refunded" => Some(EventStatus::Refunded),
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for CashVoucherGateway {
    fn kind(&self) -> Gateway {
        Gateway::CashVoucher
    }

    fn supports(&self, method: PaymentMethod) -> bool {
        method == PaymentMethod::CashVoucher
    }

    async fn create_intent(&self, request: IntentRequest<'_>) -> PaymentResult<PaymentIntent> {
        let order = request.order;
        let body = VoucherRequest {
            amount_cents: to_minor_units(&order.total)?,
            currency: &order.currency,
            order_reference: order.id.to_string(),
            customer: VoucherCustomer {
                email: &request.buyer.email,
                name: &request.buyer.name,
            },
            expires_at: order.expires_at,
        };

        let voucher: VoucherResponse = self
            .client
            .post_json("vouchers", &body, request.idempotency_key)
            .await?;

        Ok(PaymentIntent {
            gateway: Gateway::CashVoucher,
            external_id: voucher.id,
            redirect_url: voucher.barcode_url,
            client_token: None,
            reference: Some(voucher.reference),
            expires_at: voucher.expires_at.unwrap_or(order.expires_at),
        })
    }

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<PaymentEvent> {
        let header = header_str(headers, SIGNATURE_HEADER)?;
        let signature = header.strip_prefix("sha256=").ok_or_else(|| {
            PaymentError::InvalidSignature("expected sha256= signature".to_string())
        })?;
        verify_hex(self.config.webhook_secret.as_bytes(), payload, signature)?;

        let event: VoucherEvent =
            serde_json::from_slice(payload).map_err(|e| PaymentError::Malformed(e.to_string()))?;
        let status = map_event(&event.event)
            .ok_or_else(|| PaymentError::Malformed(format!("unhandled voucher event {}", event.event)))?;
        let raw = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::Malformed(e.to_string()))?;

        Ok(PaymentEvent {
            gateway: Gateway::CashVoucher,
            external_event_id: event.event_id,
            external_payment_id: event.voucher.id,
            order_reference: event.voucher.order_reference,
            status,
            amount: from_minor_units(event.voucher.amount_cents),
            currency: event.voucher.currency.to_uppercase(),
            event_type: event.event,
            raw,
        })
    }
}
