//! Wallet redirect provider: the buyer is sent to a hosted checkout page built from a
//! "preference", and the provider later notifies us about the resulting payment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use num_traits::ToPrimitive;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use shared::{EventStatus, Gateway, PaymentEvent, PaymentMethod};
use std::time::Duration;

use crate::client::ProviderClient;
use crate::gateway::{IntentRequest, PaymentError, PaymentGateway, PaymentIntent, PaymentResult};
use crate::money::from_json_number;
use crate::signature::{check_tolerance, header_str, parse_timestamped, verify_any};

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub api_base: String,
    pub access_token: String,
    pub webhook_secret: String,
    pub notification_url: Option<String>,
    pub tolerance_secs: i64,
    pub timeout: Duration,
}

pub struct WalletRedirectGateway {
    client: ProviderClient,
    config: WalletConfig,
}

impl WalletRedirectGateway {
    pub fn new(config: WalletConfig) -> PaymentResult<Self> {
        let client = ProviderClient::new(&config.api_base, &config.access_token, config.timeout)?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct PreferenceItem {
    id: String,
    quantity: i32,
    unit_price: f64,
    currency_id: String,
}

#[derive(Debug, Serialize)]
struct PreferencePayer<'a> {
    email: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct PreferenceRequest<'a> {
    external_reference: String,
    items: Vec<PreferenceItem>,
    payer: PreferencePayer<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    back_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_url: Option<&'a str>,
    expiration_date_to: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PreferenceResponse {
    id: String,
    init_point: String,
}

/// Only `data.id` is covered by the signature. Everything else about the payment is read back
/// from the provider.
#[derive(Debug, Deserialize)]
struct WalletNotification {
    #[serde(rename = "type")]
    kind: String,
    data: NotificationData,
}

#[derive(Debug, Deserialize)]
struct NotificationData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WalletPayment {
    status: Option<String>,
    external_reference: Option<String>,
    transaction_amount: Option<serde_json::Number>,
    currency_id: Option<String>,
}

fn map_status(status: &str) -> Option<EventStatus> {
    match status {
        "approved" => Some(EventStatus::Completed),
        "pending" => Some(EventStatus::Pending),
        "in_process" | "in_mediation" => Some(EventStatus::InReview),
        "rejected" | "cancelled" => Some(EventStatus::Failed),
        "refunded" | "charged_back" => Some(EventStatus::Refunded),
        _ => None,
    }
}

/// The signed manifest covers the payment id, the delivery's request id and the timestamp.
pub fn signing_manifest(data_id: &str, request_id: &str, timestamp: i64) -> String {
    format!("id:{};request-id:{};ts:{};", data_id, request_id, timestamp)
}

#[async_trait]
impl PaymentGateway for WalletRedirectGateway {
    fn kind(&self) -> Gateway {
        Gateway::WalletRedirect
    }

    fn supports(&self, method: PaymentMethod) -> bool {
        method == PaymentMethod::Wallet
    }

    async fn create_intent(&self, request: IntentRequest<'_>) -> PaymentResult<PaymentIntent> {
        let order = request.order;
        let items = order
            .items
            .iter()
            .map(|item| {
                let unit_price = item.unit_price.to_f64().ok_or_else(|| {
                    PaymentError::Malformed(format!("unit price {} out of range", item.unit_price))
                })?;
                Ok(PreferenceItem {
                    id: item.template_id.to_string(),
                    quantity: item.quantity,
                    unit_price,
                    currency_id: order.currency.clone(),
                })
            })
            .collect::<PaymentResult<Vec<_>>>()?;

        let body = PreferenceRequest {
            external_reference: order.id.to_string(),
            items,
            payer: PreferencePayer {
                email: &request.buyer.email,
                name: &request.buyer.name,
            },
            back_url: request.return_url,
            notification_url: self.config.notification_url.as_deref(),
            expiration_date_to: order.expires_at,
        };

        let preference: PreferenceResponse = self
            .client
            .post_json("checkout/preferences", &body, request.idempotency_key)
            .await?;

        Ok(PaymentIntent {
            gateway: Gateway::WalletRedirect,
            external_id: preference.id,
            redirect_url: Some(preference.init_point),
            client_token: None,
            reference: None,
            expires_at: order.expires_at,
        })
    }

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<PaymentEvent> {
        let header = header_str(headers, SIGNATURE_HEADER)?;
        let request_id = header_str(headers, REQUEST_ID_HEADER)?;
        let signature = parse_timestamped(header, "ts")?;

        // The manifest needs data.id, so an unparseable body cannot be verified at all.
        let notification: WalletNotification = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::InvalidSignature(format!("unverifiable payload: {}", e)))?;
        let payment_id = notification.data.id;

        let manifest = signing_manifest(&payment_id, request_id, signature.timestamp);
        verify_any(
            self.config.webhook_secret.as_bytes(),
            manifest.as_bytes(),
            &signature.signatures,
        )?;
        check_tolerance(signature.timestamp, Utc::now(), self.config.tolerance_secs)?;

        if notification.kind != "payment" {
            return Err(PaymentError::Malformed(format!(
                "wallet notification type {} ignored",
                notification.kind
            )));
        }
        if payment_id.is_empty()
            || !payment_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(PaymentError::Malformed(format!(
                "wallet payment id {:?} not usable",
                payment_id
            )));
        }

        let raw: serde_json::Value = self
            .client
            .get_json(&format!("v1/payments/{}", payment_id))
            .await
            .map_err(|err| match err {
                PaymentError::Declined(detail) => PaymentError::Malformed(format!(
                    "payment {} unknown to provider: {}",
                    payment_id, detail
                )),
                other => other,
            })?;
        let payment: WalletPayment = serde_json::from_value(raw.clone())
            .map_err(|e| PaymentError::Malformed(e.to_string()))?;

        let raw_status = payment
            .status
            .as_deref()
            .ok_or_else(|| PaymentError::Malformed("payment status missing".to_string()))?;
        let status = map_status(raw_status)
            .ok_or_else(|| PaymentError::Malformed(format!("unknown wallet status {}", raw_status)))?;
        let amount = payment
            .transaction_amount
            .as_ref()
            .ok_or_else(|| PaymentError::Malformed("transaction_amount missing".to_string()))
            .and_then(from_json_number)?;
        let event_type = format!("payment.{}", raw_status);

        Ok(PaymentEvent {
            gateway: Gateway::WalletRedirect,
            external_event_id: format!("{}:{}", request_id, payment_id),
            external_payment_id: payment_id,
            order_reference: payment.external_reference,
            status,
            amount,
            currency: payment.currency_id.unwrap_or_default().to_uppercase(),
            event_type,
            raw,
        })
    }
}
