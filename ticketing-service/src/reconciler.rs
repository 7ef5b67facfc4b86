//! Inbound payment notifications.
//!
//! Every delivery is logged before anything else happens. Verified deliveries are keyed by
//! `(gateway, external_event_id)`, so a redelivery finds the earlier entry: if that entry was
//! finished the delivery is acknowledged as a duplicate, otherwise it is processed again. Only
//! a bad signature is ever answered with an error; everything else is acknowledged so the
//! provider stops retrying.

use axum::http::HeaderMap;
use payment_gateways::{GatewayRegistry, PaymentError};
use serde::Serialize;
use serde_json::{json, Value};
use shared::{EventStatus, Gateway, PaymentEvent};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::settlement::{PaymentSource, Settlement, SettlementOutcome};
use crate::store::{NewWebhookLog, StoreError, TicketingStore, Transition, WebhookAppend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookOutcome {
    Applied,
    IgnoredNotApplicable,
    Duplicate,
    AmountMismatch,
    PaymentUpdated,
    #[serde(rename = "PAYMENT_WEBHOOK_NOT_FOUND")]
    NotFound,
    IgnoredUnrecognized,
    InvalidSignature,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "APPLIED",
            WebhookOutcome::IgnoredNotApplicable => "IGNORED_NOT_APPLICABLE",
            WebhookOutcome::Duplicate => "DUPLICATE",
            WebhookOutcome::AmountMismatch => "AMOUNT_MISMATCH",
            WebhookOutcome::PaymentUpdated => "PAYMENT_UPDATED",
            WebhookOutcome::NotFound => "PAYMENT_WEBHOOK_NOT_FOUND",
            WebhookOutcome::IgnoredUnrecognized => "IGNORED_UNRECOGNIZED",
            WebhookOutcome::InvalidSignature => "INVALID_SIGNATURE",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub outcome: WebhookOutcome,
    pub order_id: Option<Uuid>,
    pub log_id: Uuid,
}

fn payload_json(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| json!({ "unparsed": String::from_utf8_lossy(body) }))
}

#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn TicketingStore>,
    registry: GatewayRegistry,
    settlement: Settlement,
    clock: Arc<dyn Clock>,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn TicketingStore>,
        registry: GatewayRegistry,
        settlement: Settlement,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            settlement,
            clock,
        }
    }

    pub async fn handle(
        &self,
        gateway_slug: &str,
        body: &[u8],
        headers: &HeaderMap,
    ) -> AppResult<WebhookAck> {
        let gateway = self
            .registry
            .resolve(gateway_slug)
            .ok_or_else(|| AppError::NotFound(format!("gateway {}", gateway_slug)))?;
        let kind = gateway.kind();

        let event = match gateway.verify_webhook(body, headers).await {
            Ok(event) => event,
            Err(PaymentError::InvalidSignature(reason)) => {
                warn!(gateway = %kind, reason = %reason, "webhook rejected, invalid signature");
                self.log_unmatched(kind, false, body, WebhookOutcome::InvalidSignature)
                    .await?;
                return Err(AppError::InvalidSignature(reason));
            }
            Err(PaymentError::Malformed(reason)) => {
                warn!(gateway = %kind, reason = %reason, "webhook ignored, unrecognized content");
                let log_id = self
                    .log_unmatched(kind, true, body, WebhookOutcome::IgnoredUnrecognized)
                    .await?;
                return Ok(WebhookAck {
                    outcome: WebhookOutcome::IgnoredUnrecognized,
                    order_id: None,
                    log_id,
                });
            }
            Err(other) => return Err(other.into()),
        };

        let now = self.clock.now();
        let appended = self
            .store
            .append_webhook(NewWebhookLog {
                id: Uuid::new_v4(),
                gateway: kind,
                external_event_id: Some(event.external_event_id.clone()),
                event_type: Some(event.event_type.clone()),
                verified: true,
                payload: event.raw.clone(),
                created_at: now,
            })
            .await?;

        let log_id = match appended {
            WebhookAppend::Inserted(id) => id,
            WebhookAppend::Duplicate { id, processed: true } => {
                let logged = self.store.get_webhook(id).await?;
                info!(
                    gateway = %kind,
                    external_event_id = %event.external_event_id,
                    "DUPLICATE: webhook already processed"
                );
                return Ok(WebhookAck {
                    outcome: WebhookOutcome::Duplicate,
                    order_id: logged.order_id,
                    log_id: id,
                });
            }
            WebhookAppend::Duplicate { id, processed: false } => {
                warn!(
                    gateway = %kind,
                    external_event_id = %event.external_event_id,
                    "webhook logged earlier but never finished, reprocessing"
                );
                id
            }
        };

        let order_id = self.resolve_order(&event).await?;
        let outcome = match order_id {
            Some(order_id) => self.apply(order_id, event).await?,
            None => {
                warn!(
                    gateway = %kind,
                    reference = ?event.order_reference,
                    external_payment_id = %event.external_payment_id,
                    "PAYMENT_WEBHOOK_NOT_FOUND"
                );
                WebhookOutcome::NotFound
            }
        };

        self.store
            .finish_webhook(log_id, order_id, outcome.as_str(), self.clock.now())
            .await?;
        info!(
            gateway = %kind,
            order_id = ?order_id,
            outcome = outcome.as_str(),
            "webhook handled"
        );

        Ok(WebhookAck {
            outcome,
            order_id,
            log_id,
        })
    }

    async fn log_unmatched(
        &self,
        kind: Gateway,
        verified: bool,
        body: &[u8],
        outcome: WebhookOutcome,
    ) -> AppResult<Uuid> {
        let now = self.clock.now();
        let appended = self
            .store
            .append_webhook(NewWebhookLog {
                id: Uuid::new_v4(),
                gateway: kind,
                external_event_id: None,
                event_type: None,
                verified,
                payload: payload_json(body),
                created_at: now,
            })
            .await?;
        let id = match appended {
            WebhookAppend::Inserted(id) | WebhookAppend::Duplicate { id, .. } => id,
        };
        self.store.finish_webhook(id, None, outcome.as_str(), now).await?;
        Ok(id)
    }

    /// The order reference when it names a known order, else the order behind the provider's
    /// payment id.
    async fn resolve_order(&self, event: &PaymentEvent) -> AppResult<Option<Uuid>> {
        if let Some(order_id) = event
            .order_reference
            .as_deref()
            .and_then(|reference| Uuid::parse_str(reference.trim()).ok())
        {
            match self.store.get_order(order_id).await {
                Ok(order) => return Ok(Some(order.id)),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(self
            .store
            .find_payment(event.gateway, &event.external_payment_id)
            .await?
            .map(|payment| payment.order_id))
    }

    async fn apply(&self, order_id: Uuid, event: PaymentEvent) -> AppResult<WebhookOutcome> {
        let outcome = match event.status {
            EventStatus::Completed => {
                match self
                    .settlement
                    .apply_payment(order_id, PaymentSource::Gateway(event))
                    .await?
                {
                    SettlementOutcome::Applied { .. } => WebhookOutcome::Applied,
                    SettlementOutcome::NotApplicable(_) => WebhookOutcome::IgnoredNotApplicable,
                    SettlementOutcome::AmountMismatch { .. } => WebhookOutcome::AmountMismatch,
                }
            }
            EventStatus::Failed => transition_outcome(
                self.settlement.apply_failure(order_id, Some(&event)).await?,
            ),
            EventStatus::Refunded => {
                self.settlement.record_status(order_id, &event).await?;
                transition_outcome(self.settlement.apply_refund(order_id).await?)
            }
            EventStatus::Pending | EventStatus::InReview => {
                self.settlement.record_status(order_id, &event).await?;
                WebhookOutcome::PaymentUpdated
            }
        };
        Ok(outcome)
    }
}

fn transition_outcome(transition: Transition) -> WebhookOutcome {
    match transition {
        Transition::Applied(_) => WebhookOutcome::Applied,
        Transition::NotApplicable(_) => WebhookOutcome::IgnoredNotApplicable,
    }
}
