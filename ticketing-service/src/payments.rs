use payment_gateways::{
    with_retries, ChargeRequest, GatewayRegistry, IntentRequest, PaymentGateway, PaymentIntent,
    RetryPolicy,
};
use serde::Serialize;
use shared::{
    EventStatus, Gateway, IdempotencyKey, Order, OrderStatus, Payment, PaymentMethod,
    PaymentStatus, Ticket,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checkout::authorize_order;
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::settlement::{PaymentSource, Settlement, SettlementOutcome};
use crate::store::{StoreError, TicketingStore};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeOutcome {
    pub payment_status: EventStatus,
    pub order_status: OrderStatus,
    pub tickets: Vec<Ticket>,
}

/// Storefront side of the payment: asks a provider for what the buyer needs to pay.
///
/// Nothing here settles an order on its own. A synchronous charge answer is handed to
/// [`Settlement`] exactly like a webhook would be.
#[derive(Clone)]
pub struct PaymentIntents {
    store: Arc<dyn TicketingStore>,
    registry: GatewayRegistry,
    settlement: Settlement,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl PaymentIntents {
    pub fn new(
        store: Arc<dyn TicketingStore>,
        registry: GatewayRegistry,
        settlement: Settlement,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            settlement,
            clock,
            retry,
        }
    }

    async fn payable_order(&self, order_id: Uuid, access_token: &str) -> AppResult<Order> {
        let order = authorize_order(self.store.as_ref(), order_id, access_token).await?;
        if order.status != OrderStatus::Pending {
            return Err(AppError::Conflict(format!(
                "order {} is {} and cannot be paid",
                order.id, order.status
            )));
        }
        if order.is_past_expiry(self.clock.now()) {
            return Err(AppError::Conflict(format!(
                "order {} reservation window has ended",
                order.id
            )));
        }
        Ok(order)
    }

    fn gateway(&self, kind: Gateway) -> AppResult<Arc<dyn PaymentGateway>> {
        self.registry
            .get(kind)
            .ok_or_else(|| AppError::Validation(format!("gateway {} is not available", kind)))
    }

    /// Records the attempt. A concurrent call that claimed the same attempt number already
    /// recorded it under the same idempotency key.
    async fn record_attempt(
        &self,
        order: &Order,
        gateway: Gateway,
        attempt: i32,
        key: &IdempotencyKey,
        external_id: &str,
        raw: serde_json::Value,
    ) -> AppResult<()> {
        let now = self.clock.now();
        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: order.id,
            gateway,
            external_id: Some(external_id.to_string()),
            attempt,
            idempotency_key: key.to_string(),
            status: PaymentStatus::Pending,
            amount: order.total.clone(),
            currency: order.currency.clone(),
            raw_payload: Some(raw),
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_payment(&payment).await {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict(reason)) => {
                warn!(order_id = %order.id, attempt, reason = %reason, "payment attempt already recorded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_intent(
        &self,
        order_id: Uuid,
        access_token: &str,
        kind: Gateway,
        method: PaymentMethod,
        return_url: Option<&str>,
    ) -> AppResult<PaymentIntent> {
        let order = self.payable_order(order_id, access_token).await?;
        let gateway = self.gateway(kind)?;
        if !gateway.supports(method) {
            return Err(AppError::Validation(format!(
                "gateway {} does not accept {}",
                kind, method
            )));
        }
        let buyer = self.store.get_buyer(order.buyer_id).await?;

        let attempt = self.store.next_payment_attempt(order.id).await?;
        let key = IdempotencyKey::for_attempt(order.id, attempt);
        let request = IntentRequest {
            order: &order,
            buyer: &buyer,
            method,
            idempotency_key: &key,
            return_url,
        };

        let intent = with_retries(self.retry, "create_intent", || gateway.create_intent(request)).await?;
        let raw = serde_json::to_value(&intent)
            .map_err(|e| AppError::Internal(format!("encoding intent: {}", e)))?;
        self.record_attempt(&order, kind, attempt, &key, &intent.external_id, raw)
            .await?;

        info!(
            order_id = %order.id,
            gateway = %kind,
            attempt,
            external_id = %intent.external_id,
            "payment intent created"
        );
        Ok(intent)
    }

    /// Charges a client-side card token and settles a final answer right away.
    pub async fn charge(
        &self,
        order_id: Uuid,
        access_token: &str,
        kind: Gateway,
        token: &str,
    ) -> AppResult<ChargeOutcome> {
        if token.trim().is_empty() {
            return Err(AppError::Validation("payment token is required".to_string()));
        }
        let order = self.payable_order(order_id, access_token).await?;
        let gateway = self.gateway(kind)?;
        let buyer = self.store.get_buyer(order.buyer_id).await?;

        let attempt = self.store.next_payment_attempt(order.id).await?;
        let key = IdempotencyKey::for_attempt(order.id, attempt);
        let request = ChargeRequest {
            order: &order,
            buyer: &buyer,
            token,
            idempotency_key: &key,
        };

        let result = with_retries(self.retry, "charge_token", || gateway.charge_token(request)).await?;
        self.record_attempt(
            &order,
            kind,
            attempt,
            &key,
            &result.external_id,
            result.raw.clone(),
        )
        .await?;

        let event = result.into_event(order.id.to_string());
        let payment_status = event.status;
        info!(order_id = %order.id, gateway = %kind, status = %payment_status, "card charged");

        let tickets = match payment_status {
            EventStatus::Completed => {
                match self
                    .settlement
                    .apply_payment(order.id, PaymentSource::Gateway(event))
                    .await?
                {
                    SettlementOutcome::Applied { tickets, .. } => tickets,
                    SettlementOutcome::NotApplicable(_) => {
                        self.store.tickets_for_order(order.id).await?
                    }
                    SettlementOutcome::AmountMismatch { .. } => Vec::new(),
                }
            }
            EventStatus::Failed => {
                self.settlement.apply_failure(order.id, Some(&event)).await?;
                Vec::new()
            }
            _ => {
                self.settlement.record_status(order.id, &event).await?;
                Vec::new()
            }
        };

        let order = self.store.get_order(order.id).await?;
        Ok(ChargeOutcome {
            payment_status,
            order_status: order.status,
            tickets,
        })
    }
}
