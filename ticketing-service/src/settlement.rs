//! The only place order status moves after checkout.
//!
//! Webhooks, synchronous card charges, operator confirmations and the expiry sweep all funnel
//! into these calls. Every transition is a status-guarded update in the store, so whichever
//! caller reaches the store first wins and the others observe [`Transition::NotApplicable`].

use bigdecimal::BigDecimal;
use serde_json::json;
use shared::{Gateway, Order, OrderStatus, PaymentEvent, PaymentStatus, Ticket};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppResult;
use crate::issuer::TicketIssuer;
use crate::store::{PaymentUpdate, SettledPayment, TicketingStore, Transition};

#[derive(Debug, Clone)]
pub enum PaymentSource {
    Gateway(PaymentEvent),
    Manual {
        operator: String,
        reference: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    Applied { order: Order, tickets: Vec<Ticket> },
    NotApplicable(OrderStatus),
    AmountMismatch {
        expected: BigDecimal,
        received: BigDecimal,
    },
}

#[derive(Clone)]
pub struct Settlement {
    store: Arc<dyn TicketingStore>,
    issuer: TicketIssuer,
    clock: Arc<dyn Clock>,
}

impl Settlement {
    pub fn new(store: Arc<dyn TicketingStore>, issuer: TicketIssuer, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            issuer,
            clock,
        }
    }

    /// `Pending -> Paid`, then ticket issuance.
    ///
    /// A payment that arrives after `expires_at` but before the sweep still wins: only the
    /// current status is checked, never the clock.
    pub async fn apply_payment(
        &self,
        order_id: Uuid,
        source: PaymentSource,
    ) -> AppResult<SettlementOutcome> {
        let order = self.store.get_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            return self.not_applicable(&order).await;
        }

        if let PaymentSource::Gateway(event) = &source {
            let same_currency = event.currency.eq_ignore_ascii_case(&order.currency);
            if event.amount != order.total || !same_currency {
                warn!(
                    order_id = %order_id,
                    gateway = %event.gateway,
                    expected = %order.total,
                    received = %event.amount,
                    currency = %event.currency,
                    "AMOUNT_MISMATCH: payment does not cover the order, left pending"
                );
                return Ok(SettlementOutcome::AmountMismatch {
                    expected: order.total,
                    received: event.amount.clone(),
                });
            }
        }

        let settled = match source {
            PaymentSource::Gateway(event) => SettledPayment {
                gateway: event.gateway,
                external_id: Some(event.external_payment_id),
                amount: event.amount,
                currency: event.currency,
                raw: Some(event.raw),
            },
            PaymentSource::Manual {
                operator,
                reference,
            } => {
                info!(order_id = %order_id, operator = %operator, "manual completion");
                SettledPayment {
                    gateway: Gateway::Manual,
                    external_id: None,
                    amount: order.total.clone(),
                    currency: order.currency.clone(),
                    raw: Some(json!({ "operator": operator, "reference": reference })),
                }
            }
        };

        let now = self.clock.now();
        match self.store.mark_order_paid(order_id, settled, now).await? {
            Transition::Applied(order) => {
                info!(order_id = %order.id, total = %order.total, "order paid");
                let tickets = self.issuer.issue_for_order(order.id).await?;
                Ok(SettlementOutcome::Applied { order, tickets })
            }
            Transition::NotApplicable(_) => {
                let order = self.store.get_order(order_id).await?;
                self.not_applicable(&order).await
            }
        }
    }

    async fn not_applicable(&self, order: &Order) -> AppResult<SettlementOutcome> {
        info!(
            order_id = %order.id,
            status = %order.status,
            "payment ignored, not applicable"
        );
        if order.status == OrderStatus::Paid {
            // A previous settlement may have stopped between the transition and issuance.
            self.issuer.issue_for_order(order.id).await?;
        }
        Ok(SettlementOutcome::NotApplicable(order.status))
    }

    /// `Pending -> Cancelled` after the provider reported the payment as failed.
    pub async fn apply_failure(
        &self,
        order_id: Uuid,
        event: Option<&PaymentEvent>,
    ) -> AppResult<Transition> {
        if let Some(event) = event {
            self.record_status(order_id, event).await?;
        }
        let transition = self.close(order_id, OrderStatus::Cancelled).await?;
        if let Transition::Applied(_) = transition {
            info!(order_id = %order_id, "order cancelled after failed payment");
        }
        Ok(transition)
    }

    /// `Pending -> Expired`. Loses to any payment that reached the store first.
    pub async fn expire(&self, order_id: Uuid) -> AppResult<Transition> {
        self.close(order_id, OrderStatus::Expired).await
    }

    /// Buyer-initiated `Pending -> Cancelled`.
    pub async fn cancel(&self, order_id: Uuid) -> AppResult<Transition> {
        self.close(order_id, OrderStatus::Cancelled).await
    }

    /// `Paid -> Refunded`; unused tickets are cancelled, sold stock is not returned.
    pub async fn apply_refund(&self, order_id: Uuid) -> AppResult<Transition> {
        let transition = self.store.refund_order(order_id, self.clock.now()).await?;
        match &transition {
            Transition::Applied(order) => info!(order_id = %order.id, "order refunded"),
            Transition::NotApplicable(status) => {
                info!(order_id = %order_id, status = %status, "refund ignored, not applicable")
            }
        }
        Ok(transition)
    }

    /// Records a non-settling provider status on the matching payment attempt.
    pub async fn record_status(&self, order_id: Uuid, event: &PaymentEvent) -> AppResult<()> {
        let updated = self
            .store
            .update_payment_status(PaymentUpdate {
                order_id,
                gateway: event.gateway,
                external_id: event.external_payment_id.clone(),
                status: PaymentStatus::from(event.status),
                amount: event.amount.clone(),
                currency: event.currency.clone(),
                raw: event.raw.clone(),
                now: self.clock.now(),
            })
            .await?;

        match updated {
            Some(payment) => info!(
                order_id = %order_id,
                payment_id = %payment.id,
                status = %payment.status,
                "payment status updated"
            ),
            None => info!(
                order_id = %order_id,
                status = %event.status,
                "payment status ignored, attempt already final"
            ),
        }
        Ok(())
    }

    async fn close(&self, order_id: Uuid, status: OrderStatus) -> AppResult<Transition> {
        let transition = self
            .store
            .close_order(order_id, status, self.clock.now())
            .await?;
        match &transition {
            Transition::Applied(order) => {
                info!(order_id = %order.id, status = %status, "order closed, inventory released")
            }
            Transition::NotApplicable(current) => info!(
                order_id = %order_id,
                current = %current,
                requested = %status,
                "close ignored, not applicable"
            ),
        }
        Ok(transition)
    }
}
