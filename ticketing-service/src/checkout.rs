use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    BuyerInfo, Order, OrderItem, OrderStatus, PaymentMethod, PaymentStatus, Reservation, Gateway,
    TicketStatus,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{AppError, AppResult};
use crate::ledger::InventoryLedger;
use crate::settlement::{PaymentSource, Settlement, SettlementOutcome};
use crate::store::{StoreError, TicketingStore, Transition};
use crate::tokens::random_token;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRequest {
    pub template_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub event_id: Uuid,
    pub items: Vec<LineRequest>,
    pub buyer_info: BuyerInfo,
    /// Card flows get the shorter reservation window.
    #[serde(default)]
    pub method: Option<PaymentMethod>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryItem {
    pub template_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryTicket {
    pub id: Uuid,
    pub template_id: Option<Uuid>,
    pub qr_code: String,
    pub status: TicketStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryPayment {
    pub gateway: Gateway,
    pub attempt: i32,
    pub status: PaymentStatus,
}

/// What the payment page may show: the buyer's own order and nothing else.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub event_id: Uuid,
    pub status: OrderStatus,
    pub items: Vec<SummaryItem>,
    pub total: BigDecimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payments: Vec<SummaryPayment>,
    pub tickets: Vec<SummaryTicket>,
}

/// Fails with `NotFound` for unknown orders and for a wrong token alike.
pub(crate) async fn authorize_order(
    store: &dyn TicketingStore,
    order_id: Uuid,
    access_token: &str,
) -> AppResult<Order> {
    let order = store.get_order(order_id).await?;
    if access_token.is_empty() || order.access_token != access_token {
        return Err(AppError::NotFound(format!("order {}", order_id)));
    }
    Ok(order)
}

fn validate_buyer(buyer: &BuyerInfo) -> AppResult<BuyerInfo> {
    let email = buyer.email.trim().to_lowercase();
    let valid_email = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    };
    if !valid_email {
        return Err(AppError::Validation("buyer email is invalid".to_string()));
    }

    let name = buyer.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("buyer name is required".to_string()));
    }

    Ok(BuyerInfo {
        email,
        name: name.to_string(),
        phone: buyer
            .phone
            .as_deref()
            .map(str::trim)
            .filter(|phone| !phone.is_empty())
            .map(str::to_string),
    })
}

#[derive(Clone)]
pub struct CheckoutSession {
    store: Arc<dyn TicketingStore>,
    ledger: InventoryLedger,
    settlement: Settlement,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl CheckoutSession {
    pub fn new(
        store: Arc<dyn TicketingStore>,
        ledger: InventoryLedger,
        settlement: Settlement,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            settlement,
            clock,
            config,
        }
    }

    /// Validates the cart, holds every line or none, and writes a pending order.
    ///
    /// The returned order carries the access token the buyer needs for every later call.
    pub async fn open(&self, request: CheckoutRequest) -> AppResult<Order> {
        let now = self.clock.now();
        let max = self.config.max_tickets_per_purchase;

        if request.items.is_empty() {
            return Err(AppError::Validation("at least one item is required".to_string()));
        }
        let mut seen = HashSet::new();
        for line in &request.items {
            if !seen.insert(line.template_id) {
                return Err(AppError::Validation(format!(
                    "template {} appears more than once",
                    line.template_id
                )));
            }
            if line.quantity < 1 {
                return Err(AppError::Validation("quantities must be positive".to_string()));
            }
        }
        let requested: i64 = request.items.iter().map(|line| i64::from(line.quantity)).sum();
        if requested > i64::from(max) {
            return Err(AppError::Validation(format!(
                "at most {} tickets per purchase",
                max
            )));
        }
        let buyer_info = validate_buyer(&request.buyer_info)?;

        let event = self.store.get_event(request.event_id).await?;
        if !event.on_sale(now) {
            return Err(AppError::Validation(format!("event {} is not on sale", event.id)));
        }

        let mut items = Vec::with_capacity(request.items.len());
        let mut currency: Option<String> = None;
        for line in &request.items {
            let template = match self.store.get_template(line.template_id).await {
                Ok(template) => template,
                Err(StoreError::NotFound(_)) => {
                    return Err(AppError::Validation(format!(
                        "template {} does not exist",
                        line.template_id
                    )))
                }
                Err(e) => return Err(e.into()),
            };
            if template.event_id != event.id {
                return Err(AppError::Validation(format!(
                    "template {} does not belong to event {}",
                    template.id, event.id
                )));
            }
            let line_max = template.max_per_order.map_or(max, |limit| limit.min(max));
            if line.quantity > line_max {
                return Err(AppError::Validation(format!(
                    "at most {} of {} per purchase",
                    line_max, template.name
                )));
            }
            match &currency {
                Some(existing) if existing != &template.currency => {
                    return Err(AppError::Validation(
                        "all items must share one currency".to_string(),
                    ))
                }
                Some(_) => {}
                None => currency = Some(template.currency.clone()),
            }
            items.push(OrderItem {
                template_id: template.id,
                quantity: line.quantity,
                unit_price: template.price,
            });
        }
        let currency = currency.unwrap_or_default();

        let buyer = self.store.upsert_buyer(&buyer_info).await?;

        let window = match request.method {
            Some(PaymentMethod::Card) => self.config.card_reservation_window,
            _ => self.config.reservation_window,
        };
        let order_id = Uuid::new_v4();
        let expires_at = now + window;

        let mut held: Vec<Reservation> = Vec::with_capacity(items.len());
        for item in &items {
            match self
                .ledger
                .reserve(order_id, item.template_id, item.quantity, expires_at)
                .await
            {
                Ok(reservation) => held.push(reservation),
                Err(e) => {
                    self.ledger.release_all(&held).await;
                    return Err(e);
                }
            }
        }

        let total = items
            .iter()
            .map(|item| &item.unit_price * BigDecimal::from(item.quantity))
            .fold(BigDecimal::from(0), |acc, line| acc + line);

        let order = Order {
            id: order_id,
            event_id: event.id,
            buyer_id: buyer.id,
            items,
            status: OrderStatus::Pending,
            total,
            currency,
            access_token: random_token(),
            created_at: now,
            expires_at,
            paid_at: None,
        };

        if let Err(e) = self.store.insert_order(&order).await {
            error!(order_id = %order_id, error = %e, "failed to write order, releasing inventory");
            self.ledger.release_all(&held).await;
            return Err(e.into());
        }

        info!(
            order_id = %order.id,
            event_id = %order.event_id,
            tickets = order.ticket_count(),
            total = %order.total,
            expires_at = %order.expires_at,
            "checkout opened"
        );
        Ok(order)
    }

    pub async fn get_summary(&self, order_id: Uuid, access_token: &str) -> AppResult<OrderSummary> {
        let order = authorize_order(self.store.as_ref(), order_id, access_token).await?;

        let mut items = Vec::with_capacity(order.items.len());
        for item in &order.items {
            let template = self.store.get_template(item.template_id).await?;
            items.push(SummaryItem {
                template_id: item.template_id,
                name: template.name,
                quantity: item.quantity,
                unit_price: item.unit_price.clone(),
            });
        }

        let payments = self
            .store
            .payments_for_order(order.id)
            .await?
            .into_iter()
            .map(|payment| SummaryPayment {
                gateway: payment.gateway,
                attempt: payment.attempt,
                status: payment.status,
            })
            .collect();

        let tickets = self
            .store
            .tickets_for_order(order.id)
            .await?
            .into_iter()
            .map(|ticket| SummaryTicket {
                id: ticket.id,
                template_id: ticket.template_id,
                qr_code: ticket.qr_code,
                status: ticket.status,
            })
            .collect();

        Ok(OrderSummary {
            order_id: order.id,
            event_id: order.event_id,
            status: order.status,
            items,
            total: order.total,
            currency: order.currency,
            created_at: order.created_at,
            expires_at: order.expires_at,
            paid_at: order.paid_at,
            payments,
            tickets,
        })
    }

    /// Buyer abandons the order. A no-op once the order left `Pending`.
    pub async fn cancel(&self, order_id: Uuid, access_token: &str) -> AppResult<Order> {
        authorize_order(self.store.as_ref(), order_id, access_token).await?;
        match self.settlement.cancel(order_id).await? {
            Transition::Applied(order) => Ok(order),
            Transition::NotApplicable(_) => Ok(self.store.get_order(order_id).await?),
        }
    }

    /// Operator-confirmed payment, settled through the same path as a gateway notification.
    pub async fn complete_manually(
        &self,
        order_id: Uuid,
        operator: &str,
        reference: Option<String>,
    ) -> AppResult<SettlementOutcome> {
        self.settlement
            .apply_payment(
                order_id,
                PaymentSource::Manual {
                    operator: operator.to_string(),
                    reference,
                },
            )
            .await
    }
}
