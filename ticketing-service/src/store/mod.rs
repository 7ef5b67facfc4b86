//! Durable state behind one trait.
//!
//! Every method that touches a hot counter (`reserved`, `sold`, `tickets_generated`,
//! `tickets_used`, `checked_in_count`) performs its read-check-write as one atomic step in the
//! backend. Callers never cache those counters.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use shared::{
    Buyer, BuyerInfo, DeliveredTicket, Event, Gateway, GuestType, Order, OrderStatus, OutboxEvent,
    Payment, PaymentStatus, Reservation, RpProfile, Ticket, TicketDelivery, TicketTemplate,
};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub id: Uuid,
    pub order_id: Uuid,
    pub template_id: Uuid,
    pub quantity: i32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    Insufficient { available: i32 },
}

/// Result of a status-guarded order update.
#[derive(Debug, Clone)]
pub enum Transition {
    Applied(Order),
    /// The order was not in the required source state; nothing changed.
    NotApplicable(OrderStatus),
}

/// The payment row written together with a `Pending -> Paid` transition.
#[derive(Debug, Clone)]
pub struct SettledPayment {
    pub gateway: Gateway,
    pub external_id: Option<String>,
    pub amount: BigDecimal,
    pub currency: String,
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    pub order_id: Uuid,
    pub gateway: Gateway,
    pub external_id: String,
    pub status: PaymentStatus,
    pub amount: BigDecimal,
    pub currency: String,
    pub raw: serde_json::Value,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct IssuedTickets {
    pub tickets: Vec<Ticket>,
    /// False when every ticket already existed.
    pub created: bool,
}

#[derive(Debug, Clone)]
pub enum QuotaOutcome {
    Granted(Ticket),
    Exhausted,
}

#[derive(Debug, Clone)]
pub enum CheckInOutcome {
    CheckedIn(Ticket),
    AlreadyUsed(Ticket),
    Cancelled(Ticket),
}

#[derive(Debug, Clone)]
pub struct NewWebhookLog {
    pub id: Uuid,
    pub gateway: Gateway,
    pub external_event_id: Option<String>,
    pub event_type: Option<String>,
    pub verified: bool,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAppend {
    Inserted(Uuid),
    /// `(gateway, external_event_id)` was already logged. `processed` is false when an earlier
    /// delivery was logged but never finished.
    Duplicate { id: Uuid, processed: bool },
}

#[derive(Debug, Clone)]
pub struct WebhookLog {
    pub id: Uuid,
    pub gateway: Gateway,
    pub external_event_id: Option<String>,
    pub event_type: Option<String>,
    pub verified: bool,
    pub order_id: Option<Uuid>,
    pub outcome: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TicketingStore: Send + Sync {
    async fn get_event(&self, id: Uuid) -> StoreResult<Event>;
    async fn get_template(&self, id: Uuid) -> StoreResult<TicketTemplate>;
    async fn get_guest_type(&self, id: Uuid) -> StoreResult<GuestType>;
    async fn guest_types_for_event(&self, event_id: Uuid) -> StoreResult<Vec<GuestType>>;
    async fn find_rp_profile(&self, code: &str) -> StoreResult<Option<RpProfile>>;

    /// Buyers are deduplicated by email; a repeat checkout refreshes name and phone.
    async fn upsert_buyer(&self, info: &BuyerInfo) -> StoreResult<Buyer>;
    async fn get_buyer(&self, id: Uuid) -> StoreResult<Buyer>;

    async fn reserve(&self, request: ReserveRequest) -> StoreResult<ReserveOutcome>;
    /// Moves a `Held` reservation into `sold`. Returns false when it was not held.
    async fn commit_reservation(&self, id: Uuid) -> StoreResult<bool>;
    /// Returns a `Held` reservation to the free pool. Returns false when it was not held.
    async fn release_reservation(&self, id: Uuid) -> StoreResult<bool>;
    async fn reservations_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Reservation>>;
    /// Held reservations past their expiry whose order row was never written.
    async fn orphaned_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Reservation>>;

    async fn insert_order(&self, order: &Order) -> StoreResult<()>;
    async fn get_order(&self, id: Uuid) -> StoreResult<Order>;
    /// `Pending -> Paid`, committing held reservations and recording the completed payment, in
    /// one atomic step.
    async fn mark_order_paid(
        &self,
        order_id: Uuid,
        payment: SettledPayment,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition>;
    /// `Pending -> Cancelled | Expired`, releasing held reservations.
    async fn close_order(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition>;
    /// `Paid -> Refunded`, cancelling unused tickets. Inventory is left untouched.
    async fn refund_order(&self, order_id: Uuid, now: DateTime<Utc>) -> StoreResult<Transition>;
    async fn expired_pending_orders(&self, now: DateTime<Utc>, limit: i64)
        -> StoreResult<Vec<Order>>;
    async fn paid_orders_without_tickets(&self, limit: i64) -> StoreResult<Vec<Uuid>>;

    async fn next_payment_attempt(&self, order_id: Uuid) -> StoreResult<i32>;
    /// Fails with `Conflict` when the idempotency key or `(gateway, external_id)` already exists.
    async fn insert_payment(&self, payment: &Payment) -> StoreResult<()>;
    async fn find_payment(&self, gateway: Gateway, external_id: &str)
        -> StoreResult<Option<Payment>>;
    /// Records a non-settling status. A completed payment only ever moves to refunded.
    async fn update_payment_status(&self, update: PaymentUpdate) -> StoreResult<Option<Payment>>;
    async fn payments_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Payment>>;

    /// Inserts the tickets that do not exist yet and, if any were new, the delivery outbox row,
    /// in one atomic step. Returns every ticket of the order.
    async fn issue_tickets(
        &self,
        order_id: Uuid,
        tickets: Vec<Ticket>,
        recipient: Recipient,
        now: DateTime<Utc>,
    ) -> StoreResult<IssuedTickets>;
    async fn tickets_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Ticket>>;
    /// Checks and increments the profile quota and inserts the ticket in one atomic step.
    async fn generate_rp_ticket(&self, profile_id: Uuid, ticket: Ticket)
        -> StoreResult<QuotaOutcome>;
    async fn get_ticket_by_qr(&self, qr_code: &str) -> StoreResult<Ticket>;
    /// Status-guarded `Valid -> Used`, bumping the attendance counters of the event and, for
    /// courtesy tickets, the promoter.
    async fn check_in(&self, qr_code: &str, now: DateTime<Utc>) -> StoreResult<CheckInOutcome>;

    async fn append_webhook(&self, entry: NewWebhookLog) -> StoreResult<WebhookAppend>;
    async fn finish_webhook(
        &self,
        id: Uuid,
        order_id: Option<Uuid>,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn get_webhook(&self, id: Uuid) -> StoreResult<WebhookLog>;

    async fn pending_outbox(&self, limit: i64) -> StoreResult<Vec<OutboxEvent>>;
    async fn mark_outbox_processed(&self, id: Uuid) -> StoreResult<()>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}

/// Builds the delivery hand-off written next to freshly issued tickets.
pub(crate) fn delivery_event(
    order_id: Uuid,
    recipient: &Recipient,
    tickets: &[Ticket],
    now: DateTime<Utc>,
) -> StoreResult<OutboxEvent> {
    let event_id = tickets
        .first()
        .map(|ticket| ticket.event_id)
        .ok_or_else(|| StoreError::Conflict(format!("order {} has no tickets", order_id)))?;

    let delivery = TicketDelivery {
        order_id,
        event_id,
        recipient_email: recipient.email.clone(),
        recipient_name: recipient.name.clone(),
        tickets: tickets
            .iter()
            .map(|ticket| DeliveredTicket {
                ticket_id: ticket.id,
                template_id: ticket.template_id,
                qr_code: ticket.qr_code.clone(),
            })
            .collect(),
    };

    OutboxEvent::tickets_issued(&delivery, now)
        .map_err(|e| StoreError::Unexpected(anyhow::anyhow!("encoding ticket delivery: {}", e)))
}

/// Payment rows a status update may settle onto, in priority order: the exact provider id, then
/// the latest still-open attempt for the same order and gateway.
pub(crate) fn payment_target<'a>(
    payments: impl Iterator<Item = &'a Payment>,
    order_id: Uuid,
    gateway: Gateway,
    external_id: Option<&str>,
) -> Option<Uuid> {
    let candidates: Vec<&Payment> = payments
        .filter(|payment| payment.order_id == order_id && payment.gateway == gateway)
        .collect();

    if let Some(external_id) = external_id {
        if let Some(exact) = candidates
            .iter()
            .find(|payment| payment.external_id.as_deref() == Some(external_id))
        {
            return Some(exact.id);
        }
    }

    candidates
        .iter()
        .filter(|payment| {
            matches!(payment.status, PaymentStatus::Pending | PaymentStatus::InReview)
        })
        .max_by_key(|payment| payment.attempt)
        .map(|payment| payment.id)
}

/// Whether a payment row in `from` may be overwritten with `to`.
pub(crate) fn payment_may_move(from: PaymentStatus, to: PaymentStatus) -> bool {
    match from {
        PaymentStatus::Pending | PaymentStatus::InReview => true,
        PaymentStatus::Completed => to == PaymentStatus::Refunded,
        PaymentStatus::Failed | PaymentStatus::Refunded => false,
    }
}
