use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::*;
use uuid::Uuid;

use crate::store::WebhookLog;

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::events)]
pub struct DbEvent {
    pub id: Uuid,
    pub name: String,
    pub published: bool,
    pub sale_starts_at: Option<DateTime<Utc>>,
    pub sale_ends_at: Option<DateTime<Utc>>,
    pub checked_in_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::ticket_templates)]
pub struct DbTicketTemplate {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub price: BigDecimal,
    pub currency: String,
    pub total_quantity: i32,
    pub reserved: i32,
    pub sold: i32,
    pub max_per_order: Option<i32>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::buyers)]
pub struct DbBuyer {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::buyers)]
pub struct NewBuyer {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct DbOrder {
    pub id: Uuid,
    pub event_id: Uuid,
    pub buyer_id: Uuid,
    pub status: String,
    pub total: BigDecimal,
    pub currency: String,
    pub access_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct DbOrderItem {
    pub order_id: Uuid,
    pub template_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct DbReservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub template_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct NewReservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub template_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::payments)]
pub struct DbPayment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub gateway: String,
    pub external_id: Option<String>,
    pub attempt: i32,
    pub idempotency_key: String,
    pub status: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub raw_payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::rp_profiles)]
pub struct DbRpProfile {
    pub id: Uuid,
    pub event_id: Uuid,
    pub code: String,
    pub display_name: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_tickets: Option<i32>,
    pub tickets_generated: i32,
    pub tickets_used: i32,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::guest_types)]
pub struct DbGuestType {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::tickets)]
pub struct DbTicket {
    pub id: Uuid,
    pub event_id: Uuid,
    pub order_id: Option<Uuid>,
    pub rp_profile_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    pub guest_type_id: Option<Uuid>,
    pub unit_index: i32,
    pub qr_code: String,
    pub status: String,
    pub holder_name: Option<String>,
    pub nickname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::webhook_logs)]
pub struct DbWebhookLog {
    pub id: Uuid,
    pub gateway: String,
    pub external_event_id: Option<String>,
    pub event_type: Option<String>,
    pub verified: bool,
    pub order_id: Option<Uuid>,
    pub outcome: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::webhook_logs)]
pub struct NewDbWebhookLog {
    pub id: Uuid,
    pub gateway: String,
    pub external_event_id: Option<String>,
    pub event_type: Option<String>,
    pub verified: bool,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl From<DbEvent> for Event {
    fn from(db: DbEvent) -> Self {
        Self {
            id: db.id,
            name: db.name,
            published: db.published,
            sale_starts_at: db.sale_starts_at,
            sale_ends_at: db.sale_ends_at,
            checked_in_count: db.checked_in_count,
        }
    }
}

impl From<DbTicketTemplate> for TicketTemplate {
    fn from(db: DbTicketTemplate) -> Self {
        Self {
            id: db.id,
            event_id: db.event_id,
            name: db.name,
            price: db.price,
            currency: db.currency,
            total_quantity: db.total_quantity,
            reserved: db.reserved,
            sold: db.sold,
            max_per_order: db.max_per_order,
        }
    }
}

impl From<DbBuyer> for Buyer {
    fn from(db: DbBuyer) -> Self {
        Self {
            id: db.id,
            email: db.email,
            name: db.name,
            phone: db.phone,
        }
    }
}

impl DbOrder {
    pub fn new(order: &Order) -> Self {
        Self {
            id: order.id,
            event_id: order.event_id,
            buyer_id: order.buyer_id,
            status: order.status.to_string(),
            total: order.total.clone(),
            currency: order.currency.clone(),
            access_token: order.access_token.clone(),
            created_at: order.created_at,
            expires_at: order.expires_at,
            paid_at: order.paid_at,
            updated_at: order.created_at,
        }
    }

    pub fn into_order(self, items: Vec<DbOrderItem>) -> anyhow::Result<Order> {
        Ok(Order {
            id: self.id,
            event_id: self.event_id,
            buyer_id: self.buyer_id,
            items: items
                .into_iter()
                .map(|item| OrderItem {
                    template_id: item.template_id,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .collect(),
            status: self.status.parse()?,
            total: self.total,
            currency: self.currency,
            access_token: self.access_token,
            created_at: self.created_at,
            expires_at: self.expires_at,
            paid_at: self.paid_at,
        })
    }
}

impl TryFrom<DbReservation> for Reservation {
    type Error = anyhow::Error;

    fn try_from(db: DbReservation) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db.id,
            order_id: db.order_id,
            template_id: db.template_id,
            quantity: db.quantity,
            status: db.status.parse()?,
            expires_at: db.expires_at,
        })
    }
}

impl From<&Payment> for DbPayment {
    fn from(payment: &Payment) -> Self {
        Self {
            id: payment.id,
            order_id: payment.order_id,
            gateway: payment.gateway.to_string(),
            external_id: payment.external_id.clone(),
            attempt: payment.attempt,
            idempotency_key: payment.idempotency_key.clone(),
            status: payment.status.to_string(),
            amount: payment.amount.clone(),
            currency: payment.currency.clone(),
            raw_payload: payment.raw_payload.clone(),
            created_at: payment.created_at,
            updated_at: payment.updated_at,
        }
    }
}

impl TryFrom<DbPayment> for Payment {
    type Error = anyhow::Error;

    fn try_from(db: DbPayment) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db.id,
            order_id: db.order_id,
            gateway: db.gateway.parse()?,
            external_id: db.external_id,
            attempt: db.attempt,
            idempotency_key: db.idempotency_key,
            status: db.status.parse()?,
            amount: db.amount,
            currency: db.currency,
            raw_payload: db.raw_payload,
            created_at: db.created_at,
            updated_at: db.updated_at,
        })
    }
}

impl From<DbRpProfile> for RpProfile {
    fn from(db: DbRpProfile) -> Self {
        Self {
            id: db.id,
            event_id: db.event_id,
            code: db.code,
            display_name: db.display_name,
            active: db.active,
            expires_at: db.expires_at,
            max_tickets: db.max_tickets,
            tickets_generated: db.tickets_generated,
            tickets_used: db.tickets_used,
        }
    }
}

impl From<DbGuestType> for GuestType {
    fn from(db: DbGuestType) -> Self {
        Self {
            id: db.id,
            event_id: db.event_id,
            name: db.name,
        }
    }
}

impl From<&Ticket> for DbTicket {
    fn from(ticket: &Ticket) -> Self {
        Self {
            id: ticket.id,
            event_id: ticket.event_id,
            order_id: ticket.order_id,
            rp_profile_id: ticket.rp_profile_id,
            template_id: ticket.template_id,
            guest_type_id: ticket.guest_type_id,
            unit_index: ticket.unit_index,
            qr_code: ticket.qr_code.clone(),
            status: ticket.status.to_string(),
            holder_name: ticket.holder_name.clone(),
            nickname: ticket.nickname.clone(),
            created_at: ticket.created_at,
            used_at: ticket.used_at,
        }
    }
}

impl TryFrom<DbTicket> for Ticket {
    type Error = anyhow::Error;

    fn try_from(db: DbTicket) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db.id,
            event_id: db.event_id,
            order_id: db.order_id,
            rp_profile_id: db.rp_profile_id,
            template_id: db.template_id,
            guest_type_id: db.guest_type_id,
            unit_index: db.unit_index,
            qr_code: db.qr_code,
            status: db.status.parse()?,
            holder_name: db.holder_name,
            nickname: db.nickname,
            created_at: db.created_at,
            used_at: db.used_at,
        })
    }
}

impl TryFrom<DbWebhookLog> for WebhookLog {
    type Error = anyhow::Error;

    fn try_from(db: DbWebhookLog) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db.id,
            gateway: db.gateway.parse()?,
            external_event_id: db.external_event_id,
            event_type: db.event_type,
            verified: db.verified,
            order_id: db.order_id,
            outcome: db.outcome,
            payload: db.payload,
            created_at: db.created_at,
            processed_at: db.processed_at,
        })
    }
}

impl From<OutboxEvent> for DbOutboxEvent {
    fn from(event: OutboxEvent) -> Self {
        Self {
            id: event.id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            event_data: event.event_data,
            processed: event.processed,
            created_at: event.created_at,
        }
    }
}

impl From<DbOutboxEvent> for OutboxEvent {
    fn from(db: DbOutboxEvent) -> Self {
        Self {
            id: db.id,
            aggregate_id: db.aggregate_id,
            event_type: db.event_type,
            event_data: db.event_data,
            processed: db.processed,
            created_at: db.created_at,
        }
    }
}
