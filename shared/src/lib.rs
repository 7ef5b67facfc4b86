use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Declares a status enum that is persisted as a lowercase string column.
macro_rules! stored_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow::anyhow!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    )),
                }
            }
        }
    };
}

stored_enum!(
    OrderStatus {
        Pending => "pending",
        Paid => "paid",
        Expired => "expired",
        Cancelled => "cancelled",
        Refunded => "refunded",
    }
);

stored_enum!(
    TicketStatus {
        Valid => "valid",
        Used => "used",
        Cancelled => "cancelled",
    }
);

stored_enum!(
    PaymentStatus {
        Pending => "pending",
        InReview => "in_review",
        Completed => "completed",
        Failed => "failed",
        Refunded => "refunded",
    }
);

stored_enum!(
    /// Lifecycle of a single inventory hold. Only `Held` rows can move.
    ReservationStatus {
        Held => "held",
        Committed => "committed",
        Released => "released",
    }
);

stored_enum!(
    /// Payment providers. The text form doubles as the `/webhooks/{gateway}` path segment.
    Gateway {
        WalletRedirect => "wallet",
        HostedCard => "card",
        BankReference => "bank",
        CashVoucher => "voucher",
        Manual => "manual",
    }
);

stored_enum!(
    PaymentMethod {
        Wallet => "wallet",
        Card => "card",
        BankTransfer => "bank_transfer",
        CashVoucher => "cash_voucher",
    }
);

stored_enum!(
    /// Gateway-neutral payment status carried by a verified webhook.
    EventStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        InReview => "in_review",
        Refunded => "refunded",
    }
);

impl OrderStatus {
    /// Terminal states never move again, except the explicit `Paid -> Refunded` path.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl From<EventStatus> for PaymentStatus {
    fn from(status: EventStatus) -> Self {
        match status {
            EventStatus::Pending => PaymentStatus::Pending,
            EventStatus::Completed => PaymentStatus::Completed,
            EventStatus::Failed => PaymentStatus::Failed,
            EventStatus::InReview => PaymentStatus::InReview,
            EventStatus::Refunded => PaymentStatus::Refunded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub published: bool,
    pub sale_starts_at: Option<DateTime<Utc>>,
    pub sale_ends_at: Option<DateTime<Utc>>,
    pub checked_in_count: i32,
}

impl Event {
    pub fn on_sale(&self, now: DateTime<Utc>) -> bool {
        self.published
            && self.sale_starts_at.map_or(true, |start| start <= now)
            && self.sale_ends_at.map_or(true, |end| now < end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketTemplate {
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

impl TicketTemplate {
    pub fn available(&self) -> i32 {
        self.total_quantity - self.reserved - self.sold
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buyer {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerInfo {
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub template_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub event_id: Uuid,
    pub buyer_id: Uuid,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub total: BigDecimal,
    pub currency: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn ticket_count(&self) -> i32 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub template_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub gateway: Gateway,
    pub external_id: Option<String>,
    pub attempt: i32,
    pub idempotency_key: String,
    pub status: PaymentStatus,
    pub amount: BigDecimal,
    pub currency: String,
    pub raw_payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub event_id: Uuid,
    pub order_id: Option<Uuid>,
    pub rp_profile_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    pub guest_type_id: Option<Uuid>,
    pub unit_index: i32,
    pub qr_code: String,
    pub status: TicketStatus,
    pub holder_name: Option<String>,
    pub nickname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpProfile {
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

impl RpProfile {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |expires| now < expires)
    }

    pub fn has_quota(&self) -> bool {
        self.max_tickets
            .map_or(true, |max| self.tickets_generated < max)
    }

    /// `None` means the profile is uncapped.
    pub fn remaining(&self) -> Option<i32> {
        self.max_tickets
            .map(|max| (max - self.tickets_generated).max(0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestType {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
}

/// A verified webhook, reduced to the vocabulary shared by every gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub gateway: Gateway,
    pub external_event_id: String,
    pub external_payment_id: String,
    pub order_reference: Option<String>,
    pub status: EventStatus,
    pub amount: BigDecimal,
    pub currency: String,
    pub event_type: String,
    pub raw: serde_json::Value,
}

/// Stable key for one charge attempt, so a retried call can be deduplicated by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn for_attempt(order_id: Uuid, attempt: i32) -> Self {
        Self(format!("{}-{}", order_id, attempt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredTicket {
    pub ticket_id: Uuid,
    pub template_id: Option<Uuid>,
    pub qr_code: String,
}

/// Hand-off to the email sender once an order's tickets exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketDelivery {
    pub order_id: Uuid,
    pub event_id: Uuid,
    pub recipient_email: String,
    pub recipient_name: String,
    pub tickets: Vec<DeliveredTicket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

pub const TICKETS_ISSUED: &str = "TicketsIssued";

impl OutboxEvent {
    pub fn tickets_issued(delivery: &TicketDelivery, now: DateTime<Utc>) -> serde_json::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id: delivery.order_id,
            event_type: TICKETS_ISSUED.to_string(),
            event_data: serde_json::to_value(delivery)?,
            processed: false,
            created_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn stored_enums_round_trip_through_text() {
        assert_eq!("in_review".parse::<PaymentStatus>().unwrap(), PaymentStatus::InReview);
        assert_eq!(Gateway::CashVoucher.as_str(), "voucher");
        assert!("paid-ish".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn only_pending_orders_are_open() {
        assert!(!OrderStatus::Pending.is_terminal());
        for status in [
            OrderStatus::Paid,
            OrderStatus::Expired,
            OrderStatus::Cancelled,
            OrderStatus::Refunded,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn sale_window_bounds() {
        let now = Utc::now();
        let mut event = Event {
            id: Uuid::new_v4(),
            name: "Showcase".to_string(),
            published: true,
            sale_starts_at: Some(now - Duration::hours(1)),
            sale_ends_at: Some(now + Duration::hours(1)),
            checked_in_count: 0,
        };
        assert!(event.on_sale(now));

        event.sale_ends_at = Some(now);
        assert!(!event.on_sale(now));

        event.sale_ends_at = None;
        event.published = false;
        assert!(!event.on_sale(now));
    }

    #[test]
    fn rp_quota_arithmetic() {
        let mut profile = RpProfile {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            code: "RP-ANA".to_string(),
            display_name: "Ana".to_string(),
            active: true,
            expires_at: None,
            max_tickets: Some(2),
            tickets_generated: 1,
            tickets_used: 0,
        };
        assert!(profile.has_quota());
        assert_eq!(profile.remaining(), Some(1));

        profile.tickets_generated = 2;
        assert!(!profile.has_quota());
        assert_eq!(profile.remaining(), Some(0));

        profile.max_tickets = None;
        assert!(profile.has_quota());
        assert_eq!(profile.remaining(), None);
    }

    #[test]
    fn idempotency_key_is_stable_per_attempt() {
        let order_id = Uuid::new_v4();
        assert_eq!(
            IdempotencyKey::for_attempt(order_id, 2),
            IdempotencyKey::for_attempt(order_id, 2)
        );
        assert_ne!(
            IdempotencyKey::for_attempt(order_id, 1),
            IdempotencyKey::for_attempt(order_id, 2)
        );
    }
}
