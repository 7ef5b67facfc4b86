#![allow(dead_code)]

use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use payment_gateways::{GatewayRegistry, MockGateway, MockWebhook, RetryPolicy};
use axum::http::HeaderMap;
use shared::{
    BuyerInfo, EventStatus, Event, Gateway, GuestType, Order, PaymentMethod, RpProfile,
    TicketTemplate,
};
use std::str::FromStr;
use std::sync::Arc;
use ticketing_service::checkout::{CheckoutRequest, LineRequest};
use ticketing_service::clock::ManualClock;
use ticketing_service::config::EngineConfig;
use ticketing_service::error::AppResult;
use ticketing_service::store::memory::MemoryStore;
use ticketing_service::Engine;
use uuid::Uuid;

pub const WALLET_SECRET: &str = "wallet-test-secret";
pub const CARD_SECRET: &str = "card-test-secret";

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub wallet: Arc<MockGateway>,
    pub card: Arc<MockGateway>,
    pub event_id: Uuid,
    pub other_event_id: Uuid,
    /// 10 units at 250.00 MXN.
    pub general: Uuid,
    /// 5 units at 900.00 MXN, at most 2 per order.
    pub vip: Uuid,
    pub foreign_template: Uuid,
    pub guest_type: Uuid,
    pub foreign_guest_type: Uuid,
}

pub fn money(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap()
}

fn template(id: Uuid, event_id: Uuid, name: &str, price: &str, total: i32, max: Option<i32>) -> TicketTemplate {
    TicketTemplate {
        id,
        event_id,
        name: name.to_string(),
        price: money(price),
        currency: "MXN".to_string(),
        total_quantity: total,
        reserved: 0,
        sold: 0,
        max_per_order: max,
    }
}

fn event(id: Uuid, name: &str) -> Event {
    Event {
        id,
        name: name.to_string(),
        published: true,
        sale_starts_at: None,
        sale_ends_at: None,
        checked_in_count: 0,
    }
}

pub async fn harness() -> Harness {
    harness_with(MockGateway::new(Gateway::HostedCard, CARD_SECRET)).await
}

/// Harness whose card gateway is the given mock.
pub async fn harness_with(card: MockGateway) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let wallet = Arc::new(MockGateway::new(Gateway::WalletRedirect, WALLET_SECRET));
    let card = Arc::new(card);

    let event_id = Uuid::new_v4();
    let other_event_id = Uuid::new_v4();
    let general = Uuid::new_v4();
    let vip = Uuid::new_v4();
    let foreign_template = Uuid::new_v4();
    let guest_type = Uuid::new_v4();
    let foreign_guest_type = Uuid::new_v4();

    store.seed_event(event(event_id, "Noche de Gala")).await;
    store.seed_event(event(other_event_id, "Matinee")).await;
    store
        .seed_template(template(general, event_id, "General", "250.00", 10, None))
        .await;
    store
        .seed_template(template(vip, event_id, "VIP", "900.00", 5, Some(2)))
        .await;
    store
        .seed_template(template(foreign_template, other_event_id, "Matinee", "100.00", 50, None))
        .await;
    store
        .seed_guest_type(GuestType {
            id: guest_type,
            event_id,
            name: "Guest list".to_string(),
        })
        .await;
    store
        .seed_guest_type(GuestType {
            id: foreign_guest_type,
            event_id: other_event_id,
            name: "Press".to_string(),
        })
        .await;

    let registry = GatewayRegistry::new()
        .with(wallet.clone())
        .with(card.clone());
    let config = EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
        },
        ..EngineConfig::default()
    };
    let engine = Engine::new(store.clone(), registry, clock.clone(), config);

    Harness {
        engine,
        store,
        clock,
        wallet,
        card,
        event_id,
        other_event_id,
        general,
        vip,
        foreign_template,
        guest_type,
        foreign_guest_type,
    }
}

pub fn buyer() -> BuyerInfo {
    BuyerInfo {
        email: "ana@example.com".to_string(),
        name: "Ana Torres".to_string(),
        phone: None,
    }
}

impl Harness {
    pub fn request(&self, lines: &[(Uuid, i32)]) -> CheckoutRequest {
        CheckoutRequest {
            event_id: self.event_id,
            items: lines
                .iter()
                .map(|(template_id, quantity)| LineRequest {
                    template_id: *template_id,
                    quantity: *quantity,
                })
                .collect(),
            buyer_info: buyer(),
            method: Some(PaymentMethod::Wallet),
        }
    }

    pub async fn open(&self, lines: &[(Uuid, i32)]) -> AppResult<Order> {
        self.engine.checkout.open(self.request(lines)).await
    }

    /// A pending order for `quantity` general admission tickets.
    pub async fn pending_order(&self, quantity: i32) -> Order {
        self.open(&[(self.general, quantity)]).await.unwrap()
    }

    pub fn wallet_webhook(
        &self,
        order: &Order,
        event_id: &str,
        status: EventStatus,
        amount: BigDecimal,
    ) -> (Vec<u8>, HeaderMap) {
        self.wallet
            .signed(&MockWebhook {
                event_id: event_id.to_string(),
                payment_id: format!("pay-{}", order.id),
                order_reference: Some(order.id.to_string()),
                status,
                amount,
                currency: "MXN".to_string(),
            })
            .unwrap()
    }

    /// Settles `order` through a signed wallet notification.
    pub async fn pay(&self, order: &Order) {
        let (body, headers) = self.wallet_webhook(
            order,
            &format!("evt-paid-{}", order.id),
            EventStatus::Completed,
            order.total.clone(),
        );
        self.engine
            .reconciler
            .handle("wallet", &body, &headers)
            .await
            .unwrap();
    }

    pub fn advance(&self, minutes: i64) {
        self.clock.advance(Duration::minutes(minutes));
    }

    pub async fn rp_profile(&self, code: &str, max_tickets: Option<i32>) -> RpProfile {
        let profile = RpProfile {
            id: Uuid::new_v4(),
            event_id: self.event_id,
            code: code.to_string(),
            display_name: format!("Promoter {}", code),
            active: true,
            expires_at: None,
            max_tickets,
            tickets_generated: 0,
            tickets_used: 0,
        };
        self.store.seed_rp_profile(profile.clone()).await;
        profile
    }
}
