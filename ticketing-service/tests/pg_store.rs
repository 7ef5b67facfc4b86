#![cfg(feature = "pg-tests")]

use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::future::join_all;
use payment_gateways::{GatewayRegistry, MockGateway, MockWebhook};
use shared::{BuyerInfo, EventStatus, Gateway, Order, PaymentMethod, PaymentStatus, TicketStatus};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use ticketing_service::checkout::{CheckoutRequest, LineRequest};
use ticketing_service::clock::ManualClock;
use ticketing_service::config::EngineConfig;
use ticketing_service::error::{AppError, AppResult};
use ticketing_service::models::DbTicketTemplate;
use ticketing_service::reconciler::WebhookOutcome;
use ticketing_service::rp::GuestRequest;
use ticketing_service::schema::{events, guest_types, rp_profiles, ticket_templates};
use ticketing_service::store::postgres::{run_migrations, PgStore};
use ticketing_service::store::TicketingStore;
use ticketing_service::Engine;
use uuid::Uuid;

const WALLET_SECRET: &str = "wallet-pg-secret";

static MIGRATED: OnceLock<Result<(), String>> = OnceLock::new();

struct PgHarness {
    engine: Engine,
    store: Arc<PgStore>,
    wallet: Arc<MockGateway>,
    event_id: Uuid,
    general: Uuid,
    guest_type: Uuid,
    email: String,
}

fn database_url() -> Option<String> {
    match std::env::var("TICKETING_TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("skipping pg-tests: set TICKETING_TEST_DATABASE_URL or DATABASE_URL");
            None
        }
    }
}

/// A fresh event with 10 general admission units and one guest type. Every harness gets its own
/// rows, so tests sharing the database do not see each other's counters.
async fn pg_harness() -> Option<PgHarness> {
    let url = database_url()?;
    if let Err(err) = MIGRATED.get_or_init(|| run_migrations(&url).map_err(|e| e.to_string())) {
        eprintln!("skipping pg-tests: cannot migrate postgres: {err}");
        return None;
    }
    let store = match PgStore::open(&url, 12).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("skipping pg-tests: connect postgres store failed: {err}");
            return None;
        }
    };

    let event_id = Uuid::new_v4();
    let general = Uuid::new_v4();
    let guest_type = Uuid::new_v4();
    let mut conn = AsyncPgConnection::establish(&url).await.expect("seed connection");
    diesel::insert_into(events::table)
        .values((
            events::id.eq(event_id),
            events::name.eq("Noche de Gala"),
            events::published.eq(true),
        ))
        .execute(&mut conn)
        .await
        .expect("event");
    diesel::insert_into(ticket_templates::table)
        .values(&DbTicketTemplate {
            id: general,
            event_id,
            name: "General".to_string(),
            price: BigDecimal::from_str("250.00").unwrap(),
            currency: "MXN".to_string(),
            total_quantity: 10,
            reserved: 0,
            sold: 0,
            max_per_order: None,
        })
        .execute(&mut conn)
        .await
        .expect("template");
    diesel::insert_into(guest_types::table)
        .values((
            guest_types::id.eq(guest_type),
            guest_types::event_id.eq(event_id),
            guest_types::name.eq("Guest list"),
        ))
        .execute(&mut conn)
        .await
        .expect("guest type");

    let wallet = Arc::new(MockGateway::new(Gateway::WalletRedirect, WALLET_SECRET));
    let registry = GatewayRegistry::new().with(wallet.clone());
    let engine = Engine::new(
        store.clone(),
        registry,
        Arc::new(ManualClock::new(Utc::now())),
        EngineConfig::default(),
    );

    Some(PgHarness {
        engine,
        store,
        wallet,
        event_id,
        general,
        guest_type,
        email: format!("buyer-{}@example.com", event_id.simple()),
    })
}

impl PgHarness {
    async fn open(&self, quantity: i32) -> AppResult<Order> {
        self.engine
            .checkout
            .open(CheckoutRequest {
                event_id: self.event_id,
                items: vec![LineRequest {
                    template_id: self.general,
                    quantity,
                }],
                buyer_info: BuyerInfo {
                    email: self.email.clone(),
                    name: "Ana Torres".to_string(),
                    phone: None,
                },
                method: Some(PaymentMethod::Wallet),
            })
            .await
    }

    async fn webhook(&self, order: &Order, event_id: &str) -> AppResult<WebhookOutcome> {
        let (body, headers) = self
            .wallet
            .signed(&MockWebhook {
                event_id: event_id.to_string(),
                payment_id: format!("pay-{}", order.id),
                order_reference: Some(order.id.to_string()),
                status: EventStatus::Completed,
                amount: order.total.clone(),
                currency: "MXN".to_string(),
            })
            .unwrap();
        let ack = self.engine.reconciler.handle("wallet", &body, &headers).await?;
        Ok(ack.outcome)
    }

    async fn seed_promoter(&self, max_tickets: i32) -> String {
        let code = format!("RP{}", &self.event_id.simple().to_string()[..8]).to_uppercase();
        let url = database_url().expect("database url");
        let mut conn = AsyncPgConnection::establish(&url).await.expect("seed connection");
        diesel::insert_into(rp_profiles::table)
            .values((
                rp_profiles::id.eq(Uuid::new_v4()),
                rp_profiles::event_id.eq(self.event_id),
                rp_profiles::code.eq(&code),
                rp_profiles::display_name.eq("Luna"),
                rp_profiles::max_tickets.eq(Some(max_tickets)),
            ))
            .execute(&mut conn)
            .await
            .expect("rp profile");
        code
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pg_concurrent_checkouts_never_oversell() {
    let Some(h) = pg_harness().await else {
        return;
    };

    let results = join_all((0..8).map(|_| h.open(3))).await;

    let won = results.iter().filter(|r| r.is_ok()).count();
    let out_of_stock = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::OutOfStock { .. })))
        .count();
    assert_eq!(won, 3);
    assert_eq!(out_of_stock, 5);

    let template = h.store.get_template(h.general).await.expect("template");
    assert_eq!(template.reserved, 9);
    assert_eq!(template.sold, 0);
    assert!(template.reserved + template.sold <= template.total_quantity);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pg_duplicate_completions_settle_once() {
    let Some(h) = pg_harness().await else {
        return;
    };
    let order = h.open(2).await.expect("order");
    let redelivered = format!("evt-{}", order.id);
    let resent = format!("evt-{}-again", order.id);

    let outcomes = join_all([
        h.webhook(&order, &redelivered),
        h.webhook(&order, &redelivered),
        h.webhook(&order, &redelivered),
        h.webhook(&order, &resent),
    ])
    .await;
    let outcomes: Vec<WebhookOutcome> = outcomes
        .into_iter()
        .map(|outcome| outcome.expect("webhook handled"))
        .collect();

    assert_eq!(
        outcomes.iter().filter(|o| **o == WebhookOutcome::Applied).count(),
        1,
        "{:?}",
        outcomes
    );

    let template = h.store.get_template(h.general).await.expect("template");
    assert_eq!(template.sold, 2);
    assert_eq!(template.reserved, 0);

    let tickets = h.store.tickets_for_order(order.id).await.expect("tickets");
    assert_eq!(tickets.len(), 2);

    let payments = h.store.payments_for_order(order.id).await.expect("payments");
    assert_eq!(
        payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Completed)
            .count(),
        1
    );

    let deliveries = h
        .store
        .pending_outbox(1000)
        .await
        .expect("outbox")
        .into_iter()
        .filter(|event| event.aggregate_id == order.id)
        .count();
    assert_eq!(deliveries, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pg_a_ticket_gets_in_exactly_once() {
    let Some(h) = pg_harness().await else {
        return;
    };
    let order = h.open(1).await.expect("order");
    h.webhook(&order, &format!("evt-{}", order.id))
        .await
        .expect("paid");
    let qr = h.store.tickets_for_order(order.id).await.expect("tickets")[0]
        .qr_code
        .clone();

    let results = join_all((0..5).map(|_| h.engine.check_in.check_in(&qr))).await;

    let admitted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(admitted.len(), 1);
    assert_eq!(admitted[0].status, TicketStatus::Used);

    let stored = h.store.get_ticket_by_qr(&qr).await.expect("ticket");
    assert_eq!(stored.used_at, admitted[0].used_at);
    for result in &results {
        match result {
            Ok(_) => {}
            Err(AppError::AlreadyUsed { used_at }) => assert_eq!(Some(*used_at), stored.used_at),
            Err(other) => panic!("unexpected {:?}", other),
        }
    }

    let event = h.store.get_event(h.event_id).await.expect("event");
    assert_eq!(event.checked_in_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pg_promoter_quota_holds_under_concurrency() {
    let Some(h) = pg_harness().await else {
        return;
    };
    let code = h.seed_promoter(5).await;

    let results = join_all((0..10).map(|i| {
        h.engine.rp.generate(
            &code,
            GuestRequest {
                guest_type_id: h.guest_type,
                holder_name: format!("Guest {}", i),
                nickname: None,
            },
        )
    }))
    .await;

    let granted = results.iter().filter(|r| r.is_ok()).count();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::QuotaExhausted)))
        .count();
    assert_eq!(granted, 5);
    assert_eq!(exhausted, 5);

    let profile = h
        .store
        .find_rp_profile(&code)
        .await
        .expect("profile")
        .expect("seeded");
    assert_eq!(profile.tickets_generated, 5);
}
