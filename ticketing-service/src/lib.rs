//! Order and payment reconciliation for ticket sales.
//!
//! Flow: [`checkout::CheckoutSession`] holds stock through [`ledger::InventoryLedger`] and
//! writes a pending order; [`payments::PaymentIntents`] asks a provider for what the buyer
//! needs to pay; [`reconciler::WebhookReconciler`] (or a synchronous charge, or an operator)
//! settles the order through [`settlement::Settlement`], which hands paid orders to
//! [`issuer::TicketIssuer`]. Tickets are redeemed at the door through
//! [`checkin::CheckInStateMachine`]; promoters mint courtesy tickets through
//! [`rp::RpQuotaEngine`].

pub mod api;
pub mod checkin;
pub mod checkout;
pub mod clock;
pub mod config;
pub mod error;
pub mod issuer;
pub mod ledger;
pub mod models;
pub mod outbox;
pub mod payments;
pub mod reconciler;
pub mod rp;
pub mod schema;
pub mod settlement;
pub mod store;
pub mod sweeper;
pub mod tokens;

use payment_gateways::GatewayRegistry;
use std::sync::Arc;

use crate::checkin::CheckInStateMachine;
use crate::checkout::CheckoutSession;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::issuer::TicketIssuer;
use crate::ledger::InventoryLedger;
use crate::payments::PaymentIntents;
use crate::reconciler::WebhookReconciler;
use crate::rp::RpQuotaEngine;
use crate::settlement::Settlement;
use crate::store::TicketingStore;
use crate::sweeper::ExpirySweeper;

/// Every component wired over one store, one gateway registry and one clock.
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<dyn TicketingStore>,
    pub ledger: InventoryLedger,
    pub issuer: TicketIssuer,
    pub settlement: Settlement,
    pub checkout: CheckoutSession,
    pub payments: PaymentIntents,
    pub reconciler: WebhookReconciler,
    pub rp: RpQuotaEngine,
    pub check_in: CheckInStateMachine,
    pub sweeper: ExpirySweeper,
}

impl Engine {
    pub fn new(
        store: Arc<dyn TicketingStore>,
        registry: GatewayRegistry,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let ledger = InventoryLedger::new(store.clone());
        let issuer = TicketIssuer::new(store.clone(), clock.clone());
        let settlement = Settlement::new(store.clone(), issuer.clone(), clock.clone());

        Self {
            checkout: CheckoutSession::new(
                store.clone(),
                ledger.clone(),
                settlement.clone(),
                clock.clone(),
                config.clone(),
            ),
            payments: PaymentIntents::new(
                store.clone(),
                registry.clone(),
                settlement.clone(),
                clock.clone(),
                config.retry,
            ),
            reconciler: WebhookReconciler::new(
                store.clone(),
                registry,
                settlement.clone(),
                clock.clone(),
            ),
            rp: RpQuotaEngine::new(store.clone(), clock.clone()),
            check_in: CheckInStateMachine::new(store.clone(), clock.clone()),
            sweeper: ExpirySweeper::new(
                store.clone(),
                ledger.clone(),
                settlement.clone(),
                issuer.clone(),
                clock,
                config.sweep_interval,
                config.sweep_batch,
            ),
            store,
            ledger,
            issuer,
            settlement,
        }
    }
}
