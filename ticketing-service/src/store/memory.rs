//! In-memory implementation of the ticketing store.
//!
//! All tables live behind a single `tokio::sync::Mutex`, so every trait call observes and
//! mutates state atomically, the same guarantee the Postgres backend gets from transactions and
//! conditional updates. Nothing is durable; it backs tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    Buyer, BuyerInfo, Event, Gateway, GuestType, IdempotencyKey, Order, OrderStatus, OutboxEvent,
    Payment, PaymentStatus, Reservation, ReservationStatus, RpProfile, Ticket, TicketStatus,
    TicketTemplate,
};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    delivery_event, payment_may_move, payment_target, CheckInOutcome, IssuedTickets,
    NewWebhookLog, PaymentUpdate, QuotaOutcome, Recipient, ReserveOutcome, ReserveRequest,
    SettledPayment, StoreError, StoreResult, TicketingStore, Transition, WebhookAppend, WebhookLog,
};

#[derive(Default)]
struct Inner {
    events: HashMap<Uuid, Event>,
    templates: HashMap<Uuid, TicketTemplate>,
    guest_types: HashMap<Uuid, GuestType>,
    rp_profiles: HashMap<Uuid, RpProfile>,
    buyers: HashMap<Uuid, Buyer>,
    orders: HashMap<Uuid, Order>,
    reservations: HashMap<Uuid, Reservation>,
    payments: HashMap<Uuid, Payment>,
    tickets: HashMap<Uuid, Ticket>,
    webhooks: HashMap<Uuid, WebhookLog>,
    outbox: Vec<OutboxEvent>,
}

impl Inner {
    fn move_held(&mut self, id: Uuid, to: ReservationStatus) -> StoreResult<bool> {
        let reservation = match self.reservations.get_mut(&id) {
            Some(reservation) if reservation.status == ReservationStatus::Held => reservation,
            Some(_) => return Ok(false),
            None => return Err(StoreError::NotFound(format!("reservation {}", id))),
        };
        let template = self
            .templates
            .get_mut(&reservation.template_id)
            .ok_or_else(|| StoreError::NotFound(format!("template {}", reservation.template_id)))?;

        template.reserved -= reservation.quantity;
        if to == ReservationStatus::Committed {
            template.sold += reservation.quantity;
        }
        reservation.status = to;
        Ok(true)
    }

    fn held_for_order(&self, order_id: Uuid) -> Vec<Uuid> {
        self.reservations
            .values()
            .filter(|r| r.order_id == order_id && r.status == ReservationStatus::Held)
            .map(|r| r.id)
            .collect()
    }

    fn next_attempt(&self, order_id: Uuid) -> i32 {
        self.payments
            .values()
            .filter(|payment| payment.order_id == order_id)
            .map(|payment| payment.attempt)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn settle_payment(&mut self, order_id: Uuid, settled: SettledPayment, now: DateTime<Utc>) {
        let target = payment_target(
            self.payments.values(),
            order_id,
            settled.gateway,
            settled.external_id.as_deref(),
        );

        match target.and_then(|id| self.payments.get_mut(&id)) {
            Some(payment) => {
                payment.status = PaymentStatus::Completed;
                if settled.external_id.is_some() {
                    payment.external_id = settled.external_id;
                }
                payment.amount = settled.amount;
                payment.currency = settled.currency;
                payment.raw_payload = settled.raw.or(payment.raw_payload.take());
                payment.updated_at = now;
            }
            None => {
                let attempt = self.next_attempt(order_id);
                let payment = Payment {
                    id: Uuid::new_v4(),
                    order_id,
                    gateway: settled.gateway,
                    external_id: settled.external_id,
                    attempt,
                    idempotency_key: IdempotencyKey::for_attempt(order_id, attempt).to_string(),
                    status: PaymentStatus::Completed,
                    amount: settled.amount,
                    currency: settled.currency,
                    raw_payload: settled.raw,
                    created_at: now,
                    updated_at: now,
                };
                self.payments.insert(payment.id, payment);
            }
        }
    }

    fn order_tickets(&self, order_id: Uuid) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self
            .tickets
            .values()
            .filter(|ticket| ticket.order_id == Some(order_id))
            .cloned()
            .collect();
        tickets.sort_by_key(|ticket| (ticket.template_id, ticket.unit_index));
        tickets
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_event(&self, event: Event) {
        self.inner.lock().await.events.insert(event.id, event);
    }

    pub async fn seed_template(&self, template: TicketTemplate) {
        self.inner.lock().await.templates.insert(template.id, template);
    }

    pub async fn seed_guest_type(&self, guest_type: GuestType) {
        self.inner
            .lock()
            .await
            .guest_types
            .insert(guest_type.id, guest_type);
    }

    pub async fn seed_rp_profile(&self, profile: RpProfile) {
        self.inner.lock().await.rp_profiles.insert(profile.id, profile);
    }

    pub async fn rp_profile(&self, id: Uuid) -> Option<RpProfile> {
        self.inner.lock().await.rp_profiles.get(&id).cloned()
    }

    pub async fn outbox(&self) -> Vec<OutboxEvent> {
        self.inner.lock().await.outbox.clone()
    }

    pub async fn webhook_logs(&self) -> Vec<WebhookLog> {
        let mut logs: Vec<WebhookLog> = self.inner.lock().await.webhooks.values().cloned().collect();
        logs.sort_by_key(|log| log.created_at);
        logs
    }
}

#[async_trait]
impl TicketingStore for MemoryStore {
    async fn get_event(&self, id: Uuid) -> StoreResult<Event> {
        self.inner
            .lock()
            .await
            .events
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("event {}", id)))
    }

    async fn get_template(&self, id: Uuid) -> StoreResult<TicketTemplate> {
        self.inner
            .lock()
            .await
            .templates
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("template {}", id)))
    }

    async fn get_guest_type(&self, id: Uuid) -> StoreResult<GuestType> {
        self.inner
            .lock()
            .await
            .guest_types
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("guest type {}", id)))
    }

    async fn guest_types_for_event(&self, event_id: Uuid) -> StoreResult<Vec<GuestType>> {
        let inner = self.inner.lock().await;
        let mut guest_types: Vec<GuestType> = inner
            .guest_types
            .values()
            .filter(|guest_type| guest_type.event_id == event_id)
            .cloned()
            .collect();
        guest_types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(guest_types)
    }

    async fn find_rp_profile(&self, code: &str) -> StoreResult<Option<RpProfile>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rp_profiles
            .values()
            .find(|profile| profile.code == code)
            .cloned())
    }

    async fn upsert_buyer(&self, info: &BuyerInfo) -> StoreResult<Buyer> {
        let mut inner = self.inner.lock().await;
        let email = info.email.to_lowercase();

        if let Some(buyer) = inner.buyers.values_mut().find(|buyer| buyer.email == email) {
            buyer.name = info.name.clone();
            if info.phone.is_some() {
                buyer.phone = info.phone.clone();
            }
            return Ok(buyer.clone());
        }

        let buyer = Buyer {
            id: Uuid::new_v4(),
            email,
            name: info.name.clone(),
            phone: info.phone.clone(),
        };
        inner.buyers.insert(buyer.id, buyer.clone());
        Ok(buyer)
    }

    async fn get_buyer(&self, id: Uuid) -> StoreResult<Buyer> {
        self.inner
            .lock()
            .await
            .buyers
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("buyer {}", id)))
    }

    async fn reserve(&self, request: ReserveRequest) -> StoreResult<ReserveOutcome> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let template = inner
            .templates
            .get_mut(&request.template_id)
            .ok_or_else(|| StoreError::NotFound(format!("template {}", request.template_id)))?;

        let available = template.available();
        if available < request.quantity {
            return Ok(ReserveOutcome::Insufficient { available });
        }
        template.reserved += request.quantity;

        let reservation = Reservation {
            id: request.id,
            order_id: request.order_id,
            template_id: request.template_id,
            quantity: request.quantity,
            status: ReservationStatus::Held,
            expires_at: request.expires_at,
        };
        inner.reservations.insert(reservation.id, reservation.clone());
        Ok(ReserveOutcome::Reserved(reservation))
    }

    async fn commit_reservation(&self, id: Uuid) -> StoreResult<bool> {
        self.inner
            .lock()
            .await
            .move_held(id, ReservationStatus::Committed)
    }

    async fn release_reservation(&self, id: Uuid) -> StoreResult<bool> {
        self.inner
            .lock()
            .await
            .move_held(id, ReservationStatus::Released)
    }

    async fn reservations_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Reservation>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .reservations
            .values()
            .filter(|reservation| reservation.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn orphaned_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Reservation>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .reservations
            .values()
            .filter(|r| {
                r.status == ReservationStatus::Held
                    && r.expires_at <= now
                    && !inner.orders.contains_key(&r.order_id)
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn insert_order(&self, order: &Order) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.orders.contains_key(&order.id) {
            return Err(StoreError::Conflict(format!("order {} exists", order.id)));
        }
        inner.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> StoreResult<Order> {
        self.inner
            .lock()
            .await
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("order {}", id)))
    }

    async fn mark_order_paid(
        &self,
        order_id: Uuid,
        payment: SettledPayment,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let order = inner
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;
        if order.status != OrderStatus::Pending {
            return Ok(Transition::NotApplicable(order.status));
        }
        order.status = OrderStatus::Paid;
        order.paid_at = Some(now);
        let order = order.clone();

        for id in inner.held_for_order(order_id) {
            inner.move_held(id, ReservationStatus::Committed)?;
        }
        inner.settle_payment(order_id, payment, now);

        Ok(Transition::Applied(order))
    }

    async fn close_order(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        _now: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        if !matches!(status, OrderStatus::Cancelled | OrderStatus::Expired) {
            return Err(StoreError::Unexpected(anyhow::anyhow!(
                "cannot close an order as {}",
                status
            )));
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let order = inner
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;
        if order.status != OrderStatus::Pending {
            return Ok(Transition::NotApplicable(order.status));
        }
        order.status = status;
        let order = order.clone();

        for id in inner.held_for_order(order_id) {
            inner.move_held(id, ReservationStatus::Released)?;
        }

        Ok(Transition::Applied(order))
    }

    async fn refund_order(&self, order_id: Uuid, now: DateTime<Utc>) -> StoreResult<Transition> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let order = inner
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;
        if order.status != OrderStatus::Paid {
            return Ok(Transition::NotApplicable(order.status));
        }
        order.status = OrderStatus::Refunded;
        let order = order.clone();

        for ticket in inner.tickets.values_mut() {
            if ticket.order_id == Some(order_id) && ticket.status == TicketStatus::Valid {
                ticket.status = TicketStatus::Cancelled;
            }
        }
        for payment in inner.payments.values_mut() {
            if payment.order_id == order_id && payment.status == PaymentStatus::Completed {
                payment.status = PaymentStatus::Refunded;
                payment.updated_at = now;
            }
        }

        Ok(Transition::Applied(order))
    }

    async fn expired_pending_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Order>> {
        let inner = self.inner.lock().await;
        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|order| order.status == OrderStatus::Pending && order.is_past_expiry(now))
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.expires_at);
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }

    async fn paid_orders_without_tickets(&self, limit: i64) -> StoreResult<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .orders
            .values()
            .filter(|order| order.status == OrderStatus::Paid)
            .filter(|order| {
                !inner
                    .tickets
                    .values()
                    .any(|ticket| ticket.order_id == Some(order.id))
            })
            .map(|order| order.id)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn next_payment_attempt(&self, order_id: Uuid) -> StoreResult<i32> {
        Ok(self.inner.lock().await.next_attempt(order_id))
    }

    async fn insert_payment(&self, payment: &Payment) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let clash = inner.payments.values().any(|existing| {
            existing.idempotency_key == payment.idempotency_key
                || (existing.gateway == payment.gateway
                    && existing.external_id.is_some()
                    && existing.external_id == payment.external_id)
        });
        if clash {
            return Err(StoreError::Conflict(format!(
                "payment {} already recorded",
                payment.idempotency_key
            )));
        }
        inner.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn find_payment(
        &self,
        gateway: Gateway,
        external_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .values()
            .find(|p| p.gateway == gateway && p.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn update_payment_status(&self, update: PaymentUpdate) -> StoreResult<Option<Payment>> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let now = update.now;

        let target = payment_target(
            inner.payments.values(),
            update.order_id,
            update.gateway,
            Some(update.external_id.as_str()),
        );

        if let Some(payment) = target.and_then(|id| inner.payments.get_mut(&id)) {
            if !payment_may_move(payment.status, update.status) {
                return Ok(None);
            }
            payment.status = update.status;
            payment.external_id = Some(update.external_id);
            payment.raw_payload = Some(update.raw);
            payment.updated_at = now;
            return Ok(Some(payment.clone()));
        }

        let attempt = inner.next_attempt(update.order_id);
        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: update.order_id,
            gateway: update.gateway,
            external_id: Some(update.external_id),
            attempt,
            idempotency_key: IdempotencyKey::for_attempt(update.order_id, attempt).to_string(),
            status: update.status,
            amount: update.amount,
            currency: update.currency,
            raw_payload: Some(update.raw),
            created_at: now,
            updated_at: now,
        };
        inner.payments.insert(payment.id, payment.clone());
        Ok(Some(payment))
    }

    async fn payments_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Payment>> {
        let inner = self.inner.lock().await;
        let mut payments: Vec<Payment> = inner
            .payments
            .values()
            .filter(|payment| payment.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|payment| payment.attempt);
        Ok(payments)
    }

    async fn issue_tickets(
        &self,
        order_id: Uuid,
        tickets: Vec<Ticket>,
        recipient: Recipient,
        now: DateTime<Utc>,
    ) -> StoreResult<IssuedTickets> {
        let mut inner = self.inner.lock().await;

        let mut created = false;
        for ticket in tickets {
            let exists = inner.tickets.values().any(|existing| {
                existing.qr_code == ticket.qr_code
                    || (existing.order_id == ticket.order_id
                        && existing.template_id == ticket.template_id
                        && existing.unit_index == ticket.unit_index)
            });
            if !exists {
                inner.tickets.insert(ticket.id, ticket);
                created = true;
            }
        }

        let tickets = inner.order_tickets(order_id);
        if created {
            let event = delivery_event(order_id, &recipient, &tickets, now)?;
            inner.outbox.push(event);
        }

        Ok(IssuedTickets { tickets, created })
    }

    async fn tickets_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Ticket>> {
        Ok(self.inner.lock().await.order_tickets(order_id))
    }

    async fn generate_rp_ticket(
        &self,
        profile_id: Uuid,
        ticket: Ticket,
    ) -> StoreResult<QuotaOutcome> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let profile = inner
            .rp_profiles
            .get_mut(&profile_id)
            .ok_or_else(|| StoreError::NotFound(format!("rp profile {}", profile_id)))?;
        if !profile.has_quota() {
            return Ok(QuotaOutcome::Exhausted);
        }
        profile.tickets_generated += 1;

        inner.tickets.insert(ticket.id, ticket.clone());
        Ok(QuotaOutcome::Granted(ticket))
    }

    async fn get_ticket_by_qr(&self, qr_code: &str) -> StoreResult<Ticket> {
        let inner = self.inner.lock().await;
        inner
            .tickets
            .values()
            .find(|ticket| ticket.qr_code == qr_code)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("ticket".to_string()))
    }

    async fn check_in(&self, qr_code: &str, now: DateTime<Utc>) -> StoreResult<CheckInOutcome> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let ticket = inner
            .tickets
            .values_mut()
            .find(|ticket| ticket.qr_code == qr_code)
            .ok_or_else(|| StoreError::NotFound("ticket".to_string()))?;

        match ticket.status {
            TicketStatus::Used => return Ok(CheckInOutcome::AlreadyUsed(ticket.clone())),
            TicketStatus::Cancelled => return Ok(CheckInOutcome::Cancelled(ticket.clone())),
            TicketStatus::Valid => {
                ticket.status = TicketStatus::Used;
                ticket.used_at = Some(now);
            }
        }
        let ticket = ticket.clone();

        if let Some(event) = inner.events.get_mut(&ticket.event_id) {
            event.checked_in_count += 1;
        }
        if let Some(profile) = ticket
            .rp_profile_id
            .and_then(|id| inner.rp_profiles.get_mut(&id))
        {
            profile.tickets_used += 1;
        }

        Ok(CheckInOutcome::CheckedIn(ticket))
    }

    async fn append_webhook(&self, entry: NewWebhookLog) -> StoreResult<WebhookAppend> {
        let mut inner = self.inner.lock().await;

        if let Some(external_id) = entry.external_event_id.as_deref() {
            let existing = inner.webhooks.values().find(|log| {
                log.gateway == entry.gateway && log.external_event_id.as_deref() == Some(external_id)
            });
            if let Some(log) = existing {
                return Ok(WebhookAppend::Duplicate {
                    id: log.id,
                    processed: log.processed_at.is_some(),
                });
            }
        }

        let log = WebhookLog {
            id: entry.id,
            gateway: entry.gateway,
            external_event_id: entry.external_event_id,
            event_type: entry.event_type,
            verified: entry.verified,
            order_id: None,
            outcome: None,
            payload: entry.payload,
            created_at: entry.created_at,
            processed_at: None,
        };
        inner.webhooks.insert(log.id, log);
        Ok(WebhookAppend::Inserted(entry.id))
    }

    async fn finish_webhook(
        &self,
        id: Uuid,
        order_id: Option<Uuid>,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let log = inner
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("webhook log {}", id)))?;
        log.order_id = order_id.or(log.order_id);
        log.outcome = Some(outcome.to_string());
        log.processed_at = Some(now);
        Ok(())
    }

    async fn get_webhook(&self, id: Uuid) -> StoreResult<WebhookLog> {
        self.inner
            .lock()
            .await
            .webhooks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("webhook log {}", id)))
    }

    async fn pending_outbox(&self, limit: i64) -> StoreResult<Vec<OutboxEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|event| !event.processed)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_outbox_processed(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .outbox
            .iter_mut()
            .find(|event| event.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {}", id)))?;
        event.processed = true;
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        let _inner = self.inner.lock().await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::Duration;

    fn template(total: i32) -> TicketTemplate {
        TicketTemplate {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            name: "General".to_string(),
            price: BigDecimal::from(100),
            currency: "MXN".to_string(),
            total_quantity: total,
            reserved: 0,
            sold: 0,
            max_per_order: None,
        }
    }

    fn request(template_id: Uuid, quantity: i32) -> ReserveRequest {
        ReserveRequest {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            template_id,
            quantity,
            expires_at: Utc::now() + Duration::minutes(30),
        }
    }

    #[tokio::test]
    async fn commit_and_release_only_move_held_reservations() {
        let store = MemoryStore::new();
        let template = template(10);
        store.seed_template(template.clone()).await;

        let first = match store.reserve(request(template.id, 4)).await.unwrap() {
            ReserveOutcome::Reserved(reservation) => reservation,
            other => panic!("unexpected {:?}", other),
        };
        let second = match store.reserve(request(template.id, 3)).await.unwrap() {
            ReserveOutcome::Reserved(reservation) => reservation,
            other => panic!("unexpected {:?}", other),
        };

        assert!(store.commit_reservation(first.id).await.unwrap());
        assert!(!store.commit_reservation(first.id).await.unwrap());
        assert!(!store.release_reservation(first.id).await.unwrap());
        assert!(store.release_reservation(second.id).await.unwrap());
        assert!(!store.release_reservation(second.id).await.unwrap());

        let after = store.get_template(template.id).await.unwrap();
        assert_eq!(after.sold, 4);
        assert_eq!(after.reserved, 0);
        assert_eq!(after.available(), 6);
    }

    #[tokio::test]
    async fn reserve_refuses_more_than_available() {
        let store = MemoryStore::new();
        let template = template(5);
        store.seed_template(template.clone()).await;

        store.reserve(request(template.id, 3)).await.unwrap();
        match store.reserve(request(template.id, 3)).await.unwrap() {
            ReserveOutcome::Insufficient { available } => assert_eq!(available, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn webhook_log_dedupes_on_gateway_and_event_id() {
        let store = MemoryStore::new();
        let entry = |external: Option<&str>| NewWebhookLog {
            id: Uuid::new_v4(),
            gateway: Gateway::HostedCard,
            external_event_id: external.map(str::to_string),
            event_type: None,
            verified: external.is_some(),
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        };

        let first = store.append_webhook(entry(Some("evt_1"))).await.unwrap();
        let WebhookAppend::Inserted(id) = first else {
            panic!("expected insert");
        };
        assert_eq!(
            store.append_webhook(entry(Some("evt_1"))).await.unwrap(),
            WebhookAppend::Duplicate { id, processed: false }
        );

        store.finish_webhook(id, None, "APPLIED", Utc::now()).await.unwrap();
        assert_eq!(
            store.append_webhook(entry(Some("evt_1"))).await.unwrap(),
            WebhookAppend::Duplicate { id, processed: true }
        );

        // Unverified deliveries carry no event id and never collide.
        assert!(matches!(
            store.append_webhook(entry(None)).await.unwrap(),
            WebhookAppend::Inserted(_)
        ));
        assert!(matches!(
            store.append_webhook(entry(None)).await.unwrap(),
            WebhookAppend::Inserted(_)
        ));
    }
}
