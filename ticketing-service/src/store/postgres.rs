//! PostgreSQL implementation of the ticketing store.
//!
//! Counter changes are conditional `UPDATE ... WHERE` statements (inventory, check-in) or run
//! under `SELECT ... FOR UPDATE` (promoter quota), always inside a transaction together with the
//! rows they guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use shared::{
    Buyer, BuyerInfo, Event, Gateway, GuestType, IdempotencyKey, Order, OrderStatus, OutboxEvent,
    Payment, PaymentStatus, Reservation, ReservationStatus, RpProfile, Ticket, TicketStatus,
    TicketTemplate,
};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use super::{
    delivery_event, payment_may_move, payment_target, CheckInOutcome, IssuedTickets,
    NewWebhookLog, PaymentUpdate, QuotaOutcome, Recipient, ReserveOutcome, ReserveRequest,
    SettledPayment, StoreError, StoreResult, TicketingStore, Transition, WebhookAppend, WebhookLog,
};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Applies pending migrations over a blocking connection.
pub fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    let mut conn = diesel::PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    Ok(())
}

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Migrates the database, then opens a pool of `max_size` connections.
    pub async fn connect(database_url: &str, max_size: u32) -> anyhow::Result<Self> {
        info!("Running database migrations...");
        let url = database_url.to_string();
        tokio::task::spawn_blocking(move || run_migrations(&url)).await??;
        info!("Migrations completed successfully");

        Self::open(database_url, max_size).await
    }

    /// Opens a pool against an already migrated database.
    pub async fn open(database_url: &str, max_size: u32) -> anyhow::Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool: DbPool = bb8::Pool::builder().max_size(max_size).build(manager).await?;
        Ok(Self::new(pool))
    }

    async fn conn(&self) -> StoreResult<PooledConnection<'_, AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unexpected(anyhow::anyhow!("connection pool: {}", e)))
    }
}

fn unique_violation(err: DieselError, what: impl FnOnce() -> String) -> StoreError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            StoreError::Conflict(what())
        }
        other => StoreError::Database(other),
    }
}

async fn load_order(conn: &mut AsyncPgConnection, id: Uuid) -> StoreResult<Order> {
    let row = orders::table
        .find(id)
        .first::<DbOrder>(conn)
        .await
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("order {}", id)))?;

    let items = order_items::table
        .filter(order_items::order_id.eq(id))
        .order(order_items::template_id.asc())
        .load::<DbOrderItem>(conn)
        .await?;

    Ok(row.into_order(items)?)
}

async fn attach_items(conn: &mut AsyncPgConnection, rows: Vec<DbOrder>) -> StoreResult<Vec<Order>> {
    let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
    let mut items: HashMap<Uuid, Vec<DbOrderItem>> = HashMap::new();
    for item in order_items::table
        .filter(order_items::order_id.eq_any(&ids))
        .load::<DbOrderItem>(conn)
        .await?
    {
        items.entry(item.order_id).or_default().push(item);
    }

    rows.into_iter()
        .map(|row| {
            let lines = items.remove(&row.id).unwrap_or_default();
            row.into_order(lines).map_err(StoreError::from)
        })
        .collect()
}

async fn not_applicable(conn: &mut AsyncPgConnection, order_id: Uuid) -> StoreResult<Transition> {
    let status = orders::table
        .find(order_id)
        .select(orders::status)
        .first::<String>(conn)
        .await
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;
    Ok(Transition::NotApplicable(status.parse()?))
}

/// Moves one `Held` reservation to `to` and adjusts the template counters. Must run inside a
/// transaction.
async fn move_held(
    conn: &mut AsyncPgConnection,
    id: Uuid,
    to: ReservationStatus,
) -> StoreResult<bool> {
    let moved = diesel::update(
        reservations::table
            .filter(reservations::id.eq(id))
            .filter(reservations::status.eq(ReservationStatus::Held.as_str())),
    )
    .set(reservations::status.eq(to.as_str()))
    .get_result::<DbReservation>(conn)
    .await
    .optional()?;

    let Some(reservation) = moved else {
        return Ok(false);
    };

    let template = ticket_templates::table.filter(ticket_templates::id.eq(reservation.template_id));
    if to == ReservationStatus::Committed {
        diesel::update(template)
            .set((
                ticket_templates::reserved.eq(ticket_templates::reserved - reservation.quantity),
                ticket_templates::sold.eq(ticket_templates::sold + reservation.quantity),
            ))
            .execute(conn)
            .await?;
    } else {
        diesel::update(template)
            .set(ticket_templates::reserved.eq(ticket_templates::reserved - reservation.quantity))
            .execute(conn)
            .await?;
    }

    Ok(true)
}

async fn move_all_held(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    to: ReservationStatus,
) -> StoreResult<()> {
    let held = reservations::table
        .filter(reservations::order_id.eq(order_id))
        .filter(reservations::status.eq(ReservationStatus::Held.as_str()))
        .select(reservations::id)
        .load::<Uuid>(conn)
        .await?;

    for id in held {
        move_held(conn, id, to).await?;
    }
    Ok(())
}

async fn order_payments(conn: &mut AsyncPgConnection, order_id: Uuid) -> StoreResult<Vec<Payment>> {
    payments::table
        .filter(payments::order_id.eq(order_id))
        .order(payments::attempt.asc())
        .load::<DbPayment>(conn)
        .await?
        .into_iter()
        .map(|row| Payment::try_from(row).map_err(StoreError::from))
        .collect()
}

fn next_attempt(payments: &[Payment]) -> i32 {
    payments.iter().map(|payment| payment.attempt).max().unwrap_or(0) + 1
}

async fn settle_payment(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    settled: SettledPayment,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let existing = order_payments(conn, order_id).await?;
    let target = payment_target(
        existing.iter(),
        order_id,
        settled.gateway,
        settled.external_id.as_deref(),
    )
    .and_then(|id| existing.iter().find(|payment| payment.id == id));

    match target {
        Some(payment) => {
            diesel::update(payments::table.find(payment.id))
                .set((
                    payments::status.eq(PaymentStatus::Completed.as_str()),
                    payments::external_id.eq(settled.external_id.or(payment.external_id.clone())),
                    payments::amount.eq(settled.amount),
                    payments::currency.eq(settled.currency),
                    payments::raw_payload.eq(settled.raw.or(payment.raw_payload.clone())),
                    payments::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;
        }
        None => {
            let attempt = next_attempt(&existing);
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
            diesel::insert_into(payments::table)
                .values(&DbPayment::from(&payment))
                .execute(conn)
                .await?;
        }
    }

    Ok(())
}

async fn order_tickets(conn: &mut AsyncPgConnection, order_id: Uuid) -> StoreResult<Vec<Ticket>> {
    tickets::table
        .filter(tickets::order_id.eq(order_id))
        .order((tickets::template_id.asc(), tickets::unit_index.asc()))
        .load::<DbTicket>(conn)
        .await?
        .into_iter()
        .map(|row| Ticket::try_from(row).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl TicketingStore for PgStore {
    async fn get_event(&self, id: Uuid) -> StoreResult<Event> {
        let mut conn = self.conn().await?;
        events::table
            .find(id)
            .first::<DbEvent>(&mut conn)
            .await
            .optional()?
            .map(Event::from)
            .ok_or_else(|| StoreError::NotFound(format!("event {}", id)))
    }

    async fn get_template(&self, id: Uuid) -> StoreResult<TicketTemplate> {
        let mut conn = self.conn().await?;
        ticket_templates::table
            .find(id)
            .first::<DbTicketTemplate>(&mut conn)
            .await
            .optional()?
            .map(TicketTemplate::from)
            .ok_or_else(|| StoreError::NotFound(format!("template {}", id)))
    }

    async fn get_guest_type(&self, id: Uuid) -> StoreResult<GuestType> {
        let mut conn = self.conn().await?;
        guest_types::table
            .find(id)
            .first::<DbGuestType>(&mut conn)
            .await
            .optional()?
            .map(GuestType::from)
            .ok_or_else(|| StoreError::NotFound(format!("guest type {}", id)))
    }

    async fn guest_types_for_event(&self, event_id: Uuid) -> StoreResult<Vec<GuestType>> {
        let mut conn = self.conn().await?;
        Ok(guest_types::table
            .filter(guest_types::event_id.eq(event_id))
            .order(guest_types::name.asc())
            .load::<DbGuestType>(&mut conn)
            .await?
            .into_iter()
            .map(GuestType::from)
            .collect())
    }

    async fn find_rp_profile(&self, code: &str) -> StoreResult<Option<RpProfile>> {
        let mut conn = self.conn().await?;
        Ok(rp_profiles::table
            .filter(rp_profiles::code.eq(code))
            .first::<DbRpProfile>(&mut conn)
            .await
            .optional()?
            .map(RpProfile::from))
    }

    async fn upsert_buyer(&self, info: &BuyerInfo) -> StoreResult<Buyer> {
        let mut conn = self.conn().await?;
        let new_buyer = NewBuyer {
            id: Uuid::new_v4(),
            email: info.email.to_lowercase(),
            name: info.name.clone(),
            phone: info.phone.clone(),
        };

        let upsert = diesel::insert_into(buyers::table)
            .values(&new_buyer)
            .on_conflict(buyers::email)
            .do_update();
        let row = match &new_buyer.phone {
            Some(phone) => {
                upsert
                    .set((buyers::name.eq(&new_buyer.name), buyers::phone.eq(Some(phone.clone()))))
                    .get_result::<DbBuyer>(&mut conn)
                    .await?
            }
            None => {
                upsert
                    .set(buyers::name.eq(&new_buyer.name))
                    .get_result::<DbBuyer>(&mut conn)
                    .await?
            }
        };

        Ok(row.into())
    }

    async fn get_buyer(&self, id: Uuid) -> StoreResult<Buyer> {
        let mut conn = self.conn().await?;
        buyers::table
            .find(id)
            .first::<DbBuyer>(&mut conn)
            .await
            .optional()?
            .map(Buyer::from)
            .ok_or_else(|| StoreError::NotFound(format!("buyer {}", id)))
    }

    async fn reserve(&self, request: ReserveRequest) -> StoreResult<ReserveOutcome> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let updated = diesel::update(
                    ticket_templates::table
                        .filter(ticket_templates::id.eq(request.template_id))
                        .filter(
                            (ticket_templates::total_quantity
                                - ticket_templates::reserved
                                - ticket_templates::sold)
                                .ge(request.quantity),
                        ),
                )
                .set(ticket_templates::reserved.eq(ticket_templates::reserved + request.quantity))
                .execute(conn)
                .await?;

                if updated == 0 {
                    let template = ticket_templates::table
                        .find(request.template_id)
                        .first::<DbTicketTemplate>(conn)
                        .await
                        .optional()?
                        .map(TicketTemplate::from)
                        .ok_or_else(|| {
                            StoreError::NotFound(format!("template {}", request.template_id))
                        })?;
                    return Ok(ReserveOutcome::Insufficient {
                        available: template.available(),
                    });
                }

                let row = diesel::insert_into(reservations::table)
                    .values(&NewReservation {
                        id: request.id,
                        order_id: request.order_id,
                        template_id: request.template_id,
                        quantity: request.quantity,
                        status: ReservationStatus::Held.to_string(),
                        expires_at: request.expires_at,
                    })
                    .get_result::<DbReservation>(conn)
                    .await?;

                Ok(ReserveOutcome::Reserved(Reservation::try_from(row)?))
            })
        })
        .await
    }

    async fn commit_reservation(&self, id: Uuid) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move { move_held(conn, id, ReservationStatus::Committed).await })
        })
        .await
    }

    async fn release_reservation(&self, id: Uuid) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move { move_held(conn, id, ReservationStatus::Released).await })
        })
        .await
    }

    async fn reservations_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Reservation>> {
        let mut conn = self.conn().await?;
        reservations::table
            .filter(reservations::order_id.eq(order_id))
            .load::<DbReservation>(&mut conn)
            .await?
            .into_iter()
            .map(|row| Reservation::try_from(row).map_err(StoreError::from))
            .collect()
    }

    async fn orphaned_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Reservation>> {
        let mut conn = self.conn().await?;
        reservations::table
            .filter(reservations::status.eq(ReservationStatus::Held.as_str()))
            .filter(reservations::expires_at.le(now))
            .filter(diesel::dsl::not(diesel::dsl::exists(
                orders::table.filter(orders::id.eq(reservations::order_id)),
            )))
            .order(reservations::expires_at.asc())
            .limit(limit)
            .load::<DbReservation>(&mut conn)
            .await?
            .into_iter()
            .map(|row| Reservation::try_from(row).map_err(StoreError::from))
            .collect()
    }

    async fn insert_order(&self, order: &Order) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let row = DbOrder::new(order);
        let items: Vec<DbOrderItem> = order
            .items
            .iter()
            .map(|item| DbOrderItem {
                order_id: order.id,
                template_id: item.template_id,
                quantity: item.quantity,
                unit_price: item.unit_price.clone(),
            })
            .collect();

        let order_id = order.id;
        conn.transaction::<_, DieselError, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(orders::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                diesel::insert_into(order_items::table)
                    .values(&items)
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .await
        .map_err(|e| unique_violation(e, || format!("order {} exists", order_id)))
    }

    async fn get_order(&self, id: Uuid) -> StoreResult<Order> {
        let mut conn = self.conn().await?;
        load_order(&mut conn, id).await
    }

    async fn mark_order_paid(
        &self,
        order_id: Uuid,
        payment: SettledPayment,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let updated = diesel::update(
                    orders::table
                        .filter(orders::id.eq(order_id))
                        .filter(orders::status.eq(OrderStatus::Pending.as_str())),
                )
                .set((
                    orders::status.eq(OrderStatus::Paid.as_str()),
                    orders::paid_at.eq(Some(now)),
                    orders::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

                if updated == 0 {
                    return not_applicable(conn, order_id).await;
                }

                move_all_held(conn, order_id, ReservationStatus::Committed).await?;
                settle_payment(conn, order_id, payment, now).await?;

                Ok(Transition::Applied(load_order(conn, order_id).await?))
            })
        })
        .await
    }

    async fn close_order(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        if !matches!(status, OrderStatus::Cancelled | OrderStatus::Expired) {
            return Err(StoreError::Unexpected(anyhow::anyhow!(
                "cannot close an order as {}",
                status
            )));
        }

        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let updated = diesel::update(
                    orders::table
                        .filter(orders::id.eq(order_id))
                        .filter(orders::status.eq(OrderStatus::Pending.as_str())),
                )
                .set((orders::status.eq(status.as_str()), orders::updated_at.eq(now)))
                .execute(conn)
                .await?;

                if updated == 0 {
                    return not_applicable(conn, order_id).await;
                }

                move_all_held(conn, order_id, ReservationStatus::Released).await?;
                Ok(Transition::Applied(load_order(conn, order_id).await?))
            })
        })
        .await
    }

    async fn refund_order(&self, order_id: Uuid, now: DateTime<Utc>) -> StoreResult<Transition> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let updated = diesel::update(
                    orders::table
                        .filter(orders::id.eq(order_id))
                        .filter(orders::status.eq(OrderStatus::Paid.as_str())),
                )
                .set((
                    orders::status.eq(OrderStatus::Refunded.as_str()),
                    orders::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

                if updated == 0 {
                    return not_applicable(conn, order_id).await;
                }

                diesel::update(
                    tickets::table
                        .filter(tickets::order_id.eq(order_id))
                        .filter(tickets::status.eq(TicketStatus::Valid.as_str())),
                )
                .set(tickets::status.eq(TicketStatus::Cancelled.as_str()))
                .execute(conn)
                .await?;

                diesel::update(
                    payments::table
                        .filter(payments::order_id.eq(order_id))
                        .filter(payments::status.eq(PaymentStatus::Completed.as_str())),
                )
                .set((
                    payments::status.eq(PaymentStatus::Refunded.as_str()),
                    payments::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

                Ok(Transition::Applied(load_order(conn, order_id).await?))
            })
        })
        .await
    }

    async fn expired_pending_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Order>> {
        let mut conn = self.conn().await?;
        let rows = orders::table
            .filter(orders::status.eq(OrderStatus::Pending.as_str()))
            .filter(orders::expires_at.le(now))
            .order(orders::expires_at.asc())
            .limit(limit)
            .load::<DbOrder>(&mut conn)
            .await?;
        attach_items(&mut conn, rows).await
    }

    async fn paid_orders_without_tickets(&self, limit: i64) -> StoreResult<Vec<Uuid>> {
        let mut conn = self.conn().await?;
        Ok(orders::table
            .filter(orders::status.eq(OrderStatus::Paid.as_str()))
            .filter(diesel::dsl::not(diesel::dsl::exists(
                tickets::table.filter(tickets::order_id.eq(orders::id.nullable())),
            )))
            .order(orders::paid_at.asc())
            .select(orders::id)
            .limit(limit)
            .load::<Uuid>(&mut conn)
            .await?)
    }

    async fn next_payment_attempt(&self, order_id: Uuid) -> StoreResult<i32> {
        let mut conn = self.conn().await?;
        let max = payments::table
            .filter(payments::order_id.eq(order_id))
            .select(diesel::dsl::max(payments::attempt))
            .first::<Option<i32>>(&mut conn)
            .await?;
        Ok(max.unwrap_or(0) + 1)
    }

    async fn insert_payment(&self, payment: &Payment) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(payments::table)
            .values(&DbPayment::from(payment))
            .execute(&mut conn)
            .await
            .map_err(|e| {
                unique_violation(e, || {
                    format!("payment {} already recorded", payment.idempotency_key)
                })
            })?;
        Ok(())
    }

    async fn find_payment(
        &self,
        gateway: Gateway,
        external_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let mut conn = self.conn().await?;
        payments::table
            .filter(payments::gateway.eq(gateway.as_str()))
            .filter(payments::external_id.eq(external_id))
            .first::<DbPayment>(&mut conn)
            .await
            .optional()?
            .map(|row| Payment::try_from(row).map_err(StoreError::from))
            .transpose()
    }

    async fn update_payment_status(&self, update: PaymentUpdate) -> StoreResult<Option<Payment>> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let now = update.now;
                let existing = order_payments(conn, update.order_id).await?;
                let target = payment_target(
                    existing.iter(),
                    update.order_id,
                    update.gateway,
                    Some(update.external_id.as_str()),
                )
                .and_then(|id| existing.iter().find(|payment| payment.id == id));

                if let Some(payment) = target {
                    if !payment_may_move(payment.status, update.status) {
                        return Ok(None);
                    }
                    let row = diesel::update(payments::table.find(payment.id))
                        .set((
                            payments::status.eq(update.status.as_str()),
                            payments::external_id.eq(Some(update.external_id.clone())),
                            payments::raw_payload.eq(Some(update.raw.clone())),
                            payments::updated_at.eq(now),
                        ))
                        .get_result::<DbPayment>(conn)
                        .await?;
                    return Ok(Some(Payment::try_from(row)?));
                }

                let attempt = next_attempt(&existing);
                let payment = Payment {
                    id: Uuid::new_v4(),
                    order_id: update.order_id,
                    gateway: update.gateway,
                    external_id: Some(update.external_id),
                    attempt,
                    idempotency_key: IdempotencyKey::for_attempt(update.order_id, attempt)
                        .to_string(),
                    status: update.status,
                    amount: update.amount,
                    currency: update.currency,
                    raw_payload: Some(update.raw),
                    created_at: now,
                    updated_at: now,
                };
                diesel::insert_into(payments::table)
                    .values(&DbPayment::from(&payment))
                    .execute(conn)
                    .await?;
                Ok(Some(payment))
            })
        })
        .await
    }

    async fn payments_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Payment>> {
        let mut conn = self.conn().await?;
        order_payments(&mut conn, order_id).await
    }

    async fn issue_tickets(
        &self,
        order_id: Uuid,
        issued: Vec<Ticket>,
        recipient: Recipient,
        now: DateTime<Utc>,
    ) -> StoreResult<IssuedTickets> {
        let mut conn = self.conn().await?;
        let rows: Vec<DbTicket> = issued.iter().map(DbTicket::from).collect();

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let inserted = diesel::insert_into(tickets::table)
                    .values(&rows)
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;

                let tickets = order_tickets(conn, order_id).await?;
                if inserted > 0 {
                    let event = delivery_event(order_id, &recipient, &tickets, now)?;
                    diesel::insert_into(outbox_events::table)
                        .values(&DbOutboxEvent::from(event))
                        .execute(conn)
                        .await?;
                }

                Ok(IssuedTickets {
                    tickets,
                    created: inserted > 0,
                })
            })
        })
        .await
    }

    async fn tickets_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Ticket>> {
        let mut conn = self.conn().await?;
        order_tickets(&mut conn, order_id).await
    }

    async fn generate_rp_ticket(
        &self,
        profile_id: Uuid,
        ticket: Ticket,
    ) -> StoreResult<QuotaOutcome> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let profile = rp_profiles::table
                    .find(profile_id)
                    .for_update()
                    .first::<DbRpProfile>(conn)
                    .await
                    .optional()?
                    .map(RpProfile::from)
                    .ok_or_else(|| StoreError::NotFound(format!("rp profile {}", profile_id)))?;

                if !profile.has_quota() {
                    return Ok(QuotaOutcome::Exhausted);
                }

                diesel::update(rp_profiles::table.find(profile_id))
                    .set(rp_profiles::tickets_generated.eq(rp_profiles::tickets_generated + 1))
                    .execute(conn)
                    .await?;
                diesel::insert_into(tickets::table)
                    .values(&DbTicket::from(&ticket))
                    .execute(conn)
                    .await?;

                Ok(QuotaOutcome::Granted(ticket))
            })
        })
        .await
    }

    async fn get_ticket_by_qr(&self, qr_code: &str) -> StoreResult<Ticket> {
        let mut conn = self.conn().await?;
        let row = tickets::table
            .filter(tickets::qr_code.eq(qr_code))
            .first::<DbTicket>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| StoreError::NotFound("ticket".to_string()))?;
        Ok(Ticket::try_from(row)?)
    }

    async fn check_in(&self, qr_code: &str, now: DateTime<Utc>) -> StoreResult<CheckInOutcome> {
        let mut conn = self.conn().await?;
        let qr_code = qr_code.to_string();

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let used = diesel::update(
                    tickets::table
                        .filter(tickets::qr_code.eq(&qr_code))
                        .filter(tickets::status.eq(TicketStatus::Valid.as_str())),
                )
                .set((
                    tickets::status.eq(TicketStatus::Used.as_str()),
                    tickets::used_at.eq(Some(now)),
                ))
                .get_result::<DbTicket>(conn)
                .await
                .optional()?;

                if let Some(row) = used {
                    diesel::update(events::table.find(row.event_id))
                        .set(events::checked_in_count.eq(events::checked_in_count + 1))
                        .execute(conn)
                        .await?;
                    if let Some(profile_id) = row.rp_profile_id {
                        diesel::update(rp_profiles::table.find(profile_id))
                            .set(rp_profiles::tickets_used.eq(rp_profiles::tickets_used + 1))
                            .execute(conn)
                            .await?;
                    }
                    return Ok(CheckInOutcome::CheckedIn(Ticket::try_from(row)?));
                }

                let row = tickets::table
                    .filter(tickets::qr_code.eq(&qr_code))
                    .first::<DbTicket>(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound("ticket".to_string()))?;
                let ticket = Ticket::try_from(row)?;
                Ok(match ticket.status {
                    TicketStatus::Cancelled => CheckInOutcome::Cancelled(ticket),
                    _ => CheckInOutcome::AlreadyUsed(ticket),
                })
            })
        })
        .await
    }

    async fn append_webhook(&self, entry: NewWebhookLog) -> StoreResult<WebhookAppend> {
        let mut conn = self.conn().await?;
        let row = NewDbWebhookLog {
            id: entry.id,
            gateway: entry.gateway.to_string(),
            external_event_id: entry.external_event_id,
            event_type: entry.event_type,
            verified: entry.verified,
            payload: entry.payload,
            created_at: entry.created_at,
        };

        let inserted = diesel::insert_into(webhook_logs::table)
            .values(&row)
            .on_conflict_do_nothing()
            .returning(webhook_logs::id)
            .get_result::<Uuid>(&mut conn)
            .await
            .optional()?;
        if let Some(id) = inserted {
            return Ok(WebhookAppend::Inserted(id));
        }

        let (id, processed_at) = webhook_logs::table
            .filter(webhook_logs::gateway.eq(&row.gateway))
            .filter(webhook_logs::external_event_id.eq(row.external_event_id.clone()))
            .select((webhook_logs::id, webhook_logs::processed_at))
            .first::<(Uuid, Option<DateTime<Utc>>)>(&mut conn)
            .await?;
        Ok(WebhookAppend::Duplicate {
            id,
            processed: processed_at.is_some(),
        })
    }

    async fn finish_webhook(
        &self,
        id: Uuid,
        order_id: Option<Uuid>,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let target = webhook_logs::table.find(id);
        let updated = match order_id {
            Some(order_id) => {
                diesel::update(target)
                    .set((
                        webhook_logs::order_id.eq(Some(order_id)),
                        webhook_logs::outcome.eq(Some(outcome.to_string())),
                        webhook_logs::processed_at.eq(Some(now)),
                    ))
                    .execute(&mut conn)
                    .await?
            }
            None => {
                diesel::update(target)
                    .set((
                        webhook_logs::outcome.eq(Some(outcome.to_string())),
                        webhook_logs::processed_at.eq(Some(now)),
                    ))
                    .execute(&mut conn)
                    .await?
            }
        };

        if updated == 0 {
            return Err(StoreError::NotFound(format!("webhook log {}", id)));
        }
        Ok(())
    }

    async fn get_webhook(&self, id: Uuid) -> StoreResult<WebhookLog> {
        let mut conn = self.conn().await?;
        let row = webhook_logs::table
            .find(id)
            .first::<DbWebhookLog>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("webhook log {}", id)))?;
        Ok(WebhookLog::try_from(row)?)
    }

    async fn pending_outbox(&self, limit: i64) -> StoreResult<Vec<OutboxEvent>> {
        let mut conn = self.conn().await?;
        Ok(outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .load::<DbOutboxEvent>(&mut conn)
            .await?
            .into_iter()
            .map(OutboxEvent::from)
            .collect())
    }

    async fn mark_outbox_processed(&self, id: Uuid) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
            .set(outbox_events::processed.eq(true))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::sql_query("SELECT 1").execute(&mut conn).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
