use shared::{OrderStatus, Ticket, TicketStatus};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::store::{Recipient, TicketingStore};
use crate::tokens::random_token;

/// Turns a paid order into redeemable tickets, once.
#[derive(Clone)]
pub struct TicketIssuer {
    store: Arc<dyn TicketingStore>,
    clock: Arc<dyn Clock>,
}

impl TicketIssuer {
    pub fn new(store: Arc<dyn TicketingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Returns the order's tickets, creating them first if none exist.
    ///
    /// Safe to call any number of times and concurrently: every unit is keyed by
    /// `(order, template, unit_index)` in the store, so a racing call can only add what is still
    /// missing. The delivery hand-off is queued together with the first successful insert.
    pub async fn issue_for_order(&self, order_id: Uuid) -> AppResult<Vec<Ticket>> {
        let existing = self.store.tickets_for_order(order_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let order = self.store.get_order(order_id).await?;
        if order.status != OrderStatus::Paid {
            return Err(AppError::Conflict(format!(
                "order {} is {}, tickets are only issued for paid orders",
                order_id, order.status
            )));
        }
        let buyer = self.store.get_buyer(order.buyer_id).await?;

        let now = self.clock.now();
        let tickets: Vec<Ticket> = order
            .items
            .iter()
            .flat_map(|item| (0..item.quantity).map(move |unit| (item.template_id, unit)))
            .map(|(template_id, unit_index)| Ticket {
                id: Uuid::new_v4(),
                event_id: order.event_id,
                order_id: Some(order.id),
                rp_profile_id: None,
                template_id: Some(template_id),
                guest_type_id: None,
                unit_index,
                qr_code: random_token(),
                status: TicketStatus::Valid,
                holder_name: Some(buyer.name.clone()),
                nickname: None,
                created_at: now,
                used_at: None,
            })
            .collect();

        let issued = self
            .store
            .issue_tickets(
                order.id,
                tickets,
                Recipient {
                    email: buyer.email,
                    name: buyer.name,
                },
                now,
            )
            .await?;

        if issued.created {
            info!(order_id = %order.id, count = issued.tickets.len(), "tickets issued");
        } else {
            info!(order_id = %order.id, "tickets were already issued by a concurrent call");
        }
        Ok(issued.tickets)
    }
}
