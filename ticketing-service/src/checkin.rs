use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{Ticket, TicketStatus};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::store::{CheckInOutcome, StoreError, StoreResult, TicketingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    Paid,
    Courtesy,
}

/// What the scanner shows before admitting someone.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketView {
    pub ticket_id: Uuid,
    pub event_id: Uuid,
    pub kind: TicketKind,
    pub status: TicketStatus,
    pub used_at: Option<DateTime<Utc>>,
    pub holder_name: Option<String>,
    pub nickname: Option<String>,
    /// Template name for paid tickets, guest type name for courtesy tickets.
    pub category: Option<String>,
}

/// A missing category row only blanks the label; any other store failure is still an error.
fn found<T>(result: StoreResult<T>) -> AppResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Clone)]
pub struct CheckInStateMachine {
    store: Arc<dyn TicketingStore>,
    clock: Arc<dyn Clock>,
}

impl CheckInStateMachine {
    pub fn new(store: Arc<dyn TicketingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Read-only; always goes to the store.
    pub async fn validate(&self, qr_code: &str) -> AppResult<TicketView> {
        let ticket = self.store.get_ticket_by_qr(qr_code).await?;

        let category = if let Some(template_id) = ticket.template_id {
            found(self.store.get_template(template_id).await)?.map(|t| t.name)
        } else if let Some(guest_type_id) = ticket.guest_type_id {
            found(self.store.get_guest_type(guest_type_id).await)?.map(|g| g.name)
        } else {
            None
        };

        Ok(TicketView {
            ticket_id: ticket.id,
            event_id: ticket.event_id,
            kind: if ticket.rp_profile_id.is_some() {
                TicketKind::Courtesy
            } else {
                TicketKind::Paid
            },
            status: ticket.status,
            used_at: ticket.used_at,
            holder_name: ticket.holder_name,
            nickname: ticket.nickname,
            category,
        })
    }

    /// `Valid -> Used`, once. The loser of a race sees `AlreadyUsed` with the winner's time.
    pub async fn check_in(&self, qr_code: &str) -> AppResult<Ticket> {
        match self.store.check_in(qr_code, self.clock.now()).await? {
            CheckInOutcome::CheckedIn(ticket) => {
                info!(ticket_id = %ticket.id, event_id = %ticket.event_id, "checked in");
                Ok(ticket)
            }
            CheckInOutcome::AlreadyUsed(ticket) => {
                warn!(ticket_id = %ticket.id, used_at = ?ticket.used_at, "ticket already used");
                match ticket.used_at {
                    Some(used_at) => Err(AppError::AlreadyUsed { used_at }),
                    None => Err(AppError::Internal(format!(
                        "ticket {} is used without a timestamp",
                        ticket.id
                    ))),
                }
            }
            CheckInOutcome::Cancelled(ticket) => {
                warn!(ticket_id = %ticket.id, "cancelled ticket presented");
                Err(AppError::TicketCancelled)
            }
        }
    }
}
