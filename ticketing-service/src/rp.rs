use serde::{Deserialize, Serialize};
use shared::{GuestType, RpProfile, Ticket, TicketStatus};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::store::{QuotaOutcome, StoreError, TicketingStore};
use crate::tokens::random_token;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestRequest {
    pub guest_type_id: Uuid,
    pub holder_name: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpInfo {
    pub code: String,
    pub display_name: String,
    pub event_id: Uuid,
    pub max_tickets: Option<i32>,
    pub tickets_generated: i32,
    pub tickets_used: i32,
    /// `None` when the promoter is uncapped.
    pub remaining: Option<i32>,
    pub guest_types: Vec<GuestType>,
}

/// Courtesy tickets handed out by promoters, capped per profile.
#[derive(Clone)]
pub struct RpQuotaEngine {
    store: Arc<dyn TicketingStore>,
    clock: Arc<dyn Clock>,
}

impl RpQuotaEngine {
    pub fn new(store: Arc<dyn TicketingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn usable_profile(&self, code: &str) -> AppResult<RpProfile> {
        match self.store.find_rp_profile(code.trim()).await? {
            Some(profile) if profile.is_usable(self.clock.now()) => Ok(profile),
            _ => Err(AppError::InvalidOrInactiveCode),
        }
    }

    pub async fn info(&self, code: &str) -> AppResult<RpInfo> {
        let profile = self.usable_profile(code).await?;
        let guest_types = self.store.guest_types_for_event(profile.event_id).await?;

        Ok(RpInfo {
            remaining: profile.remaining(),
            code: profile.code,
            display_name: profile.display_name,
            event_id: profile.event_id,
            max_tickets: profile.max_tickets,
            tickets_generated: profile.tickets_generated,
            tickets_used: profile.tickets_used,
            guest_types,
        })
    }

    /// The quota check and the increment happen in the store as one step; the profile read
    /// here is only used to find the event and reject inactive codes.
    pub async fn generate(&self, code: &str, request: GuestRequest) -> AppResult<Ticket> {
        let holder_name = request.holder_name.trim();
        if holder_name.is_empty() {
            return Err(AppError::Validation("guest name is required".to_string()));
        }

        let profile = self.usable_profile(code).await?;
        let guest_type = match self.store.get_guest_type(request.guest_type_id).await {
            Ok(guest_type) if guest_type.event_id == profile.event_id => guest_type,
            Ok(_) | Err(StoreError::NotFound(_)) => {
                return Err(AppError::Validation(format!(
                    "guest type {} is not offered for this event",
                    request.guest_type_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let now = self.clock.now();
        let ticket = Ticket {
            id: Uuid::new_v4(),
            event_id: profile.event_id,
            order_id: None,
            rp_profile_id: Some(profile.id),
            template_id: None,
            guest_type_id: Some(guest_type.id),
            unit_index: 0,
            qr_code: random_token(),
            status: TicketStatus::Valid,
            holder_name: Some(holder_name.to_string()),
            nickname: request
                .nickname
                .map(|nickname| nickname.trim().to_string())
                .filter(|nickname| !nickname.is_empty()),
            created_at: now,
            used_at: None,
        };

        match self.store.generate_rp_ticket(profile.id, ticket).await? {
            QuotaOutcome::Granted(ticket) => {
                info!(
                    rp_profile_id = %profile.id,
                    ticket_id = %ticket.id,
                    guest_type = %guest_type.name,
                    "courtesy ticket generated"
                );
                Ok(ticket)
            }
            QuotaOutcome::Exhausted => {
                info!(rp_profile_id = %profile.id, "courtesy quota exhausted");
                Err(AppError::QuotaExhausted)
            }
        }
    }
}
