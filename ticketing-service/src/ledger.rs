use chrono::{DateTime, Utc};
use shared::Reservation;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::{ReserveOutcome, ReserveRequest, TicketingStore};

/// Reserve, commit and release of per-template stock.
///
/// The counters themselves are only ever touched inside the store, in one atomic step per call.
/// A [`Reservation`] is the token handed back to the caller; commit and release act on it only
/// while it is still held, which is what makes both safe to repeat.
#[derive(Clone)]
pub struct InventoryLedger {
    store: Arc<dyn TicketingStore>,
}

impl InventoryLedger {
    pub fn new(store: Arc<dyn TicketingStore>) -> Self {
        Self { store }
    }

    pub async fn reserve(
        &self,
        order_id: Uuid,
        template_id: Uuid,
        quantity: i32,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        if quantity < 1 {
            return Err(AppError::Validation("quantity must be positive".to_string()));
        }

        let outcome = self
            .store
            .reserve(ReserveRequest {
                id: Uuid::new_v4(),
                order_id,
                template_id,
                quantity,
                expires_at,
            })
            .await?;

        match outcome {
            ReserveOutcome::Reserved(reservation) => {
                debug!(
                    reservation_id = %reservation.id,
                    template_id = %template_id,
                    quantity,
                    "inventory reserved"
                );
                Ok(reservation)
            }
            ReserveOutcome::Insufficient { available } => {
                info!(template_id = %template_id, quantity, available, "out of stock");
                Err(AppError::OutOfStock {
                    template_id,
                    available,
                })
            }
        }
    }

    /// Returns false when the reservation had already left the held state.
    pub async fn commit(&self, reservation_id: Uuid) -> AppResult<bool> {
        let moved = self.store.commit_reservation(reservation_id).await?;
        if !moved {
            debug!(reservation_id = %reservation_id, "commit ignored, reservation not held");
        }
        Ok(moved)
    }

    /// Returns false when the reservation had already left the held state.
    pub async fn release(&self, reservation_id: Uuid) -> AppResult<bool> {
        let moved = self.store.release_reservation(reservation_id).await?;
        if !moved {
            debug!(reservation_id = %reservation_id, "release ignored, reservation not held");
        }
        Ok(moved)
    }

    /// Best-effort release used when a checkout is abandoned halfway.
    pub(crate) async fn release_all(&self, reservations: &[Reservation]) {
        for reservation in reservations {
            if let Err(e) = self.release(reservation.id).await {
                tracing::error!(
                    reservation_id = %reservation.id,
                    error = %e,
                    "failed to release reservation, left for the sweep"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use bigdecimal::BigDecimal;
    use chrono::Duration;
    use shared::TicketTemplate;

    async fn ledger_with_stock(total: i32) -> (InventoryLedger, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let template_id = Uuid::new_v4();
        store
            .seed_template(TicketTemplate {
                id: template_id,
                event_id: Uuid::new_v4(),
                name: "Floor".to_string(),
                price: BigDecimal::from(250),
                currency: "MXN".to_string(),
                total_quantity: total,
                reserved: 0,
                sold: 0,
                max_per_order: None,
            })
            .await;
        (InventoryLedger::new(store.clone()), store, template_id)
    }

    #[tokio::test]
    async fn reserve_commit_release_keep_counters_consistent() {
        let (ledger, store, template_id) = ledger_with_stock(5).await;
        let expires_at = Utc::now() + Duration::minutes(30);

        let first = ledger.reserve(Uuid::new_v4(), template_id, 3, expires_at).await.unwrap();
        let second = ledger.reserve(Uuid::new_v4(), template_id, 2, expires_at).await.unwrap();
        let err = ledger
            .reserve(Uuid::new_v4(), template_id, 1, expires_at)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::OutOfStock { available: 0, .. }));

        assert!(ledger.commit(first.id).await.unwrap());
        assert!(!ledger.commit(first.id).await.unwrap());
        assert!(ledger.release(second.id).await.unwrap());
        assert!(!ledger.release(second.id).await.unwrap());

        let template = store.get_template(template_id).await.unwrap();
        assert_eq!(template.sold, 3);
        assert_eq!(template.reserved, 0);
        assert_eq!(template.available(), 2);
    }

    #[tokio::test]
    async fn rejects_non_positive_quantities() {
        let (ledger, _, template_id) = ledger_with_stock(5).await;
        let err = ledger
            .reserve(Uuid::new_v4(), template_id, 0, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
