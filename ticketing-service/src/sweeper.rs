use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::error::AppResult;
use crate::issuer::TicketIssuer;
use crate::ledger::InventoryLedger;
use crate::settlement::Settlement;
use crate::store::{TicketingStore, Transition};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub released_orphans: usize,
    pub repaired: usize,
}

/// Periodic clean-up: expires abandoned orders, frees holds whose checkout never wrote an
/// order, and issues tickets for paid orders that ended up without any.
#[derive(Clone)]
pub struct ExpirySweeper {
    store: Arc<dyn TicketingStore>,
    ledger: InventoryLedger,
    settlement: Settlement,
    issuer: TicketIssuer,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch: i64,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn TicketingStore>,
        ledger: InventoryLedger,
        settlement: Settlement,
        issuer: TicketIssuer,
        clock: Arc<dyn Clock>,
        interval: Duration,
        batch: i64,
    ) -> Self {
        Self {
            store,
            ledger,
            settlement,
            issuer,
            clock,
            interval,
            batch,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            match self.sweep_once().await {
                Ok(report) if report != SweepReport::default() => {
                    info!(
                        expired = report.expired,
                        released_orphans = report.released_orphans,
                        repaired = report.repaired,
                        "sweep finished"
                    );
                }
                Ok(_) => debug!("sweep found nothing to do"),
                Err(e) => error!("Error sweeping expired orders: {}", e),
            }
        }
    }

    pub async fn sweep_once(&self) -> AppResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for order in self.store.expired_pending_orders(now, self.batch).await? {
            match self.settlement.expire(order.id).await {
                Ok(Transition::Applied(_)) => report.expired += 1,
                // A payment landed between the scan and the update.
                Ok(Transition::NotApplicable(_)) => {}
                Err(e) => error!(order_id = %order.id, error = %e, "failed to expire order"),
            }
        }

        for reservation in self.store.orphaned_reservations(now, self.batch).await? {
            match self.ledger.release(reservation.id).await {
                Ok(true) => report.released_orphans += 1,
                Ok(false) => {}
                Err(e) => error!(
                    reservation_id = %reservation.id,
                    error = %e,
                    "failed to release orphaned reservation"
                ),
            }
        }

        for order_id in self.store.paid_orders_without_tickets(self.batch).await? {
            match self.issuer.issue_for_order(order_id).await {
                Ok(_) => {
                    info!(order_id = %order_id, "issued missing tickets for paid order");
                    report.repaired += 1;
                }
                Err(e) => error!(order_id = %order_id, error = %e, "failed to issue missing tickets"),
            }
        }

        Ok(report)
    }
}
