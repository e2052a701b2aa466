//! Startup reconciliation - settle orders interrupted mid-execution
//!
//! An order left in `executing` means the process stopped between asking
//! the venue and recording the answer. The venue is the source of truth:
//! if it knows a fill, the debit is applied now; otherwise the order failed.

use chrono::Utc;
use tracing::{info, warn};

use crate::collaborators::{FillStatus, Venue};
use crate::error::Result;
use crate::ledger::CapitalLedger;
use crate::store::Store;
use crate::types::OrderStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub timestamp: Option<chrono::DateTime<Utc>>,
    pub recovered_queue_items: usize,
    pub settled_filled: usize,
    pub settled_failed: usize,
}

impl ReconciliationResult {
    pub fn is_clean(&self) -> bool {
        self.recovered_queue_items == 0 && self.settled_filled == 0 && self.settled_failed == 0
    }
}

/// Return in-flight queue items and settle interrupted orders
pub async fn reconcile_on_startup(
    store: &Store,
    venue: &dyn Venue,
    ledger: &mut CapitalLedger,
) -> Result<ReconciliationResult> {
    let mut result = ReconciliationResult {
        timestamp: Some(Utc::now()),
        recovered_queue_items: store.recover_on_startup()?,
        ..Default::default()
    };

    let stuck = store.orders_with_status(OrderStatus::Executing)?;
    if stuck.is_empty() {
        return Ok(result);
    }
    info!("Reconciling {} interrupted orders against {}", stuck.len(), venue.name());

    for mut order in stuck {
        let client_id = order.id.to_string();
        let fill = match venue.lookup_order(&client_id).await {
            Ok(fill) => fill,
            Err(e) => {
                // Leave it for the next startup rather than guessing
                warn!("Could not look up order {}: {}", order.id, e);
                continue;
            }
        };

        match fill {
            Some(fill) if fill.status == FillStatus::Filled => {
                let mut debited = ledger.clone();
                debited.debit(order.cost(), &format!("reconciled fill {}", order.id))?;
                order.status = OrderStatus::Filled;
                order.fill_price = fill.fill_price;
                order.venue_order_id = Some(fill.order_id);
                order.status_reason = Some("settled on restart".to_string());
                store.commit_fill(&order, &debited)?;
                *ledger = debited;
                result.settled_filled += 1;
            }
            _ => {
                order.status = OrderStatus::Failed;
                order.status_reason = Some("interrupted before venue confirmation".to_string());
                store.update_order(&order)?;
                result.settled_failed += 1;
            }
        }
    }

    info!(
        "Reconciliation complete: {} queue items recovered, {} fills settled, {} orders failed",
        result.recovered_queue_items, result.settled_filled, result.settled_failed
    );
    Ok(result)
}
