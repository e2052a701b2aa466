//! Capital ledger - principal, running balance and hard floor

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};

/// The single capital pool guarded by the risk rules
///
/// Only the sequential execute phase (and startup reconciliation) mutate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalLedger {
    pub principal: Decimal,
    pub running_balance: Decimal,
    pub floor: Decimal,
    /// Monotonic write counter, bumped on every committed debit
    #[serde(default)]
    pub revision: u64,
    pub last_updated: DateTime<Utc>,
}

/// Ledger snapshot for reporting
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub principal: Decimal,
    pub running_balance: Decimal,
    pub floor: Decimal,
    /// Capital that can still be spent before touching the floor
    pub headroom: Decimal,
    pub realized_change: Decimal,
    pub revision: u64,
}

impl CapitalLedger {
    /// Create a fresh ledger with the full principal available
    pub fn new(principal: Decimal, floor: Decimal) -> Self {
        Self {
            principal,
            running_balance: principal,
            floor,
            revision: 0,
            last_updated: Utc::now(),
        }
    }

    /// Balance that would remain after spending `cost`
    pub fn balance_after(&self, cost: Decimal) -> Decimal {
        self.running_balance - cost
    }

    /// Check if spending `cost` keeps the balance at or above the floor
    pub fn can_spend(&self, cost: Decimal) -> bool {
        self.balance_after(cost) >= self.floor
    }

    /// Apply a filled order's cost
    ///
    /// The caller persists the ledger before the next order is considered.
    pub fn debit(&mut self, cost: Decimal, reason: &str) -> Result<Decimal> {
        if cost < Decimal::ZERO {
            return Err(PipelineError::Invariant(format!(
                "negative debit {} ({})",
                cost, reason
            )));
        }

        let old = self.running_balance;
        self.running_balance -= cost;
        self.revision += 1;
        self.last_updated = Utc::now();

        info!(
            "Balance updated: {} -> {} | Reason: {}",
            old, self.running_balance, reason
        );
        Ok(self.running_balance)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            principal: self.principal,
            running_balance: self.running_balance,
            floor: self.floor,
            headroom: (self.running_balance - self.floor).max(Decimal::ZERO),
            realized_change: self.running_balance - self.principal,
            revision: self.revision,
        }
    }
}
