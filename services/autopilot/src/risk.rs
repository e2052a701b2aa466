//! Risk guard - evaluated before every execution step
//!
//! Two rules, checked in a fixed order, either of which blocks:
//! 1. Capital floor: `running_balance - cost < floor`
//! 2. Variance veto: `variance > variance_threshold`
//!
//! Confidence is not an input. A high score can never override a deny.

use serde::Serialize;

use crate::config::RiskConfig;
use crate::ledger::CapitalLedger;
use crate::types::ExecutionOrder;

/// Which rule produced the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRule {
    CapitalFloor,
    VarianceVeto,
}

/// Risk guard decision for one candidate order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskVerdict {
    pub allow: bool,
    pub reason: String,
    /// Set on deny
    pub rule: Option<RiskRule>,
}

impl RiskVerdict {
    fn allow() -> Self {
        Self {
            allow: true,
            reason: "within limits".to_string(),
            rule: None,
        }
    }

    fn deny(rule: RiskRule, reason: String) -> Self {
        Self {
            allow: false,
            reason,
            rule: Some(rule),
        }
    }

    /// A deny stops the rest of the execution queue for this cycle
    pub fn aborts_remaining(&self) -> bool {
        !self.allow
    }
}

/// Pure predicate over the ledger and a candidate order
#[derive(Debug, Clone, Copy)]
pub struct RiskGuard {
    variance_threshold: f64,
}

impl RiskGuard {
    pub fn new(variance_threshold: f64) -> Self {
        Self { variance_threshold }
    }

    pub fn from_config(config: &RiskConfig) -> Self {
        Self::new(config.variance_threshold)
    }

    pub fn check(&self, ledger: &CapitalLedger, order: &ExecutionOrder) -> RiskVerdict {
        let cost = order.cost();
        if !ledger.can_spend(cost) {
            return RiskVerdict::deny(
                RiskRule::CapitalFloor,
                format!(
                    "balance {} - cost {} would breach floor {}",
                    ledger.running_balance, cost, ledger.floor
                ),
            );
        }

        // NaN variance is treated as unbounded
        if order.variance.is_nan() || order.variance > self.variance_threshold {
            return RiskVerdict::deny(
                RiskRule::VarianceVeto,
                format!(
                    "variance {:.4} exceeds threshold {:.4}",
                    order.variance, self.variance_threshold
                ),
            );
        }

        RiskVerdict::allow()
    }
}
