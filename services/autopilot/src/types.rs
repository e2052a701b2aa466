//! Core data model shared by the phases, the store and the event bus

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorClass;
use crate::phases::PhaseId;

/// A discovered candidate awaiting analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub ticker: String,
    pub discovered_at: DateTime<Utc>,
    /// Free-form metadata from the discovery source
    #[serde(default)]
    pub source_metadata: serde_json::Value,
    pub rank_score: f64,
}

impl Opportunity {
    pub fn new(ticker: impl Into<String>, rank_score: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker: ticker.into(),
            discovered_at: Utc::now(),
            source_metadata: serde_json::Value::Null,
            rank_score,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.source_metadata = metadata;
        self
    }

    pub fn discovered_at(mut self, at: DateTime<Utc>) -> Self {
        self.discovered_at = at;
        self
    }
}

/// Ranking order: higher rank score first, ties broken by earliest discovery
pub fn rank_cmp(a: &Opportunity, b: &Opportunity) -> std::cmp::Ordering {
    b.rank_score
        .partial_cmp(&a.rank_score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.discovered_at.cmp(&b.discovered_at))
}

pub fn rank_opportunities(items: &mut [Opportunity]) {
    items.sort_by(rank_cmp);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// Execution order lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Executing,
    Filled,
    Failed,
    Skipped,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Executing => "executing",
            OrderStatus::Filled => "filled",
            OrderStatus::Failed => "failed",
            OrderStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Failed | OrderStatus::Skipped
        )
    }

    /// Allowed status moves. Terminal states never move again.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Executing)
                | (OrderStatus::Pending, OrderStatus::Skipped)
                | (OrderStatus::Pending, OrderStatus::Failed)
                | (OrderStatus::Executing, OrderStatus::Filled)
                | (OrderStatus::Executing, OrderStatus::Failed)
        )
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = crate::error::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "executing" => Ok(OrderStatus::Executing),
            "filled" => Ok(OrderStatus::Filled),
            "failed" => Ok(OrderStatus::Failed),
            "skipped" => Ok(OrderStatus::Skipped),
            other => Err(crate::error::StoreError::Corrupt(format!(
                "unknown order status '{}'",
                other
            ))),
        }
    }
}

/// An analysis-approved action awaiting execution against the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOrder {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub ticker: String,
    pub side: OrderSide,
    /// Provisional at promotion, re-sized against the running balance before execution
    pub size: Decimal,
    pub confidence: f64,
    /// Upstream variance estimate, re-checked by the risk guard
    pub variance: f64,
    pub created_at: DateTime<Utc>,
    pub status: OrderStatus,
    #[serde(default)]
    pub fill_price: Option<Decimal>,
    #[serde(default)]
    pub venue_order_id: Option<String>,
    #[serde(default)]
    pub status_reason: Option<String>,
}

impl ExecutionOrder {
    pub fn promote(
        opportunity: &Opportunity,
        side: OrderSide,
        size: Decimal,
        confidence: f64,
        variance: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            opportunity_id: opportunity.id,
            ticker: opportunity.ticker.clone(),
            side,
            size,
            confidence,
            variance,
            created_at: Utc::now(),
            status: OrderStatus::Pending,
            fill_price: None,
            venue_order_id: None,
            status_reason: None,
        }
    }

    /// Cost charged against the ledger when this order fills
    pub fn cost(&self) -> Decimal {
        self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Running,
    Success,
    Failed,
    Aborted,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Running => "running",
            CycleOutcome::Success => "success",
            CycleOutcome::Failed => "failed",
            CycleOutcome::Aborted => "aborted",
        }
    }
}

impl std::str::FromStr for CycleOutcome {
    type Err = crate::error::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(CycleOutcome::Running),
            "success" => Ok(CycleOutcome::Success),
            "failed" => Ok(CycleOutcome::Failed),
            "aborted" => Ok(CycleOutcome::Aborted),
            other => Err(crate::error::StoreError::Corrupt(format!(
                "unknown cycle outcome '{}'",
                other
            ))),
        }
    }
}

/// Audit record for one pass through the phase sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_id: u64,
    pub phase: PhaseId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: CycleOutcome,
}

impl CycleRecord {
    pub fn start(cycle_id: u64) -> Self {
        Self {
            cycle_id,
            phase: PhaseId::Audit,
            started_at: Utc::now(),
            completed_at: None,
            outcome: CycleOutcome::Running,
        }
    }

    pub fn close(&mut self, outcome: CycleOutcome) {
        self.outcome = outcome;
        self.completed_at = Some(Utc::now());
    }
}

/// Durable record of an unhandled failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub cycle_id: u64,
    pub phase: PhaseId,
    pub message: String,
    pub severity: ErrorClass,
    pub diagnosis: Option<String>,
    pub patch_applied: Option<bool>,
    pub recoverable: bool,
    pub created_at: DateTime<Utc>,
}

/// The two named queues used for phase hand-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Opportunity,
    Execution,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Opportunity => "opportunity",
            QueueName::Execution => "execution",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable envelope for queued payloads
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem<T> {
    pub id: Uuid,
    pub payload: T,
    pub enqueued_at: DateTime<Utc>,
    /// Number of times this item has been handed to a consumer
    pub attempts: u32,
}

/// Archived cycle summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_id: u64,
    pub outcome: CycleOutcome,
    pub opportunities_discovered: usize,
    pub orders_promoted: usize,
    pub orders_filled: usize,
    pub orders_failed: usize,
    pub orders_skipped: usize,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub aborted_reason: Option<String>,
}

impl CycleSummary {
    pub fn new(cycle_id: u64, balance: Decimal) -> Self {
        Self {
            cycle_id,
            outcome: CycleOutcome::Running,
            opportunities_discovered: 0,
            orders_promoted: 0,
            orders_filled: 0,
            orders_failed: 0,
            orders_skipped: 0,
            balance_before: balance,
            balance_after: balance,
            aborted_reason: None,
        }
    }
}
