//! External collaborator seams
//!
//! The pipeline only ever talks to discovery, analysis, the venue and the
//! diagnosis service through these traits. HTTP adapters live in
//! `gateway`, `discovery` and `venue`; tests supply in-process mocks.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::{Opportunity, OrderSide};

/// Analysis result for one opportunity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub confidence: f64,
    pub variance: f64,
    /// Analyzer-side hard veto
    #[serde(default)]
    pub veto: bool,
    #[serde(default = "default_side")]
    pub side: OrderSide,
}

fn default_side() -> OrderSide {
    OrderSide::Buy
}

impl Analysis {
    pub fn new(confidence: f64, variance: f64) -> Self {
        Self {
            confidence,
            variance,
            veto: false,
            side: OrderSide::Buy,
        }
    }

    pub fn vetoed(mut self) -> Self {
        self.veto = true;
        self
    }
}

/// Venue-reported order state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Filled,
    Rejected,
}

/// Venue acknowledgement for a placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub status: FillStatus,
    pub fill_price: Option<Decimal>,
}

/// Diagnosis service answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause: String,
    pub suggested_fix: Option<String>,
    /// Whether the service applied a fix on its own
    #[serde(default)]
    pub patch_applied: Option<bool>,
}

/// Produces candidate opportunities
#[async_trait::async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn discover(&self) -> Result<Vec<Opportunity>>;

    /// Source name used in logs and error records
    fn name(&self) -> &str;
}

/// Scores an opportunity
#[async_trait::async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, opportunity: &Opportunity) -> Result<Analysis>;
}

/// Execution venue
#[async_trait::async_trait]
pub trait Venue: Send + Sync {
    /// Place an order. `client_id` is the journal id, usable by the venue for dedupe.
    async fn place_order(
        &self,
        client_id: &str,
        ticker: &str,
        side: OrderSide,
        size: Decimal,
    ) -> Result<Fill>;

    /// Look up an order by client id (startup reconciliation)
    async fn lookup_order(&self, _client_id: &str) -> Result<Option<Fill>> {
        Ok(None)
    }

    /// Close all open positions (kill switch); returns how many were closed
    async fn flatten_all(&self) -> Result<usize> {
        Ok(0)
    }

    fn name(&self) -> &str;
}

/// Root-cause analysis for escalated errors
#[async_trait::async_trait]
pub trait Diagnoser: Send + Sync {
    async fn diagnose(&self, message: &str, context: &Value) -> Result<Diagnosis>;
}

/// Pre-cycle environment check
#[async_trait::async_trait]
pub trait AuditProbe: Send + Sync {
    async fn check(&self) -> Result<()>;
}

/// Probe that always passes
pub struct NoopAudit;

#[async_trait::async_trait]
impl AuditProbe for NoopAudit {
    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// Diagnoser for deployments without a diagnosis service
pub struct NoDiagnosis;

#[async_trait::async_trait]
impl Diagnoser for NoDiagnosis {
    async fn diagnose(&self, _message: &str, _context: &Value) -> Result<Diagnosis> {
        Err(crate::error::PipelineError::transient(
            "diagnose",
            "no diagnosis service configured",
        ))
    }
}
