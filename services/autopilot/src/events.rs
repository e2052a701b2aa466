//! Pipeline event bus
//!
//! Phases and the dispatcher emit `PipelineEvent`s; any number of
//! subscribers (the control-plane forwarder, tests) read them. Emitting never
//! blocks, and events are dropped when nobody is listening.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::error::ErrorClass;
use crate::phases::PhaseId;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// What happened to the capital pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultAction {
    Debit,
    RiskDenied,
    KillSwitch,
    BreakerReset,
}

/// Tagged event union; `kind` is the wire discriminant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    Log {
        level: LogLevel,
        cycle_id: Option<u64>,
        phase: Option<PhaseId>,
        message: String,
        at: DateTime<Utc>,
    },
    Vault {
        action: VaultAction,
        cycle_id: Option<u64>,
        amount: Decimal,
        balance: Decimal,
        reason: String,
        at: DateTime<Utc>,
    },
    Simulation {
        cycle_id: u64,
        order_id: Uuid,
        ticker: String,
        size: Decimal,
        fill_price: Option<Decimal>,
        venue: String,
        at: DateTime<Utc>,
    },
    Error {
        error_id: Uuid,
        cycle_id: u64,
        phase: PhaseId,
        severity: ErrorClass,
        message: String,
        at: DateTime<Utc>,
    },
    Fixer {
        error_id: Uuid,
        root_cause: String,
        suggested_fix: Option<String>,
        patch_applied: Option<bool>,
        at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn log(level: LogLevel, cycle_id: Option<u64>, phase: Option<PhaseId>, message: impl Into<String>) -> Self {
        PipelineEvent::Log {
            level,
            cycle_id,
            phase,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn vault(
        action: VaultAction,
        cycle_id: Option<u64>,
        amount: Decimal,
        balance: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        PipelineEvent::Vault {
            action,
            cycle_id,
            amount,
            balance,
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    /// Wire discriminant, matching the serialized `kind` field
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::Log { .. } => "log",
            PipelineEvent::Vault { .. } => "vault",
            PipelineEvent::Simulation { .. } => "simulation",
            PipelineEvent::Error { .. } => "error",
            PipelineEvent::Fixer { .. } => "fixer",
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        match self {
            PipelineEvent::Log { message, .. } => message.clone(),
            PipelineEvent::Vault {
                action, amount, balance, reason, ..
            } => format!("{:?} {} -> balance {} ({})", action, amount, balance, reason),
            PipelineEvent::Simulation {
                ticker, size, fill_price, venue, ..
            } => match fill_price {
                Some(price) => format!("{} filled {} @ {} on {}", ticker, size, price, venue),
                None => format!("{} filled {} on {}", ticker, size, venue),
            },
            PipelineEvent::Error {
                severity, phase, message, ..
            } => format!("[{}] {}: {}", severity, phase, message),
            PipelineEvent::Fixer { root_cause, .. } => format!("diagnosis: {}", root_cause),
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::Log { at, .. }
            | PipelineEvent::Vault { at, .. }
            | PipelineEvent::Simulation { at, .. }
            | PipelineEvent::Error { at, .. }
            | PipelineEvent::Fixer { at, .. } => *at,
        }
    }
}

/// Fan-out event bus over a tokio broadcast channel
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}
