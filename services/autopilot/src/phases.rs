//! Phase state machine
//!
//! Pure transition function with no I/O. Phases run in a fixed order with no
//! skipping and no re-entry; `Intervene` is reachable from any running phase.
//! Invalid transitions return an error instead of panicking.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Phase identifier, persisted on the cycle record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    Audit,
    Discover,
    Analyze,
    Execute,
    Archive,
    Done,
    Intervene,
}

impl PhaseId {
    /// Regular phase order for one cycle
    pub const SEQUENCE: [PhaseId; 6] = [
        PhaseId::Audit,
        PhaseId::Discover,
        PhaseId::Analyze,
        PhaseId::Execute,
        PhaseId::Archive,
        PhaseId::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Audit => "audit",
            PhaseId::Discover => "discover",
            PhaseId::Analyze => "analyze",
            PhaseId::Execute => "execute",
            PhaseId::Archive => "archive",
            PhaseId::Done => "done",
            PhaseId::Intervene => "intervene",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseId::Done)
    }

    fn next(&self) -> Option<PhaseId> {
        match self {
            PhaseId::Audit => Some(PhaseId::Discover),
            PhaseId::Discover => Some(PhaseId::Analyze),
            PhaseId::Analyze => Some(PhaseId::Execute),
            PhaseId::Execute => Some(PhaseId::Archive),
            PhaseId::Archive => Some(PhaseId::Done),
            PhaseId::Done | PhaseId::Intervene => None,
        }
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseId {
    type Err = crate::error::StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "audit" => Ok(PhaseId::Audit),
            "discover" => Ok(PhaseId::Discover),
            "analyze" => Ok(PhaseId::Analyze),
            "execute" => Ok(PhaseId::Execute),
            "archive" => Ok(PhaseId::Archive),
            "done" => Ok(PhaseId::Done),
            "intervene" => Ok(PhaseId::Intervene),
            other => Err(crate::error::StoreError::Corrupt(format!(
                "unknown phase '{}'",
                other
            ))),
        }
    }
}

/// Events that drive the phase machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Current phase finished normally
    Completed,
    /// Current phase raised an unhandled failure
    Failed { message: String },
    /// Error dispatcher finished with the intervention
    Resolved,
}

/// Pure transition function
pub fn transition(phase: PhaseId, event: PhaseEvent) -> Result<PhaseId> {
    match (phase, event) {
        (PhaseId::Intervene, PhaseEvent::Resolved) => Ok(PhaseId::Done),

        (PhaseId::Done, event) => Err(PipelineError::InvalidTransition(format!(
            "cycle already done, cannot handle {:?}",
            event
        ))),

        (PhaseId::Intervene, event) => Err(PipelineError::InvalidTransition(format!(
            "intervene only accepts Resolved, got {:?}",
            event
        ))),

        (_, PhaseEvent::Failed { .. }) => Ok(PhaseId::Intervene),

        (phase, PhaseEvent::Completed) => phase.next().ok_or_else(|| {
            PipelineError::InvalidTransition(format!("no phase after {}", phase))
        }),

        (phase, PhaseEvent::Resolved) => Err(PipelineError::InvalidTransition(format!(
            "{} is not intervening",
            phase
        ))),
    }
}
