//! Autopilot Library
//!
//! Durable, phase-driven trading pipeline: discover, analyze, risk-check and
//! execute opportunities against a capital pool that never drops below its floor.

pub mod amount;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod flow;
pub mod gateway;
pub mod ledger;
pub mod phases;
pub mod reconciler;
pub mod retry;
pub mod risk;
pub mod runner;
pub mod store;
pub mod types;
pub mod venue;


// Re-export main types for convenience
pub use client::{spawn_forwarder, ControlPlaneClient, EventInput};
pub use collaborators::{
    Analysis, Analyzer, AuditProbe, Diagnoser, Diagnosis, DiscoverySource, Fill, FillStatus,
    NoDiagnosis, NoopAudit, Venue,
};
pub use config::AutopilotConfig;
pub use coordinator::{CoordinatorStatus, CycleCoordinator, CycleStart, Tick};
pub use dispatcher::{BreakerState, ErrorDispatcher, Resolution};
pub use error::{ErrorClass, PipelineError, StoreError};
pub use events::{EventBus, PipelineEvent, VaultAction};
pub use ledger::{CapitalLedger, LedgerSnapshot};
pub use phases::PhaseId;
pub use retry::RetryPolicy;
pub use risk::{RiskGuard, RiskVerdict};
pub use runner::{Collaborators, CycleReport, PhaseRunner};
pub use store::Store;
pub use types::{
    CycleOutcome, CycleRecord, CycleSummary, ErrorRecord, ExecutionOrder, Opportunity,
    OrderSide, OrderStatus, QueueName,
};
