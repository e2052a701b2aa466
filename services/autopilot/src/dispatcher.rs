//! Error dispatcher and circuit breaker
//!
//! Every failure that reaches a phase boundary goes through `dispatch`:
//! classify, persist, diagnose (best effort), then decide whether the
//! breaker trips. Item-level failures are only recorded and never escalate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collaborators::{Diagnoser, Diagnosis};
use crate::config::DispatcherConfig;
use crate::error::{ErrorClass, PipelineError};
use crate::events::{EventBus, PipelineEvent, VaultAction};
use crate::phases::PhaseId;
use crate::store::Store;
use crate::types::{CycleOutcome, ErrorRecord};

/// Persisted breaker state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    pub open: bool,
    /// Consecutive escalating errors since the last successful cycle
    pub consecutive_escalations: u32,
    pub tripped_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub last_reset_by: Option<String>,
    pub last_reset_at: Option<DateTime<Utc>>,
}

/// Outcome of dispatching one phase-level failure
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// `None` when the error could not be persisted
    pub error_id: Option<Uuid>,
    pub severity: ErrorClass,
    pub recoverable: bool,
    pub cycle_outcome: CycleOutcome,
    pub breaker_tripped: bool,
    pub diagnosis: Option<Diagnosis>,
}

pub struct ErrorDispatcher {
    store: Arc<Store>,
    diagnoser: Arc<dyn Diagnoser>,
    events: EventBus,
    retry_budget: u32,
    diagnosis_timeout: Duration,
    breaker: RwLock<BreakerState>,
}

impl ErrorDispatcher {
    /// Create a dispatcher, restoring breaker state from the store
    pub fn new(
        store: Arc<Store>,
        diagnoser: Arc<dyn Diagnoser>,
        events: EventBus,
        config: &DispatcherConfig,
    ) -> crate::error::Result<Self> {
        let breaker: BreakerState = store.load_breaker()?.unwrap_or_default();
        if breaker.open {
            warn!(
                "Circuit breaker is OPEN since {:?}: {}",
                breaker.tripped_at,
                breaker.reason.as_deref().unwrap_or("unknown")
            );
        }

        Ok(Self {
            store,
            diagnoser,
            events,
            retry_budget: config.retry_budget.max(1),
            diagnosis_timeout: config.diagnosis_timeout(),
            breaker: RwLock::new(breaker),
        })
    }

    pub fn with_diagnosis_timeout(mut self, timeout: Duration) -> Self {
        self.diagnosis_timeout = timeout;
        self
    }

    pub async fn is_open(&self) -> bool {
        self.breaker.read().await.open
    }

    pub async fn breaker_state(&self) -> BreakerState {
        self.breaker.read().await.clone()
    }

    /// Persist a record without escalation (item failures, risk aborts)
    pub fn record(
        &self,
        cycle_id: u64,
        phase: PhaseId,
        severity: ErrorClass,
        message: impl Into<String>,
    ) -> crate::error::Result<ErrorRecord> {
        let record = ErrorRecord {
            id: Uuid::new_v4(),
            cycle_id,
            phase,
            message: message.into(),
            severity,
            diagnosis: None,
            patch_applied: None,
            recoverable: severity != ErrorClass::Fatal,
            created_at: Utc::now(),
        };
        self.store.append_error(&record)?;
        self.emit_error(&record);
        Ok(record)
    }

    /// Record an isolated failure of a single opportunity or order
    pub fn record_item_error(
        &self,
        cycle_id: u64,
        phase: PhaseId,
        err: &PipelineError,
    ) -> crate::error::Result<ErrorRecord> {
        warn!("Cycle {} {} item failed: {}", cycle_id, phase, err);
        self.record(cycle_id, phase, ErrorClass::ItemLevel, err.to_string())
    }

    /// Resolve a phase-level failure
    pub async fn dispatch(&self, cycle_id: u64, phase: PhaseId, err: &PipelineError) -> Resolution {
        let severity = err.class();
        error!(cycle_id, phase = %phase, severity = %severity, "Phase failed: {}", err);

        let record = match self.record(cycle_id, phase, severity, err.to_string()) {
            Ok(record) => record,
            Err(persist_err) => {
                self.trip(format!("error log unavailable: {}", persist_err))
                    .await;
                return Resolution {
                    error_id: None,
                    severity: ErrorClass::Fatal,
                    recoverable: false,
                    cycle_outcome: CycleOutcome::Failed,
                    breaker_tripped: true,
                    diagnosis: None,
                };
            }
        };

        let diagnosis = self.diagnose(&record).await;

        let escalates = match severity {
            ErrorClass::Fatal => true,
            ErrorClass::ItemLevel => false,
            ErrorClass::Transient | ErrorClass::Systemic => diagnosis.is_none(),
        };

        let tripped = if err.trips_breaker() {
            self.trip(record.message.clone()).await;
            true
        } else if escalates {
            self.escalate(&record).await
        } else {
            false
        };

        Resolution {
            error_id: Some(record.id),
            severity,
            recoverable: !tripped,
            cycle_outcome: if tripped {
                CycleOutcome::Failed
            } else {
                CycleOutcome::Aborted
            },
            breaker_tripped: tripped,
            diagnosis,
        }
    }

    /// A clean cycle clears the consecutive escalation count
    pub async fn note_success(&self) {
        let mut breaker = self.breaker.write().await;
        if breaker.consecutive_escalations == 0 {
            return;
        }
        breaker.consecutive_escalations = 0;
        if let Err(e) = self.store.save_breaker(&*breaker) {
            warn!("Failed to persist breaker counter reset: {}", e);
        }
    }

    /// Explicit operator reset
    pub async fn reset(&self, operator: &str) -> crate::error::Result<()> {
        let mut breaker = self.breaker.write().await;
        let was_open = breaker.open;
        breaker.open = false;
        breaker.consecutive_escalations = 0;
        breaker.reason = None;
        breaker.tripped_at = None;
        breaker.last_reset_by = Some(operator.to_string());
        breaker.last_reset_at = Some(Utc::now());
        self.store.save_breaker(&*breaker)?;

        info!("Circuit breaker reset by {} (was open: {})", operator, was_open);
        self.events.emit(PipelineEvent::vault(
            VaultAction::BreakerReset,
            None,
            rust_decimal::Decimal::ZERO,
            rust_decimal::Decimal::ZERO,
            format!("reset by {}", operator),
        ));
        Ok(())
    }

    async fn diagnose(&self, record: &ErrorRecord) -> Option<Diagnosis> {
        let context = serde_json::json!({
            "cycle_id": record.cycle_id,
            "phase": record.phase,
            "severity": record.severity,
        });

        let diagnosis = match tokio::time::timeout(
            self.diagnosis_timeout,
            self.diagnoser.diagnose(&record.message, &context),
        )
        .await
        {
            Ok(Ok(diagnosis)) => diagnosis,
            Ok(Err(e)) => {
                warn!("Diagnosis unavailable for {}: {}", record.id, e);
                return None;
            }
            Err(_) => {
                warn!(
                    "Diagnosis for {} timed out after {:?}",
                    record.id, self.diagnosis_timeout
                );
                return None;
            }
        };

        if let Err(e) =
            self.store
                .attach_diagnosis(record.id, &diagnosis.root_cause, diagnosis.patch_applied)
        {
            warn!("Failed to attach diagnosis to {}: {}", record.id, e);
        }

        self.events.emit(PipelineEvent::Fixer {
            error_id: record.id,
            root_cause: diagnosis.root_cause.clone(),
            suggested_fix: diagnosis.suggested_fix.clone(),
            patch_applied: diagnosis.patch_applied,
            at: Utc::now(),
        });
        Some(diagnosis)
    }

    /// Count one escalation; returns true if this trips the breaker
    async fn escalate(&self, record: &ErrorRecord) -> bool {
        let count = {
            let mut breaker = self.breaker.write().await;
            breaker.consecutive_escalations += 1;
            if let Err(e) = self.store.save_breaker(&*breaker) {
                warn!("Failed to persist breaker counter: {}", e);
            }
            breaker.consecutive_escalations
        };

        warn!(
            "Escalation {}/{} ({}: {})",
            count, self.retry_budget, record.severity, record.message
        );

        if count >= self.retry_budget {
            self.trip(format!(
                "{} consecutive escalations, last: {}",
                count, record.message
            ))
            .await;
            return true;
        }
        false
    }

    async fn trip(&self, reason: String) {
        let mut breaker = self.breaker.write().await;
        breaker.open = true;
        breaker.tripped_at = Some(Utc::now());
        breaker.reason = Some(reason.clone());

        error!("🛑 Circuit breaker TRIPPED: {}", reason);
        if let Err(e) = self.store.save_breaker(&*breaker) {
            // Still open in memory; cycle starts stay blocked for this process
            error!("Failed to persist breaker trip: {}", e);
        }
    }

    fn emit_error(&self, record: &ErrorRecord) {
        self.events.emit(PipelineEvent::Error {
            error_id: record.id,
            cycle_id: record.cycle_id,
            phase: record.phase,
            severity: record.severity,
            message: record.message.clone(),
            at: record.created_at,
        });
    }
}
