//! Cycle coordinator - owns the ledger and decides when cycles run
//!
//! At most one cycle runs at a time: the ledger lock doubles as the
//! running guard, so a concurrent `start_cycle` returns `AlreadyRunning`
//! instead of queueing behind the active cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collaborators::Diagnoser;
use crate::config::AutopilotConfig;
use crate::dispatcher::{BreakerState, ErrorDispatcher};
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent, VaultAction};
use crate::flow::{RestockGate, RestockToken};
use crate::ledger::{CapitalLedger, LedgerSnapshot};
use crate::reconciler::{reconcile_on_startup, ReconciliationResult};
use crate::retry::RetryPolicy;
use crate::runner::{Collaborators, CycleReport, PhaseRunner};
use crate::store::{QueueDepth, Store};
use crate::types::{CycleOutcome, CycleRecord, QueueName};

/// Answer to a cycle start request
#[derive(Debug)]
pub enum CycleStart {
    Completed(Box<CycleReport>),
    /// Another cycle holds the ledger
    AlreadyRunning,
    /// The circuit breaker blocks all cycles until an operator reset
    BreakerOpen,
}

impl CycleStart {
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleStart::Completed(report) => Some(&**report),
            _ => None,
        }
    }
}

/// One autopilot step
#[derive(Debug)]
pub struct Tick {
    pub start: CycleStart,
    /// Restock token granted; the next cycle starts without the cooldown
    pub restock: Option<RestockToken>,
}

/// Point-in-time view for operators
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub autopilot: bool,
    pub cycle_running: bool,
    pub ledger: Option<LedgerSnapshot>,
    pub breaker: BreakerState,
    pub opportunity_queue: QueueDepth,
    pub execution_queue: QueueDepth,
    /// Confirmed fills waiting for a journal write
    pub unsettled_fills: usize,
    pub cycles_archived: usize,
    pub errors_logged: usize,
    pub recent_cycles: Vec<CycleStatusLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleStatusLine {
    pub cycle_id: u64,
    pub outcome: CycleOutcome,
    pub phase: String,
    pub started_at: DateTime<Utc>,
}

impl From<CycleRecord> for CycleStatusLine {
    fn from(record: CycleRecord) -> Self {
        Self {
            cycle_id: record.cycle_id,
            outcome: record.outcome,
            phase: record.phase.to_string(),
            started_at: record.started_at,
        }
    }
}

pub struct CycleCoordinator {
    store: Arc<Store>,
    runner: PhaseRunner,
    dispatcher: Arc<ErrorDispatcher>,
    events: EventBus,
    config: AutopilotConfig,
    ledger: Mutex<CapitalLedger>,
    autopilot: AtomicBool,
    cancel: StdMutex<CancellationToken>,
    restock: StdMutex<RestockGate>,
    startup: ReconciliationResult,
}

impl CycleCoordinator {
    /// Recover the store, settle interrupted orders and load the ledger
    pub async fn bootstrap(
        config: AutopilotConfig,
        store: Arc<Store>,
        collaborators: Collaborators,
        diagnoser: Arc<dyn Diagnoser>,
        events: EventBus,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PipelineError::rejected("bootstrap", e.to_string()))?;

        let mut ledger = match store.load_ledger()? {
            Some(ledger) => {
                info!(
                    "Loaded ledger: balance {} (principal {}, floor {})",
                    ledger.running_balance, ledger.principal, ledger.floor
                );
                ledger
            }
            None => {
                let ledger = CapitalLedger::new(config.risk.principal, config.risk.floor);
                store.save_ledger(&ledger)?;
                info!(
                    "Initialized ledger: principal {}, floor {}",
                    ledger.principal, ledger.floor
                );
                ledger
            }
        };

        let startup =
            reconcile_on_startup(&store, collaborators.venue.as_ref(), &mut ledger).await?;

        let dispatcher = Arc::new(ErrorDispatcher::new(
            store.clone(),
            diagnoser,
            events.clone(),
            &config.dispatcher,
        )?);

        let mut gate = RestockGate::from_config(&config.flow);
        if let Some((token, issued_at)) = store.load_restock::<(RestockToken, DateTime<Utc>)>()? {
            gate = gate.with_last_issued(token, issued_at);
        }

        let runner = PhaseRunner::new(
            store.clone(),
            collaborators,
            dispatcher.clone(),
            events.clone(),
            config.clone(),
        );

        Ok(Self {
            store,
            runner,
            dispatcher,
            events,
            config,
            ledger: Mutex::new(ledger),
            autopilot: AtomicBool::new(false),
            cancel: StdMutex::new(CancellationToken::new()),
            restock: StdMutex::new(gate),
            startup,
        })
    }

    /// Override the runner's retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.runner = self.runner.with_retry(retry);
        self
    }

    pub fn startup_reconciliation(&self) -> &ReconciliationResult {
        &self.startup
    }

    pub fn dispatcher(&self) -> &Arc<ErrorDispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn is_autopilot(&self) -> bool {
        self.autopilot.load(Ordering::SeqCst)
    }

    fn cancel_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Request cooperative cancellation of the running cycle and the autopilot loop
    ///
    /// Takes effect at the next phase boundary or between execution orders.
    pub fn cancel(&self) {
        let mut token = match self.cancel.lock() {
            Ok(token) => token,
            Err(poisoned) => poisoned.into_inner(),
        };
        token.cancel();
        *token = CancellationToken::new();
        info!("Cancellation requested");
    }

    /// Run one cycle unless one is running or the breaker is open
    pub async fn start_cycle(&self) -> Result<CycleStart> {
        if self.dispatcher.is_open().await {
            warn!("Cycle start rejected: circuit breaker open");
            return Ok(CycleStart::BreakerOpen);
        }

        let Ok(mut ledger) = self.ledger.try_lock() else {
            info!("Cycle start ignored: a cycle is already running");
            return Ok(CycleStart::AlreadyRunning);
        };

        // Re-check under the lock; the previous cycle may have tripped it
        if self.dispatcher.is_open().await {
            return Ok(CycleStart::BreakerOpen);
        }

        let cycle_id = self.store.next_cycle_id()?;
        let cancel = self.cancel_token();
        let report = self.runner.run_cycle(cycle_id, &mut ledger, &cancel).await;

        if report.outcome() == CycleOutcome::Success {
            self.dispatcher.note_success().await;
        }
        if report.breaker_tripped() {
            self.kill_switch(&ledger, cycle_id).await;
        }

        Ok(CycleStart::Completed(Box::new(report)))
    }

    /// Halt protocol after the breaker trips
    async fn kill_switch(&self, ledger: &CapitalLedger, cycle_id: u64) {
        error!("🛑 KILL SWITCH engaged after cycle {}", cycle_id);
        self.autopilot.store(false, Ordering::SeqCst);

        match self.runner.skip_pending_orders("kill switch") {
            Ok(skipped) => info!("Kill switch skipped {} pending orders", skipped),
            Err(e) => error!("Kill switch could not skip pending orders: {}", e),
        }

        let venue = self.runner.venue();
        match venue.flatten_all().await {
            Ok(closed) => info!("Kill switch flattened {} positions on {}", closed, venue.name()),
            Err(e) => error!("Kill switch flatten failed on {}: {}", venue.name(), e),
        }

        self.events.emit(PipelineEvent::vault(
            VaultAction::KillSwitch,
            Some(cycle_id),
            rust_decimal::Decimal::ZERO,
            ledger.running_balance,
            "circuit breaker tripped",
        ));
    }

    /// One autopilot step: run a cycle, then decide whether to restock early
    pub async fn tick(&self) -> Result<Tick> {
        let start = self.start_cycle().await?;

        let depth = self.store.size(QueueName::Opportunity)?;
        let now = Utc::now();
        let restock = {
            let mut gate = self
                .restock
                .lock()
                .map_err(|e| PipelineError::Invariant(format!("restock gate poisoned: {}", e)))?;
            gate.request(depth, now)
        };

        if let Some(token) = restock {
            self.store.save_restock(&(token, now))?;
            info!(
                "Restock granted ({}): opportunity queue at {}",
                token.key(),
                depth
            );
        }

        Ok(Tick { start, restock })
    }

    /// Run cycles until cancelled or the breaker opens
    pub async fn run_autopilot(&self) -> Result<()> {
        let cancel = self.cancel_token();
        let cooldown = self.config.pipeline.cycle_cooldown();
        self.autopilot.store(true, Ordering::SeqCst);
        info!("Autopilot engaged (cooldown {:?})", cooldown);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let wait = match self.tick().await {
                Ok(Tick {
                    start: CycleStart::BreakerOpen,
                    ..
                }) => {
                    warn!("Autopilot halting: circuit breaker open");
                    break;
                }
                Ok(Tick {
                    start: CycleStart::Completed(report),
                    ..
                }) if report.breaker_tripped() => {
                    warn!("Autopilot halting: breaker tripped in cycle {}", report.record.cycle_id);
                    break;
                }
                Ok(Tick {
                    restock: Some(_), ..
                }) => Duration::ZERO,
                Ok(_) => cooldown,
                Err(e) => {
                    error!("Autopilot step failed: {}", e);
                    cooldown
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.autopilot.store(false, Ordering::SeqCst);
        info!("Autopilot disengaged");
        Ok(())
    }

    /// Operator action clearing an open breaker
    pub async fn reset_breaker(&self, operator: &str) -> Result<()> {
        if operator.trim().is_empty() {
            return Err(PipelineError::rejected(
                "reset_breaker",
                "operator name is required",
            ));
        }
        self.dispatcher.reset(operator).await
    }

    pub async fn ledger_snapshot(&self) -> LedgerSnapshot {
        self.ledger.lock().await.snapshot()
    }

    pub async fn status(&self) -> Result<CoordinatorStatus> {
        let (ledger, cycle_running) = match self.ledger.try_lock() {
            Ok(ledger) => (Some(ledger.snapshot()), false),
            Err(_) => (None, true),
        };

        Ok(CoordinatorStatus {
            autopilot: self.is_autopilot(),
            cycle_running,
            ledger,
            breaker: self.dispatcher.breaker_state().await,
            opportunity_queue: self.store.depth(QueueName::Opportunity)?,
            execution_queue: self.store.depth(QueueName::Execution)?,
            unsettled_fills: self.runner.unsettled_fills(),
            cycles_archived: self.store.archive_count()?,
            errors_logged: self.store.error_count()?,
            recent_cycles: self
                .store
                .recent_cycles(5)?
                .into_iter()
                .map(CycleStatusLine::from)
                .collect(),
        })
    }
}
