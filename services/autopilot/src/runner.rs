//! Phase runner - drives one cycle through the phase sequence
//!
//! AUDIT -> DISCOVER -> ANALYZE -> EXECUTE -> ARCHIVE -> DONE, with any
//! unhandled failure diverting to INTERVENE. DISCOVER and ANALYZE fan out
//! over bounded worker pools; EXECUTE is a plain sequential loop over the
//! execution queue that owns the only mutable borrow of the ledger.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::amount::position_size;
use crate::collaborators::{Analysis, Analyzer, AuditProbe, DiscoverySource, FillStatus, Venue};
use crate::config::AutopilotConfig;
use crate::dispatcher::{ErrorDispatcher, Resolution};
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, LogLevel, PipelineEvent, VaultAction};
use crate::flow::should_pause;
use crate::ledger::CapitalLedger;
use crate::phases::{transition, PhaseEvent, PhaseId};
use crate::retry::RetryPolicy;
use crate::risk::RiskGuard;
use crate::store::Store;
use crate::types::{
    rank_cmp, rank_opportunities, CycleOutcome, CycleRecord, CycleSummary, ExecutionOrder,
    Opportunity, OrderStatus, QueueItem, QueueName,
};

const DRAIN_BATCH: usize = 64;

/// What EXECUTE does after one item
enum Step {
    Continue,
    /// Risk guard aborted the rest of the queue
    Abort,
}

/// External collaborators used by the phases
#[derive(Clone)]
pub struct Collaborators {
    pub sources: Vec<Arc<dyn DiscoverySource>>,
    pub analyzer: Arc<dyn Analyzer>,
    pub venue: Arc<dyn Venue>,
    pub audit: Arc<dyn AuditProbe>,
}

/// Result of one cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub record: CycleRecord,
    pub summary: CycleSummary,
    /// Set when the cycle went through INTERVENE
    pub resolution: Option<Resolution>,
    /// Phase that failed, if any
    pub failed_phase: Option<PhaseId>,
}

impl CycleReport {
    pub fn outcome(&self) -> CycleOutcome {
        self.record.outcome
    }

    pub fn breaker_tripped(&self) -> bool {
        self.resolution
            .as_ref()
            .map(|r| r.breaker_tripped)
            .unwrap_or(false)
    }
}

pub struct PhaseRunner {
    store: Arc<Store>,
    collaborators: Collaborators,
    dispatcher: Arc<ErrorDispatcher>,
    events: EventBus,
    config: AutopilotConfig,
    risk: RiskGuard,
    retry: RetryPolicy,
    held_fills: Mutex<Vec<ExecutionOrder>>,
}

impl PhaseRunner {
    pub fn new(
        store: Arc<Store>,
        collaborators: Collaborators,
        dispatcher: Arc<ErrorDispatcher>,
        events: EventBus,
        config: AutopilotConfig,
    ) -> Self {
        let risk = RiskGuard::from_config(&config.risk);
        let retry = RetryPolicy::from_config(&config.retry);
        Self {
            store,
            collaborators,
            dispatcher,
            events,
            config,
            risk,
            retry,
            held_fills: Mutex::new(Vec::new()),
        }
    }

    /// Replace the retry policy (tests use immediate retries)
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn venue(&self) -> &Arc<dyn Venue> {
        &self.collaborators.venue
    }

    /// Run one full cycle
    ///
    /// Never returns an error: every failure is resolved through the
    /// dispatcher and reflected in the report's outcome.
    pub async fn run_cycle(
        &self,
        cycle_id: u64,
        ledger: &mut CapitalLedger,
        cancel: &CancellationToken,
    ) -> CycleReport {
        let mut record = CycleRecord::start(cycle_id);
        let mut summary = CycleSummary::new(cycle_id, ledger.running_balance);
        info!(cycle_id, "▶ Cycle {} starting (balance {})", cycle_id, ledger.running_balance);

        if let Err(e) = self.store.record_cycle(&record) {
            return self
                .intervene(record, summary, PhaseId::Audit, e.into())
                .await;
        }

        let mut phase = PhaseId::Audit;
        while !phase.is_terminal() {
            if cancel.is_cancelled() {
                return self.cancelled(record, summary, ledger);
            }

            let step = match phase {
                PhaseId::Audit => self.audit().await,
                PhaseId::Discover => self.discover(cycle_id, &mut summary).await,
                PhaseId::Analyze => {
                    self.analyze(cycle_id, ledger.running_balance, &mut summary)
                        .await
                }
                PhaseId::Execute => self.execute(cycle_id, ledger, cancel, &mut summary).await,
                PhaseId::Archive => self.archive(ledger, &mut summary),
                PhaseId::Done | PhaseId::Intervene => Err(PipelineError::InvalidTransition(
                    format!("{} is not a runnable phase", phase),
                )),
            };

            if let Err(e) = step {
                return self.intervene(record, summary, phase, e).await;
            }

            let next = match transition(phase, PhaseEvent::Completed) {
                Ok(next) => next,
                Err(e) => return self.intervene(record, summary, phase, e).await,
            };
            debug!(cycle_id, "Phase {} -> {}", phase, next);
            phase = next;
            record.phase = phase;

            if let Err(e) = self.store.record_cycle(&record) {
                return self.intervene(record, summary, phase, e.into()).await;
            }
        }

        record.close(summary.outcome);
        if let Err(e) = self.store.record_cycle(&record) {
            warn!("Failed to close cycle {}: {}", cycle_id, e);
        }

        info!(
            cycle_id,
            "■ Cycle {} {} | filled {} failed {} skipped {} | balance {} -> {}",
            cycle_id,
            record.outcome.as_str(),
            summary.orders_filled,
            summary.orders_failed,
            summary.orders_skipped,
            summary.balance_before,
            summary.balance_after
        );
        self.events.emit(PipelineEvent::log(
            LogLevel::Info,
            Some(cycle_id),
            Some(PhaseId::Done),
            format!("cycle {} {}", cycle_id, record.outcome.as_str()),
        ));

        CycleReport {
            record,
            summary,
            resolution: None,
            failed_phase: None,
        }
    }

    async fn intervene(
        &self,
        mut record: CycleRecord,
        mut summary: CycleSummary,
        failed: PhaseId,
        err: PipelineError,
    ) -> CycleReport {
        let cycle_id = record.cycle_id;
        let mut phase = transition(
            failed,
            PhaseEvent::Failed {
                message: err.to_string(),
            },
        )
        .unwrap_or(PhaseId::Intervene);
        record.phase = phase;

        let resolution = self.dispatcher.dispatch(cycle_id, failed, &err).await;

        phase = transition(phase, PhaseEvent::Resolved).unwrap_or(PhaseId::Done);
        record.phase = phase;
        summary.outcome = resolution.cycle_outcome;
        summary.aborted_reason = Some(err.to_string());
        record.close(resolution.cycle_outcome);

        if let Err(e) = self.store.record_cycle(&record) {
            warn!("Failed to close cycle {} after intervention: {}", cycle_id, e);
        }

        self.events.emit(PipelineEvent::log(
            LogLevel::Error,
            Some(cycle_id),
            Some(failed),
            format!("cycle {} {} in {}: {}", cycle_id, resolution.cycle_outcome.as_str(), failed, err),
        ));

        CycleReport {
            record,
            summary,
            resolution: Some(resolution),
            failed_phase: Some(failed),
        }
    }

    fn cancelled(
        &self,
        mut record: CycleRecord,
        mut summary: CycleSummary,
        ledger: &CapitalLedger,
    ) -> CycleReport {
        let cycle_id = record.cycle_id;
        info!(cycle_id, "Cycle {} cancelled at {}", cycle_id, record.phase);

        summary.outcome = CycleOutcome::Aborted;
        summary.aborted_reason.get_or_insert_with(|| "cancelled".to_string());
        summary.balance_after = ledger.running_balance;
        if let Err(e) = self.store.archive_summary(&summary) {
            warn!("Failed to archive cancelled cycle {}: {}", cycle_id, e);
        }

        record.close(CycleOutcome::Aborted);
        if let Err(e) = self.store.record_cycle(&record) {
            warn!("Failed to close cancelled cycle {}: {}", cycle_id, e);
        }

        CycleReport {
            record,
            summary,
            resolution: None,
            failed_phase: None,
        }
    }

    // ---- AUDIT ----

    async fn audit(&self) -> Result<()> {
        let audit = &self.collaborators.audit;
        self.retry.run("audit", || audit.check()).await?;
        debug!("Audit passed");
        Ok(())
    }

    // ---- DISCOVER ----

    async fn discover(&self, cycle_id: u64, summary: &mut CycleSummary) -> Result<()> {
        let max_queue = self.config.flow.max_queue;
        let depth = self.store.size(QueueName::Opportunity)?;
        if should_pause(depth, max_queue) {
            info!(
                cycle_id,
                "Backpressure: opportunity queue at {}/{}, skipping discovery", depth, max_queue
            );
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.pipeline.discovery_workers));
        let mut tasks = JoinSet::new();

        for source in &self.collaborators.sources {
            let source = source.clone();
            let semaphore = semaphore.clone();
            let retry = self.retry;
            tasks.spawn(async move {
                let name = source.name().to_string();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (name, Err(PipelineError::Invariant(e.to_string()))),
                };
                let found = retry.run(&name, || source.discover()).await;
                (name, found)
            });
        }

        let mut first_failure: Option<PipelineError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(found))) => {
                    // Each source's results are durable as soon as it finishes
                    let queued = self.enqueue_discovered(found)?;
                    debug!(cycle_id, "Source {} queued {} opportunities", name, queued);
                    summary.opportunities_discovered += queued;
                }
                Ok((name, Err(e))) => {
                    warn!(cycle_id, "Discovery source {} failed: {}", name, e);
                    first_failure.get_or_insert(e);
                }
                Err(join_err) => {
                    warn!(cycle_id, "Discovery task aborted: {}", join_err);
                    first_failure.get_or_insert(PipelineError::Invariant(format!(
                        "discovery task aborted: {}",
                        join_err
                    )));
                }
            }
        }

        info!(
            cycle_id,
            "Discovered {} new opportunities", summary.opportunities_discovered
        );

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn enqueue_discovered(&self, mut found: Vec<Opportunity>) -> Result<usize> {
        rank_opportunities(&mut found);

        let mut seen = HashSet::new();
        let mut queued = 0;
        for opportunity in found {
            if !seen.insert(opportunity.ticker.clone()) {
                continue;
            }
            if should_pause(
                self.store.size(QueueName::Opportunity)?,
                self.config.flow.max_queue,
            ) {
                debug!("Opportunity queue full, dropping remaining discoveries");
                break;
            }
            let key = opportunity.ticker.clone();
            if self
                .store
                .enqueue_unique(QueueName::Opportunity, &key, &opportunity)?
                .is_some()
            {
                queued += 1;
            }
        }
        Ok(queued)
    }

    // ---- ANALYZE ----

    async fn analyze(
        &self,
        cycle_id: u64,
        balance: rust_decimal::Decimal,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let claimed: Vec<QueueItem<Opportunity>> = self.store.claim_top(
            QueueName::Opportunity,
            self.config.pipeline.batch_size,
            rank_cmp,
        )?;
        if claimed.is_empty() {
            debug!(cycle_id, "No opportunities to analyze");
            return Ok(());
        }

        let analyzed = self.analyze_claimed(cycle_id, balance, &claimed, summary).await;
        if analyzed.is_err() {
            // Acked items are gone; requeue is a no-op for them
            self.release(QueueName::Opportunity, claimed.iter().map(|item| item.id));
        }
        analyzed
    }

    async fn analyze_claimed(
        &self,
        cycle_id: u64,
        balance: rust_decimal::Decimal,
        claimed: &[QueueItem<Opportunity>],
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let pipeline = &self.config.pipeline;
        let semaphore = Arc::new(Semaphore::new(pipeline.analysis_workers));
        let mut tasks = JoinSet::new();
        for (index, item) in claimed.iter().enumerate() {
            let analyzer = self.collaborators.analyzer.clone();
            let semaphore = semaphore.clone();
            let retry = self.retry;
            let opportunity = item.payload.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (index, Err(PipelineError::Invariant(e.to_string()))),
                };
                let analysis = retry
                    .run("analyze", || analyzer.analyze(&opportunity))
                    .await;
                (index, analysis)
            });
        }

        let mut results: Vec<Option<Result<Analysis>>> = claimed.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, analysis)) => results[index] = Some(analysis),
                Err(join_err) => warn!(cycle_id, "Analysis task aborted: {}", join_err),
            }
        }

        let provisional = position_size(balance, self.config.risk.position_size_pct)
            .map_err(|e| PipelineError::Invariant(e.to_string()))?;

        // Promotion follows rank order
        for (item, result) in claimed.iter().zip(results) {
            let opportunity = &item.payload;
            match result {
                Some(Ok(analysis)) => {
                    if !analysis.veto && analysis.confidence >= pipeline.confidence_threshold {
                        let order = ExecutionOrder::promote(
                            opportunity,
                            analysis.side,
                            provisional,
                            analysis.confidence,
                            analysis.variance,
                        );
                        if self.store.promote_order(&order)? {
                            summary.orders_promoted += 1;
                            debug!(
                                cycle_id,
                                "Promoted {} (confidence {:.2}, variance {:.2})",
                                opportunity.ticker,
                                analysis.confidence,
                                analysis.variance
                            );
                        }
                    } else {
                        debug!(
                            cycle_id,
                            "Not promoting {} (confidence {:.2}, veto {})",
                            opportunity.ticker,
                            analysis.confidence,
                            analysis.veto
                        );
                    }
                }
                Some(Err(e)) => {
                    self.dispatcher
                        .record_item_error(cycle_id, PhaseId::Analyze, &e)?;
                }
                None => {
                    let e = PipelineError::Invariant(format!(
                        "analysis of {} did not complete",
                        opportunity.ticker
                    ));
                    self.dispatcher
                        .record_item_error(cycle_id, PhaseId::Analyze, &e)?;
                }
            }
            self.store.ack(QueueName::Opportunity, item.id)?;
        }

        info!(
            cycle_id,
            "Analyzed {} opportunities, promoted {}",
            claimed.len(),
            summary.orders_promoted
        );
        Ok(())
    }

    // ---- EXECUTE ----

    async fn execute(
        &self,
        cycle_id: u64,
        ledger: &mut CapitalLedger,
        cancel: &CancellationToken,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        // A fill the journal missed must be recorded before anything else spends
        self.settle_held_fills(cycle_id, ledger)?;

        loop {
            if cancel.is_cancelled() {
                info!(cycle_id, "Cancellation requested, stopping execution between orders");
                summary.outcome = CycleOutcome::Aborted;
                summary.aborted_reason = Some("cancelled".to_string());
                return Ok(());
            }

            let mut batch: Vec<QueueItem<ExecutionOrder>> =
                self.store.peek_batch(QueueName::Execution, 1)?;
            let Some(item) = batch.pop() else {
                break;
            };

            match self.execute_item(cycle_id, ledger, &item, summary).await {
                Ok(Step::Continue) => {}
                Ok(Step::Abort) => return Ok(()),
                Err(e) => {
                    self.release(QueueName::Execution, std::iter::once(item.id));
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Handle one claimed execution item; acks it unless an error is returned
    async fn execute_item(
        &self,
        cycle_id: u64,
        ledger: &mut CapitalLedger,
        item: &QueueItem<ExecutionOrder>,
        summary: &mut CycleSummary,
    ) -> Result<Step> {
        let mut order = self.store.get_order(item.payload.id)?.ok_or_else(|| {
            PipelineError::Invariant(format!("order {} missing from journal", item.payload.id))
        })?;

        if order.status.is_terminal() {
            debug!("Order {} already {}, acking redelivery", order.id, order.status.as_str());
            self.store.ack(QueueName::Execution, item.id)?;
            return Ok(Step::Continue);
        }
        if order.status != OrderStatus::Pending {
            return Err(PipelineError::Invariant(format!(
                "order {} is {} at execution time",
                order.id,
                order.status.as_str()
            )));
        }

        // Size against the balance as it stands after the previous fill
        order.size = position_size(ledger.running_balance, self.config.risk.position_size_pct)
            .map_err(|e| PipelineError::Invariant(e.to_string()))?;

        let verdict = self.risk.check(ledger, &order);
        if !verdict.allow {
            warn!(
                cycle_id,
                "Risk guard denied {} {}: {}", order.ticker, order.size, verdict.reason
            );
            self.events.emit(PipelineEvent::vault(
                VaultAction::RiskDenied,
                Some(cycle_id),
                order.size,
                ledger.running_balance,
                verdict.reason.clone(),
            ));

            set_status(&mut order, OrderStatus::Skipped, Some(&verdict.reason))?;
            self.store.update_order(&order)?;
            self.store.ack(QueueName::Execution, item.id)?;
            summary.orders_skipped += 1;

            let veto = PipelineError::RiskVeto(verdict.reason.clone());
            summary.orders_skipped += self.skip_pending_orders(&veto.to_string())?;
            self.dispatcher
                .record(cycle_id, PhaseId::Execute, veto.class(), veto.to_string())?;

            summary.outcome = CycleOutcome::Aborted;
            summary.aborted_reason = Some(veto.to_string());
            return Ok(Step::Abort);
        }

        self.execute_order(cycle_id, ledger, &mut order, summary).await?;
        self.store.ack(QueueName::Execution, item.id)?;
        Ok(Step::Continue)
    }

    /// Place one order; venue failures are isolated to this order
    async fn execute_order(
        &self,
        cycle_id: u64,
        ledger: &mut CapitalLedger,
        order: &mut ExecutionOrder,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        set_status(order, OrderStatus::Executing, None)?;
        self.store.update_order(order)?;

        let venue = &self.collaborators.venue;
        let client_id = order.id.to_string();
        let (ticker, side, size) = (order.ticker.clone(), order.side, order.size);
        let placed = self
            .retry
            .run("place_order", || venue.place_order(&client_id, &ticker, side, size))
            .await;

        let failure = match placed {
            Ok(fill) if fill.status == FillStatus::Filled => {
                let mut debited = ledger.clone();
                debited.debit(
                    order.cost(),
                    &format!("{} {} {}", order.side.as_str(), order.size, order.ticker),
                )?;
                set_status(order, OrderStatus::Filled, None)?;
                order.fill_price = fill.fill_price;
                order.venue_order_id = Some(fill.order_id);

                let filled: &ExecutionOrder = order;
                let committed = self
                    .retry
                    .run("commit_fill", || {
                        std::future::ready(
                            self.store
                                .commit_fill(filled, &debited)
                                .map_err(PipelineError::from),
                        )
                    })
                    .await;

                // The venue spent the money whether or not the journal caught up
                *ledger = debited;
                if let Err(e) = committed {
                    error!(
                        cycle_id,
                        "Fill of order {} confirmed by {} but not persisted: {}",
                        order.id,
                        venue.name(),
                        e
                    );
                    self.held_fills()?.push(order.clone());
                    return Err(PipelineError::Unsettled {
                        order_id: order.id,
                        message: e.to_string(),
                    });
                }

                summary.orders_filled += 1;
                info!(
                    cycle_id,
                    "✓ Filled {} {} {} on {} (balance {})",
                    order.side.as_str(),
                    order.size,
                    order.ticker,
                    venue.name(),
                    ledger.running_balance
                );
                self.events.emit(PipelineEvent::Simulation {
                    cycle_id,
                    order_id: order.id,
                    ticker: order.ticker.clone(),
                    size: order.size,
                    fill_price: order.fill_price,
                    venue: venue.name().to_string(),
                    at: Utc::now(),
                });
                self.emit_debit(cycle_id, order, ledger);
                return Ok(());
            }
            Ok(fill) => {
                order.venue_order_id = Some(fill.order_id);
                PipelineError::rejected("place_order", format!("venue rejected {}", order.ticker))
            }
            Err(e) => e,
        };

        set_status(order, OrderStatus::Failed, Some(&failure.to_string()))?;
        self.store.update_order(order)?;
        self.dispatcher
            .record_item_error(cycle_id, PhaseId::Execute, &failure)?;
        summary.orders_failed += 1;
        Ok(())
    }

    fn emit_debit(&self, cycle_id: u64, order: &ExecutionOrder, ledger: &CapitalLedger) {
        self.events.emit(PipelineEvent::vault(
            VaultAction::Debit,
            Some(cycle_id),
            order.cost(),
            ledger.running_balance,
            format!("order {} filled", order.id),
        ));
    }

    fn held_fills(&self) -> Result<MutexGuard<'_, Vec<ExecutionOrder>>> {
        self.held_fills
            .lock()
            .map_err(|e| PipelineError::Invariant(format!("held fills poisoned: {}", e)))
    }

    /// Orders the venue filled but the journal has not recorded yet
    pub fn unsettled_fills(&self) -> usize {
        self.held_fills().map(|held| held.len()).unwrap_or(0)
    }

    /// Persist fills whose commit failed earlier in this process
    ///
    /// The in-memory ledger already carries their debits, so each is
    /// committed against the current ledger without debiting again.
    fn settle_held_fills(&self, cycle_id: u64, ledger: &CapitalLedger) -> Result<usize> {
        let mut held = self.held_fills()?;
        let mut settled = 0;
        while let Some(order) = held.first() {
            self.store.commit_fill(order, ledger)?;
            info!(
                cycle_id,
                "Settled held fill of order {} ({} {})", order.id, order.size, order.ticker
            );
            self.emit_debit(cycle_id, order, ledger);
            held.remove(0);
            settled += 1;
        }
        Ok(settled)
    }

    /// Hand claimed items back after a failed phase, best effort
    fn release(&self, queue: QueueName, ids: impl IntoIterator<Item = Uuid>) {
        for id in ids {
            if let Err(e) = self.store.requeue(queue, id) {
                warn!("Could not requeue {} on {}: {}", id, queue, e);
            }
        }
    }

    /// Mark every queued pending order skipped and ack it
    pub fn skip_pending_orders(&self, reason: &str) -> Result<usize> {
        let mut skipped = 0;
        loop {
            let batch: Vec<QueueItem<ExecutionOrder>> =
                self.store.peek_batch(QueueName::Execution, DRAIN_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for item in batch {
                if let Some(mut order) = self.store.get_order(item.payload.id)? {
                    if order.status == OrderStatus::Pending {
                        set_status(&mut order, OrderStatus::Skipped, Some(reason))?;
                        self.store.update_order(&order)?;
                        skipped += 1;
                    }
                }
                self.store.ack(QueueName::Execution, item.id)?;
            }
        }
        if skipped > 0 {
            info!("Skipped {} pending orders: {}", skipped, reason);
        }
        Ok(skipped)
    }

    // ---- ARCHIVE ----

    fn archive(&self, ledger: &CapitalLedger, summary: &mut CycleSummary) -> Result<()> {
        if summary.outcome == CycleOutcome::Running {
            summary.outcome = CycleOutcome::Success;
        }
        summary.balance_after = ledger.running_balance;
        self.store.archive_summary(summary)?;
        Ok(())
    }
}

fn set_status(order: &mut ExecutionOrder, next: OrderStatus, reason: Option<&str>) -> Result<()> {
    if !order.status.can_transition_to(next) {
        return Err(PipelineError::Invariant(format!(
            "order {} cannot move from {} to {}",
            order.id,
            order.status.as_str(),
            next.as_str()
        )));
    }
    order.status = next;
    if let Some(reason) = reason {
        order.status_reason = Some(reason.to_string());
    }
    Ok(())
}
