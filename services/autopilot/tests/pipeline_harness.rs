//! End-to-end pipeline harness
//!
//! Drives the coordinator through full cycles against in-process
//! collaborators and checks the capital, queue and breaker outcomes.


use autopilot::dispatcher::BreakerState;
use autopilot::store::QueueDepth;
use autopilot::{
    Analysis, AutopilotConfig, Collaborators, CycleCoordinator, CycleOutcome, CycleReport,
    CycleStart, ErrorClass, EventBus, ExecutionOrder, NoDiagnosis, Opportunity, OrderSide,
    OrderStatus, PhaseId, PipelineError, PipelineEvent, QueueName, Store, VaultAction,
};
use mock_collaborators::{
    three_tickers, HarnessBuilder, MockAudit, MockDiagnoser, MockVenue, Scripted,
    ScriptedAnalyzer, StaticSource,
};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn completed(start: CycleStart) -> CycleReport {
    match start {
        CycleStart::Completed(report) => *report,
        other => panic!("expected a completed cycle, got {:?}", other),
    }
}

/// Test: three fills from 300 leave 257.2125, sized off the running balance
#[tokio::test]
async fn test_end_to_end_cycle_compounds_sizing() {
    let h = HarnessBuilder::new().source(three_tickers()).build().await;
    let mut rx = h.events.subscribe();

    let report = completed(h.coordinator.start_cycle().await.unwrap());

    assert_eq!(report.outcome(), CycleOutcome::Success);
    assert_eq!(report.record.phase, PhaseId::Done);
    assert_eq!(report.summary.opportunities_discovered, 3);
    assert_eq!(report.summary.orders_promoted, 3);
    assert_eq!(report.summary.orders_filled, 3);
    assert_eq!(report.summary.orders_failed, 0);

    // Execution follows rank order and sizes against the post-fill balance
    let placed = h.venue.placed();
    let tickers: Vec<&str> = placed.iter().map(|p| p.ticker.as_str()).collect();
    assert_eq!(tickers, vec!["AAA", "BBB", "CCC"]);
    let sizes: Vec<Decimal> = placed.iter().map(|p| p.size).collect();
    assert_eq!(sizes, vec![Decimal::from(15), dec("14.25"), dec("13.5375")]);

    let snapshot = h.coordinator.ledger_snapshot().await;
    assert_eq!(snapshot.running_balance, dec("257.2125"));
    assert_eq!(snapshot.revision, 3);
    assert_eq!(
        h.store.load_ledger().unwrap().unwrap().running_balance,
        dec("257.2125")
    );

    let archived = h.store.get_summary(report.record.cycle_id).unwrap().unwrap();
    assert_eq!(archived.outcome, CycleOutcome::Success);
    assert_eq!(archived.balance_before, Decimal::from(300));
    assert_eq!(archived.balance_after, dec("257.2125"));

    assert_eq!(h.store.depth(QueueName::Opportunity).unwrap().total(), 0);
    assert_eq!(h.store.depth(QueueName::Execution).unwrap().total(), 0);
    assert_eq!(h.store.orders_with_status(OrderStatus::Filled).unwrap().len(), 3);

    let mut simulations = 0;
    let mut debits = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            PipelineEvent::Simulation { .. } => simulations += 1,
            PipelineEvent::Vault {
                action: VaultAction::Debit,
                ..
            } => debits += 1,
            _ => {}
        }
    }
    assert_eq!(simulations, 3);
    assert_eq!(debits, 3);
}

/// Test: a second start while a cycle runs is refused, not queued
#[tokio::test]
async fn test_concurrent_start_is_rejected() {
    let h = HarnessBuilder::new()
        .source(three_tickers())
        .audit(MockAudit::slow(Duration::from_millis(200)))
        .build()
        .await;

    let (first, second) = tokio::join!(h.coordinator.start_cycle(), h.coordinator.start_cycle());
    let starts = [first.unwrap(), second.unwrap()];

    let completed = starts
        .iter()
        .filter(|s| matches!(s, CycleStart::Completed(_)))
        .count();
    let refused = starts
        .iter()
        .filter(|s| matches!(s, CycleStart::AlreadyRunning))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(refused, 1);
    assert_eq!(h.audit.calls.load(Ordering::SeqCst), 1);

    // Only one cycle's worth of fills hit the ledger
    assert_eq!(h.venue.placed().len(), 3);
    assert_eq!(
        h.coordinator.ledger_snapshot().await.running_balance,
        dec("257.2125")
    );
}

/// Test: claimed-but-unacked queue items survive a restart
#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopilot.db");

    {
        let store = Store::open(&path).unwrap();
        store
            .enqueue(QueueName::Opportunity, &Opportunity::new("AAA", 0.9))
            .unwrap();
        store
            .enqueue(QueueName::Opportunity, &Opportunity::new("BBB", 0.8))
            .unwrap();

        // Claim one and "crash" before acking it
        let claimed: Vec<autopilot::types::QueueItem<Opportunity>> =
            store.peek_batch(QueueName::Opportunity, 1).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(store.depth(QueueName::Opportunity).unwrap().inflight, 1);
    }

    let store = Store::open(&path).unwrap();
    assert_eq!(store.recover_on_startup().unwrap(), 1);
    assert_eq!(store.depth(QueueName::Opportunity).unwrap().ready, 2);

    let items: Vec<autopilot::types::QueueItem<Opportunity>> =
        store.peek_batch(QueueName::Opportunity, 10).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].payload.ticker, "AAA");
    assert_eq!(items[0].attempts, 2);
    assert_eq!(items[1].attempts, 1);

    // Acking twice is harmless
    store.ack(QueueName::Opportunity, items[0].id).unwrap();
    store.ack(QueueName::Opportunity, items[0].id).unwrap();
    assert_eq!(store.size(QueueName::Opportunity).unwrap(), 1);
}

/// Test: an order interrupted mid-execution is settled on restart and never re-placed
#[tokio::test]
async fn test_restart_settles_interrupted_order_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopilot.db");

    let order = {
        let store = Store::open(&path).unwrap();
        let opp = Opportunity::new("AAA", 0.9);
        let mut order = ExecutionOrder::promote(&opp, OrderSide::Buy, Decimal::from(15), 0.9, 0.1);
        assert!(store.promote_order(&order).unwrap());
        let _: Vec<autopilot::types::QueueItem<ExecutionOrder>> =
            store.peek_batch(QueueName::Execution, 1).unwrap();
        order.status = OrderStatus::Executing;
        store.update_order(&order).unwrap();
        order
    };

    let store = Arc::new(Store::open(&path).unwrap());
    let h = HarnessBuilder::new()
        .store(store)
        .venue(MockVenue::new().with_known_fill(&order.id.to_string()))
        .build()
        .await;

    let startup = h.coordinator.startup_reconciliation();
    assert_eq!(startup.recovered_queue_items, 1);
    assert_eq!(startup.settled_filled, 1);
    assert_eq!(
        h.coordinator.ledger_snapshot().await.running_balance,
        Decimal::from(285)
    );

    // The redelivered execution item is acked against the journal
    let report = completed(h.coordinator.start_cycle().await.unwrap());
    assert_eq!(report.outcome(), CycleOutcome::Success);
    assert!(h.venue.placed().is_empty());
    assert_eq!(h.store.depth(QueueName::Execution).unwrap().total(), 0);
    assert_eq!(
        h.coordinator.ledger_snapshot().await.running_balance,
        Decimal::from(285)
    );
}

/// Test: one failing order does not stop the others
#[tokio::test]
async fn test_venue_failure_is_isolated_to_one_order() {
    let h = HarnessBuilder::new()
        .source(three_tickers())
        .venue(MockVenue::new().failing_on("BBB"))
        .build()
        .await;

    let report = completed(h.coordinator.start_cycle().await.unwrap());

    assert_eq!(report.outcome(), CycleOutcome::Success);
    assert_eq!(report.summary.orders_filled, 2);
    assert_eq!(report.summary.orders_failed, 1);
    assert_eq!(h.venue.placed().len(), 3);

    // CCC is sized off 285 because BBB never debited
    assert_eq!(
        h.coordinator.ledger_snapshot().await.running_balance,
        dec("270.75")
    );

    let errors = h.store.errors_for_cycle(report.record.cycle_id).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].severity, ErrorClass::ItemLevel);
    assert_eq!(errors[0].phase, PhaseId::Execute);

    let failed = h.store.orders_with_status(OrderStatus::Failed).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].ticker, "BBB");
    assert_eq!(
        h.coordinator.dispatcher().breaker_state().await.consecutive_escalations,
        0
    );
}

/// Test: an analysis failure drops only that opportunity
#[tokio::test]
async fn test_analysis_failure_is_isolated() {
    let h = HarnessBuilder::new()
        .source(three_tickers())
        .analyzer(ScriptedAnalyzer::default().with("BBB", Scripted::Reject))
        .build()
        .await;

    let report = completed(h.coordinator.start_cycle().await.unwrap());

    assert_eq!(report.outcome(), CycleOutcome::Success);
    assert_eq!(report.summary.orders_promoted, 2);
    assert_eq!(report.summary.orders_filled, 2);
    assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 3);

    let errors = h.store.errors_for_cycle(report.record.cycle_id).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].phase, PhaseId::Analyze);
    assert_eq!(errors[0].severity, ErrorClass::ItemLevel);
}

/// Test: a floor breach aborts the remaining queue without escalating
#[tokio::test]
async fn test_floor_breach_aborts_cycle() {
    let h = HarnessBuilder::new()
        .config(|c| c.risk.principal = Decimal::from(260))
        .source(three_tickers())
        .build()
        .await;
    let mut rx = h.events.subscribe();

    let report = completed(h.coordinator.start_cycle().await.unwrap());

    // 5% of 260 is 13, which would leave 247 < 250
    assert_eq!(report.outcome(), CycleOutcome::Aborted);
    assert!(h.venue.placed().is_empty());
    assert_eq!(report.summary.orders_skipped, 3);
    assert_eq!(h.store.orders_with_status(OrderStatus::Skipped).unwrap().len(), 3);
    assert_eq!(h.store.depth(QueueName::Execution).unwrap().total(), 0);
    assert_eq!(
        h.coordinator.ledger_snapshot().await.running_balance,
        Decimal::from(260)
    );

    let errors = h.store.errors_for_cycle(report.record.cycle_id).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].severity, ErrorClass::Systemic);

    let breaker = h.coordinator.dispatcher().breaker_state().await;
    assert!(!breaker.open);
    assert_eq!(breaker.consecutive_escalations, 0);

    let mut denied = 0;
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::Vault {
            action: VaultAction::RiskDenied,
            ..
        } = event
        {
            denied += 1;
        }
    }
    assert_eq!(denied, 1);

    // Future cycles are still allowed
    assert!(matches!(
        h.coordinator.start_cycle().await.unwrap(),
        CycleStart::Completed(_)
    ));
}

/// Test: high variance is denied whatever the confidence
#[tokio::test]
async fn test_variance_veto_ignores_confidence() {
    for confidence in [0.6, 0.95, 1.0] {
        let h = HarnessBuilder::new()
            .source(StaticSource::new("feed", &[("RISKY", 0.9)]))
            .analyzer(ScriptedAnalyzer::new(Analysis::new(confidence, 0.3)))
            .build()
            .await;

        let report = completed(h.coordinator.start_cycle().await.unwrap());
        assert_eq!(report.summary.orders_promoted, 1, "confidence {}", confidence);
        assert_eq!(report.outcome(), CycleOutcome::Aborted, "confidence {}", confidence);
        assert!(h.venue.placed().is_empty(), "confidence {}", confidence);
    }

    // At the threshold the order goes through
    let h = HarnessBuilder::new()
        .source(StaticSource::new("feed", &[("EDGE", 0.9)]))
        .analyzer(ScriptedAnalyzer::new(Analysis::new(0.6, 0.25)))
        .build()
        .await;
    let report = completed(h.coordinator.start_cycle().await.unwrap());
    assert_eq!(report.outcome(), CycleOutcome::Success);
    assert_eq!(h.venue.placed().len(), 1);
}

/// Test: three consecutive fatal failures trip the breaker; the fourth start is refused
#[tokio::test]
async fn test_breaker_trips_after_retry_budget() {
    let h = HarnessBuilder::new()
        .source(three_tickers())
        .audit(MockAudit::broken())
        .build()
        .await;

    for attempt in 1..=2 {
        let report = completed(h.coordinator.start_cycle().await.unwrap());
        assert_eq!(report.failed_phase, Some(PhaseId::Audit), "attempt {}", attempt);
        assert_eq!(report.outcome(), CycleOutcome::Aborted, "attempt {}", attempt);
        assert!(!report.breaker_tripped());
    }

    let third = completed(h.coordinator.start_cycle().await.unwrap());
    assert!(third.breaker_tripped());
    assert_eq!(third.outcome(), CycleOutcome::Failed);
    assert_eq!(h.venue.flatten_calls.load(Ordering::SeqCst), 1);
    assert!(!h.coordinator.is_autopilot());

    assert!(matches!(
        h.coordinator.start_cycle().await.unwrap(),
        CycleStart::BreakerOpen
    ));
    assert_eq!(h.audit.calls.load(Ordering::SeqCst), 3);

    let persisted: BreakerState = h.store.load_breaker().unwrap().unwrap();
    assert!(persisted.open);

    // Nothing was ever placed
    assert!(h.venue.placed().is_empty());

    tokio_test::assert_err!(h.coordinator.reset_breaker("  ").await);
    tokio_test::assert_ok!(h.coordinator.reset_breaker("ops").await);
    let state = h.coordinator.dispatcher().breaker_state().await;
    assert!(!state.open);
    assert_eq!(state.last_reset_by.as_deref(), Some("ops"));
    assert!(matches!(
        h.coordinator.start_cycle().await.unwrap(),
        CycleStart::Completed(_)
    ));
}

/// Test: diagnosed systemic failures never count toward the breaker
#[tokio::test]
async fn test_diagnosed_failures_do_not_trip() {
    let flaky = || PipelineError::transient("discover", "feed unreachable");

    let diagnosed = HarnessBuilder::new()
        .source(StaticSource::failing("feed", flaky))
        .diagnoser(Arc::new(MockDiagnoser))
        .build()
        .await;
    for _ in 0..5 {
        let report = completed(diagnosed.coordinator.start_cycle().await.unwrap());
        assert_eq!(report.failed_phase, Some(PhaseId::Discover));
        assert!(!report.breaker_tripped());
    }
    assert!(!diagnosed.coordinator.dispatcher().is_open().await);

    let undiagnosed = HarnessBuilder::new()
        .source(StaticSource::failing("feed", flaky))
        .build()
        .await;
    for _ in 0..3 {
        completed(undiagnosed.coordinator.start_cycle().await.unwrap());
    }
    assert!(undiagnosed.coordinator.dispatcher().is_open().await);
}

/// Test: cancellation stops the cycle at the next phase boundary
#[tokio::test]
async fn test_cancel_aborts_at_phase_boundary() {
    let h = HarnessBuilder::new()
        .source(three_tickers())
        .audit(MockAudit::slow(Duration::from_millis(200)))
        .build()
        .await;

    let (start, _) = tokio::join!(h.coordinator.start_cycle(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.coordinator.cancel();
    });

    let report = completed(start.unwrap());
    assert_eq!(report.outcome(), CycleOutcome::Aborted);
    assert!(h.venue.placed().is_empty());

    let archived = h.store.get_summary(report.record.cycle_id).unwrap().unwrap();
    assert_eq!(archived.outcome, CycleOutcome::Aborted);
    assert_eq!(archived.aborted_reason.as_deref(), Some("cancelled"));

    // A fresh token is in place for the next cycle
    let next = completed(h.coordinator.start_cycle().await.unwrap());
    assert_eq!(next.outcome(), CycleOutcome::Success);
}

/// Test: a drained queue earns one restock per cooldown window
#[tokio::test]
async fn test_tick_restocks_once_per_window() {
    let h = HarnessBuilder::new().build().await;

    let first = h.coordinator.tick().await.unwrap();
    assert!(matches!(first.start, CycleStart::Completed(_)));
    assert!(first.restock.is_some());

    let second = h.coordinator.tick().await.unwrap();
    assert!(second.restock.is_none());
}

/// Test: the autopilot loop halts on its own when the breaker trips
#[tokio::test]
async fn test_autopilot_halts_on_breaker() {
    let h = HarnessBuilder::new().audit(MockAudit::broken()).build().await;

    tokio::time::timeout(Duration::from_secs(5), h.coordinator.run_autopilot())
        .await
        .expect("autopilot should halt")
        .unwrap();

    assert_eq!(h.audit.calls.load(Ordering::SeqCst), 3);
    assert!(h.coordinator.dispatcher().is_open().await);
    assert!(!h.coordinator.is_autopilot());
}

/// Test: the autopilot loop stops promptly on cancel
#[tokio::test]
async fn test_autopilot_stops_on_cancel() {
    let h = HarnessBuilder::new()
        .config(|c| c.pipeline.cycle_cooldown_secs = 30)
        .build()
        .await;

    let (result, _) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(5), h.coordinator.run_autopilot()),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.coordinator.cancel();
        }
    );

    result.expect("autopilot should stop").unwrap();
    assert!(!h.coordinator.is_autopilot());
    assert!(h.audit.calls.load(Ordering::SeqCst) >= 1);
}

/// Test: status reports ledger, breaker and queues
#[tokio::test]
async fn test_status_snapshot() {
    let h = HarnessBuilder::new().source(three_tickers()).build().await;
    completed(h.coordinator.start_cycle().await.unwrap());

    let status = h.coordinator.status().await.unwrap();
    assert!(!status.cycle_running);
    assert_eq!(
        status.ledger.as_ref().unwrap().running_balance,
        dec("257.2125")
    );
    assert!(!status.breaker.open);
    assert_eq!(status.execution_queue.total(), 0);
    assert_eq!(status.recent_cycles.len(), 1);
    assert_eq!(status.recent_cycles[0].outcome, CycleOutcome::Success);
    assert_eq!(status.cycles_archived, 1);
    assert_eq!(status.errors_logged, 0);
    assert_eq!(status.unsettled_fills, 0);

    let yaml = serde_yaml::to_string(&status).unwrap();
    assert!(yaml.contains("recent_cycles"));
}

/// Test: ANALYZE takes the best-ranked opportunities from the whole queue
#[tokio::test]
async fn test_analyze_ranks_entire_queue() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    for i in 0..25 {
        let opportunity = Opportunity::new(format!("T{:02}", i), i as f64 / 100.0);
        store.enqueue(QueueName::Opportunity, &opportunity).unwrap();
    }

    let h = HarnessBuilder::new().store(store).build().await;
    let report = completed(h.coordinator.start_cycle().await.unwrap());

    // Top five analyzed; the fourth fill would breach the floor
    assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 5);
    assert_eq!(report.summary.orders_promoted, 5);
    let placed = h.venue.placed();
    let tickers: Vec<&str> = placed.iter().map(|p| p.ticker.as_str()).collect();
    assert_eq!(tickers, vec!["T24", "T23", "T22"]);
    assert_eq!(report.outcome(), CycleOutcome::Aborted);

    // The twenty lower-ranked items wait untouched
    assert_eq!(
        h.store.depth(QueueName::Opportunity).unwrap(),
        QueueDepth { ready: 20, inflight: 0 }
    );
}

/// Test: batch_size caps how many opportunities one cycle analyzes
#[tokio::test]
async fn test_batch_size_limits_analysis() {
    let h = HarnessBuilder::new()
        .config(|c| c.pipeline.batch_size = 2)
        .source(three_tickers())
        .build()
        .await;

    let report = completed(h.coordinator.start_cycle().await.unwrap());

    assert_eq!(report.outcome(), CycleOutcome::Success);
    assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 2);
    let placed = h.venue.placed();
    let tickers: Vec<&str> = placed.iter().map(|p| p.ticker.as_str()).collect();
    assert_eq!(tickers, vec!["AAA", "BBB"]);

    let left: Vec<autopilot::types::QueueItem<Opportunity>> =
        h.store.peek_batch(QueueName::Opportunity, 10).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].payload.ticker, "CCC");
}

/// Test: an analyzer veto keeps the opportunity out of execution without an error
#[tokio::test]
async fn test_analyzer_veto_blocks_promotion() {
    let h = HarnessBuilder::new()
        .source(three_tickers())
        .analyzer(
            ScriptedAnalyzer::default()
                .with("BBB", Scripted::Score(Analysis::new(0.99, 0.01).vetoed())),
        )
        .build()
        .await;

    let report = completed(h.coordinator.start_cycle().await.unwrap());

    assert_eq!(report.outcome(), CycleOutcome::Success);
    assert_eq!(report.summary.orders_promoted, 2);
    let placed = h.venue.placed();
    let tickers: Vec<&str> = placed.iter().map(|p| p.ticker.as_str()).collect();
    assert_eq!(tickers, vec!["AAA", "CCC"]);

    assert!(h.store.errors_for_cycle(report.record.cycle_id).unwrap().is_empty());
    assert_eq!(h.store.size(QueueName::Opportunity).unwrap(), 0);
}

/// Test: one failing source fails DISCOVER but keeps the other source's finds
#[tokio::test]
async fn test_discover_keeps_partial_results() {
    let h = HarnessBuilder::new()
        .source(StaticSource::new("good", &[("AAA", 0.9), ("BBB", 0.8)]))
        .source(StaticSource::failing("bad", || {
            PipelineError::rejected("discover", "feed returned 410")
        }))
        .build()
        .await;

    let report = completed(h.coordinator.start_cycle().await.unwrap());

    assert_eq!(report.failed_phase, Some(PhaseId::Discover));
    assert_eq!(report.outcome(), CycleOutcome::Aborted);
    assert_eq!(report.summary.opportunities_discovered, 2);
    assert!(h.venue.placed().is_empty());
    assert_eq!(
        h.store.depth(QueueName::Opportunity).unwrap(),
        QueueDepth { ready: 2, inflight: 0 }
    );
}

/// Test: a full opportunity queue skips discovery but still drains
#[tokio::test]
async fn test_backpressure_skips_discovery() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    for (ticker, score) in [("X1", 0.1), ("X2", 0.2), ("X3", 0.3)] {
        store
            .enqueue(QueueName::Opportunity, &Opportunity::new(ticker, score))
            .unwrap();
    }

    let h = HarnessBuilder::new()
        .config(|c| {
            c.flow.max_queue = 3;
            c.flow.min_queue = 1;
        })
        .store(store)
        .source(StaticSource::new("feed", &[("AAA", 0.9)]))
        .build()
        .await;

    let report = completed(h.coordinator.start_cycle().await.unwrap());

    assert_eq!(report.outcome(), CycleOutcome::Success);
    assert_eq!(report.summary.opportunities_discovered, 0);
    let placed = h.venue.placed();
    let tickers: Vec<&str> = placed.iter().map(|p| p.ticker.as_str()).collect();
    assert_eq!(tickers, vec!["X3", "X2", "X1"]);
}

/// Test: cancel during EXECUTE lets the in-flight order finish and stops before the next
#[tokio::test]
async fn test_cancel_between_execution_orders() {
    let h = HarnessBuilder::new()
        .source(three_tickers())
        .venue(MockVenue::new().slow(Duration::from_millis(200)))
        .build()
        .await;

    let (start, _) = tokio::join!(h.coordinator.start_cycle(), async {
        while h.venue.placed().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.coordinator.cancel();
    });

    let report = completed(start.unwrap());
    assert_eq!(report.outcome(), CycleOutcome::Aborted);
    assert_eq!(report.summary.aborted_reason.as_deref(), Some("cancelled"));
    assert_eq!(report.summary.orders_filled, 1);
    assert_eq!(h.venue.placed().len(), 1);
    assert_eq!(
        h.coordinator.ledger_snapshot().await.running_balance,
        Decimal::from(285)
    );

    // The untouched orders stay queued for a later cycle
    assert_eq!(h.store.orders_with_status(OrderStatus::Pending).unwrap().len(), 2);
    assert_eq!(
        h.store.depth(QueueName::Execution).unwrap(),
        QueueDepth { ready: 2, inflight: 0 }
    );
}

/// Test: a journal failure after claiming hands the opportunities back
#[tokio::test]
async fn test_failed_analysis_releases_claimed_items() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopilot.db");
    let store = Arc::new(Store::open(&path).unwrap());

    let side = rusqlite::Connection::open(&path).unwrap();
    side.execute_batch(
        "CREATE TRIGGER refuse_orders BEFORE INSERT ON orders
         BEGIN SELECT RAISE(ABORT, 'journal offline'); END;",
    )
    .unwrap();

    let h = HarnessBuilder::new()
        .store(store)
        .source(three_tickers())
        .build()
        .await;

    let report = completed(h.coordinator.start_cycle().await.unwrap());
    assert_eq!(report.failed_phase, Some(PhaseId::Analyze));
    assert!(h.venue.placed().is_empty());
    assert_eq!(
        h.store.depth(QueueName::Opportunity).unwrap(),
        QueueDepth { ready: 3, inflight: 0 }
    );

    // Once the journal accepts writes the same items go through
    side.execute_batch("DROP TRIGGER refuse_orders;").unwrap();
    h.coordinator.reset_breaker("ops").await.unwrap();
    let report = completed(h.coordinator.start_cycle().await.unwrap());
    assert_eq!(report.outcome(), CycleOutcome::Success);
    assert_eq!(h.venue.placed().len(), 3);
}

/// Test: a confirmed fill the journal could not record still moves the ledger
#[tokio::test]
async fn test_unpersisted_fill_is_settled_before_next_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopilot.db");
    let store = Arc::new(Store::open(&path).unwrap());

    let side = rusqlite::Connection::open(&path).unwrap();
    side.execute_batch(
        "CREATE TRIGGER refuse_fills BEFORE UPDATE OF status ON orders
         WHEN NEW.status = 'filled'
         BEGIN SELECT RAISE(ABORT, 'journal offline'); END;",
    )
    .unwrap();

    let h = HarnessBuilder::new()
        .store(store.clone())
        .source(StaticSource::new("feed", &[("AAA", 0.9)]))
        .build()
        .await;

    let report = completed(h.coordinator.start_cycle().await.unwrap());
    assert_eq!(report.failed_phase, Some(PhaseId::Execute));
    assert!(report.breaker_tripped());
    assert_eq!(h.venue.placed().len(), 1);

    // The venue spent 15 even though the journal still says executing
    assert_eq!(
        h.coordinator.ledger_snapshot().await.running_balance,
        Decimal::from(285)
    );
    assert_eq!(store.orders_with_status(OrderStatus::Executing).unwrap().len(), 1);
    assert_eq!(store.load_ledger().unwrap().unwrap().running_balance, Decimal::from(300));
    assert_eq!(h.coordinator.status().await.unwrap().unsettled_fills, 1);

    side.execute_batch("DROP TRIGGER refuse_fills;").unwrap();
    h.coordinator.reset_breaker("ops").await.unwrap();

    // AAA is rediscovered; the held fill is recorded first, then sized from 285
    let report = completed(h.coordinator.start_cycle().await.unwrap());
    assert_eq!(report.outcome(), CycleOutcome::Success);
    let sizes: Vec<Decimal> = h.venue.placed().iter().map(|p| p.size).collect();
    assert_eq!(sizes, vec![Decimal::from(15), dec("14.25")]);
    assert!(store.orders_with_status(OrderStatus::Executing).unwrap().is_empty());
    assert_eq!(store.orders_with_status(OrderStatus::Filled).unwrap().len(), 2);
    assert_eq!(store.load_ledger().unwrap().unwrap().running_balance, dec("270.75"));
    assert_eq!(h.coordinator.status().await.unwrap().unsettled_fills, 0);
    drop(h);
    drop(store);

    // A restart finds nothing to settle and keeps the balance
    let reopened = Arc::new(Store::open(&path).unwrap());
    let restarted = HarnessBuilder::new().store(reopened).build().await;
    assert_eq!(restarted.coordinator.startup_reconciliation().settled_filled, 0);
    assert_eq!(
        restarted.coordinator.ledger_snapshot().await.running_balance,
        dec("270.75")
    );
}

/// Test: bootstrap refuses a configuration that would stall the worker pools
#[tokio::test]
async fn test_bootstrap_rejects_zero_workers() {
    let mut config = AutopilotConfig::default();
    config.pipeline.analysis_workers = 0;

    let collaborators = Collaborators {
        sources: Vec::new(),
        analyzer: Arc::new(ScriptedAnalyzer::default()),
        venue: Arc::new(MockVenue::new()),
        audit: Arc::new(MockAudit::default()),
    };
    let result = CycleCoordinator::bootstrap(
        config,
        Arc::new(Store::open_in_memory().unwrap()),
        collaborators,
        Arc::new(NoDiagnosis),
        EventBus::default(),
    )
    .await;

    match result {
        Err(e) => assert!(e.to_string().contains("worker caps")),
        Ok(_) => panic!("zero analysis workers should be rejected"),
    }
}
