//! Durable queue and audit store
//!
//! One SQLite database holds both hand-off queues plus every piece of state
//! that must survive a restart: the cycle log, error log, order journal,
//! capital ledger, archive, breaker state and restock token.
//!
//! Queue rows are `ready` or `inflight`. A claim moves rows to `inflight`,
//! an ack deletes them, and `recover_on_startup` hands every in-flight row
//! back to `ready`. Delivery is therefore at-least-once.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::CapitalLedger;
use crate::types::{
    CycleOutcome, CycleRecord, CycleSummary, ErrorRecord, ExecutionOrder, OrderSide, OrderStatus,
    QueueItem, QueueName,
};

type StoreResult<T> = std::result::Result<T, StoreError>;

const LEDGER_KEY: &str = "ledger";
const BREAKER_KEY: &str = "breaker";
const RESTOCK_KEY: &str = "restock";

const ORDER_COLS: &str = "id, opportunity_id, ticker, side, size, confidence, variance, created_at, status, fill_price, venue_order_id, status_reason";

fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queue_items (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            queue TEXT NOT NULL,
            dedupe_key TEXT,
            payload TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'ready',
            attempts INTEGER NOT NULL DEFAULT 0,
            enqueued_at TEXT NOT NULL,
            UNIQUE (queue, dedupe_key)
        );

        CREATE TABLE IF NOT EXISTS cycles (
            cycle_id INTEGER PRIMARY KEY,
            phase TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            outcome TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS errors (
            id TEXT PRIMARY KEY,
            cycle_id INTEGER NOT NULL,
            phase TEXT NOT NULL,
            message TEXT NOT NULL,
            severity TEXT NOT NULL,
            diagnosis TEXT,
            patch_applied INTEGER,
            recoverable INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            opportunity_id TEXT NOT NULL UNIQUE,
            ticker TEXT NOT NULL,
            side TEXT NOT NULL,
            size TEXT NOT NULL,
            confidence REAL NOT NULL,
            variance REAL NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL,
            fill_price TEXT,
            venue_order_id TEXT,
            status_reason TEXT
        );

        CREATE TABLE IF NOT EXISTS archive (
            cycle_id INTEGER PRIMARY KEY,
            summary TEXT NOT NULL,
            archived_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_queue_ready ON queue_items(queue, state, seq);
        CREATE INDEX IF NOT EXISTS idx_errors_cycle ON errors(cycle_id);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        ",
    )
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_col<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_err(idx, e))
}

fn parse_opt_col<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse::<T>().map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn parse_time(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_time(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<ExecutionOrder> {
    let side: String = row.get(3)?;
    let side = match side.as_str() {
        "buy" => OrderSide::Buy,
        "sell" => OrderSide::Sell,
        other => {
            return Err(conversion_err(
                3,
                StoreError::Corrupt(format!("unknown order side '{}'", other)),
            ))
        }
    };

    Ok(ExecutionOrder {
        id: parse_col::<Uuid>(row, 0)?,
        opportunity_id: parse_col::<Uuid>(row, 1)?,
        ticker: row.get(2)?,
        side,
        size: parse_col::<Decimal>(row, 4)?,
        confidence: row.get(5)?,
        variance: row.get(6)?,
        created_at: parse_time(row, 7)?,
        status: parse_col::<OrderStatus>(row, 8)?,
        fill_price: parse_opt_col::<Decimal>(row, 9)?,
        venue_order_id: row.get(10)?,
        status_reason: row.get(11)?,
    })
}

fn row_to_cycle(row: &rusqlite::Row) -> rusqlite::Result<CycleRecord> {
    let cycle_id: i64 = row.get(0)?;
    Ok(CycleRecord {
        cycle_id: cycle_id as u64,
        phase: parse_col(row, 1)?,
        started_at: parse_time(row, 2)?,
        completed_at: parse_opt_time(row, 3)?,
        outcome: parse_col::<CycleOutcome>(row, 4)?,
    })
}

fn row_to_error(row: &rusqlite::Row) -> rusqlite::Result<ErrorRecord> {
    let cycle_id: i64 = row.get(1)?;
    let patch_applied: Option<i32> = row.get(6)?;
    let recoverable: i32 = row.get(7)?;
    Ok(ErrorRecord {
        id: parse_col::<Uuid>(row, 0)?,
        cycle_id: cycle_id as u64,
        phase: parse_col(row, 2)?,
        message: row.get(3)?,
        severity: parse_col(row, 4)?,
        diagnosis: row.get(5)?,
        patch_applied: patch_applied.map(|v| v != 0),
        recoverable: recoverable != 0,
        created_at: parse_time(row, 8)?,
    })
}

/// A ready queue row as read from disk
struct ReadyRow {
    seq: i64,
    id: String,
    payload: String,
    enqueued_at: String,
    attempts: u32,
}

fn select_ready(
    conn: &Connection,
    queue: QueueName,
    limit: Option<usize>,
) -> StoreResult<Vec<ReadyRow>> {
    let mut stmt = conn.prepare(
        "SELECT seq, id, payload, enqueued_at, attempts FROM queue_items
         WHERE queue = ?1 AND state = 'ready'
         ORDER BY seq LIMIT ?2",
    )?;
    // LIMIT -1 means no limit
    let limit = limit.map(|n| n as i64).unwrap_or(-1);
    let rows = stmt.query_map(params![queue.as_str(), limit], |row| {
        Ok(ReadyRow {
            seq: row.get(0)?,
            id: row.get(1)?,
            payload: row.get(2)?,
            enqueued_at: row.get(3)?,
            attempts: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Mark one row in flight and decode it
fn claim_row<T: DeserializeOwned>(conn: &Connection, row: ReadyRow) -> StoreResult<QueueItem<T>> {
    conn.execute(
        "UPDATE queue_items SET state = 'inflight', attempts = attempts + 1 WHERE seq = ?1",
        params![row.seq],
    )?;

    let id = Uuid::parse_str(&row.id)
        .map_err(|e| StoreError::Corrupt(format!("bad queue item id '{}': {}", row.id, e)))?;
    let enqueued_at = DateTime::parse_from_rfc3339(&row.enqueued_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad enqueue time: {}", e)))?;

    Ok(QueueItem {
        id,
        payload: serde_json::from_str(&row.payload)?,
        enqueued_at,
        attempts: row.attempts + 1,
    })
}

/// Queue depth split by delivery state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub inflight: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.ready + self.inflight
    }
}

/// SQLite-backed durable store
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!(
                        "cannot create store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        run_migrations(&conn)?;

        info!("Opened store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Volatile store for tests and dry runs
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("store lock poisoned: {}", e)))
    }

    // ---- queues ----

    /// Append a payload to a queue; returns the new item id
    pub fn enqueue<T: Serialize>(&self, queue: QueueName, payload: &T) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        let body = serde_json::to_string(payload)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO queue_items (id, queue, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), queue.as_str(), body, Utc::now().to_rfc3339()],
        )?;
        debug!("Enqueued {} on {}", id, queue);
        Ok(id)
    }

    /// Append unless an item with the same key is already queued
    ///
    /// Returns `None` when the key is already present (ready or in flight).
    pub fn enqueue_unique<T: Serialize>(
        &self,
        queue: QueueName,
        dedupe_key: &str,
        payload: &T,
    ) -> StoreResult<Option<Uuid>> {
        let id = Uuid::new_v4();
        let body = serde_json::to_string(payload)?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO queue_items (id, queue, dedupe_key, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                queue.as_str(),
                dedupe_key,
                body,
                Utc::now().to_rfc3339()
            ],
        )?;
        if inserted == 0 {
            debug!("Skipped duplicate '{}' on {}", dedupe_key, queue);
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Claim up to `n` ready items in enqueue order
    ///
    /// Claimed items are in flight until acked or requeued; each claim
    /// increments the item's attempt count.
    pub fn peek_batch<T: DeserializeOwned>(
        &self,
        queue: QueueName,
        n: usize,
    ) -> StoreResult<Vec<QueueItem<T>>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let rows = select_ready(&tx, queue, Some(n))?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(claim_row(&tx, row)?);
        }

        tx.commit()?;
        Ok(items)
    }

    /// Claim the `n` best ready items under `cmp`, scanning the whole queue
    ///
    /// Items that do not make the cut stay ready and keep their attempt
    /// count. Ties keep enqueue order.
    pub fn claim_top<T, F>(
        &self,
        queue: QueueName,
        n: usize,
        mut cmp: F,
    ) -> StoreResult<Vec<QueueItem<T>>>
    where
        T: DeserializeOwned,
        F: FnMut(&T, &T) -> Ordering,
    {
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut ranked = Vec::new();
        for row in select_ready(&tx, queue, None)? {
            let payload: T = serde_json::from_str(&row.payload)?;
            ranked.push((payload, row));
        }
        ranked.sort_by(|a, b| cmp(&a.0, &b.0));
        ranked.truncate(n);

        let mut items = Vec::with_capacity(ranked.len());
        for (_, row) in ranked {
            items.push(claim_row(&tx, row)?);
        }

        tx.commit()?;
        Ok(items)
    }

    /// Remove a consumed item. Unknown or already-acked ids are not an error.
    pub fn ack(&self, queue: QueueName, id: Uuid) -> StoreResult<()> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM queue_items WHERE queue = ?1 AND id = ?2",
            params![queue.as_str(), id.to_string()],
        )?;
        if removed == 0 {
            debug!("Ack for unknown item {} on {} ignored", id, queue);
        }
        Ok(())
    }

    /// Return an in-flight item to the ready state
    pub fn requeue(&self, queue: QueueName, id: Uuid) -> StoreResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE queue_items SET state = 'ready'
             WHERE queue = ?1 AND id = ?2 AND state = 'inflight'",
            params![queue.as_str(), id.to_string()],
        )?;
        if updated == 0 {
            debug!("Requeue for {} on {} matched no in-flight item", id, queue);
        }
        Ok(())
    }

    /// Items not yet acked (ready plus in flight)
    pub fn size(&self, queue: QueueName) -> StoreResult<usize> {
        Ok(self.depth(queue)?.total())
    }

    pub fn depth(&self, queue: QueueName) -> StoreResult<QueueDepth> {
        let conn = self.lock()?;
        let (ready, inflight): (i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN state = 'ready' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'inflight' THEN 1 ELSE 0 END), 0)
             FROM queue_items WHERE queue = ?1",
            params![queue.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(QueueDepth {
            ready: ready as usize,
            inflight: inflight as usize,
        })
    }

    /// Hand every in-flight item back to its queue; returns how many moved
    pub fn recover_on_startup(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let recovered = conn.execute(
            "UPDATE queue_items SET state = 'ready' WHERE state = 'inflight'",
            [],
        )?;
        if recovered > 0 {
            warn!("Recovered {} in-flight queue items after restart", recovered);
        }
        Ok(recovered)
    }

    // ---- cycle log ----

    pub fn next_cycle_id(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(cycle_id), 0) FROM cycles",
            [],
            |row| row.get(0),
        )?;
        Ok(max as u64 + 1)
    }

    /// Insert or update a cycle row
    pub fn record_cycle(&self, record: &CycleRecord) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cycles (cycle_id, phase, started_at, completed_at, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cycle_id) DO UPDATE SET
                phase = excluded.phase,
                completed_at = excluded.completed_at,
                outcome = excluded.outcome",
            params![
                record.cycle_id as i64,
                record.phase.as_str(),
                record.started_at.to_rfc3339(),
                record.completed_at.map(|t| t.to_rfc3339()),
                record.outcome.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_cycle(&self, cycle_id: u64) -> StoreResult<Option<CycleRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT cycle_id, phase, started_at, completed_at, outcome FROM cycles WHERE cycle_id = ?1",
                params![cycle_id as i64],
                row_to_cycle,
            )
            .optional()?;
        Ok(record)
    }

    pub fn recent_cycles(&self, limit: usize) -> StoreResult<Vec<CycleRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT cycle_id, phase, started_at, completed_at, outcome FROM cycles
             ORDER BY cycle_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_cycle)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- error log ----

    pub fn append_error(&self, record: &ErrorRecord) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO errors (id, cycle_id, phase, message, severity, diagnosis, patch_applied, recoverable, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.to_string(),
                record.cycle_id as i64,
                record.phase.as_str(),
                record.message,
                record.severity.as_str(),
                record.diagnosis,
                record.patch_applied.map(|p| p as i32),
                record.recoverable as i32,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Attach diagnosis output to an existing record; nothing else may change
    pub fn attach_diagnosis(
        &self,
        error_id: Uuid,
        diagnosis: &str,
        patch_applied: Option<bool>,
    ) -> StoreResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE errors SET diagnosis = ?2, patch_applied = ?3 WHERE id = ?1",
            params![error_id.to_string(), diagnosis, patch_applied.map(|p| p as i32)],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("error record {}", error_id)));
        }
        Ok(())
    }

    pub fn errors_for_cycle(&self, cycle_id: u64) -> StoreResult<Vec<ErrorRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, cycle_id, phase, message, severity, diagnosis, patch_applied, recoverable, created_at
             FROM errors WHERE cycle_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![cycle_id as i64], row_to_error)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn error_count(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM errors", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ---- order journal ----

    /// Journal a newly promoted order and queue it for execution, atomically
    ///
    /// The journal is unique per opportunity. If the opportunity was already
    /// promoted (redelivery after a crash) no second order is created; a
    /// still-pending journaled order is re-queued if its queue item was lost.
    /// Returns `true` when a new order was journaled.
    pub fn promote_order(&self, order: &ExecutionOrder) -> StoreResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO orders ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                ORDER_COLS
            ),
            params![
                order.id.to_string(),
                order.opportunity_id.to_string(),
                order.ticker,
                order.side.as_str(),
                order.size.to_string(),
                order.confidence,
                order.variance,
                order.created_at.to_rfc3339(),
                order.status.as_str(),
                order.fill_price.map(|p| p.to_string()),
                order.venue_order_id,
                order.status_reason,
            ],
        )?;

        let journaled = if inserted == 1 {
            order.clone()
        } else {
            tx.query_row(
                &format!("SELECT {} FROM orders WHERE opportunity_id = ?1", ORDER_COLS),
                params![order.opportunity_id.to_string()],
                row_to_order,
            )?
        };

        if journaled.status == OrderStatus::Pending {
            tx.execute(
                "INSERT OR IGNORE INTO queue_items (id, queue, dedupe_key, payload, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    QueueName::Execution.as_str(),
                    journaled.id.to_string(),
                    serde_json::to_string(&journaled)?,
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        if inserted == 0 {
            debug!(
                "Opportunity {} already promoted as order {}",
                order.opportunity_id, journaled.id
            );
        }
        Ok(inserted == 1)
    }

    /// Persist the mutable fields of a journaled order
    pub fn update_order(&self, order: &ExecutionOrder) -> StoreResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE orders SET size = ?2, status = ?3, fill_price = ?4, venue_order_id = ?5, status_reason = ?6
             WHERE id = ?1",
            params![
                order.id.to_string(),
                order.size.to_string(),
                order.status.as_str(),
                order.fill_price.map(|p| p.to_string()),
                order.venue_order_id,
                order.status_reason,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("order {}", order.id)));
        }
        Ok(())
    }

    /// Persist a filled order together with the debited ledger
    ///
    /// Both rows commit or neither does, so a restart can never see a
    /// filled order without its debit (or the reverse).
    pub fn commit_fill(&self, order: &ExecutionOrder, ledger: &CapitalLedger) -> StoreResult<()> {
        let ledger_body = serde_json::to_string(ledger)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE orders SET size = ?2, status = ?3, fill_price = ?4, venue_order_id = ?5, status_reason = ?6
             WHERE id = ?1",
            params![
                order.id.to_string(),
                order.size.to_string(),
                order.status.as_str(),
                order.fill_price.map(|p| p.to_string()),
                order.venue_order_id,
                order.status_reason,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("order {}", order.id)));
        }

        tx.execute(
            "INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![LEDGER_KEY, ledger_body, Utc::now().to_rfc3339()],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_order(&self, id: Uuid) -> StoreResult<Option<ExecutionOrder>> {
        let conn = self.lock()?;
        let order = conn
            .query_row(
                &format!("SELECT {} FROM orders WHERE id = ?1", ORDER_COLS),
                params![id.to_string()],
                row_to_order,
            )
            .optional()?;
        Ok(order)
    }

    pub fn orders_with_status(&self, status: OrderStatus) -> StoreResult<Vec<ExecutionOrder>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM orders WHERE status = ?1 ORDER BY created_at",
            ORDER_COLS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_order)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- archive ----

    /// Idempotent: re-archiving a cycle replaces its summary
    pub fn archive_summary(&self, summary: &CycleSummary) -> StoreResult<()> {
        let body = serde_json::to_string(summary)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO archive (cycle_id, summary, archived_at) VALUES (?1, ?2, ?3)",
            params![summary.cycle_id as i64, body, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_summary(&self, cycle_id: u64) -> StoreResult<Option<CycleSummary>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT summary FROM archive WHERE cycle_id = ?1",
                params![cycle_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    pub fn archive_count(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM archive", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ---- singleton state ----

    fn get_state<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT value FROM state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    fn put_state<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let body = serde_json::to_string(value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, body, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_ledger(&self) -> StoreResult<Option<CapitalLedger>> {
        self.get_state(LEDGER_KEY)
    }

    pub fn save_ledger(&self, ledger: &CapitalLedger) -> StoreResult<()> {
        self.put_state(LEDGER_KEY, ledger)
    }

    pub fn load_breaker<T: DeserializeOwned>(&self) -> StoreResult<Option<T>> {
        self.get_state(BREAKER_KEY)
    }

    pub fn save_breaker<T: Serialize>(&self, breaker: &T) -> StoreResult<()> {
        self.put_state(BREAKER_KEY, breaker)
    }

    pub fn load_restock<T: DeserializeOwned>(&self) -> StoreResult<Option<T>> {
        self.get_state(RESTOCK_KEY)
    }

    pub fn save_restock<T: Serialize>(&self, token: &T) -> StoreResult<()> {
        self.put_state(RESTOCK_KEY, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::phases::PhaseId;
    use crate::types::Opportunity;

    #[test]
    fn test_claim_order_and_attempts() {
        let store = Store::open_in_memory().unwrap();
        for ticker in ["A", "B", "C"] {
            store
                .enqueue(QueueName::Opportunity, &Opportunity::new(ticker, 1.0))
                .unwrap();
        }

        let batch: Vec<QueueItem<Opportunity>> =
            store.peek_batch(QueueName::Opportunity, 2).unwrap();
        let tickers: Vec<&str> = batch.iter().map(|i| i.payload.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["A", "B"]);
        assert!(batch.iter().all(|i| i.attempts == 1));

        let depth = store.depth(QueueName::Opportunity).unwrap();
        assert_eq!(depth, QueueDepth { ready: 1, inflight: 2 });
        assert_eq!(store.size(QueueName::Opportunity).unwrap(), 3);

        // In-flight items are not handed out twice
        let rest: Vec<QueueItem<Opportunity>> =
            store.peek_batch(QueueName::Opportunity, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload.ticker, "C");
    }

    #[test]
    fn test_claim_top_ranks_whole_queue() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..30 {
            let ticker = format!("T{:02}", i);
            store
                .enqueue(QueueName::Opportunity, &Opportunity::new(ticker, i as f64 / 100.0))
                .unwrap();
        }

        let top: Vec<QueueItem<Opportunity>> = store
            .claim_top(QueueName::Opportunity, 3, crate::types::rank_cmp)
            .unwrap();
        let tickers: Vec<&str> = top.iter().map(|i| i.payload.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["T29", "T28", "T27"]);

        // Only the winners were claimed
        let depth = store.depth(QueueName::Opportunity).unwrap();
        assert_eq!(depth, QueueDepth { ready: 27, inflight: 3 });
        let next: Vec<QueueItem<Opportunity>> = store.peek_batch(QueueName::Opportunity, 1).unwrap();
        assert_eq!(next[0].payload.ticker, "T00");
        assert_eq!(next[0].attempts, 1);
    }

    #[test]
    fn test_ack_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let id = store.enqueue(QueueName::Execution, &"payload").unwrap();

        store.ack(QueueName::Execution, id).unwrap();
        store.ack(QueueName::Execution, id).unwrap();
        store.ack(QueueName::Execution, Uuid::new_v4()).unwrap();

        assert_eq!(store.size(QueueName::Execution).unwrap(), 0);
    }

    #[test]
    fn test_requeue_redelivers_with_higher_attempts() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue(QueueName::Opportunity, &1u32).unwrap();

        let first: Vec<QueueItem<u32>> = store.peek_batch(QueueName::Opportunity, 1).unwrap();
        store.requeue(QueueName::Opportunity, first[0].id).unwrap();

        let second: Vec<QueueItem<u32>> = store.peek_batch(QueueName::Opportunity, 1).unwrap();
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].attempts, 2);
    }

    #[test]
    fn test_enqueue_unique_dedupes_while_pending() {
        let store = Store::open_in_memory().unwrap();
        let opp = Opportunity::new("AAPL", 0.5);

        let first = store
            .enqueue_unique(QueueName::Opportunity, "AAPL", &opp)
            .unwrap();
        assert!(first.is_some());
        assert!(store
            .enqueue_unique(QueueName::Opportunity, "AAPL", &opp)
            .unwrap()
            .is_none());

        // Same key on the other queue is independent
        assert!(store
            .enqueue_unique(QueueName::Execution, "AAPL", &opp)
            .unwrap()
            .is_some());

        // Once consumed the key can be queued again
        store.ack(QueueName::Opportunity, first.unwrap()).unwrap();
        assert!(store
            .enqueue_unique(QueueName::Opportunity, "AAPL", &opp)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_promote_order_is_unique_per_opportunity() {
        let store = Store::open_in_memory().unwrap();
        let opp = Opportunity::new("MSFT", 0.8);
        let order = ExecutionOrder::promote(&opp, OrderSide::Buy, Decimal::from(15), 0.8, 0.1);

        assert!(store.promote_order(&order).unwrap());

        let again = ExecutionOrder::promote(&opp, OrderSide::Buy, Decimal::from(15), 0.8, 0.1);
        assert!(!store.promote_order(&again).unwrap());

        assert_eq!(store.size(QueueName::Execution).unwrap(), 1);
        assert_eq!(store.orders_with_status(OrderStatus::Pending).unwrap().len(), 1);
        assert!(store.get_order(again.id).unwrap().is_none());
    }

    #[test]
    fn test_order_update_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let opp = Opportunity::new("NVDA", 0.9);
        let mut order = ExecutionOrder::promote(&opp, OrderSide::Buy, Decimal::from(15), 0.9, 0.1);
        store.promote_order(&order).unwrap();

        order.status = OrderStatus::Filled;
        order.size = Decimal::new(1425, 2);
        order.fill_price = Some(Decimal::new(10125, 2));
        order.venue_order_id = Some("venue-1".to_string());
        store.update_order(&order).unwrap();

        let loaded = store.get_order(order.id).unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert_eq!(loaded.size, Decimal::new(1425, 2));
        assert_eq!(loaded.fill_price, Some(Decimal::new(10125, 2)));
        assert_eq!(loaded.venue_order_id.as_deref(), Some("venue-1"));
    }

    #[test]
    fn test_error_log_only_diagnosis_changes() {
        let store = Store::open_in_memory().unwrap();
        let record = ErrorRecord {
            id: Uuid::new_v4(),
            cycle_id: 7,
            phase: PhaseId::Execute,
            message: "venue timeout".to_string(),
            severity: ErrorClass::Transient,
            diagnosis: None,
            patch_applied: None,
            recoverable: true,
            created_at: Utc::now(),
        };
        store.append_error(&record).unwrap();
        store
            .attach_diagnosis(record.id, "venue overloaded", Some(false))
            .unwrap();

        let errors = store.errors_for_cycle(7).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "venue timeout");
        assert_eq!(errors[0].severity, ErrorClass::Transient);
        assert_eq!(errors[0].diagnosis.as_deref(), Some("venue overloaded"));
        assert_eq!(errors[0].patch_applied, Some(false));

        assert!(matches!(
            store.attach_diagnosis(Uuid::new_v4(), "x", None),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_cycle_ids_are_monotonic() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.next_cycle_id().unwrap(), 1);

        let mut record = CycleRecord::start(1);
        store.record_cycle(&record).unwrap();
        assert_eq!(store.next_cycle_id().unwrap(), 2);

        record.phase = PhaseId::Done;
        record.close(CycleOutcome::Success);
        store.record_cycle(&record).unwrap();

        let loaded = store.get_cycle(1).unwrap().unwrap();
        assert_eq!(loaded.outcome, CycleOutcome::Success);
        assert_eq!(loaded.phase, PhaseId::Done);
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn test_archive_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let mut summary = CycleSummary::new(3, Decimal::from(300));
        store.archive_summary(&summary).unwrap();

        summary.outcome = CycleOutcome::Success;
        summary.orders_filled = 2;
        store.archive_summary(&summary).unwrap();

        assert_eq!(store.archive_count().unwrap(), 1);
        assert_eq!(store.get_summary(3).unwrap().unwrap().orders_filled, 2);
    }

    #[test]
    fn test_ledger_persists() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_ledger().unwrap().is_none());

        let mut ledger = CapitalLedger::new(Decimal::from(300), Decimal::from(250));
        ledger.debit(Decimal::from(15), "test").unwrap();
        store.save_ledger(&ledger).unwrap();

        let loaded = store.load_ledger().unwrap().unwrap();
        assert_eq!(loaded.running_balance, Decimal::from(285));
        assert_eq!(loaded.revision, 1);
    }
}
