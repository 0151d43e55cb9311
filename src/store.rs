// =============================================================================
// Store — embedded SQLite persistence for the trading runtime
// =============================================================================
//
// Namespaces consumed by the core:
//   settings         (account_id, key) -> JSON value, upsert by composite key
//   sessions         account_id -> encrypted token + account metadata
//   trades           append-only settled trades
//   order_status     append-only order lifecycle events
//   bot_runs         upsert by run id
//   execution_ledger append + state update, keyed by correlation id
//
// Mutating writes that tolerate latency flow through the single-writer
// persistence queue (`spawn_writer`), which preserves order and retries with
// a small bounded policy. Writes on the exactly-once path (ledger rows) are
// issued synchronously by their owners.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::EngineError;
use crate::health::{Component, ComponentStatus, HealthMonitor};
use crate::types::now_ms;

/// Account id under which the global kill switch row is stored.
pub const GLOBAL_SCOPE: &str = "__global__";

/// Settings keys used by the core.
pub mod keys {
    pub const RISK_STATE: &str = "risk_state";
    pub const BALANCE_SNAPSHOT: &str = "balance_snapshot";
    pub const OPEN_CONTRACTS: &str = "open_contracts";
    pub const KILL_SWITCH: &str = "kill_switch";
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution-ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    Pending,
    InFlight,
    Settled,
    Failed,
}

impl LedgerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Settled => "settled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "settled" => Some(Self::Settled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution-ledger row.
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub correlation_id: String,
    pub account_id: String,
    pub state: LedgerState,
    pub trade_payload: Value,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// One persisted session row.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub account_id: String,
    pub encrypted_token: String,
    pub account_kind: String,
    pub currency: String,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Process-global persistence collaborator.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let conn = Connection::open(path.as_ref())?;
        Self::init_schema(&conn)?;
        info!(path = %path.as_ref().display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), EngineError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                account_id TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, key)
            );
            CREATE TABLE IF NOT EXISTS sessions (
                account_id      TEXT PRIMARY KEY,
                encrypted_token TEXT NOT NULL,
                account_kind    TEXT NOT NULL,
                currency        TEXT NOT NULL,
                updated_at      INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trades (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                payload    TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_account ON trades (account_id);
            CREATE TABLE IF NOT EXISTS order_status (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id     TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                status         TEXT NOT NULL,
                detail         TEXT,
                created_at     INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS bot_runs (
                id         TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                payload    TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS execution_ledger (
                correlation_id TEXT PRIMARY KEY,
                account_id     TEXT NOT NULL,
                state          TEXT NOT NULL,
                trade_payload  TEXT NOT NULL,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_state ON execution_ledger (state);
            ",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // settings
    // -------------------------------------------------------------------------

    pub fn get_setting(&self, account_id: &str, key: &str) -> Result<Option<Value>, EngineError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE account_id = ?1 AND key = ?2",
                params![account_id, key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub fn upsert_setting(
        &self,
        account_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (account_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (account_id, key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at",
            params![account_id, key, value.to_string(), now_ms()],
        )?;
        Ok(())
    }

    /// All settings rows sharing `key`, as (account_id, value) pairs. Used to
    /// restore kill switches for every account at startup.
    pub fn list_settings_by_key(&self, key: &str) -> Result<Vec<(String, Value)>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT account_id, value FROM settings WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |row| {
            let account: String = row.get(0)?;
            let raw: String = row.get(1)?;
            Ok((account, raw))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (account, raw) = row?;
            out.push((account, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // sessions
    // -------------------------------------------------------------------------

    pub fn upsert_session(
        &self,
        account_id: &str,
        encrypted_token: &str,
        account_kind: &str,
        currency: &str,
    ) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (account_id, encrypted_token, account_kind, currency, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (account_id) DO UPDATE SET
                 encrypted_token = excluded.encrypted_token,
                 account_kind = excluded.account_kind,
                 currency = excluded.currency,
                 updated_at = excluded.updated_at",
            params![account_id, encrypted_token, account_kind, currency, now_ms()],
        )?;
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRow>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT account_id, encrypted_token, account_kind, currency FROM sessions")?;
        let rows = stmt.query_map([], |row| {
            Ok(SessionRow {
                account_id: row.get(0)?,
                encrypted_token: row.get(1)?,
                account_kind: row.get(2)?,
                currency: row.get(3)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // trades / order_status
    // -------------------------------------------------------------------------

    pub fn append_trade(&self, account_id: &str, payload: &Value) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades (account_id, payload, created_at) VALUES (?1, ?2, ?3)",
            params![account_id, payload.to_string(), now_ms()],
        )?;
        Ok(())
    }

    pub fn trades_for_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<Value>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload FROM trades WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![account_id, limit as i64], |row| {
            let raw: String = row.get(0)?;
            Ok(raw)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn append_order_status(
        &self,
        account_id: &str,
        correlation_id: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO order_status (account_id, correlation_id, status, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![account_id, correlation_id, status, detail, now_ms()],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // bot_runs
    // -------------------------------------------------------------------------

    pub fn upsert_bot_run(
        &self,
        id: &str,
        account_id: &str,
        payload: &Value,
    ) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bot_runs (id, account_id, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO UPDATE SET
                 payload = excluded.payload,
                 updated_at = excluded.updated_at",
            params![id, account_id, payload.to_string(), now_ms()],
        )?;
        Ok(())
    }

    pub fn list_bot_runs(&self) -> Result<Vec<(String, String, Value)>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, account_id, payload FROM bot_runs")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let account: String = row.get(1)?;
            let raw: String = row.get(2)?;
            Ok((id, account, raw))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, account, raw) = row?;
            out.push((id, account, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    pub fn delete_bot_run(&self, id: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM bot_runs WHERE id = ?1", params![id])?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // execution_ledger
    // -------------------------------------------------------------------------

    /// Insert a `pending` ledger row. Idempotent: a second insert with the
    /// same correlation id is a no-op and returns `false`.
    pub fn insert_ledger(
        &self,
        correlation_id: &str,
        account_id: &str,
        payload: &Value,
    ) -> Result<bool, EngineError> {
        let conn = self.conn.lock();
        let now = now_ms();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO execution_ledger
                 (correlation_id, account_id, state, trade_payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                correlation_id,
                account_id,
                LedgerState::Pending.as_str(),
                payload.to_string(),
                now
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Advance a ledger row's state, optionally replacing its payload.
    pub fn update_ledger(
        &self,
        correlation_id: &str,
        state: LedgerState,
        payload: Option<&Value>,
    ) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        match payload {
            Some(p) => {
                conn.execute(
                    "UPDATE execution_ledger
                     SET state = ?2, trade_payload = ?3, updated_at = ?4
                     WHERE correlation_id = ?1",
                    params![correlation_id, state.as_str(), p.to_string(), now_ms()],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE execution_ledger SET state = ?2, updated_at = ?3
                     WHERE correlation_id = ?1",
                    params![correlation_id, state.as_str(), now_ms()],
                )?;
            }
        }
        Ok(())
    }

    pub fn ledger_row(&self, correlation_id: &str) -> Result<Option<LedgerRow>, EngineError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT correlation_id, account_id, state, trade_payload, created_at, updated_at
                 FROM execution_ledger WHERE correlation_id = ?1",
                params![correlation_id],
                Self::map_ledger_row,
            )
            .optional()?;

        match row {
            Some(r) => Ok(Some(r?)),
            None => Ok(None),
        }
    }

    /// Rows whose settlement has not been applied: `pending` or `in_flight`.
    pub fn unsettled_ledger_rows(&self) -> Result<Vec<LedgerRow>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT correlation_id, account_id, state, trade_payload, created_at, updated_at
             FROM execution_ledger WHERE state IN ('pending', 'in_flight')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], Self::map_ledger_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Atomically persist a settled trade: append the trade row and mark the
    /// ledger row settled in one transaction. Returns `false` (and writes
    /// nothing) when the correlation id is already settled, which makes
    /// settlement replay a no-op.
    ///
    /// A missing ledger row (settlement discovered purely via portfolio
    /// recovery) gets a settled row inserted so later replays stay no-ops.
    pub fn apply_settlement(
        &self,
        correlation_id: &str,
        account_id: &str,
        trade_payload: &Value,
    ) -> Result<bool, EngineError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_ms();

        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM execution_ledger WHERE correlation_id = ?1",
                params![correlation_id],
                |row| row.get(0),
            )
            .optional()?;

        if state.as_deref() == Some(LedgerState::Settled.as_str()) {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO trades (account_id, payload, created_at) VALUES (?1, ?2, ?3)",
            params![account_id, trade_payload.to_string(), now],
        )?;

        if state.is_some() {
            tx.execute(
                "UPDATE execution_ledger SET state = ?2, trade_payload = ?3, updated_at = ?4
                 WHERE correlation_id = ?1",
                params![
                    correlation_id,
                    LedgerState::Settled.as_str(),
                    trade_payload.to_string(),
                    now
                ],
            )?;
        } else {
            tx.execute(
                "INSERT INTO execution_ledger
                     (correlation_id, account_id, state, trade_payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    correlation_id,
                    account_id,
                    LedgerState::Settled.as_str(),
                    trade_payload.to_string(),
                    now
                ],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    #[allow(clippy::type_complexity)]
    fn map_ledger_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<LedgerRow, EngineError>> {
        let correlation_id: String = row.get(0)?;
        let account_id: String = row.get(1)?;
        let state_raw: String = row.get(2)?;
        let payload_raw: String = row.get(3)?;
        let created_at_ms: i64 = row.get(4)?;
        let updated_at_ms: i64 = row.get(5)?;

        Ok((|| {
            let state = LedgerState::parse(&state_raw).ok_or_else(|| {
                EngineError::PersistenceDegraded(format!("unknown ledger state '{state_raw}'"))
            })?;
            Ok(LedgerRow {
                correlation_id,
                account_id,
                state,
                trade_payload: serde_json::from_str(&payload_raw)?,
                created_at_ms,
                updated_at_ms,
            })
        })())
    }

    // -------------------------------------------------------------------------
    // kill switches
    // -------------------------------------------------------------------------

    /// All persisted kill-switch rows as (scope, value); the global row uses
    /// the [`GLOBAL_SCOPE`] sentinel.
    pub fn list_kill_switches(&self) -> Result<Vec<(String, Value)>, EngineError> {
        self.list_settings_by_key(keys::KILL_SWITCH)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

// =============================================================================
// Single-writer persistence queue
// =============================================================================

/// A write routed through the persistence queue.
#[derive(Debug, Clone)]
pub enum WriteOp {
    UpsertSetting {
        account_id: String,
        key: String,
        value: Value,
    },
    UpsertSession {
        account_id: String,
        encrypted_token: String,
        account_kind: String,
        currency: String,
    },
    AppendTrade {
        account_id: String,
        payload: Value,
    },
    AppendOrderStatus {
        account_id: String,
        correlation_id: String,
        status: String,
        detail: Option<String>,
    },
    UpsertBotRun {
        id: String,
        account_id: String,
        payload: Value,
    },
    UpdateLedger {
        correlation_id: String,
        state: LedgerState,
        payload: Option<Value>,
    },
}

/// Cheap cloneable handle onto the persistence queue.
#[derive(Clone)]
pub struct StoreWriter {
    tx: Option<mpsc::UnboundedSender<WriteOp>>,
}

impl StoreWriter {
    /// A writer whose queue is disconnected. Enqueued ops are dropped; used
    /// by tests that do not exercise persistence.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Enqueue a write. Never blocks; ordering is the enqueue order.
    pub fn enqueue(&self, op: WriteOp) {
        if let Some(tx) = &self.tx {
            if tx.send(op).is_err() {
                warn!("persistence queue closed — dropping write");
            }
        }
    }
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter")
            .field("attached", &self.tx.is_some())
            .finish()
    }
}

/// Per-op attempts before the write is abandoned and health degraded.
const WRITE_ATTEMPTS: u32 = 3;

/// Spawn the single writer task. Writes apply in queue order; each op gets a
/// bounded retry, then the persistence component is marked degraded.
pub fn spawn_writer(store: Arc<Store>, health: Arc<HealthMonitor>) -> StoreWriter {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();

    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let mut last_err: Option<EngineError> = None;
            for attempt in 0..WRITE_ATTEMPTS {
                match apply(&store, &op) {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        debug!(attempt, error = %e, "persistence write failed");
                        last_err = Some(e);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }

            match last_err {
                None => health.set_component(Component::Persistence, ComponentStatus::Ok, None),
                Some(e) => {
                    error!(error = %e, op = ?op, "persistence write abandoned after retries");
                    health.set_component(
                        Component::Persistence,
                        ComponentStatus::Degraded,
                        Some(e.to_string()),
                    );
                }
            }
        }
        debug!("persistence queue drained — writer exiting");
    });

    StoreWriter { tx: Some(tx) }
}

fn apply(store: &Store, op: &WriteOp) -> Result<(), EngineError> {
    match op {
        WriteOp::UpsertSetting {
            account_id,
            key,
            value,
        } => store.upsert_setting(account_id, key, value),
        WriteOp::UpsertSession {
            account_id,
            encrypted_token,
            account_kind,
            currency,
        } => store.upsert_session(account_id, encrypted_token, account_kind, currency),
        WriteOp::AppendTrade {
            account_id,
            payload,
        } => store.append_trade(account_id, payload),
        WriteOp::AppendOrderStatus {
            account_id,
            correlation_id,
            status,
            detail,
        } => store.append_order_status(account_id, correlation_id, status, detail.as_deref()),
        WriteOp::UpsertBotRun {
            id,
            account_id,
            payload,
        } => store.upsert_bot_run(id, account_id, payload),
        WriteOp::UpdateLedger {
            correlation_id,
            state,
            payload,
        } => store.update_ledger(correlation_id, *state, payload.as_ref()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_upsert_by_composite_key() {
        let store = Store::open_in_memory().unwrap();

        store
            .upsert_setting("acc-1", keys::RISK_STATE, &json!({"equity": 100.0}))
            .unwrap();
        store
            .upsert_setting("acc-1", keys::RISK_STATE, &json!({"equity": 250.0}))
            .unwrap();
        store
            .upsert_setting("acc-2", keys::RISK_STATE, &json!({"equity": 1.0}))
            .unwrap();

        let v = store.get_setting("acc-1", keys::RISK_STATE).unwrap().unwrap();
        assert_eq!(v["equity"], 250.0);

        let v2 = store.get_setting("acc-2", keys::RISK_STATE).unwrap().unwrap();
        assert_eq!(v2["equity"], 1.0);

        assert!(store.get_setting("acc-3", keys::RISK_STATE).unwrap().is_none());
    }

    #[test]
    fn list_settings_by_key_spans_accounts() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_setting("acc-1", keys::KILL_SWITCH, &json!({"active": true}))
            .unwrap();
        store
            .upsert_setting(GLOBAL_SCOPE, keys::KILL_SWITCH, &json!({"active": false}))
            .unwrap();
        store
            .upsert_setting("acc-1", keys::RISK_STATE, &json!({}))
            .unwrap();

        let rows = store.list_kill_switches().unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn ledger_insert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let payload = json!({"symbol": "R_100", "stake": 10.0});

        assert!(store.insert_ledger("C1", "acc-1", &payload).unwrap());
        assert!(!store.insert_ledger("C1", "acc-1", &payload).unwrap());

        let row = store.ledger_row("C1").unwrap().unwrap();
        assert_eq!(row.state, LedgerState::Pending);
        assert_eq!(row.account_id, "acc-1");
    }

    #[test]
    fn ledger_state_advance_and_query_unsettled() {
        let store = Store::open_in_memory().unwrap();
        store.insert_ledger("C1", "acc-1", &json!({})).unwrap();
        store.insert_ledger("C2", "acc-1", &json!({})).unwrap();
        store.insert_ledger("C3", "acc-1", &json!({})).unwrap();

        store
            .update_ledger("C1", LedgerState::InFlight, Some(&json!({"contract_id": 7})))
            .unwrap();
        store.update_ledger("C2", LedgerState::Settled, None).unwrap();
        store.update_ledger("C3", LedgerState::Failed, None).unwrap();

        let unsettled = store.unsettled_ledger_rows().unwrap();
        assert_eq!(unsettled.len(), 1);
        assert_eq!(unsettled[0].correlation_id, "C1");
        assert_eq!(unsettled[0].trade_payload["contract_id"], 7);
    }

    #[test]
    fn apply_settlement_is_exactly_once() {
        let store = Store::open_in_memory().unwrap();
        store.insert_ledger("C1", "acc-1", &json!({"stake": 10.0})).unwrap();

        let payload = json!({"contract_id": 7001, "profit": 8.5, "stake": 10.0});
        assert!(store.apply_settlement("C1", "acc-1", &payload).unwrap());
        assert!(!store.apply_settlement("C1", "acc-1", &payload).unwrap());

        // One trade row, ledger settled.
        assert_eq!(store.trades_for_account("acc-1", 10).unwrap().len(), 1);
        let row = store.ledger_row("C1").unwrap().unwrap();
        assert_eq!(row.state, LedgerState::Settled);
        assert_eq!(row.trade_payload["profit"], 8.5);
    }

    #[test]
    fn apply_settlement_without_ledger_row_inserts_settled_marker() {
        let store = Store::open_in_memory().unwrap();
        let payload = json!({"contract_id": 9, "profit": 1.0});

        assert!(store.apply_settlement("recovered-9", "acc-1", &payload).unwrap());
        assert!(!store.apply_settlement("recovered-9", "acc-1", &payload).unwrap());
        assert_eq!(store.trades_for_account("acc-1", 10).unwrap().len(), 1);
    }

    #[test]
    fn trades_append_and_list() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_trade("acc-1", &json!({"contract_id": 1, "profit": 2.5}))
            .unwrap();
        store
            .append_trade("acc-1", &json!({"contract_id": 2, "profit": -1.0}))
            .unwrap();
        store.append_trade("acc-2", &json!({"contract_id": 3})).unwrap();

        let trades = store.trades_for_account("acc-1", 10).unwrap();
        assert_eq!(trades.len(), 2);
        // Most recent first.
        assert_eq!(trades[0]["contract_id"], 2);
    }

    #[test]
    fn sessions_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_session("acc-1", "aabb:ccdd", "real", "USD")
            .unwrap();
        store
            .upsert_session("acc-1", "eeff:0011", "real", "USD")
            .unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].encrypted_token, "eeff:0011");
    }

    #[test]
    fn bot_runs_upsert_and_delete() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_bot_run("run-1", "acc-1", &json!({"status": "running"}))
            .unwrap();
        store
            .upsert_bot_run("run-1", "acc-1", &json!({"status": "paused"}))
            .unwrap();

        let runs = store.list_bot_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].2["status"], "paused");

        store.delete_bot_run("run-1").unwrap();
        assert!(store.list_bot_runs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn writer_applies_ops_in_order() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let health = Arc::new(HealthMonitor::new());
        let writer = spawn_writer(store.clone(), health);

        writer.enqueue(WriteOp::UpsertSetting {
            account_id: "acc-1".into(),
            key: keys::RISK_STATE.into(),
            value: json!({"equity": 1.0}),
        });
        writer.enqueue(WriteOp::UpsertSetting {
            account_id: "acc-1".into(),
            key: keys::RISK_STATE.into(),
            value: json!({"equity": 2.0}),
        });

        // Give the writer task a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let v = store.get_setting("acc-1", keys::RISK_STATE).unwrap().unwrap();
        assert_eq!(v["equity"], 2.0);
    }

    #[test]
    fn detached_writer_drops_silently() {
        let writer = StoreWriter::detached();
        writer.enqueue(WriteOp::AppendTrade {
            account_id: "acc-1".into(),
            payload: json!({}),
        });
    }
}
