// =============================================================================
// Bot Runs — persistent strategy instances, arena-keyed by uuid
// =============================================================================
//
// Runs reference each other and the rest of the engine by id only; everything
// resolves through the arena. At most one run per account may be `running`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::risk::cache::EvaluateParams;
use crate::risk::manager::PreTradeLimits;
use crate::store::{StoreWriter, WriteOp};
use crate::types::{now_ms, RunStatus};

// ---------------------------------------------------------------------------
// Run definition
// ---------------------------------------------------------------------------

fn default_batch_size() -> usize {
    1
}

fn default_volatility_window() -> usize {
    14
}

/// Risk limits carried by a run; zero disables a limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRiskLimits {
    #[serde(default)]
    pub max_stake: f64,
    #[serde(default)]
    pub daily_loss_limit_pct: f64,
    #[serde(default)]
    pub drawdown_limit_pct: f64,
    #[serde(default)]
    pub max_consecutive_losses: u32,
    #[serde(default)]
    pub loss_cooldown_ms: u64,
    #[serde(default)]
    pub max_concurrent_trades: u32,
    #[serde(default)]
    pub max_order_size: f64,
    #[serde(default)]
    pub max_notional: f64,
    #[serde(default)]
    pub max_exposure: f64,
    #[serde(default)]
    pub orders_per_second: u32,
    #[serde(default)]
    pub orders_per_minute: u32,
    /// Slippage band in percent for HYBRID_LIMIT_MARKET orders.
    #[serde(default)]
    pub slippage_pct: Option<f64>,
    /// Normalised ATR level above which the volatility guard trips.
    #[serde(default)]
    pub volatility_threshold: Option<f64>,
    #[serde(default = "default_volatility_window")]
    pub volatility_window: usize,
}

impl Default for RunRiskLimits {
    fn default() -> Self {
        Self {
            max_stake: 0.0,
            daily_loss_limit_pct: 0.0,
            drawdown_limit_pct: 0.0,
            max_consecutive_losses: 0,
            loss_cooldown_ms: 0,
            max_concurrent_trades: 0,
            max_order_size: 0.0,
            max_notional: 0.0,
            max_exposure: 0.0,
            orders_per_second: 0,
            orders_per_minute: 0,
            slippage_pct: None,
            volatility_threshold: None,
            volatility_window: default_volatility_window(),
        }
    }
}

/// Performance tuning for the micro-batcher and the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTuning {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub batch_interval_ms: u64,
    /// Per-evaluation compute budget; `None` inherits the engine default.
    #[serde(default)]
    pub compute_budget_ms: Option<u64>,
}

impl Default for RunTuning {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_interval_ms: 0,
            compute_budget_ms: None,
        }
    }
}

/// One strategy instance executing against an account and symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotRun {
    pub id: Uuid,
    pub account_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub currency: String,

    // Stake sizing and duration policy.
    pub base_stake: f64,
    pub min_stake: f64,
    pub max_stake: f64,
    pub duration: u32,
    pub duration_unit: String,

    /// Minimum time between dispatched orders.
    #[serde(default)]
    pub cooldown_ms: u64,

    #[serde(default)]
    pub risk: RunRiskLimits,
    #[serde(default)]
    pub tuning: RunTuning,

    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub pause_reason: Option<String>,
    pub started_at_ms: i64,
    #[serde(default)]
    pub last_trade_at_ms: Option<i64>,
    #[serde(default)]
    pub trades_executed: u64,
    #[serde(default)]
    pub total_profit: f64,
}

impl BotRun {
    pub fn new(account_id: &str, strategy_id: &str, symbol: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            currency: "USD".to_string(),
            base_stake: 1.0,
            min_stake: 0.35,
            max_stake: 10.0,
            duration: 5,
            duration_unit: "t".to_string(),
            cooldown_ms: 0,
            risk: RunRiskLimits::default(),
            tuning: RunTuning::default(),
            status: RunStatus::Stopped,
            pause_reason: None,
            started_at_ms: now_ms(),
            last_trade_at_ms: None,
            trades_executed: 0,
            total_profit: 0.0,
        }
    }

    /// Limits for the pre-trade gate, lifted from this run.
    pub fn pre_trade_limits(&self) -> PreTradeLimits {
        PreTradeLimits {
            max_order_size: self.risk.max_order_size,
            max_notional: self.risk.max_notional,
            max_exposure: self.risk.max_exposure,
            orders_per_second: self.risk.orders_per_second,
            orders_per_minute: self.risk.orders_per_minute,
        }
    }

    /// Parameters for `RiskCache::evaluate` at a proposed stake.
    pub fn evaluate_params(&self, proposed_stake: f64) -> EvaluateParams {
        EvaluateParams {
            proposed_stake,
            max_stake: self.risk.max_stake,
            daily_loss_limit_pct: self.risk.daily_loss_limit_pct,
            drawdown_limit_pct: self.risk.drawdown_limit_pct,
            max_consecutive_losses: self.risk.max_consecutive_losses,
            cooldown_ms: self.cooldown_ms,
            loss_cooldown_ms: self.risk.loss_cooldown_ms,
            max_concurrent_trades: self.risk.max_concurrent_trades,
        }
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

pub struct RunArena {
    runs: RwLock<HashMap<Uuid, Arc<RwLock<BotRun>>>>,
    writer: StoreWriter,
}

impl RunArena {
    pub fn new(writer: StoreWriter) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            writer,
        }
    }

    /// Insert a run. A second `running` run for the same account is refused.
    pub fn insert(&self, run: BotRun) -> Result<Arc<RwLock<BotRun>>, EngineError> {
        let mut runs = self.runs.write();

        if run.status == RunStatus::Running
            && runs
                .values()
                .any(|r| {
                    let r = r.read();
                    r.account_id == run.account_id && r.status == RunStatus::Running
                })
        {
            return Err(EngineError::Validation(format!(
                "account {} already has a running bot",
                run.account_id
            )));
        }

        let id = run.id;
        let entry = Arc::new(RwLock::new(run));
        runs.insert(id, entry.clone());
        drop(runs);

        self.persist(&entry);
        Ok(entry)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<RwLock<BotRun>>> {
        self.runs.read().get(id).cloned()
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<RwLock<BotRun>>> {
        self.runs.write().remove(id)
    }

    pub fn runs_for_account(&self, account_id: &str) -> Vec<Arc<RwLock<BotRun>>> {
        self.runs
            .read()
            .values()
            .filter(|r| r.read().account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<RwLock<BotRun>>> {
        self.runs.read().values().cloned().collect()
    }

    /// Reject actions against a run the caller does not own.
    pub fn authorize(&self, id: &Uuid, account_id: &str) -> Result<Arc<RwLock<BotRun>>, EngineError> {
        let run = self
            .get(id)
            .ok_or_else(|| EngineError::Validation(format!("unknown bot run {id}")))?;
        if run.read().account_id != account_id {
            return Err(EngineError::Auth(format!(
                "bot run {id} is not owned by {account_id}"
            )));
        }
        Ok(run)
    }

    /// Transition a run's status. Resuming into `running` re-checks the
    /// one-running-per-account invariant.
    pub fn set_status(
        &self,
        id: &Uuid,
        status: RunStatus,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let run = self
            .get(id)
            .ok_or_else(|| EngineError::Validation(format!("unknown bot run {id}")))?;

        if status == RunStatus::Running {
            let runs = self.runs.read();
            let account_id = run.read().account_id.clone();
            if runs.values().any(|r| {
                let r = r.read();
                r.id != *id && r.account_id == account_id && r.status == RunStatus::Running
            }) {
                return Err(EngineError::Validation(format!(
                    "account {account_id} already has a running bot"
                )));
            }
        }

        {
            let mut r = run.write();
            info!(run_id = %id, from = %r.status, to = %status, reason = ?reason, "bot run status change");
            r.status = status;
            r.pause_reason = reason;
        }
        self.persist(&run);
        Ok(())
    }

    /// Record a dispatched trade on a run.
    pub fn record_trade(&self, id: &Uuid, at_ms: i64) {
        if let Some(run) = self.get(id) {
            {
                let mut r = run.write();
                r.trades_executed += 1;
                r.last_trade_at_ms = Some(at_ms);
            }
            self.persist(&run);
        }
    }

    /// Attribute settled profit to a run.
    pub fn record_profit(&self, id: &Uuid, profit: f64) {
        if let Some(run) = self.get(id) {
            run.write().total_profit += profit;
            self.persist(&run);
        }
    }

    /// Restore persisted runs. Previously-running runs come back `paused`;
    /// the operator (or startup policy) decides what resumes.
    pub fn load_from(&self, rows: Vec<(String, String, Value)>) {
        for (id, account, payload) in rows {
            match serde_json::from_value::<BotRun>(payload) {
                Ok(mut run) => {
                    if run.status == RunStatus::Running {
                        run.status = RunStatus::Paused;
                        run.pause_reason = Some("restored after restart".to_string());
                    }
                    info!(run_id = %run.id, account_id = %run.account_id, "bot run restored");
                    self.runs.write().insert(run.id, Arc::new(RwLock::new(run)));
                }
                Err(e) => {
                    warn!(run_id = %id, account_id = %account, error = %e, "unreadable bot run skipped");
                }
            }
        }
    }

    fn persist(&self, run: &Arc<RwLock<BotRun>>) {
        let snapshot = run.read().clone();
        if let Ok(payload) = serde_json::to_value(&snapshot) {
            self.writer.enqueue(WriteOp::UpsertBotRun {
                id: snapshot.id.to_string(),
                account_id: snapshot.account_id.clone(),
                payload,
            });
        }
    }
}

impl std::fmt::Debug for RunArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunArena")
            .field("runs", &self.runs.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
