// =============================================================================
// Risk Cache — per-account rolling aggregates with durable snapshots
// =============================================================================
//
// Every account carries one RiskEntry: equity, peak, daily PnL, streaks, and
// open-trade state. All transitions for one account are serialized behind its
// entry lock. The UTC date key rolls daily aggregates over automatically on
// access; open positions carry across the rollover.
//
// `evaluate` fails closed: an account with no entry gets HALT.
//
// Persistence: snapshots are debounced (~1s) per account and flow through the
// single-writer persistence queue under `settings[{account, "risk_state"}]`.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::RiskReason;
use crate::store::{keys, Store, StoreWriter, WriteOp};
use crate::types::{now_ms, utc_date_key};

/// Entries untouched for this long are re-hydrated from the store on access.
const ENTRY_TTL_MS: i64 = 6 * 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// Persisted shape of one account's risk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEntry {
    pub date: String,
    #[serde(rename = "dailyStartEquity")]
    pub daily_start_equity: f64,
    #[serde(rename = "equityPeak")]
    pub equity_peak: f64,
    pub equity: f64,
    #[serde(rename = "dailyPnL")]
    pub daily_pnl: f64,
    #[serde(rename = "totalLossToday")]
    pub total_loss_today: f64,
    #[serde(rename = "totalProfitToday")]
    pub total_profit_today: f64,
    #[serde(rename = "lossStreak")]
    pub loss_streak: u32,
    #[serde(rename = "consecutiveWins")]
    pub consecutive_wins: u32,
    #[serde(rename = "openExposure")]
    pub open_exposure: f64,
    #[serde(rename = "openTradeCount")]
    pub open_trade_count: u32,
    #[serde(rename = "lastLossTime", default, skip_serializing_if = "Option::is_none")]
    pub last_loss_ms: Option<i64>,
    #[serde(rename = "lastTradeTime", default, skip_serializing_if = "Option::is_none")]
    pub last_trade_ms: Option<i64>,
    #[serde(rename = "lastUpdated", default)]
    pub last_updated_ms: i64,
}

impl RiskEntry {
    fn fresh(equity: f64, at_ms: i64) -> Self {
        Self {
            date: utc_date_key(at_ms),
            daily_start_equity: equity,
            equity_peak: equity,
            equity,
            daily_pnl: 0.0,
            total_loss_today: 0.0,
            total_profit_today: 0.0,
            loss_streak: 0,
            consecutive_wins: 0,
            open_exposure: 0.0,
            open_trade_count: 0,
            last_loss_ms: None,
            last_trade_ms: None,
            last_updated_ms: at_ms,
        }
    }

    /// Reset daily aggregates on a UTC date change. Open positions, streak
    /// history within the day, and the equity peak carry over per contract.
    fn maybe_rollover(&mut self, at_ms: i64) {
        let today = utc_date_key(at_ms);
        if self.date == today {
            return;
        }
        info!(old_date = %self.date, new_date = %today, "risk entry day rollover");
        self.date = today;
        self.daily_pnl = 0.0;
        self.total_loss_today = 0.0;
        self.total_profit_today = 0.0;
        self.loss_streak = 0;
        self.consecutive_wins = 0;
        self.daily_start_equity = self.equity;
        self.last_updated_ms = at_ms;
    }
}

// ---------------------------------------------------------------------------
// Evaluate contract
// ---------------------------------------------------------------------------

/// Per-run limits passed into `evaluate`.
#[derive(Debug, Clone)]
pub struct EvaluateParams {
    pub proposed_stake: f64,
    /// 0 disables the stake cap.
    pub max_stake: f64,
    /// Percent of daily start equity; 0 disables.
    pub daily_loss_limit_pct: f64,
    /// Percent from equity peak; 0 disables.
    pub drawdown_limit_pct: f64,
    /// 0 disables the loss-streak gate.
    pub max_consecutive_losses: u32,
    pub cooldown_ms: u64,
    pub loss_cooldown_ms: u64,
    /// 0 disables the concurrency gate.
    pub max_concurrent_trades: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskStatus {
    Ok,
    Cooldown,
    Halt,
    ReduceStake,
    MaxConcurrent,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskVerdict {
    pub status: RiskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capped_stake: Option<f64>,
}

impl RiskVerdict {
    fn ok() -> Self {
        Self {
            status: RiskStatus::Ok,
            reason: None,
            cooldown_ms: None,
            capped_stake: None,
        }
    }

    fn halt(reason: impl Into<String>) -> Self {
        Self {
            status: RiskStatus::Halt,
            reason: Some(reason.into()),
            cooldown_ms: None,
            capped_stake: None,
        }
    }

    fn cooldown(reason: RiskReason, remaining_ms: u64) -> Self {
        Self {
            status: RiskStatus::Cooldown,
            reason: Some(reason.to_string()),
            cooldown_ms: Some(remaining_ms),
            capped_stake: None,
        }
    }
}

/// Outcome of `record_trade_opened`.
#[derive(Debug, Clone)]
pub struct OpenDecision {
    pub allowed: bool,
    pub reason: Option<RiskReason>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub struct RiskCache {
    entries: RwLock<HashMap<String, Arc<Mutex<RiskEntry>>>>,
    store: Arc<Store>,
    writer: StoreWriter,
    pending_flush: Arc<Mutex<HashSet<String>>>,
    flush_debounce: Duration,
}

impl RiskCache {
    pub fn new(store: Arc<Store>, writer: StoreWriter) -> Self {
        Self::with_debounce(store, writer, Duration::from_secs(1))
    }

    pub fn with_debounce(store: Arc<Store>, writer: StoreWriter, flush_debounce: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
            writer,
            pending_flush: Arc::new(Mutex::new(HashSet::new())),
            flush_debounce,
        }
    }

    // -------------------------------------------------------------------------
    // Entry lifecycle
    // -------------------------------------------------------------------------

    /// Load the persisted entry for an account into memory. Returns whether a
    /// persisted row existed.
    pub fn hydrate(&self, account_id: &str) -> bool {
        match self.store.get_setting(account_id, keys::RISK_STATE) {
            Ok(Some(value)) => match serde_json::from_value::<RiskEntry>(value) {
                Ok(entry) => {
                    debug!(account_id, equity = entry.equity, "risk entry hydrated");
                    self.entries
                        .write()
                        .insert(account_id.to_string(), Arc::new(Mutex::new(entry)));
                    true
                }
                Err(e) => {
                    warn!(account_id, error = %e, "persisted risk state unreadable");
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                warn!(account_id, error = %e, "risk state read failed");
                false
            }
        }
    }

    /// Ensure an entry exists, seeding from `balance_hint` when the store has
    /// nothing.
    pub fn warm(&self, account_id: &str, balance_hint: f64) {
        if self.entries.read().contains_key(account_id) {
            return;
        }
        if self.hydrate(account_id) {
            return;
        }
        info!(account_id, balance = balance_hint, "risk entry warmed from balance hint");
        self.entries.write().insert(
            account_id.to_string(),
            Arc::new(Mutex::new(RiskEntry::fresh(balance_hint, now_ms()))),
        );
        self.mark_dirty(account_id);
    }

    fn entry(&self, account_id: &str) -> Option<Arc<Mutex<RiskEntry>>> {
        let entry = self.entries.read().get(account_id).cloned()?;
        // TTL check: a long-stale in-memory entry yields to the store copy,
        // which another process may have advanced.
        let stale = {
            let e = entry.lock();
            now_ms() - e.last_updated_ms > ENTRY_TTL_MS
        };
        if stale && self.hydrate(account_id) {
            return self.entries.read().get(account_id).cloned();
        }
        Some(entry)
    }

    /// Rollover-adjusted snapshot of an account's entry.
    pub fn snapshot(&self, account_id: &str) -> Option<RiskEntry> {
        self.snapshot_at(account_id, now_ms())
    }

    pub fn snapshot_at(&self, account_id: &str, at_ms: i64) -> Option<RiskEntry> {
        let entry = self.entry(account_id)?;
        let mut e = entry.lock();
        e.maybe_rollover(at_ms);
        Some(e.clone())
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Reserve exposure for a trade about to be sent.
    pub fn record_trade_opened(
        &self,
        account_id: &str,
        stake: f64,
        max_concurrent: u32,
    ) -> OpenDecision {
        self.record_trade_opened_at(account_id, stake, max_concurrent, now_ms())
    }

    pub fn record_trade_opened_at(
        &self,
        account_id: &str,
        stake: f64,
        max_concurrent: u32,
        at_ms: i64,
    ) -> OpenDecision {
        let Some(entry) = self.entry(account_id) else {
            // Fail closed: opening against an uninitialized account is denied.
            return OpenDecision {
                allowed: false,
                reason: None,
            };
        };
        let mut e = entry.lock();
        e.maybe_rollover(at_ms);

        if max_concurrent > 0 && e.open_trade_count >= max_concurrent {
            return OpenDecision {
                allowed: false,
                reason: Some(RiskReason::MaxConcurrent),
            };
        }

        e.open_trade_count += 1;
        e.open_exposure += stake;
        e.last_trade_ms = Some(at_ms);
        e.last_updated_ms = at_ms;
        drop(e);

        self.mark_dirty(account_id);
        OpenDecision {
            allowed: true,
            reason: None,
        }
    }

    /// Undo the exposure bump of a trade that never reached the market.
    pub fn record_trade_failed_attempt(&self, account_id: &str, stake: f64) {
        let Some(entry) = self.entry(account_id) else {
            return;
        };
        let mut e = entry.lock();
        e.open_trade_count = e.open_trade_count.saturating_sub(1);
        e.open_exposure = (e.open_exposure - stake).max(0.0);
        e.last_updated_ms = now_ms();
        drop(e);
        self.mark_dirty(account_id);
    }

    /// Apply a settlement. `skip_exposure` suppresses the open-state release
    /// when the opening was not recorded in this process (crash recovery).
    pub fn record_trade_settled(
        &self,
        account_id: &str,
        stake: f64,
        profit: f64,
        skip_exposure: bool,
    ) {
        self.record_trade_settled_at(account_id, stake, profit, skip_exposure, now_ms());
    }

    pub fn record_trade_settled_at(
        &self,
        account_id: &str,
        stake: f64,
        profit: f64,
        skip_exposure: bool,
        at_ms: i64,
    ) {
        let Some(entry) = self.entry(account_id) else {
            warn!(account_id, "settlement for account without risk entry");
            return;
        };
        let mut e = entry.lock();
        e.maybe_rollover(at_ms);

        if !skip_exposure {
            e.open_trade_count = e.open_trade_count.saturating_sub(1);
            e.open_exposure = (e.open_exposure - stake).max(0.0);
        }

        e.daily_pnl += profit;
        e.equity += profit;

        if profit < 0.0 {
            e.total_loss_today += profit.abs();
            e.loss_streak += 1;
            e.consecutive_wins = 0;
            e.last_loss_ms = Some(at_ms);
        } else {
            e.total_profit_today += profit;
            e.consecutive_wins += 1;
            e.loss_streak = 0;
        }

        if e.equity > e.equity_peak {
            e.equity_peak = e.equity;
        }
        e.last_updated_ms = at_ms;

        debug!(
            account_id,
            profit,
            equity = e.equity,
            daily_pnl = e.daily_pnl,
            loss_streak = e.loss_streak,
            "trade settled into risk entry"
        );
        drop(e);
        self.mark_dirty(account_id);
    }

    /// Overwrite open-trade state wholesale (portfolio recovery).
    pub fn set_open_trade_state(&self, account_id: &str, count: u32, exposure: f64) {
        let Some(entry) = self.entry(account_id) else {
            return;
        };
        let mut e = entry.lock();
        e.open_trade_count = count;
        e.open_exposure = exposure.max(0.0);
        e.last_updated_ms = now_ms();
        drop(e);
        self.mark_dirty(account_id);
    }

    /// Apply an authoritative balance reading.
    pub fn update_equity(&self, account_id: &str, equity: f64) {
        let Some(entry) = self.entry(account_id) else {
            return;
        };
        let mut e = entry.lock();
        e.equity = equity;
        if equity > e.equity_peak {
            e.equity_peak = equity;
        }
        e.last_updated_ms = now_ms();
        drop(e);
        self.mark_dirty(account_id);
    }

    // -------------------------------------------------------------------------
    // Pre-trade evaluation
    // -------------------------------------------------------------------------

    /// Evaluate a proposed trade. Check order: max-concurrent → loss-streak
    /// cooldown → trade cooldown → daily loss → drawdown → stake limit.
    pub fn evaluate(&self, account_id: &str, params: &EvaluateParams) -> RiskVerdict {
        self.evaluate_at(account_id, params, now_ms())
    }

    pub fn evaluate_at(&self, account_id: &str, params: &EvaluateParams, at_ms: i64) -> RiskVerdict {
        let Some(entry) = self.entry(account_id) else {
            // Fail closed: no state means no trading.
            return RiskVerdict::halt("uninitialized");
        };
        let mut e = entry.lock();
        e.maybe_rollover(at_ms);

        if params.max_concurrent_trades > 0 && e.open_trade_count >= params.max_concurrent_trades {
            return RiskVerdict {
                status: RiskStatus::MaxConcurrent,
                reason: Some(RiskReason::MaxConcurrent.to_string()),
                cooldown_ms: None,
                capped_stake: None,
            };
        }

        if params.max_consecutive_losses > 0 && e.loss_streak >= params.max_consecutive_losses {
            if let Some(last_loss) = e.last_loss_ms {
                let elapsed = (at_ms - last_loss).max(0) as u64;
                if elapsed < params.loss_cooldown_ms {
                    return RiskVerdict::cooldown(
                        RiskReason::LossStreak,
                        params.loss_cooldown_ms - elapsed,
                    );
                }
            }
        }

        if params.cooldown_ms > 0 {
            if let Some(last_trade) = e.last_trade_ms {
                let elapsed = (at_ms - last_trade).max(0) as u64;
                if elapsed < params.cooldown_ms {
                    return RiskVerdict::cooldown(
                        RiskReason::TradeCooldown,
                        params.cooldown_ms - elapsed,
                    );
                }
            }
        }

        if params.daily_loss_limit_pct > 0.0 && e.daily_start_equity > 0.0 {
            let loss_pct = (-e.daily_pnl / e.daily_start_equity) * 100.0;
            if loss_pct >= params.daily_loss_limit_pct {
                return RiskVerdict::halt(RiskReason::DailyLoss.to_string());
            }
        }

        if params.drawdown_limit_pct > 0.0 && e.equity_peak > 0.0 {
            let drawdown_pct = ((e.equity_peak - e.equity) / e.equity_peak) * 100.0;
            if drawdown_pct >= params.drawdown_limit_pct {
                return RiskVerdict::halt(RiskReason::Drawdown.to_string());
            }
        }

        if params.max_stake > 0.0 && params.proposed_stake > params.max_stake {
            return RiskVerdict {
                status: RiskStatus::ReduceStake,
                reason: Some(RiskReason::StakeLimit.to_string()),
                cooldown_ms: None,
                capped_stake: Some(params.max_stake),
            };
        }

        RiskVerdict::ok()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Schedule a debounced snapshot write for an account.
    fn mark_dirty(&self, account_id: &str) {
        {
            let mut pending = self.pending_flush.lock();
            if !pending.insert(account_id.to_string()) {
                return;
            }
        }

        // Outside a runtime (pure unit tests) flush synchronously.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.flush_now(account_id);
            return;
        };

        let account = account_id.to_string();
        let entry = self.entries.read().get(&account).cloned();
        handle.spawn(flush_after(
            account,
            entry,
            self.writer.clone(),
            self.flush_debounce,
            self.pending_flush.clone(),
        ));
    }

    /// Immediately enqueue a snapshot write for an account.
    pub fn flush_now(&self, account_id: &str) {
        self.pending_flush.lock().remove(account_id);
        let Some(entry) = self.entries.read().get(account_id).cloned() else {
            return;
        };
        let snapshot = entry.lock().clone();
        if let Ok(value) = serde_json::to_value(&snapshot) {
            self.writer.enqueue(WriteOp::UpsertSetting {
                account_id: account_id.to_string(),
                key: keys::RISK_STATE.to_string(),
                value,
            });
        }
    }

    /// Flush every dirty account immediately (shutdown path).
    pub fn flush_all(&self) {
        let accounts: Vec<String> = self.entries.read().keys().cloned().collect();
        for account in accounts {
            self.flush_now(&account);
        }
    }
}

async fn flush_after(
    account_id: String,
    entry: Option<Arc<Mutex<RiskEntry>>>,
    writer: StoreWriter,
    debounce: Duration,
    pending: Arc<Mutex<HashSet<String>>>,
) {
    tokio::time::sleep(debounce).await;
    pending.lock().remove(&account_id);

    let Some(entry) = entry else { return };
    let snapshot = entry.lock().clone();
    if let Ok(value) = serde_json::to_value(&snapshot) {
        writer.enqueue(WriteOp::UpsertSetting {
            account_id,
            key: keys::RISK_STATE.to_string(),
            value,
        });
    }
}

impl std::fmt::Debug for RiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskCache")
            .field("accounts", &self.entries.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthMonitor;
    use crate::store::spawn_writer;

    fn cache() -> RiskCache {
        RiskCache::new(Arc::new(Store::open_in_memory().unwrap()), StoreWriter::detached())
    }

    fn params(proposed_stake: f64) -> EvaluateParams {
        EvaluateParams {
            proposed_stake,
            max_stake: 100.0,
            daily_loss_limit_pct: 2.0,
            drawdown_limit_pct: 10.0,
            max_consecutive_losses: 3,
            cooldown_ms: 0,
            loss_cooldown_ms: 60_000,
            max_concurrent_trades: 5,
        }
    }

    #[test]
    fn evaluate_fails_closed_without_entry() {
        let cache = cache();
        let verdict = cache.evaluate("acc-x", &params(1.0));
        assert_eq!(verdict.status, RiskStatus::Halt);
        assert_eq!(verdict.reason.as_deref(), Some("uninitialized"));
    }

    #[test]
    fn risk_gate_daily_loss() {
        let cache = cache();
        cache.warm("acc-1", 1000.0);

        // Three settled losses totalling -25 against a 2% limit of 1000.
        for loss in [-10.0, -10.0, -5.0] {
            cache.record_trade_opened("acc-1", 1.0, 5);
            cache.record_trade_settled("acc-1", 1.0, loss, false);
        }

        let verdict = cache.evaluate("acc-1", &EvaluateParams {
            loss_cooldown_ms: 0,
            max_consecutive_losses: 0,
            ..params(1.0)
        });
        assert_eq!(verdict.status, RiskStatus::Halt);
        assert_eq!(verdict.reason.as_deref(), Some("DAILY_LOSS"));
    }

    #[test]
    fn open_then_failed_attempt_restores_state() {
        let cache = cache();
        cache.warm("acc-1", 500.0);

        let before = cache.snapshot("acc-1").unwrap();
        let decision = cache.record_trade_opened("acc-1", 25.0, 5);
        assert!(decision.allowed);

        let mid = cache.snapshot("acc-1").unwrap();
        assert_eq!(mid.open_trade_count, before.open_trade_count + 1);
        assert!((mid.open_exposure - before.open_exposure - 25.0).abs() < 1e-9);

        cache.record_trade_failed_attempt("acc-1", 25.0);
        let after = cache.snapshot("acc-1").unwrap();
        assert_eq!(after.open_trade_count, before.open_trade_count);
        assert!((after.open_exposure - before.open_exposure).abs() < 1e-9);
    }

    #[test]
    fn day_rollover_resets_daily_fields_and_keeps_positions() {
        let cache = cache();
        let day1 = 1_709_200_000_000; // 2024-02-29 UTC
        let day2 = day1 + 24 * 60 * 60 * 1000;

        cache.warm("acc-1", 1000.0);
        cache.record_trade_opened_at("acc-1", 10.0, 5, day1);
        cache.record_trade_settled_at("acc-1", 0.0, -30.0, true, day1);
        cache.record_trade_settled_at("acc-1", 0.0, 12.0, true, day1);

        let before = cache.snapshot_at("acc-1", day1).unwrap();
        assert!((before.daily_pnl - (-18.0)).abs() < 1e-9);
        assert!(before.total_loss_today > 0.0);
        assert_eq!(before.open_trade_count, 1);

        let after = cache.snapshot_at("acc-1", day2).unwrap();
        assert_eq!(after.daily_pnl, 0.0);
        assert_eq!(after.total_loss_today, 0.0);
        assert_eq!(after.total_profit_today, 0.0);
        assert_eq!(after.loss_streak, 0);
        assert_eq!(after.consecutive_wins, 0);
        assert!((after.daily_start_equity - after.equity).abs() < 1e-9);
        // Open positions and the peak carry over.
        assert_eq!(after.open_trade_count, 1);
        assert!((after.equity_peak - before.equity_peak).abs() < 1e-9);
    }

    #[test]
    fn settlement_updates_streaks() {
        let cache = cache();
        cache.warm("acc-1", 100.0);

        cache.record_trade_settled("acc-1", 0.0, -1.0, true);
        cache.record_trade_settled("acc-1", 0.0, -1.0, true);
        let e = cache.snapshot("acc-1").unwrap();
        assert_eq!(e.loss_streak, 2);
        assert_eq!(e.consecutive_wins, 0);
        assert!(e.last_loss_ms.is_some());

        cache.record_trade_settled("acc-1", 0.0, 3.0, true);
        let e = cache.snapshot("acc-1").unwrap();
        assert_eq!(e.loss_streak, 0);
        assert_eq!(e.consecutive_wins, 1);
        assert!((e.total_profit_today - 3.0).abs() < 1e-9);
    }

    #[test]
    fn max_concurrent_checked_before_cooldowns() {
        let cache = cache();
        cache.warm("acc-1", 1000.0);

        let now = now_ms();
        for _ in 0..3 {
            cache.record_trade_opened_at("acc-1", 5.0, 5, now);
        }

        let verdict = cache.evaluate_at(
            "acc-1",
            &EvaluateParams {
                max_concurrent_trades: 3,
                cooldown_ms: 60_000, // would also trip, but concurrency wins
                ..params(1.0)
            },
            now,
        );
        assert_eq!(verdict.status, RiskStatus::MaxConcurrent);
        assert_eq!(verdict.reason.as_deref(), Some("MAX_CONCURRENT"));
    }

    #[test]
    fn loss_streak_cooldown_expires() {
        let cache = cache();
        cache.warm("acc-1", 1000.0);
        let now = now_ms();

        for _ in 0..3 {
            cache.record_trade_settled_at("acc-1", 0.0, -1.0, true, now);
        }

        let p = EvaluateParams {
            daily_loss_limit_pct: 0.0,
            ..params(1.0)
        };

        let during = cache.evaluate_at("acc-1", &p, now + 10_000);
        assert_eq!(during.status, RiskStatus::Cooldown);
        assert_eq!(during.reason.as_deref(), Some("LOSS_STREAK"));
        assert!(during.cooldown_ms.unwrap() <= 50_000);

        let after = cache.evaluate_at("acc-1", &p, now + 61_000);
        assert_eq!(after.status, RiskStatus::Ok);
    }

    #[test]
    fn trade_cooldown_reports_remaining() {
        let cache = cache();
        cache.warm("acc-1", 1000.0);
        let now = now_ms();
        cache.record_trade_opened_at("acc-1", 1.0, 5, now);
        cache.record_trade_settled_at("acc-1", 1.0, 0.5, false, now);

        let verdict = cache.evaluate_at(
            "acc-1",
            &EvaluateParams {
                cooldown_ms: 5_000,
                ..params(1.0)
            },
            now + 2_000,
        );
        assert_eq!(verdict.status, RiskStatus::Cooldown);
        assert_eq!(verdict.reason.as_deref(), Some("TRADE_COOLDOWN"));
        assert_eq!(verdict.cooldown_ms, Some(3_000));
    }

    #[test]
    fn drawdown_halts() {
        let cache = cache();
        cache.warm("acc-1", 1000.0);

        // Equity peak 1000, drop 150 => 15% > 10% limit.
        cache.record_trade_settled("acc-1", 0.0, -150.0, true);

        let verdict = cache.evaluate("acc-1", &EvaluateParams {
            daily_loss_limit_pct: 0.0,
            max_consecutive_losses: 0,
            ..params(1.0)
        });
        assert_eq!(verdict.status, RiskStatus::Halt);
        assert_eq!(verdict.reason.as_deref(), Some("DRAWDOWN"));
    }

    #[test]
    fn oversized_stake_reduces() {
        let cache = cache();
        cache.warm("acc-1", 1000.0);

        let verdict = cache.evaluate("acc-1", &params(250.0));
        assert_eq!(verdict.status, RiskStatus::ReduceStake);
        assert_eq!(verdict.reason.as_deref(), Some("STAKE_LIMIT"));
        assert_eq!(verdict.capped_stake, Some(100.0));
    }

    #[test]
    fn hydrate_reads_persisted_entry() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entry = RiskEntry::fresh(777.0, now_ms());
        store
            .upsert_setting("acc-1", keys::RISK_STATE, &serde_json::to_value(&entry).unwrap())
            .unwrap();

        let cache = RiskCache::new(store, StoreWriter::detached());
        assert!(cache.hydrate("acc-1"));
        assert_eq!(cache.snapshot("acc-1").unwrap().equity, 777.0);
    }

    #[test]
    fn warm_prefers_persisted_state_over_hint() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entry = RiskEntry::fresh(777.0, now_ms());
        store
            .upsert_setting("acc-1", keys::RISK_STATE, &serde_json::to_value(&entry).unwrap())
            .unwrap();

        let cache = RiskCache::new(store, StoreWriter::detached());
        cache.warm("acc-1", 50.0);
        assert_eq!(cache.snapshot("acc-1").unwrap().equity, 777.0);
    }

    #[tokio::test]
    async fn debounced_snapshot_reaches_the_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let writer = spawn_writer(store.clone(), Arc::new(HealthMonitor::new()));
        let cache = RiskCache::with_debounce(store.clone(), writer, Duration::from_millis(20));

        cache.warm("acc-1", 321.0);
        cache.record_trade_settled("acc-1", 0.0, 9.0, true);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let value = store.get_setting("acc-1", keys::RISK_STATE).unwrap().unwrap();
        let persisted: RiskEntry = serde_json::from_value(value).unwrap();
        assert_eq!(persisted.equity, 330.0);
    }

    #[test]
    fn persisted_shape_uses_contract_field_names() {
        let entry = RiskEntry::fresh(100.0, 0);
        let value = serde_json::to_value(&entry).unwrap();
        for key in [
            "date",
            "dailyStartEquity",
            "equityPeak",
            "equity",
            "dailyPnL",
            "totalLossToday",
            "totalProfitToday",
            "lossStreak",
            "consecutiveWins",
            "openExposure",
            "openTradeCount",
        ] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }
    }
}
