// =============================================================================
// Strategy Runner — per-run tick pipeline from signal to order
// =============================================================================
//
// One handle per active bot run. Ticks arrive through the tick-stream
// listener, optionally micro-batched, and drive the evaluation cycle:
//
//   kill switch → required window → volatility guard → cooldown →
//   evaluate (compute budget) → stake sizing → risk cache verdict →
//   dispatch to the execution engine with a fresh correlation id.
//
// Strategy evaluation is synchronous and bounded by the compute budget; the
// only suspension on the hot path is the dispatched order itself, which runs
// on its own task.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::execution::engine::{ExecParams, ExecutionEngine};
use crate::indicators::tick_atr;
use crate::market::ring::Tick;
use crate::market::MarketData;
use crate::market::tick_stream::TickStreams;
use crate::risk::cache::{RiskCache, RiskStatus};
use crate::risk::kill_switch::{KillSwitchEvent, KillSwitches};
use crate::runs::{BotRun, RunArena};
use crate::store::GLOBAL_SCOPE;
use crate::telemetry::Telemetry;
use crate::types::{now_ms, OrderMode, RunStatus};

use super::strategies::{strategy_by_id, Evaluation, Strategy};

/// Pause reason used when the volatility guard trips.
const VOLATILITY_PAUSE_REASON: &str = "Volatility spike guard";

// ---------------------------------------------------------------------------
// Run handle
// ---------------------------------------------------------------------------

struct RunHandle {
    run_id: Uuid,
    account_id: String,
    symbol: String,
    run: Arc<RwLock<BotRun>>,
    strategy: Arc<dyn Strategy>,
    pending: Mutex<Vec<Tick>>,
    tick_listener_id: AtomicU64,
    batch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

enum CycleDecision {
    Skip,
    VolatilitySpike,
    BudgetOverrun,
    Signal(Evaluation, f64 /* spot */),
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct StrategyRunner {
    arena: Arc<RunArena>,
    ticks: Arc<TickStreams>,
    market: Arc<MarketData>,
    cache: Arc<RiskCache>,
    switches: Arc<KillSwitches>,
    engine: Arc<ExecutionEngine>,
    telemetry: Arc<Telemetry>,
    default_budget_ms: u64,
    active: RwLock<HashMap<Uuid, Arc<RunHandle>>>,
}

impl StrategyRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arena: Arc<RunArena>,
        ticks: Arc<TickStreams>,
        market: Arc<MarketData>,
        cache: Arc<RiskCache>,
        switches: Arc<KillSwitches>,
        engine: Arc<ExecutionEngine>,
        telemetry: Arc<Telemetry>,
        default_budget_ms: u64,
    ) -> Self {
        Self {
            arena,
            ticks,
            market,
            cache,
            switches,
            engine,
            telemetry,
            default_budget_ms,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Pause running bots when their account's (or the global) kill switch
    /// trips. Call once at startup.
    pub fn register_kill_switch_listener(self: &Arc<Self>) {
        let runner = self.clone();
        self.switches.add_listener(Arc::new(move |event: &KillSwitchEvent| {
            if !event.active {
                return;
            }
            let reason = format!("kill switch: {}", event.reason);
            let handles: Vec<Arc<RunHandle>> = runner.active.read().values().cloned().collect();
            for handle in handles {
                if event.scope == GLOBAL_SCOPE || event.scope == handle.account_id {
                    runner.pause_run(&handle.run_id, reason.clone());
                }
            }
        }));
    }

    /// Number of active (started, not stopped) runs.
    pub fn active_runs(&self) -> usize {
        self.active.read().len()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start a run by id, resolving its strategy from the registry.
    pub async fn start(self: &Arc<Self>, run_id: &Uuid) -> Result<(), crate::errors::EngineError> {
        let run = self
            .arena
            .get(run_id)
            .ok_or_else(|| crate::errors::EngineError::Validation(format!("unknown bot run {run_id}")))?;
        let strategy_id = run.read().strategy_id.clone();
        let strategy = strategy_by_id(&strategy_id).ok_or_else(|| {
            crate::errors::EngineError::Validation(format!("unknown strategy '{strategy_id}'"))
        })?;
        self.start_with_strategy(run, strategy).await
    }

    /// Start a run with an explicit strategy instance.
    pub async fn start_with_strategy(
        self: &Arc<Self>,
        run: Arc<RwLock<BotRun>>,
        strategy: Arc<dyn Strategy>,
    ) -> Result<(), crate::errors::EngineError> {
        let (run_id, account_id, symbol) = {
            let r = run.read();
            (r.id, r.account_id.clone(), r.symbol.clone())
        };

        self.arena.set_status(&run_id, RunStatus::Running, None)?;

        let handle = Arc::new(RunHandle {
            run_id,
            account_id: account_id.clone(),
            symbol: symbol.clone(),
            run,
            strategy,
            pending: Mutex::new(Vec::new()),
            tick_listener_id: AtomicU64::new(0),
            batch_task: Mutex::new(None),
        });
        self.active.write().insert(run_id, handle.clone());

        // Tick listener: feed market features, then run the cycle.
        let runner = self.clone();
        let listener_handle = handle.clone();
        let listener_id = self
            .ticks
            .subscribe(
                &account_id,
                &symbol,
                Arc::new(move |tick| {
                    runner.market.on_tick(&listener_handle.account_id, tick);
                    runner.on_tick(&listener_handle, tick);
                }),
            )
            .await?;
        handle.tick_listener_id.store(listener_id, Ordering::SeqCst);

        // Depth is best-effort: symbols without order-book support fall back
        // to synthetic features.
        if let Err(e) = self.market.books().subscribe(&account_id, &symbol).await {
            debug!(account_id = %account_id, symbol = %symbol, error = %e, "order book unavailable");
        }

        // Interval-based micro-batch flush.
        let (batch_size, interval_ms) = {
            let r = handle.run.read();
            (r.tuning.batch_size, r.tuning.batch_interval_ms)
        };
        if interval_ms > 0 {
            let runner = self.clone();
            let timer_handle = handle.clone();
            let task = tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if !runner.active.read().contains_key(&timer_handle.run_id) {
                        break;
                    }
                    runner.flush_batch(&timer_handle);
                }
            });
            *handle.batch_task.lock() = Some(task);
        }

        info!(
            run_id = %run_id,
            account_id = %account_id,
            symbol = %symbol,
            batch_size,
            interval_ms,
            "bot run started"
        );
        Ok(())
    }

    pub fn pause(&self, run_id: &Uuid, reason: impl Into<String>) {
        self.pause_run(run_id, reason.into());
    }

    fn pause_run(&self, run_id: &Uuid, reason: String) {
        if let Err(e) = self.arena.set_status(run_id, RunStatus::Paused, Some(reason)) {
            debug!(run_id = %run_id, error = %e, "pause skipped");
        }
    }

    pub fn resume(&self, run_id: &Uuid) -> Result<(), crate::errors::EngineError> {
        self.arena.set_status(run_id, RunStatus::Running, None)
    }

    /// Stop a run: unsubscribe, cancel the batch timer, discard the current
    /// batch, and drop the handle.
    pub async fn stop(&self, run_id: &Uuid) {
        let Some(handle) = self.active.write().remove(run_id) else {
            return;
        };

        if let Some(task) = handle.batch_task.lock().take() {
            task.abort();
        }
        handle.pending.lock().clear();
        self.telemetry.set_gauge("strategy.queue_depth", 0);

        let listener_id = handle.tick_listener_id.load(Ordering::SeqCst);
        if listener_id != 0 {
            if let Err(e) = self
                .ticks
                .unsubscribe(&handle.account_id, &handle.symbol, listener_id)
                .await
            {
                warn!(run_id = %run_id, error = %e, "tick unsubscribe failed on stop");
            }
        }

        let _ = self.arena.set_status(run_id, RunStatus::Stopped, None);
        info!(run_id = %run_id, "bot run stopped");
    }

    /// Stop every active run (shutdown path).
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.active.read().keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    // -------------------------------------------------------------------------
    // Tick pipeline
    // -------------------------------------------------------------------------

    fn on_tick(&self, handle: &Arc<RunHandle>, tick: &Tick) {
        let (batch_size, interval_ms) = {
            let r = handle.run.read();
            (r.tuning.batch_size.max(1), r.tuning.batch_interval_ms)
        };

        // Identity tuning dispatches immediately.
        if batch_size <= 1 && interval_ms == 0 {
            self.process_cycle(handle, tick);
            return;
        }

        let flush_now = {
            let mut pending = handle.pending.lock();
            pending.push(tick.clone());
            self.telemetry
                .set_gauge("strategy.queue_depth", pending.len() as i64);
            pending.len() >= batch_size
        };
        if flush_now {
            self.flush_batch(handle);
        }
    }

    /// Collapse the pending batch to its most recent tick and evaluate once.
    fn flush_batch(&self, handle: &Arc<RunHandle>) {
        let last = {
            let mut pending = handle.pending.lock();
            let last = pending.pop();
            pending.clear();
            self.telemetry.set_gauge("strategy.queue_depth", 0);
            last
        };
        if let Some(tick) = last {
            self.process_cycle(handle, &tick);
        }
    }

    /// One core evaluation cycle for one tick.
    fn process_cycle(&self, handle: &Arc<RunHandle>, tick: &Tick) {
        let run = handle.run.read().clone();
        if run.status != RunStatus::Running {
            return;
        }

        // 1. Kill switch.
        if self.switches.is_active(&handle.account_id) {
            let reason = self
                .switches
                .active_reason(&handle.account_id)
                .unwrap_or_else(|| "active".to_string());
            self.pause_run(&handle.run_id, format!("kill switch: {reason}"));
            return;
        }

        // 2–6. Window gate, volatility guard, cooldown, evaluation.
        let required = handle.strategy.required_ticks();
        let vol_window = run.risk.volatility_window.max(1);
        let window_n = required.max(vol_window + 1);

        let decision = self
            .ticks
            .with_window(&handle.account_id, &handle.symbol, window_n, |window| {
                if window.len() < required {
                    return CycleDecision::Skip;
                }

                // 3. Volatility guard.
                if let Some(threshold) = run.risk.volatility_threshold {
                    let quotes: Vec<f64> = window.quotes().collect();
                    let tail_start = quotes.len().saturating_sub(vol_window + 1);
                    if let Some(atr) = tick_atr(&quotes[tail_start..], vol_window) {
                        if atr > threshold {
                            return CycleDecision::VolatilitySpike;
                        }
                    }
                }

                // 4. Cooldown.
                if run.cooldown_ms > 0 {
                    if let Some(last_trade) = run.last_trade_at_ms {
                        if (now_ms() - last_trade) < run.cooldown_ms as i64 {
                            return CycleDecision::Skip;
                        }
                    }
                }

                // 5. Evaluate under the compute budget.
                let features = self.market.features(&handle.account_id, &handle.symbol);
                let started = Instant::now();
                let evaluation = handle.strategy.evaluate(&window, Some(&features));
                let elapsed = started.elapsed();
                self.telemetry.record_duration("strategy.compute_us", elapsed);

                let budget_ms = run
                    .tuning
                    .compute_budget_ms
                    .unwrap_or(self.default_budget_ms);
                if budget_ms > 0 && elapsed.as_millis() as u64 > budget_ms {
                    return CycleDecision::BudgetOverrun;
                }

                // 6. No signal: done.
                match evaluation.signal {
                    None => CycleDecision::Skip,
                    Some(_) => {
                        let spot = window.last().map(|t| t.quote).unwrap_or(tick.quote);
                        CycleDecision::Signal(evaluation, spot)
                    }
                }
            });

        let decision = match decision {
            Some(d) => d,
            None => return,
        };

        match decision {
            CycleDecision::Skip => {}
            CycleDecision::BudgetOverrun => {
                self.telemetry.incr("strategy.budget_overrun");
                warn!(run_id = %handle.run_id, "strategy compute budget exceeded — signal discarded");
            }
            CycleDecision::VolatilitySpike => {
                self.switches
                    .trigger(&handle.account_id, "VOLATILITY_SPIKE", false);
                self.pause_run(&handle.run_id, VOLATILITY_PAUSE_REASON.to_string());
            }
            CycleDecision::Signal(evaluation, spot) => {
                self.dispatch_signal(handle, &run, evaluation, spot, tick);
            }
        }
    }

    /// Steps 7–9: stake sizing, risk verdict, handoff to execution.
    fn dispatch_signal(
        &self,
        handle: &Arc<RunHandle>,
        run: &BotRun,
        evaluation: Evaluation,
        spot: f64,
        tick: &Tick,
    ) {
        let direction = match evaluation.signal {
            Some(d) => d,
            None => return,
        };

        // 7. Stake sizing.
        let mut stake =
            (run.base_stake * evaluation.stake_multiplier).clamp(run.min_stake, run.max_stake);

        // 8. Risk cache verdict.
        let verdict = self.cache.evaluate(&handle.account_id, &run.evaluate_params(stake));
        match verdict.status {
            RiskStatus::Halt => {
                let reason = verdict.reason.unwrap_or_else(|| "risk halt".to_string());
                self.pause_run(&handle.run_id, reason);
                return;
            }
            RiskStatus::MaxConcurrent | RiskStatus::Cooldown => return,
            RiskStatus::ReduceStake => {
                if let Some(capped) = verdict.capped_stake {
                    stake = capped;
                }
            }
            RiskStatus::Ok => {}
        }

        // 9. Dispatch with a fresh correlation id.
        let correlation_id = Uuid::new_v4().to_string();
        let order_mode = if run.risk.slippage_pct.is_some() {
            OrderMode::HybridLimitMarket
        } else {
            OrderMode::Market
        };
        let params = ExecParams {
            account_id: handle.account_id.clone(),
            symbol: handle.symbol.clone(),
            direction,
            stake,
            duration: run.duration,
            duration_unit: run.duration_unit.clone(),
            currency: run.currency.clone(),
            correlation_id: correlation_id.clone(),
            bot_run_id: Some(handle.run_id),
            order_mode,
            target_spot: Some(spot),
            slippage_pct: run.risk.slippage_pct,
            max_concurrent_trades: run.risk.max_concurrent_trades,
            tick_received: Some(tick.received),
        };
        let limits = run.pre_trade_limits();

        debug!(
            run_id = %handle.run_id,
            direction = %direction,
            stake,
            confidence = evaluation.confidence,
            correlation_id = %correlation_id,
            "signal dispatched"
        );

        // Cooldown starts at dispatch, not at fill.
        handle.run.write().last_trade_at_ms = Some(now_ms());

        let engine = self.engine.clone();
        let arena = self.arena.clone();
        let run_id = handle.run_id;
        tokio::spawn(async move {
            match engine.execute(params, &limits).await {
                Ok(outcome) => {
                    arena.record_trade(&run_id, now_ms());
                    debug!(run_id = %run_id, contract_id = outcome.contract_id, "order filled");
                }
                Err(e) => {
                    debug!(run_id = %run_id, error = %e, "dispatched order failed");
                }
            }
        });
    }
}

impl std::fmt::Debug for StrategyRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRunner")
            .field("active_runs", &self.active.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
