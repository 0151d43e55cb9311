// =============================================================================
// Execution Engine — proposal→buy pipeline with idempotency and rollback
// =============================================================================
//
// Pipeline per request:
//   validate → risk gate → intent reservation + pending ledger row →
//   exposure reservation → proposal (slippage guard) → buy → track open
//   contract for settlement.
//
// Idempotency: (account, correlation_id) is reserved before anything leaves
// the process; a fulfilled intent replays its stored result and a pending one
// rejects duplicates. The durable ledger row makes the settlement
// exactly-once across restarts.
//
// Any failure after the exposure bump rolls it back before surfacing the
// tagged error.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::health::HealthMonitor;
use crate::risk::cache::RiskCache;
use crate::risk::manager::{PreTradeLimits, RiskManager, SEND_TO_ACK_HISTOGRAM};
use crate::session::frames::requests;
use crate::session::Broker;
use crate::settlement::{OpenContract, SettlementReconciler};
use crate::store::{LedgerState, Store};
use crate::telemetry::Telemetry;
use crate::types::{now_ms, Direction, OrderMode};

use super::intents::{IntentLedger, ReserveOutcome};

// ---------------------------------------------------------------------------
// Request / result types
// ---------------------------------------------------------------------------

/// One execution request, produced by a strategy runner (or an operator).
#[derive(Debug, Clone)]
pub struct ExecParams {
    pub account_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub stake: f64,
    pub duration: u32,
    pub duration_unit: String,
    pub currency: String,
    /// Caller-supplied idempotency key.
    pub correlation_id: String,
    pub bot_run_id: Option<Uuid>,
    pub order_mode: OrderMode,
    /// Spot the signal was computed against (slippage reference).
    pub target_spot: Option<f64>,
    /// Slippage band in percent for HYBRID_LIMIT_MARKET.
    pub slippage_pct: Option<f64>,
    /// Concurrency cap applied at exposure reservation.
    pub max_concurrent_trades: u32,
    /// Receive stamp of the tick that produced the signal.
    pub tick_received: Option<Instant>,
}

/// Result stored in the intent ledger and returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub contract_id: i64,
    pub buy_price: f64,
    pub payout: f64,
    pub execution_time_ms: u64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    broker: Arc<dyn Broker>,
    risk: Arc<RiskManager>,
    cache: Arc<RiskCache>,
    settlements: Arc<SettlementReconciler>,
    store: Arc<Store>,
    intents: IntentLedger,
    telemetry: Arc<Telemetry>,
    health: Arc<HealthMonitor>,
    request_deadline: Duration,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        risk: Arc<RiskManager>,
        cache: Arc<RiskCache>,
        settlements: Arc<SettlementReconciler>,
        store: Arc<Store>,
        telemetry: Arc<Telemetry>,
        health: Arc<HealthMonitor>,
        intent_capacity: usize,
        intent_ttl_ms: u64,
        request_deadline: Duration,
    ) -> Self {
        Self {
            broker,
            risk,
            cache,
            settlements,
            store,
            intents: IntentLedger::new(intent_capacity, intent_ttl_ms),
            telemetry,
            health,
            request_deadline,
        }
    }

    /// Drop expired intents; called by the periodic sweep.
    pub fn evict_stale_intents(&self) {
        self.intents.evict_expired_now();
    }

    /// Execute one order with at-most-once upstream semantics per
    /// correlation id.
    pub async fn execute(
        &self,
        params: ExecParams,
        limits: &PreTradeLimits,
    ) -> Result<ExecutionOutcome, EngineError> {
        let started = Instant::now();

        // ── 1. Validation ───────────────────────────────────────────────
        validate(&params)?;
        let account = params.account_id.as_str();

        if self.health.circuit_open() {
            return Err(EngineError::KillSwitch("resource circuit open".to_string()));
        }

        // ── 2. Pre-trade risk gate ──────────────────────────────────────
        // A binary contract risks exactly its stake, so the notional at gate
        // time is the stake; the payout-based notional is rechecked after
        // the proposal prices it.
        self.risk
            .pre_trade_check(account, params.stake, params.stake, limits)?;

        // ── 3. Idempotency reservation + durable pending row ────────────
        match self.intents.reserve(account, &params.correlation_id) {
            ReserveOutcome::Replay(outcome) => {
                debug!(account, correlation_id = %params.correlation_id, "intent replayed");
                self.telemetry.incr("order.intent_replay");
                return Ok(outcome);
            }
            ReserveOutcome::Pending => {
                self.telemetry.incr("order.duplicate_rejected");
                return Err(EngineError::DuplicateRejected);
            }
            ReserveOutcome::Reserved => {}
        }

        let pending_payload = json!({
            "symbol": params.symbol,
            "direction": params.direction,
            "stake": params.stake,
            "bot_run_id": params.bot_run_id,
        });
        let inserted = self
            .store
            .insert_ledger(&params.correlation_id, account, &pending_payload)
            .map_err(|e| {
                self.intents.fail(account, &params.correlation_id, e.to_string());
                e
            })?;
        if !inserted {
            // A prior failed attempt left its row behind; rearm it.
            self.store
                .update_ledger(&params.correlation_id, LedgerState::Pending, Some(&pending_payload))
                .map_err(|e| {
                    self.intents.fail(account, &params.correlation_id, e.to_string());
                    e
                })?;
        }

        // ── 4. Exposure reservation ─────────────────────────────────────
        let decision =
            self.cache
                .record_trade_opened(account, params.stake, params.max_concurrent_trades);
        if !decision.allowed {
            self.intents.fail(account, &params.correlation_id, "risk rejected open");
            let _ = self
                .store
                .update_ledger(&params.correlation_id, LedgerState::Failed, None);
            return Err(match decision.reason {
                Some(reason) => EngineError::RiskGate(reason),
                None => EngineError::Validation("risk state uninitialized".to_string()),
            });
        }

        // ── 5..7. Upstream proposal + buy, with rollback on failure ─────
        match self.propose_and_buy(&params).await {
            Ok(mut outcome) => {
                outcome.execution_time_ms = started.elapsed().as_millis() as u64;
                self.intents
                    .fulfill(account, &params.correlation_id, outcome.clone());

                let in_flight_payload = json!({
                    "symbol": params.symbol,
                    "direction": params.direction,
                    "stake": params.stake,
                    "bot_run_id": params.bot_run_id,
                    "contract_id": outcome.contract_id,
                    "buy_price": outcome.buy_price,
                    "payout": outcome.payout,
                });
                if let Err(e) = self.store.update_ledger(
                    &params.correlation_id,
                    LedgerState::InFlight,
                    Some(&in_flight_payload),
                ) {
                    warn!(account, error = %e, "ledger in-flight update failed");
                }

                // ── 8. Settlement tracking ──────────────────────────────
                self.settlements
                    .watch(
                        account,
                        OpenContract {
                            contract_id: outcome.contract_id,
                            correlation_id: params.correlation_id.clone(),
                            symbol: params.symbol.clone(),
                            stake: params.stake,
                            payout: outcome.payout,
                            buy_price: outcome.buy_price,
                            opened_at_ms: now_ms(),
                            bot_run_id: params.bot_run_id,
                            last_mark: None,
                            unrealized_pnl: None,
                        },
                    )
                    .await;

                if let Some(tick_received) = params.tick_received {
                    self.telemetry
                        .record_duration("order.decision_to_order_us", tick_received.elapsed());
                }
                self.telemetry.incr("order.executed");
                info!(
                    account,
                    correlation_id = %params.correlation_id,
                    contract_id = outcome.contract_id,
                    buy_price = outcome.buy_price,
                    elapsed_ms = outcome.execution_time_ms,
                    "order executed"
                );
                Ok(outcome)
            }
            Err(e) => {
                // Roll back the exposure bump and fail the intent.
                self.cache.record_trade_failed_attempt(account, params.stake);
                self.intents.fail(account, &params.correlation_id, e.to_string());
                let _ = self
                    .store
                    .update_ledger(&params.correlation_id, LedgerState::Failed, None);

                if matches!(
                    e,
                    EngineError::UpstreamTransient { .. } | EngineError::UpstreamFatal { .. }
                ) {
                    self.risk.record_reject(account);
                }
                warn!(
                    account,
                    correlation_id = %params.correlation_id,
                    error = %e,
                    "order execution failed"
                );
                self.health.push_error(
                    format!("order {} failed: {e}", params.correlation_id),
                    Some(e.kind().to_string()),
                );
                Err(e)
            }
        }
    }

    /// Steps 5–6: price the contract, enforce the slippage band, buy.
    async fn propose_and_buy(&self, params: &ExecParams) -> Result<ExecutionOutcome, EngineError> {
        let account = params.account_id.as_str();

        let proposal_frame = requests::proposal(
            params.stake,
            params.direction.contract_type(),
            &params.currency,
            params.duration,
            &params.duration_unit,
            &params.symbol,
        );

        let send = Instant::now();
        let proposal = self
            .broker
            .request(account, proposal_frame, self.request_deadline)
            .await?;
        self.telemetry
            .record_duration(SEND_TO_ACK_HISTOGRAM, send.elapsed());

        let body = &proposal.payload["proposal"];
        let proposal_id = body["id"]
            .as_str()
            .ok_or_else(|| EngineError::Validation("proposal response missing id".to_string()))?
            .to_string();
        let ask_price = body["ask_price"].as_f64().unwrap_or(params.stake);
        let payout = body["payout"].as_f64().unwrap_or(0.0);
        let spot = body["spot"].as_f64();

        // Slippage guard: HYBRID_LIMIT_MARKET refuses a spot that drifted
        // outside the band since the signal was computed.
        if params.order_mode == OrderMode::HybridLimitMarket {
            if let (Some(target), Some(limit_pct), Some(spot)) =
                (params.target_spot, params.slippage_pct, spot)
            {
                if target != 0.0 {
                    let observed_pct = ((spot - target).abs() / target) * 100.0;
                    if observed_pct > limit_pct {
                        self.risk.record_slippage_reject(account);
                        return Err(EngineError::SlippageExceeded {
                            observed_pct,
                            limit_pct,
                        });
                    }
                }
            }
        }

        let send = Instant::now();
        let buy = self
            .broker
            .request(
                account,
                requests::buy(&proposal_id, ask_price),
                self.request_deadline,
            )
            .await?;
        self.telemetry
            .record_duration(SEND_TO_ACK_HISTOGRAM, send.elapsed());

        let body = &buy.payload["buy"];
        let contract_id = body["contract_id"]
            .as_i64()
            .ok_or_else(|| EngineError::Validation("buy response missing contract_id".to_string()))?;
        let buy_price = body["buy_price"].as_f64().unwrap_or(ask_price);

        Ok(ExecutionOutcome {
            contract_id,
            buy_price,
            payout,
            execution_time_ms: 0,
        })
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("intents", &self.intents)
            .finish()
    }
}

fn validate(params: &ExecParams) -> Result<(), EngineError> {
    if params.account_id.is_empty() {
        return Err(EngineError::Validation("account_id is empty".to_string()));
    }
    if params.symbol.is_empty() {
        return Err(EngineError::Validation("symbol is empty".to_string()));
    }
    if params.correlation_id.is_empty() {
        return Err(EngineError::Validation("correlation_id is empty".to_string()));
    }
    if params.currency.is_empty() {
        return Err(EngineError::Validation("currency is empty".to_string()));
    }
    if !params.stake.is_finite() || params.stake <= 0.0 {
        return Err(EngineError::Validation(format!(
            "stake must be positive and finite, got {}",
            params.stake
        )));
    }
    if params.duration == 0 {
        return Err(EngineError::Validation("duration must be positive".to_string()));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::cache::RiskCache;
    use crate::risk::kill_switch::KillSwitches;
    use crate::risk::manager::TriggerLimits;
    use crate::runs::RunArena;
    use crate::session::mock::MockBroker;
    use crate::store::{StoreWriter, GLOBAL_SCOPE};

    struct Rig {
        engine: ExecutionEngine,
        broker: Arc<MockBroker>,
        store: Arc<Store>,
        cache: Arc<RiskCache>,
        switches: Arc<KillSwitches>,
        reconciler: Arc<SettlementReconciler>,
        health: Arc<HealthMonitor>,
    }

    fn trading_broker() -> Arc<MockBroker> {
        Arc::new(MockBroker::new(|frame| {
            if frame.get("proposal").is_some() {
                Ok(json!({
                    "msg_type": "proposal",
                    "proposal": { "id": "prop-1", "ask_price": 1.02, "payout": 1.95, "spot": 100.0 },
                }))
            } else if frame.get("buy").is_some() {
                Ok(json!({
                    "msg_type": "buy",
                    "buy": { "contract_id": 424242, "buy_price": 1.02 },
                }))
            } else {
                Ok(json!({ "msg_type": "ok" }))
            }
        }))
    }

    fn rig_with(broker: Arc<MockBroker>) -> Rig {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let health = Arc::new(HealthMonitor::new());
        let telemetry = Arc::new(Telemetry::new());
        let cache = Arc::new(RiskCache::new(store.clone(), StoreWriter::detached()));
        let switches = Arc::new(KillSwitches::new(
            60_000,
            true,
            StoreWriter::detached(),
            health.clone(),
        ));
        let risk = Arc::new(RiskManager::new(
            switches.clone(),
            cache.clone(),
            telemetry.clone(),
            TriggerLimits {
                reject_spike_limit: 100,
                reconnect_storm_limit: 100,
                slippage_spike_limit: 100,
                max_cancels_per_second: 100,
                latency_p99_threshold_ms: 10_000,
                latency_breaches: 100,
            },
        ));
        let arena = Arc::new(RunArena::new(StoreWriter::detached()));
        let reconciler = Arc::new(SettlementReconciler::new(
            broker.clone(),
            store.clone(),
            StoreWriter::detached(),
            cache.clone(),
            arena,
            telemetry.clone(),
            health.clone(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        let engine = ExecutionEngine::new(
            broker.clone(),
            risk,
            cache.clone(),
            reconciler.clone(),
            store.clone(),
            telemetry,
            health.clone(),
            64,
            60_000,
            Duration::from_secs(1),
        );
        Rig {
            engine,
            broker,
            store,
            cache,
            switches,
            reconciler,
            health,
        }
    }

    fn rig() -> Rig {
        rig_with(trading_broker())
    }

    fn params(correlation_id: &str) -> ExecParams {
        ExecParams {
            account_id: "acc-1".to_string(),
            symbol: "R_100".to_string(),
            direction: Direction::Call,
            stake: 1.0,
            duration: 5,
            duration_unit: "t".to_string(),
            currency: "USD".to_string(),
            correlation_id: correlation_id.to_string(),
            bot_run_id: None,
            order_mode: OrderMode::Market,
            target_spot: None,
            slippage_pct: None,
            max_concurrent_trades: 5,
            tick_received: Some(Instant::now()),
        }
    }

    fn open_limits() -> PreTradeLimits {
        PreTradeLimits {
            max_order_size: 0.0,
            max_notional: 0.0,
            max_exposure: 0.0,
            orders_per_second: 0,
            orders_per_minute: 0,
        }
    }

    #[tokio::test]
    async fn duplicate_correlation_replay() {
        let rig = rig();
        rig.cache.warm("acc-1", 1000.0);

        let first = rig.engine.execute(params("C1"), &open_limits()).await.unwrap();
        assert_eq!(first.contract_id, 424242);

        let second = rig.engine.execute(params("C1"), &open_limits()).await.unwrap();
        assert_eq!(second.contract_id, 424242);

        // The upstream was touched exactly twice for the order itself
        // (proposal + buy), not four times.
        assert_eq!(rig.broker.sent_matching("\"proposal\":1"), 1);
        assert_eq!(rig.broker.sent_matching("\"buy\""), 1);

        // Exposure was reserved once.
        let entry = rig.cache.snapshot("acc-1").unwrap();
        assert_eq!(entry.open_trade_count, 1);
    }

    #[tokio::test]
    async fn pending_duplicate_is_rejected() {
        let rig = rig();
        rig.cache.warm("acc-1", 1000.0);

        // Simulate an in-flight request holding the reservation.
        assert!(matches!(
            rig.engine.intents.reserve("acc-1", "C7"),
            ReserveOutcome::Reserved
        ));

        let err = rig.engine.execute(params("C7"), &open_limits()).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRejected));
        assert_eq!(rig.broker.sent_matching("\"proposal\":1"), 0);
    }

    #[tokio::test]
    async fn successful_execution_tracks_contract_and_ledger() {
        let rig = rig();
        rig.cache.warm("acc-1", 1000.0);

        rig.engine.execute(params("C2"), &open_limits()).await.unwrap();

        let row = rig.store.ledger_row("C2").unwrap().unwrap();
        assert_eq!(row.state, LedgerState::InFlight);
        assert_eq!(row.trade_payload["contract_id"], 424242);

        let open = rig.reconciler.open_contracts("acc-1");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].contract_id, 424242);
        assert_eq!(open[0].correlation_id, "C2");
    }

    #[tokio::test]
    async fn upstream_rejection_rolls_back_exposure() {
        let broker = Arc::new(MockBroker::new(|frame| {
            if frame.get("proposal").is_some() {
                Ok(json!({
                    "msg_type": "proposal",
                    "error": { "code": "InsufficientBalance", "message": "no funds" },
                }))
            } else {
                Ok(json!({ "msg_type": "ok" }))
            }
        }));
        let rig = rig_with(broker);
        rig.cache.warm("acc-1", 1000.0);

        let before = rig.cache.snapshot("acc-1").unwrap();
        let err = rig.engine.execute(params("C3"), &open_limits()).await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamFatal { .. }));

        let after = rig.cache.snapshot("acc-1").unwrap();
        assert_eq!(after.open_trade_count, before.open_trade_count);
        assert!((after.open_exposure - before.open_exposure).abs() < 1e-9);

        let row = rig.store.ledger_row("C3").unwrap().unwrap();
        assert_eq!(row.state, LedgerState::Failed);
    }

    #[tokio::test]
    async fn slippage_guard_rejects_drifted_spot() {
        let rig = rig();
        rig.cache.warm("acc-1", 1000.0);

        let mut p = params("C4");
        p.order_mode = OrderMode::HybridLimitMarket;
        p.target_spot = Some(98.0); // proposal spot is 100.0 -> ~2.04%
        p.slippage_pct = Some(1.0);

        let err = rig.engine.execute(p, &open_limits()).await.unwrap_err();
        assert!(matches!(err, EngineError::SlippageExceeded { .. }));

        // Proposal went out, the buy never did.
        assert_eq!(rig.broker.sent_matching("\"proposal\":1"), 1);
        assert_eq!(rig.broker.sent_matching("\"buy\""), 0);

        // Exposure rolled back.
        let entry = rig.cache.snapshot("acc-1").unwrap();
        assert_eq!(entry.open_trade_count, 0);
    }

    #[tokio::test]
    async fn slippage_within_band_passes() {
        let rig = rig();
        rig.cache.warm("acc-1", 1000.0);

        let mut p = params("C5");
        p.order_mode = OrderMode::HybridLimitMarket;
        p.target_spot = Some(99.95); // ~0.05% drift
        p.slippage_pct = Some(1.0);

        assert!(rig.engine.execute(p, &open_limits()).await.is_ok());
    }

    #[tokio::test]
    async fn kill_switch_refuses_orders() {
        let rig = rig();
        rig.cache.warm("acc-1", 1000.0);
        rig.switches.trigger(GLOBAL_SCOPE, "LATENCY_BLOWOUT", false);

        let err = rig.engine.execute(params("C6"), &open_limits()).await.unwrap_err();
        assert!(matches!(err, EngineError::KillSwitch(_)));
        assert_eq!(rig.broker.sent_count(), 0);
    }

    #[tokio::test]
    async fn validation_rejects_bad_stake() {
        let rig = rig();
        rig.cache.warm("acc-1", 1000.0);

        let mut p = params("C8");
        p.stake = 0.0;
        assert!(matches!(
            rig.engine.execute(p, &open_limits()).await.unwrap_err(),
            EngineError::Validation(_)
        ));

        let mut p = params("C9");
        p.stake = f64::NAN;
        assert!(matches!(
            rig.engine.execute(p, &open_limits()).await.unwrap_err(),
            EngineError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn resource_circuit_refuses_orders() {
        let rig = rig();
        rig.cache.warm("acc-1", 1000.0);

        // Force the circuit open.
        for _ in 0..5 {
            rig.health
                .observe_lag(Duration::from_secs(1), Duration::from_millis(100));
        }
        assert!(rig.health.circuit_open());

        let err = rig.engine.execute(params("C10"), &open_limits()).await.unwrap_err();
        assert!(matches!(err, EngineError::KillSwitch(_)));
    }

    #[tokio::test]
    async fn end_to_end_settlement_after_execution() {
        let rig = rig();
        rig.cache.warm("acc-1", 1000.0);

        rig.engine.execute(params("C11"), &open_limits()).await.unwrap();

        rig.broker.push_streaming(
            "acc-1",
            json!({
                "msg_type": "proposal_open_contract",
                "proposal_open_contract": { "contract_id": 424242, "is_sold": true, "profit": 0.93 },
            }),
        );

        let entry = rig.cache.snapshot("acc-1").unwrap();
        assert_eq!(entry.open_trade_count, 0);
        assert!((entry.daily_pnl - 0.93).abs() < 1e-9);
        let row = rig.store.ledger_row("C11").unwrap().unwrap();
        assert_eq!(row.state, LedgerState::Settled);
    }
}
