// =============================================================================
// Risk Manager — pre-trade gate and automatic kill-switch triggers
// =============================================================================
//
// The pre-trade gate runs before any order leaves the process: kill switch,
// order size, notional, exposure, orders/sec, orders/min. Rolling event
// counters (cancels, rejects, reconnects, slippage rejects) feed the
// automatic triggers; the latency sweep watches the send→ack p99.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::{EngineError, RiskReason};
use crate::store::GLOBAL_SCOPE;
use crate::telemetry::Telemetry;

use super::cache::RiskCache;
use super::counters::AccountCounters;
use super::kill_switch::KillSwitches;

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60_000;

/// Histogram watched by the latency sweep.
pub const SEND_TO_ACK_HISTOGRAM: &str = "order.send_to_ack_us";

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Per-run limits enforced by the pre-trade gate. Zero disables a check.
#[derive(Debug, Clone)]
pub struct PreTradeLimits {
    pub max_order_size: f64,
    pub max_notional: f64,
    pub max_exposure: f64,
    pub orders_per_second: u32,
    pub orders_per_minute: u32,
}

impl Default for PreTradeLimits {
    fn default() -> Self {
        Self {
            max_order_size: 0.0,
            max_notional: 0.0,
            max_exposure: 0.0,
            orders_per_second: 3,
            orders_per_minute: 30,
        }
    }
}

/// Spike limits lifted from the engine config.
#[derive(Debug, Clone)]
pub struct TriggerLimits {
    pub reject_spike_limit: u32,
    pub reconnect_storm_limit: u32,
    pub slippage_spike_limit: u32,
    pub max_cancels_per_second: u32,
    pub latency_p99_threshold_ms: u64,
    pub latency_breaches: u32,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct RiskManager {
    switches: Arc<KillSwitches>,
    cache: Arc<RiskCache>,
    counters: AccountCounters,
    telemetry: Arc<Telemetry>,
    limits: TriggerLimits,
    latency_breach_streak: AtomicU32,
}

impl RiskManager {
    pub fn new(
        switches: Arc<KillSwitches>,
        cache: Arc<RiskCache>,
        telemetry: Arc<Telemetry>,
        limits: TriggerLimits,
    ) -> Self {
        Self {
            switches,
            cache,
            counters: AccountCounters::new(),
            telemetry,
            limits,
            latency_breach_streak: AtomicU32::new(0),
        }
    }

    pub fn switches(&self) -> &Arc<KillSwitches> {
        &self.switches
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Gate one order. On success the order-rate counters are consumed.
    pub fn pre_trade_check(
        &self,
        account_id: &str,
        stake: f64,
        notional: f64,
        limits: &PreTradeLimits,
    ) -> Result<(), EngineError> {
        self.pre_trade_check_at(account_id, stake, notional, limits, crate::types::now_ms())
    }

    pub fn pre_trade_check_at(
        &self,
        account_id: &str,
        stake: f64,
        notional: f64,
        limits: &PreTradeLimits,
        at_ms: i64,
    ) -> Result<(), EngineError> {
        if self.switches.is_active_at(account_id, at_ms) {
            let reason = self
                .switches
                .active_reason(account_id)
                .unwrap_or_else(|| "active".to_string());
            return Err(EngineError::KillSwitch(reason));
        }

        if limits.max_order_size > 0.0 && stake > limits.max_order_size {
            return Err(EngineError::RiskGate(RiskReason::MaxOrderSize));
        }

        if limits.max_notional > 0.0 && notional > limits.max_notional {
            return Err(EngineError::RiskGate(RiskReason::MaxNotional));
        }

        if limits.max_exposure > 0.0 {
            let exposure = self
                .cache
                .snapshot_at(account_id, at_ms)
                .map(|e| e.open_exposure)
                .unwrap_or(0.0);
            if exposure + stake > limits.max_exposure {
                return Err(EngineError::RiskGate(RiskReason::MaxExposure));
            }
        }

        if limits.orders_per_second > 0
            && self.counters.count_at(account_id, "orders_1s", SECOND_MS, at_ms)
                >= limits.orders_per_second
        {
            return Err(EngineError::RiskGate(RiskReason::OrdersPerSecond));
        }
        if limits.orders_per_minute > 0
            && self.counters.count_at(account_id, "orders_60s", MINUTE_MS, at_ms)
                >= limits.orders_per_minute
        {
            return Err(EngineError::RiskGate(RiskReason::OrdersPerMinute));
        }

        self.counters.incr_at(account_id, "orders_1s", SECOND_MS, at_ms);
        self.counters.incr_at(account_id, "orders_60s", MINUTE_MS, at_ms);
        debug!(account_id, stake, notional, "pre-trade gate passed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Event counters feeding automatic triggers
    // -------------------------------------------------------------------------

    pub fn record_cancel(&self, account_id: &str) {
        self.record_cancel_at(account_id, crate::types::now_ms());
    }

    pub fn record_cancel_at(&self, account_id: &str, at_ms: i64) {
        let count = self.counters.incr_at(account_id, "cancels_1s", SECOND_MS, at_ms);
        self.telemetry.incr("risk.cancel");
        if self.limits.max_cancels_per_second > 0 && count > self.limits.max_cancels_per_second {
            self.trip(account_id, "CANCEL_RATE_SPIKE", at_ms);
        }
    }

    pub fn record_reject(&self, account_id: &str) {
        self.record_reject_at(account_id, crate::types::now_ms());
    }

    pub fn record_reject_at(&self, account_id: &str, at_ms: i64) {
        let count = self.counters.incr_at(account_id, "rejects_60s", MINUTE_MS, at_ms);
        self.telemetry.incr("risk.reject");
        if self.limits.reject_spike_limit > 0 && count > self.limits.reject_spike_limit {
            self.trip(account_id, "REJECT_SPIKE", at_ms);
        }
    }

    pub fn record_reconnect(&self, account_id: &str) {
        self.record_reconnect_at(account_id, crate::types::now_ms());
    }

    pub fn record_reconnect_at(&self, account_id: &str, at_ms: i64) {
        let count = self
            .counters
            .incr_at(account_id, "reconnects_60s", MINUTE_MS, at_ms);
        self.telemetry.incr("risk.reconnect");
        if self.limits.reconnect_storm_limit > 0 && count > self.limits.reconnect_storm_limit {
            self.trip(account_id, "RECONNECT_STORM", at_ms);
        }
    }

    pub fn record_slippage_reject(&self, account_id: &str) {
        self.record_slippage_reject_at(account_id, crate::types::now_ms());
    }

    pub fn record_slippage_reject_at(&self, account_id: &str, at_ms: i64) {
        let count = self
            .counters
            .incr_at(account_id, "slippage_60s", MINUTE_MS, at_ms);
        self.telemetry.incr("order.slippage_reject");
        if self.limits.slippage_spike_limit > 0 && count > self.limits.slippage_spike_limit {
            self.trip(account_id, "SLIPPAGE_SPIKE", at_ms);
        }
    }

    fn trip(&self, account_id: &str, reason: &str, at_ms: i64) {
        if self.switches.entry(account_id).is_some_and(|e| e.active) {
            return;
        }
        warn!(account_id, reason, "automatic kill-switch trigger");
        self.switches.trigger_at(account_id, reason, false, at_ms);
    }

    // -------------------------------------------------------------------------
    // Latency sweep
    // -------------------------------------------------------------------------

    /// One latency window evaluation. Called by the periodic sweep every
    /// `LATENCY_BLOWOUT_WINDOW_MS`. N consecutive windows over the p99
    /// threshold trip the global switch.
    pub fn latency_sweep(&self) {
        let Some(p99_us) = self.telemetry.percentile_us(SEND_TO_ACK_HISTOGRAM, 0.99) else {
            self.latency_breach_streak.store(0, Ordering::Relaxed);
            return;
        };

        let threshold_us = self.limits.latency_p99_threshold_ms as f64 * 1_000.0;
        if p99_us > threshold_us {
            let streak = self.latency_breach_streak.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                p99_ms = p99_us / 1_000.0,
                threshold_ms = self.limits.latency_p99_threshold_ms,
                streak,
                "send→ack p99 over threshold"
            );
            if streak >= self.limits.latency_breaches {
                self.latency_breach_streak.store(0, Ordering::Relaxed);
                if !self.switches.entry(GLOBAL_SCOPE).is_some_and(|e| e.active) {
                    self.switches.trigger(GLOBAL_SCOPE, "LATENCY_BLOWOUT", false);
                }
            }
        } else {
            self.latency_breach_streak.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("limits", &self.limits)
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
    use crate::store::{Store, StoreWriter};

    fn limits() -> TriggerLimits {
        TriggerLimits {
            reject_spike_limit: 3,
            reconnect_storm_limit: 2,
            slippage_spike_limit: 2,
            max_cancels_per_second: 2,
            latency_p99_threshold_ms: 100,
            latency_breaches: 2,
        }
    }

    fn manager() -> (RiskManager, Arc<KillSwitches>, Arc<RiskCache>, Arc<Telemetry>) {
        let health = Arc::new(HealthMonitor::new());
        let switches = Arc::new(KillSwitches::new(
            60_000,
            true,
            StoreWriter::detached(),
            health,
        ));
        let cache = Arc::new(RiskCache::new(
            Arc::new(Store::open_in_memory().unwrap()),
            StoreWriter::detached(),
        ));
        let telemetry = Arc::new(Telemetry::new());
        let mgr = RiskManager::new(switches.clone(), cache.clone(), telemetry.clone(), limits());
        (mgr, switches, cache, telemetry)
    }

    fn open_limits() -> PreTradeLimits {
        PreTradeLimits {
            max_order_size: 50.0,
            max_notional: 100.0,
            max_exposure: 200.0,
            orders_per_second: 2,
            orders_per_minute: 10,
        }
    }

    #[test]
    fn gate_rejects_oversized_order() {
        let (mgr, _, cache, _) = manager();
        cache.warm("acc-1", 1000.0);

        let err = mgr
            .pre_trade_check_at("acc-1", 60.0, 60.0, &open_limits(), 1_000)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::RiskGate(RiskReason::MaxOrderSize)
        ));
    }

    #[test]
    fn gate_rejects_notional_and_exposure() {
        let (mgr, _, cache, _) = manager();
        cache.warm("acc-1", 1000.0);

        let err = mgr
            .pre_trade_check_at("acc-1", 40.0, 150.0, &open_limits(), 1_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::RiskGate(RiskReason::MaxNotional)));

        cache.set_open_trade_state("acc-1", 4, 180.0);
        let err = mgr
            .pre_trade_check_at("acc-1", 40.0, 40.0, &open_limits(), 1_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::RiskGate(RiskReason::MaxExposure)));
    }

    #[test]
    fn gate_enforces_order_rates() {
        let (mgr, _, cache, _) = manager();
        cache.warm("acc-1", 1000.0);
        let l = open_limits();

        assert!(mgr.pre_trade_check_at("acc-1", 1.0, 1.0, &l, 1_000).is_ok());
        assert!(mgr.pre_trade_check_at("acc-1", 1.0, 1.0, &l, 1_100).is_ok());

        let err = mgr
            .pre_trade_check_at("acc-1", 1.0, 1.0, &l, 1_200)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::RiskGate(RiskReason::OrdersPerSecond)
        ));

        // A second later the 1s window has rolled.
        assert!(mgr.pre_trade_check_at("acc-1", 1.0, 1.0, &l, 2_300).is_ok());
    }

    #[test]
    fn gate_blocks_on_kill_switch() {
        let (mgr, switches, cache, _) = manager();
        cache.warm("acc-1", 1000.0);
        switches.trigger_at("acc-1", "REJECT_SPIKE", false, 1_000);

        let err = mgr
            .pre_trade_check_at("acc-1", 1.0, 1.0, &open_limits(), 1_100)
            .unwrap_err();
        assert!(matches!(err, EngineError::KillSwitch(_)));
    }

    #[test]
    fn reject_spike_trips_switch() {
        let (mgr, switches, _, _) = manager();

        for i in 0..3 {
            mgr.record_reject_at("acc-1", 1_000 + i);
        }
        assert!(!switches.is_active_at("acc-1", 1_010));

        mgr.record_reject_at("acc-1", 1_010);
        assert!(switches.is_active_at("acc-1", 1_020));
        assert_eq!(switches.entry("acc-1").unwrap().reason, "REJECT_SPIKE");
    }

    #[test]
    fn cancel_rate_spike_trips_switch() {
        let (mgr, switches, _, _) = manager();
        mgr.record_cancel_at("acc-1", 1_000);
        mgr.record_cancel_at("acc-1", 1_100);
        mgr.record_cancel_at("acc-1", 1_200);
        assert_eq!(switches.entry("acc-1").unwrap().reason, "CANCEL_RATE_SPIKE");
    }

    #[test]
    fn reconnect_storm_trips_switch() {
        let (mgr, switches, _, _) = manager();
        mgr.record_reconnect_at("acc-1", 1_000);
        mgr.record_reconnect_at("acc-1", 2_000);
        assert!(!switches.is_active_at("acc-1", 2_010));
        mgr.record_reconnect_at("acc-1", 3_000);
        assert_eq!(switches.entry("acc-1").unwrap().reason, "RECONNECT_STORM");
    }

    #[test]
    fn slippage_spike_trips_switch() {
        let (mgr, switches, _, telemetry) = manager();
        mgr.record_slippage_reject_at("acc-1", 1_000);
        mgr.record_slippage_reject_at("acc-1", 1_001);
        mgr.record_slippage_reject_at("acc-1", 1_002);
        assert_eq!(switches.entry("acc-1").unwrap().reason, "SLIPPAGE_SPIKE");
        assert_eq!(telemetry.counter("order.slippage_reject"), 3);
    }

    #[test]
    fn latency_blowout_requires_consecutive_windows() {
        let (mgr, switches, _, telemetry) = manager();

        // Populate the histogram with slow acks (~200ms).
        for _ in 0..100 {
            telemetry.record_us(SEND_TO_ACK_HISTOGRAM, 200_000);
        }

        mgr.latency_sweep();
        assert!(switches.entry(GLOBAL_SCOPE).is_none());

        mgr.latency_sweep();
        assert_eq!(
            switches.entry(GLOBAL_SCOPE).unwrap().reason,
            "LATENCY_BLOWOUT"
        );
    }

    #[test]
    fn latency_streak_resets_on_clean_window() {
        let (mgr, switches, _, telemetry) = manager();

        for _ in 0..100 {
            telemetry.record_us(SEND_TO_ACK_HISTOGRAM, 200_000);
        }
        mgr.latency_sweep();

        // Clean reading resets the streak: no histogram means no breach.
        // (A fresh manager observing a quiet histogram would reset; emulate
        // by sweeping a second manager sharing a quiet telemetry.)
        let quiet = Arc::new(Telemetry::new());
        let mgr2 = RiskManager::new(
            mgr.switches.clone(),
            mgr.cache.clone(),
            quiet,
            limits(),
        );
        mgr2.latency_sweep();
        mgr2.latency_sweep();
        assert!(switches.entry(GLOBAL_SCOPE).is_none());
    }
}
