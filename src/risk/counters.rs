// =============================================================================
// Rolling window counters — reset when the window elapses
// =============================================================================
//
// A counter resets when `now − window_start > window_ms`. Used for
// orders/sec, orders/min, and the kill-switch spike detectors.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::now_ms;

/// One rolling counter.
pub struct RollingCounter {
    window_ms: i64,
    state: Mutex<CounterState>,
}

struct CounterState {
    window_start_ms: i64,
    count: u32,
}

impl RollingCounter {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1) as i64,
            state: Mutex::new(CounterState {
                window_start_ms: 0,
                count: 0,
            }),
        }
    }

    /// Increment and return the count within the current window.
    pub fn incr_at(&self, now_ms: i64) -> u32 {
        let mut s = self.state.lock();
        if now_ms - s.window_start_ms > self.window_ms {
            s.window_start_ms = now_ms;
            s.count = 0;
        }
        s.count += 1;
        s.count
    }

    /// Current count without incrementing; an elapsed window reads as zero.
    pub fn count_at(&self, now_ms: i64) -> u32 {
        let s = self.state.lock();
        if now_ms - s.window_start_ms > self.window_ms {
            0
        } else {
            s.count
        }
    }

    pub fn incr(&self) -> u32 {
        self.incr_at(now_ms())
    }

    pub fn count(&self) -> u32 {
        self.count_at(now_ms())
    }
}

// ---------------------------------------------------------------------------
// Per-account metric registry
// ---------------------------------------------------------------------------

type Key = (String, &'static str);

/// Keyed rolling counters, one per (account, metric).
pub struct AccountCounters {
    counters: RwLock<HashMap<Key, Arc<RollingCounter>>>,
}

impl AccountCounters {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
        }
    }

    fn handle(&self, account_id: &str, metric: &'static str, window_ms: u64) -> Arc<RollingCounter> {
        let key = (account_id.to_string(), metric);
        if let Some(c) = self.counters.read().get(&key) {
            return c.clone();
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(RollingCounter::new(window_ms)))
            .clone()
    }

    pub fn incr_at(
        &self,
        account_id: &str,
        metric: &'static str,
        window_ms: u64,
        now_ms: i64,
    ) -> u32 {
        self.handle(account_id, metric, window_ms).incr_at(now_ms)
    }

    pub fn count_at(
        &self,
        account_id: &str,
        metric: &'static str,
        window_ms: u64,
        now_ms: i64,
    ) -> u32 {
        self.handle(account_id, metric, window_ms).count_at(now_ms)
    }

    pub fn incr(&self, account_id: &str, metric: &'static str, window_ms: u64) -> u32 {
        self.incr_at(account_id, metric, window_ms, now_ms())
    }

    pub fn count(&self, account_id: &str, metric: &'static str, window_ms: u64) -> u32 {
        self.count_at(account_id, metric, window_ms, now_ms())
    }
}

impl Default for AccountCounters {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
