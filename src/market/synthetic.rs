// =============================================================================
// Synthetic market features — order-flow proxies derived from tick deltas
// =============================================================================
//
// Fallback for symbols without order-book depth. Imbalance comes from signed
// delta sums, the spread proxy from the last absolute delta, and momentum
// from the price change over a short time horizon.
// =============================================================================

use std::collections::VecDeque;

/// Rolling per-(account, symbol) tick-delta state.
pub struct SyntheticState {
    prices: VecDeque<f64>,
    deltas: VecDeque<f64>,
    times: VecDeque<i64>,
    cap: usize,
}

impl SyntheticState {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(2);
        Self {
            prices: VecDeque::with_capacity(cap),
            deltas: VecDeque::with_capacity(cap),
            times: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Feed one accepted tick. `epoch` is the upstream tick time in seconds.
    pub fn push(&mut self, price: f64, epoch: i64) {
        if let Some(last) = self.prices.back() {
            if self.deltas.len() == self.cap {
                self.deltas.pop_front();
            }
            self.deltas.push_back(price - last);
        }
        if self.prices.len() == self.cap {
            self.prices.pop_front();
            self.times.pop_front();
        }
        self.prices.push_back(price);
        self.times.push_back(epoch);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.prices.back().copied()
    }

    /// Tick-delta imbalance in [-1, 1]: signed delta sum over absolute delta
    /// sum. `None` until at least one delta exists or when the market is
    /// perfectly flat.
    pub fn imbalance(&self) -> Option<f64> {
        if self.deltas.is_empty() {
            return None;
        }
        let signed: f64 = self.deltas.iter().sum();
        let magnitude: f64 = self.deltas.iter().map(|d| d.abs()).sum();
        if magnitude <= 0.0 {
            return None;
        }
        Some(signed / magnitude)
    }

    /// Spread proxy: |last delta|.
    pub fn spread_proxy(&self) -> Option<f64> {
        self.deltas.back().map(|d| d.abs())
    }

    /// Short-horizon momentum: (last − price at t−window) / price at, where
    /// the reference is the first retained price at or after the horizon
    /// start.
    pub fn momentum(&self, window_s: i64) -> Option<f64> {
        let last_price = *self.prices.back()?;
        let last_time = *self.times.back()?;
        let horizon_start = last_time - window_s;

        let idx = self.times.iter().position(|&t| t >= horizon_start)?;
        let reference = *self.prices.get(idx)?;
        if reference == 0.0 {
            return None;
        }
        Some((last_price - reference) / reference)
    }
}

// =============================================================================
// Tests
// =============================================================================
