// =============================================================================
// Market data layer — tick streams, order books, synthetic fallback
// =============================================================================

pub mod order_book;
pub mod ring;
pub mod synthetic;
pub mod tick_stream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use order_book::OrderBooks;
use ring::Tick;
use synthetic::SyntheticState;

/// How a feature snapshot was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureMode {
    OrderBook,
    Synthetic,
}

/// Observable market features for one (account, symbol), consumed by
/// strategies. Fields are `None` when the underlying state cannot produce
/// them yet.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureSnapshot {
    pub mode: FeatureMode,
    pub mid: Option<f64>,
    pub spread: Option<f64>,
    pub imbalance: Option<f64>,
    pub momentum: Option<f64>,
    pub micro_price: Option<f64>,
}

/// A book older than this falls back to synthetic features.
const BOOK_STALE_HORIZON: Duration = Duration::from_secs(5);
/// Depth levels considered for the imbalance.
const IMBALANCE_TOP_N: usize = 5;
/// Retained synthetic tick history.
const SYNTHETIC_CAP: usize = 256;
/// Momentum horizon in seconds.
const MOMENTUM_WINDOW_S: i64 = 10;

type Key = (String, String);

/// Facade over both market-data modes. Ticks feed the synthetic state; the
/// order book, when subscribed and fresh, takes precedence.
pub struct MarketData {
    books: Arc<OrderBooks>,
    synthetic: RwLock<HashMap<Key, Arc<RwLock<SyntheticState>>>>,
    /// Last epoch folded into the synthetic state per pair, so overlapping
    /// subscribers do not double-feed.
    last_fed_epoch: RwLock<HashMap<Key, i64>>,
}

impl MarketData {
    pub fn new(books: Arc<OrderBooks>) -> Self {
        Self {
            books,
            synthetic: RwLock::new(HashMap::new()),
            last_fed_epoch: RwLock::new(HashMap::new()),
        }
    }

    pub fn books(&self) -> &Arc<OrderBooks> {
        &self.books
    }

    /// Fold one accepted tick into the synthetic state. Idempotent per epoch.
    pub fn on_tick(&self, account_id: &str, tick: &Tick) {
        let key = (account_id.to_string(), tick.symbol.clone());

        {
            let mut fed = self.last_fed_epoch.write();
            let last = fed.entry(key.clone()).or_insert(0);
            if tick.epoch <= *last {
                return;
            }
            *last = tick.epoch;
        }

        let state = {
            let map = self.synthetic.read();
            map.get(&key).cloned()
        };
        let state = match state {
            Some(s) => s,
            None => self
                .synthetic
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(RwLock::new(SyntheticState::new(SYNTHETIC_CAP))))
                .clone(),
        };
        state.write().push(tick.quote, tick.epoch);
    }

    /// Current feature snapshot for a pair. Order-book mode wins while the
    /// book is fresh; otherwise the synthetic fallback derives the same
    /// quantities from tick deltas.
    pub fn features(&self, account_id: &str, symbol: &str) -> FeatureSnapshot {
        if let Some(book) = self.books.get(account_id, symbol) {
            let b = book.read();
            if b.is_fresh(BOOK_STALE_HORIZON) && b.best_bid().is_some() {
                return FeatureSnapshot {
                    mode: FeatureMode::OrderBook,
                    mid: b.mid(),
                    spread: b.spread(),
                    imbalance: b.imbalance(IMBALANCE_TOP_N),
                    momentum: None,
                    micro_price: b.micro_price(),
                };
            }
        }

        let key = (account_id.to_string(), symbol.to_string());
        let state = self.synthetic.read().get(&key).cloned();
        match state {
            Some(state) => {
                let s = state.read();
                FeatureSnapshot {
                    mode: FeatureMode::Synthetic,
                    mid: s.last_price(),
                    spread: s.spread_proxy(),
                    imbalance: s.imbalance(),
                    momentum: s.momentum(MOMENTUM_WINDOW_S),
                    micro_price: None,
                }
            }
            None => FeatureSnapshot {
                mode: FeatureMode::Synthetic,
                mid: None,
                spread: None,
                imbalance: None,
                momentum: None,
                micro_price: None,
            },
        }
    }
}

impl std::fmt::Debug for MarketData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketData").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
