// =============================================================================
// Order Books — sorted depth state per (account, symbol)
// =============================================================================
//
// Order-book mode market data. Bids sort descending, asks ascending. Derived
// quantities: best bid/ask, mid, spread, size-weighted micro-price, and
// top-N imbalance = (Σbid_size − Σask_size) / Σ.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::session::frames::{self, requests, Inbound};
use crate::session::Broker;
use crate::types::now_ms;

type Key = (String, String);

/// One price level.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Depth state for one (account, symbol).
#[derive(Debug, Clone, Serialize)]
pub struct BookState {
    pub symbol: String,
    /// Sorted descending by price.
    pub bids: Vec<BookLevel>,
    /// Sorted ascending by price.
    pub asks: Vec<BookLevel>,
    pub last_update_ms: i64,
    #[serde(skip)]
    pub subscription_id: Option<String>,
}

impl BookState {
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    pub fn mid(&self) -> Option<f64> {
        Some((self.best_bid()?.price + self.best_ask()?.price) / 2.0)
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Size-weighted micro-price: leans toward the side with less resting
    /// size.
    pub fn micro_price(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let total = bid.size + ask.size;
        if total <= 0.0 {
            return self.mid();
        }
        Some((bid.price * ask.size + ask.price * bid.size) / total)
    }

    /// Top-N depth imbalance in [-1, 1].
    pub fn imbalance(&self, top_n: usize) -> Option<f64> {
        let bid_sum: f64 = self.bids.iter().take(top_n).map(|l| l.size).sum();
        let ask_sum: f64 = self.asks.iter().take(top_n).map(|l| l.size).sum();
        let total = bid_sum + ask_sum;
        if total <= 0.0 {
            return None;
        }
        Some((bid_sum - ask_sum) / total)
    }

    /// Whether this book has been updated within `horizon`.
    pub fn is_fresh(&self, horizon: Duration) -> bool {
        now_ms() - self.last_update_ms <= horizon.as_millis() as i64
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Default depth requested from the upstream.
const DEFAULT_DEPTH: u32 = 10;

pub struct OrderBooks {
    broker: Arc<dyn Broker>,
    request_deadline: Duration,
    books: RwLock<HashMap<Key, Arc<RwLock<BookState>>>>,
    /// Accounts whose broker-level streaming/ready hooks are installed.
    hooked_accounts: RwLock<Vec<String>>,
}

impl OrderBooks {
    pub fn new(broker: Arc<dyn Broker>, request_deadline: Duration) -> Self {
        Self {
            broker,
            request_deadline,
            books: RwLock::new(HashMap::new()),
            hooked_accounts: RwLock::new(Vec::new()),
        }
    }

    /// Install one streaming listener + one ready listener per account.
    fn ensure_hooks(self: &Arc<Self>, account_id: &str) {
        {
            let hooked = self.hooked_accounts.read();
            if hooked.iter().any(|a| a == account_id) {
                return;
            }
        }
        let mut hooked = self.hooked_accounts.write();
        if hooked.iter().any(|a| a == account_id) {
            return;
        }
        hooked.push(account_id.to_string());
        drop(hooked);

        let books = self.clone();
        let account = account_id.to_string();
        self.broker.add_streaming_listener(
            account_id,
            Arc::new(move |inbound| {
                if inbound.msg_type == "order_book" {
                    books.ingest(&account, inbound);
                }
            }),
        );

        let books = self.clone();
        let account = account_id.to_string();
        self.broker.add_ready_listener(
            account_id,
            Arc::new(move |is_reconnect| {
                if is_reconnect {
                    let books = books.clone();
                    let account = account.clone();
                    tokio::spawn(async move {
                        books.resubscribe_all(&account).await;
                    });
                }
            }),
        );
    }

    /// Subscribe to depth for a pair and start tracking its book.
    pub async fn subscribe(self: &Arc<Self>, account_id: &str, symbol: &str) -> Result<(), EngineError> {
        self.ensure_hooks(account_id);
        let response = self
            .broker
            .request(
                account_id,
                requests::order_book_subscribe(symbol, DEFAULT_DEPTH),
                self.request_deadline,
            )
            .await?;

        let key = (account_id.to_string(), symbol.to_string());
        let state = Arc::new(RwLock::new(BookState {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            last_update_ms: 0,
            subscription_id: frames::subscription_id(&response.payload),
        }));
        self.books.write().insert(key, state.clone());

        // The subscribe response may carry an initial book snapshot.
        if response.payload.get("order_book").is_some() {
            Self::apply_payload(&state, &response.payload);
        }

        info!(account_id, symbol, "order book subscribed");
        Ok(())
    }

    pub fn get(&self, account_id: &str, symbol: &str) -> Option<Arc<RwLock<BookState>>> {
        let key = (account_id.to_string(), symbol.to_string());
        self.books.read().get(&key).cloned()
    }

    /// Apply one `order_book` streaming frame for an account.
    pub fn ingest(&self, account_id: &str, inbound: &Inbound) {
        if inbound.msg_type != "order_book" {
            return;
        }
        let Some(symbol) = inbound.payload["order_book"]["symbol"].as_str() else {
            warn!(account_id, "order_book frame without symbol");
            return;
        };
        let key = (account_id.to_string(), symbol.to_string());
        let Some(state) = self.books.read().get(&key).cloned() else {
            return;
        };
        Self::apply_payload(&state, &inbound.payload);
    }

    fn apply_payload(state: &RwLock<BookState>, payload: &Value) {
        let book = &payload["order_book"];
        let mut bids = parse_levels(&book["bids"]);
        let mut asks = parse_levels(&book["asks"]);

        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

        let mut s = state.write();
        s.bids = bids;
        s.asks = asks;
        s.last_update_ms = now_ms();
    }

    /// Re-subscribe every tracked book for an account; called on
    /// `connection_ready(is_reconnect=true)`.
    pub async fn resubscribe_all(self: &Arc<Self>, account_id: &str) {
        let symbols: Vec<String> = self
            .books
            .read()
            .iter()
            .filter(|((acc, _), _)| acc == account_id)
            .map(|((_, sym), _)| sym.clone())
            .collect();

        for symbol in symbols {
            if let Err(e) = self.subscribe(account_id, &symbol).await {
                warn!(account_id, symbol = %symbol, error = %e, "order book resubscribe failed");
            }
        }
    }
}

impl std::fmt::Debug for OrderBooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBooks")
            .field("books", &self.books.read().len())
            .finish()
    }
}

/// Parse `[[price, size], ...]`; entries may be numbers or numeric strings.
fn parse_levels(raw: &Value) -> Vec<BookLevel> {
    raw.as_array()
        .map(|levels| {
            levels
                .iter()
                .filter_map(|entry| {
                    let pair = entry.as_array()?;
                    Some(BookLevel {
                        price: value_f64(pair.first()?)?,
                        size: value_f64(pair.get(1)?)?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn value_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str()?.parse().ok())
}

// =============================================================================
// Tests
// =============================================================================
