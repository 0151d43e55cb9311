// =============================================================================
// Tick Streams — per-(account, symbol) subscriptions with epoch ordering
// =============================================================================
//
// Warm start: the first subscription for a pair fetches recent history into
// the ring, then subscribes live. Live ticks are validated against the last
// epoch: stale frames are dropped and counted, sequence gaps are counted.
// Listeners observe a strictly monotonic epoch sequence, in arrival order.
//
// On reconnect every active subscription is re-established in parallel;
// history is NOT re-fetched.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::session::frames::{self, requests, Inbound};
use crate::session::Broker;
use crate::telemetry::Telemetry;

use super::ring::{QuoteRing, Tick, Window};

/// Callback invoked for every accepted tick, in order.
pub type TickListener = Arc<dyn Fn(&Tick) + Send + Sync>;

type Key = (String, String);

/// Tunables lifted from the engine config.
#[derive(Debug, Clone)]
pub struct TickStreamConfig {
    pub buffer_size: usize,
    pub history_count: u32,
    pub request_deadline: Duration,
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

pub struct TickSubscription {
    account_id: String,
    symbol: String,
    ring: RwLock<QuoteRing>,
    last_epoch: AtomicI64,
    upstream_id: RwLock<Option<String>>,
    listeners: RwLock<Vec<(u64, TickListener)>>,
    next_listener_id: AtomicU64,
    active: AtomicBool,
}

impl TickSubscription {
    fn new(account_id: &str, symbol: &str, buffer_size: usize) -> Self {
        Self {
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            ring: RwLock::new(QuoteRing::new(buffer_size)),
            last_epoch: AtomicI64::new(0),
            upstream_id: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            active: AtomicBool::new(true),
        }
    }

    fn add_listener(&self, listener: TickListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    fn last_tick(&self) -> Option<Tick> {
        self.ring.read().last().cloned()
    }

    pub fn last_epoch(&self) -> i64 {
        self.last_epoch.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct TickStreams {
    broker: Arc<dyn Broker>,
    cfg: TickStreamConfig,
    telemetry: Arc<Telemetry>,
    subs: RwLock<HashMap<Key, Arc<TickSubscription>>>,
    /// Accounts whose broker-level streaming/ready hooks are installed.
    hooked_accounts: RwLock<Vec<String>>,
}

impl TickStreams {
    pub fn new(broker: Arc<dyn Broker>, cfg: TickStreamConfig, telemetry: Arc<Telemetry>) -> Self {
        Self {
            broker,
            cfg,
            telemetry,
            subs: RwLock::new(HashMap::new()),
            hooked_accounts: RwLock::new(Vec::new()),
        }
    }

    /// Register `listener` for (account, symbol). The first registration for
    /// a pair performs the warm start and the live subscribe; later ones just
    /// attach and immediately receive a replay of the last tick.
    ///
    /// Returns the listener id for `unsubscribe`.
    pub async fn subscribe(
        self: &Arc<Self>,
        account_id: &str,
        symbol: &str,
        listener: TickListener,
    ) -> Result<u64, EngineError> {
        self.ensure_account_hooks(account_id);

        let key = (account_id.to_string(), symbol.to_string());
        if let Some(sub) = self.subs.read().get(&key).cloned() {
            let id = sub.add_listener(listener.clone());
            if let Some(last) = sub.last_tick() {
                listener(&last);
            }
            return Ok(id);
        }

        // First subscriber for this pair. Insert the subscription before any
        // awaits so concurrent subscribers attach instead of double-fetching.
        let sub = Arc::new(TickSubscription::new(account_id, symbol, self.cfg.buffer_size));
        {
            let mut subs = self.subs.write();
            if let Some(existing) = subs.get(&key).cloned() {
                drop(subs);
                let id = existing.add_listener(listener.clone());
                if let Some(last) = existing.last_tick() {
                    listener(&last);
                }
                return Ok(id);
            }
            subs.insert(key, sub.clone());
        }
        let listener_id = sub.add_listener(listener);

        // Warm start: recent history seeds the ring and the epoch guard.
        match self
            .broker
            .request(
                account_id,
                requests::ticks_history(symbol, self.cfg.history_count),
                self.cfg.request_deadline,
            )
            .await
        {
            Ok(response) => {
                let pairs = frames::parse_history(&response.payload);
                let mut ring = sub.ring.write();
                for (epoch, quote) in &pairs {
                    ring.push(Tick {
                        symbol: symbol.to_string(),
                        epoch: *epoch,
                        quote: *quote,
                        bid: None,
                        ask: None,
                        received: response.received,
                        received_at_ms: response.received_at_ms,
                    });
                }
                if let Some((last_epoch, _)) = pairs.last() {
                    sub.last_epoch.store(*last_epoch, Ordering::SeqCst);
                }
                debug!(account_id, symbol, count = pairs.len(), "tick history warmed");
            }
            Err(e) => {
                // A cold ring is acceptable; the required-window gate keeps
                // strategies quiet until live ticks fill it.
                warn!(account_id, symbol, error = %e, "tick history fetch failed");
            }
        }

        self.send_live_subscribe(&sub).await?;
        info!(account_id, symbol, "tick subscription established");
        Ok(listener_id)
    }

    /// Detach a listener. When the last listener leaves, the upstream
    /// subscription is forgotten and the pair is dropped.
    pub async fn unsubscribe(
        &self,
        account_id: &str,
        symbol: &str,
        listener_id: u64,
    ) -> Result<(), EngineError> {
        let key = (account_id.to_string(), symbol.to_string());

        let (now_empty, sub) = match self.subs.read().get(&key).cloned() {
            Some(sub) => {
                let now_empty = {
                    let mut listeners = sub.listeners.write();
                    listeners.retain(|(id, _)| *id != listener_id);
                    listeners.is_empty()
                };
                (now_empty, sub)
            }
            None => return Ok(()),
        };

        if !now_empty {
            return Ok(());
        }

        sub.active.store(false, Ordering::SeqCst);
        self.subs.write().remove(&key);

        if let Some(upstream_id) = sub.upstream_id.read().clone() {
            let _ = self
                .broker
                .fire_and_forget(account_id, requests::forget(&upstream_id))
                .await;
        }
        info!(account_id, symbol, "tick subscription dropped");
        Ok(())
    }

    /// Run `f` over a zero-copy view of the last `n` quotes. Returns `None`
    /// when no subscription exists for the pair.
    pub fn with_window<R>(
        &self,
        account_id: &str,
        symbol: &str,
        n: usize,
        f: impl FnOnce(Window<'_>) -> R,
    ) -> Option<R> {
        let key = (account_id.to_string(), symbol.to_string());
        let sub = self.subs.read().get(&key).cloned()?;
        let ring = sub.ring.read();
        Some(f(ring.window(n)))
    }

    /// Buffered quote count for a pair.
    pub fn depth(&self, account_id: &str, symbol: &str) -> usize {
        self.with_window(account_id, symbol, usize::MAX, |w| w.len())
            .unwrap_or(0)
    }

    pub fn subscription(&self, account_id: &str, symbol: &str) -> Option<Arc<TickSubscription>> {
        let key = (account_id.to_string(), symbol.to_string());
        self.subs.read().get(&key).cloned()
    }

    // -------------------------------------------------------------------------
    // Inbound path
    // -------------------------------------------------------------------------

    /// Validate and apply one live tick frame for an account.
    pub fn ingest(&self, account_id: &str, inbound: &Inbound) {
        let Some(wire) = frames::parse_tick(inbound) else {
            return;
        };

        let key = (account_id.to_string(), wire.symbol.clone());
        let Some(sub) = self.subs.read().get(&key).cloned() else {
            return;
        };

        let last = sub.last_epoch.load(Ordering::SeqCst);
        if last != 0 && wire.epoch <= last {
            self.telemetry.incr("tick.out_of_order_drop");
            debug!(
                account_id,
                symbol = %wire.symbol,
                epoch = wire.epoch,
                last_epoch = last,
                "out-of-order tick dropped"
            );
            return;
        }
        if last != 0 && wire.epoch > last + 1 {
            self.telemetry.incr("tick.seq_gap");
            debug!(
                account_id,
                symbol = %wire.symbol,
                from = last,
                to = wire.epoch,
                "tick sequence gap"
            );
        }

        let tick = Tick {
            symbol: wire.symbol,
            epoch: wire.epoch,
            quote: wire.quote,
            bid: wire.bid,
            ask: wire.ask,
            received: inbound.received,
            received_at_ms: inbound.received_at_ms,
        };

        let op_start = Instant::now();
        sub.ring.write().push(tick.clone());
        sub.last_epoch.store(tick.epoch, Ordering::SeqCst);
        self.telemetry
            .record_duration("tick.buffer_op_us", op_start.elapsed());
        self.telemetry
            .record_duration("tick.receive_to_buffer_us", inbound.received.elapsed());

        let listeners: Vec<TickListener> =
            sub.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for l in listeners {
            l(&tick);
        }
    }

    /// Re-establish every active subscription for an account, in parallel.
    /// Called on `connection_ready(is_reconnect=true)`.
    pub async fn resubscribe_all(&self, account_id: &str) {
        let subs: Vec<Arc<TickSubscription>> = self
            .subs
            .read()
            .values()
            .filter(|s| s.account_id == account_id && s.active.load(Ordering::SeqCst))
            .cloned()
            .collect();

        if subs.is_empty() {
            return;
        }

        info!(account_id, count = subs.len(), "resubscribing tick streams");
        let futures = subs.iter().map(|sub| self.send_live_subscribe(sub));
        for (sub, result) in subs.iter().zip(join_all(futures).await) {
            if let Err(e) = result {
                warn!(
                    account_id,
                    symbol = %sub.symbol,
                    error = %e,
                    "tick resubscribe failed"
                );
            }
        }
    }

    async fn send_live_subscribe(&self, sub: &TickSubscription) -> Result<(), EngineError> {
        let response = self
            .broker
            .request(
                &sub.account_id,
                requests::ticks_subscribe(&sub.symbol),
                self.cfg.request_deadline,
            )
            .await?;

        *sub.upstream_id.write() = frames::subscription_id(&response.payload);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Broker hooks
    // -------------------------------------------------------------------------

    /// Install one streaming listener + one ready listener per account.
    fn ensure_account_hooks(self: &Arc<Self>, account_id: &str) {
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

        let streams = self.clone();
        let account = account_id.to_string();
        self.broker.add_streaming_listener(
            account_id,
            Arc::new(move |inbound| {
                if inbound.msg_type == "tick" {
                    streams.ingest(&account, inbound);
                }
            }),
        );

        let streams = self.clone();
        let account = account_id.to_string();
        self.broker.add_ready_listener(
            account_id,
            Arc::new(move |is_reconnect| {
                if is_reconnect {
                    let streams = streams.clone();
                    let account = account.clone();
                    tokio::spawn(async move {
                        streams.resubscribe_all(&account).await;
                    });
                }
            }),
        );
    }
}

impl std::fmt::Debug for TickStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickStreams")
            .field("subscriptions", &self.subs.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::MockBroker;
    use parking_lot::Mutex;
    use serde_json::json;

    fn cfg() -> TickStreamConfig {
        TickStreamConfig {
            buffer_size: 100,
            history_count: 50,
            request_deadline: Duration::from_secs(1),
        }
    }

    fn empty_history_broker() -> Arc<MockBroker> {
        Arc::new(MockBroker::new(|frame| {
            if frame.get("ticks_history").is_some() {
                Ok(json!({
                    "msg_type": "history",
                    "history": { "times": [], "prices": [] },
                }))
            } else if frame.get("ticks").is_some() {
                Ok(json!({
                    "msg_type": "tick",
                    "subscription": { "id": "sub-1" },
                }))
            } else {
                Ok(json!({ "msg_type": "ok" }))
            }
        }))
    }

    fn tick_frame(symbol: &str, epoch: i64, quote: f64) -> serde_json::Value {
        json!({
            "msg_type": "tick",
            "tick": { "symbol": symbol, "epoch": epoch, "quote": quote },
        })
    }

    #[tokio::test]
    async fn out_of_order_tick_drop() {
        let broker = empty_history_broker();
        let telemetry = Arc::new(Telemetry::new());
        let streams = Arc::new(TickStreams::new(broker.clone(), cfg(), telemetry.clone()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        streams
            .subscribe(
                "acc-1",
                "R_100",
                Arc::new(move |t| seen_cb.lock().push(t.quote)),
            )
            .await
            .unwrap();

        broker.push_streaming("acc-1", tick_frame("R_100", 1000, 100.1));
        broker.push_streaming("acc-1", tick_frame("R_100", 999, 100.2));
        broker.push_streaming("acc-1", tick_frame("R_100", 1003, 100.3));

        let buffer: Vec<f64> = streams
            .with_window("acc-1", "R_100", 10, |w| w.quotes().collect())
            .unwrap();
        assert_eq!(buffer, vec![100.1, 100.3]);

        let sub = streams.subscription("acc-1", "R_100").unwrap();
        assert_eq!(sub.last_epoch(), 1003);

        assert_eq!(telemetry.counter("tick.out_of_order_drop"), 1);
        assert_eq!(telemetry.counter("tick.seq_gap"), 1);

        // Listeners saw exactly the strictly monotonic subset.
        assert_eq!(*seen.lock(), vec![100.1, 100.3]);
    }

    #[tokio::test]
    async fn warm_start_seeds_ring_and_epoch_guard() {
        let broker = Arc::new(MockBroker::new(|frame| {
            if frame.get("ticks_history").is_some() {
                Ok(json!({
                    "msg_type": "history",
                    "history": { "times": [100, 101, 102], "prices": [1.0, 1.1, 1.2] },
                }))
            } else {
                Ok(json!({ "msg_type": "tick", "subscription": { "id": "s" } }))
            }
        }));
        let streams = Arc::new(TickStreams::new(
            broker.clone(),
            cfg(),
            Arc::new(Telemetry::new()),
        ));

        streams
            .subscribe("acc-1", "R_100", Arc::new(|_| {}))
            .await
            .unwrap();

        assert_eq!(streams.depth("acc-1", "R_100"), 3);
        let sub = streams.subscription("acc-1", "R_100").unwrap();
        assert_eq!(sub.last_epoch(), 102);

        // A live tick at or before the history tail is dropped.
        broker.push_streaming("acc-1", tick_frame("R_100", 102, 9.9));
        assert_eq!(streams.depth("acc-1", "R_100"), 3);

        broker.push_streaming("acc-1", tick_frame("R_100", 103, 1.3));
        assert_eq!(streams.depth("acc-1", "R_100"), 4);
    }

    #[tokio::test]
    async fn second_subscriber_attaches_and_replays_last_tick() {
        let broker = empty_history_broker();
        let streams = Arc::new(TickStreams::new(
            broker.clone(),
            cfg(),
            Arc::new(Telemetry::new()),
        ));

        streams
            .subscribe("acc-1", "R_100", Arc::new(|_| {}))
            .await
            .unwrap();
        broker.push_streaming("acc-1", tick_frame("R_100", 500, 42.0));

        let history_requests_before = broker.sent_matching("ticks_history");

        let replayed = Arc::new(Mutex::new(Vec::new()));
        let replayed_cb = replayed.clone();
        streams
            .subscribe(
                "acc-1",
                "R_100",
                Arc::new(move |t| replayed_cb.lock().push(t.quote)),
            )
            .await
            .unwrap();

        // Replay of the last tick, no second history fetch.
        assert_eq!(*replayed.lock(), vec![42.0]);
        assert_eq!(broker.sent_matching("ticks_history"), history_requests_before);
    }

    #[tokio::test]
    async fn last_unsubscribe_sends_forget() {
        let broker = empty_history_broker();
        let streams = Arc::new(TickStreams::new(
            broker.clone(),
            cfg(),
            Arc::new(Telemetry::new()),
        ));

        let id1 = streams
            .subscribe("acc-1", "R_100", Arc::new(|_| {}))
            .await
            .unwrap();
        let id2 = streams
            .subscribe("acc-1", "R_100", Arc::new(|_| {}))
            .await
            .unwrap();

        streams.unsubscribe("acc-1", "R_100", id1).await.unwrap();
        assert_eq!(broker.sent_matching("forget"), 0);

        streams.unsubscribe("acc-1", "R_100", id2).await.unwrap();
        assert_eq!(broker.sent_matching("forget"), 1);
        assert!(streams.subscription("acc-1", "R_100").is_none());
    }

    #[tokio::test]
    async fn reconnect_resubscribes_without_history() {
        let broker = empty_history_broker();
        let streams = Arc::new(TickStreams::new(
            broker.clone(),
            cfg(),
            Arc::new(Telemetry::new()),
        ));

        streams
            .subscribe("acc-1", "R_100", Arc::new(|_| {}))
            .await
            .unwrap();
        streams
            .subscribe("acc-1", "R_50", Arc::new(|_| {}))
            .await
            .unwrap();

        let history_before = broker.sent_matching("ticks_history");
        let live_before = broker.sent_matching("\"ticks\"");

        broker.fire_ready("acc-1", true);
        // The ready hook spawns the resubscribe; let it run.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(broker.sent_matching("ticks_history"), history_before);
        assert_eq!(broker.sent_matching("\"ticks\""), live_before + 2);
    }

    #[tokio::test]
    async fn ticks_for_unknown_pairs_are_ignored() {
        let broker = empty_history_broker();
        let telemetry = Arc::new(Telemetry::new());
        let streams = Arc::new(TickStreams::new(broker.clone(), cfg(), telemetry.clone()));

        streams
            .subscribe("acc-1", "R_100", Arc::new(|_| {}))
            .await
            .unwrap();

        broker.push_streaming("acc-1", tick_frame("R_25", 1, 5.0));
        assert_eq!(streams.depth("acc-1", "R_25"), 0);
        assert_eq!(telemetry.counter("tick.out_of_order_drop"), 0);
    }
}
