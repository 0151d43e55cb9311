// =============================================================================
// Order Intents — in-memory idempotency ledger with LRU + TTL eviction
// =============================================================================
//
// Keyed by (account, correlation id). A pending intent blocks duplicates; a
// fulfilled intent replays its stored result; a failed intent may be retried
// under the same correlation id. Capacity is bounded: expired entries evict
// first, then the oldest.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::engine::ExecutionOutcome;
use crate::types::now_ms;

type Key = (String, String);

#[derive(Debug, Clone)]
pub enum IntentStatus {
    Pending,
    Fulfilled(ExecutionOutcome),
    Failed(String),
}

#[derive(Debug, Clone)]
struct IntentEntry {
    status: IntentStatus,
    created_at_ms: i64,
}

/// Result of a reservation attempt.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    /// Fresh reservation; the caller proceeds with the pipeline.
    Reserved,
    /// An identical request is in flight.
    Pending,
    /// The request already completed; here is its result.
    Replay(ExecutionOutcome),
}

pub struct IntentLedger {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl_ms: i64,
}

struct Inner {
    map: HashMap<Key, IntentEntry>,
    /// Insertion order for LRU eviction.
    order: VecDeque<Key>,
}

impl IntentLedger {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            ttl_ms: ttl_ms.max(1) as i64,
        }
    }

    /// Reserve (account, correlation_id) for execution.
    pub fn reserve(&self, account_id: &str, correlation_id: &str) -> ReserveOutcome {
        self.reserve_at(account_id, correlation_id, now_ms())
    }

    pub fn reserve_at(&self, account_id: &str, correlation_id: &str, at_ms: i64) -> ReserveOutcome {
        let key = (account_id.to_string(), correlation_id.to_string());
        let mut inner = self.inner.lock();

        Self::evict_expired(&mut inner, self.ttl_ms, at_ms);

        if let Some(entry) = inner.map.get_mut(&key) {
            match &entry.status {
                IntentStatus::Pending => return ReserveOutcome::Pending,
                IntentStatus::Fulfilled(outcome) => return ReserveOutcome::Replay(outcome.clone()),
                IntentStatus::Failed(_) => {
                    // A failed attempt may be retried under the same id.
                    entry.status = IntentStatus::Pending;
                    entry.created_at_ms = at_ms;
                    return ReserveOutcome::Reserved;
                }
            }
        }

        while inner.map.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }

        inner.map.insert(
            key.clone(),
            IntentEntry {
                status: IntentStatus::Pending,
                created_at_ms: at_ms,
            },
        );
        inner.order.push_back(key);
        ReserveOutcome::Reserved
    }

    pub fn fulfill(&self, account_id: &str, correlation_id: &str, outcome: ExecutionOutcome) {
        let key = (account_id.to_string(), correlation_id.to_string());
        if let Some(entry) = self.inner.lock().map.get_mut(&key) {
            entry.status = IntentStatus::Fulfilled(outcome);
        }
    }

    pub fn fail(&self, account_id: &str, correlation_id: &str, reason: impl Into<String>) {
        let key = (account_id.to_string(), correlation_id.to_string());
        if let Some(entry) = self.inner.lock().map.get_mut(&key) {
            entry.status = IntentStatus::Failed(reason.into());
        }
    }

    pub fn status(&self, account_id: &str, correlation_id: &str) -> Option<IntentStatus> {
        let key = (account_id.to_string(), correlation_id.to_string());
        self.inner.lock().map.get(&key).map(|e| e.status.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries; also run periodically by the sweep task.
    pub fn evict_expired_now(&self) {
        let mut inner = self.inner.lock();
        Self::evict_expired(&mut inner, self.ttl_ms, now_ms());
    }

    fn evict_expired(inner: &mut Inner, ttl_ms: i64, at_ms: i64) {
        while let Some(front) = inner.order.front().cloned() {
            let expired = inner
                .map
                .get(&front)
                .map(|e| at_ms - e.created_at_ms > ttl_ms)
                .unwrap_or(true);
            if !expired {
                break;
            }
            inner.order.pop_front();
            inner.map.remove(&front);
        }
    }
}

impl std::fmt::Debug for IntentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentLedger")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(contract_id: i64) -> ExecutionOutcome {
        ExecutionOutcome {
            contract_id,
            buy_price: 1.0,
            payout: 1.95,
            execution_time_ms: 12,
        }
    }

    #[test]
    fn fresh_reservation_then_pending_duplicate() {
        let ledger = IntentLedger::new(16, 60_000);

        assert!(matches!(
            ledger.reserve_at("acc-1", "C1", 0),
            ReserveOutcome::Reserved
        ));
        assert!(matches!(
            ledger.reserve_at("acc-1", "C1", 10),
            ReserveOutcome::Pending
        ));
    }

    #[test]
    fn fulfilled_intent_replays_result() {
        let ledger = IntentLedger::new(16, 60_000);
        ledger.reserve_at("acc-1", "C1", 0);
        ledger.fulfill("acc-1", "C1", outcome(424242));

        match ledger.reserve_at("acc-1", "C1", 10) {
            ReserveOutcome::Replay(o) => assert_eq!(o.contract_id, 424242),
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn failed_intent_may_retry() {
        let ledger = IntentLedger::new(16, 60_000);
        ledger.reserve_at("acc-1", "C1", 0);
        ledger.fail("acc-1", "C1", "proposal rejected");

        assert!(matches!(
            ledger.reserve_at("acc-1", "C1", 10),
            ReserveOutcome::Reserved
        ));
    }

    #[test]
    fn accounts_do_not_collide() {
        let ledger = IntentLedger::new(16, 60_000);
        ledger.reserve_at("acc-1", "C1", 0);
        assert!(matches!(
            ledger.reserve_at("acc-2", "C1", 0),
            ReserveOutcome::Reserved
        ));
    }

    #[test]
    fn ttl_eviction_forgets_old_intents() {
        let ledger = IntentLedger::new(16, 1_000);
        ledger.reserve_at("acc-1", "C1", 0);
        ledger.fulfill("acc-1", "C1", outcome(1));

        // Within TTL: replay. After TTL: the slate is clean.
        assert!(matches!(
            ledger.reserve_at("acc-1", "C1", 500),
            ReserveOutcome::Replay(_)
        ));
        assert!(matches!(
            ledger.reserve_at("acc-1", "C1", 2_000),
            ReserveOutcome::Reserved
        ));
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let ledger = IntentLedger::new(2, 60_000);
        ledger.reserve_at("acc-1", "C1", 0);
        ledger.reserve_at("acc-1", "C2", 1);
        ledger.reserve_at("acc-1", "C3", 2);

        assert_eq!(ledger.len(), 2);
        assert!(ledger.status("acc-1", "C1").is_none());
        assert!(ledger.status("acc-1", "C3").is_some());
    }
}
