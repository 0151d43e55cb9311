// =============================================================================
// Kill Switches — per-account and global trading stops
// =============================================================================
//
// A manual trigger never auto-clears. A non-manual (automatic) trigger clears
// itself after the TTL, either inline on the first read past expiry or by the
// periodic sweep. Every transition persists, lands in the event ring, and
// notifies listeners (strategy runners pause, execution refuses).
//
// Startup: persisted rows are restored; expired non-manual rows are cleared.
// If the rows cannot be read at all and fail-closed is set, the global switch
// trips with KILL_SWITCH_STATE_UNKNOWN.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::errors::EngineError;
use crate::health::{Component, ComponentStatus, HealthMonitor};
use crate::store::{keys, StoreWriter, WriteOp, GLOBAL_SCOPE};
use crate::types::now_ms;

/// Trigger reason for a fail-closed startup.
pub const REASON_STATE_UNKNOWN: &str = "KILL_SWITCH_STATE_UNKNOWN";

// ---------------------------------------------------------------------------
// Entry & events
// ---------------------------------------------------------------------------

/// Persisted shape of one switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEntry {
    pub active: bool,
    pub reason: String,
    #[serde(rename = "triggeredAt")]
    pub triggered_at_ms: i64,
    pub manual: bool,
    #[serde(rename = "clearedAt", default, skip_serializing_if = "Option::is_none")]
    pub cleared_at_ms: Option<i64>,
}

/// Notification delivered to listeners on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchEvent {
    /// Account id, or the global sentinel.
    pub scope: String,
    pub active: bool,
    pub reason: String,
    pub manual: bool,
    /// True when the clear came from TTL expiry rather than an operator.
    pub auto_cleared: bool,
}

pub type KillSwitchListener = Arc<dyn Fn(&KillSwitchEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub struct KillSwitches {
    /// Keyed by account id; the global switch lives under [`GLOBAL_SCOPE`].
    entries: RwLock<HashMap<String, KillSwitchEntry>>,
    ttl_ms: u64,
    fail_closed: bool,
    listeners: RwLock<Vec<KillSwitchListener>>,
    writer: StoreWriter,
    health: Arc<HealthMonitor>,
}

impl KillSwitches {
    pub fn new(
        ttl_ms: u64,
        fail_closed: bool,
        writer: StoreWriter,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl_ms,
            fail_closed,
            listeners: RwLock::new(Vec::new()),
            writer,
            health,
        }
    }

    pub fn add_listener(&self, listener: KillSwitchListener) {
        self.listeners.write().push(listener);
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Trip a switch. `scope` is an account id or [`GLOBAL_SCOPE`].
    pub fn trigger(&self, scope: &str, reason: &str, manual: bool) {
        self.trigger_at(scope, reason, manual, now_ms());
    }

    pub fn trigger_at(&self, scope: &str, reason: &str, manual: bool, at_ms: i64) {
        let entry = KillSwitchEntry {
            active: true,
            reason: reason.to_string(),
            triggered_at_ms: at_ms,
            manual,
            cleared_at_ms: None,
        };
        self.entries.write().insert(scope.to_string(), entry.clone());

        warn!(scope, reason, manual, "kill switch triggered");
        self.persist(scope, &entry);
        self.health.set_component(
            Component::Risk,
            ComponentStatus::Degraded,
            Some(format!("kill switch active ({scope}): {reason}")),
        );
        self.health.push_event(
            "kill_switch_trigger",
            scope_account(scope),
            json!({ "reason": reason, "manual": manual }),
        );
        self.notify(KillSwitchEvent {
            scope: scope.to_string(),
            active: true,
            reason: reason.to_string(),
            manual,
            auto_cleared: false,
        });
    }

    /// Operator clear.
    pub fn clear(&self, scope: &str) {
        self.clear_inner(scope, false, now_ms());
    }

    fn clear_inner(&self, scope: &str, auto: bool, at_ms: i64) {
        let cleared = {
            let mut entries = self.entries.write();
            match entries.get_mut(scope) {
                Some(entry) if entry.active => {
                    entry.active = false;
                    entry.cleared_at_ms = Some(at_ms);
                    Some(entry.clone())
                }
                _ => None,
            }
        };

        let Some(entry) = cleared else { return };

        info!(scope, auto, reason = %entry.reason, "kill switch cleared");
        self.persist(scope, &entry);
        self.refresh_health();
        self.health.push_event(
            if auto { "kill_switch_auto_clear" } else { "kill_switch_clear" },
            scope_account(scope),
            json!({ "reason": entry.reason }),
        );
        self.notify(KillSwitchEvent {
            scope: scope.to_string(),
            active: false,
            reason: entry.reason.clone(),
            manual: entry.manual,
            auto_cleared: auto,
        });
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Whether trading is forbidden for an account: its own switch, the
    /// global switch, or the fail-closed health path.
    pub fn is_active(&self, account_id: &str) -> bool {
        self.is_active_at(account_id, now_ms())
    }

    pub fn is_active_at(&self, account_id: &str, at_ms: i64) -> bool {
        self.expire_if_due(account_id, at_ms);
        self.expire_if_due(GLOBAL_SCOPE, at_ms);

        let entries = self.entries.read();
        let account_active = entries.get(account_id).map(|e| e.active).unwrap_or(false);
        let global_active = entries.get(GLOBAL_SCOPE).map(|e| e.active).unwrap_or(false);
        drop(entries);

        if account_active || global_active {
            return true;
        }

        // Fail-closed path: with the risk component in error (e.g. the
        // kill-switch state could not be restored, or a session is
        // terminally unauthorized), refuse trading.
        self.fail_closed
            && self.health.component_status(Component::Risk) == Some(ComponentStatus::Error)
    }

    /// Reason of the switch currently blocking an account, if any.
    pub fn active_reason(&self, account_id: &str) -> Option<String> {
        let entries = self.entries.read();
        if let Some(e) = entries.get(account_id).filter(|e| e.active) {
            return Some(e.reason.clone());
        }
        if let Some(e) = entries.get(GLOBAL_SCOPE).filter(|e| e.active) {
            return Some(e.reason.clone());
        }
        drop(entries);

        if self.fail_closed
            && self.health.component_status(Component::Risk) == Some(ComponentStatus::Error)
        {
            return Some(REASON_STATE_UNKNOWN.to_string());
        }
        None
    }

    pub fn entry(&self, scope: &str) -> Option<KillSwitchEntry> {
        self.entries.read().get(scope).cloned()
    }

    /// Clear an expired non-manual switch inline.
    fn expire_if_due(&self, scope: &str, at_ms: i64) {
        let due = {
            let entries = self.entries.read();
            entries.get(scope).is_some_and(|e| {
                e.active && !e.manual && at_ms - e.triggered_at_ms > self.ttl_ms as i64
            })
        };
        if due {
            self.clear_inner(scope, true, at_ms);
        }
    }

    /// Periodic sweep applying the same TTL cleanup to every scope.
    pub fn sweep(&self) {
        self.sweep_at(now_ms());
    }

    pub fn sweep_at(&self, at_ms: i64) {
        let scopes: Vec<String> = self.entries.read().keys().cloned().collect();
        for scope in scopes {
            self.expire_if_due(&scope, at_ms);
        }
    }

    // -------------------------------------------------------------------------
    // Startup restore
    // -------------------------------------------------------------------------

    /// Restore persisted switches. On a read failure with fail-closed set,
    /// the global switch trips with [`REASON_STATE_UNKNOWN`].
    pub fn restore(&self, rows: Result<Vec<(String, Value)>, EngineError>) {
        self.restore_at(rows, now_ms());
    }

    pub fn restore_at(&self, rows: Result<Vec<(String, Value)>, EngineError>, at_ms: i64) {
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "kill-switch state could not be restored");
                if self.fail_closed {
                    self.trigger_at(GLOBAL_SCOPE, REASON_STATE_UNKNOWN, false, at_ms);
                } else {
                    warn!("fail-open: continuing without restored kill-switch state");
                }
                return;
            }
        };

        for (scope, value) in rows {
            let entry: KillSwitchEntry = match serde_json::from_value(value) {
                Ok(e) => e,
                Err(e) => {
                    warn!(scope = %scope, error = %e, "unreadable kill-switch row skipped");
                    continue;
                }
            };

            if !entry.active {
                continue;
            }

            if !entry.manual && at_ms - entry.triggered_at_ms > self.ttl_ms as i64 {
                info!(scope = %scope, reason = %entry.reason, "expired kill switch cleared on restore");
                let mut cleared = entry.clone();
                cleared.active = false;
                cleared.cleared_at_ms = Some(at_ms);
                self.persist(&scope, &cleared);
                self.entries.write().insert(scope.clone(), cleared);
                continue;
            }

            info!(scope = %scope, reason = %entry.reason, manual = entry.manual, "kill switch restored");
            self.entries.write().insert(scope.clone(), entry.clone());
            self.health.set_component(
                Component::Risk,
                ComponentStatus::Degraded,
                Some(format!("kill switch active ({scope}): {}", entry.reason)),
            );
            self.notify(KillSwitchEvent {
                scope: scope.clone(),
                active: true,
                reason: entry.reason.clone(),
                manual: entry.manual,
                auto_cleared: false,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn persist(&self, scope: &str, entry: &KillSwitchEntry) {
        if let Ok(value) = serde_json::to_value(entry) {
            self.writer.enqueue(WriteOp::UpsertSetting {
                account_id: scope.to_string(),
                key: keys::KILL_SWITCH.to_string(),
                value,
            });
        }
    }

    fn notify(&self, event: KillSwitchEvent) {
        let listeners: Vec<KillSwitchListener> = self.listeners.read().clone();
        for l in listeners {
            l(&event);
        }
    }

    /// Recompute the risk component status after a clear.
    fn refresh_health(&self) {
        let any_active = self.entries.read().values().any(|e| e.active);
        if !any_active
            && self.health.component_status(Component::Risk) != Some(ComponentStatus::Error)
        {
            self.health
                .set_component(Component::Risk, ComponentStatus::Ok, None);
        }
    }
}

impl std::fmt::Debug for KillSwitches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitches")
            .field("ttl_ms", &self.ttl_ms)
            .field("fail_closed", &self.fail_closed)
            .finish()
    }
}

fn scope_account(scope: &str) -> Option<String> {
    if scope == GLOBAL_SCOPE {
        None
    } else {
        Some(scope.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn switches(ttl_ms: u64, fail_closed: bool) -> KillSwitches {
        KillSwitches::new(
            ttl_ms,
            fail_closed,
            StoreWriter::detached(),
            Arc::new(HealthMonitor::new()),
        )
    }

    #[test]
    fn kill_switch_auto_clear() {
        let health = Arc::new(HealthMonitor::new());
        let ks = KillSwitches::new(1_000, true, StoreWriter::detached(), health.clone());

        ks.trigger_at("acc-2", "REJECT_SPIKE", false, 0);
        assert!(ks.is_active_at("acc-2", 500));

        // Past the TTL: cleared inline on read, with an auto-clear event.
        assert!(!ks.is_active_at("acc-2", 1_500));
        assert!(health
            .recent_events()
            .iter()
            .any(|e| e.kind == "kill_switch_auto_clear"));

        // A manual trigger of any age is never auto-cleared.
        ks.trigger_at("acc-2", "operator stop", true, 0);
        assert!(ks.is_active_at("acc-2", 1_500));
        assert!(ks.is_active_at("acc-2", i64::MAX / 2));
    }

    #[test]
    fn sweep_clears_expired_non_manual() {
        let ks = switches(1_000, true);
        ks.trigger_at("acc-1", "SLIPPAGE_SPIKE", false, 0);
        ks.trigger_at("acc-2", "operator stop", true, 0);

        ks.sweep_at(2_000);

        assert!(!ks.entry("acc-1").unwrap().active);
        assert!(ks.entry("acc-2").unwrap().active);
    }

    #[test]
    fn global_switch_blocks_every_account() {
        let ks = switches(60_000, true);
        ks.trigger_at(GLOBAL_SCOPE, "LATENCY_BLOWOUT", false, 0);

        assert!(ks.is_active_at("acc-1", 10));
        assert!(ks.is_active_at("acc-2", 10));
        assert_eq!(ks.active_reason("acc-1").as_deref(), Some("LATENCY_BLOWOUT"));
    }

    #[test]
    fn fail_closed_restore_on_store_error() {
        let ks = switches(60_000, true);
        ks.restore_at(Err(EngineError::PersistenceDegraded("db gone".into())), 0);

        assert!(ks.is_active_at("any-account", 10));
        assert_eq!(
            ks.entry(GLOBAL_SCOPE).unwrap().reason,
            REASON_STATE_UNKNOWN
        );
    }

    #[test]
    fn fail_open_restore_on_store_error() {
        let ks = switches(60_000, false);
        ks.restore_at(Err(EngineError::PersistenceDegraded("db gone".into())), 0);
        assert!(!ks.is_active_at("any-account", 10));
    }

    #[test]
    fn restore_clears_expired_and_keeps_live_rows() {
        let ks = switches(1_000, true);

        let expired = serde_json::to_value(KillSwitchEntry {
            active: true,
            reason: "REJECT_SPIKE".into(),
            triggered_at_ms: 0,
            manual: false,
            cleared_at_ms: None,
        })
        .unwrap();
        let manual = serde_json::to_value(KillSwitchEntry {
            active: true,
            reason: "operator stop".into(),
            triggered_at_ms: 0,
            manual: true,
            cleared_at_ms: None,
        })
        .unwrap();

        ks.restore_at(
            Ok(vec![("acc-1".into(), expired), ("acc-2".into(), manual)]),
            5_000,
        );

        assert!(!ks.is_active_at("acc-1", 5_000));
        assert!(ks.is_active_at("acc-2", 5_000));
    }

    #[test]
    fn listeners_observe_transitions_in_order() {
        let ks = switches(1_000, true);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        ks.add_listener(Arc::new(move |e: &KillSwitchEvent| {
            sink.lock().push((e.scope.clone(), e.active, e.auto_cleared));
        }));

        ks.trigger_at("acc-1", "VOLATILITY_SPIKE", false, 0);
        ks.is_active_at("acc-1", 2_000); // TTL expiry -> auto clear

        let seen = events.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("acc-1".to_string(), true, false));
        assert_eq!(seen[1], ("acc-1".to_string(), false, true));
    }

    #[test]
    fn risk_error_health_forces_active_when_fail_closed() {
        let health = Arc::new(HealthMonitor::new());
        let ks = KillSwitches::new(60_000, true, StoreWriter::detached(), health.clone());

        assert!(!ks.is_active_at("acc-1", 0));
        health.set_component(Component::Risk, ComponentStatus::Error, Some("auth".into()));
        assert!(ks.is_active_at("acc-1", 0));
        assert_eq!(
            ks.active_reason("acc-1").as_deref(),
            Some(REASON_STATE_UNKNOWN)
        );
    }

    #[test]
    fn clear_is_idempotent_and_silent_when_inactive() {
        let ks = switches(1_000, true);
        ks.clear("acc-1"); // no entry at all
        ks.trigger_at("acc-1", "X", true, 0);
        ks.clear("acc-1");
        ks.clear("acc-1");
        assert!(!ks.entry("acc-1").unwrap().active);
    }

    #[test]
    fn persisted_shape_uses_contract_field_names() {
        let entry = KillSwitchEntry {
            active: true,
            reason: "R".into(),
            triggered_at_ms: 42,
            manual: false,
            cleared_at_ms: Some(50),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["active"], true);
        assert_eq!(value["triggeredAt"], 42);
        assert_eq!(value["manual"], false);
        assert_eq!(value["clearedAt"], 50);
    }
}
