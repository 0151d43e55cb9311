// =============================================================================
// Health & Recovery — component status map, resource monitor, event rings
// =============================================================================
//
// The single operational surface of the runtime. Subsystems report their
// status here; the resource monitor samples event-loop lag and opens the
// trading circuit under pressure; the snapshot is what an operator (or the
// out-of-scope API layer) reads.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent runtime events to retain.
const MAX_RECENT_EVENTS: usize = 100;
/// Consecutive lag breaches before the circuit opens.
const LAG_BREACHES_TO_OPEN: u32 = 3;
/// Consecutive clean samples before the circuit closes again.
const CLEAN_SAMPLES_TO_CLOSE: u32 = 6;

// ---------------------------------------------------------------------------
// Component status
// ---------------------------------------------------------------------------

/// Subsystems tracked in the component map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Session,
    TickStream,
    MarketData,
    Risk,
    Execution,
    Settlement,
    Persistence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub detail: Option<String>,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Event rings
// ---------------------------------------------------------------------------

/// A recorded error event for the operator log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

/// A recorded runtime event (kill-switch transition, settlement, pause...).
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub kind: String,
    pub account_id: Option<String>,
    pub detail: serde_json::Value,
    pub at: String,
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

/// Shared health handle. Cheap to clone behind `Arc`.
pub struct HealthMonitor {
    components: RwLock<HashMap<Component, ComponentHealth>>,
    recent_errors: RwLock<Vec<ErrorRecord>>,
    recent_events: RwLock<Vec<EventRecord>>,

    /// Monotonically increasing version, bumped on every mutation.
    state_version: AtomicU64,

    /// Last sampled event-loop lag in microseconds.
    loop_lag_us: AtomicU64,
    lag_breaches: AtomicU32,
    clean_samples: AtomicU32,
    circuit_open: AtomicBool,

    start: Instant,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            recent_errors: RwLock::new(Vec::new()),
            recent_events: RwLock::new(Vec::new()),
            state_version: AtomicU64::new(1),
            loop_lag_us: AtomicU64::new(0),
            lag_breaches: AtomicU32::new(0),
            clean_samples: AtomicU32::new(0),
            circuit_open: AtomicBool::new(false),
            start: Instant::now(),
        }
    }

    fn bump(&self) {
        self.state_version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Component map ───────────────────────────────────────────────────

    pub fn set_component(
        &self,
        component: Component,
        status: ComponentStatus,
        detail: Option<String>,
    ) {
        let mut map = self.components.write();
        let prev = map.get(&component).map(|c| c.status);
        map.insert(
            component,
            ComponentHealth {
                status,
                detail,
                updated_at: Utc::now().to_rfc3339(),
            },
        );
        drop(map);

        if prev != Some(status) {
            info!(component = ?component, status = ?status, "component status changed");
        }
        self.bump();
    }

    pub fn component_status(&self, component: Component) -> Option<ComponentStatus> {
        self.components.read().get(&component).map(|c| c.status)
    }

    // ── Rings ───────────────────────────────────────────────────────────

    pub fn push_error(&self, message: impl Into<String>, code: Option<String>) {
        let record = ErrorRecord {
            message: message.into(),
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.bump();
    }

    pub fn push_event(
        &self,
        kind: impl Into<String>,
        account_id: Option<String>,
        detail: serde_json::Value,
    ) {
        let record = EventRecord {
            kind: kind.into(),
            account_id,
            detail,
            at: Utc::now().to_rfc3339(),
        };

        let mut events = self.recent_events.write();
        events.push(record);
        while events.len() > MAX_RECENT_EVENTS {
            events.remove(0);
        }
        drop(events);
        self.bump();
    }

    pub fn recent_events(&self) -> Vec<EventRecord> {
        self.recent_events.read().clone()
    }

    // ── Resource circuit ────────────────────────────────────────────────

    /// Whether the resource circuit is open (new orders refused).
    pub fn circuit_open(&self) -> bool {
        self.circuit_open.load(Ordering::Relaxed)
    }

    /// Feed one lag sample into the circuit state machine.
    pub fn observe_lag(&self, lag: Duration, threshold: Duration) {
        self.loop_lag_us.store(lag.as_micros() as u64, Ordering::Relaxed);

        if lag > threshold {
            self.clean_samples.store(0, Ordering::Relaxed);
            let breaches = self.lag_breaches.fetch_add(1, Ordering::Relaxed) + 1;
            if breaches >= LAG_BREACHES_TO_OPEN && !self.circuit_open.swap(true, Ordering::Relaxed)
            {
                warn!(lag_ms = lag.as_millis() as u64, "resource circuit opened");
                self.push_event("resource_circuit_open", None, serde_json::json!({
                    "lag_ms": lag.as_millis() as u64,
                }));
            }
        } else {
            self.lag_breaches.store(0, Ordering::Relaxed);
            let clean = self.clean_samples.fetch_add(1, Ordering::Relaxed) + 1;
            if clean >= CLEAN_SAMPLES_TO_CLOSE && self.circuit_open.swap(false, Ordering::Relaxed) {
                info!("resource circuit closed");
                self.push_event("resource_circuit_close", None, serde_json::Value::Null);
            }
        }
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            state_version: self.state_version(),
            uptime_s: self.start.elapsed().as_secs(),
            loop_lag_us: self.loop_lag_us.load(Ordering::Relaxed),
            circuit_open: self.circuit_open(),
            components: self.components.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            recent_events: self.recent_events.read().clone(),
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("circuit_open", &self.circuit_open())
            .finish()
    }
}

/// Serialisable health snapshot for the operator boundary.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state_version: u64,
    pub uptime_s: u64,
    pub loop_lag_us: u64,
    pub circuit_open: bool,
    pub components: HashMap<Component, ComponentHealth>,
    pub recent_errors: Vec<ErrorRecord>,
    pub recent_events: Vec<EventRecord>,
}

// ---------------------------------------------------------------------------
// Resource monitor loop
// ---------------------------------------------------------------------------

/// Sample event-loop lag by measuring timer drift. A 100ms interval that
/// fires late by more than the threshold indicates scheduler pressure.
///
/// Runs until `shutdown` resolves.
pub async fn run_resource_monitor(
    health: Arc<HealthMonitor>,
    threshold: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    const SAMPLE_EVERY: Duration = Duration::from_millis(100);
    debug!(threshold_ms = threshold.as_millis() as u64, "resource monitor started");

    loop {
        let before = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(SAMPLE_EVERY) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("resource monitor stopping");
                    return;
                }
            }
        }
        let lag = before.elapsed().saturating_sub(SAMPLE_EVERY);
        health.observe_lag(lag, threshold);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_status_transitions_bump_version() {
        let h = HealthMonitor::new();
        let v0 = h.state_version();

        h.set_component(Component::Risk, ComponentStatus::Ok, None);
        assert_eq!(h.component_status(Component::Risk), Some(ComponentStatus::Ok));
        assert!(h.state_version() > v0);

        h.set_component(
            Component::Risk,
            ComponentStatus::Error,
            Some("auth failed".into()),
        );
        assert_eq!(
            h.component_status(Component::Risk),
            Some(ComponentStatus::Error)
        );
    }

    #[test]
    fn error_ring_caps_at_limit() {
        let h = HealthMonitor::new();
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            h.push_error(format!("e{i}"), None);
        }
        let snap = h.snapshot();
        assert_eq!(snap.recent_errors.len(), MAX_RECENT_ERRORS);
        // Oldest entries evicted first.
        assert_eq!(snap.recent_errors[0].message, "e10");
    }

    #[test]
    fn event_ring_caps_at_limit() {
        let h = HealthMonitor::new();
        for i in 0..(MAX_RECENT_EVENTS + 5) {
            h.push_event("tick", None, serde_json::json!({ "i": i }));
        }
        assert_eq!(h.recent_events().len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn circuit_opens_after_consecutive_breaches_and_recovers() {
        let h = HealthMonitor::new();
        let threshold = Duration::from_millis(100);

        // Two breaches are not enough.
        h.observe_lag(Duration::from_millis(500), threshold);
        h.observe_lag(Duration::from_millis(500), threshold);
        assert!(!h.circuit_open());

        // Third consecutive breach opens the circuit.
        h.observe_lag(Duration::from_millis(500), threshold);
        assert!(h.circuit_open());

        // A single clean sample does not close it.
        h.observe_lag(Duration::from_millis(1), threshold);
        assert!(h.circuit_open());

        // Enough clean samples close it.
        for _ in 0..CLEAN_SAMPLES_TO_CLOSE {
            h.observe_lag(Duration::from_millis(1), threshold);
        }
        assert!(!h.circuit_open());
    }

    #[test]
    fn breach_counter_resets_on_clean_sample() {
        let h = HealthMonitor::new();
        let threshold = Duration::from_millis(100);

        h.observe_lag(Duration::from_millis(500), threshold);
        h.observe_lag(Duration::from_millis(500), threshold);
        h.observe_lag(Duration::from_millis(1), threshold);
        h.observe_lag(Duration::from_millis(500), threshold);
        h.observe_lag(Duration::from_millis(500), threshold);
        assert!(!h.circuit_open(), "non-consecutive breaches must not open");
    }

    #[test]
    fn snapshot_is_serialisable() {
        let h = HealthMonitor::new();
        h.set_component(Component::Session, ComponentStatus::Ok, None);
        h.push_error("boom", Some("E1".into()));
        let json = serde_json::to_string(&h.snapshot()).unwrap();
        assert!(json.contains("\"session\""));
        assert!(json.contains("boom"));
    }
}
