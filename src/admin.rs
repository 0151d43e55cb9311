// =============================================================================
// Admin Surface — operator entry points at the core boundary
// =============================================================================
//
// The HTTP layer lives outside the core; these are the operations it calls
// into. Global kill-switch actions require the admin token, compared in
// constant time.
// =============================================================================

use std::sync::Arc;

use tracing::warn;

use crate::errors::EngineError;
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::risk::kill_switch::KillSwitches;
use crate::store::GLOBAL_SCOPE;
use crate::telemetry::{Telemetry, TelemetrySnapshot};

/// Compare two byte slices in constant time. The comparison always examines
/// every byte of both slices even when a mismatch is found early, preventing
/// timing side-channels.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Operator-facing handle over the kill switches and the observability
/// snapshots.
pub struct AdminSurface {
    switches: Arc<KillSwitches>,
    telemetry: Arc<Telemetry>,
    health: Arc<HealthMonitor>,
    admin_token: Option<String>,
}

impl AdminSurface {
    pub fn new(
        switches: Arc<KillSwitches>,
        telemetry: Arc<Telemetry>,
        health: Arc<HealthMonitor>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            switches,
            telemetry,
            health,
            admin_token,
        }
    }

    fn check_admin_token(&self, presented: Option<&str>) -> Result<(), EngineError> {
        let expected = match &self.admin_token {
            Some(t) if !t.is_empty() => t,
            _ => {
                warn!("admin token is not configured — global actions are rejected");
                return Err(EngineError::Auth("admin token not configured".to_string()));
            }
        };
        let presented =
            presented.ok_or_else(|| EngineError::Auth("admin token required".to_string()))?;

        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(EngineError::Auth("invalid admin token".to_string()));
        }
        Ok(())
    }

    /// Activate a kill switch manually. `account_id: None` targets the global
    /// switch and requires the admin token.
    pub fn activate_kill_switch(
        &self,
        account_id: Option<&str>,
        reason: &str,
        token: Option<&str>,
    ) -> Result<(), EngineError> {
        let scope = match account_id {
            Some(account) => account,
            None => {
                self.check_admin_token(token)?;
                GLOBAL_SCOPE
            }
        };
        self.switches.trigger(scope, reason, true);
        Ok(())
    }

    /// Clear a kill switch. Clearing the global switch requires the admin
    /// token.
    pub fn clear_kill_switch(
        &self,
        account_id: Option<&str>,
        token: Option<&str>,
    ) -> Result<(), EngineError> {
        let scope = match account_id {
            Some(account) => account,
            None => {
                self.check_admin_token(token)?;
                GLOBAL_SCOPE
            }
        };
        self.switches.clear(scope);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }
}

impl std::fmt::Debug for AdminSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSurface")
            .field("admin_token", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreWriter;

    fn surface(token: Option<&str>) -> (AdminSurface, Arc<KillSwitches>) {
        let health = Arc::new(HealthMonitor::new());
        let switches = Arc::new(KillSwitches::new(
            60_000,
            true,
            StoreWriter::detached(),
            health.clone(),
        ));
        let surface = AdminSurface::new(
            switches.clone(),
            Arc::new(Telemetry::new()),
            health,
            token.map(|t| t.to_string()),
        );
        (surface, switches)
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn account_switch_needs_no_token() {
        let (surface, switches) = surface(Some("tok"));
        surface
            .activate_kill_switch(Some("acc-1"), "operator stop", None)
            .unwrap();
        assert!(switches.is_active("acc-1"));
        assert!(switches.entry("acc-1").unwrap().manual);

        surface.clear_kill_switch(Some("acc-1"), None).unwrap();
        assert!(!switches.is_active("acc-1"));
    }

    #[test]
    fn global_switch_requires_valid_token() {
        let (surface, switches) = surface(Some("tok"));

        assert!(matches!(
            surface.activate_kill_switch(None, "stop all", None),
            Err(EngineError::Auth(_))
        ));
        assert!(matches!(
            surface.activate_kill_switch(None, "stop all", Some("wrong")),
            Err(EngineError::Auth(_))
        ));
        assert!(switches.entry(GLOBAL_SCOPE).is_none());

        surface
            .activate_kill_switch(None, "stop all", Some("tok"))
            .unwrap();
        assert!(switches.is_active("any-account"));

        surface.clear_kill_switch(None, Some("tok")).unwrap();
        assert!(!switches.is_active("any-account"));
    }

    #[test]
    fn unconfigured_token_rejects_global_actions() {
        let (surface, _) = surface(None);
        assert!(matches!(
            surface.activate_kill_switch(None, "stop all", Some("anything")),
            Err(EngineError::Auth(_))
        ));
    }

    #[test]
    fn manual_trigger_never_auto_clears() {
        let (surface, switches) = surface(Some("tok"));
        surface
            .activate_kill_switch(Some("acc-1"), "operator stop", None)
            .unwrap();

        // Far beyond any TTL.
        assert!(switches.is_active_at("acc-1", i64::MAX / 2));
    }

    #[test]
    fn snapshots_are_available() {
        let (surface, _) = surface(Some("tok"));
        let _ = surface.metrics_snapshot();
        let health = surface.health_snapshot();
        assert!(!health.circuit_open);
    }
}
