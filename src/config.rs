// =============================================================================
// Engine Configuration — JSON file + environment overlay with atomic save
// =============================================================================
//
// Every tunable lives here. The JSON file is the durable source; recognized
// environment variables override it at load time so operators can retune a
// deployment without editing the file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_upstream_ws_url() -> String {
    "wss://ws.example-broker.com/websockets/v3".to_string()
}

fn default_db_path() -> String {
    "meridian.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_kill_switch_auto_clear_ms() -> u64 {
    300_000
}

fn default_reject_spike_limit() -> u32 {
    10
}

fn default_reconnect_storm_limit() -> u32 {
    5
}

fn default_slippage_spike_limit() -> u32 {
    5
}

fn default_max_cancels_per_second() -> u32 {
    5
}

fn default_latency_blowout_p99_ms() -> u64 {
    800
}

fn default_latency_blowout_window_ms() -> u64 {
    10_000
}

fn default_latency_blowout_breaches() -> u32 {
    3
}

fn default_reconcile_portfolio_timeout_ms() -> u64 {
    10_000
}

fn default_order_intent_ttl_ms() -> u64 {
    600_000
}

fn default_order_intent_max_size() -> usize {
    4_096
}

fn default_tick_buffer_size() -> usize {
    100
}

fn default_ticks_history_count() -> u32 {
    50
}

fn default_strategy_budget_ms() -> u64 {
    50
}

fn default_idle_threshold_ms() -> u64 {
    30_000
}

fn default_pong_deadline_ms() -> u64 {
    10_000
}

fn default_outbound_queue_cap() -> usize {
    256
}

fn default_inbound_inflight_cap() -> usize {
    512
}

fn default_request_deadline_ms() -> u64 {
    15_000
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_loop_lag_threshold_ms() -> u64 {
    250
}

// =============================================================================
// SessionConfig
// =============================================================================

/// Tunables for the upstream session layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time before a ping is sent.
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,

    /// Time after a ping without any inbound traffic before the socket is
    /// closed with "heartbeat_failed".
    #[serde(default = "default_pong_deadline_ms")]
    pub pong_deadline_ms: u64,

    /// Hard cap on the per-session outbound queue.
    #[serde(default = "default_outbound_queue_cap")]
    pub outbound_queue_cap: usize,

    /// In-flight inbound frames before reads cooperatively yield.
    #[serde(default = "default_inbound_inflight_cap")]
    pub inbound_inflight_cap: usize,

    /// Default deadline applied when a caller does not supply one.
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,

    /// Reconnect backoff base (doubled per attempt, full jitter).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Reconnect backoff ceiling.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold_ms(),
            pong_deadline_ms: default_pong_deadline_ms(),
            outbound_queue_cap: default_outbound_queue_cap(),
            inbound_inflight_cap: default_inbound_inflight_cap(),
            request_deadline_ms: default_request_deadline_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Upstream & storage --------------------------------------------------
    /// Broker WebSocket endpoint.
    #[serde(default = "default_upstream_ws_url")]
    pub upstream_ws_url: String,

    /// SQLite store path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    // --- Session layer -------------------------------------------------------
    #[serde(default)]
    pub session: SessionConfig,

    // --- Kill switch ---------------------------------------------------------
    /// TTL after which a non-manual kill switch auto-clears.
    #[serde(default = "default_kill_switch_auto_clear_ms")]
    pub kill_switch_auto_clear_ms: u64,

    /// Fail closed when kill-switch state cannot be restored at startup.
    #[serde(default = "default_true")]
    pub kill_switch_fail_closed: bool,

    // --- Automatic trigger limits (per 60s window unless noted) -------------
    #[serde(default = "default_reject_spike_limit")]
    pub reject_spike_limit: u32,

    #[serde(default = "default_reconnect_storm_limit")]
    pub reconnect_storm_limit: u32,

    #[serde(default = "default_slippage_spike_limit")]
    pub slippage_spike_limit: u32,

    /// Cancels per second before CANCEL_RATE_SPIKE trips.
    #[serde(default = "default_max_cancels_per_second")]
    pub default_max_cancels_per_second: u32,

    // --- Latency blowout -----------------------------------------------------
    #[serde(default = "default_latency_blowout_p99_ms")]
    pub latency_blowout_p99_ms: u64,

    #[serde(default = "default_latency_blowout_window_ms")]
    pub latency_blowout_window_ms: u64,

    #[serde(default = "default_latency_blowout_breaches")]
    pub latency_blowout_breaches: u32,

    // --- Recovery ------------------------------------------------------------
    #[serde(default = "default_reconcile_portfolio_timeout_ms")]
    pub reconcile_portfolio_timeout_ms: u64,

    // --- Order intents -------------------------------------------------------
    #[serde(default = "default_order_intent_ttl_ms")]
    pub order_intent_ttl_ms: u64,

    #[serde(default = "default_order_intent_max_size")]
    pub order_intent_max_size: usize,

    // --- Market data ---------------------------------------------------------
    #[serde(default = "default_tick_buffer_size")]
    pub tick_buffer_size: usize,

    #[serde(default = "default_ticks_history_count")]
    pub ticks_history_count: u32,

    // --- Strategy ------------------------------------------------------------
    /// Default compute budget per evaluation when a run does not set one.
    #[serde(default = "default_strategy_budget_ms")]
    pub strategy_budget_ms: u64,

    // --- Health --------------------------------------------------------------
    /// Event-loop lag before the resource circuit opens.
    #[serde(default = "default_loop_lag_threshold_ms")]
    pub loop_lag_threshold_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upstream_ws_url: default_upstream_ws_url(),
            db_path: default_db_path(),
            session: SessionConfig::default(),
            kill_switch_auto_clear_ms: default_kill_switch_auto_clear_ms(),
            kill_switch_fail_closed: true,
            reject_spike_limit: default_reject_spike_limit(),
            reconnect_storm_limit: default_reconnect_storm_limit(),
            slippage_spike_limit: default_slippage_spike_limit(),
            default_max_cancels_per_second: default_max_cancels_per_second(),
            latency_blowout_p99_ms: default_latency_blowout_p99_ms(),
            latency_blowout_window_ms: default_latency_blowout_window_ms(),
            latency_blowout_breaches: default_latency_blowout_breaches(),
            reconcile_portfolio_timeout_ms: default_reconcile_portfolio_timeout_ms(),
            order_intent_ttl_ms: default_order_intent_ttl_ms(),
            order_intent_max_size: default_order_intent_max_size(),
            tick_buffer_size: default_tick_buffer_size(),
            ticks_history_count: default_ticks_history_count(),
            strategy_budget_ms: default_strategy_budget_ms(),
            loop_lag_threshold_ms: default_loop_lag_threshold_ms(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`, then apply environment
    /// overrides.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config.apply_env();

        info!(
            path = %path.display(),
            upstream = %config.upstream_ws_url,
            db = %config.db_path,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Overlay recognized environment variables onto the loaded config.
    pub fn apply_env(&mut self) {
        env_override_u64("KILL_SWITCH_AUTO_CLEAR_MS", &mut self.kill_switch_auto_clear_ms);
        env_override_bool("KILL_SWITCH_FAIL_CLOSED", &mut self.kill_switch_fail_closed);
        env_override_u32("REJECT_SPIKE_LIMIT", &mut self.reject_spike_limit);
        env_override_u32("RECONNECT_STORM_LIMIT", &mut self.reconnect_storm_limit);
        env_override_u32("SLIPPAGE_SPIKE_LIMIT", &mut self.slippage_spike_limit);
        env_override_u32(
            "DEFAULT_MAX_CANCELS_PER_SECOND",
            &mut self.default_max_cancels_per_second,
        );
        env_override_u64("LATENCY_BLOWOUT_P99_MS", &mut self.latency_blowout_p99_ms);
        env_override_u64("LATENCY_BLOWOUT_WINDOW_MS", &mut self.latency_blowout_window_ms);
        env_override_u32("LATENCY_BLOWOUT_BREACHES", &mut self.latency_blowout_breaches);
        env_override_u64(
            "RECONCILE_PORTFOLIO_TIMEOUT_MS",
            &mut self.reconcile_portfolio_timeout_ms,
        );
        env_override_u64("ORDER_INTENT_TTL_MS", &mut self.order_intent_ttl_ms);
        env_override_usize("ORDER_INTENT_MAX_SIZE", &mut self.order_intent_max_size);
        env_override_usize("TICK_BUFFER_SIZE", &mut self.tick_buffer_size);
        env_override_u32("TICKS_HISTORY_COUNT", &mut self.ticks_history_count);
        env_override_u64("STRATEGY_BUDGET_MS", &mut self.strategy_budget_ms);

        if let Ok(url) = std::env::var("UPSTREAM_WS_URL") {
            if !url.is_empty() {
                self.upstream_ws_url = url;
            }
        }
        if let Ok(db) = std::env::var("MERIDIAN_DB_PATH") {
            if !db.is_empty() {
                self.db_path = db;
            }
        }
    }
}

fn env_override_u64(name: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var = name, value = %raw, "ignoring unparseable env override"),
        }
    }
}

fn env_override_u32(name: &str, slot: &mut u32) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var = name, value = %raw, "ignoring unparseable env override"),
        }
    }
}

fn env_override_usize(name: &str, slot: &mut usize) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var = name, value = %raw, "ignoring unparseable env override"),
        }
    }
}

fn env_override_bool(name: &str, slot: &mut bool) {
    if let Ok(raw) = std::env::var(name) {
        match raw.as_str() {
            "1" | "true" | "TRUE" | "yes" => *slot = true,
            "0" | "false" | "FALSE" | "no" => *slot = false,
            _ => warn!(var = name, value = %raw, "ignoring unparseable env override"),
        }
    }
}
