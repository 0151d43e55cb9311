// =============================================================================
// Shared types used across the Meridian trading runtime
// =============================================================================

use serde::{Deserialize, Serialize};

/// Opaque broker account identifier.
pub type AccountId = String;

/// Contract direction for a binary option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "PUT")]
    Put,
}

impl Direction {
    /// Upstream contract_type string for proposal frames.
    pub fn contract_type(&self) -> &'static str {
        match self {
            Self::Call => "CALL",
            Self::Put => "PUT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.contract_type())
    }
}

/// Whether an account trades real funds or demo balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKind {
    Real,
    Demo,
}

impl Default for AccountKind {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "real"),
            Self::Demo => write!(f, "demo"),
        }
    }
}

/// Lifecycle state of a bot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Stopped,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// How an order is priced against the proposal spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderMode {
    /// Accept whatever the proposal quotes.
    Market,
    /// Accept the proposal only while spot stays within the slippage band.
    HybridLimitMarket,
}

impl Default for OrderMode {
    fn default() -> Self {
        Self::Market
    }
}

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// UTC calendar date key, e.g. "2026-08-01".
pub fn utc_date_key(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}
