// =============================================================================
// Tagged error variants for the Meridian runtime
// =============================================================================
//
// Every failure that crosses a component boundary is one of these variants.
// Callers match on the variant, not on message strings; retryability is a
// property of the variant (see `is_retriable`).
// =============================================================================

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Reason codes produced by the pre-trade risk gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskReason {
    MaxOrderSize,
    MaxNotional,
    MaxExposure,
    OrdersPerSecond,
    OrdersPerMinute,
    DailyLoss,
    Drawdown,
    TradeCooldown,
    LossStreak,
    MaxConcurrent,
    StakeLimit,
}

impl std::fmt::Display for RiskReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MaxOrderSize => "MAX_ORDER_SIZE",
            Self::MaxNotional => "MAX_NOTIONAL",
            Self::MaxExposure => "MAX_EXPOSURE",
            Self::OrdersPerSecond => "ORDERS_PER_SECOND",
            Self::OrdersPerMinute => "ORDERS_PER_MINUTE",
            Self::DailyLoss => "DAILY_LOSS",
            Self::Drawdown => "DRAWDOWN",
            Self::TradeCooldown => "TRADE_COOLDOWN",
            Self::LossStreak => "LOSS_STREAK",
            Self::MaxConcurrent => "MAX_CONCURRENT",
            Self::StakeLimit => "STAKE_LIMIT",
        };
        f.write_str(s)
    }
}

/// Every error the core surfaces across a component boundary.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Input shape invalid; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Authorization failed; the session is terminal.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// The socket dropped with the request in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// The per-request deadline expired.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The bounded outbound queue is at capacity.
    #[error("outbound queue full")]
    QueueFull,

    /// Upstream rejected transiently (rate limit etc.); retriable with backoff.
    #[error("upstream transient error [{code}]: {message}")]
    UpstreamTransient { code: String, message: String },

    /// Upstream rejected permanently (invalid market/contract).
    #[error("upstream fatal error [{code}]: {message}")]
    UpstreamFatal { code: String, message: String },

    /// Local pre-trade denial; not retried.
    #[error("risk gate: {0}")]
    RiskGate(RiskReason),

    /// An order intent with this correlation id is already pending.
    #[error("duplicate correlation id rejected")]
    DuplicateRejected,

    /// A kill switch forbids new orders.
    #[error("kill switch active: {0}")]
    KillSwitch(String),

    /// The proposal spot moved outside the configured band.
    #[error("slippage {observed_pct:.4}% exceeds limit {limit_pct:.4}%")]
    SlippageExceeded { observed_pct: f64, limit_pct: f64 },

    /// The store is unavailable; the core continues on in-memory state.
    #[error("persistence degraded: {0}")]
    PersistenceDegraded(String),
}

impl EngineError {
    /// Map an upstream `{error: {code, message}}` payload onto a variant.
    ///
    /// Codes the broker documents:
    ///   AuthorizationRequired / InvalidToken  -> Auth (session terminal)
    ///   RateLimit                             -> UpstreamTransient
    ///   InsufficientBalance / MarketIsClosed  -> UpstreamFatal
    ///   anything else                         -> UpstreamFatal
    pub fn from_upstream(code: &str, message: &str) -> Self {
        match code {
            "AuthorizationRequired" | "InvalidToken" | "AUTHORIZATION_FAILED" => {
                Self::Auth(format!("[{code}] {message}"))
            }
            "RateLimit" | "RATE_LIMITED" => Self::UpstreamTransient {
                code: code.to_string(),
                message: message.to_string(),
            },
            _ => Self::UpstreamFatal {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }

    /// Whether the caller's retry policy may re-issue the failed operation.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost
                | Self::RequestTimeout(_)
                | Self::QueueFull
                | Self::UpstreamTransient { .. }
        )
    }

    /// Short machine-readable tag for telemetry and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::Auth(_) => "AUTH",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::RequestTimeout(_) => "REQUEST_TIMEOUT",
            Self::QueueFull => "QUEUE_FULL",
            Self::UpstreamTransient { .. } => "UPSTREAM_TRANSIENT",
            Self::UpstreamFatal { .. } => "UPSTREAM_FATAL",
            Self::RiskGate(_) => "RISK_GATE",
            Self::DuplicateRejected => "DUPLICATE_REJECTED",
            Self::KillSwitch(_) => "KILL_SWITCH",
            Self::SlippageExceeded { .. } => "SLIPPAGE_EXCEEDED",
            Self::PersistenceDegraded(_) => "PERSISTENCE_DEGRADED",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::PersistenceDegraded(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(format!("malformed JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_reason_display_is_screaming_snake() {
        assert_eq!(RiskReason::OrdersPerSecond.to_string(), "ORDERS_PER_SECOND");
        assert_eq!(RiskReason::DailyLoss.to_string(), "DAILY_LOSS");
        assert_eq!(RiskReason::StakeLimit.to_string(), "STAKE_LIMIT");
    }

    #[test]
    fn upstream_mapping_auth_is_terminal() {
        let e = EngineError::from_upstream("InvalidToken", "token expired");
        assert!(matches!(e, EngineError::Auth(_)));
        assert!(!e.is_retriable());
    }

    #[test]
    fn upstream_mapping_rate_limit_is_transient() {
        let e = EngineError::from_upstream("RateLimit", "slow down");
        assert!(matches!(e, EngineError::UpstreamTransient { .. }));
        assert!(e.is_retriable());
    }

    #[test]
    fn upstream_mapping_unknown_is_fatal() {
        let e = EngineError::from_upstream("InvalidContract", "no such market");
        assert!(matches!(e, EngineError::UpstreamFatal { .. }));
        assert!(!e.is_retriable());
    }

    #[test]
    fn retriable_partition() {
        assert!(EngineError::QueueFull.is_retriable());
        assert!(EngineError::ConnectionLost.is_retriable());
        assert!(!EngineError::DuplicateRejected.is_retriable());
        assert!(!EngineError::RiskGate(RiskReason::MaxExposure).is_retriable());
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(EngineError::QueueFull.kind(), "QUEUE_FULL");
        assert_eq!(
            EngineError::SlippageExceeded {
                observed_pct: 1.0,
                limit_pct: 0.5
            }
            .kind(),
            "SLIPPAGE_EXCEEDED"
        );
    }
}
