// =============================================================================
// Wire frames — the upstream broker's JSON protocol
// =============================================================================
//
// The broker speaks opaque JSON over WebSocket. Responses carry `msg_type`;
// request/response correlation uses `req_id`. Only the fields enumerated here
// are interpreted; everything else rides along opaquely in `payload`.
// =============================================================================

use std::time::Instant;

use serde_json::{json, Value};

use crate::errors::EngineError;
use crate::types::now_ms;

/// A parsed inbound frame, stamped with a monotonic receive instant and a
/// wall-clock timestamp (used by downstream latency metrics).
#[derive(Debug, Clone)]
pub struct Inbound {
    pub msg_type: String,
    pub req_id: Option<u64>,
    pub payload: Value,
    pub received: Instant,
    pub received_at_ms: i64,
}

impl Inbound {
    /// Parse raw frame text. Fails only on malformed JSON; unknown message
    /// kinds are carried with their `msg_type` (or "unknown").
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let payload: Value = serde_json::from_str(text)?;
        Ok(Self::from_value(payload))
    }

    /// Wrap an already-parsed payload with fresh receive stamps.
    pub fn from_value(payload: Value) -> Self {
        let msg_type = payload["msg_type"].as_str().unwrap_or("unknown").to_string();
        let req_id = payload["req_id"].as_u64();
        Self {
            msg_type,
            req_id,
            payload,
            received: Instant::now(),
            received_at_ms: now_ms(),
        }
    }

    /// The `{error: {code, message}}` block, if present.
    pub fn error(&self) -> Option<(&str, &str)> {
        let err = self.payload.get("error")?;
        let code = err.get("code")?.as_str()?;
        let message = err.get("message").and_then(|m| m.as_str()).unwrap_or("");
        Some((code, message))
    }

    /// Convert an error frame into its mapped [`EngineError`], if any.
    pub fn as_error(&self) -> Option<EngineError> {
        self.error()
            .map(|(code, message)| EngineError::from_upstream(code, message))
    }
}

/// A live tick extracted from a `tick` streaming frame.
#[derive(Debug, Clone)]
pub struct WireTick {
    pub symbol: String,
    pub epoch: i64,
    pub quote: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

/// Extract a tick from a `tick` frame payload. Returns `None` when the frame
/// is not a tick or is missing required fields.
pub fn parse_tick(inbound: &Inbound) -> Option<WireTick> {
    if inbound.msg_type != "tick" {
        return None;
    }
    let tick = inbound.payload.get("tick")?;
    Some(WireTick {
        symbol: tick.get("symbol")?.as_str()?.to_string(),
        epoch: tick.get("epoch")?.as_i64()?,
        quote: tick.get("quote")?.as_f64()?,
        bid: tick.get("bid").and_then(|v| v.as_f64()),
        ask: tick.get("ask").and_then(|v| v.as_f64()),
    })
}

/// Extract (epoch, quote) pairs from a `history` response payload.
pub fn parse_history(payload: &Value) -> Vec<(i64, f64)> {
    let history = &payload["history"];
    let times = history["times"].as_array();
    let prices = history["prices"].as_array();

    match (times, prices) {
        (Some(times), Some(prices)) => times
            .iter()
            .zip(prices.iter())
            .filter_map(|(t, p)| Some((t.as_i64()?, p.as_f64()?)))
            .collect(),
        _ => Vec::new(),
    }
}

/// The upstream subscription id of a streaming response, used for `forget`.
pub fn subscription_id(payload: &Value) -> Option<String> {
    payload["subscription"]["id"].as_str().map(|s| s.to_string())
}

// =============================================================================
// Request frame builders
// =============================================================================

pub mod requests {
    use super::*;

    pub fn authorize(token: &str) -> Value {
        json!({ "authorize": token })
    }

    pub fn ticks_subscribe(symbol: &str) -> Value {
        json!({ "ticks": symbol, "subscribe": 1 })
    }

    pub fn ticks_history(symbol: &str, count: u32) -> Value {
        json!({
            "ticks_history": symbol,
            "count": count,
            "end": "latest",
            "style": "ticks",
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn proposal(
        amount: f64,
        contract_type: &str,
        currency: &str,
        duration: u32,
        duration_unit: &str,
        symbol: &str,
    ) -> Value {
        json!({
            "proposal": 1,
            "amount": amount,
            "basis": "stake",
            "contract_type": contract_type,
            "currency": currency,
            "duration": duration,
            "duration_unit": duration_unit,
            "symbol": symbol,
        })
    }

    pub fn buy(proposal_id: &str, price: f64) -> Value {
        json!({ "buy": proposal_id, "price": price })
    }

    pub fn open_contract_subscribe(contract_id: i64) -> Value {
        json!({
            "proposal_open_contract": 1,
            "contract_id": contract_id,
            "subscribe": 1,
        })
    }

    pub fn portfolio() -> Value {
        json!({ "portfolio": 1 })
    }

    pub fn forget(subscription_id: &str) -> Value {
        json!({ "forget": subscription_id })
    }

    pub fn order_book_subscribe(symbol: &str, depth: u32) -> Value {
        json!({ "order_book": symbol, "subscribe": 1, "depth": depth })
    }

    pub fn ping() -> Value {
        json!({ "ping": 1 })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stamps_and_classifies() {
        let inbound = Inbound::parse(r#"{"msg_type":"tick","req_id":4,"tick":{}}"#).unwrap();
        assert_eq!(inbound.msg_type, "tick");
        assert_eq!(inbound.req_id, Some(4));
        assert!(inbound.received_at_ms > 0);
    }

    #[test]
    fn parse_unknown_msg_type_is_carried() {
        let inbound = Inbound::parse(r#"{"something":"else"}"#).unwrap();
        assert_eq!(inbound.msg_type, "unknown");
        assert_eq!(inbound.req_id, None);
    }

    #[test]
    fn malformed_json_is_validation_error() {
        assert!(matches!(
            Inbound::parse("{nope"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn error_block_extraction() {
        let inbound = Inbound::parse(
            r#"{"msg_type":"buy","error":{"code":"RateLimit","message":"slow down"}}"#,
        )
        .unwrap();
        assert_eq!(inbound.error(), Some(("RateLimit", "slow down")));
        assert!(matches!(
            inbound.as_error(),
            Some(EngineError::UpstreamTransient { .. })
        ));
    }

    #[test]
    fn tick_extraction() {
        let inbound = Inbound::parse(
            r#"{"msg_type":"tick","tick":{"symbol":"R_100","epoch":1000,"quote":100.25,"bid":100.2,"ask":100.3}}"#,
        )
        .unwrap();
        let tick = parse_tick(&inbound).unwrap();
        assert_eq!(tick.symbol, "R_100");
        assert_eq!(tick.epoch, 1000);
        assert!((tick.quote - 100.25).abs() < f64::EPSILON);
        assert_eq!(tick.bid, Some(100.2));
    }

    #[test]
    fn tick_extraction_rejects_other_frames() {
        let inbound = Inbound::parse(r#"{"msg_type":"buy","tick":{}}"#).unwrap();
        assert!(parse_tick(&inbound).is_none());
    }

    #[test]
    fn history_pairs_times_with_prices() {
        let payload: Value = serde_json::from_str(
            r#"{"msg_type":"history","history":{"times":[1,2,3],"prices":[10.0,11.0,12.0]}}"#,
        )
        .unwrap();
        let pairs = parse_history(&payload);
        assert_eq!(pairs, vec![(1, 10.0), (2, 11.0), (3, 12.0)]);
    }

    #[test]
    fn history_missing_fields_is_empty() {
        let payload: Value = serde_json::from_str(r#"{"msg_type":"history"}"#).unwrap();
        assert!(parse_history(&payload).is_empty());
    }

    #[test]
    fn request_builders_carry_required_fields() {
        let p = requests::proposal(2.5, "CALL", "USD", 5, "t", "R_100");
        assert_eq!(p["proposal"], 1);
        assert_eq!(p["basis"], "stake");
        assert_eq!(p["contract_type"], "CALL");
        assert_eq!(p["duration_unit"], "t");

        let b = requests::buy("prop-9", 2.61);
        assert_eq!(b["buy"], "prop-9");

        let t = requests::ticks_subscribe("R_100");
        assert_eq!(t["subscribe"], 1);

        let f = requests::forget("sub-1");
        assert_eq!(f["forget"], "sub-1");

        let ob = requests::order_book_subscribe("R_100", 10);
        assert_eq!(ob["depth"], 10);
    }
}
