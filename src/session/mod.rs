// =============================================================================
// Upstream session layer — one logical broker connection per account
// =============================================================================

pub mod backoff;
pub mod frames;
pub mod manager;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::EngineError;
use frames::Inbound;

/// Callback for unsolicited inbound frames on an account's session.
pub type StreamingListener = Arc<dyn Fn(&Inbound) + Send + Sync>;

/// Callback fired when a session (re)authorizes. The argument is
/// `is_reconnect`.
pub type ReadyListener = Arc<dyn Fn(bool) + Send + Sync>;

/// The engine-facing surface of the session layer. Everything above the
/// socket (tick streams, execution, reconciliation) talks to this trait so
/// tests can substitute an in-memory upstream.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Send a frame tagged with a fresh request id and await the correlated
    /// response within `deadline`.
    async fn request(
        &self,
        account_id: &str,
        frame: Value,
        deadline: Duration,
    ) -> Result<Inbound, EngineError>;

    /// Enqueue a frame without awaiting any response.
    async fn fire_and_forget(&self, account_id: &str, frame: Value) -> Result<(), EngineError>;

    /// Register a callback for unsolicited streaming frames.
    fn add_streaming_listener(&self, account_id: &str, listener: StreamingListener) -> u64;

    /// Remove a previously registered streaming listener.
    fn remove_streaming_listener(&self, account_id: &str, listener_id: u64);

    /// Register a callback fired on authorize / re-authorize.
    fn add_ready_listener(&self, account_id: &str, listener: ReadyListener) -> u64;
}

// =============================================================================
// Mock broker for tests
// =============================================================================
