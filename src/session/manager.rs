// =============================================================================
// Session Manager — one authorized broker connection per account
// =============================================================================
//
// Responsibilities per session:
//   - authorize on open, re-authorize on every reconnect
//   - correlate responses to waiters by req_id, with per-request deadlines
//   - serialize all outbound frames through one bounded queue (QUEUE_FULL
//     beyond capacity)
//   - fan unsolicited frames out to streaming listeners, in arrival order
//   - heartbeat on idle, close on missed pong ("heartbeat_failed")
//   - reconnect with capped exponential backoff and full jitter
//
// An authorization error is terminal for the session: the socket is not
// retried and the risk component is flipped to error so the kill switch's
// fail-closed path can engage.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::errors::EngineError;
use crate::health::{Component, ComponentStatus, HealthMonitor};
use crate::telemetry::Telemetry;

use super::backoff::backoff_delay;
use super::frames::{requests, Inbound};
use super::transport::{ConnectionRx, ConnectionTx, Transport};
use super::{Broker, ReadyListener, StreamingListener};

// ---------------------------------------------------------------------------
// Listener registry
// ---------------------------------------------------------------------------

/// Streaming + ready listeners for one account. Lives independently of the
/// session so registration can precede connection.
pub struct ListenerSet {
    streaming: RwLock<Vec<(u64, StreamingListener)>>,
    ready: RwLock<Vec<(u64, ReadyListener)>>,
    next_id: AtomicU64,
}

impl ListenerSet {
    fn new() -> Self {
        Self {
            streaming: RwLock::new(Vec::new()),
            ready: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn fire_ready(&self, is_reconnect: bool) {
        let listeners: Vec<ReadyListener> =
            self.ready.read().iter().map(|(_, l)| l.clone()).collect();
        for l in listeners {
            l(is_reconnect);
        }
    }

    fn fire_streaming(&self, inbound: &Inbound) {
        let listeners: Vec<StreamingListener> =
            self.streaming.read().iter().map(|(_, l)| l.clone()).collect();
        for l in listeners {
            l(inbound);
        }
    }
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

type Waiter = oneshot::Sender<Result<Inbound, EngineError>>;

/// Shared state of one account's session.
pub struct SessionHandle {
    pub account_id: String,
    token: RwLock<String>,
    authorized: AtomicBool,
    /// Set on authorization failure; the session is never retried.
    closed: AtomicBool,
    next_req_id: AtomicU64,
    pending: Mutex<HashMap<u64, Waiter>>,
    outbound_tx: mpsc::Sender<String>,
    reconnect_attempts: AtomicU32,
}

impl SessionHandle {
    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Outstanding request-table entries. Test hook.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn fresh_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn fail_all_pending(&self, err: EngineError) {
        let waiters: Vec<Waiter> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, w)| w).collect()
        };
        for w in waiters {
            let _ = w.send(Err(err.clone()));
        }
    }
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

/// Observer invoked with the account id on every reconnect attempt; feeds the
/// RECONNECT_STORM counter.
pub type ReconnectObserver = Arc<dyn Fn(&str) + Send + Sync>;

pub struct SessionManager {
    transport: Arc<dyn Transport>,
    url: String,
    cfg: SessionConfig,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    listeners: RwLock<HashMap<String, Arc<ListenerSet>>>,
    reconnect_observers: RwLock<Vec<ReconnectObserver>>,
    telemetry: Arc<Telemetry>,
    health: Arc<HealthMonitor>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        url: String,
        cfg: SessionConfig,
        telemetry: Arc<Telemetry>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            transport,
            url,
            cfg,
            sessions: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            reconnect_observers: RwLock::new(Vec::new()),
            telemetry,
            health,
        }
    }

    /// Register an observer for reconnect attempts (risk counters).
    pub fn add_reconnect_observer(&self, observer: ReconnectObserver) {
        self.reconnect_observers.write().push(observer);
    }

    fn listener_set(&self, account_id: &str) -> Arc<ListenerSet> {
        if let Some(set) = self.listeners.read().get(account_id) {
            return set.clone();
        }
        self.listeners
            .write()
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(ListenerSet::new()))
            .clone()
    }

    /// Return the session for `account_id`, establishing it if needed. A
    /// changed token on an existing session is adopted for the next
    /// (re)authorization.
    pub fn get_or_create(self: &Arc<Self>, token: &str, account_id: &str) -> Arc<SessionHandle> {
        if let Some(handle) = self.sessions.read().get(account_id) {
            if *handle.token.read() != token {
                *handle.token.write() = token.to_string();
                debug!(account_id, "session token refreshed");
            }
            return handle.clone();
        }

        let mut sessions = self.sessions.write();
        if let Some(handle) = sessions.get(account_id) {
            return handle.clone();
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.cfg.outbound_queue_cap);
        let handle = Arc::new(SessionHandle {
            account_id: account_id.to_string(),
            token: RwLock::new(token.to_string()),
            authorized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_req_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            outbound_tx,
            reconnect_attempts: AtomicU32::new(0),
        });
        sessions.insert(account_id.to_string(), handle.clone());
        drop(sessions);

        info!(account_id, "session created");
        let mgr = self.clone();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            mgr.run_session(task_handle, outbound_rx).await;
        });

        handle
    }

    pub fn session(&self, account_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(account_id).cloned()
    }

    /// Mark every session closed. Pumps exit on their next wakeup.
    pub fn close_all(&self) {
        for handle in self.sessions.read().values() {
            handle.closed.store(true, Ordering::SeqCst);
            handle.fail_all_pending(EngineError::ConnectionLost);
        }
    }

    // -------------------------------------------------------------------------
    // Connection pump
    // -------------------------------------------------------------------------

    async fn run_session(
        self: Arc<Self>,
        handle: Arc<SessionHandle>,
        mut outbound_rx: mpsc::Receiver<String>,
    ) {
        let listeners = self.listener_set(&handle.account_id);
        let mut first_connect = true;

        loop {
            if handle.is_closed() {
                break;
            }

            let attempt = handle.reconnect_attempts.load(Ordering::SeqCst);
            let (mut tx, mut rx) = match self.transport.connect(&self.url).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(account_id = %handle.account_id, error = %e, "upstream connect failed");
                    self.note_reconnect(&handle).await;
                    continue;
                }
            };

            // ── Authorize before anything queued goes out ───────────────
            let auth_req_id = handle.fresh_req_id();
            let mut auth_frame = requests::authorize(&handle.token.read());
            auth_frame["req_id"] = auth_req_id.into();

            if tx.send(auth_frame.to_string()).await.is_err() {
                self.note_reconnect(&handle).await;
                continue;
            }

            let deadline = Duration::from_millis(self.cfg.request_deadline_ms);
            match self
                .authorize_handshake(&handle, &listeners, &mut rx, auth_req_id, deadline)
                .await
            {
                AuthOutcome::Ok => {}
                AuthOutcome::Disconnected => {
                    self.note_reconnect(&handle).await;
                    continue;
                }
                AuthOutcome::Failed(reason) => {
                    error!(
                        account_id = %handle.account_id,
                        reason = %reason,
                        "authorization failed — session is terminal"
                    );
                    handle.closed.store(true, Ordering::SeqCst);
                    handle.fail_all_pending(EngineError::Auth(reason.clone()));
                    self.health.set_component(
                        Component::Session,
                        ComponentStatus::Error,
                        Some(reason.clone()),
                    );
                    // Fail-closed propagation path (kill switch reads this).
                    self.health
                        .set_component(Component::Risk, ComponentStatus::Error, Some(reason));
                    break;
                }
            }

            handle.authorized.store(true, Ordering::SeqCst);
            handle.reconnect_attempts.store(0, Ordering::SeqCst);
            let is_reconnect = !first_connect;
            first_connect = false;

            info!(
                account_id = %handle.account_id,
                is_reconnect,
                "session authorized"
            );
            self.health
                .set_component(Component::Session, ComponentStatus::Ok, None);
            listeners.fire_ready(is_reconnect);

            // ── Main pump ───────────────────────────────────────────────
            let reason = self
                .pump(&handle, &listeners, &mut tx, &mut rx, &mut outbound_rx)
                .await;

            handle.authorized.store(false, Ordering::SeqCst);
            handle.fail_all_pending(EngineError::ConnectionLost);
            tx.close().await;

            if handle.is_closed() {
                break;
            }

            warn!(
                account_id = %handle.account_id,
                reason = %reason,
                attempt,
                "session disconnected — scheduling reconnect"
            );
            self.health.set_component(
                Component::Session,
                ComponentStatus::Degraded,
                Some(reason.to_string()),
            );
            self.note_reconnect(&handle).await;
        }

        debug!(account_id = %handle.account_id, "session pump exited");
    }

    /// Count the reconnect, notify observers, and sleep the jittered backoff.
    async fn note_reconnect(&self, handle: &SessionHandle) {
        let attempt = handle.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        self.telemetry.incr("session.reconnect");

        let observers: Vec<ReconnectObserver> = self.reconnect_observers.read().clone();
        for obs in observers {
            obs(&handle.account_id);
        }

        let delay = backoff_delay(attempt, self.cfg.backoff_base_ms, self.cfg.backoff_cap_ms);
        tokio::time::sleep(delay).await;
    }

    async fn authorize_handshake(
        &self,
        handle: &SessionHandle,
        listeners: &ListenerSet,
        rx: &mut Box<dyn ConnectionRx>,
        auth_req_id: u64,
        deadline: Duration,
    ) -> AuthOutcome {
        let fut = async {
            loop {
                match rx.recv().await {
                    Some(Ok(text)) => {
                        let inbound = match Inbound::parse(&text) {
                            Ok(i) => i,
                            Err(_) => {
                                self.telemetry.incr("session.parse_error");
                                continue;
                            }
                        };
                        if inbound.req_id == Some(auth_req_id) {
                            if let Some((code, message)) = inbound.error() {
                                return AuthOutcome::Failed(format!("[{code}] {message}"));
                            }
                            return AuthOutcome::Ok;
                        }
                        self.dispatch_inbound(handle, listeners, inbound);
                    }
                    Some(Err(_)) | None => return AuthOutcome::Disconnected,
                }
            }
        };

        match tokio::time::timeout(deadline, fut).await {
            Ok(outcome) => outcome,
            Err(_) => AuthOutcome::Disconnected,
        }
    }

    /// Run the connected session until the socket drops or heartbeats fail.
    /// Returns the close reason.
    async fn pump(
        &self,
        handle: &SessionHandle,
        listeners: &ListenerSet,
        tx: &mut Box<dyn ConnectionTx>,
        rx: &mut Box<dyn ConnectionRx>,
        outbound_rx: &mut mpsc::Receiver<String>,
    ) -> &'static str {
        let idle_threshold = Duration::from_millis(self.cfg.idle_threshold_ms);
        let pong_deadline = Duration::from_millis(self.cfg.pong_deadline_ms);

        let mut last_inbound = Instant::now();
        let mut ping_sent_at: Option<Instant> = None;
        let mut frames_since_yield: usize = 0;
        let mut heartbeat = tokio::time::interval(Duration::from_millis(500));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                out = outbound_rx.recv() => {
                    match out {
                        Some(text) => {
                            if tx.send(text).await.is_err() {
                                return "write_failed";
                            }
                        }
                        // The handle side was dropped; nothing can ever be
                        // sent again.
                        None => return "outbound_closed",
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Some(Ok(text)) => {
                            last_inbound = Instant::now();
                            ping_sent_at = None;

                            match Inbound::parse(&text) {
                                Ok(inbound) => {
                                    self.dispatch_inbound(handle, listeners, inbound);
                                }
                                Err(_) => self.telemetry.incr("session.parse_error"),
                            }

                            // Inbound backpressure: after a burst, yield so
                            // downstream handlers can drain.
                            frames_since_yield += 1;
                            if frames_since_yield >= self.cfg.inbound_inflight_cap {
                                frames_since_yield = 0;
                                tokio::task::yield_now().await;
                            }
                        }
                        Some(Err(_)) => return "read_failed",
                        None => return "peer_closed",
                    }
                }
                _ = heartbeat.tick() => {
                    if let Some(sent) = ping_sent_at {
                        if sent.elapsed() > pong_deadline {
                            self.telemetry.incr("session.heartbeat_failed");
                            return "heartbeat_failed";
                        }
                    } else if last_inbound.elapsed() > idle_threshold {
                        debug!(account_id = %handle.account_id, "idle — sending ping");
                        if tx.send(requests::ping().to_string()).await.is_err() {
                            return "write_failed";
                        }
                        ping_sent_at = Some(Instant::now());
                    }
                }
            }
        }
    }

    /// Resolve a waiter or fan out to streaming listeners.
    fn dispatch_inbound(&self, handle: &SessionHandle, listeners: &ListenerSet, inbound: Inbound) {
        if let Some(req_id) = inbound.req_id {
            if let Some(waiter) = handle.pending.lock().remove(&req_id) {
                let result = match inbound.as_error() {
                    Some(err) => Err(err),
                    None => Ok(inbound),
                };
                let _ = waiter.send(result);
                return;
            }
            // Response for a request whose waiter already timed out.
            self.telemetry.incr("session.unmatched_response");
            return;
        }
        listeners.fire_streaming(&inbound);
    }
}

enum AuthOutcome {
    Ok,
    Failed(String),
    Disconnected,
}

// ---------------------------------------------------------------------------
// Broker impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Broker for SessionManager {
    async fn request(
        &self,
        account_id: &str,
        mut frame: Value,
        deadline: Duration,
    ) -> Result<Inbound, EngineError> {
        let handle = self
            .session(account_id)
            .ok_or_else(|| EngineError::Validation(format!("no session for {account_id}")))?;

        if handle.is_closed() {
            return Err(EngineError::Auth("session terminally failed".to_string()));
        }

        let req_id = handle.fresh_req_id();
        frame["req_id"] = req_id.into();

        let (waiter_tx, waiter_rx) = oneshot::channel();
        handle.pending.lock().insert(req_id, waiter_tx);

        if let Err(e) = handle.outbound_tx.try_send(frame.to_string()) {
            handle.pending.lock().remove(&req_id);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.telemetry.incr("session.queue_full");
                    EngineError::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => EngineError::ConnectionLost,
            });
        }

        match tokio::time::timeout(deadline, waiter_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::ConnectionLost),
            Err(_) => {
                handle.pending.lock().remove(&req_id);
                self.telemetry.incr("session.request_timeout");
                Err(EngineError::RequestTimeout(deadline))
            }
        }
    }

    async fn fire_and_forget(&self, account_id: &str, frame: Value) -> Result<(), EngineError> {
        let handle = self
            .session(account_id)
            .ok_or_else(|| EngineError::Validation(format!("no session for {account_id}")))?;

        if handle.is_closed() {
            return Err(EngineError::Auth("session terminally failed".to_string()));
        }

        handle.outbound_tx.try_send(frame.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.telemetry.incr("session.queue_full");
                EngineError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => EngineError::ConnectionLost,
        })
    }

    fn add_streaming_listener(&self, account_id: &str, listener: StreamingListener) -> u64 {
        let set = self.listener_set(account_id);
        let id = set.next_id.fetch_add(1, Ordering::Relaxed);
        set.streaming.write().push((id, listener));
        id
    }

    fn remove_streaming_listener(&self, account_id: &str, listener_id: u64) {
        let set = self.listener_set(account_id);
        set.streaming.write().retain(|(id, _)| *id != listener_id);
    }

    fn add_ready_listener(&self, account_id: &str, listener: ReadyListener) -> u64 {
        let set = self.listener_set(account_id);
        let id = set.next_id.fetch_add(1, Ordering::Relaxed);
        set.ready.write().push((id, listener));
        id
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("url", &self.url)
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
