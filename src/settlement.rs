// =============================================================================
// Settlement Reconciler — contract tracking, settlement, crash recovery
// =============================================================================
//
// Owns the set of open contracts per account, both live (tracked at buy time
// by the execution engine) and recovered (rebuilt from the portfolio and the
// execution ledger after a restart). Settlement application is exactly-once:
// the transactional ledger write in the store decides, and replays are
// no-ops.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::health::{Component, ComponentStatus, HealthMonitor};
use crate::risk::cache::RiskCache;
use crate::runs::RunArena;
use crate::secrets::TokenVault;
use crate::session::frames::{requests, Inbound};
use crate::session::manager::SessionManager;
use crate::session::Broker;
use crate::store::{keys, LedgerState, Store, StoreWriter, WriteOp};
use crate::telemetry::Telemetry;
use crate::types::now_ms;

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// An open position awaiting settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenContract {
    #[serde(rename = "contractId")]
    pub contract_id: i64,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
    pub symbol: String,
    pub stake: f64,
    #[serde(default)]
    pub payout: f64,
    #[serde(rename = "buyPrice")]
    pub buy_price: f64,
    #[serde(rename = "openedAt")]
    pub opened_at_ms: i64,
    #[serde(rename = "botRunId", default, skip_serializing_if = "Option::is_none")]
    pub bot_run_id: Option<Uuid>,
    #[serde(skip)]
    pub last_mark: Option<f64>,
    #[serde(skip)]
    pub unrealized_pnl: Option<f64>,
}

/// A realized settlement, delivered to PnL listeners.
#[derive(Debug, Clone, Serialize)]
pub struct SettledTrade {
    pub account_id: String,
    pub contract_id: i64,
    pub correlation_id: String,
    pub symbol: String,
    pub stake: f64,
    pub profit: f64,
    pub bot_run_id: Option<Uuid>,
    pub settled_at_ms: i64,
}

pub type PnlListener = Arc<dyn Fn(&SettledTrade) + Send + Sync>;

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct SettlementReconciler {
    broker: Arc<dyn Broker>,
    store: Arc<Store>,
    writer: StoreWriter,
    cache: Arc<RiskCache>,
    arena: Arc<RunArena>,
    telemetry: Arc<Telemetry>,
    health: Arc<HealthMonitor>,
    request_deadline: Duration,
    portfolio_timeout: Duration,
    open: RwLock<HashMap<String, HashMap<i64, OpenContract>>>,
    pnl_listeners: RwLock<Vec<(u64, PnlListener)>>,
    next_listener_id: AtomicU64,
    hooked_accounts: RwLock<Vec<String>>,
}

impl SettlementReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<Store>,
        writer: StoreWriter,
        cache: Arc<RiskCache>,
        arena: Arc<RunArena>,
        telemetry: Arc<Telemetry>,
        health: Arc<HealthMonitor>,
        request_deadline: Duration,
        portfolio_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            store,
            writer,
            cache,
            arena,
            telemetry,
            health,
            request_deadline,
            portfolio_timeout,
            open: RwLock::new(HashMap::new()),
            pnl_listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            hooked_accounts: RwLock::new(Vec::new()),
        }
    }

    pub fn add_pnl_listener(&self, listener: PnlListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.pnl_listeners.write().push((id, listener));
        id
    }

    pub fn open_contracts(&self, account_id: &str) -> Vec<OpenContract> {
        self.open
            .read()
            .get(account_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Live tracking (called by the execution engine at buy time)
    // -------------------------------------------------------------------------

    /// Track an open contract: remember it durably for crash recovery and
    /// subscribe to its settlement updates.
    pub async fn watch(self: &Arc<Self>, account_id: &str, contract: OpenContract) {
        self.ensure_hooks(account_id);

        let contract_id = contract.contract_id;
        self.open
            .write()
            .entry(account_id.to_string())
            .or_default()
            .insert(contract_id, contract);
        self.persist_open_contracts(account_id);

        if let Err(e) = self
            .broker
            .request(
                account_id,
                requests::open_contract_subscribe(contract_id),
                self.request_deadline,
            )
            .await
        {
            // Recovery replays the ledger row, so a missed subscription is
            // not a lost settlement.
            warn!(account_id, contract_id, error = %e, "open-contract subscribe failed");
        }
    }

    // -------------------------------------------------------------------------
    // Streaming updates
    // -------------------------------------------------------------------------

    fn handle_update(&self, account_id: &str, inbound: &Inbound) {
        let poc = &inbound.payload["proposal_open_contract"];
        let Some(contract_id) = poc["contract_id"].as_i64() else {
            return;
        };

        if poc["is_sold"].as_bool() == Some(true) {
            let profit = poc["profit"].as_f64().unwrap_or(0.0);
            self.settle_contract(account_id, contract_id, profit);
            return;
        }

        // Mark-to-market update for a still-open contract.
        let mut open = self.open.write();
        if let Some(contract) = open.get_mut(account_id).and_then(|m| m.get_mut(&contract_id)) {
            contract.last_mark = poc["bid_price"].as_f64();
            contract.unrealized_pnl = poc["profit"].as_f64();
        }
    }

    fn settle_contract(&self, account_id: &str, contract_id: i64, profit: f64) {
        let contract = self
            .open
            .read()
            .get(account_id)
            .and_then(|m| m.get(&contract_id).cloned());

        let Some(contract) = contract else {
            self.telemetry.incr("settlement.unknown_contract");
            debug!(account_id, contract_id, "settlement for untracked contract ignored");
            return;
        };

        let payload = json!({
            "contract_id": contract.contract_id,
            "symbol": contract.symbol,
            "stake": contract.stake,
            "profit": profit,
            "buy_price": contract.buy_price,
            "bot_run_id": contract.bot_run_id,
            "settled_at": now_ms(),
        });

        self.apply_settlement(account_id, &contract.correlation_id, &payload, false);

        if let Some(per_account) = self.open.write().get_mut(account_id) {
            per_account.remove(&contract_id);
        }
        self.persist_open_contracts(account_id);
        self.clear_settlement_subscription(account_id, contract_id);
    }

    fn clear_settlement_subscription(&self, account_id: &str, contract_id: i64) {
        // One forget per settled contract keeps the upstream subscription
        // table bounded; failures are harmless (the stream ends server-side).
        let frame = requests::forget(&contract_id.to_string());
        let broker = self.broker.clone();
        let account = account_id.to_string();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = broker.fire_and_forget(&account, frame).await;
            });
        }
    }

    // -------------------------------------------------------------------------
    // Settlement application (exactly-once)
    // -------------------------------------------------------------------------

    /// Apply one settlement through the transactional store path. Replay of
    /// an already-settled correlation id is a no-op. `skip_exposure` marks a
    /// recovery application where the opening was not recorded in this
    /// process.
    pub fn apply_settlement(
        &self,
        account_id: &str,
        correlation_id: &str,
        trade_payload: &Value,
        skip_exposure: bool,
    ) -> bool {
        let stake = trade_payload["stake"].as_f64().unwrap_or(0.0);
        let profit = trade_payload["profit"].as_f64().unwrap_or(0.0);

        match self.store.apply_settlement(correlation_id, account_id, trade_payload) {
            Ok(true) => {}
            Ok(false) => {
                debug!(account_id, correlation_id, "settlement replay ignored");
                return false;
            }
            Err(e) => {
                // Degraded persistence: keep the in-memory state honest and
                // surface the obstacle.
                warn!(account_id, correlation_id, error = %e, "settlement persist failed");
                self.health.set_component(
                    Component::Persistence,
                    ComponentStatus::Degraded,
                    Some(e.to_string()),
                );
                self.health.push_error(
                    format!("settlement persist failed for {correlation_id}"),
                    Some("PERSISTENCE_DEGRADED".to_string()),
                );
            }
        }

        self.cache
            .record_trade_settled(account_id, stake, profit, skip_exposure);

        let bot_run_id = trade_payload["bot_run_id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok());
        if let Some(run_id) = bot_run_id {
            self.arena.record_profit(&run_id, profit);
        }

        let settled = SettledTrade {
            account_id: account_id.to_string(),
            contract_id: trade_payload["contract_id"].as_i64().unwrap_or(0),
            correlation_id: correlation_id.to_string(),
            symbol: trade_payload["symbol"].as_str().unwrap_or("").to_string(),
            stake,
            profit,
            bot_run_id,
            settled_at_ms: now_ms(),
        };

        info!(
            account_id,
            correlation_id,
            contract_id = settled.contract_id,
            profit,
            "settlement applied"
        );
        self.telemetry.incr("settlement.applied");
        self.health.push_event(
            "settlement",
            Some(account_id.to_string()),
            json!({ "contract_id": settled.contract_id, "profit": profit }),
        );

        let listeners: Vec<PnlListener> = self
            .pnl_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for l in listeners {
            l(&settled);
        }
        true
    }

    // -------------------------------------------------------------------------
    // Crash recovery
    // -------------------------------------------------------------------------

    /// Replay unsettled execution-ledger rows. Rows whose payload already
    /// carries a settlement apply immediately; rows with an open contract are
    /// re-tracked; rows that never reached the market are failed.
    pub async fn recover_ledger(self: &Arc<Self>) {
        let rows = match self.store.unsettled_ledger_rows() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "execution ledger unreadable during recovery");
                self.health.set_component(
                    Component::Settlement,
                    ComponentStatus::Degraded,
                    Some(e.to_string()),
                );
                return;
            }
        };

        info!(count = rows.len(), "replaying unsettled execution-ledger rows");
        for row in rows {
            let payload = &row.trade_payload;

            if payload.get("profit").and_then(|p| p.as_f64()).is_some() {
                self.apply_settlement(&row.account_id, &row.correlation_id, payload, true);
                continue;
            }

            if let Some(contract_id) = payload.get("contract_id").and_then(|c| c.as_i64()) {
                let contract = OpenContract {
                    contract_id,
                    correlation_id: row.correlation_id.clone(),
                    symbol: payload["symbol"].as_str().unwrap_or("").to_string(),
                    stake: payload["stake"].as_f64().unwrap_or(0.0),
                    payout: payload["payout"].as_f64().unwrap_or(0.0),
                    buy_price: payload["buy_price"].as_f64().unwrap_or(0.0),
                    opened_at_ms: row.created_at_ms,
                    bot_run_id: payload["bot_run_id"]
                        .as_str()
                        .and_then(|s| Uuid::parse_str(s).ok()),
                    last_mark: None,
                    unrealized_pnl: None,
                };
                self.telemetry.incr("settlement.recovered_subscription");
                self.watch(&row.account_id, contract).await;
                continue;
            }

            // The order never reached the market; close the row out.
            debug!(correlation_id = %row.correlation_id, "failing ledger row without contract");
            if let Err(e) = self
                .store
                .update_ledger(&row.correlation_id, LedgerState::Failed, None)
            {
                warn!(error = %e, "failed to close out ledger row");
            }
        }

        self.health
            .set_component(Component::Settlement, ComponentStatus::Ok, None);
    }

    /// Rebuild sessions and open-position state from persisted sessions and
    /// the upstream portfolio.
    pub async fn recover_sessions(
        self: &Arc<Self>,
        sessions: &Arc<SessionManager>,
        vault: &TokenVault,
    ) {
        let rows = match self.store.list_sessions() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "persisted sessions unreadable during recovery");
                return;
            }
        };

        for row in rows {
            let token = match vault.decrypt(&row.encrypted_token) {
                Ok(t) => t,
                Err(e) => {
                    warn!(account_id = %row.account_id, error = %e, "stored token undecryptable");
                    continue;
                }
            };

            sessions.get_or_create(&token, &row.account_id);
            self.cache.hydrate(&row.account_id);

            match self
                .broker
                .request(&row.account_id, requests::portfolio(), self.portfolio_timeout)
                .await
            {
                Ok(response) => self.rebuild_from_portfolio(&row.account_id, &response.payload).await,
                Err(e) => {
                    warn!(account_id = %row.account_id, error = %e, "portfolio fetch failed");
                }
            }
        }
    }

    async fn rebuild_from_portfolio(self: &Arc<Self>, account_id: &str, payload: &Value) {
        let contracts = payload["portfolio"]["contracts"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut exposure = 0.0;
        let mut count: u32 = 0;
        for c in &contracts {
            let Some(contract_id) = c["contract_id"].as_i64() else {
                continue;
            };
            let buy_price = c["buy_price"].as_f64().unwrap_or(0.0);
            exposure += buy_price;
            count += 1;

            self.watch(
                account_id,
                OpenContract {
                    contract_id,
                    correlation_id: format!("recovered-{contract_id}"),
                    symbol: c["symbol"].as_str().unwrap_or("").to_string(),
                    stake: buy_price,
                    payout: c["payout"].as_f64().unwrap_or(0.0),
                    buy_price,
                    opened_at_ms: c["purchase_time"].as_i64().unwrap_or(0) * 1_000,
                    bot_run_id: None,
                    last_mark: None,
                    unrealized_pnl: None,
                },
            )
            .await;
        }

        self.cache.set_open_trade_state(account_id, count, exposure);
        info!(account_id, open_contracts = count, exposure, "open positions rebuilt from portfolio");
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn persist_open_contracts(&self, account_id: &str) {
        let contracts = self.open_contracts(account_id);
        if let Ok(value) = serde_json::to_value(json!({ "contracts": contracts })) {
            self.writer.enqueue(WriteOp::UpsertSetting {
                account_id: account_id.to_string(),
                key: keys::OPEN_CONTRACTS.to_string(),
                value,
            });
        }
    }

    fn ensure_hooks(self: &Arc<Self>, account_id: &str) {
        {
            let hooked = self.hooked_accounts.read();
            if hooked.iter().any(|a| a == account_id) {
                return;
            }
        }
        let mut hooked = self.hooked_accounts.write();
        if hooked.iter().any(|a| a == account_id) {
            return;
        }
        hooked.push(account_id.to_string());
        drop(hooked);

        let reconciler = self.clone();
        let account = account_id.to_string();
        self.broker.add_streaming_listener(
            account_id,
            Arc::new(move |inbound| {
                if inbound.msg_type == "proposal_open_contract" {
                    reconciler.handle_update(&account, inbound);
                }
            }),
        );
    }
}

impl std::fmt::Debug for SettlementReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open: usize = self.open.read().values().map(|m| m.len()).sum();
        f.debug_struct("SettlementReconciler")
            .field("open_contracts", &open)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
