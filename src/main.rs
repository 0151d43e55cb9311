// =============================================================================
// Meridian — Binary-Options Trading Runtime — Main Entry Point
// =============================================================================
//
// Startup is recovery-first: restore kill switches (fail closed when they
// cannot be read), replay the unsettled execution ledger, rebuild sessions
// and open positions from the store, and only then expose the strategy
// runner. Restored bot runs come back paused; trading resumes by explicit
// operator action.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod admin;
mod config;
mod errors;
mod execution;
mod health;
mod indicators;
mod market;
mod risk;
mod runs;
mod secrets;
mod session;
mod settlement;
mod store;
mod strategy;
mod telemetry;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::admin::AdminSurface;
use crate::config::EngineConfig;
use crate::execution::engine::ExecutionEngine;
use crate::health::{Component, ComponentStatus, HealthMonitor};
use crate::market::order_book::OrderBooks;
use crate::market::tick_stream::{TickStreamConfig, TickStreams};
use crate::market::MarketData;
use crate::risk::cache::RiskCache;
use crate::risk::kill_switch::KillSwitches;
use crate::risk::manager::{RiskManager, TriggerLimits};
use crate::runs::RunArena;
use crate::secrets::TokenVault;
use crate::session::manager::SessionManager;
use crate::session::transport::WsTransport;
use crate::session::Broker;
use crate::settlement::SettlementReconciler;
use crate::store::{spawn_writer, Store};
use crate::strategy::runner::StrategyRunner;
use crate::telemetry::Telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Meridian Trading Runtime — Starting           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG_PATH").unwrap_or_else(|_| "meridian_config.json".into());
    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults with env overrides");
        let mut cfg = EngineConfig::default();
        cfg.apply_env();
        cfg
    });

    info!(
        upstream = %config.upstream_ws_url,
        db = %config.db_path,
        fail_closed = config.kill_switch_fail_closed,
        "engine configuration resolved"
    );

    // ── 2. Persistence, telemetry, health ────────────────────────────────
    let health = Arc::new(HealthMonitor::new());
    let telemetry = Arc::new(Telemetry::new());

    let store = Arc::new(Store::open(&config.db_path)?);
    let writer = spawn_writer(store.clone(), health.clone());
    health.set_component(Component::Persistence, ComponentStatus::Ok, None);

    let token_key = std::env::var("MERIDIAN_TOKEN_KEY").unwrap_or_default();
    if token_key.is_empty() {
        warn!("MERIDIAN_TOKEN_KEY is not set — stored tokens cannot be decrypted");
    }
    let vault = TokenVault::from_passphrase(&token_key);

    // ── 3. Kill switches (restore before anything can trade) ────────────
    let switches = Arc::new(KillSwitches::new(
        config.kill_switch_auto_clear_ms,
        config.kill_switch_fail_closed,
        writer.clone(),
        health.clone(),
    ));
    switches.restore(store.list_kill_switches());

    // ── 4. Risk cache and manager ────────────────────────────────────────
    let cache = Arc::new(RiskCache::new(store.clone(), writer.clone()));
    let risk = Arc::new(RiskManager::new(
        switches.clone(),
        cache.clone(),
        telemetry.clone(),
        TriggerLimits {
            reject_spike_limit: config.reject_spike_limit,
            reconnect_storm_limit: config.reconnect_storm_limit,
            slippage_spike_limit: config.slippage_spike_limit,
            max_cancels_per_second: config.default_max_cancels_per_second,
            latency_p99_threshold_ms: config.latency_blowout_p99_ms,
            latency_breaches: config.latency_blowout_breaches,
        },
    ));

    // ── 5. Upstream sessions ─────────────────────────────────────────────
    let sessions = Arc::new(SessionManager::new(
        Arc::new(WsTransport),
        config.upstream_ws_url.clone(),
        config.session.clone(),
        telemetry.clone(),
        health.clone(),
    ));
    {
        let risk = risk.clone();
        sessions.add_reconnect_observer(Arc::new(move |account_id| {
            risk.record_reconnect(account_id);
        }));
    }
    let broker: Arc<dyn Broker> = sessions.clone();

    // ── 6. Market data ───────────────────────────────────────────────────
    let request_deadline = Duration::from_millis(config.session.request_deadline_ms);
    let ticks = Arc::new(TickStreams::new(
        broker.clone(),
        TickStreamConfig {
            buffer_size: config.tick_buffer_size,
            history_count: config.ticks_history_count,
            request_deadline,
        },
        telemetry.clone(),
    ));
    let books = Arc::new(OrderBooks::new(broker.clone(), request_deadline));
    let market = Arc::new(MarketData::new(books));
    health.set_component(Component::TickStream, ComponentStatus::Ok, None);
    health.set_component(Component::MarketData, ComponentStatus::Ok, None);

    // ── 7. Bot runs ──────────────────────────────────────────────────────
    let arena = Arc::new(RunArena::new(writer.clone()));
    match store.list_bot_runs() {
        Ok(rows) => arena.load_from(rows),
        Err(e) => warn!(error = %e, "persisted bot runs unreadable"),
    }

    // ── 8. Settlement reconciler + recovery ──────────────────────────────
    let reconciler = Arc::new(SettlementReconciler::new(
        broker.clone(),
        store.clone(),
        writer.clone(),
        cache.clone(),
        arena.clone(),
        telemetry.clone(),
        health.clone(),
        request_deadline,
        Duration::from_millis(config.reconcile_portfolio_timeout_ms),
    ));
    reconciler.recover_ledger().await;
    reconciler.recover_sessions(&sessions, &vault).await;

    // ── 9. Execution engine ──────────────────────────────────────────────
    let engine = Arc::new(ExecutionEngine::new(
        broker.clone(),
        risk.clone(),
        cache.clone(),
        reconciler.clone(),
        store.clone(),
        telemetry.clone(),
        health.clone(),
        config.order_intent_max_size,
        config.order_intent_ttl_ms,
        request_deadline,
    ));
    health.set_component(Component::Execution, ComponentStatus::Ok, None);

    // ── 10. Strategy runner ──────────────────────────────────────────────
    let runner = Arc::new(StrategyRunner::new(
        arena.clone(),
        ticks.clone(),
        market.clone(),
        cache.clone(),
        switches.clone(),
        engine.clone(),
        telemetry.clone(),
        config.strategy_budget_ms,
    ));
    runner.register_kill_switch_listener();

    // SAFETY: restored runs stay paused until an operator resumes them.
    let restored = arena.all().len();
    info!(restored_runs = restored, "strategy runner ready (restored runs are paused)");

    // ── 11. Optional single-account bootstrap from the environment ───────
    if let (Ok(account_id), Ok(token)) = (
        std::env::var("MERIDIAN_ACCOUNT_ID"),
        std::env::var("MERIDIAN_ACCOUNT_TOKEN"),
    ) {
        info!(account_id = %account_id, "bootstrapping account session from environment");
        sessions.get_or_create(&token, &account_id);

        let account_kind =
            std::env::var("MERIDIAN_ACCOUNT_KIND").unwrap_or_else(|_| "demo".into());
        let currency = std::env::var("MERIDIAN_CURRENCY").unwrap_or_else(|_| "USD".into());
        match vault.encrypt(&token) {
            Ok(encrypted_token) => writer.enqueue(store::WriteOp::UpsertSession {
                account_id: account_id.clone(),
                encrypted_token,
                account_kind: account_kind.clone(),
                currency: currency.clone(),
            }),
            Err(e) => {
                warn!(error = %e, "token encryption failed — session will not survive restarts")
            }
        }

        let balance_hint = std::env::var("MERIDIAN_BALANCE_HINT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_000.0);
        cache.warm(&account_id, balance_hint);

        let strategy_id =
            std::env::var("MERIDIAN_STRATEGY").unwrap_or_else(|_| "momentum".into());
        let symbol = std::env::var("MERIDIAN_SYMBOL").unwrap_or_else(|_| "R_100".into());

        let mut run = crate::runs::BotRun::new(&account_id, &strategy_id, &symbol);
        run.currency = currency;
        run.cooldown_ms = 15_000;
        run.risk.max_stake = 10.0;
        run.risk.daily_loss_limit_pct = 2.0;
        run.risk.drawdown_limit_pct = 10.0;
        run.risk.max_consecutive_losses = 5;
        run.risk.loss_cooldown_ms = 300_000;
        run.risk.max_concurrent_trades = 3;
        run.risk.orders_per_second = 1;
        run.risk.orders_per_minute = 10;
        run.risk.volatility_threshold = Some(0.05);

        match arena.insert(run) {
            Ok(entry) => {
                let run_id = entry.read().id;
                if let Err(e) = runner.start(&run_id).await {
                    error!(run_id = %run_id, error = %e, "bootstrap bot run failed to start");
                }
            }
            Err(e) => warn!(error = %e, "bootstrap bot run rejected"),
        }
    }

    // ── 12. Admin surface ────────────────────────────────────────────────
    let admin_token = std::env::var("MERIDIAN_ADMIN_TOKEN").ok();
    let _admin = AdminSurface::new(
        switches.clone(),
        telemetry.clone(),
        health.clone(),
        admin_token,
    );

    // ── 13. Periodic sweeps ──────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    {
        // Kill-switch TTL sweep.
        let switches = switches.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = interval.tick() => switches.sweep(),
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        });
    }
    {
        // Latency blowout sweep.
        let risk = risk.clone();
        let window = Duration::from_millis(config.latency_blowout_window_ms.max(1_000));
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(window);
            loop {
                tokio::select! {
                    _ = interval.tick() => risk.latency_sweep(),
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        });
    }
    {
        // Order-intent TTL eviction.
        let engine = engine.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => engine.evict_stale_intents(),
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        });
    }
    {
        // Event-loop lag / resource circuit monitor.
        let health = health.clone();
        let threshold = Duration::from_millis(config.loop_lag_threshold_ms);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(crate::health::run_resource_monitor(
            health, threshold, shutdown,
        ));
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 14. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    runner.stop_all().await;
    sessions.close_all();
    cache.flush_all();

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    // Give the persistence queue a moment to drain the final snapshots.
    tokio::time::sleep(Duration::from_millis(250)).await;

    info!("Meridian shut down complete.");
    Ok(())
}
