use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cache;
mod config;
mod events;
mod ledger;
mod metrics;
mod models;
mod services;

use crate::cache::RecentTradeCache;
use crate::config::AppConfig;
use crate::events::EventHub;
use crate::ledger::json_api::JsonLedgerClient;
use crate::ledger::token::TokenProvider;
use crate::ledger::LedgerApi;
use crate::services::balances::BalanceReserver;
use crate::services::matching::{CycleRequester, MatchingEngine};
use crate::services::orders::OrderService;
use crate::services::read_model::ReadModel;
use crate::services::settlement::Settlement;
use crate::services::stop_loss::StopLossEngine;

/// Shared handles the (external) HTTP and WebSocket layers are wired onto
#[allow(dead_code)]
pub struct AppState {
    pub config: AppConfig,
    pub read_model: Arc<ReadModel>,
    pub balances: Arc<BalanceReserver>,
    pub order_service: Arc<OrderService>,
    pub stop_loss: Arc<StopLossEngine>,
    pub trade_cache: Arc<RecentTradeCache>,
    pub events: Arc<EventHub>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clob_exchange_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting CLOB Exchange Backend v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);

    let pairs = config.trading_pairs()?;
    tracing::info!("Trading pairs: {:?}", pairs.iter().map(|p| p.symbol()).collect::<Vec<_>>());

    // Ledger driver
    let tokens = Arc::new(TokenProvider::new(config.token_source()));
    let ledger_client = Arc::new(JsonLedgerClient::new(config.json_api_config(), tokens)?);
    match ledger_client.health_check().await {
        Ok(()) => tracing::info!("Ledger reachable at {}", config.ledger_http_url),
        Err(e) => tracing::warn!("Ledger health probe failed (continuing): {}", e),
    }
    let ledger: Arc<dyn LedgerApi> = ledger_client;

    // Shutdown signal shared by every background loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Read model: bootstrap over streaming, then keep current live
    let read_model = Arc::new(ReadModel::new(
        ledger.clone(),
        config.operator_party.clone(),
        config.read_model_config(),
    ));
    match read_model.bootstrap().await {
        Ok(()) => tracing::info!("Read model bootstrapped"),
        Err(e) => tracing::warn!(
            "Read model degraded to REST fallback (queries page-capped): {}",
            e
        ),
    }
    tokio::spawn(Arc::clone(&read_model).run_live_updates(shutdown_rx.clone()));

    // Recent-trade cache with debounced disk writes
    let trade_cache = Arc::new(RecentTradeCache::load(config.trade_cache_config()));
    tokio::spawn(Arc::clone(&trade_cache).run_flush_loop(shutdown_rx.clone()));

    // Event hub (the WebSocket layer subscribes to these topics)
    let events = Arc::new(EventHub::new());

    // Balance reservations
    let balances = Arc::new(BalanceReserver::new());

    // On-demand matching-cycle requests flow through this channel
    let (cycle_tx, cycle_rx) = mpsc::unbounded_channel();
    let cycles = CycleRequester::new(cycle_tx);

    // Stop-loss engine with its backup price poll
    let stop_loss = Arc::new(StopLossEngine::new(
        ledger.clone(),
        read_model.clone(),
        events.clone(),
        cycles.clone(),
        config.operator_party.clone(),
        config.backup_poll_interval(),
    ));
    tokio::spawn(Arc::clone(&stop_loss).run_backup_poll(shutdown_rx.clone()));
    tracing::info!("Stop-loss engine started");

    // Settlement pipeline
    let settlement = Arc::new(Settlement::new(
        ledger.clone(),
        read_model.clone(),
        balances.clone(),
        stop_loss.clone(),
        events.clone(),
        trade_cache.clone(),
        config.settlement_config(),
    ));

    // Matching engine and its scheduling loop
    let matching_engine = Arc::new(MatchingEngine::new(
        config.matching_config()?,
        read_model.clone(),
        settlement,
        cycle_rx,
    ));
    tokio::spawn(Arc::clone(&matching_engine).run_loop(shutdown_rx.clone()));
    tracing::info!("Matching engine started");

    // Order service: the public entry point wired into the (external)
    // HTTP/WebSocket layer
    let order_service = Arc::new(OrderService::new(
        ledger.clone(),
        read_model.clone(),
        balances.clone(),
        stop_loss.clone(),
        events.clone(),
        cycles,
        config.order_service_config()?,
    ));
    tracing::info!("Order service ready");

    let _state = Arc::new(AppState {
        config,
        read_model,
        balances,
        order_service,
        stop_loss,
        trade_cache: trade_cache.clone(),
        events,
    });

    tracing::info!("Engine running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    // Graceful shutdown: stop every loop, then flush the pending cache write
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    if let Err(e) = trade_cache.flush() {
        tracing::error!("Final trade cache flush failed: {}", e);
    }
    tracing::info!("Shutdown complete");

    Ok(())
}
