//! Trade Tape Binary
//!
//! Reconciles the trade tape of every configured market against a simulated
//! venue and logs the delivered trades.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trade-tape
//! ```
//!
//! # Environment Variables
//!
//! - `TAPE_HEALTH_PORT`: Health check and metrics HTTP port (default: 8083)
//! - `TAPE_BROADCAST_CAPACITY`: Trades buffered per subscriber (default: 65536)
//! - `TAPE_RETRY_MAX_ATTEMPTS`: Attempts per retry scope (default: 10)
//! - `TAPE_RETRY_BASE_DELAY_MS`: Unit of the retry schedule (default: 1000)
//! - `TAPE_RETRY_MAX_DELAY_SECS`: Retry delay cap (default: 900)
//! - `TAPE_SIZER_*`: Window sizer constants
//! - `TAPE_START`: resume | first | RFC 3339 timestamp (default: resume)
//! - `TAPE_SIM_MARKETS`: Comma-separated markets (default: BTC-USD)
//! - `TAPE_SIM_HISTORY`: Trades of history per market (default: 5000)
//! - `TAPE_SIM_PAGE_SIZE`: Trades per REST page (default: 100)
//! - `TAPE_SIM_TRADE_INTERVAL_MS`: Live trade interval (default: 250)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: trade-tape)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use trade_tape::domain::trade::{Consecutive, TradeId};
use trade_tape::infrastructure::health::{HealthServer, HealthServerState};
use trade_tape::infrastructure::simulated::{SimulatedVenue, SimulatedVenueConfig};
use trade_tape::infrastructure::telemetry;
use trade_tape::{MarketRegistry, StreamReconciler, TapeConfig, init_metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting trade tape");

    let _metrics_handle = init_metrics();

    let config = TapeConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let registry = Arc::new(MarketRegistry::new(config.reconciler_config()));
    let mut tasks = JoinSet::new();

    for market in &config.simulator.markets {
        let venue = Arc::new(SimulatedVenue::with_history(
            SimulatedVenueConfig {
                market_id: market.clone(),
                page_size: config.simulator.page_size,
                ..SimulatedVenueConfig::default()
            },
            1..=TradeId::try_from(config.simulator.history).unwrap_or(TradeId::MAX),
        ));
        tasks.spawn(
            Arc::clone(&venue).run_live(config.simulator.trade_interval, shutdown_token.clone()),
        );

        let reconciler = registry.register(venue);
        tasks.spawn(consume(reconciler));
    }

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&registry),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tasks.spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(markets = registry.len(), "Trade tape ready");

    await_shutdown(shutdown_token).await;

    registry.dispose_all().await;
    while tasks.join_next().await.is_some() {}

    tracing::info!("Trade tape stopped");
    Ok(())
}

/// Log every delivered trade of one market until its tape ends.
async fn consume(reconciler: Arc<StreamReconciler>) {
    let market = reconciler.market_id().to_string();
    let mut tape = reconciler.subscribe();
    let mut previous = None;
    let mut delivered: u64 = 0;

    while let Some(item) = tape.next().await {
        match item {
            Ok(trade) => {
                let trade = match &previous {
                    Some(prior) => trade.accumulate_from(prior),
                    None => trade,
                };
                let consecutive = previous
                    .as_ref()
                    .map_or(Consecutive::Difference, |prior| trade.consecutive_with(prior));
                delivered += 1;
                tracing::debug!(
                    market = %market,
                    id = trade.id,
                    price = %trade.price,
                    size = %trade.size,
                    side = trade.side.as_str(),
                    cumulative_size = %trade.cumulative_size,
                    consecutive = ?consecutive,
                    "Trade"
                );
                if delivered % 1_000 == 0 {
                    tracing::info!(market = %market, delivered, last_id = trade.id, "Tape progress");
                }
                previous = Some(trade);
            }
            Err(e) => {
                tracing::error!(market = %market, error = %e, kind = e.kind(), "Tape ended with error");
                break;
            }
        }
    }

    tracing::info!(market = %market, delivered, "Tape closed");
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &TapeConfig) {
    tracing::info!(
        health_port = config.server.health_port,
        markets = ?config.simulator.markets,
        start = ?config.start,
        broadcast_capacity = config.broadcast.capacity,
        "Configuration loaded"
    );
    tracing::debug!(
        max_attempts = config.retry.max_attempts,
        base_delay_ms = u64::try_from(config.retry.base_delay.as_millis()).unwrap_or(u64::MAX),
        max_delay_secs = config.retry.max_delay.as_secs(),
        halving_threshold = config.sizer.halving_threshold,
        gap_boost = config.sizer.gap_boost,
        catch_up_ratio = config.sizer.catch_up_ratio,
        "Pipeline tuning"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
