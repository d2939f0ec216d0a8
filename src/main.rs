//! basis-bot entry point
//!
//! Wires the feed, engine, rebalancer, persistence batcher and control
//! surface onto one tokio runtime and drains them in order on Ctrl+C.
//!
//! The order-signing exchange client is provisioned outside this repository;
//! the binary runs against the in-process paper client, which simulates
//! fills in dry-run mode and in integration environments.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};

use basis_bot::adapters::hyperliquid::{resolve_spot_index, WsBookStream};
use basis_bot::adapters::paper::PaperClient;
use basis_bot::adapters::traits::ExchangeClient;
use basis_bot::config::{self, Overrides, Settings};
use basis_bot::core::channels::{EngineChannels, SharedStatus, TradingFlags};
use basis_bot::core::feed::feed_task;
use basis_bot::core::rebalance::rebalance_task;
use basis_bot::core::runtime::{engine_task, Engine};
use basis_bot::notify::Notifier;
use basis_bot::server::{self, AppState};
use basis_bot::storage::{batch_writer_task, EdgeBatchWriter, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    config::init_logging();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Configuration failed");
            std::process::exit(1);
        }
    };

    info!(
        pair = %settings.spot_symbol(),
        threshold_bps = settings.threshold_bps,
        alloc_usd = settings.alloc_per_trade_usd,
        leverage = settings.leverage,
        dry_run = settings.dry_run,
        "Starting basis-bot"
    );

    let http = reqwest::Client::new();
    let spot_index = resolve_spot_index(
        &http,
        &settings.hl_info_url,
        &settings.pair_base,
        &settings.pair_quote,
    )
    .await
    .map_err(|e| anyhow::anyhow!("could not resolve spot index: {e}"))?;
    info!(spot_index, "Spot index resolved");

    // Live mode boots with the kill-switch set; the operator resumes once
    // satisfied with the status output. Dry runs start immediately.
    let flags = Arc::new(TradingFlags::new(!settings.dry_run));
    if flags.is_paused() {
        warn!("Live mode starts paused; send the resume command to trade");
    }

    let channels = EngineChannels::default();
    let feed_shutdown_rx = channels.subscribe_shutdown();
    let batch_shutdown_rx = channels.subscribe_shutdown();
    let rebalance_shutdown_rx = channels.subscribe_shutdown();
    let server_shutdown = channels.subscribe_shutdown();
    let engine_shutdown_rx = channels.subscribe_shutdown();
    let overrides = Overrides::from_settings(&settings).into_shared();
    let status = SharedStatus::default();

    let store = Arc::new(Store::new(
        settings.supabase_url.clone(),
        settings.supabase_anon_key.clone(),
    ));
    let batch = Arc::new(EdgeBatchWriter::new(Arc::clone(&store)));
    let notifier = Arc::new(Notifier::new(
        settings.telegram_token.clone(),
        settings.telegram_chat_id.clone(),
    ));

    let client = Arc::new(PaperClient::new());
    client
        .set_leverage(&settings.pair_base, settings.leverage as u32, true)
        .await
        .map_err(|e| anyhow::anyhow!("leverage setup failed: {e}"))?;

    let engine = Engine::new(
        &settings,
        spot_index,
        Arc::clone(&client),
        channels.tick_watch(),
        Arc::clone(&overrides),
        Arc::clone(&flags),
        channels.edge_tx.clone(),
        Arc::clone(&status),
        Arc::clone(&store),
        Arc::clone(&batch),
        Arc::clone(&notifier),
    );
    let rebalancer = engine.rebalancer();

    // Market feed
    let stream = WsBookStream::new(settings.hl_ws_url.clone(), settings.pair_base.clone(), spot_index);
    tokio::spawn(feed_task(
        stream,
        channels.tick_tx.clone(),
        channels.tick_watch_tx,
        flags.feed_stale_flag(),
        feed_shutdown_rx,
    ));

    // Persistence batcher
    tokio::spawn(batch_writer_task(
        Arc::clone(&batch),
        batch_shutdown_rx,
    ));

    // Capital rebalancer, 30 s cadence
    tokio::spawn(rebalance_task(
        rebalancer,
        channels.tick_tx.subscribe(),
        rebalance_shutdown_rx,
    ));

    // Control surface
    let app_state = AppState {
        status: Arc::clone(&status),
        overrides: Arc::clone(&overrides),
        flags: Arc::clone(&flags),
        command_tx: channels.command_tx.clone(),
        edge_tx: channels.edge_tx.clone(),
        store: Arc::clone(&store),
        config_info: Arc::new(serde_json::json!({
            "pair_base": settings.pair_base,
            "pair_quote": settings.pair_quote,
            "spot_index": spot_index,
            "threshold_bps": settings.threshold_bps,
            "dwell_ms": settings.dwell_ms,
            "leverage": settings.leverage,
            "alloc_per_trade_usd": settings.alloc_per_trade_usd,
            "max_trades_per_min": settings.max_trades_per_min,
            "max_hold_ms": settings.max_hold_ms,
            "deadman_ms": settings.deadman_ms,
            "dry_run": settings.dry_run,
        })),
    };
    let control_port = settings.control_port;
    tokio::spawn(async move {
        if let Err(e) = server::serve(app_state, control_port, server_shutdown).await {
            error!(error = %e, "Control surface failed");
        }
    });

    // Engine (hot path)
    let engine_handle = tokio::spawn(engine_task(
        engine,
        channels.tick_tx.subscribe(),
        channels.command_rx,
        engine_shutdown_rx,
    ));

    // Ctrl+C initiates the drain: kill-switch, close-all, flush
    let shutdown_tx = channels.shutdown_tx.clone();
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        }
        Err(e) => {
            error!(error = %e, "Failed to register Ctrl+C handler");
            let _ = shutdown_tx.send(());
        }
    }

    if let Err(e) = engine_handle.await {
        error!(error = %e, "Engine task panicked");
    }
    info!("Clean exit");

    Ok(())
}
