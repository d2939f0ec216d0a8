//! Engine runtime: the single consumer loop on the hot path
//!
//! One task owns feed consumption, edge computation, gating, admission,
//! dispatch and position monitoring, in that order, so tick processing and
//! state transitions stay serial. The tracker, persistence batching and the
//! edge broadcast fan out from here without blocking; a dispatch is awaited
//! inline, which is what guarantees that no two dispatches overlap.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use crate::adapters::traits::ExchangeClient;
use crate::config::{Overrides, Settings, SharedOverrides, TifMode};
use crate::core::capital::{Admission, CapitalGuard};
use crate::core::channels::{EdgePayload, EngineCommand, SharedStatus, TradingFlags};
use crate::core::dispatch::{DispatchError, DispatcherConfig, OrderDispatcher};
use crate::core::edge::{compute_edges, EdgePair};
use crate::core::feed::Tick;
use crate::core::gate::{GateConfig, GateFire, StabilityGate};
use crate::core::position::{PositionConfig, PositionEvent, PositionManager};
use crate::core::rebalance::CapitalRebalancer;
use crate::core::tracker::OpportunityTracker;
use crate::notify::{Notifier, Severity};
use crate::storage::{EdgeBatchWriter, EdgeRow, Store, TradeRecord};

pub struct Engine<C: ExchangeClient> {
    base: String,
    spot_index: u32,
    fees_roundtrip_bps: f64,
    spike_extra_bps: f64,
    leverage: f64,
    max_open_positions: usize,

    gate: StabilityGate,
    guard: CapitalGuard<C>,
    dispatcher: Arc<OrderDispatcher<C>>,
    manager: PositionManager,
    tracker: OpportunityTracker,
    rebalancer: Arc<CapitalRebalancer<C>>,

    store: Arc<Store>,
    batch: Arc<EdgeBatchWriter>,
    notifier: Arc<Notifier>,

    overrides: SharedOverrides,
    flags: Arc<TradingFlags>,
    edge_tx: broadcast::Sender<EdgePayload>,
    status: SharedStatus,

    trades_executed: u64,
    broken_hedges: u64,
    last_tick: Option<Tick>,
    last_edges: Option<EdgePair>,
}

impl<C: ExchangeClient> Engine<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &Settings,
        spot_index: u32,
        client: Arc<C>,
        tick_watch: watch::Receiver<Option<Tick>>,
        overrides: SharedOverrides,
        flags: Arc<TradingFlags>,
        edge_tx: broadcast::Sender<EdgePayload>,
        status: SharedStatus,
        store: Arc<Store>,
        batch: Arc<EdgeBatchWriter>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let spot_coin = format!("@{spot_index}");

        let mut dispatcher_cfg = DispatcherConfig::new(settings.pair_base.clone(), spot_coin.clone());
        dispatcher_cfg.leverage = settings.leverage;
        dispatcher_cfg.slippage_bps = settings.slippage_bps;
        dispatcher_cfg.alo_open_timeout_ms = settings.alo_open_timeout_ms;
        dispatcher_cfg.alo_close_timeout_ms = settings.alo_close_timeout_ms;
        dispatcher_cfg.min_order_notional_usd = settings.min_order_notional_usd;
        dispatcher_cfg.deadman_ms = settings.deadman_ms;

        let gate = StabilityGate::new(GateConfig {
            dwell_ms: settings.dwell_ms,
            cool_down_ms: settings.cool_down_ms,
            max_trades_per_min: settings.max_trades_per_min,
        });
        let guard = CapitalGuard::new(
            Arc::clone(&client),
            settings.pair_base.clone(),
            settings.pair_quote.clone(),
        );
        let manager = PositionManager::new(PositionConfig {
            max_hold_ms: settings.max_hold_ms,
            close_threshold_bps: settings.close_threshold_bps,
            fees: settings.fees,
        });
        let tracker = OpportunityTracker::new(
            settings.observation_threshold_bps,
            settings.baseline_window,
            settings.fees,
        );
        let rebalancer = Arc::new(CapitalRebalancer::new(
            Arc::clone(&client),
            settings.pair_base.clone(),
            settings.pair_quote.clone(),
            spot_coin,
            settings.min_order_notional_usd,
        ));

        Self {
            base: settings.pair_base.clone(),
            spot_index,
            fees_roundtrip_bps: settings.fees.round_trip_bps(),
            spike_extra_bps: settings.spike_extra_bps_for_ioc,
            leverage: settings.leverage,
            max_open_positions: settings.max_open_positions,
            gate,
            guard,
            dispatcher: Arc::new(OrderDispatcher::new(client, dispatcher_cfg, tick_watch)),
            manager,
            tracker,
            rebalancer,
            store,
            batch,
            notifier,
            overrides,
            flags,
            edge_tx,
            status,
            trades_executed: 0,
            broken_hedges: 0,
            last_tick: None,
            last_edges: None,
        }
    }

    /// Shared with the 30 s rebalance task
    pub fn rebalancer(&self) -> Arc<CapitalRebalancer<C>> {
        Arc::clone(&self.rebalancer)
    }

    /// Process one tick through the full hot path.
    pub async fn handle_tick(&mut self, tick: Tick) {
        let overrides = self.overrides.read().await.clone();
        let edges = compute_edges(&tick, self.fees_roundtrip_bps);
        self.last_tick = Some(tick);
        self.last_edges = Some(edges);

        // Read-side observer; its output is queued, never awaited inline
        if let Some(opportunity) = self.tracker.on_tick(&tick, edges.best_edge()) {
            self.batch.queue_opportunity(opportunity).await;
        }

        let payload = EdgePayload {
            ts: Utc::now(),
            base: self.base.clone(),
            spot_index: self.spot_index,
            edge_ps_mm_bps: edges.edge_ps_bps,
            edge_sp_mm_bps: edges.edge_sp_bps,
            mid_ref: edges.mid_ref,
            latency_ms: tick.latency_ms(),
            threshold_bps: overrides.threshold_bps,
        };
        let _ = self.edge_tx.send(payload.clone());
        self.batch
            .queue_edge(EdgeRow::from_payload(&payload, tick.recv_ms, tick.send_ms))
            .await;

        // Closes run before any new open, and regardless of the kill-switch
        let events = self
            .manager
            .on_tick(self.dispatcher.as_ref(), &tick, &edges, tick.recv_ms)
            .await;
        self.handle_position_events(events).await;

        let fire = self.gate.on_edge(
            &edges,
            overrides.threshold_bps,
            self.flags.is_paused(),
            self.flags.is_feed_stale(),
            tick.recv_ms,
        );
        if let Some(fire) = fire {
            self.handle_fire(fire, &tick, &edges, &overrides).await;
        }

        self.update_status(payload, tick.recv_ms).await;
    }

    async fn handle_fire(
        &mut self,
        fire: GateFire,
        tick: &Tick,
        edges: &EdgePair,
        overrides: &Overrides,
    ) {
        let use_ioc = matches!(overrides.tif, TifMode::Ioc)
            || fire.edge_bps >= overrides.threshold_bps + self.spike_extra_bps;
        let role = if use_ioc { "ioc" } else { "maker_first" };
        let notional = overrides.alloc_per_trade_usd;

        if self.manager.open_count() >= self.max_open_positions {
            warn!(
                open = self.manager.open_count(),
                max = self.max_open_positions,
                "Max positions reached, skipping dispatch"
            );
            self.gate.on_dispatch_done();
            return;
        }

        if overrides.dry_run {
            info!(
                direction = %fire.direction,
                edge_bps = fire.edge_bps,
                "DRY RUN: dispatch simulated"
            );
            self.record_trade(
                fire,
                notional,
                role,
                overrides.threshold_bps,
                None,
                serde_json::json!({"ok": true, "note": "dry run, no order placed"}),
                "SIMULATED",
            )
            .await;
            self.gate.on_dispatch_done();
            return;
        }

        match self
            .guard
            .admit(
                fire.direction,
                notional,
                self.leverage,
                edges.mid_ref,
                tick.recv_ms,
            )
            .await
        {
            Ok(Admission::Admissible) => {}
            Ok(Admission::Refused { reason }) => {
                self.record_trade(
                    fire,
                    notional,
                    role,
                    overrides.threshold_bps,
                    None,
                    serde_json::json!({"ok": false, "error": reason}),
                    "SKIPPED",
                )
                .await;
                self.gate.on_dispatch_done();
                return;
            }
            Err(e) => {
                warn!(error = %e, "Balance query failed, skipping dispatch");
                self.gate.on_dispatch_done();
                return;
            }
        }

        let outcome = self
            .dispatcher
            .open(fire.direction, notional, tick, use_ioc, fire.edge_bps)
            .await;

        match outcome {
            Ok(position) => {
                self.trades_executed += 1;
                self.guard.invalidate();

                let detail = match position.open_method {
                    crate::core::position::ExecMethod::Maker => "both legs maker".to_string(),
                    crate::core::position::ExecMethod::Ioc => "IOC fallback used".to_string(),
                };
                let response = serde_json::json!({
                    "ok": true,
                    "perp_size": position.perp_size,
                    "spot_size": position.spot_size,
                    "perp_entry_px": position.perp_entry_px,
                    "spot_entry_px": position.spot_entry_px,
                    "method": detail,
                });
                self.record_trade(
                    fire,
                    notional,
                    role,
                    overrides.threshold_bps,
                    Some(position.id.to_string()),
                    response,
                    "POSTED",
                )
                .await;

                if let Err(e) = self.store.insert_position(&position).await {
                    warn!(error = %e, "Position row write failed");
                }
                self.notifier
                    .trade_posted(fire.direction, fire.edge_bps, notional, &detail)
                    .await;
                self.manager.insert(position);
            }
            Err(DispatchError::NoFill) => {
                self.record_trade(
                    fire,
                    notional,
                    role,
                    overrides.threshold_bps,
                    None,
                    serde_json::json!({"ok": false, "error": "no fill"}),
                    "FAILED",
                )
                .await;
                self.notifier
                    .trade_failed(fire.direction, fire.edge_bps, "no fill after retries")
                    .await;
            }
            Err(e @ DispatchError::PartialRecovered { .. }) => {
                self.record_trade(
                    fire,
                    notional,
                    role,
                    overrides.threshold_bps,
                    None,
                    serde_json::json!({"ok": false, "error": e.to_string()}),
                    "RECOVERED",
                )
                .await;
                self.notifier
                    .send(
                        Severity::Warning,
                        &format!("One-sided fill recovered: {e}"),
                    )
                    .await;
            }
            Err(e @ DispatchError::BrokenHedge { .. }) => {
                self.flags.pause();
                self.broken_hedges += 1;
                self.record_trade(
                    fire,
                    notional,
                    role,
                    overrides.threshold_bps,
                    None,
                    serde_json::json!({"ok": false, "error": e.to_string()}),
                    "FAILED",
                )
                .await;
                self.notifier
                    .send(
                        Severity::Critical,
                        &format!("Open left an unrecoverable hedge: {e}. Kill-switch set."),
                    )
                    .await;
            }
            Err(e) => {
                self.record_trade(
                    fire,
                    notional,
                    role,
                    overrides.threshold_bps,
                    None,
                    serde_json::json!({"ok": false, "error": e.to_string()}),
                    "FAILED",
                )
                .await;
                self.notifier
                    .trade_failed(fire.direction, fire.edge_bps, &e.to_string())
                    .await;
            }
        }

        self.gate.on_dispatch_done();
    }

    async fn handle_position_events(&mut self, events: Vec<PositionEvent>) {
        for event in events {
            match event {
                PositionEvent::Closed {
                    position,
                    reason,
                    fills,
                    close_edge_bps,
                    realized_pnl_usd,
                } => {
                    if let Err(e) = self
                        .store
                        .close_position(&position, &fills, reason, close_edge_bps, realized_pnl_usd)
                        .await
                    {
                        warn!(error = %e, "Position close row write failed");
                    }
                    let held_ms = position.age_ms(
                        self.last_tick.map(|t| t.recv_ms).unwrap_or(position.opened_at_ms),
                    );
                    self.notifier
                        .position_closed(&position, &fills, reason, realized_pnl_usd, held_ms)
                        .await;
                    self.guard.invalidate();
                }
                PositionEvent::Broken { position, detail } => {
                    self.flags.pause();
                    self.broken_hedges += 1;
                    error!(position_id = %position.id, detail = %detail, "Hedge broken, kill-switch set");
                    if let Err(e) = self.store.mark_position_broken(&position, &detail).await {
                        warn!(error = %e, "Broken-position row write failed");
                    }
                    self.notifier.hedge_broken(&position, &detail).await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_trade(
        &self,
        fire: GateFire,
        notional: f64,
        role: &str,
        threshold_bps: f64,
        request_id: Option<String>,
        response: serde_json::Value,
        status: &str,
    ) {
        let record = TradeRecord {
            ts: Utc::now(),
            base: self.base.clone(),
            direction: fire.direction.as_str().to_string(),
            threshold_bps,
            mm_best_bps: fire.edge_bps,
            notional_usd: notional,
            role: role.to_string(),
            request_id,
            request_json: serde_json::json!({
                "direction": fire.direction.as_str(),
                "edge_bps": fire.edge_bps,
                "notional_usd": notional,
            }),
            response_json: response,
            status: status.to_string(),
        };
        if let Err(e) = self.store.insert_trade(&record).await {
            warn!(error = %e, "Trade row write failed");
        }
    }

    async fn update_status(&mut self, payload: EdgePayload, now_ms: u64) {
        let mut status = self.status.write().await;
        status.last_edges = Some(payload);
        status.open_positions = self.manager.snapshot();
        status.balances = self.guard.cached();
        status.trades_executed = self.trades_executed;
        status.broken_hedges = self.broken_hedges;
        status.opportunities_recorded = self.tracker.recorded();
        status.dispatches_last_minute = self.gate.dispatches_last_minute(now_ms);
        status.paused = self.flags.is_paused();
        status.feed_stale = self.flags.is_feed_stale();
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        let (Some(tick), Some(edges)) = (self.last_tick, self.last_edges) else {
            warn!(?command, "No market data yet, command ignored");
            return;
        };
        match command {
            EngineCommand::CloseAll => {
                info!("Operator close-all");
                let events = self
                    .manager
                    .close_all(self.dispatcher.as_ref(), &tick, &edges)
                    .await;
                self.handle_position_events(events).await;
            }
            EngineCommand::Rebalance => {
                if let Err(e) = self.rebalancer.run_once(&tick).await {
                    warn!(error = %e, "Operator rebalance failed");
                }
            }
        }
    }

    /// Shutdown drain: kill-switch, close everything aggressively, flush.
    async fn drain(&mut self) {
        info!("Draining: kill-switch set, closing open positions");
        self.flags.pause();
        if let (Some(tick), Some(edges)) = (self.last_tick, self.last_edges) {
            let events = self
                .manager
                .close_all(self.dispatcher.as_ref(), &tick, &edges)
                .await;
            self.handle_position_events(events).await;
        } else if self.manager.open_count() > 0 {
            error!("Open positions but no market data to close against");
        }
        self.batch.flush().await;
    }
}

/// The hot-path task. Lagged tick receivers skip to the freshest tick, which
/// implements the freshest-wins drop policy end to end.
pub async fn engine_task<C: ExchangeClient>(
    mut engine: Engine<C>,
    mut tick_rx: broadcast::Receiver<Tick>,
    mut command_rx: mpsc::Receiver<EngineCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Engine started");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                engine.drain().await;
                break;
            }
            Some(command) = command_rx.recv() => {
                engine.handle_command(command).await;
            }
            tick = tick_rx.recv() => {
                match tick {
                    Ok(tick) => engine.handle_tick(tick).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Tick consumer lagged, skipping to freshest");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Tick stream closed");
                        engine.drain().await;
                        break;
                    }
                }
            }
        }
    }

    info!("Engine stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::paper::PaperClient;
    use crate::core::channels::EngineChannels;
    use crate::core::edge::Direction;

    fn tick_at(ms: u64, perp_bid: f64) -> Tick {
        Tick {
            perp_bid,
            perp_ask: perp_bid + 0.01,
            spot_bid: 49.985,
            spot_ask: 50.005,
            recv_ms: ms,
            send_ms: 0,
        }
    }

    /// A tick whose ps edge comfortably clears the 20 bps default threshold
    /// net of the 23 bps round-trip fee.
    fn rich_tick(ms: u64) -> Tick {
        tick_at(ms, 50.23)
    }

    fn quiet_tick(ms: u64) -> Tick {
        tick_at(ms, 50.0)
    }

    struct Harness {
        engine: Engine<PaperClient>,
        client: Arc<PaperClient>,
    }

    fn harness(dry_run: bool) -> Harness {
        let mut settings = Settings::defaults();
        settings.dry_run = dry_run;
        settings.alo_open_timeout_ms = 20;
        settings.alo_close_timeout_ms = 20;
        settings.alloc_per_trade_usd = 12.0;

        let client = Arc::new(PaperClient::new());
        let channels = EngineChannels::default();
        let flags = Arc::new(TradingFlags::new(false));
        let overrides = Overrides::from_settings(&settings).into_shared();
        let status = SharedStatus::default();
        let store = Arc::new(Store::new(None, None));
        let batch = Arc::new(EdgeBatchWriter::new(Arc::clone(&store)));
        let notifier = Arc::new(Notifier::new(None, None));

        let engine = Engine::new(
            &settings,
            107,
            Arc::clone(&client),
            channels.tick_watch(),
            overrides,
            flags,
            channels.edge_tx.clone(),
            status,
            store,
            batch,
            notifier,
        );
        Harness { engine, client }
    }

    /// Walk the gate through arm + dwell and fire the dispatch.
    async fn drive_open(h: &mut Harness) {
        h.engine.handle_tick(rich_tick(1_000)).await;
        h.engine.handle_tick(rich_tick(2_100)).await;
    }

    #[tokio::test]
    async fn test_full_open_cycle() {
        let mut h = harness(false);
        drive_open(&mut h).await;

        assert_eq!(h.engine.manager.open_count(), 1);
        assert_eq!(h.engine.trades_executed, 1);
        let position = &h.engine.manager.snapshot()[0];
        assert_eq!(position.direction, Direction::PerpToSpot);
        assert!((position.perp_size - position.spot_size).abs() <= 0.01);
    }

    #[tokio::test]
    async fn test_dry_run_never_places_orders() {
        let mut h = harness(true);
        drive_open(&mut h).await;

        assert_eq!(h.engine.manager.open_count(), 0);
        assert!(h.client.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_pause_blocks_opens_not_closes() {
        let mut h = harness(false);
        drive_open(&mut h).await;
        assert_eq!(h.engine.manager.open_count(), 1);

        h.engine.flags.pause();

        // Edge decays far enough that the reverse leg is free of fees: the
        // existing position closes even while paused, and nothing new opens.
        let mut closing = rich_tick(10_000);
        closing.perp_bid = 49.80;
        closing.perp_ask = 49.81;
        h.engine.handle_tick(closing).await;

        assert_eq!(h.engine.manager.open_count(), 0);
        h.engine.handle_tick(rich_tick(20_000)).await;
        h.engine.handle_tick(rich_tick(21_100)).await;
        assert_eq!(h.engine.manager.open_count(), 0, "paused engine must not open");
    }

    #[tokio::test]
    async fn test_max_positions_respected() {
        let mut h = harness(false);
        drive_open(&mut h).await;
        // Second position (defaults allow two)
        h.engine.handle_tick(rich_tick(10_000)).await;
        h.engine.handle_tick(rich_tick(11_100)).await;
        assert_eq!(h.engine.manager.open_count(), 2);

        let placed_before = h.client.placed_orders().await.len();
        // A third qualifying excursion is skipped at the cap
        h.engine.handle_tick(rich_tick(20_000)).await;
        h.engine.handle_tick(rich_tick(21_100)).await;
        assert_eq!(h.engine.manager.open_count(), 2);
        assert_eq!(h.client.placed_orders().await.len(), placed_before);
    }

    #[tokio::test]
    async fn test_broken_hedge_sets_kill_switch() {
        let mut h = harness(false);
        drive_open(&mut h).await;
        assert!(!h.engine.flags.is_paused());

        // Spot side goes dark: the max-hold close breaks on the spot leg
        h.client.reject_orders_for("@107").await;
        h.engine.handle_tick(quiet_tick(65_000)).await;

        assert!(h.engine.flags.is_paused(), "kill-switch auto-set");
        assert_eq!(h.engine.broken_hedges, 1);
        let broken = h.engine.manager.snapshot();
        assert_eq!(broken.len(), 1);
        assert_eq!(
            broken[0].status,
            crate::core::position::PositionStatus::Broken
        );
    }

    #[tokio::test]
    async fn test_close_all_command() {
        let mut h = harness(false);
        drive_open(&mut h).await;
        assert_eq!(h.engine.manager.open_count(), 1);

        h.engine.handle_command(EngineCommand::CloseAll).await;
        assert_eq!(h.engine.manager.open_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_closes_positions_and_pauses() {
        let mut h = harness(false);
        drive_open(&mut h).await;
        h.engine.drain().await;

        assert!(h.engine.flags.is_paused());
        assert_eq!(h.engine.manager.open_count(), 0);
    }

    #[tokio::test]
    async fn test_status_snapshot_updates() {
        let mut h = harness(false);
        drive_open(&mut h).await;

        let status = h.engine.status.read().await;
        assert!(status.last_edges.is_some());
        assert_eq!(status.open_positions.len(), 1);
        assert_eq!(status.trades_executed, 1);
        assert_eq!(status.dispatches_last_minute, 1);
    }
}
