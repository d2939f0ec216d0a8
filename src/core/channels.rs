//! Inter-task channels, shared flags and the engine status snapshot

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, RwLock};

use crate::core::capital::BalanceSnapshot;
use crate::core::feed::Tick;
use crate::core::position::HedgedPosition;

/// Default capacity for bounded channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// The latest-edge payload streamed to read-only observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgePayload {
    pub ts: DateTime<Utc>,
    pub base: String,
    pub spot_index: u32,
    pub edge_ps_mm_bps: f64,
    pub edge_sp_mm_bps: f64,
    pub mid_ref: f64,
    pub latency_ms: u64,
    pub threshold_bps: f64,
}

/// Operator commands that need the engine loop (everything else mutates
/// shared state directly)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    CloseAll,
    Rebalance,
}

/// Kill-switch and feed-health flags shared across tasks.
///
/// While paused the gate stays idle; the position manager keeps closing.
#[derive(Debug)]
pub struct TradingFlags {
    paused: AtomicBool,
    feed_stale: Arc<AtomicBool>,
}

impl TradingFlags {
    pub fn new(start_paused: bool) -> Self {
        Self {
            paused: AtomicBool::new(start_paused),
            feed_stale: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn is_feed_stale(&self) -> bool {
        self.feed_stale.load(Ordering::Relaxed)
    }

    /// Handle given to the feed task
    pub fn feed_stale_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.feed_stale)
    }
}

impl Default for TradingFlags {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Live snapshot served by the control surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub last_edges: Option<EdgePayload>,
    pub open_positions: Vec<HedgedPosition>,
    pub balances: Option<BalanceSnapshot>,
    pub trades_executed: u64,
    pub broken_hedges: u64,
    pub opportunities_recorded: u64,
    pub dispatches_last_minute: usize,
    pub paused: bool,
    pub feed_stale: bool,
}

pub type SharedStatus = Arc<RwLock<EngineStatus>>;

/// Bundle of all inter-task communication channels
pub struct EngineChannels {
    pub tick_tx: broadcast::Sender<Tick>,
    /// Freshest tick only; read by the dispatcher when re-pricing retries
    pub tick_watch_tx: watch::Sender<Option<Tick>>,
    pub edge_tx: broadcast::Sender<EdgePayload>,
    pub command_tx: mpsc::Sender<EngineCommand>,
    pub command_rx: mpsc::Receiver<EngineCommand>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl EngineChannels {
    pub fn new(capacity: usize) -> Self {
        let (tick_tx, _) = broadcast::channel(capacity);
        let (tick_watch_tx, _) = watch::channel(None);
        let (edge_tx, _) = broadcast::channel(capacity);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tick_tx,
            tick_watch_tx,
            edge_tx,
            command_tx,
            command_rx,
            shutdown_tx,
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn tick_watch(&self) -> watch::Receiver<Option<Tick>> {
        self.tick_watch_tx.subscribe()
    }
}

impl Default for EngineChannels {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
