//! Hedged position lifecycle
//!
//! The manager owns every open `HedgedPosition` and is the only writer of
//! position state. Closure is checked against each tick: hard hold timeout,
//! reverse-edge decay past the close threshold, or an operator request. The
//! kill-switch never stops closes, only new opens.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::traits::ExchangeClient;
use crate::config::FeeSchedule;
use crate::core::dispatch::{CloseFills, DispatchError, OrderDispatcher};
use crate::core::edge::{Direction, EdgePair};
use crate::core::feed::Tick;

/// How one side of a dispatch ultimately executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMethod {
    /// Filled on the maker (ALO) attempt
    Maker,
    /// Needed the aggressive IOC path
    Ioc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    /// One leg could not be flattened; manual review required
    Broken,
}

/// A delta-neutral perp/spot pair.
///
/// Invariant while `Open`: `|perp_size - spot_size|` stays within one lot
/// step of the smaller instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgedPosition {
    pub id: Uuid,
    pub direction: Direction,
    pub opened_at: DateTime<Utc>,
    pub opened_at_ms: u64,
    pub notional_usd: f64,
    pub perp_size: f64,
    pub spot_size: f64,
    pub perp_entry_px: f64,
    pub spot_entry_px: f64,
    pub open_edge_bps: f64,
    pub open_method: ExecMethod,
    pub status: PositionStatus,
}

impl HedgedPosition {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        direction: Direction,
        notional_usd: f64,
        perp_size: f64,
        spot_size: f64,
        perp_entry_px: f64,
        spot_entry_px: f64,
        open_edge_bps: f64,
        open_method: ExecMethod,
        opened_at_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            opened_at: Utc::now(),
            opened_at_ms,
            notional_usd,
            perp_size,
            spot_size,
            perp_entry_px,
            spot_entry_px,
            open_edge_bps,
            open_method,
            status: PositionStatus::Open,
        }
    }

    pub fn is_delta_neutral(&self, lot_step: f64) -> bool {
        (self.perp_size - self.spot_size).abs() <= lot_step
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.opened_at_ms)
    }
}

/// Why a close was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    MaxHold,
    EdgeDecay,
    Operator,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::MaxHold => "max_hold",
            CloseReason::EdgeDecay => "edge_decay",
            CloseReason::Operator => "operator",
        }
    }
}

/// Terminal lifecycle events surfaced to the runtime for persistence,
/// notification and the kill-switch.
#[derive(Debug, Clone)]
pub enum PositionEvent {
    Closed {
        position: HedgedPosition,
        reason: CloseReason,
        fills: CloseFills,
        close_edge_bps: f64,
        realized_pnl_usd: f64,
    },
    Broken {
        position: HedgedPosition,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct PositionConfig {
    pub max_hold_ms: u64,
    /// Close once the reverse edge reaches this level (0 = free of fees)
    pub close_threshold_bps: f64,
    pub fees: FeeSchedule,
}

pub struct PositionManager {
    cfg: PositionConfig,
    positions: HashMap<Uuid, HedgedPosition>,
}

impl PositionManager {
    pub fn new(cfg: PositionConfig) -> Self {
        Self {
            cfg,
            positions: HashMap::new(),
        }
    }

    pub fn insert(&mut self, position: HedgedPosition) {
        info!(
            position_id = %position.id,
            direction = %position.direction,
            open_edge_bps = position.open_edge_bps,
            "Position tracked"
        );
        self.positions.insert(position.id, position);
    }

    pub fn open_count(&self) -> usize {
        self.positions
            .values()
            .filter(|p| matches!(p.status, PositionStatus::Open))
            .count()
    }

    pub fn snapshot(&self) -> Vec<HedgedPosition> {
        self.positions.values().cloned().collect()
    }

    /// Check every open position against the closure rules for this tick and
    /// close the ones that qualify. Returns the terminal events produced.
    pub async fn on_tick<C: ExchangeClient>(
        &mut self,
        dispatcher: &OrderDispatcher<C>,
        tick: &Tick,
        edges: &EdgePair,
        now_ms: u64,
    ) -> Vec<PositionEvent> {
        let due: Vec<(Uuid, CloseReason)> = self
            .positions
            .values()
            .filter(|p| matches!(p.status, PositionStatus::Open))
            .filter_map(|p| {
                if p.age_ms(now_ms) >= self.cfg.max_hold_ms {
                    Some((p.id, CloseReason::MaxHold))
                } else if edges.edge_for(p.direction.reverse()) >= self.cfg.close_threshold_bps {
                    Some((p.id, CloseReason::EdgeDecay))
                } else {
                    None
                }
            })
            .collect();

        let mut events = Vec::new();
        for (id, reason) in due {
            if let Some(event) = self
                .close_position(dispatcher, id, reason, tick, edges, false)
                .await
            {
                events.push(event);
            }
        }
        events
    }

    /// Operator request: close every open position immediately with
    /// aggressive IOC (also the shutdown drain path).
    pub async fn close_all<C: ExchangeClient>(
        &mut self,
        dispatcher: &OrderDispatcher<C>,
        tick: &Tick,
        edges: &EdgePair,
    ) -> Vec<PositionEvent> {
        let ids: Vec<Uuid> = self
            .positions
            .values()
            .filter(|p| matches!(p.status, PositionStatus::Open))
            .map(|p| p.id)
            .collect();

        let mut events = Vec::new();
        for id in ids {
            if let Some(event) = self
                .close_position(dispatcher, id, CloseReason::Operator, tick, edges, true)
                .await
            {
                events.push(event);
            }
        }
        events
    }

    async fn close_position<C: ExchangeClient>(
        &mut self,
        dispatcher: &OrderDispatcher<C>,
        id: Uuid,
        reason: CloseReason,
        tick: &Tick,
        edges: &EdgePair,
        prefer_ioc: bool,
    ) -> Option<PositionEvent> {
        let position = self.positions.get_mut(&id)?;
        position.status = PositionStatus::Closing;
        let snapshot = position.clone();

        info!(
            position_id = %id,
            reason = reason.as_str(),
            age_ms = snapshot.age_ms(now_from_tick(tick)),
            "Closing position"
        );

        match dispatcher.close(&snapshot, tick, prefer_ioc).await {
            Ok(fills) => {
                let close_edge_bps = edges.edge_for(snapshot.direction.reverse());
                let realized_pnl_usd = realized_pnl(&snapshot, &fills, &self.cfg.fees);
                info!(
                    position_id = %id,
                    pnl_usd = realized_pnl_usd,
                    method = ?fills.method,
                    "Position closed"
                );
                let mut closed = snapshot;
                closed.status = PositionStatus::Closed;
                self.positions.remove(&id);
                Some(PositionEvent::Closed {
                    position: closed,
                    reason,
                    fills,
                    close_edge_bps,
                    realized_pnl_usd,
                })
            }
            Err(DispatchError::NoFill) => {
                // Nothing traded; keep the position open and retry on a
                // later tick.
                if let Some(p) = self.positions.get_mut(&id) {
                    p.status = PositionStatus::Open;
                }
                warn!(position_id = %id, "Close attempt had no fill, will retry");
                None
            }
            Err(e @ DispatchError::BrokenHedge { .. }) => {
                if let Some(p) = self.positions.get_mut(&id) {
                    p.status = PositionStatus::Broken;
                }
                let mut broken = snapshot;
                broken.status = PositionStatus::Broken;
                error!(position_id = %id, error = %e, "Hedge broken during close");
                Some(PositionEvent::Broken {
                    position: broken,
                    detail: e.to_string(),
                })
            }
            Err(e) => {
                if let Some(p) = self.positions.get_mut(&id) {
                    p.status = PositionStatus::Open;
                }
                warn!(position_id = %id, error = %e, "Close failed, will retry");
                None
            }
        }
    }
}

fn now_from_tick(tick: &Tick) -> u64 {
    tick.recv_ms
}

/// Realised P&L from entry and exit fills, net of fees.
///
/// Entry fees follow the recorded open method; exit fees follow the close
/// method the dispatcher reported.
pub fn realized_pnl(position: &HedgedPosition, fills: &CloseFills, fees: &FeeSchedule) -> f64 {
    let (perp_pnl, spot_pnl) = match position.direction {
        // Short perp, long spot
        Direction::PerpToSpot => (
            (position.perp_entry_px - fills.perp_exit_px) * position.perp_size,
            (fills.spot_exit_px - position.spot_entry_px) * position.spot_size,
        ),
        // Long perp, short spot
        Direction::SpotToPerp => (
            (fills.perp_exit_px - position.perp_entry_px) * position.perp_size,
            (position.spot_entry_px - fills.spot_exit_px) * position.spot_size,
        ),
    };

    let (entry_perp_bps, entry_spot_bps) = match position.open_method {
        ExecMethod::Maker => (fees.perp_maker_bps, fees.spot_maker_bps),
        ExecMethod::Ioc => (fees.perp_taker_bps, fees.spot_taker_bps),
    };
    let (exit_perp_bps, exit_spot_bps) = match fills.method {
        ExecMethod::Maker => (fees.perp_maker_bps, fees.spot_maker_bps),
        ExecMethod::Ioc => (fees.perp_taker_bps, fees.spot_taker_bps),
    };

    let entry_fees = position.perp_entry_px * position.perp_size * entry_perp_bps / 1e4
        + position.spot_entry_px * position.spot_size * entry_spot_bps / 1e4;
    let exit_fees = fills.perp_exit_px * position.perp_size * exit_perp_bps / 1e4
        + fills.spot_exit_px * position.spot_size * exit_spot_bps / 1e4;

    perp_pnl + spot_pnl - entry_fees - exit_fees
}
