//! Stability gate: dwell-filtered dispatch triggering
//!
//! The gate turns a noisy edge stream into at most one dispatch request per
//! sustained excursion. States: Idle -> Armed -> Firing -> CoolDown -> Idle.
//! Arming requires the best edge to strictly exceed the threshold and the
//! sliding rate window to have room; the armed direction is frozen and any
//! tick below threshold disarms. Firing emits exactly one request.
//!
//! The pause flag (kill-switch) and the feed-stale flag both hold the gate
//! in Idle without affecting position closes.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::core::edge::{Direction, EdgePair};

/// Sliding-window dispatch counter (60 s)
#[derive(Debug)]
pub struct RateWindow {
    cap: usize,
    window_ms: u64,
    stamps: VecDeque<u64>,
}

impl RateWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            window_ms: 60_000,
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now_ms: u64) {
        while let Some(&front) = self.stamps.front() {
            if now_ms.saturating_sub(front) >= self.window_ms {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether another dispatch fits in the window right now
    pub fn would_allow(&mut self, now_ms: u64) -> bool {
        self.prune(now_ms);
        self.stamps.len() < self.cap
    }

    /// Count a dispatch against the window
    pub fn record(&mut self, now_ms: u64) {
        self.prune(now_ms);
        self.stamps.push_back(now_ms);
    }

    pub fn count(&mut self, now_ms: u64) -> usize {
        self.prune(now_ms);
        self.stamps.len()
    }
}

/// Gate state. `Firing` is transient inside `on_edge`; the observable state
/// after a fire is `CoolDown`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateState {
    Idle,
    Armed {
        direction: Direction,
        armed_at_ms: u64,
    },
    CoolDown {
        since_ms: u64,
    },
}

/// One dispatch request emitted by the gate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateFire {
    pub direction: Direction,
    pub edge_bps: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub dwell_ms: u64,
    pub cool_down_ms: u64,
    pub max_trades_per_min: usize,
}

#[derive(Debug)]
pub struct StabilityGate {
    cfg: GateConfig,
    state: GateState,
    rate: RateWindow,
}

impl StabilityGate {
    pub fn new(cfg: GateConfig) -> Self {
        let rate = RateWindow::new(cfg.max_trades_per_min);
        Self {
            cfg,
            state: GateState::Idle,
            rate,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn dispatches_last_minute(&mut self, now_ms: u64) -> usize {
        self.rate.count(now_ms)
    }

    /// Dispatcher reported a terminal status; cooldown ends early.
    pub fn on_dispatch_done(&mut self) {
        if matches!(self.state, GateState::CoolDown { .. }) {
            self.state = GateState::Idle;
        }
    }

    /// Advance the state machine with one tick's edges. Returns a dispatch
    /// request in the tick where the armed edge has held for the dwell time.
    pub fn on_edge(
        &mut self,
        edges: &EdgePair,
        threshold_bps: f64,
        paused: bool,
        feed_stale: bool,
        now_ms: u64,
    ) -> Option<GateFire> {
        if paused || feed_stale {
            self.state = GateState::Idle;
            return None;
        }

        // At most two passes: a disarm or an expired cooldown may re-enter
        // Idle and arm again on the same tick.
        for _ in 0..2 {
            match self.state {
                GateState::Idle => {
                    let (direction, best) = edges.best();
                    if best > threshold_bps {
                        if !self.rate.would_allow(now_ms) {
                            debug!(
                                edge_bps = best,
                                "Rate window full, refusing to arm"
                            );
                            return None;
                        }
                        self.state = GateState::Armed {
                            direction,
                            armed_at_ms: now_ms,
                        };
                        debug!(direction = %direction, edge_bps = best, "Gate armed");
                    }
                    return None;
                }
                GateState::Armed {
                    direction,
                    armed_at_ms,
                } => {
                    let edge = edges.edge_for(direction);
                    if edge < threshold_bps {
                        self.state = GateState::Idle;
                        debug!(direction = %direction, edge_bps = edge, "Gate disarmed");
                        continue;
                    }
                    if now_ms.saturating_sub(armed_at_ms) >= self.cfg.dwell_ms {
                        // Firing: one request per armed episode
                        self.rate.record(now_ms);
                        self.state = GateState::CoolDown { since_ms: now_ms };
                        info!(
                            direction = %direction,
                            edge_bps = edge,
                            dwell_ms = self.cfg.dwell_ms,
                            "Edge stable above threshold, dispatching"
                        );
                        return Some(GateFire {
                            direction,
                            edge_bps: edge,
                        });
                    }
                    return None;
                }
                GateState::CoolDown { since_ms } => {
                    if now_ms.saturating_sub(since_ms) >= self.cfg.cool_down_ms {
                        self.state = GateState::Idle;
                        continue;
                    }
                    return None;
                }
            }
        }
        None
    }
}
