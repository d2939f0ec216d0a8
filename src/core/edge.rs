//! Edge calculation: net round-trip profitability of the basis trade
//!
//! Pure and stateless. Two signed edges are produced per tick, one per
//! direction, in basis points of the four-way mid and net of the round-trip
//! fee constant for the dominant (taker-taker) execution mode.

use serde::{Deserialize, Serialize};

use crate::core::feed::Tick;

/// Trade direction, the most load-bearing contract in the engine.
///
/// `PerpToSpot`: the perp trades rich (`edge_ps_bps > 0`), so open
/// SHORT perp + BUY spot. `SpotToPerp`: the spot trades rich
/// (`edge_sp_bps > 0`), so open LONG perp + SELL spot. Close reverses.
/// String forms exist only for external interfaces (storage, notifications).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    PerpToSpot,
    SpotToPerp,
}

impl Direction {
    pub fn reverse(&self) -> Self {
        match self {
            Direction::PerpToSpot => Direction::SpotToPerp,
            Direction::SpotToPerp => Direction::PerpToSpot,
        }
    }

    /// Wire/storage tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::PerpToSpot => "perp->spot",
            Direction::SpotToPerp => "spot->perp",
        }
    }

    /// Perp leg side when opening in this direction
    pub fn perp_is_buy(&self) -> bool {
        matches!(self, Direction::SpotToPerp)
    }

    /// Spot leg side when opening in this direction
    pub fn spot_is_buy(&self) -> bool {
        matches!(self, Direction::PerpToSpot)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both directional edges plus the mid they are quoted against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgePair {
    /// Net edge for SHORT perp + BUY spot, in bps of mid_ref
    pub edge_ps_bps: f64,
    /// Net edge for LONG perp + SELL spot, in bps of mid_ref
    pub edge_sp_bps: f64,
    /// Four-way mid: (perp_bid + perp_ask + spot_bid + spot_ask) / 4
    pub mid_ref: f64,
}

impl EdgePair {
    /// The stronger direction and its edge. Both edges positive is impossible
    /// under correct fees but guarded: the larger magnitude wins.
    pub fn best(&self) -> (Direction, f64) {
        if self.edge_ps_bps >= self.edge_sp_bps {
            (Direction::PerpToSpot, self.edge_ps_bps)
        } else {
            (Direction::SpotToPerp, self.edge_sp_bps)
        }
    }

    pub fn best_edge(&self) -> f64 {
        self.best().1
    }

    pub fn edge_for(&self, direction: Direction) -> f64 {
        match direction {
            Direction::PerpToSpot => self.edge_ps_bps,
            Direction::SpotToPerp => self.edge_sp_bps,
        }
    }
}

/// Compute both edges for a tick.
///
/// `fees_bps_roundtrip` is the non-negative round-trip cost constant
/// (taker-taker, open and close) subtracted from both raw edges.
pub fn compute_edges(tick: &Tick, fees_bps_roundtrip: f64) -> EdgePair {
    let mid_ref = (tick.perp_bid + tick.perp_ask + tick.spot_bid + tick.spot_ask) / 4.0;
    if mid_ref <= 0.0 {
        return EdgePair {
            edge_ps_bps: 0.0,
            edge_sp_bps: 0.0,
            mid_ref: 0.0,
        };
    }

    let raw_ps = 1e4 * (tick.perp_bid - tick.spot_ask) / mid_ref;
    let raw_sp = 1e4 * (tick.spot_bid - tick.perp_ask) / mid_ref;

    EdgePair {
        edge_ps_bps: raw_ps - fees_bps_roundtrip,
        edge_sp_bps: raw_sp - fees_bps_roundtrip,
        mid_ref,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEES: f64 = 23.0;

    fn tick(pb: f64, pa: f64, sb: f64, sa: f64) -> Tick {
        Tick {
            perp_bid: pb,
            perp_ask: pa,
            spot_bid: sb,
            spot_ask: sa,
            recv_ms: 0,
            send_ms: 0,
        }
    }

    #[test]
    fn test_balanced_books_penalized_by_fees() {
        // Identical books: raw edges are the negated half-spreads, so both
        // nets sit below zero by at least the fee constant.
        let edges = compute_edges(&tick(100.0, 100.0, 100.0, 100.0), FEES);
        assert!((edges.edge_ps_bps - (-FEES)).abs() < 1e-9);
        assert!((edges.edge_sp_bps - (-FEES)).abs() < 1e-9);
        assert!((edges.mid_ref - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_positive_perp_to_spot_edge() {
        let t = tick(101.0, 101.2, 99.5, 99.7);
        let edges = compute_edges(&t, FEES);
        let mid = (101.0 + 101.2 + 99.5 + 99.7) / 4.0;
        let raw_ps = 1e4 * (101.0 - 99.7) / mid;
        let raw_sp = 1e4 * (99.5 - 101.2) / mid;

        assert!((edges.mid_ref - mid).abs() < 1e-9);
        assert!((edges.edge_ps_bps - (raw_ps - FEES)).abs() < 1e-9);
        assert!((edges.edge_sp_bps - (raw_sp - FEES)).abs() < 1e-9);

        let (dir, best) = edges.best();
        assert_eq!(dir, Direction::PerpToSpot);
        assert!((best - edges.edge_ps_bps).abs() < 1e-12);
    }

    #[test]
    fn test_positive_spot_to_perp_edge() {
        let edges = compute_edges(&tick(50.0, 50.2, 51.5, 51.7), FEES);
        assert!(edges.edge_sp_bps > edges.edge_ps_bps);
        let (dir, _) = edges.best();
        assert_eq!(dir, Direction::SpotToPerp);
    }

    #[test]
    fn test_round_trip_identity_in_arbitrage_free_books() {
        // With uncrossed books the raw edges sum to minus the two spreads,
        // so the nets satisfy edge_ps + edge_sp <= -2 * fees.
        let edges = compute_edges(&tick(49.99, 50.01, 49.98, 50.02), FEES);
        assert!(edges.edge_ps_bps + edges.edge_sp_bps <= -2.0 * FEES + 1e-9);
    }

    #[test]
    fn test_degenerate_mid_yields_zero_edges() {
        let edges = compute_edges(&tick(0.0, 0.0, 0.0, 0.0), FEES);
        assert_eq!(edges.edge_ps_bps, 0.0);
        assert_eq!(edges.edge_sp_bps, 0.0);
        assert_eq!(edges.mid_ref, 0.0);
    }

    #[test]
    fn test_direction_semantics() {
        // The historically miscoded invariant: perp->spot means SHORT perp,
        // BUY spot; spot->perp means LONG perp, SELL spot.
        assert!(!Direction::PerpToSpot.perp_is_buy());
        assert!(Direction::PerpToSpot.spot_is_buy());
        assert!(Direction::SpotToPerp.perp_is_buy());
        assert!(!Direction::SpotToPerp.spot_is_buy());
        assert_eq!(Direction::PerpToSpot.reverse(), Direction::SpotToPerp);
        assert_eq!(Direction::PerpToSpot.as_str(), "perp->spot");
    }

    #[test]
    fn test_best_prefers_larger_magnitude_when_both_positive() {
        let edges = EdgePair {
            edge_ps_bps: 4.0,
            edge_sp_bps: 9.0,
            mid_ref: 50.0,
        };
        let (dir, best) = edges.best();
        assert_eq!(dir, Direction::SpotToPerp);
        assert_eq!(best, 9.0);
    }

    #[test]
    fn test_edge_for_matches_fields() {
        let edges = EdgePair {
            edge_ps_bps: -3.0,
            edge_sp_bps: 18.0,
            mid_ref: 50.0,
        };
        assert_eq!(edges.edge_for(Direction::PerpToSpot), -3.0);
        assert_eq!(edges.edge_for(Direction::SpotToPerp), 18.0);
    }
}
