//! Opportunity tracker: read-only volatility-source analytics
//!
//! A parallel observer on the tick stream. Every tick updates a rolling
//! baseline; ticks whose best edge clears the observation threshold produce
//! an `Opportunity` record classifying which side moved (perp, spot, or
//! both) and simulating the cost of three execution modes. The tracker never
//! places orders and nothing in here may propagate into the trading path.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::FeeSchedule;
use crate::core::feed::Tick;

/// Movements below this are indistinguishable from noise
const MOVEMENT_NOISE_FLOOR_BPS: f64 = 0.1;
/// Ratio guard against division by a dead side
const MOVEMENT_EPS_BPS: f64 = 1e-6;
/// Observed ALO close fill rate used in the blended ioc-both cost
const ALO_CLOSE_FILL_RATE: f64 = 0.8;

/// Which side of the market created the dislocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolatilitySource {
    Perp,
    Spot,
    Both,
}

/// Per-side mean of the last N ticks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub perp_bid: f64,
    pub perp_ask: f64,
    pub spot_bid: f64,
    pub spot_ask: f64,
}

/// Fixed-capacity FIFO of recent ticks. Reads return `None` until the
/// buffer is full.
#[derive(Debug)]
pub struct RollingBaseline {
    window: usize,
    perp_bids: VecDeque<f64>,
    perp_asks: VecDeque<f64>,
    spot_bids: VecDeque<f64>,
    spot_asks: VecDeque<f64>,
}

impl RollingBaseline {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            perp_bids: VecDeque::with_capacity(window),
            perp_asks: VecDeque::with_capacity(window),
            spot_bids: VecDeque::with_capacity(window),
            spot_asks: VecDeque::with_capacity(window),
        }
    }

    pub fn update(&mut self, tick: &Tick) {
        for (buf, value) in [
            (&mut self.perp_bids, tick.perp_bid),
            (&mut self.perp_asks, tick.perp_ask),
            (&mut self.spot_bids, tick.spot_bid),
            (&mut self.spot_asks, tick.spot_ask),
        ] {
            if buf.len() == self.window {
                buf.pop_front();
            }
            buf.push_back(value);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.perp_bids.len() >= self.window
    }

    pub fn get(&self) -> Option<Baseline> {
        if !self.is_ready() {
            return None;
        }
        let mean = |buf: &VecDeque<f64>| buf.iter().sum::<f64>() / buf.len() as f64;
        Some(Baseline {
            perp_bid: mean(&self.perp_bids),
            perp_ask: mean(&self.perp_asks),
            spot_bid: mean(&self.spot_bids),
            spot_ask: mean(&self.spot_asks),
        })
    }
}

/// Full observational record for one above-threshold tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub detected_at: DateTime<Utc>,
    pub edge_bps: f64,
    pub perp_bid: f64,
    pub perp_ask: f64,
    pub spot_bid: f64,
    pub spot_ask: f64,
    pub baseline_perp_bid: f64,
    pub baseline_perp_ask: f64,
    pub baseline_spot_bid: f64,
    pub baseline_spot_ask: f64,
    pub perp_bid_deviation_bps: f64,
    pub perp_ask_deviation_bps: f64,
    pub spot_bid_deviation_bps: f64,
    pub spot_ask_deviation_bps: f64,
    pub perp_movement_bps: f64,
    pub spot_movement_bps: f64,
    pub volatility_source: VolatilitySource,
    pub volatility_ratio: f64,
    pub cost_ioc_both: f64,
    pub cost_ioc_perp_alo_spot: f64,
    pub cost_ioc_spot_alo_perp: f64,
    pub expected_profit_ioc_both: f64,
    pub expected_profit_adaptive: f64,
    pub analysis_duration_ms: u64,
}

pub struct OpportunityTracker {
    threshold_bps: f64,
    baseline: RollingBaseline,
    fees: FeeSchedule,
    recorded: u64,
    last_detected_at: Option<DateTime<Utc>>,
}

impl OpportunityTracker {
    pub fn new(threshold_bps: f64, window: usize, fees: FeeSchedule) -> Self {
        Self {
            threshold_bps,
            baseline: RollingBaseline::new(window),
            fees,
            recorded: 0,
            last_detected_at: None,
        }
    }

    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    pub fn last_detected_at(&self) -> Option<DateTime<Utc>> {
        self.last_detected_at
    }

    /// Feed one tick. Returns a record when the best edge clears the
    /// observation threshold and the baseline is warm.
    pub fn on_tick(&mut self, tick: &Tick, best_edge_bps: f64) -> Option<Opportunity> {
        let started = Instant::now();

        // The baseline always advances, including on quiet ticks
        self.baseline.update(tick);

        if best_edge_bps < self.threshold_bps {
            return None;
        }
        let baseline = self.baseline.get()?;

        let deviations = deviations_bps(tick, &baseline);
        let (source, ratio) = classify(deviations.perp_movement, deviations.spot_movement);

        let cost_ioc_both = self.cost_ioc_both();
        let cost_ioc_perp_alo_spot = self.cost_ioc_perp_alo_spot();
        let cost_ioc_spot_alo_perp = self.cost_ioc_spot_alo_perp();
        let adaptive_cost = match source {
            VolatilitySource::Perp => cost_ioc_perp_alo_spot,
            VolatilitySource::Spot => cost_ioc_spot_alo_perp,
            VolatilitySource::Both => cost_ioc_both,
        };

        self.recorded += 1;
        let detected_at = Utc::now();
        self.last_detected_at = Some(detected_at);

        debug!(
            edge_bps = best_edge_bps,
            source = ?source,
            ratio,
            "Opportunity recorded"
        );

        Some(Opportunity {
            detected_at,
            edge_bps: best_edge_bps,
            perp_bid: tick.perp_bid,
            perp_ask: tick.perp_ask,
            spot_bid: tick.spot_bid,
            spot_ask: tick.spot_ask,
            baseline_perp_bid: baseline.perp_bid,
            baseline_perp_ask: baseline.perp_ask,
            baseline_spot_bid: baseline.spot_bid,
            baseline_spot_ask: baseline.spot_ask,
            perp_bid_deviation_bps: deviations.perp_bid,
            perp_ask_deviation_bps: deviations.perp_ask,
            spot_bid_deviation_bps: deviations.spot_bid,
            spot_ask_deviation_bps: deviations.spot_ask,
            perp_movement_bps: deviations.perp_movement,
            spot_movement_bps: deviations.spot_movement,
            volatility_source: source,
            volatility_ratio: ratio,
            cost_ioc_both,
            cost_ioc_perp_alo_spot,
            cost_ioc_spot_alo_perp,
            expected_profit_ioc_both: best_edge_bps - cost_ioc_both,
            expected_profit_adaptive: best_edge_bps - adaptive_cost,
            analysis_duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// IOC open plus a blended close: most closes fill on the maker attempt,
    /// the rest pay taker.
    fn cost_ioc_both(&self) -> f64 {
        let open = self.fees.taker_taker_bps();
        let close = ALO_CLOSE_FILL_RATE * self.fees.maker_maker_bps()
            + (1.0 - ALO_CLOSE_FILL_RATE) * self.fees.taker_taker_bps();
        open + close
    }

    /// Take the moving perp side, post the stable spot side; close maker-maker
    fn cost_ioc_perp_alo_spot(&self) -> f64 {
        (self.fees.perp_taker_bps + self.fees.spot_maker_bps) + self.fees.maker_maker_bps()
    }

    /// Take the moving spot side, post the stable perp side; close maker-maker
    fn cost_ioc_spot_alo_perp(&self) -> f64 {
        (self.fees.perp_maker_bps + self.fees.spot_taker_bps) + self.fees.maker_maker_bps()
    }
}

struct Deviations {
    perp_bid: f64,
    perp_ask: f64,
    spot_bid: f64,
    spot_ask: f64,
    perp_movement: f64,
    spot_movement: f64,
}

fn deviations_bps(tick: &Tick, baseline: &Baseline) -> Deviations {
    let mid_ref = (tick.perp_bid + tick.perp_ask + tick.spot_bid + tick.spot_ask) / 4.0;
    let to_bps = |current: f64, base: f64| {
        if mid_ref > 0.0 {
            (current - base) / mid_ref * 1e4
        } else {
            0.0
        }
    };

    let perp_bid = to_bps(tick.perp_bid, baseline.perp_bid);
    let perp_ask = to_bps(tick.perp_ask, baseline.perp_ask);
    let spot_bid = to_bps(tick.spot_bid, baseline.spot_bid);
    let spot_ask = to_bps(tick.spot_ask, baseline.spot_ask);

    Deviations {
        perp_bid,
        perp_ask,
        spot_bid,
        spot_ask,
        perp_movement: perp_ask.abs(),
        spot_movement: spot_bid.abs(),
    }
}

/// Perp-driven above 1.5x, spot-driven below 0.67x, everything in between is
/// both; two dead sides are both with ratio 1.
fn classify(perp_movement: f64, spot_movement: f64) -> (VolatilitySource, f64) {
    if perp_movement < MOVEMENT_NOISE_FLOOR_BPS && spot_movement < MOVEMENT_NOISE_FLOOR_BPS {
        return (VolatilitySource::Both, 1.0);
    }

    let ratio = perp_movement / spot_movement.max(MOVEMENT_EPS_BPS);
    if ratio > 1.5 {
        (VolatilitySource::Perp, ratio)
    } else if ratio < 0.67 {
        (
            VolatilitySource::Spot,
            spot_movement / perp_movement.max(MOVEMENT_EPS_BPS),
        )
    } else {
        (VolatilitySource::Both, ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn flat_tick() -> Tick {
        tick(49.99, 50.01, 49.98, 50.02)
    }

    fn tracker() -> OpportunityTracker {
        OpportunityTracker::new(10.0, 20, FeeSchedule::default())
    }

    fn warm(t: &mut OpportunityTracker, n: usize) {
        for _ in 0..n {
            t.on_tick(&flat_tick(), 0.0);
        }
    }

    #[test]
    fn test_baseline_none_until_full() {
        let mut b = RollingBaseline::new(20);
        for i in 0..19 {
            b.update(&flat_tick());
            assert!(b.get().is_none(), "not ready after {} ticks", i + 1);
        }
        b.update(&flat_tick());
        let baseline = b.get().expect("ready at window size");
        assert!((baseline.perp_bid - 49.99).abs() < 1e-9);
    }

    #[test]
    fn test_baseline_evicts_oldest() {
        let mut b = RollingBaseline::new(2);
        b.update(&tick(10.0, 10.1, 10.0, 10.1));
        b.update(&tick(20.0, 20.1, 20.0, 20.1));
        b.update(&tick(30.0, 30.1, 30.0, 30.1));
        let baseline = b.get().unwrap();
        assert!((baseline.perp_bid - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_record_below_observation_threshold() {
        let mut t = tracker();
        warm(&mut t, 20);
        assert!(t.on_tick(&flat_tick(), 9.9).is_none());
        assert_eq!(t.recorded(), 0);
    }

    #[test]
    fn test_no_record_before_baseline_warm() {
        let mut t = tracker();
        warm(&mut t, 10);
        assert!(t.on_tick(&flat_tick(), 25.0).is_none());
    }

    #[test]
    fn test_perp_driven_classification() {
        let mut t = tracker();
        warm(&mut t, 20);

        // Perp ask jumps well clear of the baseline; spot barely moves
        let spiky = tick(50.24, 50.26, 49.981, 50.021);
        let opp = t.on_tick(&spiky, 25.0).expect("above threshold");

        assert_eq!(opp.volatility_source, VolatilitySource::Perp);
        assert!(opp.volatility_ratio > 1.5);
        assert!(opp.perp_movement_bps > opp.spot_movement_bps);
        assert_eq!(t.recorded(), 1);
    }

    #[test]
    fn test_spot_driven_classification() {
        let mut t = tracker();
        warm(&mut t, 20);

        let spiky = tick(49.991, 50.011, 49.73, 50.27);
        let opp = t.on_tick(&spiky, 25.0).expect("above threshold");
        assert_eq!(opp.volatility_source, VolatilitySource::Spot);
    }

    #[test]
    fn test_quiet_sides_classify_as_both_ratio_one() {
        let (source, ratio) = classify(0.05, 0.04);
        assert_eq!(source, VolatilitySource::Both);
        assert_eq!(ratio, 1.0);
    }

    #[test]
    fn test_balanced_movement_is_both() {
        let (source, _) = classify(1.0, 1.0);
        assert_eq!(source, VolatilitySource::Both);
        let (source, _) = classify(1.4, 1.0);
        assert_eq!(source, VolatilitySource::Both);
    }

    #[test]
    fn test_classification_boundaries() {
        let (source, _) = classify(1.51, 1.0);
        assert_eq!(source, VolatilitySource::Perp);
        let (source, ratio) = classify(0.66, 1.0);
        assert_eq!(source, VolatilitySource::Spot);
        assert!(ratio > 1.5, "spot ratio reported as dominant/secondary");
    }

    #[test]
    fn test_costs_derive_from_fee_schedule() {
        let mut t = tracker();
        warm(&mut t, 20);
        let opp = t.on_tick(&tick(50.24, 50.26, 49.981, 50.021), 25.0).unwrap();

        // perp 1.5/4.5, spot 4.0/7.0
        assert!((opp.cost_ioc_perp_alo_spot - (4.5 + 4.0 + 5.5)).abs() < 1e-9);
        assert!((opp.cost_ioc_spot_alo_perp - (1.5 + 7.0 + 5.5)).abs() < 1e-9);
        let blended_close = 0.8 * 5.5 + 0.2 * 11.5;
        assert!((opp.cost_ioc_both - (11.5 + blended_close)).abs() < 1e-9);

        assert!((opp.expected_profit_ioc_both - (25.0 - opp.cost_ioc_both)).abs() < 1e-9);
        // Perp-driven: adaptive uses the ioc-perp/alo-spot cost
        assert!(
            (opp.expected_profit_adaptive - (25.0 - opp.cost_ioc_perp_alo_spot)).abs() < 1e-9
        );
    }

    #[test]
    fn test_degenerate_prices_do_not_panic() {
        let mut t = OpportunityTracker::new(10.0, 2, FeeSchedule::default());
        t.on_tick(&tick(0.0, 0.0, 0.0, 0.0), 0.0);
        t.on_tick(&tick(0.0, 0.0, 0.0, 0.0), 0.0);
        let opp = t.on_tick(&tick(0.0, 0.0, 0.0, 0.0), 25.0);
        assert!(opp.is_some(), "degenerate prices still produce a record");
    }
}
