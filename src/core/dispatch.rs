//! Order dispatcher: two-leg atomic hedging with maker-first execution
//!
//! The dispatcher sizes both legs for leverage parity, submits them
//! concurrently, and guarantees one of three outcomes: a hedged position,
//! no fill with no state change, or a flattened one-sided fill. Post-only
//! rejections and IOC misses are expected flows driving the ALO -> IOC
//! escalation ladder, never surfaced as raw errors.
//!
//! Sizing invariant: the spot leg hedges the *notional* of the leveraged
//! perp leg, so `perp_size == spot_size == notional * leverage / mid`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::adapters::errors::ExchangeError;
use crate::adapters::hyperliquid::now_ms;
use crate::adapters::traits::ExchangeClient;
use crate::adapters::types::{LegResult, OrderAck, OrderSpec, Tif};
use crate::core::edge::Direction;
use crate::core::feed::Tick;
use crate::core::position::{ExecMethod, HedgedPosition};

/// Slippage widening applied on the final IOC retry, after the re-price
const SLIPPAGE_ESCALATION_BPS: f64 = 10.0;

/// Instrument precision: sizes are floored to the lot step, prices rounded
/// to the venue's price decimals.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentMeta {
    pub perp_sz_decimals: u32,
    pub spot_sz_decimals: u32,
    pub perp_px_decimals: u32,
    pub spot_px_decimals: u32,
}

impl Default for InstrumentMeta {
    fn default() -> Self {
        Self {
            perp_sz_decimals: 2,
            spot_sz_decimals: 2,
            perp_px_decimals: 3,
            spot_px_decimals: 3,
        }
    }
}

impl InstrumentMeta {
    /// Smallest representable size increment on the perp book
    pub fn perp_lot_step(&self) -> f64 {
        10f64.powi(-(self.perp_sz_decimals as i32))
    }

    pub fn spot_lot_step(&self) -> f64 {
        10f64.powi(-(self.spot_sz_decimals as i32))
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub perp_coin: String,
    pub spot_coin: String,
    pub leverage: f64,
    pub slippage_bps: f64,
    pub alo_open_timeout_ms: u64,
    pub alo_close_timeout_ms: u64,
    pub min_order_notional_usd: f64,
    pub deadman_ms: u64,
    /// Fill-state poll cadence while a maker order rests
    pub fill_poll_ms: u64,
    pub meta: InstrumentMeta,
}

impl DispatcherConfig {
    pub fn new(perp_coin: impl Into<String>, spot_coin: impl Into<String>) -> Self {
        Self {
            perp_coin: perp_coin.into(),
            spot_coin: spot_coin.into(),
            leverage: 3.0,
            slippage_bps: 10.0,
            alo_open_timeout_ms: 150,
            alo_close_timeout_ms: 5_000,
            min_order_notional_usd: 10.0,
            deadman_ms: 5_000,
            fill_poll_ms: 25,
            meta: InstrumentMeta::default(),
        }
    }
}

/// Terminal dispatch outcomes. `PartialRecovered` and the admission refusals
/// are expected flows; only `BrokenHedge` pages the operator.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no leg filled")]
    NoFill,

    #[error("one-sided fill flattened: {coin} {size}")]
    PartialRecovered { coin: String, size: f64 },

    #[error("unrecoverable hedge: {coin} {size} exposed")]
    BrokenHedge {
        coin: String,
        size: f64,
        is_buy: bool,
    },

    #[error("insufficient capital: {0}")]
    InsufficientCapital(String),

    #[error("rate limited")]
    RateLimited,

    #[error("paused")]
    Paused,

    #[error("feed stale")]
    FeedStale,

    #[error("order notional {notional:.2} below minimum {min:.2}")]
    BelowMinNotional { notional: f64, min: f64 },

    #[error("exchange: {0}")]
    Exchange(#[from] ExchangeError),
}

/// Exit fills reported back to the position manager
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseFills {
    pub perp_exit_px: f64,
    pub spot_exit_px: f64,
    pub method: ExecMethod,
}

/// One leg's order plus enough context to recover it
#[derive(Debug, Clone)]
struct LegPlan {
    spec: OrderSpec,
    is_perp: bool,
}

pub struct OrderDispatcher<C: ExchangeClient> {
    client: Arc<C>,
    cfg: DispatcherConfig,
    /// Freshest tick from the feed, consulted when an IOC retry re-prices.
    /// Holds `None` until the feed has produced a tick.
    tick_watch: watch::Receiver<Option<Tick>>,
}

impl<C: ExchangeClient> OrderDispatcher<C> {
    pub fn new(
        client: Arc<C>,
        cfg: DispatcherConfig,
        tick_watch: watch::Receiver<Option<Tick>>,
    ) -> Self {
        Self {
            client,
            cfg,
            tick_watch,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.cfg
    }

    /// Latest tick the feed has published, falling back to the tick the
    /// dispatch was submitted against when nothing newer (or valid) exists.
    fn fresh_tick(&self, fallback: &Tick) -> Tick {
        match *self.tick_watch.borrow() {
            Some(tick) if tick.is_valid() => tick,
            _ => *fallback,
        }
    }

    // =========================================================================
    // Open
    // =========================================================================

    /// Open a hedged position. `prefer_ioc` skips the maker attempt (spike
    /// entries and the `set tif ioc` override).
    pub async fn open(
        &self,
        direction: Direction,
        notional_usd: f64,
        tick: &Tick,
        prefer_ioc: bool,
        open_edge_bps: f64,
    ) -> Result<HedgedPosition, DispatchError> {
        let (perp_size, spot_size) = self.size_legs(notional_usd, tick)?;
        let plans = self.open_plans(direction, perp_size, spot_size, tick, prefer_ioc);

        let timeout = if prefer_ioc {
            0
        } else {
            self.cfg.alo_open_timeout_ms
        };
        let (mut perp_res, mut spot_res) =
            self.execute_pair(&plans.0, &plans.1, timeout).await;

        // Escalate every leg that did not fully fill to aggressive IOC.
        let mut method = ExecMethod::Maker;
        if prefer_ioc {
            method = ExecMethod::Ioc;
        }
        for (res, plan) in [(&mut perp_res, &plans.0), (&mut spot_res, &plans.1)] {
            let remaining = plan.spec.size - res.filled_size();
            if remaining > self.lot_eps(plan.is_perp) {
                method = ExecMethod::Ioc;
                let ioc = if prefer_ioc {
                    // The first IOC already ran at base slippage; what is
                    // left is the re-price and the escalation.
                    self.ioc_retries(direction, plan.is_perp, remaining, tick, false)
                        .await
                } else {
                    self.ioc_with_escalation(direction, plan.is_perp, remaining, tick, false)
                        .await
                };
                *res = merge_fills(res, &ioc);
            }
        }

        let outcome = self
            .settle_open(
                direction,
                notional_usd,
                (perp_size, spot_size),
                (&perp_res, &spot_res),
                tick,
                open_edge_bps,
                method,
            )
            .await;

        self.rearm_deadman().await;
        outcome
    }

    /// Resolve the three-way outcome after all retries.
    #[allow(clippy::too_many_arguments)]
    async fn settle_open(
        &self,
        direction: Direction,
        notional_usd: f64,
        targets: (f64, f64),
        results: (&LegResult, &LegResult),
        tick: &Tick,
        open_edge_bps: f64,
        method: ExecMethod,
    ) -> Result<HedgedPosition, DispatchError> {
        let (perp_target, spot_target) = targets;
        let (perp_res, spot_res) = results;
        let perp_filled = perp_res.filled_size();
        let spot_filled = spot_res.filled_size();

        let perp_done = perp_filled >= perp_target - self.lot_eps(true);
        let spot_done = spot_filled >= spot_target - self.lot_eps(false);

        if perp_done && spot_done {
            let position = HedgedPosition::open(
                direction,
                notional_usd,
                perp_filled,
                spot_filled,
                avg_px(perp_res),
                avg_px(spot_res),
                open_edge_bps,
                method,
                tick.recv_ms,
            );
            info!(
                direction = %direction,
                perp_size = perp_filled,
                spot_size = spot_filled,
                method = ?method,
                "Hedge opened"
            );
            return Ok(position);
        }

        if perp_filled <= 0.0 && spot_filled <= 0.0 {
            return Err(DispatchError::NoFill);
        }

        // Unhedged exposure: flatten whatever filled, reverse IOC,
        // reduce-only on the perp side.
        warn!(
            direction = %direction,
            perp_filled,
            spot_filled,
            "One-sided fill, flattening exposure"
        );

        let mut flattened = (String::new(), 0.0);
        for (filled, is_perp) in [(perp_filled, true), (spot_filled, false)] {
            if filled <= 0.0 {
                continue;
            }
            let original_is_buy = if is_perp {
                direction.perp_is_buy()
            } else {
                direction.spot_is_buy()
            };
            self.close_single_leg(is_perp, original_is_buy, filled, tick)
                .await?;
            flattened = (self.coin(is_perp).to_string(), filled);
        }

        Err(DispatchError::PartialRecovered {
            coin: flattened.0,
            size: flattened.1,
        })
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Close a hedged position with the reverse legs; reduce-only on the
    /// perp. `prefer_ioc` skips the maker attempt (operator close-all and
    /// shutdown drain use aggressive IOC).
    pub async fn close(
        &self,
        position: &HedgedPosition,
        tick: &Tick,
        prefer_ioc: bool,
    ) -> Result<CloseFills, DispatchError> {
        let rev = position.direction.reverse();
        let plans = self.close_plans(rev, position.perp_size, position.spot_size, tick, prefer_ioc);

        let timeout = if prefer_ioc {
            0
        } else {
            self.cfg.alo_close_timeout_ms
        };
        let (mut perp_res, mut spot_res) = self.execute_pair(&plans.0, &plans.1, timeout).await;

        let mut method = if prefer_ioc {
            ExecMethod::Ioc
        } else {
            ExecMethod::Maker
        };
        for (res, plan) in [(&mut perp_res, &plans.0), (&mut spot_res, &plans.1)] {
            let remaining = plan.spec.size - res.filled_size();
            if remaining > self.lot_eps(plan.is_perp) {
                method = ExecMethod::Ioc;
                let ioc = if prefer_ioc {
                    self.ioc_retries(rev, plan.is_perp, remaining, tick, true)
                        .await
                } else {
                    self.ioc_with_escalation(rev, plan.is_perp, remaining, tick, true)
                        .await
                };
                *res = merge_fills(res, &ioc);
            }
        }

        let perp_done =
            perp_res.filled_size() >= position.perp_size - self.lot_eps(true);
        let spot_done =
            spot_res.filled_size() >= position.spot_size - self.lot_eps(false);

        self.rearm_deadman().await;

        if perp_done && spot_done {
            return Ok(CloseFills {
                perp_exit_px: avg_px(&perp_res),
                spot_exit_px: avg_px(&spot_res),
                method,
            });
        }

        if perp_res.filled_size() <= 0.0 && spot_res.filled_size() <= 0.0 {
            return Err(DispatchError::NoFill);
        }

        // One leg flattened, the other would not trade: the hedge is broken.
        let (is_perp, size, is_buy) = if perp_done {
            (false, position.spot_size, rev.spot_is_buy())
        } else {
            (true, position.perp_size, rev.perp_is_buy())
        };
        Err(DispatchError::BrokenHedge {
            coin: self.coin(is_perp).to_string(),
            size,
            is_buy,
        })
    }

    /// Flatten a single filled leg with an aggressive IOC in the reverse
    /// direction. Used only by partial-fill recovery and shutdown paths.
    pub async fn close_single_leg(
        &self,
        is_perp: bool,
        original_is_buy: bool,
        size: f64,
        tick: &Tick,
    ) -> Result<(), DispatchError> {
        let close_is_buy = !original_is_buy;
        let mut result = self
            .ioc_leg(is_perp, close_is_buy, size, tick, self.cfg.slippage_bps, is_perp)
            .await;

        if result.filled_size() < size - self.lot_eps(is_perp) {
            // Re-price once against the freshest book before widening
            let fresh = self.fresh_tick(tick);
            let retry = self
                .ioc_leg(
                    is_perp,
                    close_is_buy,
                    size - result.filled_size(),
                    &fresh,
                    self.cfg.slippage_bps,
                    is_perp,
                )
                .await;
            result = merge_fills(&result, &retry);
        }
        if result.filled_size() < size - self.lot_eps(is_perp) {
            let fresh = self.fresh_tick(tick);
            let retry = self
                .ioc_leg(
                    is_perp,
                    close_is_buy,
                    size - result.filled_size(),
                    &fresh,
                    self.cfg.slippage_bps + SLIPPAGE_ESCALATION_BPS,
                    is_perp,
                )
                .await;
            result = merge_fills(&result, &retry);
        }

        if result.is_filled() {
            info!(
                coin = self.coin(is_perp),
                size,
                is_buy = close_is_buy,
                "Single leg flattened"
            );
            Ok(())
        } else {
            Err(DispatchError::BrokenHedge {
                coin: self.coin(is_perp).to_string(),
                size,
                is_buy: close_is_buy,
            })
        }
    }

    // =========================================================================
    // Sizing and pricing
    // =========================================================================

    /// Leverage-parity sizing off the four-way mid, floored to the lot step.
    fn size_legs(&self, notional_usd: f64, tick: &Tick) -> Result<(f64, f64), DispatchError> {
        let mid = (tick.perp_bid + tick.perp_ask + tick.spot_bid + tick.spot_ask) / 4.0;
        if mid <= 0.0 {
            return Err(DispatchError::Exchange(ExchangeError::InvalidResponse(
                "non-positive reference mid".to_string(),
            )));
        }

        let raw = notional_usd * self.cfg.leverage / mid;
        let perp_size = quantize_down(raw, self.cfg.meta.perp_sz_decimals);
        let spot_size = quantize_down(raw, self.cfg.meta.spot_sz_decimals);

        let leg_notional = perp_size.min(spot_size) * mid;
        if leg_notional < self.cfg.min_order_notional_usd {
            return Err(DispatchError::BelowMinNotional {
                notional: leg_notional,
                min: self.cfg.min_order_notional_usd,
            });
        }
        Ok((perp_size, spot_size))
    }

    fn open_plans(
        &self,
        direction: Direction,
        perp_size: f64,
        spot_size: f64,
        tick: &Tick,
        prefer_ioc: bool,
    ) -> (LegPlan, LegPlan) {
        if prefer_ioc {
            (
                self.ioc_plan(direction, true, perp_size, tick, self.cfg.slippage_bps, false),
                self.ioc_plan(direction, false, spot_size, tick, self.cfg.slippage_bps, false),
            )
        } else {
            (
                self.maker_plan(direction, true, perp_size, tick, false),
                self.maker_plan(direction, false, spot_size, tick, false),
            )
        }
    }

    fn close_plans(
        &self,
        rev: Direction,
        perp_size: f64,
        spot_size: f64,
        tick: &Tick,
        prefer_ioc: bool,
    ) -> (LegPlan, LegPlan) {
        if prefer_ioc {
            (
                self.ioc_plan(rev, true, perp_size, tick, self.cfg.slippage_bps, true),
                self.ioc_plan(rev, false, spot_size, tick, self.cfg.slippage_bps, false),
            )
        } else {
            (
                self.maker_plan(rev, true, perp_size, tick, true),
                self.maker_plan(rev, false, spot_size, tick, false),
            )
        }
    }

    /// Maker pricing joins the opposite touch: sells at the bid, buys at the
    /// ask, post-only semantics left to the venue.
    fn maker_plan(
        &self,
        direction: Direction,
        is_perp: bool,
        size: f64,
        tick: &Tick,
        reduce_only: bool,
    ) -> LegPlan {
        let is_buy = if is_perp {
            direction.perp_is_buy()
        } else {
            direction.spot_is_buy()
        };
        let px_decimals = self.px_decimals(is_perp);
        let raw_px = match (is_perp, is_buy) {
            (true, false) => tick.perp_bid,
            (true, true) => tick.perp_ask,
            (false, true) => tick.spot_ask,
            (false, false) => tick.spot_bid,
        };
        // Round away from the market so the quantized price stays passive
        let limit_px = if is_buy {
            quantize_down(raw_px, px_decimals)
        } else {
            quantize_up(raw_px, px_decimals)
        };

        let mut spec = OrderSpec::new(self.coin(is_perp), is_buy, size, limit_px, Tif::Alo);
        if reduce_only && is_perp {
            spec = spec.reduce_only();
        }
        LegPlan { spec, is_perp }
    }

    fn ioc_plan(
        &self,
        direction: Direction,
        is_perp: bool,
        size: f64,
        tick: &Tick,
        slippage_bps: f64,
        reduce_only: bool,
    ) -> LegPlan {
        let is_buy = if is_perp {
            direction.perp_is_buy()
        } else {
            direction.spot_is_buy()
        };
        let plan = self.ioc_leg_spec(is_perp, is_buy, size, tick, slippage_bps, reduce_only);
        LegPlan {
            spec: plan,
            is_perp,
        }
    }

    /// Aggressive pricing crosses the touch by `slippage_bps`.
    fn ioc_leg_spec(
        &self,
        is_perp: bool,
        is_buy: bool,
        size: f64,
        tick: &Tick,
        slippage_bps: f64,
        reduce_only: bool,
    ) -> OrderSpec {
        let slip = slippage_bps / 1e4;
        let px_decimals = self.px_decimals(is_perp);
        let raw_px = match (is_perp, is_buy) {
            (true, false) => tick.perp_bid * (1.0 - slip),
            (true, true) => tick.perp_ask * (1.0 + slip),
            (false, true) => tick.spot_ask * (1.0 + slip),
            (false, false) => tick.spot_bid * (1.0 - slip),
        };
        let limit_px = if is_buy {
            quantize_up(raw_px, px_decimals)
        } else {
            quantize_down(raw_px, px_decimals)
        };

        let mut spec = OrderSpec::new(self.coin(is_perp), is_buy, size, limit_px, Tif::Ioc);
        if reduce_only && is_perp {
            spec = spec.reduce_only();
        }
        spec
    }

    // =========================================================================
    // Execution primitives
    // =========================================================================

    /// Submit both legs concurrently and join their results.
    async fn execute_pair(
        &self,
        perp: &LegPlan,
        spot: &LegPlan,
        wait_ms: u64,
    ) -> (LegResult, LegResult) {
        tokio::join!(
            self.execute_leg(perp, wait_ms),
            self.execute_leg(spot, wait_ms)
        )
    }

    /// Place one leg and classify its terminal state. A resting maker order
    /// is polled until filled or the timeout (measured from the ack), then
    /// cancelled; a post-fill race on the cancel is re-checked once.
    async fn execute_leg(&self, plan: &LegPlan, wait_ms: u64) -> LegResult {
        let acks = match self.client.place_orders(vec![plan.spec.clone()]).await {
            Ok(acks) => acks,
            Err(e) => {
                warn!(coin = %plan.spec.coin, error = %e, "Leg placement failed, resolving via account state");
                return self.resolve_unknown(plan).await;
            }
        };

        match acks.into_iter().next() {
            Some(OrderAck::Filled {
                total_size, avg_px, ..
            }) => LegResult::Filled {
                size_filled: total_size,
                avg_px,
            },
            Some(OrderAck::Rejected { reason }) => LegResult::Rejected { reason },
            Some(OrderAck::Resting { oid }) => self.await_fill(plan, oid, wait_ms).await,
            Some(OrderAck::Malformed) | None => self.resolve_unknown(plan).await,
        }
    }

    async fn await_fill(&self, plan: &LegPlan, oid: u64, wait_ms: u64) -> LegResult {
        let deadline = Instant::now() + Duration::from_millis(wait_ms);
        let coin = &plan.spec.coin;

        loop {
            match self.client.order_fill(coin, oid).await {
                Ok(fill) => {
                    if fill.filled_size >= plan.spec.size - self.lot_eps(plan.is_perp) {
                        return LegResult::Filled {
                            size_filled: fill.filled_size,
                            avg_px: fill.avg_px.unwrap_or(plan.spec.limit_px),
                        };
                    }
                    if !fill.open {
                        return if fill.filled_size > 0.0 {
                            LegResult::Filled {
                                size_filled: fill.filled_size,
                                avg_px: fill.avg_px.unwrap_or(plan.spec.limit_px),
                            }
                        } else {
                            LegResult::Cancelled
                        };
                    }
                }
                Err(e) => {
                    warn!(coin = %coin, oid, error = %e, "Fill poll failed");
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.fill_poll_ms)).await;
        }

        if let Err(e) = self.client.cancel_order(coin, oid).await {
            warn!(coin = %coin, oid, error = %e, "Cancel after timeout failed");
        }

        // The order may have filled in the race between timeout and cancel
        match self.client.order_fill(coin, oid).await {
            Ok(fill) if fill.filled_size > 0.0 => LegResult::Filled {
                size_filled: fill.filled_size,
                avg_px: fill.avg_px.unwrap_or(plan.spec.limit_px),
            },
            _ => LegResult::Cancelled,
        }
    }

    /// Full aggressive ladder: one attempt at the configured slippage off
    /// the submission tick, then the re-price/escalation retries. A final
    /// miss becomes NoFill or recovery upstream.
    async fn ioc_with_escalation(
        &self,
        direction: Direction,
        is_perp: bool,
        size: f64,
        tick: &Tick,
        reduce_only: bool,
    ) -> LegResult {
        let first = self
            .ioc_attempt(direction, is_perp, size, tick, self.cfg.slippage_bps, reduce_only)
            .await;
        if first.filled_size() >= size - self.lot_eps(is_perp) {
            return first;
        }

        let remaining = size - first.filled_size();
        let retried = self
            .ioc_retries(direction, is_perp, remaining, tick, reduce_only)
            .await;
        merge_fills(&first, &retried)
    }

    /// Retries after a missed IOC. The mid may have moved between pricing
    /// and submission and left the limit passive, so the first retry
    /// re-prices once against the freshest tick at the original slippage;
    /// only the second widens by 10 bps.
    async fn ioc_retries(
        &self,
        direction: Direction,
        is_perp: bool,
        size: f64,
        submit_tick: &Tick,
        reduce_only: bool,
    ) -> LegResult {
        let fresh = self.fresh_tick(submit_tick);
        let repriced = self
            .ioc_attempt(direction, is_perp, size, &fresh, self.cfg.slippage_bps, reduce_only)
            .await;
        if repriced.filled_size() >= size - self.lot_eps(is_perp) {
            return repriced;
        }

        let remaining = size - repriced.filled_size();
        let fresh = self.fresh_tick(submit_tick);
        let escalated = self
            .ioc_attempt(
                direction,
                is_perp,
                remaining,
                &fresh,
                self.cfg.slippage_bps + SLIPPAGE_ESCALATION_BPS,
                reduce_only,
            )
            .await;
        merge_fills(&repriced, &escalated)
    }

    async fn ioc_attempt(
        &self,
        direction: Direction,
        is_perp: bool,
        size: f64,
        tick: &Tick,
        slippage_bps: f64,
        reduce_only: bool,
    ) -> LegResult {
        let plan = self.ioc_plan(direction, is_perp, size, tick, slippage_bps, reduce_only);
        self.execute_leg(&plan, 0).await
    }

    async fn ioc_leg(
        &self,
        is_perp: bool,
        is_buy: bool,
        size: f64,
        tick: &Tick,
        slippage_bps: f64,
        reduce_only: bool,
    ) -> LegResult {
        let spec = self.ioc_leg_spec(is_perp, is_buy, size, tick, slippage_bps, reduce_only);
        let plan = LegPlan { spec, is_perp };
        self.execute_leg(&plan, 0).await
    }

    /// Resolve an ambiguous acknowledgement by querying account state. A perp
    /// leg is confirmed against the position book; a spot buy against the
    /// base balance. Inconclusive cases resolve to Cancelled with a warning.
    async fn resolve_unknown(&self, plan: &LegPlan) -> LegResult {
        let spec = &plan.spec;
        if plan.is_perp {
            match self.client.user_state().await {
                Ok(state) => {
                    let held = state
                        .positions
                        .iter()
                        .find(|p| p.coin == spec.coin)
                        .map(|p| p.size)
                        .unwrap_or(0.0);
                    let matches_side = if spec.is_buy { held > 0.0 } else { held < 0.0 };
                    if matches_side && held.abs() >= spec.size - self.lot_eps(true) {
                        return LegResult::Filled {
                            size_filled: spec.size,
                            avg_px: spec.limit_px,
                        };
                    }
                }
                Err(e) => warn!(error = %e, "Position query for unknown leg failed"),
            }
        } else if spec.is_buy {
            if let Ok(balances) = self.client.spot_balances().await {
                let base = spec.coin.clone();
                let held = balances
                    .iter()
                    .find(|b| b.coin == base)
                    .map(|b| b.available())
                    .unwrap_or(0.0);
                if held >= spec.size {
                    return LegResult::Filled {
                        size_filled: spec.size,
                        avg_px: spec.limit_px,
                    };
                }
            }
        }
        warn!(coin = %spec.coin, "Unknown leg resolved as not filled");
        LegResult::Cancelled
    }

    /// Re-arm the venue-side cancel-all so resting orders die with the
    /// process. Failures are logged, never fatal.
    async fn rearm_deadman(&self) {
        if self.cfg.deadman_ms == 0 {
            return;
        }
        let at = now_ms() + self.cfg.deadman_ms;
        if let Err(e) = self.client.schedule_cancel_all(at).await {
            warn!(error = %e, "Deadman re-arm failed");
        }
    }

    fn coin(&self, is_perp: bool) -> &str {
        if is_perp {
            &self.cfg.perp_coin
        } else {
            &self.cfg.spot_coin
        }
    }

    fn px_decimals(&self, is_perp: bool) -> u32 {
        if is_perp {
            self.cfg.meta.perp_px_decimals
        } else {
            self.cfg.meta.spot_px_decimals
        }
    }

    /// Half a lot step: the tolerance for "fully filled"
    fn lot_eps(&self, is_perp: bool) -> f64 {
        if is_perp {
            self.cfg.meta.perp_lot_step() / 2.0
        } else {
            self.cfg.meta.spot_lot_step() / 2.0
        }
    }
}

fn avg_px(result: &LegResult) -> f64 {
    match result {
        LegResult::Filled { avg_px, .. } => *avg_px,
        _ => 0.0,
    }
}

/// Combine fills from a first attempt and its escalation
fn merge_fills(first: &LegResult, second: &LegResult) -> LegResult {
    let total = first.filled_size() + second.filled_size();
    if total <= 0.0 {
        return second.clone();
    }
    let px = |r: &LegResult| match r {
        LegResult::Filled {
            size_filled,
            avg_px,
        } => size_filled * avg_px,
        _ => 0.0,
    };
    LegResult::Filled {
        size_filled: total,
        avg_px: (px(first) + px(second)) / total,
    }
}

fn quantize_down(value: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    ((value * f) + 1e-9).floor() / f
}

fn quantize_up(value: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    ((value * f) - 1e-9).ceil() / f
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::paper::{AloBehavior, PaperClient};
    use crate::adapters::types::Tif;

    fn tick() -> Tick {
        // mid_ref = 50.0
        Tick {
            perp_bid: 50.0,
            perp_ask: 50.01,
            spot_bid: 49.985,
            spot_ask: 50.005,
            recv_ms: 1_000,
            send_ms: 990,
        }
    }

    fn test_config() -> DispatcherConfig {
        let mut cfg = DispatcherConfig::new("HYPE", "@107");
        cfg.leverage = 3.0;
        cfg.alo_open_timeout_ms = 50;
        cfg.alo_close_timeout_ms = 50;
        cfg.fill_poll_ms = 5;
        cfg
    }

    /// Dispatcher with an empty tick watch: retries fall back to the
    /// submission tick.
    fn dispatcher(client: Arc<PaperClient>) -> OrderDispatcher<PaperClient> {
        let (_watch_tx, watch_rx) = watch::channel(None);
        OrderDispatcher::new(client, test_config(), watch_rx)
    }

    fn dispatcher_with_fresh_tick(
        client: Arc<PaperClient>,
        fresh: Tick,
    ) -> OrderDispatcher<PaperClient> {
        // The receiver keeps serving the last value after the sender drops
        let (_watch_tx, watch_rx) = watch::channel(Some(fresh));
        OrderDispatcher::new(client, test_config(), watch_rx)
    }

    #[test]
    fn test_quantize_down_handles_binary_representation() {
        assert_eq!(quantize_down(0.72, 2), 0.72);
        assert_eq!(quantize_down(0.729, 2), 0.72);
        assert_eq!(quantize_up(50.005, 3), 50.005);
    }

    #[tokio::test]
    async fn test_sizing_leverage_parity() {
        // Scenario: notional 12 USD at leverage 3, mid 50 -> 0.72 both legs
        let client = Arc::new(PaperClient::new());
        let d = dispatcher(client.clone());

        let position = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap();

        assert!((position.perp_size - 0.72).abs() < 1e-9);
        assert!((position.spot_size - 0.72).abs() < 1e-9);
        assert!(position.is_delta_neutral(0.01));
    }

    #[tokio::test]
    async fn test_perp_to_spot_sides_and_maker_prices() {
        // perp->spot opens SHORT perp + BUY spot; maker joins the opposite
        // touch: perp sell at the bid, spot buy at the ask.
        let client = Arc::new(PaperClient::new());
        let d = dispatcher(client.clone());

        d.open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap();

        let placed = client.placed_orders().await;
        let perp = placed.iter().find(|o| o.coin == "HYPE").unwrap();
        let spot = placed.iter().find(|o| o.coin == "@107").unwrap();

        assert!(!perp.is_buy, "perp leg must be a sell (SHORT)");
        assert!(spot.is_buy, "spot leg must be a buy");
        assert_eq!(perp.tif, Tif::Alo);
        assert_eq!(perp.limit_px, 50.0);
        assert_eq!(spot.limit_px, 50.005);
        assert!(!perp.reduce_only, "open-side perp never reduce-only");
    }

    #[tokio::test]
    async fn test_spot_to_perp_sides() {
        // The historically miscoded invariant: spot->perp must issue a perp
        // BUY (long) and a spot SELL.
        let client = Arc::new(PaperClient::new());
        let d = dispatcher(client.clone());

        d.open(Direction::SpotToPerp, 12.0, &tick(), false, 18.0)
            .await
            .unwrap();

        let placed = client.placed_orders().await;
        let perp = placed.iter().find(|o| o.coin == "HYPE").unwrap();
        let spot = placed.iter().find(|o| o.coin == "@107").unwrap();
        assert!(perp.is_buy, "perp leg must be a buy (LONG)");
        assert!(!spot.is_buy, "spot leg must be a sell");
        assert_eq!(perp.limit_px, 50.01, "maker buy joins the ask");
        assert_eq!(spot.limit_px, 49.985, "maker sell joins the bid");
    }

    #[tokio::test]
    async fn test_below_min_notional_is_refused() {
        let client = Arc::new(PaperClient::new());
        let d = dispatcher(client.clone());

        let err = d
            .open(Direction::PerpToSpot, 1.0, &tick(), false, 20.0)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BelowMinNotional { .. }));
        assert!(client.placed_orders().await.is_empty(), "no orders placed");
    }

    #[tokio::test]
    async fn test_alo_reject_falls_back_to_ioc() {
        // Scenario 2: perp maker fills, spot maker is rejected post-only;
        // the spot leg is re-issued as an aggressive IOC and fills.
        let client = Arc::new(PaperClient::new());
        client.reject_alo_for("@107").await;
        let d = dispatcher(client.clone());

        let position = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap();
        assert!((position.spot_size - 0.72).abs() < 1e-9);
        assert_eq!(position.open_method, ExecMethod::Ioc);

        let placed = client.placed_orders().await;
        let spot_ioc: Vec<_> = placed
            .iter()
            .filter(|o| o.coin == "@107" && o.tif == Tif::Ioc)
            .collect();
        assert_eq!(spot_ioc.len(), 1);
        // Aggressive buy crosses the ask by the slippage allowance
        assert!(spot_ioc[0].limit_px > 50.005);
    }

    #[tokio::test]
    async fn test_alo_timeout_cancels_and_falls_back() {
        let client = Arc::new(PaperClient::new());
        client.set_alo_behavior(AloBehavior::NeverFill).await;
        let d = dispatcher(client.clone());

        let position = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap();
        assert!((position.perp_size - 0.72).abs() < 1e-9);

        // Both resting makers were cancelled before the IOC retries
        assert_eq!(client.cancelled_orders().await.len(), 2);
        let iocs = client
            .placed_orders()
            .await
            .into_iter()
            .filter(|o| o.tif == Tif::Ioc)
            .count();
        assert_eq!(iocs, 2);
    }

    #[tokio::test]
    async fn test_one_sided_fill_is_flattened() {
        // Scenario 3: perp fills, spot fails repeatedly; the filled perp leg
        // is reversed with reduce-only IOC and the dispatch reports
        // PartialRecovered with no position.
        let client = Arc::new(PaperClient::new());
        client.reject_orders_for("@107").await;
        let d = dispatcher(client.clone());

        let err = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap_err();
        match err {
            DispatchError::PartialRecovered { coin, size } => {
                assert_eq!(coin, "HYPE");
                assert!((size - 0.72).abs() < 1e-9);
            }
            other => panic!("expected PartialRecovered, got {other}"),
        }

        let placed = client.placed_orders().await;
        let flatten = placed
            .iter()
            .find(|o| o.coin == "HYPE" && o.is_buy && o.tif == Tif::Ioc)
            .expect("reverse perp IOC");
        assert!(flatten.reduce_only, "flatten must be reduce-only on perp");
    }

    #[tokio::test]
    async fn test_neither_leg_filled_is_no_fill() {
        let client = Arc::new(PaperClient::new());
        client.reject_orders_for("@107").await;
        client.reject_orders_for("HYPE").await;
        let d = dispatcher(client.clone());

        let err = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoFill), "nothing filled at all");
    }

    #[tokio::test]
    async fn test_broken_hedge_when_flatten_rejected() {
        // Flatten a short perp leg while the venue rejects everything on the
        // perp book: the exposure cannot be shed.
        let client = Arc::new(PaperClient::new());
        let d = dispatcher(client.clone());

        client.reject_orders_for("HYPE").await;
        let err = d
            .close_single_leg(true, false, 0.72, &tick())
            .await
            .unwrap_err();
        match err {
            DispatchError::BrokenHedge { coin, size, is_buy } => {
                assert_eq!(coin, "HYPE");
                assert!((size - 0.72).abs() < 1e-9);
                assert!(is_buy, "closing a short buys back");
            }
            other => panic!("expected BrokenHedge, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_ioc_ladder_reprices_then_escalates() {
        let client = Arc::new(PaperClient::new());
        client.reject_orders_for("@107").await;
        let d = dispatcher(client.clone());

        let _ = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await;

        let spot_iocs: Vec<_> = client
            .placed_orders()
            .await
            .into_iter()
            .filter(|o| o.coin == "@107" && o.tif == Tif::Ioc)
            .collect();
        assert_eq!(spot_iocs.len(), 3, "attempt, re-price, escalation");
        // With no fresher tick the re-price falls back to the same book and
        // keeps the original slippage; only the last attempt widens.
        assert_eq!(spot_iocs[1].limit_px, spot_iocs[0].limit_px);
        assert!(
            spot_iocs[2].limit_px > spot_iocs[1].limit_px,
            "escalated buy must cross further"
        );
    }

    #[tokio::test]
    async fn test_ioc_reprice_uses_freshest_tick() {
        // The mid moves between pricing and submission: the retry must be
        // priced off the freshest book at the original slippage, and the
        // escalation off that same fresh book.
        let client = Arc::new(PaperClient::new());
        client.reject_orders_for("@107").await;

        let mut fresh = tick();
        fresh.spot_bid = 50.085;
        fresh.spot_ask = 50.105;
        let d = dispatcher_with_fresh_tick(client.clone(), fresh);

        let _ = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await;

        let spot_iocs: Vec<_> = client
            .placed_orders()
            .await
            .into_iter()
            .filter(|o| o.coin == "@107" && o.tif == Tif::Ioc)
            .collect();
        assert_eq!(spot_iocs.len(), 3);

        let base_slip = 10.0 / 1e4;
        let wide_slip = 20.0 / 1e4;
        let first = quantize_up(50.005 * (1.0 + base_slip), 3);
        let repriced = quantize_up(50.105 * (1.0 + base_slip), 3);
        let escalated = quantize_up(50.105 * (1.0 + wide_slip), 3);

        assert!((spot_iocs[0].limit_px - first).abs() < 1e-9, "submission tick");
        assert!((spot_iocs[1].limit_px - repriced).abs() < 1e-9, "fresh tick, base slippage");
        assert!((spot_iocs[2].limit_px - escalated).abs() < 1e-9, "fresh tick, widened");
        assert!(spot_iocs[1].limit_px > spot_iocs[0].limit_px);
    }

    #[tokio::test]
    async fn test_deadman_rearmed_after_dispatch() {
        let client = Arc::new(PaperClient::new());
        let d = dispatcher(client.clone());

        d.open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap();
        assert_eq!(client.scheduled_cancels().await.len(), 1);

        let position = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap();
        assert_eq!(
            client.scheduled_cancels().await.len(),
            2,
            "every dispatch re-arms"
        );

        d.close(&position, &tick(), false).await.unwrap();
        assert_eq!(client.scheduled_cancels().await.len(), 3);
    }

    #[tokio::test]
    async fn test_close_uses_reverse_sides_and_reduce_only_perp() {
        let client = Arc::new(PaperClient::new());
        let d = dispatcher(client.clone());

        let position = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap();
        let before = client.placed_orders().await.len();

        let fills = d.close(&position, &tick(), false).await.unwrap();
        assert_eq!(fills.method, ExecMethod::Maker);

        let placed = client.placed_orders().await;
        let close_orders = &placed[before..];
        let perp = close_orders.iter().find(|o| o.coin == "HYPE").unwrap();
        let spot = close_orders.iter().find(|o| o.coin == "@107").unwrap();

        assert!(perp.is_buy, "closing the short perp buys");
        assert!(perp.reduce_only, "close-side perp is reduce-only");
        assert!(!spot.is_buy, "closing the long spot sells");
        assert!(!spot.reduce_only, "spot never reduce-only");
    }

    #[tokio::test]
    async fn test_close_maker_timeout_falls_back_to_ioc() {
        // Scenario 4's close path: the maker close times out, the IOC
        // fallback completes it.
        let client = Arc::new(PaperClient::new());
        let d = dispatcher(client.clone());

        let position = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap();

        client.set_alo_behavior(AloBehavior::NeverFill).await;
        let fills = d.close(&position, &tick(), false).await.unwrap();
        assert_eq!(fills.method, ExecMethod::Ioc);
    }

    #[tokio::test]
    async fn test_close_broken_when_one_leg_wont_flatten() {
        let client = Arc::new(PaperClient::new());
        let d = dispatcher(client.clone());

        let position = d
            .open(Direction::PerpToSpot, 12.0, &tick(), false, 20.0)
            .await
            .unwrap();

        client.reject_orders_for("@107").await;
        let err = d.close(&position, &tick(), false).await.unwrap_err();
        match err {
            DispatchError::BrokenHedge { coin, .. } => assert_eq!(coin, "@107"),
            other => panic!("expected BrokenHedge, got {other}"),
        }
    }
}
