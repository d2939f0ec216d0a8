//! Capital rebalancer
//!
//! Keeps idle capital split roughly a third each across perp margin USDC,
//! spot USDC and the spot base asset, so neither side of the hedge starves.
//! Runs as a cooperative task on a 30 s cadence and on the operator's
//! `rebalance` command. Only the spot leg is traded here; moving USDC
//! between the perp and spot wallets is the provisioning collaborator's job
//! and is surfaced as a log hint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::adapters::errors::ExchangeResult;
use crate::adapters::traits::ExchangeClient;
use crate::adapters::types::{OrderAck, OrderSpec, Tif};
use crate::core::feed::Tick;

/// Rebalance cadence
pub const REBALANCE_INTERVAL_SECS: u64 = 30;
/// Allowed drift around the per-bucket target before acting
const DRIFT_TOLERANCE: f64 = 0.20;
/// Price cross allowance on the rebalancing IOC
const REBALANCE_SLIPPAGE_BPS: f64 = 10.0;

/// A spot trade proposed (and executed) to restore the split
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebalanceAction {
    pub is_buy: bool,
    pub size: f64,
    pub notional_usd: f64,
}

pub struct CapitalRebalancer<C: ExchangeClient> {
    client: Arc<C>,
    base_coin: String,
    quote_coin: String,
    /// Venue identifier of the spot book ("@index")
    spot_coin: String,
    spot_sz_decimals: u32,
    spot_px_decimals: u32,
    min_trade_usd: f64,
}

impl<C: ExchangeClient> CapitalRebalancer<C> {
    pub fn new(
        client: Arc<C>,
        base_coin: impl Into<String>,
        quote_coin: impl Into<String>,
        spot_coin: impl Into<String>,
        min_trade_usd: f64,
    ) -> Self {
        Self {
            client,
            base_coin: base_coin.into(),
            quote_coin: quote_coin.into(),
            spot_coin: spot_coin.into(),
            spot_sz_decimals: 2,
            spot_px_decimals: 3,
            min_trade_usd,
        }
    }

    /// Inspect balances and trade the spot leg back toward a third of total
    /// capital. Returns the action taken, if any.
    pub async fn run_once(&self, tick: &Tick) -> ExchangeResult<Option<RebalanceAction>> {
        let mid = (tick.spot_bid + tick.spot_ask) / 2.0;
        if mid <= 0.0 {
            return Ok(None);
        }

        let user_state = self.client.user_state().await?;
        let balances = self.client.spot_balances().await?;
        let available = |coin: &str| {
            balances
                .iter()
                .find(|b| b.coin == coin)
                .map(|b| b.available())
                .unwrap_or(0.0)
        };

        let perp_usdc = user_state.withdrawable_usd;
        let spot_usdc = available(&self.quote_coin);
        let base_qty = available(&self.base_coin);
        let base_usd = base_qty * mid;

        let total = perp_usdc + spot_usdc + base_usd;
        if total <= 0.0 {
            return Ok(None);
        }
        let target = total / 3.0;

        if perp_usdc < target * (1.0 - DRIFT_TOLERANCE) {
            info!(
                perp_usdc,
                target, "Perp margin below target; top-up needs a wallet transfer"
            );
        }

        let action = if base_usd < target * (1.0 - DRIFT_TOLERANCE) {
            // Base bucket short: buy with spot USDC, capped by what is there
            let deficit_usd = (target - base_usd).min(spot_usdc);
            if deficit_usd < self.min_trade_usd {
                return Ok(None);
            }
            let size = quantize(deficit_usd / mid, self.spot_sz_decimals);
            let px = quantize(
                tick.spot_ask * (1.0 + REBALANCE_SLIPPAGE_BPS / 1e4),
                self.spot_px_decimals,
            );
            Some((true, size, px))
        } else if base_usd > target * (1.0 + DRIFT_TOLERANCE) {
            let excess_usd = base_usd - target;
            if excess_usd < self.min_trade_usd {
                return Ok(None);
            }
            let size = quantize(excess_usd / mid, self.spot_sz_decimals);
            let px = quantize(
                tick.spot_bid * (1.0 - REBALANCE_SLIPPAGE_BPS / 1e4),
                self.spot_px_decimals,
            );
            Some((false, size, px))
        } else {
            None
        };

        let Some((is_buy, size, px)) = action else {
            return Ok(None);
        };
        if size <= 0.0 {
            return Ok(None);
        }

        let spec = OrderSpec::new(self.spot_coin.clone(), is_buy, size, px, Tif::Ioc);
        let acks = self.client.place_orders(vec![spec]).await?;
        let filled = matches!(acks.first(), Some(OrderAck::Filled { .. }));

        let action = RebalanceAction {
            is_buy,
            size,
            notional_usd: size * mid,
        };
        if filled {
            info!(
                is_buy,
                size,
                notional_usd = action.notional_usd,
                "Rebalanced spot bucket"
            );
            Ok(Some(action))
        } else {
            warn!(is_buy, size, "Rebalance order did not fill");
            Ok(None)
        }
    }
}

fn quantize(value: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    ((value * f) + 1e-9).floor() / f
}

/// 30 s cooperative rebalancing task. Uses the freshest tick for pricing and
/// skips cycles with no market data yet.
pub async fn rebalance_task<C: ExchangeClient>(
    rebalancer: Arc<CapitalRebalancer<C>>,
    mut tick_rx: broadcast::Receiver<Tick>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(REBALANCE_INTERVAL_SECS));
    let mut last_tick: Option<Tick> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Rebalancer shutting down");
                break;
            }
            tick = tick_rx.recv() => {
                match tick {
                    Ok(t) => last_tick = Some(t),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = interval.tick() => {
                let Some(tick) = last_tick else {
                    continue;
                };
                if let Err(e) = rebalancer.run_once(&tick).await {
                    warn!(error = %e, "Rebalance cycle failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::paper::PaperClient;
    use crate::adapters::types::{SpotBalance, UserState};

    fn tick() -> Tick {
        Tick {
            perp_bid: 50.0,
            perp_ask: 50.01,
            spot_bid: 49.985,
            spot_ask: 50.005,
            recv_ms: 0,
            send_ms: 0,
        }
    }

    async fn rebalancer_with(
        perp_usdc: f64,
        spot_usdc: f64,
        base_qty: f64,
    ) -> CapitalRebalancer<PaperClient> {
        let client = Arc::new(PaperClient::new());
        client
            .set_user_state(UserState {
                withdrawable_usd: perp_usdc,
                positions: Vec::new(),
            })
            .await;
        client
            .set_spot_balances(vec![
                SpotBalance {
                    coin: "USDC".to_string(),
                    total: spot_usdc,
                    hold: 0.0,
                },
                SpotBalance {
                    coin: "HYPE".to_string(),
                    total: base_qty,
                    hold: 0.0,
                },
            ])
            .await;
        CapitalRebalancer::new(client, "HYPE", "USDC", "@107", 10.0)
    }

    #[tokio::test]
    async fn test_balanced_buckets_do_nothing() {
        // ~100 USD in each bucket at mid ~50
        let r = rebalancer_with(100.0, 100.0, 2.0).await;
        let action = r.run_once(&tick()).await.unwrap();
        assert!(action.is_none());
    }

    #[tokio::test]
    async fn test_base_deficit_buys_spot() {
        // total 300, target 100, base holds only 25 USD worth
        let r = rebalancer_with(125.0, 150.0, 0.5).await;
        let action = r.run_once(&tick()).await.unwrap().expect("should act");
        assert!(action.is_buy);
        assert!(action.notional_usd > 10.0);

        let placed = r.client.placed_orders().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].coin, "@107");
        assert_eq!(placed[0].tif, Tif::Ioc);
        assert!(placed[0].limit_px > 50.005, "buy crosses the ask");
    }

    #[tokio::test]
    async fn test_base_excess_sells_spot() {
        // base holds 250 of 300 USD total
        let r = rebalancer_with(25.0, 25.0, 5.0).await;
        let action = r.run_once(&tick()).await.unwrap().expect("should act");
        assert!(!action.is_buy);

        let placed = r.client.placed_orders().await;
        assert!(!placed[0].is_buy);
        assert!(placed[0].limit_px < 49.985, "sell crosses the bid");
    }

    #[tokio::test]
    async fn test_dust_deficit_is_ignored() {
        // Just inside tolerance and below min trade size
        let r = rebalancer_with(100.0, 105.0, 1.9).await;
        let action = r.run_once(&tick()).await.unwrap();
        assert!(action.is_none());
    }

    #[tokio::test]
    async fn test_empty_account_does_nothing() {
        let r = rebalancer_with(0.0, 0.0, 0.0).await;
        assert!(r.run_once(&tick()).await.unwrap().is_none());
    }
}
