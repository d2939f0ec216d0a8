//! Capital guard: balance and margin admission before every dispatch
//!
//! Balances are queried on demand and cached for at most two seconds, never
//! longer: the window between check and dispatch is covered by the margin
//! (20%) and spot (5%) buffers rather than by freshness.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::errors::ExchangeResult;
use crate::adapters::traits::ExchangeClient;
use crate::core::edge::Direction;

/// Cache TTL for balance snapshots
pub const BALANCE_TTL_MS: u64 = 2_000;

/// Margin-side head-room multiplier
pub const PERP_MARGIN_BUFFER: f64 = 1.2;
/// Spot-side head-room multiplier
pub const SPOT_BUFFER: f64 = 1.05;

/// Point-in-time account balances relevant to admission
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Free USDC collateral in the perp margin account
    pub perp_free_usdc: f64,
    /// USDC in the spot wallet
    pub spot_usdc: f64,
    /// Base-asset quantity in the spot wallet
    pub spot_base: f64,
    pub taken_at_ms: u64,
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admissible,
    Refused { reason: String },
}

impl Admission {
    pub fn is_admissible(&self) -> bool {
        matches!(self, Admission::Admissible)
    }
}

pub struct CapitalGuard<C: ExchangeClient> {
    client: Arc<C>,
    base_coin: String,
    quote_coin: String,
    cache: Option<BalanceSnapshot>,
}

impl<C: ExchangeClient> CapitalGuard<C> {
    pub fn new(client: Arc<C>, base_coin: impl Into<String>, quote_coin: impl Into<String>) -> Self {
        Self {
            client,
            base_coin: base_coin.into(),
            quote_coin: quote_coin.into(),
            cache: None,
        }
    }

    /// Fetch balances, reusing a snapshot younger than `BALANCE_TTL_MS`.
    pub async fn balances(&mut self, now_ms: u64) -> ExchangeResult<BalanceSnapshot> {
        if let Some(cached) = self.cache {
            if now_ms.saturating_sub(cached.taken_at_ms) < BALANCE_TTL_MS {
                return Ok(cached);
            }
        }

        let user_state = self.client.user_state().await?;
        let spot = self.client.spot_balances().await?;

        let find = |coin: &str| {
            spot.iter()
                .find(|b| b.coin == coin)
                .map(|b| b.available())
                .unwrap_or(0.0)
        };

        let snapshot = BalanceSnapshot {
            perp_free_usdc: user_state.withdrawable_usd,
            spot_usdc: find(&self.quote_coin),
            spot_base: find(&self.base_coin),
            taken_at_ms: now_ms,
        };
        self.cache = Some(snapshot);
        debug!(
            perp_free = snapshot.perp_free_usdc,
            spot_usdc = snapshot.spot_usdc,
            spot_base = snapshot.spot_base,
            "Balance snapshot refreshed"
        );
        Ok(snapshot)
    }

    /// Rule a dispatch admissible or not for notional `N` at leverage `L`.
    ///
    /// Both directions need perp margin head-room; the spot-side requirement
    /// depends on which asset the spot leg consumes.
    pub async fn admit(
        &mut self,
        direction: Direction,
        notional_usd: f64,
        leverage: f64,
        mid: f64,
        now_ms: u64,
    ) -> ExchangeResult<Admission> {
        let balances = self.balances(now_ms).await?;
        let leverage = leverage.max(1.0);

        let required_margin = (notional_usd / leverage) * PERP_MARGIN_BUFFER;
        if balances.perp_free_usdc < required_margin {
            let reason = format!(
                "perp margin {:.2} USDC below required {:.2}",
                balances.perp_free_usdc, required_margin
            );
            warn!(direction = %direction, %reason, "Dispatch refused");
            return Ok(Admission::Refused { reason });
        }

        match direction {
            Direction::PerpToSpot => {
                let required_spot = notional_usd * SPOT_BUFFER;
                if balances.spot_usdc < required_spot {
                    let reason = format!(
                        "spot {} {:.2} below required {:.2}",
                        self.quote_coin, balances.spot_usdc, required_spot
                    );
                    warn!(direction = %direction, %reason, "Dispatch refused");
                    return Ok(Admission::Refused { reason });
                }
            }
            Direction::SpotToPerp => {
                if mid <= 0.0 {
                    return Ok(Admission::Refused {
                        reason: "no reference mid for base-quantity check".to_string(),
                    });
                }
                let required_base = (notional_usd / mid) * SPOT_BUFFER;
                if balances.spot_base < required_base {
                    let reason = format!(
                        "spot {} {:.4} below required {:.4}",
                        self.base_coin, balances.spot_base, required_base
                    );
                    warn!(direction = %direction, %reason, "Dispatch refused");
                    return Ok(Admission::Refused { reason });
                }
            }
        }

        Ok(Admission::Admissible)
    }

    /// Drop the cached snapshot (after a fill or transfer)
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Most recent snapshot, if any (served by the control surface)
    pub fn cached(&self) -> Option<BalanceSnapshot> {
        self.cache
    }
}
