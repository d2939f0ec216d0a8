//! Paper trading client
//!
//! Deterministic in-memory implementation of `ExchangeClient` used for
//! DRY_RUN mode and tests. Fills are simulated at the limit price; ALO orders
//! rest and fill after a configurable number of fill-state polls so the
//! dispatcher's maker-first path can be exercised end to end. Rejections can
//! be scripted per coin to drive the fallback and recovery flows.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::adapters::errors::ExchangeResult;
use crate::adapters::traits::ExchangeClient;
use crate::adapters::types::{FillState, OrderAck, OrderSpec, SpotBalance, Tif, UserState};

/// How simulated ALO orders behave after they are acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AloBehavior {
    /// Rest, then report filled after N fill-state polls
    FillAfterPolls(u32),
    /// Reject at placement as a post-only cross
    RejectPostOnly,
    /// Rest forever (drives the dispatcher's timeout path)
    NeverFill,
}

#[derive(Debug)]
struct PaperOrder {
    spec: OrderSpec,
    polls_until_fill: Option<u32>,
    filled_size: f64,
    open: bool,
}

#[derive(Debug)]
struct PaperState {
    next_oid: u64,
    alo_behavior: AloBehavior,
    /// Coins whose orders are rejected inside a successful envelope
    reject_coins: HashSet<String>,
    /// Coins whose ALO orders (only) are rejected as post-only crosses
    reject_alo_coins: HashSet<String>,
    orders: HashMap<u64, PaperOrder>,
    placed: Vec<OrderSpec>,
    cancelled: Vec<(String, u64)>,
    leverage: Option<(String, u32, bool)>,
    user_state: UserState,
    spot_balances: Vec<SpotBalance>,
    scheduled_cancels: Vec<u64>,
}

/// In-memory exchange used for dry runs and tests
pub struct PaperClient {
    state: Mutex<PaperState>,
}

impl PaperClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                next_oid: 1,
                alo_behavior: AloBehavior::FillAfterPolls(1),
                reject_coins: HashSet::new(),
                reject_alo_coins: HashSet::new(),
                orders: HashMap::new(),
                placed: Vec::new(),
                cancelled: Vec::new(),
                leverage: None,
                user_state: UserState {
                    withdrawable_usd: 1_000.0,
                    positions: Vec::new(),
                },
                spot_balances: vec![
                    SpotBalance {
                        coin: "USDC".to_string(),
                        total: 1_000.0,
                        hold: 0.0,
                    },
                    SpotBalance {
                        coin: "HYPE".to_string(),
                        total: 20.0,
                        hold: 0.0,
                    },
                ],
                scheduled_cancels: Vec::new(),
            }),
        }
    }

    pub async fn set_alo_behavior(&self, behavior: AloBehavior) {
        self.state.lock().await.alo_behavior = behavior;
    }

    /// Make every order on `coin` come back `Rejected` inside the envelope
    pub async fn reject_orders_for(&self, coin: &str) {
        self.state.lock().await.reject_coins.insert(coin.to_string());
    }

    /// Reject only post-only orders on `coin`; IOC retries still fill
    pub async fn reject_alo_for(&self, coin: &str) {
        self.state
            .lock()
            .await
            .reject_alo_coins
            .insert(coin.to_string());
    }

    pub async fn clear_rejections(&self) {
        let mut state = self.state.lock().await;
        state.reject_coins.clear();
        state.reject_alo_coins.clear();
    }

    pub async fn set_user_state(&self, user_state: UserState) {
        self.state.lock().await.user_state = user_state;
    }

    pub async fn set_spot_balances(&self, balances: Vec<SpotBalance>) {
        self.state.lock().await.spot_balances = balances;
    }

    /// Every order placed so far, in submission order
    pub async fn placed_orders(&self) -> Vec<OrderSpec> {
        self.state.lock().await.placed.clone()
    }

    pub async fn cancelled_orders(&self) -> Vec<(String, u64)> {
        self.state.lock().await.cancelled.clone()
    }

    /// Times the venue-side deadman was (re-)armed
    pub async fn scheduled_cancels(&self) -> Vec<u64> {
        self.state.lock().await.scheduled_cancels.clone()
    }

    pub async fn leverage_setting(&self) -> Option<(String, u32, bool)> {
        self.state.lock().await.leverage.clone()
    }
}

impl Default for PaperClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for PaperClient {
    async fn place_orders(&self, orders: Vec<OrderSpec>) -> ExchangeResult<Vec<OrderAck>> {
        let mut state = self.state.lock().await;
        let mut acks = Vec::with_capacity(orders.len());

        for spec in orders {
            state.placed.push(spec.clone());

            let rejected = state.reject_coins.contains(&spec.coin)
                || (spec.tif == Tif::Alo && state.reject_alo_coins.contains(&spec.coin));
            if rejected {
                acks.push(OrderAck::Rejected {
                    reason: match spec.tif {
                        Tif::Alo => "Post only order would have immediately matched".to_string(),
                        Tif::Ioc => "Order could not immediately match".to_string(),
                    },
                });
                continue;
            }

            let oid = state.next_oid;
            state.next_oid += 1;

            match spec.tif {
                Tif::Ioc => {
                    let ack = OrderAck::Filled {
                        oid,
                        total_size: spec.size,
                        avg_px: spec.limit_px,
                    };
                    state.orders.insert(
                        oid,
                        PaperOrder {
                            filled_size: spec.size,
                            open: false,
                            polls_until_fill: None,
                            spec,
                        },
                    );
                    acks.push(ack);
                }
                Tif::Alo => match state.alo_behavior {
                    AloBehavior::RejectPostOnly => {
                        acks.push(OrderAck::Rejected {
                            reason: "Post only order would have immediately matched".to_string(),
                        });
                    }
                    AloBehavior::FillAfterPolls(n) => {
                        state.orders.insert(
                            oid,
                            PaperOrder {
                                filled_size: 0.0,
                                open: true,
                                polls_until_fill: Some(n),
                                spec,
                            },
                        );
                        acks.push(OrderAck::Resting { oid });
                    }
                    AloBehavior::NeverFill => {
                        state.orders.insert(
                            oid,
                            PaperOrder {
                                filled_size: 0.0,
                                open: true,
                                polls_until_fill: None,
                                spec,
                            },
                        );
                        acks.push(OrderAck::Resting { oid });
                    }
                },
            }
        }

        Ok(acks)
    }

    async fn cancel_order(&self, coin: &str, oid: u64) -> ExchangeResult<()> {
        let mut state = self.state.lock().await;
        state.cancelled.push((coin.to_string(), oid));
        if let Some(order) = state.orders.get_mut(&oid) {
            order.open = false;
        }
        Ok(())
    }

    async fn order_fill(&self, _coin: &str, oid: u64) -> ExchangeResult<FillState> {
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.get_mut(&oid) else {
            return Ok(FillState {
                filled_size: 0.0,
                avg_px: None,
                open: false,
            });
        };

        if order.open {
            if let Some(polls) = order.polls_until_fill.as_mut() {
                if *polls <= 1 {
                    order.filled_size = order.spec.size;
                    order.open = false;
                } else {
                    *polls -= 1;
                }
            }
        }

        Ok(FillState {
            filled_size: order.filled_size,
            avg_px: (order.filled_size > 0.0).then_some(order.spec.limit_px),
            open: order.open,
        })
    }

    async fn set_leverage(&self, coin: &str, leverage: u32, is_cross: bool) -> ExchangeResult<()> {
        self.state.lock().await.leverage = Some((coin.to_string(), leverage, is_cross));
        Ok(())
    }

    async fn user_state(&self) -> ExchangeResult<UserState> {
        Ok(self.state.lock().await.user_state.clone())
    }

    async fn spot_balances(&self) -> ExchangeResult<Vec<SpotBalance>> {
        Ok(self.state.lock().await.spot_balances.clone())
    }

    async fn schedule_cancel_all(&self, at_ms: u64) -> ExchangeResult<()> {
        self.state.lock().await.scheduled_cancels.push(at_ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ioc_orders_fill_immediately() {
        let client = PaperClient::new();
        let acks = client
            .place_orders(vec![OrderSpec::new("HYPE", false, 0.72, 50.0, Tif::Ioc)])
            .await
            .unwrap();

        assert_eq!(acks.len(), 1);
        match &acks[0] {
            OrderAck::Filled { total_size, avg_px, .. } => {
                assert_eq!(*total_size, 0.72);
                assert_eq!(*avg_px, 50.0);
            }
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_alo_orders_rest_then_fill_on_poll() {
        let client = PaperClient::new();
        client.set_alo_behavior(AloBehavior::FillAfterPolls(2)).await;

        let acks = client
            .place_orders(vec![OrderSpec::new("HYPE", false, 0.72, 50.0, Tif::Alo)])
            .await
            .unwrap();
        let OrderAck::Resting { oid } = acks[0] else {
            panic!("expected resting ack");
        };

        let first = client.order_fill("HYPE", oid).await.unwrap();
        assert!(first.open);
        assert_eq!(first.filled_size, 0.0);

        let second = client.order_fill("HYPE", oid).await.unwrap();
        assert!(!second.open);
        assert_eq!(second.filled_size, 0.72);
    }

    #[tokio::test]
    async fn test_scripted_rejection_is_in_envelope_not_error() {
        let client = PaperClient::new();
        client.reject_orders_for("@107").await;

        let acks = client
            .place_orders(vec![OrderSpec::new("@107", true, 0.72, 50.01, Tif::Alo)])
            .await
            .unwrap();
        assert!(matches!(acks[0], OrderAck::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_deadman_rearm_is_recorded() {
        let client = PaperClient::new();
        client.schedule_cancel_all(1_000).await.unwrap();
        client.schedule_cancel_all(2_000).await.unwrap();
        assert_eq!(client.scheduled_cancels().await, vec![1_000, 2_000]);
    }

    #[tokio::test]
    async fn test_cancel_closes_resting_order() {
        let client = PaperClient::new();
        client.set_alo_behavior(AloBehavior::NeverFill).await;

        let acks = client
            .place_orders(vec![OrderSpec::new("HYPE", true, 0.5, 49.9, Tif::Alo)])
            .await
            .unwrap();
        let OrderAck::Resting { oid } = acks[0] else {
            panic!("expected resting ack");
        };

        client.cancel_order("HYPE", oid).await.unwrap();
        let fill = client.order_fill("HYPE", oid).await.unwrap();
        assert!(!fill.open);
        assert_eq!(fill.filled_size, 0.0);
    }
}
