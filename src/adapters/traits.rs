//! Exchange collaborator traits
//!
//! `ExchangeClient` is the single-owner trading surface (the dispatcher and
//! the position manager serialise access through one instance). `BookStream`
//! is the market-data surface consumed by the feed. Both are object-safe so
//! the engine can run against the paper client in dry-run mode and against a
//! real signing client in production.

use async_trait::async_trait;

use crate::adapters::errors::ExchangeResult;
use crate::adapters::types::{
    BookEvent, FillState, OrderAck, OrderSpec, SpotBalance, UserState,
};

/// Trading capabilities consumed from the venue.
///
/// Implementations must treat a per-order `Rejected` ack as a normal response,
/// not an `Err`: post-only rejections are an expected flow for the dispatcher.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Place a batch of orders in one action. The response carries one ack
    /// per order, in submission order.
    async fn place_orders(&self, orders: Vec<OrderSpec>) -> ExchangeResult<Vec<OrderAck>>;

    /// Cancel a resting order by (coin, oid)
    async fn cancel_order(&self, coin: &str, oid: u64) -> ExchangeResult<()>;

    /// Fill state of a previously placed order
    async fn order_fill(&self, coin: &str, oid: u64) -> ExchangeResult<FillState>;

    /// Set perp leverage for a symbol before trading it
    async fn set_leverage(&self, coin: &str, leverage: u32, is_cross: bool) -> ExchangeResult<()>;

    /// Perp account snapshot (free margin + positions)
    async fn user_state(&self) -> ExchangeResult<UserState>;

    /// Spot wallet balances
    async fn spot_balances(&self) -> ExchangeResult<Vec<SpotBalance>>;

    /// Schedule a venue-side cancel-all at the given unix-ms time. Re-armed
    /// after every live dispatch so open maker orders die with the process.
    async fn schedule_cancel_all(&self, at_ms: u64) -> ExchangeResult<()>;
}

/// Stream of top-of-book updates for the subscribed instruments.
///
/// Implementations reconnect internally (exponential backoff) and only
/// surface an error when the subscription is unrecoverable.
#[async_trait]
pub trait BookStream: Send {
    /// Next top-of-book update, in arrival order
    async fn next_event(&mut self) -> ExchangeResult<BookEvent>;
}
