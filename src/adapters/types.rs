//! Core data types shared between the engine and exchange adapters
//!
//! These mirror the venue's order wire format (coin, side, size, limit price,
//! time-in-force, reduce-only) without tying the engine to any concrete
//! client implementation.

use serde::{Deserialize, Serialize};

// =============================================================================
// Book feed types
// =============================================================================

/// Which instrument a book event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSide {
    Perp,
    Spot,
}

/// Top of book for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookTop {
    pub bid: f64,
    pub ask: f64,
}

impl BookTop {
    pub fn new(bid: f64, ask: f64) -> Self {
        Self { bid, ask }
    }

    /// A book is well-formed when both sides are positive and not crossed
    pub fn is_valid(&self) -> bool {
        self.bid > 0.0 && self.ask > 0.0 && self.bid < self.ask
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// One top-of-book update from the venue
#[derive(Debug, Clone, Copy)]
pub struct BookEvent {
    pub side: BookSide,
    pub top: BookTop,
    /// Venue send time (unix ms) when the message carries one
    pub send_ms: Option<u64>,
    /// Local receive time (unix ms)
    pub recv_ms: u64,
}

// =============================================================================
// Order types
// =============================================================================

/// Time-in-force on the venue wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tif {
    /// Add-liquidity-only (post-only maker); rejected if it would cross
    Alo,
    /// Immediate-or-cancel taker
    Ioc,
}

/// A single order to be placed on the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub coin: String,
    pub is_buy: bool,
    pub size: f64,
    pub limit_px: f64,
    pub tif: Tif,
    /// Only ever set on close-side perp legs
    pub reduce_only: bool,
}

impl OrderSpec {
    pub fn new(coin: impl Into<String>, is_buy: bool, size: f64, limit_px: f64, tif: Tif) -> Self {
        Self {
            coin: coin.into(),
            is_buy,
            size,
            limit_px,
            tif,
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn notional(&self) -> f64 {
        self.size * self.limit_px
    }
}

/// Per-order acknowledgement inside a (transport-successful) response
/// envelope. The venue can report `rejected` here even when the HTTP layer
/// returned success, so callers must never trust transport status alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderAck {
    /// Order is resting on the book (ALO accepted, not yet filled)
    Resting { oid: u64 },
    /// Order filled immediately
    Filled { oid: u64, total_size: f64, avg_px: f64 },
    /// Venue rejected the order (post-only cross, margin, bad lot, ...)
    Rejected { reason: String },
    /// Envelope was present but unparseable for this order
    Malformed,
}

/// Fill state of a previously placed order, as reported by the venue
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillState {
    pub filled_size: f64,
    pub avg_px: Option<f64>,
    /// Still resting on the book
    pub open: bool,
}

/// Terminal classification of one leg of a dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum LegResult {
    Filled { size_filled: f64, avg_px: f64 },
    Rejected { reason: String },
    Cancelled,
    /// Response was ambiguous; must be resolved by querying positions
    Unknown,
}

impl LegResult {
    pub fn is_filled(&self) -> bool {
        matches!(self, LegResult::Filled { .. })
    }

    pub fn filled_size(&self) -> f64 {
        match self {
            LegResult::Filled { size_filled, .. } => *size_filled,
            _ => 0.0,
        }
    }
}

// =============================================================================
// Account state types
// =============================================================================

/// One perp position as reported by the venue. Size is signed: positive for
/// long, negative for short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerpPosition {
    pub coin: String,
    pub size: f64,
    pub entry_px: f64,
    pub margin_used: f64,
}

/// Perp account snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserState {
    /// Free collateral in the perp margin account
    pub withdrawable_usd: f64,
    pub positions: Vec<PerpPosition>,
}

/// One spot balance entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotBalance {
    pub coin: String,
    pub total: f64,
    /// Amount locked in resting orders
    pub hold: f64,
}

impl SpotBalance {
    pub fn available(&self) -> f64 {
        (self.total - self.hold).max(0.0)
    }
}
