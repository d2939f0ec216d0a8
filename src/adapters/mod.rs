//! Exchange collaborator interfaces
//!
//! The real signing client is provisioned outside this crate; everything here
//! is the surface the engine consumes: typed order/balance structures, the
//! `ExchangeClient` and `BookStream` traits, the read-only Hyperliquid info
//! and book-feed plumbing, and a deterministic paper client for dry runs and
//! tests.

pub mod errors;
pub mod hyperliquid;
pub mod paper;
pub mod traits;
pub mod types;

pub use errors::{ExchangeError, ExchangeResult};
pub use hyperliquid::WsBookStream;
pub use paper::PaperClient;
pub use traits::{BookStream, ExchangeClient};
pub use types::{
    BookEvent, BookSide, BookTop, FillState, LegResult, OrderAck, OrderSpec, PerpPosition,
    SpotBalance, Tif, UserState,
};
