//! Market feed: merged perp/spot top-of-book tick stream
//!
//! The feed task consumes per-instrument book events from a `BookStream` and
//! emits a merged `Tick` whenever the top of either book changes. Downstream
//! consumers subscribe to a bounded broadcast channel; a slow consumer lags
//! and skips to the freshest tick rather than back-pressuring the feed.
//!
//! A gap of more than `FEED_STALE_MS` between events raises the feed-stale
//! flag, which keeps the stability gate idle until the next event clears it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::adapters::traits::BookStream;
use crate::adapters::types::{BookEvent, BookSide, BookTop};

/// Subscription gap after which the feed is considered stale
pub const FEED_STALE_MS: u64 = 2_000;

/// Broadcast capacity; laggards skip to the freshest tick
pub const TICK_CHANNEL_CAPACITY: usize = 64;

/// Merged top-of-book snapshot for both instruments
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub perp_bid: f64,
    pub perp_ask: f64,
    pub spot_bid: f64,
    pub spot_ask: f64,
    /// Local receive time (unix ms)
    pub recv_ms: u64,
    /// Venue send time (unix ms), 0 when the venue did not report one
    pub send_ms: u64,
}

impl Tick {
    pub fn new(perp: BookTop, spot: BookTop, recv_ms: u64, send_ms: u64) -> Self {
        Self {
            perp_bid: perp.bid,
            perp_ask: perp.ask,
            spot_bid: spot.bid,
            spot_ask: spot.ask,
            recv_ms,
            send_ms,
        }
    }

    /// Both books positive and uncrossed
    pub fn is_valid(&self) -> bool {
        self.perp_bid > 0.0
            && self.spot_bid > 0.0
            && self.perp_bid < self.perp_ask
            && self.spot_bid < self.spot_ask
    }

    /// Wire-to-local latency when the venue reported a send time
    pub fn latency_ms(&self) -> u64 {
        if self.send_ms > 0 && self.recv_ms >= self.send_ms {
            self.recv_ms - self.send_ms
        } else {
            0
        }
    }
}

/// Run the market feed until shutdown.
///
/// Emits a merged tick on every book event once both sides have been seen,
/// on two channels: the broadcast for ordered consumers, and the watch that
/// always holds only the freshest tick (read mid-dispatch when an IOC retry
/// re-prices). Send errors (no subscribers yet) are ignored; the stale flag
/// is raised on a quiet feed and cleared by the next event.
pub async fn feed_task<S: BookStream>(
    mut stream: S,
    tick_tx: broadcast::Sender<Tick>,
    tick_watch_tx: watch::Sender<Option<Tick>>,
    feed_stale: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Market feed started");

    let mut last_perp: Option<BookTop> = None;
    let mut last_spot: Option<BookTop> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Market feed shutting down");
                break;
            }
            event = stream.next_event() => {
                let event = match event {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "Book stream failed");
                        feed_stale.store(true, Ordering::Relaxed);
                        break;
                    }
                };
                if feed_stale.swap(false, Ordering::Relaxed) {
                    info!("Feed recovered, stale flag cleared");
                }
                if let Some(tick) = merge_event(&mut last_perp, &mut last_spot, event) {
                    let _ = tick_watch_tx.send(Some(tick));
                    let _ = tick_tx.send(tick);
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(FEED_STALE_MS)) => {
                if !feed_stale.swap(true, Ordering::Relaxed) {
                    warn!(gap_ms = FEED_STALE_MS, "Feed stale, gating paused until recovery");
                }
            }
        }
    }
}

/// Fold one book event into the per-side state; a tick is produced once both
/// sides are known. Crossed or degenerate books are dropped.
pub fn merge_event(
    last_perp: &mut Option<BookTop>,
    last_spot: &mut Option<BookTop>,
    event: BookEvent,
) -> Option<Tick> {
    if !event.top.is_valid() {
        warn!(side = ?event.side, bid = event.top.bid, ask = event.top.ask, "Dropping crossed book update");
        return None;
    }

    match event.side {
        BookSide::Perp => *last_perp = Some(event.top),
        BookSide::Spot => *last_spot = Some(event.top),
    }

    let (perp, spot) = (last_perp.as_ref()?, last_spot.as_ref()?);
    let tick = Tick::new(*perp, *spot, event.recv_ms, event.send_ms.unwrap_or(0));
    tick.is_valid().then_some(tick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::errors::{ExchangeError, ExchangeResult};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    fn perp_event(bid: f64, ask: f64, recv_ms: u64) -> BookEvent {
        BookEvent {
            side: BookSide::Perp,
            top: BookTop::new(bid, ask),
            send_ms: Some(recv_ms.saturating_sub(15)),
            recv_ms,
        }
    }

    fn spot_event(bid: f64, ask: f64, recv_ms: u64) -> BookEvent {
        BookEvent {
            side: BookSide::Spot,
            top: BookTop::new(bid, ask),
            send_ms: None,
            recv_ms,
        }
    }

    #[test]
    fn test_no_tick_until_both_sides_seen() {
        let mut perp = None;
        let mut spot = None;

        assert!(merge_event(&mut perp, &mut spot, perp_event(49.98, 50.02, 1_000)).is_none());
        let tick = merge_event(&mut perp, &mut spot, spot_event(49.97, 50.01, 1_001))
            .expect("second side completes the tick");

        assert_eq!(tick.perp_bid, 49.98);
        assert_eq!(tick.spot_ask, 50.01);
        assert_eq!(tick.recv_ms, 1_001);
    }

    #[test]
    fn test_crossed_update_is_dropped_and_state_unchanged() {
        let mut perp = Some(BookTop::new(49.98, 50.02));
        let mut spot = Some(BookTop::new(49.97, 50.01));

        let crossed = BookEvent {
            side: BookSide::Perp,
            top: BookTop::new(50.05, 50.01),
            send_ms: None,
            recv_ms: 2_000,
        };
        assert!(merge_event(&mut perp, &mut spot, crossed).is_none());
        assert_eq!(perp.unwrap().bid, 49.98, "stale side retained");
    }

    #[test]
    fn test_tick_latency_from_send_time() {
        let mut perp = Some(BookTop::new(49.98, 50.02));
        let mut spot = None;
        let tick = merge_event(&mut perp, &mut spot, spot_event(49.97, 50.01, 5_000));
        assert_eq!(tick.unwrap().latency_ms(), 0, "no venue send time");

        let mut spot2 = Some(BookTop::new(49.97, 50.01));
        let tick = merge_event(&mut perp, &mut spot2, perp_event(49.99, 50.03, 5_000)).unwrap();
        assert_eq!(tick.latency_ms(), 15);
    }

    /// Book stream that replays a fixed script then reports closure
    struct ScriptedStream {
        events: VecDeque<BookEvent>,
    }

    #[async_trait]
    impl BookStream for ScriptedStream {
        async fn next_event(&mut self) -> ExchangeResult<BookEvent> {
            match self.events.pop_front() {
                Some(e) => Ok(e),
                None => {
                    // Park forever; the test drives shutdown
                    futures_util::future::pending::<()>().await;
                    Err(ExchangeError::ConnectionFailed("unreachable".to_string()))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_feed_task_emits_merged_ticks() {
        let stream = ScriptedStream {
            events: VecDeque::from(vec![
                perp_event(49.98, 50.02, 1_000),
                spot_event(49.97, 50.01, 1_001),
                perp_event(49.99, 50.03, 1_002),
            ]),
        };

        let (tick_tx, mut tick_rx) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let (watch_tx, watch_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let stale = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(feed_task(stream, tick_tx, watch_tx, stale.clone(), shutdown_rx));

        let first = tick_rx.recv().await.unwrap();
        assert_eq!(first.perp_bid, 49.98);
        let second = tick_rx.recv().await.unwrap();
        assert_eq!(second.perp_bid, 49.99);
        assert!(!stale.load(Ordering::Relaxed));

        // The watch coalesces to the freshest tick
        let freshest = *watch_rx.borrow();
        assert_eq!(freshest.unwrap().perp_bid, 49.99);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("feed task should stop on shutdown")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_task_raises_stale_flag_on_gap() {
        let stream = ScriptedStream {
            events: VecDeque::new(),
        };
        let (tick_tx, _tick_rx) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let (watch_tx, _watch_rx) = watch::channel(None);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let stale = Arc::new(AtomicBool::new(false));

        let _handle = tokio::spawn(feed_task(stream, tick_tx, watch_tx, stale.clone(), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(FEED_STALE_MS + 100)).await;
        assert!(stale.load(Ordering::Relaxed));
    }
}
