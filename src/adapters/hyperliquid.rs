//! Read-only Hyperliquid plumbing
//!
//! Two things live here: the info-endpoint helpers (spot index resolution
//! over HTTP with retry) and `WsBookStream`, the l2Book websocket subscriber
//! that feeds the engine. Order signing and placement are an external
//! collaborator and are deliberately absent.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::traits::BookStream;
use crate::adapters::types::{BookEvent, BookSide, BookTop};

/// Reconnect backoff floor
const BACKOFF_MIN_MS: u64 = 100;
/// Reconnect backoff cap
const BACKOFF_MAX_MS: u64 = 5_000;
/// Retry budget for info-endpoint calls that fail with a 5xx
const INFO_RETRY_ATTEMPTS: u32 = 3;

// =============================================================================
// Info endpoint
// =============================================================================

/// POST to the info endpoint, retrying 5xx responses with backoff. 4xx is
/// surfaced immediately.
pub async fn info_post(client: &reqwest::Client, url: &str, payload: Value) -> ExchangeResult<Value> {
    let mut backoff = Duration::from_millis(250);
    let mut last_err = None;

    for attempt in 1..=INFO_RETRY_ATTEMPTS {
        let resp = client.post(url).json(&payload).send().await;
        match resp {
            Ok(r) => {
                let status = r.status();
                if status.is_success() {
                    return Ok(r.json::<Value>().await?);
                }
                let body = r.text().await.unwrap_or_else(|_| "<no body>".to_string());
                let err = ExchangeError::Http {
                    status: status.as_u16(),
                    body,
                };
                if !status.is_server_error() {
                    return Err(err);
                }
                last_err = Some(err);
            }
            Err(e) => last_err = Some(ExchangeError::Transport(e)),
        }

        if attempt < INFO_RETRY_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    Err(last_err.unwrap_or_else(|| ExchangeError::InvalidResponse("no response".to_string())))
}

/// Resolve the spot pair index for `base`/`quote` from spotMeta.
///
/// The venue names spot books by pair index ("@107"), not by symbol; token
/// names may carry a "U" prefix in the meta universe.
pub async fn resolve_spot_index(
    client: &reqwest::Client,
    info_url: &str,
    base: &str,
    quote: &str,
) -> ExchangeResult<u32> {
    let meta = info_post(client, info_url, json!({"type": "spotMeta"})).await?;

    let tokens = meta["tokens"]
        .as_array()
        .ok_or_else(|| ExchangeError::InvalidResponse("spotMeta missing tokens".to_string()))?;

    let name_of = |idx: u64| -> Option<&str> {
        tokens
            .iter()
            .find(|t| t["index"].as_u64() == Some(idx))
            .and_then(|t| t["name"].as_str())
    };

    let quote_idx = tokens
        .iter()
        .find(|t| {
            t["name"]
                .as_str()
                .map(|n| n.eq_ignore_ascii_case(quote))
                .unwrap_or(false)
        })
        .and_then(|t| t["index"].as_u64())
        .ok_or_else(|| {
            ExchangeError::InvalidResponse(format!("quote token {quote} not in spotMeta"))
        })?;

    let universe = meta["universe"]
        .as_array()
        .ok_or_else(|| ExchangeError::InvalidResponse("spotMeta missing universe".to_string()))?;

    for pair in universe {
        let Some(pair_tokens) = pair["tokens"].as_array() else {
            continue;
        };
        let idxs: Vec<u64> = pair_tokens.iter().filter_map(|t| t.as_u64()).collect();
        if idxs.len() != 2 || !idxs.contains(&quote_idx) {
            continue;
        }
        let other = if idxs[0] == quote_idx { idxs[1] } else { idxs[0] };
        if let Some(name) = name_of(other) {
            let candidate = name.strip_prefix('U').unwrap_or(name);
            if candidate.eq_ignore_ascii_case(base) {
                if let Some(index) = pair["index"].as_u64() {
                    return Ok(index as u32);
                }
            }
        }
    }

    Err(ExchangeError::InvalidResponse(format!(
        "no spot pair for {base}/{quote}"
    )))
}

// =============================================================================
// WsBookStream
// =============================================================================

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// l2Book websocket subscriber for one perp symbol and one spot index.
///
/// Reconnects internally with exponential backoff (100 ms -> 5 s cap) and
/// resubscribes on every new connection, so `next_event` only fails when the
/// stream is shut down.
pub struct WsBookStream {
    ws_url: String,
    perp_coin: String,
    spot_coin: String,
    socket: Option<WsConn>,
    backoff_ms: u64,
}

impl WsBookStream {
    pub fn new(ws_url: impl Into<String>, perp_coin: impl Into<String>, spot_index: u32) -> Self {
        Self {
            ws_url: ws_url.into(),
            perp_coin: perp_coin.into(),
            spot_coin: format!("@{spot_index}"),
            socket: None,
            backoff_ms: BACKOFF_MIN_MS,
        }
    }

    async fn ensure_connected(&mut self) -> ExchangeResult<()> {
        while self.socket.is_none() {
            match connect_async(self.ws_url.as_str()).await {
                Ok((mut ws, _)) => {
                    for coin in [&self.perp_coin, &self.spot_coin] {
                        let sub = json!({
                            "method": "subscribe",
                            "subscription": {"type": "l2Book", "coin": coin}
                        });
                        ws.send(Message::Text(sub.to_string())).await?;
                    }
                    info!(
                        perp = %self.perp_coin,
                        spot = %self.spot_coin,
                        "Subscribed to l2Book feeds"
                    );
                    self.backoff_ms = BACKOFF_MIN_MS;
                    self.socket = Some(ws);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = self.backoff_ms,
                        "Book feed connect failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(self.backoff_ms)).await;
                    self.backoff_ms = (self.backoff_ms * 2).min(BACKOFF_MAX_MS);
                }
            }
        }
        Ok(())
    }

    fn parse_l2(&self, raw: &str) -> Option<BookEvent> {
        let value: Value = serde_json::from_str(raw).ok()?;
        if value["channel"].as_str()? != "l2Book" {
            return None;
        }
        let data = &value["data"];
        let coin = data["coin"].as_str()?;
        let side = if coin == self.perp_coin {
            BookSide::Perp
        } else if coin == self.spot_coin {
            BookSide::Spot
        } else {
            return None;
        };

        let levels = data["levels"].as_array()?;
        if levels.len() != 2 {
            return None;
        }
        let best_px = |side_levels: &Value| -> Option<f64> {
            side_levels.as_array()?.first()?["px"].as_str()?.parse().ok()
        };
        let bid = best_px(&levels[0])?;
        let ask = best_px(&levels[1])?;

        let top = BookTop::new(bid, ask);
        if !top.is_valid() {
            return None;
        }

        Some(BookEvent {
            side,
            top,
            send_ms: data["time"].as_u64(),
            recv_ms: now_ms(),
        })
    }
}

#[async_trait]
impl BookStream for WsBookStream {
    async fn next_event(&mut self) -> ExchangeResult<BookEvent> {
        loop {
            self.ensure_connected().await?;
            let ws = self.socket.as_mut().expect("connected above");

            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = self.parse_l2(&text) {
                        return Ok(event);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!("Book feed closed, reconnecting");
                    self.socket = None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Book feed read error, reconnecting");
                    self.socket = None;
                }
            }
        }
    }
}

/// Current unix time in milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
