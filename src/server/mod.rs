//! Control surface: operator commands over HTTP, live edges over WebSocket
//!
//! `POST /command` accepts `{"cmd": "...", "value": ...}` and returns a
//! structured JSON reply. `GET /ws/edges` streams the latest edge payload to
//! read-only observers. `GET /health` is a liveness probe.

pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::{SharedOverrides, TifMode};
use crate::core::channels::{EdgePayload, EngineCommand, SharedStatus, TradingFlags};
use crate::storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub status: SharedStatus,
    pub overrides: SharedOverrides,
    pub flags: Arc<TradingFlags>,
    pub command_tx: mpsc::Sender<EngineCommand>,
    pub edge_tx: broadcast::Sender<EdgePayload>,
    pub store: Arc<Store>,
    /// Boot-time configuration snapshot for the `config` command
    pub config_info: Arc<Value>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/command", post(command))
        .route("/ws/edges", get(ws::ws_handler))
        .with_state(state)
}

/// Bind and serve until the shutdown broadcast fires.
pub async fn serve(
    state: AppState,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Control surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true, "ts": chrono::Utc::now().to_rfc3339()}))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    cmd: String,
    #[serde(default)]
    value: Option<Value>,
}

async fn command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Json<Value> {
    Json(handle_command(&state, request).await)
}

async fn handle_command(state: &AppState, request: CommandRequest) -> Value {
    match request.cmd.as_str() {
        "pause" => {
            state.flags.pause();
            json!({"ok": true, "trading": "paused"})
        }
        "resume" => {
            state.flags.resume();
            json!({"ok": true, "trading": "running"})
        }
        "set-threshold" => match as_f64(&request.value) {
            Some(bps) if bps > 0.0 => {
                state.overrides.write().await.threshold_bps = bps;
                json!({"ok": true, "threshold_bps": bps})
            }
            _ => error_reply("set-threshold needs a positive number of bps"),
        },
        "set-notional" => match as_f64(&request.value) {
            Some(usd) if usd > 0.0 => {
                state.overrides.write().await.alloc_per_trade_usd = usd;
                json!({"ok": true, "alloc_per_trade_usd": usd})
            }
            _ => error_reply("set-notional needs a positive USD amount"),
        },
        "set-tif" => match request.value.as_ref().and_then(|v| v.as_str()) {
            Some("maker") => {
                state.overrides.write().await.tif = TifMode::Maker;
                json!({"ok": true, "tif": "maker"})
            }
            Some("ioc") => {
                state.overrides.write().await.tif = TifMode::Ioc;
                json!({"ok": true, "tif": "ioc"})
            }
            _ => error_reply("set-tif needs 'maker' or 'ioc'"),
        },
        "set-dryrun" => match as_bool(&request.value) {
            Some(on) => {
                state.overrides.write().await.dry_run = on;
                json!({"ok": true, "dry_run": on})
            }
            None => error_reply("set-dryrun needs 'on' or 'off'"),
        },
        "close-all" => {
            if state.command_tx.send(EngineCommand::CloseAll).await.is_ok() {
                json!({"ok": true, "note": "closing all open positions"})
            } else {
                error_reply("engine not running")
            }
        }
        "rebalance" => {
            if state.command_tx.send(EngineCommand::Rebalance).await.is_ok() {
                json!({"ok": true, "note": "rebalance requested"})
            } else {
                error_reply("engine not running")
            }
        }
        "status" => {
            let status = state.status.read().await;
            let overrides = state.overrides.read().await;
            json!({
                "ok": true,
                "paused": status.paused,
                "feed_stale": status.feed_stale,
                "dry_run": overrides.dry_run,
                "threshold_bps": overrides.threshold_bps,
                "open_positions": status.open_positions.len(),
                "trades_executed": status.trades_executed,
                "last_edges": &status.last_edges,
            })
        }
        "balance" => {
            let status = state.status.read().await;
            match &status.balances {
                Some(balances) => json!({"ok": true, "balances": balances}),
                None => json!({"ok": true, "balances": null, "note": "not sampled yet"}),
            }
        }
        "positions" => {
            let status = state.status.read().await;
            json!({"ok": true, "positions": &status.open_positions})
        }
        "trades" => {
            let hours = as_f64(&request.value).map(|h| h as u32).unwrap_or(24);
            match state.store.fetch_trades(hours).await {
                Ok(trades) => json!({"ok": true, "hours": hours, "trades": trades}),
                Err(e) => {
                    warn!(error = %e, "Trade query failed");
                    error_reply(&e.to_string())
                }
            }
        }
        "pnl" => {
            let hours = as_f64(&request.value).map(|h| h as u32).unwrap_or(24);
            match state.store.fetch_pnl(hours).await {
                Ok(pnl) => json!({"ok": true, "hours": hours, "realized_pnl_usd": pnl}),
                Err(e) => {
                    warn!(error = %e, "PnL query failed");
                    error_reply(&e.to_string())
                }
            }
        }
        "stats" => {
            let status = state.status.read().await;
            json!({
                "ok": true,
                "trades_executed": status.trades_executed,
                "broken_hedges": status.broken_hedges,
                "opportunities_recorded": status.opportunities_recorded,
                "dispatches_last_minute": status.dispatches_last_minute,
            })
        }
        "config" => {
            let overrides = state.overrides.read().await;
            json!({
                "ok": true,
                "settings": &*state.config_info,
                "overrides": &*overrides,
            })
        }
        other => error_reply(&format!("unknown command '{other}'")),
    }
}

fn error_reply(message: &str) -> Value {
    json!({"ok": false, "error": message})
}

fn as_f64(value: &Option<Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Option<Value>) -> Option<bool> {
    match value {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => match s.as_str() {
            "on" | "true" | "1" => Some(true),
            "off" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Overrides, Settings};
    use crate::core::channels::EngineChannels;

    fn state() -> (AppState, mpsc::Receiver<EngineCommand>) {
        let settings = Settings::defaults();
        let channels = EngineChannels::default();
        (
            AppState {
                status: SharedStatus::default(),
                overrides: Overrides::from_settings(&settings).into_shared(),
                flags: Arc::new(TradingFlags::new(false)),
                command_tx: channels.command_tx.clone(),
                edge_tx: channels.edge_tx.clone(),
                store: Arc::new(Store::new(None, None)),
                config_info: Arc::new(json!({"pair_base": "HYPE"})),
            },
            channels.command_rx,
        )
    }

    fn request(cmd: &str, value: Option<Value>) -> CommandRequest {
        CommandRequest {
            cmd: cmd.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn test_pause_and_resume_toggle_kill_switch() {
        let (state, _rx) = state();
        let reply = handle_command(&state, request("pause", None)).await;
        assert_eq!(reply["ok"], true);
        assert!(state.flags.is_paused());

        handle_command(&state, request("resume", None)).await;
        assert!(!state.flags.is_paused());
    }

    #[tokio::test]
    async fn test_set_threshold_updates_overrides() {
        let (state, _rx) = state();
        let reply = handle_command(&state, request("set-threshold", Some(json!(25.0)))).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(state.overrides.read().await.threshold_bps, 25.0);

        let reply = handle_command(&state, request("set-threshold", Some(json!(-1)))).await;
        assert_eq!(reply["ok"], false);
    }

    #[tokio::test]
    async fn test_set_tif_and_dryrun() {
        let (state, _rx) = state();
        handle_command(&state, request("set-tif", Some(json!("ioc")))).await;
        assert_eq!(state.overrides.read().await.tif, TifMode::Ioc);

        handle_command(&state, request("set-dryrun", Some(json!("off")))).await;
        assert!(!state.overrides.read().await.dry_run);
    }

    #[tokio::test]
    async fn test_close_all_routes_to_engine() {
        let (state, mut rx) = state();
        let reply = handle_command(&state, request("close-all", None)).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(rx.recv().await, Some(EngineCommand::CloseAll));
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let (state, _rx) = state();
        let reply = handle_command(&state, request("self-destruct", None)).await;
        assert_eq!(reply["ok"], false);
    }

    #[tokio::test]
    async fn test_status_reflects_overrides() {
        let (state, _rx) = state();
        let reply = handle_command(&state, request("status", None)).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["threshold_bps"], 20.0);
        assert_eq!(reply["open_positions"], 0);
    }
}
