//! Operator notifications over Telegram
//!
//! Exactly one notification per terminal outcome: trade posted or failed,
//! position closed with realised P&L, hedge broken (high severity). Delivery
//! is best-effort; a failed send is logged and never propagates.

use tracing::{debug, warn};

use crate::core::dispatch::CloseFills;
use crate::core::edge::Direction;
use crate::core::position::{CloseReason, HedgedPosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn prefix(&self) -> &'static str {
        match self {
            Severity::Info => "[INFO]",
            Severity::Warning => "[WARN]",
            Severity::Critical => "[CRITICAL]",
        }
    }
}

pub struct Notifier {
    client: Option<reqwest::Client>,
    token: String,
    chat_id: String,
}

impl Notifier {
    pub fn new(token: Option<String>, chat_id: Option<String>) -> Self {
        match (token, chat_id) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => Self {
                client: Some(reqwest::Client::new()),
                token,
                chat_id,
            },
            _ => {
                debug!("Notifier disabled (no token/chat id configured)");
                Self {
                    client: None,
                    token: String::new(),
                    chat_id: String::new(),
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub async fn send(&self, severity: Severity, text: &str) {
        let Some(client) = &self.client else {
            debug!(severity = ?severity, text, "Notification (disabled)");
            return;
        };

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": format!("{} {}", severity.prefix(), text),
        });

        match client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "Notification rejected"),
            Err(e) => warn!(error = %e, "Notification send failed"),
        }
    }

    pub async fn trade_posted(
        &self,
        direction: Direction,
        edge_bps: f64,
        notional_usd: f64,
        detail: &str,
    ) {
        self.send(
            Severity::Info,
            &format!(
                "Trade posted: {} edge {:.2} bps, notional ${:.2}. {}",
                direction, edge_bps, notional_usd, detail
            ),
        )
        .await;
    }

    pub async fn trade_failed(&self, direction: Direction, edge_bps: f64, error: &str) {
        self.send(
            Severity::Warning,
            &format!(
                "Trade failed: {} edge {:.2} bps: {}",
                direction, edge_bps, error
            ),
        )
        .await;
    }

    pub async fn position_closed(
        &self,
        position: &HedgedPosition,
        fills: &CloseFills,
        reason: CloseReason,
        realized_pnl_usd: f64,
        held_ms: u64,
    ) {
        self.send(
            Severity::Info,
            &format!(
                "Position closed ({}): {} open edge {:.2} bps, pnl ${:.4}, held {}s, exit {:?}",
                reason.as_str(),
                position.direction,
                position.open_edge_bps,
                realized_pnl_usd,
                held_ms / 1_000,
                fills.method,
            ),
        )
        .await;
    }

    /// High-severity page; the caller also sets the kill-switch.
    pub async fn hedge_broken(&self, position: &HedgedPosition, detail: &str) {
        self.send(
            Severity::Critical,
            &format!(
                "HEDGE BROKEN: {} {} perp {:.4} / spot {:.4}: {}. Kill-switch set, closes only.",
                position.direction,
                position.id,
                position.perp_size,
                position.spot_size,
                detail
            ),
        )
        .await;
    }
}
