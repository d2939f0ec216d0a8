//! Persistence adapter over the relational store's REST surface
//!
//! Writes go through PostgREST. Edge and opportunity rows are batched (at
//! most `BATCH_SIZE` records or one second, whichever comes first); trade
//! and position lifecycle rows are written synchronously. A persistence
//! failure degrades to a logged warning and never blocks trading.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::core::channels::EdgePayload;
use crate::core::dispatch::CloseFills;
use crate::core::position::{CloseReason, HedgedPosition, PositionStatus};
use crate::core::tracker::Opportunity;

/// Flush when a buffer reaches this many rows
pub const BATCH_SIZE: usize = 100;
/// Or at this cadence, whichever comes first
pub const FLUSH_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// One row of the `edges` relation
#[derive(Debug, Clone, Serialize)]
pub struct EdgeRow {
    pub ts: DateTime<Utc>,
    pub base: String,
    pub spot_index: u32,
    pub edge_ps_mm_bps: f64,
    pub edge_sp_mm_bps: f64,
    pub mid_ref: f64,
    pub recv_ms: u64,
    pub send_ms: u64,
}

impl EdgeRow {
    pub fn from_payload(p: &EdgePayload, recv_ms: u64, send_ms: u64) -> Self {
        Self {
            ts: p.ts,
            base: p.base.clone(),
            spot_index: p.spot_index,
            edge_ps_mm_bps: p.edge_ps_mm_bps,
            edge_sp_mm_bps: p.edge_sp_mm_bps,
            mid_ref: p.mid_ref,
            recv_ms,
            send_ms,
        }
    }
}

/// One row of the `trades` relation
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub ts: DateTime<Utc>,
    pub base: String,
    pub direction: String,
    pub threshold_bps: f64,
    pub mm_best_bps: f64,
    pub notional_usd: f64,
    pub role: String,
    pub request_id: Option<String>,
    pub request_json: Value,
    pub response_json: Value,
    pub status: String,
}

/// Store over PostgREST. With no credentials configured every write is a
/// debug-logged no-op so dry runs work without a database.
pub struct Store {
    client: Option<reqwest::Client>,
    url: String,
}

impl Store {
    pub fn new(url: Option<String>, anon_key: Option<String>) -> Self {
        let (client, url) = match (url, anon_key) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => {
                let mut headers = reqwest::header::HeaderMap::new();
                let auth = format!("Bearer {key}");
                if let (Ok(apikey), Ok(bearer)) = (
                    reqwest::header::HeaderValue::from_str(&key),
                    reqwest::header::HeaderValue::from_str(&auth),
                ) {
                    headers.insert("apikey", apikey);
                    headers.insert(reqwest::header::AUTHORIZATION, bearer);
                }
                headers.insert(
                    reqwest::header::CONTENT_TYPE,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );

                let client = reqwest::Client::builder()
                    .default_headers(headers)
                    .timeout(Duration::from_secs(10))
                    .build()
                    .ok();
                if client.is_some() {
                    info!(url = %url, "Persistence store configured");
                }
                (client, url)
            }
            _ => {
                info!("Persistence store not configured, writes are no-ops");
                (None, String::new())
            }
        };
        Self { client, url }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    async fn post_rows<T: Serialize>(&self, relation: &str, rows: &[T]) -> Result<(), StoreError> {
        let Some(client) = &self.client else {
            debug!(relation, "Store disabled, dropping rows");
            return Ok(());
        };
        if rows.is_empty() {
            return Ok(());
        }

        let url = format!("{}/rest/v1/{}", self.url, relation);
        let response = client
            .post(&url)
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        Err(StoreError::Database(format!("{relation}: {status} {body}")))
    }

    async fn patch_row(
        &self,
        relation: &str,
        filter: &str,
        body: &Value,
    ) -> Result<(), StoreError> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        let url = format!("{}/rest/v1/{}?{}", self.url, relation, filter);
        let response = client
            .patch(&url)
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        Err(StoreError::Database(format!("{relation}: {status} {body}")))
    }

    /// Synchronous write: one row per dispatch attempt
    pub async fn insert_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        self.post_rows("trades", std::slice::from_ref(trade)).await
    }

    /// Synchronous write at position birth
    pub async fn insert_position(&self, position: &HedgedPosition) -> Result<(), StoreError> {
        self.post_rows("positions", std::slice::from_ref(position))
            .await
    }

    /// Synchronous write at position close
    pub async fn close_position(
        &self,
        position: &HedgedPosition,
        fills: &CloseFills,
        reason: CloseReason,
        close_edge_bps: f64,
        realized_pnl_usd: f64,
    ) -> Result<(), StoreError> {
        let body = serde_json::json!({
            "status": PositionStatus::Closed,
            "closed_at": Utc::now(),
            "close_reason": reason.as_str(),
            "close_edge_bps": close_edge_bps,
            "perp_exit_px": fills.perp_exit_px,
            "spot_exit_px": fills.spot_exit_px,
            "realized_pnl": realized_pnl_usd,
        });
        self.patch_row("positions", &format!("id=eq.{}", position.id), &body)
            .await
    }

    /// Synchronous write when a hedge breaks
    pub async fn mark_position_broken(
        &self,
        position: &HedgedPosition,
        detail: &str,
    ) -> Result<(), StoreError> {
        let body = serde_json::json!({
            "status": PositionStatus::Broken,
            "close_reason": detail,
        });
        self.patch_row("positions", &format!("id=eq.{}", position.id), &body)
            .await
    }

    pub async fn insert_edges(&self, rows: &[EdgeRow]) -> Result<(), StoreError> {
        self.post_rows("edges", rows).await
    }

    pub async fn insert_opportunities(&self, rows: &[Opportunity]) -> Result<(), StoreError> {
        self.post_rows("opportunities", rows).await
    }

    /// Recent trades for the control surface (`trades [hours]`)
    pub async fn fetch_trades(&self, hours: u32) -> Result<Value, StoreError> {
        let Some(client) = &self.client else {
            return Ok(Value::Array(Vec::new()));
        };
        let since = Utc::now() - chrono::Duration::hours(hours as i64);
        let url = format!(
            "{}/rest/v1/trades?ts=gte.{}&order=ts.desc&limit=200",
            self.url,
            since.to_rfc3339()
        );
        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Database(format!(
                "trades: {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Realised P&L over the window (`pnl [hours]`)
    pub async fn fetch_pnl(&self, hours: u32) -> Result<f64, StoreError> {
        let Some(client) = &self.client else {
            return Ok(0.0);
        };
        let since = Utc::now() - chrono::Duration::hours(hours as i64);
        let url = format!(
            "{}/rest/v1/positions?select=realized_pnl&status=eq.Closed&closed_at=gte.{}",
            self.url,
            since.to_rfc3339()
        );
        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Database(format!(
                "positions: {}",
                response.status()
            )));
        }
        let rows: Vec<Value> = response.json().await?;
        Ok(rows
            .iter()
            .filter_map(|r| r["realized_pnl"].as_f64())
            .sum())
    }
}

// ============================================================================
// Batch writer
// ============================================================================

/// Buffers edge and opportunity rows off the hot path. `queue_*` returns
/// immediately; flushing happens here or in the periodic task.
pub struct EdgeBatchWriter {
    store: Arc<Store>,
    edges: Mutex<Vec<EdgeRow>>,
    opportunities: Mutex<Vec<Opportunity>>,
}

impl EdgeBatchWriter {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            edges: Mutex::new(Vec::with_capacity(BATCH_SIZE)),
            opportunities: Mutex::new(Vec::with_capacity(BATCH_SIZE)),
        }
    }

    pub async fn queue_edge(&self, row: EdgeRow) {
        let full = {
            let mut buf = self.edges.lock().await;
            buf.push(row);
            buf.len() >= BATCH_SIZE
        };
        if full {
            self.flush_edges().await;
        }
    }

    pub async fn queue_opportunity(&self, row: Opportunity) {
        let full = {
            let mut buf = self.opportunities.lock().await;
            buf.push(row);
            buf.len() >= BATCH_SIZE
        };
        if full {
            self.flush_opportunities().await;
        }
    }

    pub async fn flush(&self) {
        self.flush_edges().await;
        self.flush_opportunities().await;
    }

    async fn flush_edges(&self) {
        let rows: Vec<EdgeRow> = {
            let mut buf = self.edges.lock().await;
            std::mem::take(&mut *buf)
        };
        if rows.is_empty() {
            return;
        }
        if let Err(e) = self.store.insert_edges(&rows).await {
            warn!(error = %e, dropped = rows.len(), "Edge batch flush failed");
        }
    }

    async fn flush_opportunities(&self) {
        let rows: Vec<Opportunity> = {
            let mut buf = self.opportunities.lock().await;
            std::mem::take(&mut *buf)
        };
        if rows.is_empty() {
            return;
        }
        if let Err(e) = self.store.insert_opportunities(&rows).await {
            warn!(error = %e, dropped = rows.len(), "Opportunity batch flush failed");
        }
    }

    pub async fn pending_edges(&self) -> usize {
        self.edges.lock().await.len()
    }
}

/// Periodic flusher; drains both buffers one last time on shutdown.
pub async fn batch_writer_task(
    writer: Arc<EdgeBatchWriter>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(FLUSH_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                writer.flush().await;
                info!("Batch writer drained");
                break;
            }
            _ = interval.tick() => {
                writer.flush().await;
            }
        }
    }
}
