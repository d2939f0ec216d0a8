//! Environment-loaded settings and runtime overrides
//!
//! `Settings` is the immutable boot-time configuration. A small subset
//! (threshold, notional, preferred time-in-force, dry-run) can be changed at
//! runtime through the control surface; those live in `Overrides` behind a
//! shared `RwLock` so the hot path reads them without restarting.

use std::env;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::AppError;

/// Type alias for shared override access across async tasks
pub type SharedOverrides = Arc<RwLock<Overrides>>;

/// Preferred execution mode for the first attempt of a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TifMode {
    /// ALO first, IOC fallback (default)
    Maker,
    /// Skip the maker attempt and go straight to IOC
    Ioc,
}

/// Per-leg fee schedule in basis points
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub perp_maker_bps: f64,
    pub perp_taker_bps: f64,
    pub spot_maker_bps: f64,
    pub spot_taker_bps: f64,
}

impl FeeSchedule {
    /// One-way maker-maker cost
    pub fn maker_maker_bps(&self) -> f64 {
        self.perp_maker_bps + self.spot_maker_bps
    }

    /// One-way taker-taker cost
    pub fn taker_taker_bps(&self) -> f64 {
        self.perp_taker_bps + self.spot_taker_bps
    }

    /// Round-trip cost in the dominant execution mode (taker-taker, open and
    /// close). This is the constant subtracted from raw edges.
    pub fn round_trip_bps(&self) -> f64 {
        2.0 * self.taker_taker_bps()
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            perp_maker_bps: 1.5,
            perp_taker_bps: 4.5,
            spot_maker_bps: 4.0,
            spot_taker_bps: 7.0,
        }
    }
}

/// Runtime-mutable subset of the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overrides {
    pub threshold_bps: f64,
    pub alloc_per_trade_usd: f64,
    pub tif: TifMode,
    pub dry_run: bool,
}

impl Overrides {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            threshold_bps: s.threshold_bps,
            alloc_per_trade_usd: s.alloc_per_trade_usd,
            tif: TifMode::Maker,
            dry_run: s.dry_run,
        }
    }

    pub fn into_shared(self) -> SharedOverrides {
        Arc::new(RwLock::new(self))
    }
}

/// Boot-time configuration, loaded from the environment
#[derive(Debug, Clone)]
pub struct Settings {
    // Instrument
    pub pair_base: String,
    pub pair_quote: String,

    // Strategy
    pub threshold_bps: f64,
    pub spike_extra_bps_for_ioc: f64,
    pub dwell_ms: u64,
    pub cool_down_ms: u64,
    pub observation_threshold_bps: f64,
    pub baseline_window: usize,

    // Sizing
    pub alloc_per_trade_usd: f64,
    pub min_order_notional_usd: f64,
    pub leverage: f64,
    pub max_open_positions: usize,

    // Execution
    pub alo_open_timeout_ms: u64,
    pub alo_close_timeout_ms: u64,
    pub max_hold_ms: u64,
    pub close_threshold_bps: f64,
    pub slippage_bps: f64,
    pub deadman_ms: u64,
    pub max_trades_per_min: usize,
    pub dry_run: bool,

    // Fees
    pub fees: FeeSchedule,

    // Endpoints
    pub hl_info_url: String,
    pub hl_ws_url: String,
    pub control_port: u16,

    // Collaborators (optional)
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl Settings {
    /// Load settings from environment variables, falling back to defaults.
    ///
    /// Call `dotenvy::dotenv()` before this so a local `.env` is honoured.
    pub fn from_env() -> Result<Self, AppError> {
        let settings = Self {
            pair_base: env_str("PAIR_BASE", "HYPE").to_uppercase(),
            pair_quote: env_str("PAIR_QUOTE", "USDC").to_uppercase(),

            threshold_bps: env_f64("THRESHOLD_BPS", 20.0)?,
            spike_extra_bps_for_ioc: env_f64("SPIKE_EXTRA_BPS_FOR_IOC", 7.0)?,
            dwell_ms: env_u64("DWELL_MS", 1_000)?,
            cool_down_ms: env_u64("COOL_DOWN_MS", 2_000)?,
            observation_threshold_bps: env_f64("OBSERVATION_THRESHOLD_BPS", 10.0)?,
            baseline_window: env_u64("BASELINE_WINDOW", 20)? as usize,

            alloc_per_trade_usd: env_f64("ALLOC_PER_TRADE_USD", 10.0)?,
            min_order_notional_usd: env_f64("MIN_ORDER_NOTIONAL_USD", 10.0)?,
            leverage: env_f64("LEVERAGE", 3.0)?,
            max_open_positions: env_u64("MAX_OPEN_POSITIONS", 2)? as usize,

            alo_open_timeout_ms: env_u64("ALO_OPEN_TIMEOUT_MS", 150)?,
            alo_close_timeout_ms: env_u64("ALO_CLOSE_TIMEOUT_MS", 5_000)?,
            max_hold_ms: env_u64("MAX_HOLD_MS", 60_000)?,
            close_threshold_bps: env_f64("CLOSE_THRESHOLD_BPS", 0.0)?,
            slippage_bps: env_f64("SLIPPAGE_BPS", 10.0)?,
            deadman_ms: (env_f64("DEADMAN_SECONDS", 5.0)? * 1_000.0) as u64,
            max_trades_per_min: env_u64("MAX_TRADES_PER_MIN_PER_PAIR", 3)? as usize,
            dry_run: env_bool("DRY_RUN", true),

            fees: FeeSchedule {
                perp_maker_bps: env_f64("PERP_MAKER_BPS", 1.5)?,
                perp_taker_bps: env_f64("PERP_TAKER_BPS", 4.5)?,
                spot_maker_bps: env_f64("SPOT_MAKER_BPS", 4.0)?,
                spot_taker_bps: env_f64("SPOT_TAKER_BPS", 7.0)?,
            },

            hl_info_url: env_str("HL_INFO_URL", "https://api.hyperliquid.xyz/info"),
            hl_ws_url: env_str("HL_WS_URL", "wss://api.hyperliquid.xyz/ws"),
            control_port: env_u64("CONTROL_PORT", 8080)? as u16,

            supabase_url: env_opt("SUPABASE_URL"),
            supabase_anon_key: env_opt("SUPABASE_ANON_KEY"),
            telegram_token: env_opt("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_opt("TELEGRAM_CHAT_ID"),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration rules
    pub fn validate(&self) -> Result<(), AppError> {
        if self.pair_base.trim().is_empty() {
            return Err(AppError::Config("PAIR_BASE cannot be empty".to_string()));
        }
        if self.threshold_bps <= 0.0 {
            return Err(AppError::Config(format!(
                "THRESHOLD_BPS must be > 0 (got {})",
                self.threshold_bps
            )));
        }
        if self.leverage < 1.0 || self.leverage > 100.0 {
            return Err(AppError::Config(format!(
                "LEVERAGE must be in 1-100 (got {})",
                self.leverage
            )));
        }
        if self.alloc_per_trade_usd <= 0.0 {
            return Err(AppError::Config(format!(
                "ALLOC_PER_TRADE_USD must be > 0 (got {})",
                self.alloc_per_trade_usd
            )));
        }
        if self.max_trades_per_min == 0 {
            return Err(AppError::Config(
                "MAX_TRADES_PER_MIN_PER_PAIR must be >= 1".to_string(),
            ));
        }
        if self.baseline_window == 0 {
            return Err(AppError::Config("BASELINE_WINDOW must be >= 1".to_string()));
        }
        if self.observation_threshold_bps > self.threshold_bps {
            return Err(AppError::Config(format!(
                "OBSERVATION_THRESHOLD_BPS ({}) must not exceed THRESHOLD_BPS ({})",
                self.observation_threshold_bps, self.threshold_bps
            )));
        }
        let f = &self.fees;
        if f.perp_maker_bps < 0.0
            || f.perp_taker_bps < 0.0
            || f.spot_maker_bps < 0.0
            || f.spot_taker_bps < 0.0
        {
            return Err(AppError::Config("fee rates must be non-negative".to_string()));
        }
        Ok(())
    }

    /// Spot market symbol, e.g. "HYPE/USDC"
    pub fn spot_symbol(&self) -> String {
        format!("{}/{}", self.pair_base, self.pair_quote)
    }

    /// Defaults without touching the environment. Used by tests.
    pub fn defaults() -> Self {
        Self {
            pair_base: "HYPE".to_string(),
            pair_quote: "USDC".to_string(),
            threshold_bps: 20.0,
            spike_extra_bps_for_ioc: 7.0,
            dwell_ms: 1_000,
            cool_down_ms: 2_000,
            observation_threshold_bps: 10.0,
            baseline_window: 20,
            alloc_per_trade_usd: 10.0,
            min_order_notional_usd: 10.0,
            leverage: 3.0,
            max_open_positions: 2,
            alo_open_timeout_ms: 150,
            alo_close_timeout_ms: 5_000,
            max_hold_ms: 60_000,
            close_threshold_bps: 0.0,
            slippage_bps: 10.0,
            deadman_ms: 5_000,
            max_trades_per_min: 3,
            dry_run: true,
            fees: FeeSchedule::default(),
            hl_info_url: "https://api.hyperliquid.xyz/info".to_string(),
            hl_ws_url: "wss://api.hyperliquid.xyz/ws".to_string(),
            control_port: 8080,
            supabase_url: None,
            supabase_anon_key: None,
            telegram_token: None,
            telegram_chat_id: None,
        }
    }
}

// ============================================================================
// Env parsing helpers
// ============================================================================

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_f64(key: &str, default: f64) -> Result<f64, AppError> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<f64>()
            .map_err(|_| AppError::Config(format!("{key} must be a number (got '{v}')"))),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, AppError> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map_err(|_| AppError::Config(format!("{key} must be an integer (got '{v}')"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let s = Settings::defaults();
        assert!(s.validate().is_ok());
        assert_eq!(s.spot_symbol(), "HYPE/USDC");
        assert_eq!(s.deadman_ms, 5_000);
    }

    #[test]
    fn test_round_trip_fee_is_taker_taker_doubled() {
        let fees = FeeSchedule::default();
        assert!((fees.taker_taker_bps() - 11.5).abs() < 1e-9);
        assert!((fees.round_trip_bps() - 23.0).abs() < 1e-9);
        assert!((fees.maker_maker_bps() - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut s = Settings::defaults();
        s.threshold_bps = 0.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_leverage_out_of_range() {
        let mut s = Settings::defaults();
        s.leverage = 0.5;
        assert!(s.validate().is_err());
        s.leverage = 150.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_observation_above_trading_threshold() {
        let mut s = Settings::defaults();
        s.observation_threshold_bps = 25.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_fees() {
        let mut s = Settings::defaults();
        s.fees.spot_taker_bps = -1.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_overrides_track_settings() {
        let s = Settings::defaults();
        let o = Overrides::from_settings(&s);
        assert_eq!(o.threshold_bps, s.threshold_bps);
        assert_eq!(o.alloc_per_trade_usd, s.alloc_per_trade_usd);
        assert_eq!(o.tif, TifMode::Maker);
        assert!(o.dry_run);
    }

    #[test]
    fn test_env_f64_parses_and_defaults() {
        std::env::remove_var("BASIS_BOT_TEST_F64");
        assert_eq!(env_f64("BASIS_BOT_TEST_F64", 7.5).unwrap(), 7.5);
        std::env::set_var("BASIS_BOT_TEST_F64", "12.25");
        assert_eq!(env_f64("BASIS_BOT_TEST_F64", 7.5).unwrap(), 12.25);
        std::env::set_var("BASIS_BOT_TEST_F64", "not-a-number");
        assert!(env_f64("BASIS_BOT_TEST_F64", 7.5).is_err());
        std::env::remove_var("BASIS_BOT_TEST_F64");
    }

    #[test]
    fn test_env_bool_accepts_common_truthy_values() {
        std::env::set_var("BASIS_BOT_TEST_BOOL", "yes");
        assert!(env_bool("BASIS_BOT_TEST_BOOL", false));
        std::env::set_var("BASIS_BOT_TEST_BOOL", "0");
        assert!(!env_bool("BASIS_BOT_TEST_BOOL", true));
        std::env::remove_var("BASIS_BOT_TEST_BOOL");
    }
}
