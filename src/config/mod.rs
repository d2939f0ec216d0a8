//! Configuration loading and logging setup
//!
//! Settings are environment-loaded (12-factor style): call
//! `Settings::from_env()` once at startup after `dotenvy::dotenv()`.

pub mod logging;
pub mod types;

pub use logging::{init_logging, LogFormat};
pub use types::{FeeSchedule, Overrides, Settings, SharedOverrides, TifMode};
