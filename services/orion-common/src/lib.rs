//! Orion Common - Shared configuration, errors, and logging for the Orion
//! screener services.
//!
//! This crate provides:
//! - Configuration types, modular loading, and environment overrides
//! - Error types and context helpers
//! - Logging setup with noise filtering
//! - Small string/duration utilities

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod config_loader;
pub mod error;
pub mod logging;
pub mod util;

pub use config::{
    BrowserConfig, FieldAliasConfig, FirebaseConfig, ObservabilityConfig, OrionConfig,
    RunnerConfig, ScreenerConfig, TelegramConfig, TradingConfig, MAX_GLOBAL_TIMEOUT_SECS,
    MAX_RETENTION_HOURS,
};
pub use error::{Error, Result};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::OrionConfig;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
}
