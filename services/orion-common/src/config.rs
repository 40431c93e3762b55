//! Configuration management for the Orion services.
//!
//! The screener reads `~/.orion/config.json` (all fields optional), merges
//! `~/.orion/secrets.json` into it, then applies environment overrides. In CI
//! the config file is usually absent and everything comes from the
//! environment.
//!
//! # Environment Variable Mapping
//!
//! ## Firebase
//! - `FIREBASE_KEY_JSON` → firebase.credentials_json
//! - `FIREBASE_DATABASE_URL` → firebase.database_url
//! - `FIREBASE_DATABASE_SECRET` → firebase.database_secret
//! - `ORION_ROOT_PATH` → firebase.root_path
//! - `ORION_RETENTION_HOURS` → firebase.snapshot_retention_hours
//! - `ORION_CLEANUP_INTERVAL` → firebase.cleanup_interval_secs
//!
//! ## Screener
//! - `ORION_API_URL` → screener.api_url
//! - `ORION_UI_URL` → screener.ui_url
//! - `ORION_COOKIES_JSON` → screener.cookies_json
//! - `ORION_REQUEST_TIMEOUT` → screener.request_timeout_secs
//! - `ORION_BROWSER_FALLBACK` → browser.enabled
//!
//! ## Runner
//! - `ORION_GLOBAL_TIMEOUT` → runner.global_timeout_secs
//! - `ORION_FETCH_INTERVAL` → runner.fetch_interval_secs
//!
//! ## Telegram / Trading / Logging
//! - `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID` → telegram.*
//! - `ORION_TRADING_ENABLED` → trading.enabled
//! - `ORION_LOG_LEVEL`, `ORION_LOG_FORMAT` → observability.*

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config_loader::load_layers;
use crate::util::{parse_bool, parse_duration_secs};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".orion"),
        |dirs| dirs.home_dir().join(".orion"),
    )
}

// ============================================================================
// Observability
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty, plain)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets pinned to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "plain".into()
}

// ============================================================================
// Screener (fetcher + normalizer)
// ============================================================================

/// Screener API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenerConfig {
    /// JSON endpoint polled every cycle
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// UI page, used as referer and for the browser fallback
    #[serde(default = "default_ui_url")]
    pub ui_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Extra attempts for recoverable fetch errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay of the exponential retry backoff
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// User-agent pool rotated between requests
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,

    /// Initial cookies as JSON (object or list of name/value pairs)
    #[serde(default)]
    pub cookies_json: Option<String>,

    /// Ordered field alias overrides for the normalizer
    #[serde(default)]
    pub field_aliases: FieldAliasConfig,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ui_url: default_ui_url(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            user_agents: default_user_agents(),
            cookies_json: None,
            field_aliases: FieldAliasConfig::default(),
        }
    }
}

fn default_api_url() -> String {
    "https://orionterminal.com/api/screener".into()
}

fn default_ui_url() -> String {
    "https://orionterminal.com/screener".into()
}

fn default_request_timeout() -> u64 {
    20
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64)".into(),
        "Mozilla/5.0 (X11; Linux x86_64)".into(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)".into(),
    ]
}

/// Ordered fallback key lists per semantic field.
///
/// An empty list means "use the built-in defaults".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldAliasConfig {
    #[serde(default)]
    pub symbol: Vec<String>,
    #[serde(default)]
    pub price: Vec<String>,
    #[serde(default)]
    pub volume: Vec<String>,
    #[serde(default)]
    pub change: Vec<String>,
    #[serde(default)]
    pub rsi: Vec<String>,
}

// ============================================================================
// Browser fallback
// ============================================================================

/// Headless browser (cookie harvest) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Enable the cookie-harvest fallback when the API refuses us
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub headless: bool,

    /// Explicit Chrome/Chromium binary (autodetected when unset)
    #[serde(default)]
    pub chrome_executable: Option<String>,

    #[serde(default = "default_window_width")]
    pub window_width: u32,

    #[serde(default = "default_window_height")]
    pub window_height: u32,

    /// Hard limit for the initial page load
    #[serde(default = "default_page_load_timeout")]
    pub page_load_timeout_secs: u64,

    /// Hard limit for each injected script
    #[serde(default = "default_js_timeout")]
    pub js_timeout_secs: u64,

    /// Wait after page load before interacting
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,

    /// Number of bottom → right → top scroll passes
    #[serde(default = "default_scroll_passes")]
    pub scroll_passes: u32,

    #[serde(default = "default_scroll_pause_ms")]
    pub scroll_pause_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            headless: true,
            chrome_executable: None,
            window_width: default_window_width(),
            window_height: default_window_height(),
            page_load_timeout_secs: default_page_load_timeout(),
            js_timeout_secs: default_js_timeout(),
            settle_secs: default_settle_secs(),
            scroll_passes: default_scroll_passes(),
            scroll_pause_ms: default_scroll_pause_ms(),
        }
    }
}

fn default_window_width() -> u32 {
    5000
}

fn default_window_height() -> u32 {
    3000
}

fn default_page_load_timeout() -> u64 {
    25
}

fn default_js_timeout() -> u64 {
    8
}

fn default_settle_secs() -> u64 {
    3
}

fn default_scroll_passes() -> u32 {
    2
}

fn default_scroll_pause_ms() -> u64 {
    800
}

// ============================================================================
// Firebase sink
// ============================================================================

/// Firebase Realtime Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirebaseConfig {
    /// Database URL; when empty the service runs against an in-memory store
    #[serde(default)]
    pub database_url: String,

    /// Root node all documents live under
    #[serde(default = "default_root_path")]
    pub root_path: String,

    /// Service-account JSON (the `FIREBASE_KEY_JSON` secret)
    #[serde(default)]
    pub credentials_json: Option<String>,

    /// Legacy database secret, used when no service account is given
    #[serde(default)]
    pub database_secret: Option<String>,

    #[serde(default = "default_firebase_timeout")]
    pub request_timeout_secs: u64,

    /// Snapshots older than this are deleted by cleanup (1..=MAX_RETENTION_HOURS)
    #[serde(default = "default_retention_hours")]
    pub snapshot_retention_hours: u64,

    /// Keep at most this many snapshots (newest first)
    #[serde(default)]
    pub max_snapshots: Option<usize>,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Value of `metadata.source`
    #[serde(default = "default_source_label")]
    pub source_label: String,
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            root_path: default_root_path(),
            credentials_json: None,
            database_secret: None,
            request_timeout_secs: default_firebase_timeout(),
            snapshot_retention_hours: default_retention_hours(),
            max_snapshots: None,
            cleanup_interval_secs: default_cleanup_interval(),
            source_label: default_source_label(),
        }
    }
}

fn default_root_path() -> String {
    "screener_orion".into()
}

fn default_firebase_timeout() -> u64 {
    20
}

fn default_retention_hours() -> u64 {
    24
}

fn default_cleanup_interval() -> u64 {
    900
}

fn default_source_label() -> String {
    "orion_xhr_api".into()
}

// ============================================================================
// Runner
// ============================================================================

/// Upper bound for `firebase.snapshot_retention_hours` (ten years).
pub const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;

/// Upper bound for `runner.global_timeout_secs` (one day).
pub const MAX_GLOBAL_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Polling loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Total run budget; kept under the CI job limit (1..=MAX_GLOBAL_TIMEOUT_SECS)
    #[serde(default = "default_global_timeout")]
    pub global_timeout_secs: u64,

    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_secs: u64,

    /// Minimum remaining budget required to start a browser fallback
    #[serde(default = "default_fallback_margin")]
    pub fallback_margin_secs: u64,

    /// Consecutive failed cycles before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Pause after the breaker opens
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,

    /// Heartbeat period of the status document
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            global_timeout_secs: default_global_timeout(),
            fetch_interval_secs: default_fetch_interval(),
            fallback_margin_secs: default_fallback_margin(),
            failure_threshold: default_failure_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown(),
            status_interval_secs: default_status_interval(),
        }
    }
}

fn default_global_timeout() -> u64 {
    270
}

fn default_fetch_interval() -> u64 {
    60
}

fn default_fallback_margin() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_breaker_cooldown() -> u64 {
    30
}

fn default_status_interval() -> u64 {
    60
}

// ============================================================================
// Telegram
// ============================================================================

/// Telegram alert configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub bot_token: Option<String>,

    #[serde(default)]
    pub chat_id: Option<String>,

    #[serde(default = "default_telegram_api")]
    pub api_base: String,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Send a summary message when the run ends
    #[serde(default)]
    pub notify_on_finish: bool,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bot_token: None,
            chat_id: None,
            api_base: default_telegram_api(),
            retry_count: default_retry_count(),
            notify_on_finish: false,
        }
    }
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".into()
}

fn default_retry_count() -> u32 {
    3
}

// ============================================================================
// Trading
// ============================================================================

/// RSI-threshold paper trading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Normalized symbols to trade (e.g. `BTCUSDT`)
    #[serde(default)]
    pub symbols: Vec<String>,

    #[serde(default = "default_buy_below")]
    pub buy_below: f64,

    #[serde(default = "default_sell_above")]
    pub sell_above: f64,

    /// Quote currency spent per buy
    #[serde(default = "default_order_quote_amount")]
    pub order_quote_amount: f64,

    #[serde(default = "default_starting_cash")]
    pub starting_cash: f64,

    /// Fee charged on each fill, as a fraction
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            symbols: Vec::new(),
            buy_below: default_buy_below(),
            sell_above: default_sell_above(),
            order_quote_amount: default_order_quote_amount(),
            starting_cash: default_starting_cash(),
            fee_rate: default_fee_rate(),
        }
    }
}

fn default_buy_below() -> f64 {
    30.0
}

fn default_sell_above() -> f64 {
    70.0
}

fn default_order_quote_amount() -> f64 {
    100.0
}

fn default_starting_cash() -> f64 {
    1000.0
}

fn default_fee_rate() -> f64 {
    0.001
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrionConfig {
    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub screener: ScreenerConfig,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub firebase: FirebaseConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub trading: TradingConfig,
}

impl OrionConfig {
    /// Load configuration from the default directory.
    ///
    /// Missing files are not an error; defaults apply.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(&config_dir())
    }

    /// Load configuration (config.json + secrets.json) from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let value = load_layers(dir)?;
        serde_json::from_value(value)
            .with_context(|| format!("Failed to parse config from {}", dir.display()))
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparsable numeric values are logged and ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // Firebase
        if let Some(v) = non_empty("FIREBASE_KEY_JSON") {
            self.firebase.credentials_json = Some(v);
        }
        if let Some(v) = non_empty("FIREBASE_DATABASE_URL") {
            self.firebase.database_url = v;
        }
        if let Some(v) = non_empty("FIREBASE_DATABASE_SECRET") {
            self.firebase.database_secret = Some(v);
        }
        if let Some(v) = non_empty("ORION_ROOT_PATH") {
            self.firebase.root_path = v;
        }
        if let Some(v) = non_empty("ORION_RETENTION_HOURS") {
            match v.trim().parse() {
                Ok(hours) => self.firebase.snapshot_retention_hours = hours,
                Err(_) => tracing::warn!(value = %v, "Ignoring invalid ORION_RETENTION_HOURS"),
            }
        }
        if let Some(v) = non_empty("ORION_CLEANUP_INTERVAL") {
            apply_duration("ORION_CLEANUP_INTERVAL", &v, &mut self.firebase.cleanup_interval_secs);
        }

        // Screener
        if let Some(v) = non_empty("ORION_API_URL") {
            self.screener.api_url = v;
        }
        if let Some(v) = non_empty("ORION_UI_URL") {
            self.screener.ui_url = v;
        }
        if let Some(v) = non_empty("ORION_COOKIES_JSON") {
            self.screener.cookies_json = Some(v);
        }
        if let Some(v) = non_empty("ORION_REQUEST_TIMEOUT") {
            apply_duration("ORION_REQUEST_TIMEOUT", &v, &mut self.screener.request_timeout_secs);
        }
        if let Some(v) = non_empty("ORION_BROWSER_FALLBACK") {
            if let Some(enabled) = parse_bool(&v) {
                self.browser.enabled = enabled;
            }
        }

        // Runner
        if let Some(v) = non_empty("ORION_GLOBAL_TIMEOUT") {
            apply_duration("ORION_GLOBAL_TIMEOUT", &v, &mut self.runner.global_timeout_secs);
        }
        if let Some(v) = non_empty("ORION_FETCH_INTERVAL") {
            apply_duration("ORION_FETCH_INTERVAL", &v, &mut self.runner.fetch_interval_secs);
        }

        // Telegram
        if let Some(v) = non_empty("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(v);
        }
        if let Some(v) = non_empty("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = Some(v);
        }

        // Trading
        if let Some(v) = non_empty("ORION_TRADING_ENABLED") {
            if let Some(enabled) = parse_bool(&v) {
                self.trading.enabled = enabled;
            }
        }

        // Logging
        if let Some(v) = non_empty("ORION_LOG_LEVEL") {
            self.observability.log_level = v;
        }
        if let Some(v) = non_empty("ORION_LOG_FORMAT") {
            self.observability.log_format = v;
        }
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !(1..=MAX_GLOBAL_TIMEOUT_SECS).contains(&self.runner.global_timeout_secs) {
            return Err(Error::Config(format!(
                "runner.global_timeout_secs must be between 1 and {MAX_GLOBAL_TIMEOUT_SECS}, got {}",
                self.runner.global_timeout_secs
            )));
        }
        if !(1..=MAX_RETENTION_HOURS).contains(&self.firebase.snapshot_retention_hours) {
            return Err(Error::Config(format!(
                "firebase.snapshot_retention_hours must be between 1 and {MAX_RETENTION_HOURS}, got {}",
                self.firebase.snapshot_retention_hours
            )));
        }
        if self.runner.fetch_interval_secs == 0 {
            return Err(Error::Config("runner.fetch_interval_secs must be > 0".into()));
        }
        if self.screener.request_timeout_secs == 0 {
            return Err(Error::Config("screener.request_timeout_secs must be > 0".into()));
        }
        if self.screener.user_agents.is_empty() {
            return Err(Error::Config("screener.user_agents must not be empty".into()));
        }
        url::Url::parse(&self.screener.api_url)
            .map_err(|e| Error::Config(format!("screener.api_url: {e}")))?;
        if !self.firebase.database_url.is_empty() {
            url::Url::parse(&self.firebase.database_url)
                .map_err(|e| Error::Config(format!("firebase.database_url: {e}")))?;
        }
        if let Some(raw) = self.firebase.credentials_json.as_deref().filter(|v| !v.trim().is_empty()) {
            let parsed: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| Error::Credentials(format!("FIREBASE_KEY_JSON is not valid JSON: {e}")))?;
            if parsed.get("client_email").is_none() || parsed.get("private_key").is_none() {
                return Err(Error::Credentials(
                    "FIREBASE_KEY_JSON needs client_email and private_key".into(),
                ));
            }
        }
        if self.trading.enabled {
            if self.trading.buy_below >= self.trading.sell_above {
                return Err(Error::Config(format!(
                    "trading.buy_below ({}) must be below trading.sell_above ({})",
                    self.trading.buy_below, self.trading.sell_above
                )));
            }
            if self.trading.order_quote_amount <= 0.0 {
                return Err(Error::Config("trading.order_quote_amount must be > 0".into()));
            }
        }
        Ok(())
    }

    /// Whether a remote database is configured.
    pub fn has_remote_store(&self) -> bool {
        !self.firebase.database_url.trim().is_empty()
    }

    /// Whether Telegram alerts can be sent.
    pub fn telegram_ready(&self) -> bool {
        self.telegram.enabled
            && self.telegram.bot_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.telegram.chat_id.as_deref().is_some_and(|c| !c.is_empty())
    }
}

fn apply_duration(name: &str, value: &str, target: &mut u64) {
    match parse_duration_secs(value) {
        Ok(secs) => *target = secs,
        Err(e) => tracing::warn!(variable = name, value = %value, error = %e, "Ignoring invalid duration"),
    }
}
