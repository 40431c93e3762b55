//! Heuristic normalization of screener payloads.
//!
//! The screener has changed its response shape more than once, so nothing
//! here assumes a schema. Rows are located by shape detection, symbols by an
//! ordered key list, and metrics through per-field alias lists. Every raw
//! field is kept alongside the normalized ones.

use chrono::{DateTime, SecondsFormat, Utc};
use orion_common::FieldAliasConfig;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

static SYMBOL_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z0-9_]+$").unwrap());

/// Keys that wrap the row collection.
const CONTAINER_KEYS: &[&str] = &["data", "rows", "result", "items", "coins"];

/// How many container levels are unwrapped before giving up.
const MAX_CONTAINER_DEPTH: usize = 4;

const DEFAULT_SYMBOL_KEYS: &[&str] = &["symbol", "market", "pair", "name", "ticker", "s"];
const DEFAULT_PRICE_KEYS: &[&str] = &["price", "last", "lastPrice", "close", "c", "11"];
const DEFAULT_VOLUME_KEYS: &[&str] = &["volume", "volume24h", "quoteVolume", "vol", "v", "10"];
const DEFAULT_CHANGE_KEYS: &[&str] = &["change24h", "change", "priceChangePercent", "pct", "chg", "6"];
const DEFAULT_RSI_KEYS: &[&str] = &["rsi", "rsi14", "rsi_14", "RSI", "rsi_1h"];

/// Characters the Realtime Database rejects in keys.
const ILLEGAL_KEY_CHARS: &[char] = &['.', '$', '#', '[', ']', '/'];

// ============================================================================
// Coin Record
// ============================================================================

/// Semantic metrics extracted from a row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoinMetrics {
    pub price: Option<f64>,
    pub volume: Option<f64>,
    pub change_pct: Option<f64>,
    pub rsi: Option<f64>,
}

/// One normalized screener row.
#[derive(Debug, Clone, PartialEq)]
pub struct CoinRecord {
    pub symbol: String,
    pub updated_utc: String,
    pub metrics: CoinMetrics,
    pub raw: Map<String, Value>,
}

impl CoinRecord {
    /// Document stored under `coins/<symbol>` and inside snapshots.
    ///
    /// Raw fields first, normalized fields on top; missing metrics are left
    /// out rather than written as null.
    pub fn to_document(&self) -> Value {
        let mut doc = firebase_safe_map(self.raw.clone());

        doc.insert("symbol".into(), Value::String(self.symbol.clone()));
        doc.insert("updated_utc".into(), Value::String(self.updated_utc.clone()));

        let metrics = [
            ("price", self.metrics.price),
            ("volume", self.metrics.volume),
            ("change_24h", self.metrics.change_pct),
            ("rsi", self.metrics.rsi),
        ];
        for (key, value) in metrics {
            if let Some(number) = value.and_then(serde_json::Number::from_f64) {
                doc.insert(key.into(), Value::Number(number));
            }
        }

        Value::Object(doc)
    }
}

/// Replace characters the database rejects in keys with `_`.
pub fn firebase_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if ILLEGAL_KEY_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Rewrite every key of `map` with [`firebase_key`].
///
/// Empty keys are dropped. When two keys map to the same name, a key that
/// was already legal wins; otherwise the first one seen is kept.
fn firebase_safe_map(map: Map<String, Value>) -> Map<String, Value> {
    let mut safe = Map::new();
    for (raw_key, value) in map {
        let key = firebase_key(&raw_key);
        if key.is_empty() {
            debug!("Dropping empty field name");
            continue;
        }
        if safe.contains_key(&key) && key != raw_key {
            debug!(field = %raw_key, key = %key, "Dropping field that collides after key rewrite");
            continue;
        }
        safe.insert(key, firebase_safe(value));
    }
    safe
}

fn firebase_safe(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(firebase_safe_map(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(firebase_safe).collect()),
        other => other,
    }
}

// ============================================================================
// Field Aliases
// ============================================================================

/// Ordered fallback keys per semantic field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldAliases {
    pub symbol: Vec<String>,
    pub price: Vec<String>,
    pub volume: Vec<String>,
    pub change: Vec<String>,
    pub rsi: Vec<String>,
}

impl Default for FieldAliases {
    fn default() -> Self {
        Self {
            symbol: owned(DEFAULT_SYMBOL_KEYS),
            price: owned(DEFAULT_PRICE_KEYS),
            volume: owned(DEFAULT_VOLUME_KEYS),
            change: owned(DEFAULT_CHANGE_KEYS),
            rsi: owned(DEFAULT_RSI_KEYS),
        }
    }
}

impl FieldAliases {
    /// Configured lists replace the defaults; empty lists keep them.
    pub fn from_config(config: &FieldAliasConfig) -> Self {
        let pick = |configured: &[String], defaults: &[&str]| {
            if configured.is_empty() {
                owned(defaults)
            } else {
                configured.to_vec()
            }
        };

        Self {
            symbol: pick(&config.symbol, DEFAULT_SYMBOL_KEYS),
            price: pick(&config.price, DEFAULT_PRICE_KEYS),
            volume: pick(&config.volume, DEFAULT_VOLUME_KEYS),
            change: pick(&config.change, DEFAULT_CHANGE_KEYS),
            rsi: pick(&config.rsi, DEFAULT_RSI_KEYS),
        }
    }
}

fn owned(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

// ============================================================================
// Parsing helpers
// ============================================================================

/// Parse a JSON number or a formatted numeric string.
///
/// Strings may carry thousands separators, `$`, `%`, `+` and a trailing
/// `K`/`M`/`B` multiplier. Non-finite results are rejected.
pub fn parse_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_numeric_str(s),
        _ => None,
    }?;

    parsed.is_finite().then_some(parsed)
}

fn parse_numeric_str(s: &str) -> Option<f64> {
    let cleaned: String = s
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '%' | '+') && !c.is_whitespace())
        .collect();

    let (digits, multiplier) = match cleaned.chars().last()? {
        'K' | 'k' => (&cleaned[..cleaned.len() - 1], 1e3),
        'M' | 'm' => (&cleaned[..cleaned.len() - 1], 1e6),
        'B' | 'b' => (&cleaned[..cleaned.len() - 1], 1e9),
        _ => (cleaned.as_str(), 1.0),
    };

    digits.parse::<f64>().ok().map(|n| n * multiplier)
}

/// Replace separators and whitespace with `_` and uppercase.
pub fn sanitize_symbol(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if matches!(c, '/' | '-' | '.') || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect::<String>()
        .to_uppercase()
}

pub fn is_valid_symbol(symbol: &str) -> bool {
    SYMBOL_PATTERN.is_match(symbol)
}

// ============================================================================
// Shape detection
// ============================================================================

/// A candidate row plus the dict key it was found under, if any.
#[derive(Debug, Clone, Copy)]
pub struct RawRow<'a> {
    pub key: Option<&'a str>,
    pub value: &'a Value,
}

/// Locate the row collection inside a payload.
pub fn extract_rows(payload: &Value) -> Vec<RawRow<'_>> {
    extract_rows_at(payload, 0)
}

fn extract_rows_at(value: &Value, depth: usize) -> Vec<RawRow<'_>> {
    match value {
        Value::Array(items) => items.iter().map(|value| RawRow { key: None, value }).collect(),
        Value::Object(map) => {
            let container = CONTAINER_KEYS.iter().find_map(|key| match map.get(*key) {
                Some(inner @ (Value::Array(_) | Value::Object(_))) => Some(inner),
                _ => None,
            });
            if let Some(inner) = container {
                return if depth < MAX_CONTAINER_DEPTH {
                    extract_rows_at(inner, depth + 1)
                } else {
                    Vec::new()
                };
            }

            let objects = map.values().filter(|v| v.is_object()).count();
            if objects > 0 && objects * 2 > map.len() {
                map.iter()
                    .map(|(k, value)| RawRow {
                        key: Some(k.as_str()),
                        value,
                    })
                    .collect()
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

// ============================================================================
// Normalizer
// ============================================================================

/// Converts raw payloads into symbol → record maps.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    aliases: FieldAliases,
}

impl Normalizer {
    pub fn new(aliases: FieldAliases) -> Self {
        Self { aliases }
    }

    pub fn from_config(config: &FieldAliasConfig) -> Self {
        Self::new(FieldAliases::from_config(config))
    }

    /// Normalize a payload. Later rows with the same symbol replace earlier
    /// ones.
    pub fn normalize(&self, payload: &Value, now: DateTime<Utc>) -> BTreeMap<String, CoinRecord> {
        let updated_utc = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let rows = extract_rows(payload);
        let total = rows.len();

        let mut coins = BTreeMap::new();
        let mut not_object = 0usize;
        let mut no_symbol = 0usize;
        let mut invalid_symbol = 0usize;

        for row in rows {
            let Some(obj) = row.value.as_object() else {
                not_object += 1;
                continue;
            };

            let Some(raw_symbol) = self.resolve_symbol(obj).or(row.key) else {
                no_symbol += 1;
                continue;
            };

            let symbol = sanitize_symbol(raw_symbol);
            if !is_valid_symbol(&symbol) {
                invalid_symbol += 1;
                continue;
            }

            let record = CoinRecord {
                metrics: self.metrics(obj),
                symbol: symbol.clone(),
                updated_utc: updated_utc.clone(),
                raw: obj.clone(),
            };
            coins.insert(symbol, record);
        }

        debug!(
            rows = total,
            coins = coins.len(),
            not_object,
            no_symbol,
            invalid_symbol,
            "Normalized screener payload"
        );

        coins
    }

    fn resolve_symbol<'a>(&self, obj: &'a Map<String, Value>) -> Option<&'a str> {
        self.aliases.symbol.iter().find_map(|key| {
            obj.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
        })
    }

    fn metrics(&self, obj: &Map<String, Value>) -> CoinMetrics {
        CoinMetrics {
            price: first_number(obj, &self.aliases.price),
            volume: first_number(obj, &self.aliases.volume),
            change_pct: first_number(obj, &self.aliases.change),
            rsi: first_number(obj, &self.aliases.rsi),
        }
    }
}

fn first_number(obj: &Map<String, Value>, keys: &[String]) -> Option<f64> {
    keys.iter().find_map(|key| obj.get(key).and_then(parse_number))
}
