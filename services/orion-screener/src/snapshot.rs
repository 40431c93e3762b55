//! Timestamped snapshots and their integrity chain.
//!
//! Each snapshot hash covers the previous hash and the canonical JSON of the
//! coin map, so a reader can tell whether snapshots were written in sequence.
//! Nothing verifies the chain on read.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::normalizer::CoinRecord;

/// Key format of `snapshots/<key>`; sorts chronologically as a string.
pub const SNAPSHOT_KEY_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

pub fn snapshot_key(ts: DateTime<Utc>) -> String {
    ts.format(SNAPSHOT_KEY_FORMAT).to_string()
}

/// Parse a snapshot key back into a UTC timestamp.
pub fn parse_snapshot_key(key: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(key, SNAPSHOT_KEY_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

// ============================================================================
// Snapshot
// ============================================================================

/// All coins captured in one fetch cycle.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub key: String,
    pub taken_at: DateTime<Utc>,
    pub coins: BTreeMap<String, CoinRecord>,
    pub hash: String,
    pub prev_hash: Option<String>,
}

impl Snapshot {
    /// Symbol → stored document map.
    pub fn coin_documents(&self) -> Map<String, Value> {
        coin_documents(&self.coins)
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }
}

fn coin_documents(coins: &BTreeMap<String, CoinRecord>) -> Map<String, Value> {
    coins
        .iter()
        .map(|(symbol, record)| (symbol.clone(), record.to_document()))
        .collect()
}

/// Compact JSON of the coin documents with sorted keys.
pub fn canonical_json(coins: &BTreeMap<String, CoinRecord>) -> String {
    Value::Object(coin_documents(coins)).to_string()
}

/// `sha256_hex(prev_hash || canonical_json(coins))`
pub fn chain_hash(prev_hash: Option<&str>, coins: &BTreeMap<String, CoinRecord>) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(canonical_json(coins).as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Chain
// ============================================================================

/// Links consecutive snapshots by hash.
#[derive(Debug, Clone, Default)]
pub struct SnapshotChain {
    last_hash: Option<String>,
}

impl SnapshotChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue a chain whose last hash was persisted earlier.
    pub fn resume(last_hash: Option<String>) -> Self {
        Self {
            last_hash: last_hash.filter(|h| !h.is_empty()),
        }
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    /// Seal the next snapshot and advance the chain.
    pub fn next(&mut self, coins: BTreeMap<String, CoinRecord>, taken_at: DateTime<Utc>) -> Snapshot {
        let prev_hash = self.last_hash.take();
        let hash = chain_hash(prev_hash.as_deref(), &coins);
        self.last_hash = Some(hash.clone());

        Snapshot {
            key: snapshot_key(taken_at),
            taken_at,
            coins,
            hash,
            prev_hash,
        }
    }
}

// ============================================================================
// Retention
// ============================================================================

/// Pick the snapshot keys to delete.
///
/// A key expires when it is older than `retention`, or when `max_keep` is set
/// and newer snapshots already fill the quota. Keys that do not parse as
/// timestamps are never selected. Result is oldest first.
pub fn select_expired(
    keys: &[String],
    now: DateTime<Utc>,
    retention: Duration,
    max_keep: Option<usize>,
) -> Vec<String> {
    let mut dated: Vec<(DateTime<Utc>, &String)> = keys
        .iter()
        .filter_map(|key| parse_snapshot_key(key).map(|ts| (ts, key)))
        .collect();

    // Newest first so the quota keeps the most recent snapshots
    dated.sort_by(|a, b| b.0.cmp(&a.0));

    let mut expired: Vec<(DateTime<Utc>, &String)> = dated
        .into_iter()
        .enumerate()
        .filter(|(rank, (ts, _))| {
            now.signed_duration_since(*ts) > retention || max_keep.is_some_and(|max| *rank >= max)
        })
        .map(|(_, entry)| entry)
        .collect();

    expired.sort_by(|a, b| a.0.cmp(&b.0));
    expired.into_iter().map(|(_, key)| key.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::Normalizer;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn coins(price: f64) -> BTreeMap<String, CoinRecord> {
        Normalizer::default().normalize(
            &json!([{"symbol": "BTC", "price": price}, {"symbol": "ETH", "price": 3000}]),
            ts(12, 0, 0),
        )
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_key_round_trip() {
        let at = ts(9, 5, 7);
        let key = snapshot_key(at);
        assert_eq!(key, "2024-05-01_09-05-07");
        assert_eq!(parse_snapshot_key(&key), Some(at));
        assert_eq!(parse_snapshot_key("latest"), None);
        assert_eq!(parse_snapshot_key("2024-05-01T09:05:07"), None);
    }

    #[test]
    fn test_chain_links_prev_hash() {
        let mut chain = SnapshotChain::new();
        let first = chain.next(coins(1.0), ts(12, 0, 0));
        let second = chain.next(coins(2.0), ts(12, 1, 0));

        assert!(first.prev_hash.is_none());
        assert_eq!(second.prev_hash.as_deref(), Some(first.hash.as_str()));
        assert_eq!(chain.last_hash(), Some(second.hash.as_str()));
        assert_eq!(second.key, "2024-05-01_12-01-00");
        assert_eq!(first.hash.len(), 64);
    }

    #[test]
    fn test_hash_is_stable_for_equal_input() {
        assert_eq!(chain_hash(Some("abc"), &coins(1.0)), chain_hash(Some("abc"), &coins(1.0)));
        assert_ne!(chain_hash(Some("abc"), &coins(1.0)), chain_hash(Some("abd"), &coins(1.0)));
        assert_ne!(chain_hash(None, &coins(1.0)), chain_hash(None, &coins(1.5)));
    }

    #[test]
    fn test_resume_continues_chain() {
        let mut chain = SnapshotChain::resume(Some("feed".into()));
        let snap = chain.next(coins(1.0), ts(12, 0, 0));
        assert_eq!(snap.prev_hash.as_deref(), Some("feed"));
        assert_eq!(snap.hash, chain_hash(Some("feed"), &snap.coins));

        assert!(SnapshotChain::resume(Some(String::new())).last_hash().is_none());
    }

    #[test]
    fn test_canonical_json_is_sorted() {
        let json = canonical_json(&coins(1.0));
        assert!(json.find("\"BTC\"").unwrap() < json.find("\"ETH\"").unwrap());
    }

    #[test]
    fn test_select_expired_by_age() {
        let now = ts(12, 0, 0) + Duration::hours(24);
        let all = keys(&[
            "2024-05-01_11-00-00",
            "2024-05-01_12-00-00",
            "2024-05-01_13-00-00",
            "2024-05-02_11-59-00",
        ]);

        let expired = select_expired(&all, now, Duration::hours(24), None);
        assert_eq!(expired, keys(&["2024-05-01_11-00-00"]));
    }

    #[test]
    fn test_select_expired_by_count() {
        let now = ts(12, 0, 0);
        let all = keys(&[
            "2024-05-01_11-58-00",
            "2024-05-01_11-56-00",
            "2024-05-01_11-59-00",
            "2024-05-01_11-57-00",
        ]);

        let expired = select_expired(&all, now, Duration::hours(24), Some(2));
        assert_eq!(expired, keys(&["2024-05-01_11-56-00", "2024-05-01_11-57-00"]));
    }

    #[test]
    fn test_unparsable_keys_are_kept() {
        let now = ts(12, 0, 0) + Duration::days(30);
        let all = keys(&["latest", "2024-05-01_12-00-00", "backup-2020"]);

        let expired = select_expired(&all, now, Duration::hours(24), Some(0));
        assert_eq!(expired, keys(&["2024-05-01_12-00-00"]));
    }
}
