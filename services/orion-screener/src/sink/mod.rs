//! Snapshot persistence.
//!
//! [`DocumentStore`] is the hierarchical key/value surface the Realtime
//! Database exposes over REST. [`SnapshotSink`] lays the screener data out
//! under a root node:
//!
//! ```text
//! <root>/coins                  PATCH  latest record per symbol
//! <root>/snapshots/<key>        PUT    full coin map of one cycle
//! <root>/metadata               PATCH  last update, totals, chain hash
//! <root>/status                 PUT    heartbeat document
//! <root>/trades/<key>_<symbol>  PUT    one document per fill
//! ```
//!
//! `metadata` is the commit pointer of a publish: it is written only after
//! the snapshot node it names exists.

pub mod auth;
pub mod firebase;
pub mod memory;

pub use auth::{FirebaseAuth, ServiceAccountAuth, ServiceAccountKey};
pub use firebase::FirebaseStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use orion_common::FirebaseConfig;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::normalizer::firebase_key;
use crate::snapshot::{select_expired, Snapshot};
use crate::trading::Fill;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("HTTP {status} on {method} {path}: {body}")]
    Http {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ============================================================================
// Document Store
// ============================================================================

/// Hierarchical JSON store addressed by slash-separated paths.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;

    /// Read the value at `path`; `None` when nothing is stored there.
    async fn get(&self, path: &str) -> Result<Option<Value>, SinkError>;

    /// Child keys of `path` without their values.
    async fn get_shallow_keys(&self, path: &str) -> Result<Vec<String>, SinkError>;

    /// Replace the value at `path` (PUT).
    async fn set(&self, path: &str, value: &Value) -> Result<(), SinkError>;

    /// Merge children into `path` (PATCH).
    async fn update(&self, path: &str, value: &Map<String, Value>) -> Result<(), SinkError>;

    async fn delete(&self, path: &str) -> Result<(), SinkError>;
}

/// Pick the backend: Firebase when a database URL is configured, otherwise
/// an in-memory dry-run store.
pub fn store_from_config(config: &FirebaseConfig) -> Result<Arc<dyn DocumentStore>, SinkError> {
    if config.database_url.trim().is_empty() {
        warn!("No Firebase database URL configured, snapshots stay in memory (dry run)");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(FirebaseStore::from_config(config)?))
}

// ============================================================================
// Snapshot Sink
// ============================================================================

/// Retention window for `hours`; a value chrono cannot represent keeps
/// snapshots forever instead of wrapping negative.
fn retention_from_hours(hours: u64) -> Duration {
    match i64::try_from(hours).ok().and_then(Duration::try_hours) {
        Some(retention) => retention,
        None => {
            warn!(hours, "Snapshot retention out of range, age-based cleanup disabled");
            Duration::MAX
        }
    }
}

/// Writes snapshots, metadata, status and trades under the root node.
pub struct SnapshotSink {
    store: Arc<dyn DocumentStore>,
    root: String,
    source_label: String,
    retention: Duration,
    max_snapshots: Option<usize>,
}

impl SnapshotSink {
    pub fn new(store: Arc<dyn DocumentStore>, config: &FirebaseConfig) -> Self {
        Self {
            store,
            root: config.root_path.trim_matches('/').to_string(),
            source_label: config.source_label.clone(),
            retention: retention_from_hours(config.snapshot_retention_hours),
            max_snapshots: config.max_snapshots,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn path(&self, child: &str) -> String {
        if self.root.is_empty() {
            child.to_string()
        } else {
            format!("{}/{}", self.root, child)
        }
    }

    /// Write one snapshot.
    ///
    /// `metadata` goes last: when any earlier write fails, `chain_hash` and
    /// `latest_snapshot` still name the previous stored snapshot.
    pub async fn publish(&self, snapshot: &Snapshot) -> Result<(), SinkError> {
        let documents = snapshot.coin_documents();

        self.store.update(&self.path("coins"), &documents).await?;

        self.store
            .set(
                &self.path(&format!("snapshots/{}", snapshot.key)),
                &Value::Object(documents),
            )
            .await?;

        let mut metadata = Map::new();
        metadata.insert("last_update".into(), Value::String(snapshot.key.clone()));
        metadata.insert("latest_snapshot".into(), Value::String(snapshot.key.clone()));
        metadata.insert("total_coins".into(), Value::from(snapshot.len()));
        metadata.insert("source".into(), Value::String(self.source_label.clone()));
        metadata.insert("chain_hash".into(), Value::String(snapshot.hash.clone()));
        if let Some(prev) = &snapshot.prev_hash {
            metadata.insert("prev_hash".into(), Value::String(prev.clone()));
        }
        self.store.update(&self.path("metadata"), &metadata).await?;

        info!(
            snapshot = %snapshot.key,
            coins = snapshot.len(),
            backend = self.store.name(),
            "Snapshot published"
        );
        Ok(())
    }

    /// Last persisted chain hash, if any.
    pub async fn resume_chain(&self) -> Result<Option<String>, SinkError> {
        let value = self.store.get(&self.path("metadata/chain_hash")).await?;
        Ok(value.and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Delete expired snapshots and return how many were removed.
    ///
    /// A failed delete is logged and the remaining keys are still tried.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<usize, SinkError> {
        let keys = self.store.get_shallow_keys(&self.path("snapshots")).await?;
        let expired = select_expired(&keys, now, self.retention, self.max_snapshots);

        debug!(total = keys.len(), expired = expired.len(), "Snapshot retention check");

        let mut deleted = 0;
        for key in &expired {
            match self.store.delete(&self.path(&format!("snapshots/{key}"))).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(snapshot = %key, error = %e, "Failed to delete snapshot"),
            }
        }

        if deleted > 0 {
            info!(deleted, remaining = keys.len() - deleted, "Old snapshots removed");
        }
        Ok(deleted)
    }

    /// Replace the status document.
    pub async fn push_status<T: Serialize + Sync>(&self, status: &T) -> Result<(), SinkError> {
        let value = serde_json::to_value(status)?;
        self.store.set(&self.path("status"), &value).await
    }

    /// Store one fill under `trades/<snapshot key>_<symbol>`.
    pub async fn record_trade(&self, snapshot_key: &str, fill: &Fill) -> Result<(), SinkError> {
        let key = firebase_key(&format!("{snapshot_key}_{}", fill.symbol));
        let value = serde_json::to_value(fill)?;
        self.store.set(&self.path(&format!("trades/{key}")), &value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::Normalizer;
    use crate::snapshot::SnapshotChain;
    use crate::trading::Side;
    use chrono::TimeZone;
    use serde_json::json;

    fn sink(store: Arc<MemoryStore>) -> SnapshotSink {
        SnapshotSink::new(store, &FirebaseConfig::default())
    }

    fn snapshot(chain: &mut SnapshotChain, at: DateTime<Utc>) -> Snapshot {
        let coins = Normalizer::default().normalize(
            &json!([{"symbol": "BTC", "price": 1}, {"symbol": "ETH", "price": 2}]),
            at,
        );
        chain.next(coins, at)
    }

    #[tokio::test]
    async fn test_publish_layout() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink(store.clone());
        let mut chain = SnapshotChain::new();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let first = snapshot(&mut chain, at);
        sink.publish(&first).await.unwrap();
        let second = snapshot(&mut chain, at + Duration::minutes(1));
        sink.publish(&second).await.unwrap();

        let tree = store.dump().await;
        let root = &tree["screener_orion"];
        assert_eq!(root["coins"]["BTC"]["price"], 1.0);
        assert_eq!(root["metadata"]["total_coins"], 2);
        assert_eq!(root["metadata"]["latest_snapshot"], "2024-05-01_12-01-00");
        assert_eq!(root["metadata"]["source"], "orion_xhr_api");
        assert_eq!(root["metadata"]["chain_hash"], second.hash.as_str());
        assert_eq!(root["metadata"]["prev_hash"], first.hash.as_str());
        assert!(root["snapshots"]["2024-05-01_12-00-00"]["ETH"].is_object());
        assert!(root["snapshots"]["2024-05-01_12-01-00"]["BTC"].is_object());

        assert_eq!(sink.resume_chain().await.unwrap(), Some(second.hash.clone()));
    }

    /// Memory store whose snapshot writes always fail.
    struct SnapshotWriteFails(Arc<MemoryStore>);

    #[async_trait]
    impl DocumentStore for SnapshotWriteFails {
        fn name(&self) -> &'static str {
            "snapshot-write-fails"
        }

        async fn get(&self, path: &str) -> Result<Option<Value>, SinkError> {
            self.0.get(path).await
        }

        async fn get_shallow_keys(&self, path: &str) -> Result<Vec<String>, SinkError> {
            self.0.get_shallow_keys(path).await
        }

        async fn set(&self, path: &str, value: &Value) -> Result<(), SinkError> {
            if path.contains("/snapshots/") {
                return Err(SinkError::Network("connection reset".into()));
            }
            self.0.set(path, value).await
        }

        async fn update(&self, path: &str, value: &Map<String, Value>) -> Result<(), SinkError> {
            self.0.update(path, value).await
        }

        async fn delete(&self, path: &str) -> Result<(), SinkError> {
            self.0.delete(path).await
        }
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_keeps_metadata() {
        let store = Arc::new(MemoryStore::new());
        let mut chain = SnapshotChain::new();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let first = snapshot(&mut chain, at);
        sink(store.clone()).publish(&first).await.unwrap();

        let failing = SnapshotSink::new(
            Arc::new(SnapshotWriteFails(store.clone())),
            &FirebaseConfig::default(),
        );
        let second = snapshot(&mut chain, at + Duration::minutes(1));
        assert!(failing.publish(&second).await.is_err());

        let tree = store.dump().await;
        let root = &tree["screener_orion"];
        assert_eq!(root["metadata"]["chain_hash"], first.hash.as_str());
        assert_eq!(root["metadata"]["latest_snapshot"], "2024-05-01_12-00-00");
        assert!(root["snapshots"].get("2024-05-01_12-01-00").is_none());
        assert_eq!(failing.resume_chain().await.unwrap(), Some(first.hash.clone()));
    }

    #[test]
    fn test_retention_from_hours_saturates() {
        assert_eq!(retention_from_hours(24), Duration::hours(24));
        assert_eq!(retention_from_hours(u64::MAX), Duration::MAX);
        assert_eq!(retention_from_hours(i64::MAX as u64), Duration::MAX);
    }

    #[tokio::test]
    async fn test_huge_retention_keeps_fresh_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let config = FirebaseConfig {
            snapshot_retention_hours: u64::MAX,
            ..FirebaseConfig::default()
        };
        let sink = SnapshotSink::new(store.clone(), &config);
        let mut chain = SnapshotChain::new();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        sink.publish(&snapshot(&mut chain, at)).await.unwrap();
        assert_eq!(sink.cleanup(at + Duration::seconds(1)).await.unwrap(), 0);
        assert_eq!(
            store.get_shallow_keys("screener_orion/snapshots").await.unwrap(),
            vec!["2024-05-01_12-00-00"]
        );
    }

    #[tokio::test]
    async fn test_resume_chain_empty_store() {
        let sink = sink(Arc::new(MemoryStore::new()));
        assert_eq!(sink.resume_chain().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let store = Arc::new(MemoryStore::new());
        for key in ["2024-05-01_10-00-00", "2024-05-02_11-00-00", "manual-backup"] {
            store
                .set(&format!("screener_orion/snapshots/{key}"), &json!({"BTC": {"price": 1}}))
                .await
                .unwrap();
        }

        let sink = sink(store.clone());
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        assert_eq!(sink.cleanup(now).await.unwrap(), 1);

        let mut keys = store.get_shallow_keys("screener_orion/snapshots").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["2024-05-02_11-00-00", "manual-backup"]);
    }

    #[tokio::test]
    async fn test_status_and_trade_documents() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink(store.clone());

        sink.push_status(&json!({"state": "running", "cycles": 3})).await.unwrap();

        let fill = Fill {
            order_id: "o-1".into(),
            exchange: "paper".into(),
            symbol: "BTC_USDT".into(),
            side: Side::Sell,
            quantity: 1.0,
            price: 10.0,
            quote_amount: 10.0,
            fee: 0.0,
            rsi: Some(72.0),
            executed_at: Utc::now(),
        };
        sink.record_trade("2024-05-01_12-00-00", &fill).await.unwrap();

        let tree = store.dump().await;
        assert_eq!(tree["screener_orion"]["status"]["state"], "running");
        let trade = &tree["screener_orion"]["trades"]["2024-05-01_12-00-00_BTC_USDT"];
        assert_eq!(trade["side"], "sell");
        assert_eq!(trade["rsi"], 72.0);
    }

    #[test]
    fn test_store_from_config_defaults_to_memory() {
        let store = store_from_config(&FirebaseConfig::default()).unwrap();
        assert_eq!(store.name(), "memory");
    }
}
