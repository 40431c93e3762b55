//! End-to-end runs against a mock screener and the in-memory store.

use async_trait::async_trait;
use orion_browser::{BrowserError, CookieHarvester, CookieJar};
use orion_common::OrionConfig;
use orion_screener::{MemoryStore, Runner, SnapshotSink};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer, global_timeout_secs: u64) -> OrionConfig {
    let mut config = OrionConfig::default();
    config.screener.api_url = format!("{}/api/screener", server.uri());
    config.screener.ui_url = format!("{}/screener", server.uri());
    config.screener.retry_backoff_ms = 10;
    config.runner.global_timeout_secs = global_timeout_secs;
    config.runner.fetch_interval_secs = 1;
    config.runner.fallback_margin_secs = 1;
    config.runner.status_interval_secs = 1;
    config.telegram.enabled = false;
    config
}

fn rows() -> Value {
    json!({"data": [
        {"symbol": "BTCUSDT", "price": "65000", "volume": "1.2B", "rsi": 25},
        {"symbol": "ETHUSDT", "price": 3200, "volume": 800000000, "rsi": 55}
    ]})
}

fn runner(config: OrionConfig, store: &Arc<MemoryStore>) -> Runner {
    let sink = SnapshotSink::new(store.clone(), &config.firebase);
    Runner::new(config, sink)
}

struct StubHarvester {
    calls: AtomicU32,
}

#[async_trait]
impl CookieHarvester for StubHarvester {
    async fn harvest(&self, _url: &str, _deadline: tokio::time::Instant) -> Result<CookieJar, BrowserError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CookieJar::from_pairs([("cf_clearance", "abc")]))
    }
}

#[tokio::test]
async fn test_run_publishes_snapshots_until_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/screener"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows()))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let stats = runner(config(&server, 2), &store)
        .run(std::future::pending())
        .await;

    assert!(stats.successes >= 1);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.last_coins, 2);

    let tree = store.dump().await;
    let root = &tree["screener_orion"];
    assert_eq!(root["coins"]["BTCUSDT"]["price"], 65000.0);
    assert_eq!(root["metadata"]["total_coins"], 2);
    assert!(root["metadata"]["chain_hash"].is_string());
    assert!(!root["snapshots"].as_object().unwrap().is_empty());
    assert_eq!(root["status"]["state"], "finished");
    assert_eq!(root["status"]["run_id"], stats.run_id.as_str());
}

#[tokio::test]
async fn test_blocked_api_falls_back_to_browser_cookies() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/screener"))
        .and(header("cookie", "cf_clearance=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/screener"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let harvester = Arc::new(StubHarvester {
        calls: AtomicU32::new(0),
    });
    let store = Arc::new(MemoryStore::new());
    let stats = runner(config(&server, 3), &store)
        .with_harvester(harvester.clone())
        .run(std::future::pending())
        .await;

    assert_eq!(harvester.calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.harvests, 1);
    assert_eq!(stats.failures, 0);
    assert!(stats.successes >= 1);
    assert_eq!(store.dump().await["screener_orion"]["metadata"]["total_coins"], 2);
}

#[tokio::test]
async fn test_repeated_failures_open_the_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/screener"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "maintenance"})))
        .mount(&server)
        .await;

    let mut config = config(&server, 3);
    config.runner.failure_threshold = 2;
    config.runner.breaker_cooldown_secs = 1;

    let store = Arc::new(MemoryStore::new());
    let stats = runner(config, &store).run(std::future::pending()).await;

    assert_eq!(stats.successes, 0);
    assert!(stats.failures >= 2);
    assert_eq!(stats.last_error.as_deref(), Some("No coins parsed from API response"));

    let tree = store.dump().await;
    let root = &tree["screener_orion"];
    assert!(root["snapshots"].is_null());
    assert!(root["status"]["breaker"]["trips"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_paper_trades_are_recorded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/screener"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows()))
        .mount(&server)
        .await;

    let mut config = config(&server, 2);
    config.trading.enabled = true;
    config.trading.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into()];

    let store = Arc::new(MemoryStore::new());
    let stats = runner(config, &store).run(std::future::pending()).await;

    // Only the oversold coin is bought, and only once
    assert_eq!(stats.trades, 1);
    let tree = store.dump().await;
    let trades = tree["screener_orion"]["trades"].as_object().unwrap();
    assert_eq!(trades.len(), 1);
    let trade = trades.values().next().unwrap();
    assert_eq!(trade["symbol"], "BTCUSDT");
    assert_eq!(trade["side"], "buy");
}

#[tokio::test]
async fn test_shutdown_signal_stops_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows()))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let started = std::time::Instant::now();
    let stats = runner(config(&server, 60), &store)
        .run(tokio::time::sleep(std::time::Duration::from_millis(300)))
        .await;

    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert!(stats.cycles >= 1);
    assert_eq!(store.dump().await["screener_orion"]["status"]["state"], "finished");
}

#[tokio::test]
async fn test_open_breaker_holds_cycles_until_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/screener"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "maintenance"})))
        .mount(&server)
        .await;

    let mut config = config(&server, 2);
    config.runner.failure_threshold = 1;
    config.runner.breaker_cooldown_secs = u64::MAX;

    let store = Arc::new(MemoryStore::new());
    let started = std::time::Instant::now();
    let stats = runner(config, &store).run(std::future::pending()).await;

    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.failures, 1);
    let status = &store.dump().await["screener_orion"]["status"];
    assert_eq!(status["state"], "finished");
    assert_eq!(status["breaker"]["state"], "open");
}

#[tokio::test]
async fn test_oversized_global_timeout_does_not_panic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows()))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let stats = runner(config(&server, u64::MAX), &store)
        .run(tokio::time::sleep(std::time::Duration::from_millis(300)))
        .await;

    assert!(stats.cycles >= 1);
    assert!(stats.deadline.is_some());
    assert_eq!(store.dump().await["screener_orion"]["status"]["state"], "finished");
}
