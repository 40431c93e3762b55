//! Harvester behavior reachable without a Chrome binary.

use orion_browser::{BrowserError, ChromeHarvester, CookieHarvester, CookieJar};
use orion_common::BrowserConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_expired_deadline_skips_browser_launch() {
    let config = BrowserConfig {
        chrome_executable: Some("/nonexistent/chrome".into()),
        ..Default::default()
    };
    let harvester: Arc<dyn CookieHarvester> = Arc::new(ChromeHarvester::new(config, "ua"));

    let started = Instant::now();
    let err = harvester
        .harvest("https://orionterminal.com/screener", Instant::now() - Duration::from_millis(1))
        .await
        .unwrap_err();

    assert!(matches!(err, BrowserError::DeadlineExceeded));
    assert!(!err.is_transient());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_exported_cookies_merge_into_session() {
    let mut session = CookieJar::from_json(r#"{"session": "old", "theme": "dark"}"#).unwrap();
    let harvested = CookieJar::from_json(
        r#"[{"name": "session", "value": "new", "domain": ".orionterminal.com"},
            {"name": "cf_clearance", "value": "abc", "httpOnly": true}]"#,
    )
    .unwrap();

    session.merge(harvested);
    assert_eq!(session.len(), 3);
    assert_eq!(session.get("session"), Some("new"));
    assert_eq!(
        session.header_value().as_deref(),
        Some("cf_clearance=abc; session=new; theme=dark")
    );
}
