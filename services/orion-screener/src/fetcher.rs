//! HTTP client for the screener's XHR endpoint.
//!
//! The endpoint is the same one the screener UI calls from the browser, so
//! requests imitate an XHR: JSON accept header, `x-requested-with`, the UI
//! page as referer, and a user agent rotated from a small pool.

use orion_browser::CookieJar;
use orion_common::util::truncate_with_ellipsis;
use orion_common::ScreenerConfig;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, REFERER, RETRY_AFTER, USER_AGENT};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const XHR_ACCEPT: &str = "application/json, text/javascript, */*; q=0.01";
const MAX_ERROR_BODY_CHARS: usize = 200;

// ============================================================================
// Fetch Error
// ============================================================================

/// Errors returned by the screener client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// Connection failed, timed out, or the body could not be read
    #[error("Network error: {0}")]
    Network(String),

    /// The anti-bot layer refused the request (401/403/503)
    #[error("Blocked by screener (HTTP {0})")]
    Blocked(u16),

    #[error("Rate limited{}", retry_suffix(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Empty response body")]
    EmptyBody,

    #[error("Failed to parse JSON: {0}")]
    Parse(String),
}

fn retry_suffix(retry_after_secs: &Option<u64>) -> String {
    retry_after_secs
        .map(|secs| format!(", retry after {secs} seconds"))
        .unwrap_or_default()
}

impl FetchError {
    /// Check if the error is worth retrying with the same session.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Check if fresh browser cookies could get past this error.
    ///
    /// A network failure means the host is unreachable, which a browser
    /// cannot fix either.
    pub fn should_harvest_cookies(&self) -> bool {
        !matches!(self, Self::Network(_))
    }
}

// ============================================================================
// Screener Client
// ============================================================================

/// Stateful client: rotated headers plus the cookie jar.
pub struct ScreenerClient {
    client: reqwest::Client,
    api_url: String,
    ui_url: String,
    user_agents: Vec<String>,
    headers: HeaderMap,
    cookies: CookieJar,
    max_retries: u32,
    retry_backoff: Duration,
}

impl ScreenerClient {
    pub fn new(config: &ScreenerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let mut this = Self {
            client,
            api_url: config.api_url.clone(),
            ui_url: config.ui_url.clone(),
            user_agents: config.user_agents.clone(),
            headers: HeaderMap::new(),
            cookies: CookieJar::new(),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        };
        this.rotate_headers();
        this
    }

    /// Replace the header set with a fresh one and a random user agent.
    ///
    /// Cookies survive rotation.
    pub fn rotate_headers(&mut self) {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(XHR_ACCEPT));
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
        if let Ok(referer) = HeaderValue::from_str(&self.ui_url) {
            headers.insert(REFERER, referer);
        }

        let agent = self
            .user_agents
            .choose(&mut rand::thread_rng())
            .and_then(|ua| HeaderValue::from_str(ua).ok());
        if let Some(agent) = agent {
            headers.insert(USER_AGENT, agent);
        }

        self.headers = headers;
        debug!(user_agent = ?self.user_agent(), "Rotated request headers");
    }

    /// Merge harvested cookies into the session.
    pub fn set_cookies(&mut self, jar: CookieJar) {
        self.cookies.merge(jar);
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// User agent currently in use.
    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get(USER_AGENT).and_then(|v| v.to_str().ok())
    }

    pub fn ui_url(&self) -> &str {
        &self.ui_url
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(cookie) = self
            .cookies
            .header_value()
            .and_then(|c| HeaderValue::from_str(&c).ok())
        {
            headers.insert(COOKIE, cookie);
        }
        headers
    }

    /// Single GET of the API URL.
    pub async fn fetch(&self) -> Result<Value, FetchError> {
        debug!(url = %self.api_url, "Fetching screener data");

        let response = self
            .client
            .get(&self.api_url)
            .headers(self.request_headers())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Network("Request timeout".into())
                } else if e.is_connect() {
                    FetchError::Network("Connection failed".into())
                } else {
                    FetchError::Network(e.to_string())
                }
            })?;

        let status = response.status();

        if matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::SERVICE_UNAVAILABLE
        ) {
            return Err(FetchError::Blocked(status.as_u16()));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Err(FetchError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Http {
                status: status.as_u16(),
                body: truncate_with_ellipsis(body.trim(), MAX_ERROR_BODY_CHARS),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(format!("Failed to read body: {e}")))?;

        if body.trim().is_empty() {
            return Err(FetchError::EmptyBody);
        }

        serde_json::from_str(&body).map_err(|e| FetchError::Parse(e.to_string()))
    }

    /// Fetch with exponential backoff for recoverable errors.
    ///
    /// Never sleeps past `deadline`; when the next backoff would cross it the
    /// last error is returned instead.
    pub async fn fetch_with_retry(&self, deadline: Instant) -> Result<Value, FetchError> {
        let mut attempt: u32 = 0;

        loop {
            let err = match self.fetch().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_recoverable() || attempt >= self.max_retries {
                return Err(err);
            }

            attempt += 1;
            let mut delay = self.retry_backoff * 2u32.saturating_pow(attempt - 1);
            if let FetchError::RateLimited {
                retry_after_secs: Some(secs),
            } = err
            {
                delay = delay.max(Duration::from_secs(secs));
            }

            if Instant::now() + delay >= deadline {
                warn!(attempt, error = %err, "No time left for another fetch attempt");
                return Err(err);
            }

            warn!(
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Fetch failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
