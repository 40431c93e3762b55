//! Telegram alerts for the screener run.
//!
//! Messages go straight to the Bot API `sendMessage` method with Markdown
//! formatting. Without a bot token and chat id every send is a no-op.

use anyhow::Result;
use orion_common::util::{sanitize_for_log, truncate_with_ellipsis};
use orion_common::TelegramConfig;
use serde::Deserialize;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerStats;
use crate::trading::Fill;

const MAX_ERROR_CHARS: usize = 300;

#[derive(Debug, Deserialize)]
struct SendResponse {
    ok: bool,
    description: Option<String>,
}

/// Bot API client for run alerts.
pub struct TelegramNotifier {
    enabled: bool,
    api_base: String,
    bot_token: String,
    chat_id: String,
    retry_count: u32,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            enabled: config.enabled,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone().unwrap_or_default(),
            chat_id: config.chat_id.clone().unwrap_or_default(),
            retry_count: config.retry_count.max(1),
            client,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// Send a Markdown message, retrying with linear backoff.
    pub async fn send_message(&self, message: &str) -> Result<()> {
        if !self.is_enabled() {
            tracing::debug!("Telegram not configured, skipping message");
            return Ok(());
        }

        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true
        });

        let mut last_error = None;

        for attempt in 1..=self.retry_count {
            match self.try_send(&body).await {
                Ok(()) => {
                    tracing::info!(chat_id = %self.chat_id, "Telegram message sent");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.retry_count,
                        error = %sanitize_for_log(&e.to_string()),
                        "Failed to send Telegram message, retrying..."
                    );
                    last_error = Some(e);

                    if attempt < self.retry_count {
                        tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }

    async fn try_send(&self, body: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram sendMessage failed ({status}): {text}");
        }

        let result: SendResponse = response.json().await?;
        if !result.ok {
            anyhow::bail!(
                "Telegram sendMessage rejected: {}",
                result.description.unwrap_or_default()
            );
        }

        Ok(())
    }

    /// Alert that the breaker opened. Errors are logged, not returned.
    pub async fn notify_breaker_open(&self, stats: &CircuitBreakerStats, last_error: &str) {
        let message = format_breaker_alert(stats, last_error);
        if let Err(e) = self.send_message(&message).await {
            tracing::warn!(error = %e, "Failed to deliver breaker alert");
        }
    }

    pub async fn notify_fill(&self, fill: &Fill) {
        let message = format_fill(fill);
        if let Err(e) = self.send_message(&message).await {
            tracing::warn!(error = %e, symbol = %fill.symbol, "Failed to deliver trade alert");
        }
    }
}

/// Escape characters legacy Markdown treats as entities.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn format_breaker_alert(stats: &CircuitBreakerStats, last_error: &str) -> String {
    let error = truncate_with_ellipsis(&sanitize_for_log(last_error), MAX_ERROR_CHARS);
    format!(
        "⚠️ *Orion screener paused*\n\n\
         {} consecutive cycles failed (threshold {}).\n\
         Trips this run: {}\n\
         Last error: {}",
        stats.failure_count,
        stats.failure_threshold,
        stats.trips,
        escape_markdown(&error)
    )
}

pub fn format_fill(fill: &Fill) -> String {
    let rsi = fill
        .rsi
        .map(|r| format!("{r:.1}"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "💱 *{} {}* ({})\n\
         Qty: {:.6} @ {:.6}\n\
         Value: {:.2} (fee {:.4})\n\
         RSI: {}",
        fill.side,
        escape_markdown(&fill.symbol),
        fill.exchange,
        fill.quantity,
        fill.price,
        fill.quote_amount,
        fill.fee,
        rsi
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::trading::Side;
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(api_base: &str) -> TelegramConfig {
        TelegramConfig {
            enabled: true,
            bot_token: Some("123:abc".into()),
            chat_id: Some("42".into()),
            api_base: api_base.to_string(),
            retry_count: 3,
            notify_on_finish: false,
        }
    }

    fn stats() -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: "screener".into(),
            state: CircuitState::Open,
            failure_count: 3,
            success_count: 0,
            failure_threshold: 3,
            trips: 1,
        }
    }

    #[test]
    fn test_disabled_without_credentials() {
        let notifier = TelegramNotifier::new(&TelegramConfig::default());
        assert!(!notifier.is_enabled());

        let mut cfg = config("http://localhost");
        cfg.enabled = false;
        assert!(!TelegramNotifier::new(&cfg).is_enabled());
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("BTC_USDT *x* [y]"), "BTC\\_USDT \\*x\\* \\[y]");
    }

    #[test]
    fn test_format_breaker_alert_redacts_tokens() {
        let msg = format_breaker_alert(&stats(), "POST https://api.telegram.org/bot123456:ABCdefGHIjklMNOpqrSTUvwxYZ012345678/sendMessage");
        assert!(msg.contains("3 consecutive cycles failed"));
        assert!(!msg.contains("ABCdefGHIjklMNOpqrSTUvwxYZ012345678"));
    }

    #[test]
    fn test_format_fill() {
        let fill = Fill {
            order_id: "o-1".into(),
            exchange: "paper".into(),
            symbol: "BTC_USDT".into(),
            side: Side::Buy,
            quantity: 0.5,
            price: 200.0,
            quote_amount: 100.0,
            fee: 0.1,
            rsi: Some(25.25),
            executed_at: Utc::now(),
        };
        let msg = format_fill(&fill);
        assert!(msg.contains("*BUY BTC\\_USDT*"));
        assert!(msg.contains("RSI: 25.2") || msg.contains("RSI: 25.3"));
    }

    #[tokio::test]
    async fn test_send_message_posts_markdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(serde_json::json!({
                "chat_id": "42",
                "text": "hello",
                "parse_mode": "Markdown"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(&config(&server.uri()));
        notifier.send_message("hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_message_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(2)
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri());
        cfg.retry_count = 2;
        let notifier = TelegramNotifier::new(&cfg);
        let err = notifier.send_message("hello").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_send_message_rejected_by_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"ok": false, "description": "chat not found"}),
            ))
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri());
        cfg.retry_count = 1;
        let err = TelegramNotifier::new(&cfg).send_message("x").await.unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }
}
