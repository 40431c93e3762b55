//! Cookie harvesting through a headless Chrome session.
//!
//! The screener API answers 403 once its anti-bot layer stops trusting plain
//! HTTP clients. Rendering the UI page in a real browser yields fresh
//! clearance cookies that the HTTP client can replay.
//!
//! Every CDP step runs under `tokio::time::timeout`, and the whole harvest is
//! bounded by the caller's global deadline.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as CdpBrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use orion_common::BrowserConfig;

use crate::cookies::CookieJar;
use crate::error::BrowserError;

/// Opens the "Columns" picker and ticks every checkbox so the table renders
/// all metrics.
pub const COLUMNS_SCRIPT: &str = r#"
(function(){
    try {
        const selectors = [
            'button[aria-label="Columns"]',
            'button[title*="Columns"]',
            '.columns-btn',
            '.btn-columns'
        ];
        for (const s of selectors) {
            try {
                const el = document.querySelector(s);
                if (el && typeof el.click === 'function') { el.click(); }
            } catch (e) {}
        }
        document.querySelectorAll('button').forEach(b => {
            if ((b.textContent || '').trim() === 'Columns') { b.click(); }
        });
        document.querySelectorAll('input[type=checkbox]').forEach(i => {
            if (!i.checked) { i.click(); }
        });
        return true;
    } catch (e) { return false; }
})();
"#;

/// One snake-scroll pass: bottom, right, top.
pub const SNAKE_SCROLL: &[(&str, &str)] = &[
    ("bottom", "window.scrollTo(0, document.body.scrollHeight);"),
    ("right", "window.scrollTo(document.body.scrollWidth, 0);"),
    ("top", "window.scrollTo(0, 0);"),
];

/// Source of session cookies for the screener.
#[async_trait]
pub trait CookieHarvester: Send + Sync {
    /// Harvest cookies for `url`, giving up at `deadline`.
    async fn harvest(&self, url: &str, deadline: Instant) -> Result<CookieJar, BrowserError>;
}

/// Sleep for `duration`, but never past `deadline`.
pub async fn sleep_bounded(duration: Duration, deadline: Instant) {
    let wake = (Instant::now() + duration).min(deadline);
    tokio::time::sleep_until(wake).await;
}

/// Headless Chrome harvester driven over CDP.
pub struct ChromeHarvester {
    config: BrowserConfig,
    user_agent: String,
}

impl ChromeHarvester {
    pub fn new(config: BrowserConfig, user_agent: impl Into<String>) -> Self {
        Self {
            config,
            user_agent: user_agent.into(),
        }
    }

    /// Extra Chrome flags for CI runners.
    pub fn launch_args(&self) -> Vec<String> {
        vec![
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
            format!(
                "--window-size={},{}",
                self.config.window_width, self.config.window_height
            ),
            format!("--user-agent={}", self.user_agent),
        ]
    }

    fn cdp_config(&self) -> Result<CdpBrowserConfig, BrowserError> {
        let mut builder = CdpBrowserConfig::builder()
            .no_sandbox()
            .window_size(self.config.window_width, self.config.window_height)
            .args(self.launch_args());

        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(ref exe) = self.config.chrome_executable {
            builder = builder.chrome_executable(exe);
        }

        builder.build().map_err(BrowserError::LaunchFailed)
    }

    async fn run_script(&self, page: &Page, script: &str, label: &str) {
        let limit = Duration::from_secs(self.config.js_timeout_secs);
        match timeout(limit, page.evaluate(script)).await {
            Ok(Ok(_)) => debug!(step = label, "Script executed"),
            Ok(Err(e)) => warn!(step = label, error = %e, "Script failed, continuing"),
            Err(_) => warn!(
                step = label,
                timeout_secs = self.config.js_timeout_secs,
                "Script timed out, continuing"
            ),
        }
    }

    async fn drive(
        &self,
        browser: &Browser,
        url: &str,
        deadline: Instant,
    ) -> Result<CookieJar, BrowserError> {
        let page_load = Duration::from_secs(self.config.page_load_timeout_secs);
        let page = match timeout(page_load, browser.new_page(url)).await {
            Err(_) => {
                return Err(BrowserError::NavigationTimeout {
                    url: url.to_string(),
                })
            }
            Ok(Err(e)) => {
                return Err(BrowserError::NavigationFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(page)) => page,
        };

        sleep_bounded(Duration::from_secs(self.config.settle_secs), deadline).await;

        self.run_script(&page, COLUMNS_SCRIPT, "columns").await;

        let pause = Duration::from_millis(self.config.scroll_pause_ms);
        'passes: for pass in 0..self.config.scroll_passes {
            for (label, script) in SNAKE_SCROLL {
                if Instant::now() >= deadline {
                    warn!(pass, "Global deadline reached during snake scrolling");
                    break 'passes;
                }
                self.run_script(&page, script, label).await;
                sleep_bounded(pause, deadline).await;
            }
        }

        let cookies = match page.get_cookies().await {
            Ok(cookies) => cookies,
            Err(e) => {
                warn!(error = %e, "Failed to read cookies from page");
                Vec::new()
            }
        };

        Ok(CookieJar::from_pairs(
            cookies.into_iter().map(|c| (c.name, c.value)),
        ))
    }
}

#[async_trait]
impl CookieHarvester for ChromeHarvester {
    async fn harvest(&self, url: &str, deadline: Instant) -> Result<CookieJar, BrowserError> {
        if Instant::now() >= deadline {
            return Err(BrowserError::DeadlineExceeded);
        }

        info!(url = %url, "Starting headless browser for cookie harvest");

        let config = self.cdp_config()?;
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let result = self.drive(&browser, url, deadline).await;

        if let Err(e) = browser.close().await {
            debug!(error = %e, "Browser close returned an error");
        }
        let _ = browser.wait().await;
        handler_task.abort();

        match &result {
            Ok(jar) if jar.is_empty() => warn!("Browser fallback finished without cookies"),
            Ok(jar) => info!(cookies = ?jar.names(), "Browser fallback harvested cookies"),
            Err(e) => warn!(error = %e, "Browser fallback failed"),
        }

        result
    }
}
