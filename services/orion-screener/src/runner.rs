//! Bounded polling loop.
//!
//! A run lasts at most `global_timeout_secs`, so it fits a scheduled CI job.
//! Every cycle fetches, normalizes, chains and publishes one snapshot; the
//! loop then sleeps until the next tick, capped at the deadline. While the
//! circuit breaker is open no cycle starts until its cooldown has passed.
//! A shutdown signal ends the run at any point. A background task keeps the
//! status document fresh.

use chrono::{DateTime, Utc};
use orion_browser::{BrowserError, CookieHarvester, CookieJar};
use orion_common::{OrionConfig, MAX_GLOBAL_TIMEOUT_SECS};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use crate::fetcher::{FetchError, ScreenerClient};
use crate::normalizer::Normalizer;
use crate::notification::{escape_markdown, TelegramNotifier};
use crate::sink::{SinkError, SnapshotSink};
use crate::snapshot::SnapshotChain;
use crate::trading::{Exchange, PaperExchange, RsiTrader};

// ============================================================================
// Errors
// ============================================================================

/// Why a cycle produced no snapshot.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cookie harvest failed after fetch error ({fetch}): {harvest}")]
    Harvest { fetch: FetchError, harvest: BrowserError },

    #[error("Fetch failed after cookie harvest: {0}")]
    FetchAfterHarvest(FetchError),

    #[error("No coins parsed from API response")]
    NoCoins,

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Cycle timed out after {0:?}")]
    Timeout(Duration),
}

// ============================================================================
// Run statistics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    Finished,
}

/// Counters shared with the status heartbeat.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub harvests: u64,
    pub trades: u64,
    pub snapshots_deleted: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_snapshot: Option<String>,
    pub last_coins: usize,
    pub last_error: Option<String>,
}

/// Body of the `status` document.
#[derive(Debug, Clone, Serialize)]
pub struct StatusDocument {
    pub state: RunState,
    pub version: &'static str,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: RunStats,
    pub breaker: CircuitBreakerStats,
}

impl StatusDocument {
    pub fn new(state: RunState, stats: RunStats, breaker: CircuitBreakerStats) -> Self {
        Self {
            state,
            version: env!("CARGO_PKG_VERSION"),
            updated_at: Utc::now(),
            stats,
            breaker,
        }
    }
}

/// Result of a successful cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub snapshot_key: String,
    pub coins: usize,
    pub fills: usize,
}

// ============================================================================
// Runner
// ============================================================================

pub struct Runner {
    config: OrionConfig,
    client: ScreenerClient,
    normalizer: Normalizer,
    chain: SnapshotChain,
    sink: Arc<SnapshotSink>,
    harvester: Option<Arc<dyn CookieHarvester>>,
    notifier: TelegramNotifier,
    trader: Option<RsiTrader>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<RwLock<RunStats>>,
}

impl Runner {
    pub fn new(config: OrionConfig, sink: SnapshotSink) -> Self {
        let mut client = ScreenerClient::new(&config.screener);
        if let Some(raw) = config.screener.cookies_json.as_deref() {
            match CookieJar::from_json(raw) {
                Ok(jar) => {
                    info!(cookies = ?jar.names(), "Loaded initial cookies");
                    client.set_cookies(jar);
                }
                Err(e) => warn!(error = %e, "Ignoring invalid initial cookies"),
            }
        }

        let trader = config.trading.enabled.then(|| {
            let exchange: Arc<dyn Exchange> = Arc::new(PaperExchange::from_config(&config.trading));
            RsiTrader::new(exchange, &config.trading)
        });

        let stats = RunStats {
            run_id: orion_common::logging::generate_run_id(),
            ..Default::default()
        };

        Self {
            normalizer: Normalizer::from_config(&config.screener.field_aliases),
            notifier: TelegramNotifier::new(&config.telegram),
            breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_runner(&config.runner))),
            chain: SnapshotChain::new(),
            sink: Arc::new(sink),
            harvester: None,
            stats: Arc::new(RwLock::new(stats)),
            client,
            trader,
            config,
        }
    }

    /// Enable the cookie-harvest fallback.
    pub fn with_harvester(mut self, harvester: Arc<dyn CookieHarvester>) -> Self {
        self.harvester = Some(harvester);
        self
    }

    /// Trade against `exchange` instead of the paper account.
    pub fn with_exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        if self.config.trading.enabled {
            self.trader = Some(RsiTrader::new(exchange, &self.config.trading));
        }
        self
    }

    pub fn stats(&self) -> Arc<RwLock<RunStats>> {
        self.stats.clone()
    }

    /// Run until the global deadline or until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> RunStats {
        tokio::pin!(shutdown);

        let budget = Duration::from_secs(
            self.config.runner.global_timeout_secs.min(MAX_GLOBAL_TIMEOUT_SECS),
        );
        let fetch_interval = Duration::from_secs(self.config.runner.fetch_interval_secs);
        let cleanup_interval = Duration::from_secs(self.config.firebase.cleanup_interval_secs);
        let started = Instant::now();
        let deadline = started.checked_add(budget).unwrap_or(started);

        {
            let mut stats = self.stats.write().await;
            let now = Utc::now();
            stats.started_at = Some(now);
            stats.deadline = chrono::Duration::from_std(budget)
                .ok()
                .and_then(|d| now.checked_add_signed(d));
        }

        let run_id = self.stats.read().await.run_id.clone();
        info!(
            run_id = %run_id,
            global_timeout_secs = budget.as_secs(),
            fetch_interval_secs = fetch_interval.as_secs(),
            backend = self.sink.store().name(),
            harvester = self.harvester.is_some(),
            exchange = self.trader.as_ref().map_or("-", |t| t.exchange().name()),
            "Screener run started"
        );

        self.resume_chain().await;
        let heartbeat = self.spawn_status_heartbeat();
        let mut last_cleanup: Option<Instant> = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                info!("Global timeout reached, stopping");
                break;
            }
            let remaining = deadline - now;

            if !self.breaker.can_execute() {
                let wake = wake_at(self.breaker.remaining_cooldown(), deadline);
                debug!(
                    cooldown_ms = wake.saturating_duration_since(now).as_millis() as u64,
                    "Circuit open, waiting for cooldown"
                );
                tokio::select! {
                    _ = sleep_until(wake) => continue,
                    _ = &mut shutdown => {
                        info!("Shutdown requested, stopping");
                        break;
                    }
                }
            }

            self.stats.write().await.cycles += 1;

            let result = tokio::select! {
                r = timeout(remaining, self.run_cycle(deadline)) => Some(r),
                _ = &mut shutdown => None,
            };
            let Some(result) = result else {
                info!("Shutdown requested during cycle");
                break;
            };

            match result {
                Ok(Ok(outcome)) => self.record_success(&outcome).await,
                Ok(Err(e)) => self.record_failure(e).await,
                Err(_) => self.record_failure(CycleError::Timeout(remaining)).await,
            }

            if last_cleanup.map_or(true, |at| at.elapsed() >= cleanup_interval) {
                self.run_cleanup(deadline).await;
                last_cleanup = Some(Instant::now());
            }

            let wake = wake_at(fetch_interval, deadline);
            debug!(
                sleep_ms = wake.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Sleeping until next cycle"
            );

            tokio::select! {
                _ = sleep_until(wake) => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping");
                    break;
                }
            }
        }

        heartbeat.abort();
        self.finish().await
    }

    /// One fetch → normalize → chain → publish → trade pass.
    pub async fn run_cycle(&mut self, deadline: Instant) -> Result<CycleOutcome, CycleError> {
        let payload = match self.client.fetch_with_retry(deadline).await {
            Ok(payload) => payload,
            Err(e) => self.fetch_with_fallback(e, deadline).await?,
        };

        let now = Utc::now();
        let coins = self.normalizer.normalize(&payload, now);
        if coins.is_empty() {
            return Err(CycleError::NoCoins);
        }

        // Advance the chain only once the snapshot is stored
        let mut chain = self.chain.clone();
        let snapshot = chain.next(coins, now);
        self.sink.publish(&snapshot).await?;
        self.chain = chain;

        let mut fills = 0;
        if let Some(trader) = &self.trader {
            for fill in trader.evaluate(&snapshot.coins).await {
                if let Err(e) = self.sink.record_trade(&snapshot.key, &fill).await {
                    warn!(symbol = %fill.symbol, error = %e, "Failed to record trade");
                }
                self.notifier.notify_fill(&fill).await;
                fills += 1;
            }
        }

        Ok(CycleOutcome {
            snapshot_key: snapshot.key.clone(),
            coins: snapshot.len(),
            fills,
        })
    }

    async fn fetch_with_fallback(
        &mut self,
        err: FetchError,
        deadline: Instant,
    ) -> Result<Value, CycleError> {
        let Some(harvester) = self.harvester.clone() else {
            return Err(err.into());
        };
        if !err.should_harvest_cookies() {
            return Err(err.into());
        }

        let margin = Duration::from_secs(self.config.runner.fallback_margin_secs);
        if deadline.saturating_duration_since(Instant::now()) < margin {
            warn!(error = %err, "Too little time left for browser fallback");
            return Err(err.into());
        }

        warn!(error = %err, "API fetch failed, starting browser fallback");
        self.stats.write().await.harvests += 1;

        let jar = match harvester.harvest(self.client.ui_url(), deadline).await {
            Ok(jar) => jar,
            Err(harvest) => {
                warn!(error = %harvest, transient = harvest.is_transient(), "Cookie harvest failed");
                return Err(CycleError::Harvest { fetch: err, harvest });
            }
        };

        self.client.rotate_headers();
        self.client.set_cookies(jar);
        info!(cookies = self.client.cookies().len(), "Retrying fetch with harvested cookies");

        self.client.fetch().await.map_err(CycleError::FetchAfterHarvest)
    }

    async fn resume_chain(&mut self) {
        match self.sink.resume_chain().await {
            Ok(Some(hash)) => {
                debug!(chain_hash = %hash, "Resuming snapshot chain");
                self.chain = SnapshotChain::resume(Some(hash));
            }
            Ok(None) => debug!("Starting a new snapshot chain"),
            Err(e) => warn!(error = %e, "Could not read chain hash, starting a new chain"),
        }
    }

    async fn record_success(&self, outcome: &CycleOutcome) {
        self.breaker.record_success();

        let mut stats = self.stats.write().await;
        stats.successes += 1;
        stats.consecutive_failures = 0;
        stats.trades += outcome.fills as u64;
        stats.last_success = Some(Utc::now());
        stats.last_snapshot = Some(outcome.snapshot_key.clone());
        stats.last_coins = outcome.coins;

        info!(
            snapshot = %outcome.snapshot_key,
            coins = outcome.coins,
            fills = outcome.fills,
            "Cycle complete"
        );
    }

    /// Count a failed cycle; alerts and pushes a paused status when the
    /// breaker opens.
    async fn record_failure(&mut self, err: CycleError) {
        error!(error = %err, "Cycle failed");
        self.client.rotate_headers();

        {
            let mut stats = self.stats.write().await;
            stats.failures += 1;
            stats.consecutive_failures += 1;
            stats.last_error = Some(err.to_string());
        }

        if !self.breaker.record_failure() {
            return;
        }

        let breaker = self.breaker.stats();
        self.notifier.notify_breaker_open(&breaker, &err.to_string()).await;

        let status = StatusDocument::new(RunState::Paused, self.stats.read().await.clone(), breaker);
        if let Err(e) = self.sink.push_status(&status).await {
            warn!(error = %e, "Failed to push paused status");
        }
    }

    async fn run_cleanup(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }

        match timeout(remaining, self.sink.cleanup(Utc::now())).await {
            Ok(Ok(deleted)) => self.stats.write().await.snapshots_deleted += deleted as u64,
            Ok(Err(e)) => warn!(error = %e, "Snapshot cleanup failed"),
            Err(_) => warn!("Snapshot cleanup hit the global deadline"),
        }
    }

    fn spawn_status_heartbeat(&self) -> JoinHandle<()> {
        let sink = self.sink.clone();
        let stats = self.stats.clone();
        let breaker = self.breaker.clone();
        let period = Duration::from_secs(self.config.runner.status_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let breaker_stats = breaker.stats();
                let state = if breaker_stats.state == CircuitState::Open {
                    RunState::Paused
                } else {
                    RunState::Running
                };
                let status = StatusDocument::new(state, stats.read().await.clone(), breaker_stats);
                if let Err(e) = sink.push_status(&status).await {
                    warn!(error = %e, "Failed to push status heartbeat");
                }
            }
        })
    }

    async fn finish(self) -> RunStats {
        let stats = self.stats.read().await.clone();
        let status = StatusDocument::new(RunState::Finished, stats.clone(), self.breaker.stats());
        if let Err(e) = self.sink.push_status(&status).await {
            warn!(error = %e, "Failed to push final status");
        }

        if self.config.telegram.notify_on_finish {
            if let Err(e) = self.notifier.send_message(&format_run_summary(&stats)).await {
                warn!(error = %e, "Failed to deliver run summary");
            }
        }

        info!(
            cycles = stats.cycles,
            successes = stats.successes,
            failures = stats.failures,
            harvests = stats.harvests,
            trades = stats.trades,
            "Screener run finished"
        );
        stats
    }
}

/// `after` from now, capped at `deadline`.
fn wake_at(after: Duration, deadline: Instant) -> Instant {
    Instant::now()
        .checked_add(after)
        .map_or(deadline, |at| at.min(deadline))
}

/// Build the cookie harvester described by the browser config, if enabled.
pub fn harvester_from_config(config: &OrionConfig) -> Option<Arc<dyn CookieHarvester>> {
    if !config.browser.enabled {
        return None;
    }
    let user_agent = config
        .screener
        .user_agents
        .first()
        .cloned()
        .unwrap_or_default();
    Some(Arc::new(orion_browser::ChromeHarvester::new(
        config.browser.clone(),
        user_agent,
    )))
}

pub fn format_run_summary(stats: &RunStats) -> String {
    let last = stats
        .last_snapshot
        .as_deref()
        .map(escape_markdown)
        .unwrap_or_else(|| "none".to_string());
    format!(
        "🏁 *Orion screener run finished*\n\n\
         Cycles: {} (ok {}, failed {})\n\
         Cookie harvests: {}\n\
         Trades: {}\n\
         Snapshots removed: {}\n\
         Last snapshot: {} ({} coins)",
        stats.cycles,
        stats.successes,
        stats.failures,
        stats.harvests,
        stats.trades,
        stats.snapshots_deleted,
        last,
        stats.last_coins
    )
}
