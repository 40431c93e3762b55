//! RSI-threshold trading against an exchange account.
//!
//! The strategy is deliberately small: buy a fixed quote amount when RSI is
//! oversold and nothing is held, sell the whole position when RSI is
//! overbought. Only the simulated [`PaperExchange`] ships with the service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orion_common::TradingConfig;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::normalizer::{sanitize_symbol, CoinRecord};

/// Positions below this size count as flat.
const DUST: f64 = 1e-12;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// An executed market order.
#[derive(Debug, Clone, Serialize)]
pub struct Fill {
    pub order_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    /// Quote currency moved, before fees
    pub quote_amount: f64,
    pub fee: f64,
    /// RSI that triggered the order
    pub rsi: Option<f64>,
    pub executed_at: DateTime<Utc>,
}

/// Errors from order placement.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TradeError {
    #[error("Insufficient funds: need {needed:.2}, have {available:.2}")]
    InsufficientFunds { needed: f64, available: f64 },

    #[error("No position in {0}")]
    NoPosition(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Exchange error: {0}")]
    Exchange(String),
}

// ============================================================================
// Exchange
// ============================================================================

/// Account operations the trader needs.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &'static str;

    /// Free quote-currency balance.
    async fn balance(&self) -> Result<f64, TradeError>;

    /// Base-currency quantity held for `symbol`.
    async fn position(&self, symbol: &str) -> Result<f64, TradeError>;

    /// Spend `quote_amount` at `price`.
    async fn market_buy(&self, symbol: &str, quote_amount: f64, price: f64)
        -> Result<Fill, TradeError>;

    /// Sell `quantity` at `price`.
    async fn market_sell(&self, symbol: &str, quantity: f64, price: f64)
        -> Result<Fill, TradeError>;
}

#[derive(Debug)]
struct PaperAccount {
    cash: f64,
    positions: HashMap<String, f64>,
}

/// Simulated account filled at the snapshot price.
pub struct PaperExchange {
    fee_rate: f64,
    account: Mutex<PaperAccount>,
}

impl PaperExchange {
    pub fn new(starting_cash: f64, fee_rate: f64) -> Self {
        Self {
            fee_rate: fee_rate.max(0.0),
            account: Mutex::new(PaperAccount {
                cash: starting_cash,
                positions: HashMap::new(),
            }),
        }
    }

    pub fn from_config(config: &TradingConfig) -> Self {
        Self::new(config.starting_cash, config.fee_rate)
    }

    fn fill(&self, symbol: &str, side: Side, quantity: f64, price: f64, fee: f64) -> Fill {
        Fill {
            order_id: uuid::Uuid::new_v4().to_string(),
            exchange: self.name().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            quote_amount: quantity * price,
            fee,
            rsi: None,
            executed_at: Utc::now(),
        }
    }
}

fn check_order(amount: f64, price: f64) -> Result<(), TradeError> {
    if !(amount.is_finite() && amount > 0.0) {
        return Err(TradeError::InvalidOrder(format!("amount must be positive, got {amount}")));
    }
    if !(price.is_finite() && price > 0.0) {
        return Err(TradeError::InvalidOrder(format!("price must be positive, got {price}")));
    }
    Ok(())
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn balance(&self) -> Result<f64, TradeError> {
        Ok(self.account.lock().await.cash)
    }

    async fn position(&self, symbol: &str) -> Result<f64, TradeError> {
        Ok(self
            .account
            .lock()
            .await
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(0.0))
    }

    async fn market_buy(
        &self,
        symbol: &str,
        quote_amount: f64,
        price: f64,
    ) -> Result<Fill, TradeError> {
        check_order(quote_amount, price)?;

        let mut account = self.account.lock().await;
        let fee = quote_amount * self.fee_rate;
        let needed = quote_amount + fee;
        if needed > account.cash {
            return Err(TradeError::InsufficientFunds {
                needed,
                available: account.cash,
            });
        }

        let quantity = quote_amount / price;
        account.cash -= needed;
        *account.positions.entry(symbol.to_string()).or_insert(0.0) += quantity;

        Ok(self.fill(symbol, Side::Buy, quantity, price, fee))
    }

    async fn market_sell(
        &self,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<Fill, TradeError> {
        check_order(quantity, price)?;

        let mut account = self.account.lock().await;
        let held = account.positions.get(symbol).copied().unwrap_or(0.0);
        if held <= DUST {
            return Err(TradeError::NoPosition(symbol.to_string()));
        }

        let quantity = quantity.min(held);
        let proceeds = quantity * price;
        let fee = proceeds * self.fee_rate;
        account.cash += proceeds - fee;

        let remaining = held - quantity;
        if remaining <= DUST {
            account.positions.remove(symbol);
        } else {
            account.positions.insert(symbol.to_string(), remaining);
        }

        Ok(self.fill(symbol, Side::Sell, quantity, price, fee))
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// Buys oversold and sells overbought symbols from each snapshot.
pub struct RsiTrader {
    exchange: Arc<dyn Exchange>,
    symbols: Vec<String>,
    buy_below: f64,
    sell_above: f64,
    order_quote_amount: f64,
}

impl RsiTrader {
    pub fn new(exchange: Arc<dyn Exchange>, config: &TradingConfig) -> Self {
        Self {
            exchange,
            symbols: config.symbols.iter().map(|s| sanitize_symbol(s)).collect(),
            buy_below: config.buy_below,
            sell_above: config.sell_above,
            order_quote_amount: config.order_quote_amount,
        }
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.exchange
    }

    /// Act on one snapshot and return the fills.
    ///
    /// Symbols missing from the snapshot, or lacking price or RSI, are
    /// skipped. Order errors are logged and do not stop other symbols.
    pub async fn evaluate(&self, coins: &BTreeMap<String, CoinRecord>) -> Vec<Fill> {
        let mut fills = Vec::new();

        for symbol in &self.symbols {
            let Some(coin) = coins.get(symbol) else {
                debug!(symbol = %symbol, "Symbol not in snapshot");
                continue;
            };
            let (Some(price), Some(rsi)) = (coin.metrics.price, coin.metrics.rsi) else {
                debug!(symbol = %symbol, "Missing price or RSI, skipping");
                continue;
            };

            let held = match self.exchange.position(symbol).await {
                Ok(qty) => qty,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Failed to read position");
                    continue;
                }
            };

            let order = if rsi <= self.buy_below && held <= DUST {
                Some(self.exchange.market_buy(symbol, self.order_quote_amount, price).await)
            } else if rsi >= self.sell_above && held > DUST {
                Some(self.exchange.market_sell(symbol, held, price).await)
            } else {
                None
            };

            match order {
                Some(Ok(mut fill)) => {
                    fill.rsi = Some(rsi);
                    info!(
                        symbol = %symbol,
                        side = %fill.side,
                        quantity = fill.quantity,
                        price = fill.price,
                        rsi,
                        "Order filled"
                    );
                    fills.push(fill);
                }
                Some(Err(e)) => warn!(symbol = %symbol, rsi, error = %e, "Order rejected"),
                None => debug!(symbol = %symbol, rsi, held, "No signal"),
            }
        }

        fills
    }
}
