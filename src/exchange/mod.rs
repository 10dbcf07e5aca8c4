// Exchange access: capability trait, error taxonomy, retry policy
pub mod binance;
#[cfg(test)]
pub mod mock;

pub use binance::BinanceFuturesClient;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::models::{
    AlgoOrder, Candle, InstrumentMeta, LivePosition, OpenOrder, OrderResult, OwnTrade, Side,
};

/// Error classes from the exchange boundary
///
/// The lifecycle manager branches on these: transient classes are retried
/// with backoff, `UnsupportedOrderType` triggers the algo-channel fallback,
/// `OrderNotFound` on cancel is treated as success, `Benign` rejections
/// (e.g. margin mode already set) are ignored.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("rate limited by exchange")]
    RateLimited,

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("order type rejected on this endpoint, algo channel required")]
    UnsupportedOrderType,

    #[error("order not found on exchange")]
    OrderNotFound,

    #[error("benign rejection: {0}")]
    Benign(String),

    #[error("exchange api error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("response parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ExchangeError {
    /// Transient errors are worth retrying; everything else is surfaced
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited | ExchangeError::Timeout | ExchangeError::Network(_)
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Everything the bot needs from the futures venue
///
/// One long-lived implementation is shared across all tasks; the mock
/// implementation drives the lifecycle tests.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    // -- market data --
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    async fn fetch_top_symbols_by_volume(
        &self,
        limit: usize,
        exclude: &[String],
    ) -> ExchangeResult<Vec<String>>;

    async fn fetch_ticker_price(&self, symbol: &str) -> ExchangeResult<f64>;

    async fn instrument_meta(&self, symbol: &str) -> ExchangeResult<InstrumentMeta>;

    // -- account state --
    async fn fetch_balance_usdt(&self) -> ExchangeResult<f64>;

    async fn fetch_positions(&self) -> ExchangeResult<Vec<LivePosition>>;

    async fn fetch_recent_fills(&self, symbol: &str, limit: usize)
        -> ExchangeResult<Vec<OwnTrade>>;

    // -- order management --
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderResult>;

    async fn submit_limit_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        price: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderResult>;

    async fn submit_stop_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderResult>;

    /// Same semantic stop order through the separate algo-order channel,
    /// with quantity/price formatted to exchange precision by the impl
    async fn submit_algo_stop_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: f64,
    ) -> ExchangeResult<()>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderResult>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()>;

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()>;

    async fn list_open_orders(&self) -> ExchangeResult<Vec<OpenOrder>>;

    /// Algo-channel open orders, account-wide or for one symbol
    async fn list_algo_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<AlgoOrder>>;

    async fn cancel_algo_order(&self, raw_symbol: &str, algo_id: &str) -> ExchangeResult<()>;

    // -- account setup --
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> ExchangeResult<()>;

    /// Convenience: reduce-only market order closing `side` exposure
    async fn close_position_market(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> ExchangeResult<OrderResult> {
        self.submit_market_order(symbol, side.exit_order_side(), quantity, true)
            .await
    }
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Retry a call with exponential backoff on transient exchange errors
///
/// Delay doubles from 1s up to a 60s cap; non-transient errors and retry
/// budget exhaustion surface the last error to the caller.
pub async fn with_backoff<T, F, Fut>(
    op_name: &str,
    max_retries: u32,
    mut call: F,
) -> ExchangeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExchangeResult<T>>,
{
    let mut delay = BACKOFF_BASE;
    let mut attempt = 0u32;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "{}: transient error ({}), retry {}/{} in {:?}",
                    op_name,
                    e,
                    attempt,
                    max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BACKOFF_CAP);
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!("{}: retry budget ({}) exhausted: {}", op_name, max_retries, e);
                }
                return Err(e);
            }
        }
    }
}
