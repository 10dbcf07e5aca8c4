// Market data: candle buffering and symbol universe refresh

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::exchange::{with_backoff, ExchangeClient, ExchangeResult};
use crate::models::Candle;

/// Symbols never traded even when they top the volume board
const EXCLUDED_SYMBOLS: &[&str] = &[
    "BTC/USDT:USDT",
    "ETH/USDT:USDT",
    "USDC/USDT:USDT",
    "FDUSD/USDT:USDT",
    "TUSD/USDT:USDT",
    "DAI/USDT:USDT",
];

/// Thread-safe rolling window of candles per (symbol, timeframe)
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<HashMap<String, VecDeque<Candle>>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles,
        }
    }

    fn key(symbol: &str, timeframe: &str) -> String {
        format!("{}|{}", symbol, timeframe)
    }

    /// Replace the stored window for one symbol/timeframe with a fresh
    /// REST snapshot (last candle may still be forming; callers drop it
    /// when they need closed bars only)
    pub fn replace(&self, symbol: &str, timeframe: &str, candles: Vec<Candle>) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let window = data.entry(Self::key(symbol, timeframe)).or_default();
        window.clear();
        for candle in candles {
            window.push_back(candle);
        }
        while window.len() > self.max_candles {
            window.pop_front();
        }
    }

    pub fn get(&self, symbol: &str, timeframe: &str) -> Vec<Candle> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(&Self::key(symbol, timeframe))
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, symbol: &str, timeframe: &str) -> usize {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(&Self::key(symbol, timeframe))
            .map(|d| d.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, symbol: &str, timeframe: &str) -> bool {
        self.len(symbol, timeframe) == 0
    }

    pub fn remove_symbol(&self, symbol: &str) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let prefix = format!("{}|", symbol);
        data.retain(|key, _| !key.starts_with(&prefix));
    }
}

/// Candle fetching and universe selection over the shared exchange session
#[derive(Clone)]
pub struct MarketDataFeed {
    exchange: Arc<dyn ExchangeClient>,
    buffer: CandleBuffer,
    symbols: Arc<RwLock<Vec<String>>>,
}

impl MarketDataFeed {
    pub fn new(exchange: Arc<dyn ExchangeClient>, max_candles: usize) -> Self {
        Self {
            exchange,
            buffer: CandleBuffer::new(max_candles),
            symbols: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn buffer(&self) -> &CandleBuffer {
        &self.buffer
    }

    /// Currently tracked symbol universe
    pub fn symbols(&self) -> Vec<String> {
        self.symbols.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_symbols(&self, symbols: Vec<String>) {
        *self.symbols.write().unwrap_or_else(|e| e.into_inner()) = symbols;
    }

    /// Pull a fresh candle window for one symbol/timeframe into the buffer
    pub async fn refresh_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let candles = with_backoff("fetch_candles", 3, || {
            self.exchange.fetch_candles(symbol, timeframe, limit)
        })
        .await?;

        self.buffer.replace(symbol, timeframe, candles.clone());
        Ok(candles)
    }

    /// Refresh the tradable universe from 24h volume, keeping symbols with
    /// live tracked state even if they fall off the board
    pub async fn refresh_top_symbols(
        &self,
        limit: usize,
        keep: &[String],
    ) -> ExchangeResult<Vec<String>> {
        let exclude: Vec<String> = EXCLUDED_SYMBOLS.iter().map(|s| s.to_string()).collect();
        let mut top = with_backoff("fetch_top_symbols", 3, || {
            self.exchange.fetch_top_symbols_by_volume(limit, &exclude)
        })
        .await?;

        for symbol in keep {
            if !top.contains(symbol) {
                top.push(symbol.clone());
            }
        }

        // Forget buffered data for symbols that dropped out
        for old in self.symbols() {
            if !top.contains(&old) {
                self.buffer.remove_symbol(&old);
            }
        }

        tracing::info!("📊 symbol universe refreshed: {} symbols", top.len());
        self.set_symbols(top.clone());
        Ok(top)
    }
}
