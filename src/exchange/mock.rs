//! Scripted in-memory exchange for lifecycle and reconciliation tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{ExchangeClient, ExchangeError, ExchangeResult};
use crate::models::{
    AlgoOrder, Candle, InstrumentMeta, LivePosition, OpenOrder, OrderResult, OwnTrade,
};

/// Record of an order the test code submitted through the mock
#[derive(Debug, Clone)]
pub struct SubmittedOrder {
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
}

#[derive(Default)]
struct MockState {
    positions: Vec<LivePosition>,
    open_orders: Vec<OpenOrder>,
    algo_orders: Vec<AlgoOrder>,
    fills: HashMap<String, Vec<OwnTrade>>,
    ticker_prices: HashMap<String, f64>,
    balance: f64,
    submitted: Vec<SubmittedOrder>,
    canceled_orders: Vec<String>,
    canceled_algo_orders: Vec<String>,
    cancel_all_symbols: Vec<String>,
    reject_stop_with_unsupported: bool,
    reject_cancel_with_not_found: bool,
    omit_fill_averages: bool,
    algo_submissions: Vec<SubmittedOrder>,
}

/// Exchange double with scripted account state
///
/// Tests seed positions/orders/fills up front, run the component under
/// test, then assert on what was submitted or canceled.
pub struct MockExchange {
    state: Mutex<MockState>,
    next_order_id: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                balance: 1000.0,
                ..MockState::default()
            }),
            next_order_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> String {
        format!("mock-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst))
    }

    // -- scripting --

    pub fn set_balance(&self, balance: f64) {
        self.state.lock().unwrap().balance = balance;
    }

    pub fn set_positions(&self, positions: Vec<LivePosition>) {
        self.state.lock().unwrap().positions = positions;
    }

    pub fn set_open_orders(&self, orders: Vec<OpenOrder>) {
        self.state.lock().unwrap().open_orders = orders;
    }

    pub fn set_algo_orders(&self, orders: Vec<AlgoOrder>) {
        self.state.lock().unwrap().algo_orders = orders;
    }

    pub fn set_fills(&self, symbol: &str, fills: Vec<OwnTrade>) {
        self.state.lock().unwrap().fills.insert(symbol.to_string(), fills);
    }

    pub fn set_ticker(&self, symbol: &str, price: f64) {
        self.state
            .lock()
            .unwrap()
            .ticker_prices
            .insert(symbol.to_string(), price);
    }

    /// Make every stop-market submission fail the way the standard channel
    /// rejects conditional orders, forcing the algo fallback path
    pub fn reject_stops_with_unsupported(&self, reject: bool) {
        self.state.lock().unwrap().reject_stop_with_unsupported = reject;
    }

    /// Make cancel_order report the order as already gone
    pub fn reject_cancels_with_not_found(&self, reject: bool) {
        self.state.lock().unwrap().reject_cancel_with_not_found = reject;
    }

    /// Strip the average price from market-order responses, simulating a
    /// venue that acks the order before the fill report is available
    pub fn omit_fill_averages(&self, omit: bool) {
        self.state.lock().unwrap().omit_fill_averages = omit;
    }

    // -- assertions --

    pub fn submitted_orders(&self) -> Vec<SubmittedOrder> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn algo_submissions(&self) -> Vec<SubmittedOrder> {
        self.state.lock().unwrap().algo_submissions.clone()
    }

    pub fn canceled_orders(&self) -> Vec<String> {
        self.state.lock().unwrap().canceled_orders.clone()
    }

    pub fn canceled_algo_orders(&self) -> Vec<String> {
        self.state.lock().unwrap().canceled_algo_orders.clone()
    }

    pub fn cancel_all_symbols(&self) -> Vec<String> {
        self.state.lock().unwrap().cancel_all_symbols.clone()
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn fetch_candles(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        Ok(vec![])
    }

    async fn fetch_top_symbols_by_volume(
        &self,
        _limit: usize,
        _exclude: &[String],
    ) -> ExchangeResult<Vec<String>> {
        Ok(vec![])
    }

    async fn fetch_ticker_price(&self, symbol: &str) -> ExchangeResult<f64> {
        self.state
            .lock()
            .unwrap()
            .ticker_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn instrument_meta(&self, _symbol: &str) -> ExchangeResult<InstrumentMeta> {
        Ok(InstrumentMeta {
            price_tick: 0.01,
            qty_step: 0.001,
        })
    }

    async fn fetch_balance_usdt(&self) -> ExchangeResult<f64> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn fetch_positions(&self) -> ExchangeResult<Vec<LivePosition>> {
        Ok(self.state.lock().unwrap().positions.clone())
    }

    async fn fetch_recent_fills(
        &self,
        symbol: &str,
        _limit: usize,
    ) -> ExchangeResult<Vec<OwnTrade>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .fills
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderResult> {
        let id = self.next_id();
        let mut state = self.state.lock().unwrap();
        let fill = if state.omit_fill_averages {
            None
        } else {
            state.ticker_prices.get(symbol).copied()
        };
        state.submitted.push(SubmittedOrder {
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: "market".to_string(),
            quantity,
            price: None,
            reduce_only,
        });
        Ok(OrderResult {
            id,
            average_price: fill,
        })
    }

    async fn submit_limit_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        price: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderResult> {
        let id = self.next_id();
        let mut state = self.state.lock().unwrap();
        state.submitted.push(SubmittedOrder {
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: "limit".to_string(),
            quantity,
            price: Some(price),
            reduce_only,
        });
        state.open_orders.push(OpenOrder {
            id: id.clone(),
            symbol: symbol.to_string(),
            reduce_only,
        });
        Ok(OrderResult {
            id,
            average_price: None,
        })
    }

    async fn submit_stop_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderResult> {
        let id = self.next_id();
        let mut state = self.state.lock().unwrap();
        if state.reject_stop_with_unsupported {
            return Err(ExchangeError::UnsupportedOrderType);
        }
        state.submitted.push(SubmittedOrder {
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: "stop_market".to_string(),
            quantity,
            price: Some(stop_price),
            reduce_only,
        });
        state.open_orders.push(OpenOrder {
            id: id.clone(),
            symbol: symbol.to_string(),
            reduce_only,
        });
        Ok(OrderResult {
            id,
            average_price: None,
        })
    }

    async fn submit_algo_stop_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: f64,
    ) -> ExchangeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.algo_submissions.push(SubmittedOrder {
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: "algo_stop".to_string(),
            quantity,
            price: Some(stop_price),
            reduce_only: true,
        });
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str, _symbol: &str) -> ExchangeResult<OrderResult> {
        Ok(OrderResult {
            id: order_id.to_string(),
            average_price: None,
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> ExchangeResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.reject_cancel_with_not_found {
            return Err(ExchangeError::OrderNotFound);
        }
        state.canceled_orders.push(order_id.to_string());
        state.open_orders.retain(|o| o.id != order_id);
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.cancel_all_symbols.push(symbol.to_string());
        state.open_orders.retain(|o| o.symbol != symbol);
        Ok(())
    }

    async fn list_open_orders(&self) -> ExchangeResult<Vec<OpenOrder>> {
        Ok(self.state.lock().unwrap().open_orders.clone())
    }

    async fn list_algo_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<AlgoOrder>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .algo_orders
            .iter()
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn cancel_algo_order(&self, _raw_symbol: &str, algo_id: &str) -> ExchangeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.canceled_algo_orders.push(algo_id.to_string());
        state.algo_orders.retain(|o| o.algo_id != algo_id);
        Ok(())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> ExchangeResult<()> {
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, _mode: &str) -> ExchangeResult<()> {
        Ok(())
    }
}
