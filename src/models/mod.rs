use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position direction on the futures market
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side string the exchange expects for opening this direction
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            Side::Long => "buy",
            Side::Short => "sell",
        }
    }

    /// Order side string for closing this direction (logical inverse)
    pub fn exit_order_side(&self) -> &'static str {
        match self {
            Side::Long => "sell",
            Side::Short => "buy",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Exchange-defined precision rules for one instrument
///
/// Fetched lazily from the market metadata endpoint and cached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstrumentMeta {
    pub price_tick: f64,
    pub qty_step: f64,
}

impl InstrumentMeta {
    /// Round a price to the nearest tick
    pub fn round_price(&self, price: f64) -> f64 {
        if self.price_tick <= 0.0 {
            return price;
        }
        (price / self.price_tick).round() * self.price_tick
    }

    /// Round a quantity down to the step size (never rounds up exposure)
    pub fn round_quantity(&self, qty: f64) -> f64 {
        if self.qty_step <= 0.0 {
            return qty;
        }
        (qty / self.qty_step).floor() * self.qty_step
    }
}

impl Default for InstrumentMeta {
    fn default() -> Self {
        Self {
            price_tick: 0.0001,
            qty_step: 0.001,
        }
    }
}

/// Live position as reported by the exchange
#[derive(Debug, Clone)]
pub struct LivePosition {
    pub symbol: String,
    pub contracts: f64,
    pub entry_price: f64,
    pub side: Side,
}

/// Open order on the standard order channel
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub id: String,
    pub symbol: String,
    pub reduce_only: bool,
}

/// Open order on the separate conditional/algo channel
///
/// The algo channel reports the raw exchange symbol (e.g. "SOLUSDT"), not the
/// unified form, so it carries both representations.
#[derive(Debug, Clone)]
pub struct AlgoOrder {
    pub algo_id: String,
    pub raw_symbol: String,
    pub symbol: String,
    pub reduce_only: bool,
}

/// Result of submitting or fetching an order
#[derive(Debug, Clone, Default)]
pub struct OrderResult {
    pub id: String,
    pub average_price: Option<f64>,
}

/// One of our own fills, used to back out realized PnL after a close
///
/// The timestamp scopes PnL readback to the position being closed;
/// older fills on the same symbol belong to previous trades.
#[derive(Debug, Clone)]
pub struct OwnTrade {
    pub price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub timestamp: DateTime<Utc>,
}

/// State transition tags written to the trade log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    Long,
    Short,
    Canceled,
    Closed,
    Manual,
    Panic,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Long => "LONG",
            TradeAction::Short => "SHORT",
            TradeAction::Canceled => "CANCELED",
            TradeAction::Closed => "CLOSED",
            TradeAction::Manual => "MANUAL",
            TradeAction::Panic => "PANIC",
        }
    }

    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Long => TradeAction::Long,
            Side::Short => TradeAction::Short,
        }
    }
}

/// Append-only audit record, one per state transition
///
/// This is the durability boundary: in-memory tracking is reconstructable
/// (for audit) from these rows plus live exchange state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: TradeAction,
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub realized_pnl: Option<f64>,
    pub reason: String,
    pub dry_run: bool,
    pub params_json: Option<String>,
}

impl TradeRecord {
    pub fn new(action: TradeAction, symbol: &str, price: f64, quantity: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            symbol: symbol.to_string(),
            price,
            quantity,
            realized_pnl: None,
            reason: String::new(),
            dry_run: false,
            params_json: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_pnl(mut self, pnl: f64) -> Self {
        self.realized_pnl = Some(pnl);
        self
    }

    pub fn dry_run(mut self, dry: bool) -> Self {
        self.dry_run = dry;
        self
    }
}

/// Higher-timeframe directional bias (1h EMA50/200 ordering with buffer band)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtfBias {
    Bull,
    Bear,
    Neutral,
}

/// Market regime from the medium timeframe trend-strength read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Trend,
    Range,
}

/// MACD momentum direction on the medium timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Momentum {
    Bullish,
    Bearish,
    Neutral,
}

/// Order-flow pressure hint (external signal, not yet wired to a live feed)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderFlow {
    BuyPressure,
    SellPressure,
}
