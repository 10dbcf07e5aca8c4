use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ExchangeClient, ExchangeError, ExchangeResult};
use crate::models::{
    AlgoOrder, Candle, InstrumentMeta, LivePosition, OpenOrder, OrderResult, OwnTrade, Side,
};

const FAPI_BASE: &str = "https://fapi.binance.com";
const FAPI_TESTNET_BASE: &str = "https://testnet.binancefuture.com";
const RATE_LIMIT_RPM: u32 = 1200; // Binance futures weight budget, kept coarse

type HmacSha256 = Hmac<Sha256>;

// Type alias for the rate limiter to simplify signatures
type FapiRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Binance USDⓈ-M futures REST client
///
/// Signed endpoints use HMAC-SHA256 query signing. All clones share the
/// same rate limiter and instrument metadata cache; one instance is the
/// process-wide exchange session.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    rate_limiter: Arc<FapiRateLimiter>,
    meta_cache: Arc<RwLock<HashMap<String, InstrumentMeta>>>,
}

impl BinanceFuturesClient {
    pub fn new(api_key: String, api_secret: String, use_testnet: bool) -> Self {
        let base = if use_testnet {
            FAPI_TESTNET_BASE
        } else {
            FAPI_BASE
        };
        Self::with_base_url(api_key, api_secret, base.to_string())
    }

    /// Base URL injection for HTTP-level tests
    pub fn with_base_url(api_key: String, api_secret: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .expect("reqwest client");

        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap());

        Self {
            client,
            api_key,
            api_secret,
            base_url,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            meta_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Unified symbol ("SOL/USDT:USDT") to raw exchange symbol ("SOLUSDT")
    pub fn to_raw_symbol(symbol: &str) -> String {
        symbol.replace("/USDT:USDT", "USDT").replace('/', "")
    }

    /// Raw exchange symbol ("SOLUSDT") back to the unified form
    pub fn to_unified_symbol(raw: &str) -> String {
        match raw.strip_suffix("USDT") {
            Some(base) if !base.is_empty() => format!("{}/USDT:USDT", base),
            _ => raw.to_string(),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("hmac accepts any key");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode_params(params: &[(String, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Map a Binance error body onto the error taxonomy the lifecycle
    /// manager branches on
    fn map_api_error(code: i64, message: &str) -> ExchangeError {
        match code {
            -1003 | -1015 => ExchangeError::RateLimited,
            -4120 => ExchangeError::UnsupportedOrderType,
            -2011 | -2013 => ExchangeError::OrderNotFound,
            -4046 => ExchangeError::Benign(message.to_string()),
            _ if message.contains("Algo Order API endpoints") => {
                ExchangeError::UnsupportedOrderType
            }
            _ if message.contains("Unknown order") => ExchangeError::OrderNotFound,
            _ if message.contains("No need to change margin type") => {
                ExchangeError::Benign(message.to_string())
            }
            _ => ExchangeError::Api {
                code,
                message: message.to_string(),
            },
        }
    }

    async fn parse_response(response: reqwest::Response) -> ExchangeResult<Value> {
        let status = response.status();
        let body = response.text().await?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExchangeError::RateLimited);
        }

        let value: Value = serde_json::from_str(&body)?;

        // Binance reports failures as {"code": <negative>, "msg": "..."}
        if let Some(code) = value.get("code").and_then(Value::as_i64) {
            if code < 0 {
                let msg = value.get("msg").and_then(Value::as_str).unwrap_or("");
                return Err(Self::map_api_error(code, msg));
            }
        }

        if !status.is_success() {
            return Err(ExchangeError::Network(format!("http status {}", status)));
        }

        Ok(value)
    }

    async fn public_get(&self, path: &str, params: &[(String, String)]) -> ExchangeResult<Value> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}{}?{}", self.base_url, path, Self::encode_params(params));
        let response = self.client.get(&url).send().await?;
        Self::parse_response(response).await
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> ExchangeResult<Value> {
        self.rate_limiter.until_ready().await;

        params.push(("timestamp".to_string(), Utc::now().timestamp_millis().to_string()));
        params.push(("recvWindow".to_string(), "5000".to_string()));

        let query = Self::encode_params(&params);
        let signature = self.sign(&query);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        );

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    fn parse_order_result(value: &Value) -> OrderResult {
        let id = value
            .get("orderId")
            .map(|v| v.to_string().trim_matches('"').to_string())
            .unwrap_or_default();
        let average_price = value
            .get("avgPrice")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|p| *p > 0.0);
        OrderResult { id, average_price }
    }

    fn parse_bool_field(value: &Value, field: &str) -> bool {
        match value.get(field) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    fn f64_field(value: &Value, field: &str) -> f64 {
        match value.get(field) {
            Some(Value::String(s)) => s.parse().unwrap_or(0.0),
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let params = vec![
            ("symbol".to_string(), Self::to_raw_symbol(symbol)),
            ("interval".to_string(), timeframe.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let value = self.public_get("/fapi/v1/klines", &params).await?;

        let rows = value.as_array().cloned().unwrap_or_default();
        let mut candles = Vec::with_capacity(rows.len());

        for row in rows {
            let cols = match row.as_array() {
                Some(c) if c.len() >= 6 => c.clone(),
                _ => continue,
            };
            let ts_ms = cols[0].as_i64().unwrap_or(0);
            let parse = |v: &Value| -> f64 {
                v.as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| v.as_f64())
                    .unwrap_or(0.0)
            };

            candles.push(Candle {
                symbol: symbol.to_string(),
                timestamp: DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now),
                open: parse(&cols[1]),
                high: parse(&cols[2]),
                low: parse(&cols[3]),
                close: parse(&cols[4]),
                volume: parse(&cols[5]),
            });
        }

        Ok(candles)
    }

    async fn fetch_top_symbols_by_volume(
        &self,
        limit: usize,
        exclude: &[String],
    ) -> ExchangeResult<Vec<String>> {
        let value = self.public_get("/fapi/v1/ticker/24hr", &[]).await?;
        let rows = value.as_array().cloned().unwrap_or_default();

        let mut pairs: Vec<(String, f64)> = rows
            .iter()
            .filter_map(|row| {
                let raw = row.get("symbol")?.as_str()?;
                if !raw.ends_with("USDT") {
                    return None;
                }
                let unified = Self::to_unified_symbol(raw);
                if exclude.contains(&unified) {
                    return None;
                }
                Some((unified, Self::f64_field(row, "quoteVolume")))
            })
            .collect();

        // 24h quote volume, descending
        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(pairs.into_iter().take(limit).map(|(s, _)| s).collect())
    }

    async fn fetch_ticker_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let params = vec![("symbol".to_string(), Self::to_raw_symbol(symbol))];
        let value = self.public_get("/fapi/v1/ticker/price", &params).await?;
        Ok(Self::f64_field(&value, "price"))
    }

    async fn instrument_meta(&self, symbol: &str) -> ExchangeResult<InstrumentMeta> {
        {
            let cache = self.meta_cache.read().await;
            if let Some(meta) = cache.get(symbol) {
                return Ok(*meta);
            }
        }

        let value = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        let raw = Self::to_raw_symbol(symbol);
        let symbols = value
            .get("symbols")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let entry = symbols
            .iter()
            .find(|s| s.get("symbol").and_then(Value::as_str) == Some(raw.as_str()))
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;

        let mut meta = InstrumentMeta::default();
        if let Some(filters) = entry.get("filters").and_then(Value::as_array) {
            for filter in filters {
                match filter.get("filterType").and_then(Value::as_str) {
                    Some("PRICE_FILTER") => {
                        meta.price_tick = Self::f64_field(filter, "tickSize");
                    }
                    Some("LOT_SIZE") => {
                        meta.qty_step = Self::f64_field(filter, "stepSize");
                    }
                    _ => {}
                }
            }
        }

        self.meta_cache.write().await.insert(symbol.to_string(), meta);
        Ok(meta)
    }

    async fn fetch_balance_usdt(&self) -> ExchangeResult<f64> {
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/balance", vec![])
            .await?;

        let total = value
            .as_array()
            .into_iter()
            .flatten()
            .find(|row| row.get("asset").and_then(Value::as_str) == Some("USDT"))
            .map(|row| Self::f64_field(row, "balance"))
            .unwrap_or(0.0);

        Ok(total)
    }

    async fn fetch_positions(&self) -> ExchangeResult<Vec<LivePosition>> {
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", vec![])
            .await?;

        let positions = value
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|row| {
                let raw = row.get("symbol")?.as_str()?;
                let amt = Self::f64_field(row, "positionAmt");
                if amt == 0.0 {
                    return None;
                }
                Some(LivePosition {
                    symbol: Self::to_unified_symbol(raw),
                    contracts: amt.abs(),
                    entry_price: Self::f64_field(row, "entryPrice"),
                    side: if amt > 0.0 { Side::Long } else { Side::Short },
                })
            })
            .collect();

        Ok(positions)
    }

    async fn fetch_recent_fills(
        &self,
        symbol: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<OwnTrade>> {
        let params = vec![
            ("symbol".to_string(), Self::to_raw_symbol(symbol)),
            ("limit".to_string(), limit.to_string()),
        ];
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/userTrades", params)
            .await?;

        let fills = value
            .as_array()
            .into_iter()
            .flatten()
            .map(|row| OwnTrade {
                price: Self::f64_field(row, "price"),
                quantity: Self::f64_field(row, "qty"),
                realized_pnl: Self::f64_field(row, "realizedPnl"),
                timestamp: DateTime::<Utc>::from_timestamp_millis(
                    row.get("time").and_then(|v| v.as_i64()).unwrap_or_default(),
                )
                .unwrap_or_else(Utc::now),
            })
            .collect();

        Ok(fills)
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderResult> {
        let mut params = vec![
            ("symbol".to_string(), Self::to_raw_symbol(symbol)),
            ("side".to_string(), side.to_uppercase()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), quantity.to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }

        let value = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(Self::parse_order_result(&value))
    }

    async fn submit_limit_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        price: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderResult> {
        let mut params = vec![
            ("symbol".to_string(), Self::to_raw_symbol(symbol)),
            ("side".to_string(), side.to_uppercase()),
            ("type".to_string(), "LIMIT".to_string()),
            ("timeInForce".to_string(), "GTC".to_string()),
            ("quantity".to_string(), quantity.to_string()),
            ("price".to_string(), price.to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }

        let value = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(Self::parse_order_result(&value))
    }

    async fn submit_stop_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderResult> {
        let mut params = vec![
            ("symbol".to_string(), Self::to_raw_symbol(symbol)),
            ("side".to_string(), side.to_uppercase()),
            ("type".to_string(), "STOP_MARKET".to_string()),
            ("quantity".to_string(), quantity.to_string()),
            ("stopPrice".to_string(), stop_price.to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }

        let value = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(Self::parse_order_result(&value))
    }

    async fn submit_algo_stop_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: f64,
    ) -> ExchangeResult<()> {
        // The algo channel is strict about precision, so quantity and price
        // are formatted against the instrument's tick/step first.
        let meta = self.instrument_meta(symbol).await?;
        let qty = meta.round_quantity(quantity);
        let price = meta.round_price(stop_price);

        let params = vec![
            ("symbol".to_string(), Self::to_raw_symbol(symbol)),
            ("side".to_string(), side.to_uppercase()),
            ("type".to_string(), "STOP_MARKET".to_string()),
            ("quantity".to_string(), qty.to_string()),
            ("triggerPrice".to_string(), price.to_string()),
            ("reduceOnly".to_string(), "true".to_string()),
            ("algoType".to_string(), "CONDITIONAL".to_string()),
        ];

        self.signed_request(reqwest::Method::POST, "/fapi/v1/algoOrder", params)
            .await?;
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderResult> {
        let params = vec![
            ("symbol".to_string(), Self::to_raw_symbol(symbol)),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/order", params)
            .await?;
        Ok(Self::parse_order_result(&value))
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()> {
        let params = vec![
            ("symbol".to_string(), Self::to_raw_symbol(symbol)),
            ("orderId".to_string(), order_id.to_string()),
        ];
        self.signed_request(reqwest::Method::DELETE, "/fapi/v1/order", params)
            .await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        let params = vec![("symbol".to_string(), Self::to_raw_symbol(symbol))];
        self.signed_request(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", params)
            .await?;
        Ok(())
    }

    async fn list_open_orders(&self) -> ExchangeResult<Vec<OpenOrder>> {
        // One account-wide call, deliberately without a symbol filter, to
        // avoid per-symbol rate-limit cost during the startup sweep
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/openOrders", vec![])
            .await?;

        let orders = value
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|row| {
                let raw = row.get("symbol")?.as_str()?;
                let id = row.get("orderId")?.to_string().trim_matches('"').to_string();
                Some(OpenOrder {
                    id,
                    symbol: Self::to_unified_symbol(raw),
                    reduce_only: Self::parse_bool_field(row, "reduceOnly"),
                })
            })
            .collect();

        Ok(orders)
    }

    async fn list_algo_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<AlgoOrder>> {
        let mut params = vec![];
        if let Some(s) = symbol {
            params.push(("symbol".to_string(), Self::to_raw_symbol(s)));
        }
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/openAlgoOrders", params)
            .await?;

        // The endpoint returns either a bare array or {"orders": [...]}
        let items = value
            .get("orders")
            .and_then(Value::as_array)
            .cloned()
            .or_else(|| value.as_array().cloned())
            .unwrap_or_default();

        let orders = items
            .iter()
            .filter_map(|row| {
                let raw = row.get("symbol")?.as_str()?.to_string();
                let algo_id = row.get("algoId")?.to_string().trim_matches('"').to_string();
                Some(AlgoOrder {
                    algo_id,
                    symbol: Self::to_unified_symbol(&raw),
                    raw_symbol: raw,
                    reduce_only: Self::parse_bool_field(row, "reduceOnly"),
                })
            })
            .collect();

        Ok(orders)
    }

    async fn cancel_algo_order(&self, raw_symbol: &str, algo_id: &str) -> ExchangeResult<()> {
        let params = vec![
            ("symbol".to_string(), raw_symbol.to_string()),
            ("algoId".to_string(), algo_id.to_string()),
        ];
        self.signed_request(reqwest::Method::DELETE, "/fapi/v1/algoOrder", params)
            .await?;
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let params = vec![
            ("symbol".to_string(), Self::to_raw_symbol(symbol)),
            ("leverage".to_string(), leverage.to_string()),
        ];
        self.signed_request(reqwest::Method::POST, "/fapi/v1/leverage", params)
            .await?;
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> ExchangeResult<()> {
        let params = vec![
            ("symbol".to_string(), Self::to_raw_symbol(symbol)),
            ("marginType".to_string(), mode.to_uppercase()),
        ];
        self.signed_request(reqwest::Method::POST, "/fapi/v1/marginType", params)
            .await?;
        Ok(())
    }
}
