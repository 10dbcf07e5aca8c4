// Technical indicators module
// Implements RSI, MA, MACD, ADX, ATR and VWAP bands for signal generation

pub mod adx;
pub mod atr;
pub mod macd;
pub mod moving_average;
pub mod rsi;
pub mod vwap;

pub use adx::calculate_adx;
pub use atr::{atr_ratio, calculate_atr};
pub use macd::calculate_macd;
pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma};
pub use rsi::calculate_rsi;
pub use vwap::{is_volume_spike, session_age_bars, session_vwap_bands, vwap_bands_over, VwapBands};

#[cfg(test)]
pub fn create_test_candles(prices: &[(f64, f64, f64, f64)]) -> Vec<crate::models::Candle> {
    use chrono::Utc;

    prices
        .iter()
        .enumerate()
        .map(|(i, &(open, high, low, close))| crate::models::Candle {
            symbol: "TEST/USDT:USDT".to_string(),
            timestamp: Utc::now() + chrono::Duration::minutes(3 * i as i64),
            open,
            high,
            low,
            close,
            volume: 1000.0,
        })
        .collect()
}
