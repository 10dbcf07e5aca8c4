/// Average True Range (ATR) indicator
///
/// Measures market volatility by calculating the average of true ranges over a period.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// Uses Wilder's smoothing (same as RSI and ADX) for the moving average.

use crate::models::Candle;

/// Calculate ATR for the given candles
///
/// Returns the current ATR value, or None if insufficient data
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 {
        return None;
    }

    let true_ranges = true_range_series(candles);
    if true_ranges.len() < period {
        return None;
    }

    // First ATR is simple average of first 'period' true ranges
    let first_atr: f64 = true_ranges.iter().take(period).sum::<f64>() / period as f64;

    // Apply Wilder's smoothing for subsequent values
    let mut atr = first_atr;
    for tr in &true_ranges[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }

    Some(atr)
}

fn true_range_series(candles: &[Candle]) -> Vec<f64> {
    let mut true_ranges = Vec::with_capacity(candles.len().saturating_sub(1));
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        true_ranges.push(tr);
    }
    true_ranges
}

/// Ratio of fast ATR to slow ATR, used as the volatility regime gate
///
/// Returns None until both windows have enough data.
pub fn atr_ratio(candles: &[Candle], fast_period: usize, slow_period: usize) -> Option<f64> {
    let fast = calculate_atr(candles, fast_period)?;
    let slow = calculate_atr(candles, slow_period)?;
    if slow <= 0.0 {
        return None;
    }
    Some(fast / slow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::create_test_candles;

    #[test]
    fn test_calculate_atr() {
        // Low volatility market
        let low_vol_prices = vec![(100.0, 101.0, 99.0, 100.0); 15];

        let candles = create_test_candles(&low_vol_prices);
        let atr = calculate_atr(&candles, 14);

        assert!(atr.is_some());
        // ATR should be around 2.0 (high-low range)
        assert!(atr.unwrap() > 1.5 && atr.unwrap() < 2.5);
    }

    #[test]
    fn test_calculate_atr_high_volatility() {
        let high_vol_prices = vec![
            (100.0, 105.0, 95.0, 102.0),
            (102.0, 110.0, 98.0, 105.0),
            (105.0, 108.0, 92.0, 95.0),
            (95.0, 103.0, 88.0, 100.0),
            (100.0, 115.0, 97.0, 110.0),
            (110.0, 112.0, 95.0, 98.0),
            (98.0, 108.0, 90.0, 105.0),
            (105.0, 120.0, 100.0, 115.0),
            (115.0, 118.0, 105.0, 110.0),
            (110.0, 125.0, 108.0, 120.0),
            (120.0, 130.0, 115.0, 125.0),
            (125.0, 128.0, 110.0, 115.0),
            (115.0, 122.0, 105.0, 118.0),
            (118.0, 130.0, 115.0, 125.0),
            (125.0, 135.0, 120.0, 130.0),
        ];

        let candles = create_test_candles(&high_vol_prices);
        let atr = calculate_atr(&candles, 14);

        assert!(atr.is_some());
        assert!(atr.unwrap() > 10.0);
    }

    #[test]
    fn test_atr_ratio_rises_with_recent_volatility() {
        // Long quiet stretch followed by a volatile burst
        let mut prices = vec![(100.0, 100.5, 99.5, 100.0); 210];
        for _ in 0..14 {
            prices.push((100.0, 106.0, 94.0, 103.0));
        }

        let candles = create_test_candles(&prices);
        let ratio = atr_ratio(&candles, 14, 200).unwrap();
        assert!(ratio > 1.2, "expected elevated ratio, got {:.3}", ratio);
    }

    #[test]
    fn test_insufficient_data() {
        let prices = vec![(100.0, 101.0, 99.0, 100.0), (100.0, 101.0, 99.0, 100.0)];

        let candles = create_test_candles(&prices);
        assert!(calculate_atr(&candles, 14).is_none());
        assert!(atr_ratio(&candles, 14, 200).is_none());
    }
}
