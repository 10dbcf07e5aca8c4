/// Moving Average Convergence Divergence (MACD)
///
/// MACD line = EMA(fast) - EMA(slow); signal line = EMA(period) of the
/// MACD line. The strategy only cares about the sign of the line/signal
/// spread, not the histogram magnitude.

use super::moving_average::calculate_ema_series;

/// Calculate the MACD line and signal line
///
/// Returns (macd_line, signal_line) or None if insufficient data
pub fn calculate_macd(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<(f64, f64)> {
    if prices.len() < slow + signal {
        return None;
    }

    let fast_series = calculate_ema_series(prices, fast);
    let slow_series = calculate_ema_series(prices, slow);

    // Align the two series on their tails
    let len = fast_series.len().min(slow_series.len());
    if len == 0 {
        return None;
    }
    let fast_tail = &fast_series[fast_series.len() - len..];
    let slow_tail = &slow_series[slow_series.len() - len..];

    let macd_line: Vec<f64> = fast_tail
        .iter()
        .zip(slow_tail.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = calculate_ema_series(&macd_line, signal);
    let signal_value = *signal_series.last()?;
    let macd_value = *macd_line.last()?;

    Some((macd_value, signal_value))
}
