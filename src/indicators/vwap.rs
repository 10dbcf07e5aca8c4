/// Session-anchored VWAP with standard-deviation bands
///
/// The anchor is the current UTC day: only candles from today's session
/// contribute. Bands are placed at vwap ± mult × stddev of the
/// volume-weighted typical-price deviations.

use chrono::{Timelike, Utc};

use crate::models::Candle;

#[derive(Debug, Clone, Copy)]
pub struct VwapBands {
    pub vwap: f64,
    pub upper: f64,
    pub lower: f64,
    /// Candles that contributed (session age in bars)
    pub session_bars: usize,
}

/// Compute session VWAP and bands from the tail of `candles`
///
/// Returns None when the session has no volume yet.
pub fn session_vwap_bands(candles: &[Candle], band_mult: f64) -> Option<VwapBands> {
    let today = Utc::now().date_naive();
    let session: Vec<&Candle> = candles
        .iter()
        .filter(|c| c.timestamp.date_naive() == today)
        .collect();

    vwap_bands_over(&session, band_mult)
}

/// Same computation over an explicit slice, anchored at its first candle
///
/// Used by tests and by callers that window the session themselves.
pub fn vwap_bands_over(session: &[&Candle], band_mult: f64) -> Option<VwapBands> {
    let mut pv_sum = 0.0;
    let mut vol_sum = 0.0;

    for c in session {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv_sum += typical * c.volume;
        vol_sum += c.volume;
    }

    if vol_sum <= 0.0 {
        return None;
    }

    let vwap = pv_sum / vol_sum;

    // Volume-weighted variance of typical price around the vwap
    let mut var_sum = 0.0;
    for c in session {
        let typical = (c.high + c.low + c.close) / 3.0;
        var_sum += c.volume * (typical - vwap).powi(2);
    }
    let stddev = (var_sum / vol_sum).sqrt();

    Some(VwapBands {
        vwap,
        upper: vwap + band_mult * stddev,
        lower: vwap - band_mult * stddev,
        session_bars: session.len(),
    })
}

/// Bars elapsed since the UTC session open at the entry timeframe
pub fn session_age_bars(timeframe_minutes: u32) -> usize {
    if timeframe_minutes == 0 {
        return 0;
    }
    let now = Utc::now();
    let minutes_today = now.hour() * 60 + now.minute();
    (minutes_today / timeframe_minutes) as usize
}

/// True when the latest candle's volume exceeds `mult` times the simple
/// average of the preceding `lookback` candles
pub fn is_volume_spike(candles: &[Candle], lookback: usize, mult: f64) -> bool {
    if candles.len() < lookback + 1 {
        return false;
    }

    let current = candles[candles.len() - 1].volume;
    let window = &candles[candles.len() - 1 - lookback..candles.len() - 1];
    let avg = window.iter().map(|c| c.volume).sum::<f64>() / lookback as f64;

    avg > 0.0 && current > mult * avg
}
