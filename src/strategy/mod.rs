// Strategy decision engine
//
// Stateless per call: every decision consumes a snapshot of candles and
// portfolio counts and returns either a directional entry or a skip with
// a specific reason. Reasons exist for the logs, nothing branches on them.

use crate::config::BotConfig;
use crate::indicators::{
    atr_ratio, calculate_adx, calculate_ema, calculate_macd, calculate_rsi, is_volume_spike,
    vwap_bands_over,
};
use crate::models::{Candle, HtfBias, Momentum, OrderFlow, Regime, Side};

/// Everything the engine looks at for one symbol on one closed candle
pub struct MarketView<'a> {
    /// Entry-timeframe candles, oldest first, last one just closed
    pub entry_candles: &'a [Candle],
    /// Higher-timeframe candles for the directional bias
    pub htf_candles: &'a [Candle],
    /// Medium-timeframe candles for regime and momentum
    pub mtf_candles: &'a [Candle],
    /// External order-flow pressure hint, if a feed provides one
    pub order_flow: Option<OrderFlow>,
    /// Bars elapsed since the session anchor reset
    pub session_age_bars: usize,
    pub open_longs: usize,
    pub open_shorts: usize,
}

/// Outcome of one entry check
#[derive(Debug, Clone, PartialEq)]
pub enum EntryDecision {
    Enter { side: Side, reason: String },
    Skip { reason: String },
}

impl EntryDecision {
    fn skip(reason: impl Into<String>) -> Self {
        EntryDecision::Skip {
            reason: reason.into(),
        }
    }

    pub fn side(&self) -> Option<Side> {
        match self {
            EntryDecision::Enter { side, .. } => Some(*side),
            EntryDecision::Skip { .. } => None,
        }
    }
}

/// Higher-timeframe directional bias from EMA ordering
///
/// A buffer band around equality keeps the bias from flip-flopping when
/// the two averages run close together.
pub fn htf_bias(candles: &[Candle]) -> HtfBias {
    const BUFFER: f64 = 0.002; // 0.2% band around EMA parity

    let prices: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let (fast, slow) = match (calculate_ema(&prices, 50), calculate_ema(&prices, 200)) {
        (Some(f), Some(s)) => (f, s),
        _ => return HtfBias::Neutral,
    };

    if slow <= 0.0 {
        return HtfBias::Neutral;
    }

    let spread = (fast - slow) / slow;
    if spread > BUFFER {
        HtfBias::Bull
    } else if spread < -BUFFER {
        HtfBias::Bear
    } else {
        HtfBias::Neutral
    }
}

/// Medium-timeframe regime and momentum read
pub fn mtf_regime(candles: &[Candle], adx_threshold: f64) -> (Regime, Momentum) {
    let regime = match calculate_adx(candles, 14) {
        Some((adx, _, _)) if adx >= adx_threshold => Regime::Trend,
        _ => Regime::Range,
    };

    let prices: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let momentum = match calculate_macd(&prices, 12, 26, 9) {
        Some((macd, signal)) if macd > signal => Momentum::Bullish,
        Some((macd, signal)) if macd < signal => Momentum::Bearish,
        _ => Momentum::Neutral,
    };

    (regime, momentum)
}

pub struct StrategyEngine;

impl StrategyEngine {
    /// Check whether the latest closed entry-timeframe candle justifies
    /// a new position
    pub fn check_entry(view: &MarketView<'_>, cfg: &BotConfig) -> EntryDecision {
        let candles = view.entry_candles;

        let min_bars = cfg.atr_long_len + 1;
        if candles.len() < min_bars {
            return EntryDecision::skip(format!(
                "insufficient history: {} bars, need {}",
                candles.len(),
                min_bars
            ));
        }

        // Session anchor needs time to stabilize before the bands mean much
        if view.session_age_bars < cfg.session_warmup_bars {
            return EntryDecision::skip(format!(
                "session warmup: {}/{} bars",
                view.session_age_bars, cfg.session_warmup_bars
            ));
        }

        // Volatility-regime gate: only trade when short-term volatility is
        // abnormally elevated relative to the long window
        let ratio = match atr_ratio(candles, 14, cfg.atr_long_len) {
            Some(r) => r,
            None => return EntryDecision::skip("volatility gate: ATR unavailable"),
        };
        if ratio < cfg.atr_ratio_mult {
            return EntryDecision::skip(format!(
                "volatility gate: ATR ratio {:.2} < {:.2}",
                ratio, cfg.atr_ratio_mult
            ));
        }
        if ratio > cfg.extreme_vol_mult {
            return EntryDecision::skip(format!(
                "volatility gate: ATR ratio {:.2} extreme (> {:.2})",
                ratio, cfg.extreme_vol_mult
            ));
        }

        let bias = htf_bias(view.htf_candles);
        let (regime, momentum) = mtf_regime(view.mtf_candles, cfg.adx_threshold);

        let candidate = match regime {
            Regime::Range => Self::mean_reversion_trigger(view, cfg, bias),
            Regime::Trend => Self::momentum_trigger(view, cfg, bias, momentum),
        };

        let (side, trigger_reason) = match candidate {
            Ok(pair) => pair,
            Err(reason) => return EntryDecision::skip(reason),
        };

        // Order-flow pressure against the candidate direction vetoes it
        if let Some(flow) = view.order_flow {
            let opposed = matches!(
                (side, flow),
                (Side::Long, OrderFlow::SellPressure) | (Side::Short, OrderFlow::BuyPressure)
            );
            if opposed {
                return EntryDecision::skip(format!("order-flow veto against {}", side));
            }
        }

        // Concentration limit across the whole portfolio
        let same_dir = match side {
            Side::Long => view.open_longs,
            Side::Short => view.open_shorts,
        };
        if same_dir >= cfg.max_concurrent_same_dir {
            return EntryDecision::skip(format!(
                "concentration: {} {} positions already open (max {})",
                same_dir, side, cfg.max_concurrent_same_dir
            ));
        }

        EntryDecision::Enter {
            side,
            reason: trigger_reason,
        }
    }

    /// Range regime: fade extremes at the VWAP bands, only with the
    /// higher timeframe strictly aligned
    fn mean_reversion_trigger(
        view: &MarketView<'_>,
        cfg: &BotConfig,
        bias: HtfBias,
    ) -> std::result::Result<(Side, String), String> {
        let side = match bias {
            HtfBias::Bull => Side::Long,
            HtfBias::Bear => Side::Short,
            HtfBias::Neutral => return Err("range regime: neutral HTF bias blocks entries".into()),
        };

        Self::band_rejection_trigger(view, cfg, side, "range")
    }

    /// Trend regime: follow momentum when HTF bias and MTF momentum agree
    fn momentum_trigger(
        view: &MarketView<'_>,
        cfg: &BotConfig,
        bias: HtfBias,
        momentum: Momentum,
    ) -> std::result::Result<(Side, String), String> {
        let side = match (bias, momentum) {
            (HtfBias::Bull, Momentum::Bullish) => Side::Long,
            (HtfBias::Bear, Momentum::Bearish) => Side::Short,
            _ => {
                return Err(format!(
                    "trend regime: bias {:?} and momentum {:?} disagree",
                    bias, momentum
                ))
            }
        };

        Self::band_rejection_trigger(view, cfg, side, "trend")
    }

    /// Shared trigger: RSI at an extreme plus a rejection wick off the
    /// VWAP band, confirmed by a volume spike
    fn band_rejection_trigger(
        view: &MarketView<'_>,
        cfg: &BotConfig,
        side: Side,
        regime_tag: &str,
    ) -> std::result::Result<(Side, String), String> {
        let candles = view.entry_candles;
        let last = match candles.last() {
            Some(c) => c,
            None => return Err("no candles".into()),
        };

        let prices: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let rsi = calculate_rsi(&prices, 14).ok_or("RSI unavailable")?;

        // Bands over the session window the caller aligned for us
        let session_start = candles.len().saturating_sub(view.session_age_bars.max(1));
        let session: Vec<&Candle> = candles[session_start..].iter().collect();
        let bands = vwap_bands_over(&session, cfg.vwap_band_mult).ok_or("VWAP unavailable")?;

        match side {
            Side::Long => {
                if rsi > cfg.rsi_oversold {
                    return Err(format!(
                        "RSI {:.1} not oversold (< {:.0})",
                        rsi, cfg.rsi_oversold
                    ));
                }
                // Rejection wick: traded below the lower band, closed back above it
                if !(last.low < bands.lower && last.close > bands.lower) {
                    return Err("no rejection wick off lower band".into());
                }
            }
            Side::Short => {
                if rsi < cfg.rsi_overbought {
                    return Err(format!(
                        "RSI {:.1} not overbought (> {:.0})",
                        rsi, cfg.rsi_overbought
                    ));
                }
                if !(last.high > bands.upper && last.close < bands.upper) {
                    return Err("no rejection wick off upper band".into());
                }
            }
        }

        if !is_volume_spike(candles, 20, cfg.vol_spike_mult) {
            return Err("no volume spike confirmation".into());
        }

        Ok((
            side,
            format!(
                "{} {}: RSI {:.1}, band rejection at vwap {:.4}",
                regime_tag, side, rsi, bands.vwap
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_candles(n: usize, base: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                symbol: "TEST/USDT:USDT".to_string(),
                timestamp: Utc::now() + chrono::Duration::minutes(3 * i as i64),
                open: base,
                high: base + 0.5,
                low: base - 0.5,
                close: base,
                volume: 1000.0,
            })
            .collect()
    }

    fn trending_candles(n: usize, start: f64, step: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let price = start + step * i as f64;
                Candle {
                    symbol: "TEST/USDT:USDT".to_string(),
                    timestamp: Utc::now() + chrono::Duration::minutes(60 * i as i64),
                    open: price,
                    high: price + step.abs(),
                    low: price - step.abs(),
                    close: price + step * 0.5,
                    volume: 1000.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_htf_bias_directions() {
        let up = trending_candles(250, 100.0, 0.5);
        assert_eq!(htf_bias(&up), HtfBias::Bull);

        let down = trending_candles(250, 300.0, -0.5);
        assert_eq!(htf_bias(&down), HtfBias::Bear);

        let flat = make_candles(250, 100.0);
        assert_eq!(htf_bias(&flat), HtfBias::Neutral);
    }

    #[test]
    fn test_htf_bias_insufficient_data() {
        let few = make_candles(50, 100.0);
        assert_eq!(htf_bias(&few), HtfBias::Neutral);
    }

    #[test]
    fn test_mtf_regime_flat_market_ranges() {
        let flat = make_candles(60, 100.0);
        let (regime, _momentum) = mtf_regime(&flat, 25.0);
        assert_eq!(regime, Regime::Range);
    }

    #[test]
    fn test_mtf_momentum_follows_trend() {
        // An accelerating rally: the fast EMA pulls away from the slow
        // one, so the MACD line sits above its lagging signal. A
        // constant-step ramp would not do; both EMAs settle into the
        // same fixed lag there and line and signal coincide.
        let up: Vec<Candle> = (0..60)
            .map(|i| {
                let price = 100.0 + 0.02 * (i as f64).powi(2);
                Candle {
                    symbol: "TEST/USDT:USDT".to_string(),
                    timestamp: Utc::now() + chrono::Duration::minutes(60 * i as i64),
                    open: price,
                    high: price + 1.0,
                    low: price - 1.0,
                    close: price,
                    volume: 1000.0,
                }
            })
            .collect();
        let (_regime, momentum) = mtf_regime(&up, 25.0);
        assert_eq!(momentum, Momentum::Bullish);
    }

    fn default_view<'a>(
        entry: &'a [Candle],
        htf: &'a [Candle],
        mtf: &'a [Candle],
    ) -> MarketView<'a> {
        MarketView {
            entry_candles: entry,
            htf_candles: htf,
            mtf_candles: mtf,
            order_flow: None,
            session_age_bars: 100,
            open_longs: 0,
            open_shorts: 0,
        }
    }

    #[test]
    fn test_check_entry_rejects_short_history() {
        let cfg = BotConfig::default();
        let entry = make_candles(50, 100.0);
        let htf = make_candles(250, 100.0);
        let mtf = make_candles(60, 100.0);

        let decision = StrategyEngine::check_entry(&default_view(&entry, &htf, &mtf), &cfg);
        match decision {
            EntryDecision::Skip { reason } => assert!(reason.contains("insufficient history")),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_check_entry_rejects_session_warmup() {
        let cfg = BotConfig::default();
        let entry = make_candles(250, 100.0);
        let htf = make_candles(250, 100.0);
        let mtf = make_candles(60, 100.0);

        let mut view = default_view(&entry, &htf, &mtf);
        view.session_age_bars = 5;

        let decision = StrategyEngine::check_entry(&view, &cfg);
        match decision {
            EntryDecision::Skip { reason } => assert!(reason.contains("warmup")),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_check_entry_rejects_quiet_volatility() {
        let cfg = BotConfig::default();
        // Perfectly uniform candles: ATR ratio 1.0, below the gate
        let entry = make_candles(250, 100.0);
        let htf = make_candles(250, 100.0);
        let mtf = make_candles(60, 100.0);

        let decision = StrategyEngine::check_entry(&default_view(&entry, &htf, &mtf), &cfg);
        match decision {
            EntryDecision::Skip { reason } => assert!(reason.contains("volatility gate")),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    /// Entry candles shaped for a long: quiet history, recent volatility
    /// burst, oversold tail, final rejection wick below the lower band on
    /// spiked volume
    fn long_setup_candles() -> Vec<Candle> {
        let mut candles = make_candles(220, 100.0);

        // volatile sell-off pushing RSI deep into oversold
        for i in 0..14 {
            let price = 100.0 - i as f64 * 1.5;
            candles.push(Candle {
                symbol: "TEST/USDT:USDT".to_string(),
                timestamp: Utc::now() + chrono::Duration::minutes(3 * (220 + i) as i64),
                open: price,
                high: price + 0.4,
                low: price - 2.2,
                close: price - 1.4,
                volume: 1200.0,
            });
        }

        // rejection candle: deep wick below the band, strong close back
        // inside, volume spike
        let last_close = candles.last().map(|c| c.close).unwrap_or(80.0);
        candles.push(Candle {
            symbol: "TEST/USDT:USDT".to_string(),
            timestamp: Utc::now() + chrono::Duration::minutes(3 * 235),
            open: last_close,
            high: last_close + 4.5,
            low: last_close - 8.0,
            close: last_close + 4.0,
            volume: 6000.0,
        });

        candles
    }

    #[test]
    fn test_neutral_bias_blocks_range_entries() {
        let cfg = BotConfig::default();
        let entry = long_setup_candles();
        let htf = make_candles(250, 100.0); // neutral bias
        let mtf = make_candles(60, 100.0); // range regime

        let decision = StrategyEngine::check_entry(&default_view(&entry, &htf, &mtf), &cfg);
        match decision {
            EntryDecision::Skip { reason } => assert!(reason.contains("neutral HTF bias")),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_range_long_entry_fires_with_aligned_bias() {
        let cfg = BotConfig::default();
        let entry = long_setup_candles();
        let htf = trending_candles(250, 100.0, 0.5); // bull bias
        let mtf = make_candles(60, 100.0); // range regime

        let decision = StrategyEngine::check_entry(&default_view(&entry, &htf, &mtf), &cfg);
        assert_eq!(decision.side(), Some(Side::Long), "got {:?}", decision);
    }

    #[test]
    fn test_order_flow_veto() {
        let cfg = BotConfig::default();
        let entry = long_setup_candles();
        let htf = trending_candles(250, 100.0, 0.5);
        let mtf = make_candles(60, 100.0);

        let mut view = default_view(&entry, &htf, &mtf);
        view.order_flow = Some(OrderFlow::SellPressure);

        let decision = StrategyEngine::check_entry(&view, &cfg);
        match decision {
            EntryDecision::Skip { reason } => assert!(reason.contains("order-flow veto")),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_concentration_veto() {
        let cfg = BotConfig::default();
        let entry = long_setup_candles();
        let htf = trending_candles(250, 100.0, 0.5);
        let mtf = make_candles(60, 100.0);

        let mut view = default_view(&entry, &htf, &mtf);
        view.open_longs = cfg.max_concurrent_same_dir;

        let decision = StrategyEngine::check_entry(&view, &cfg);
        match decision {
            EntryDecision::Skip { reason } => assert!(reason.contains("concentration")),
            other => panic!("expected skip, got {:?}", other),
        }
    }
}
