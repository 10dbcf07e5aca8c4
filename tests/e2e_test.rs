//! End-to-end decision flow: signal detection through sizing to the
//! trailing exit, using the library's public surface only.

use chrono::Utc;
use futuresbot::config::BotConfig;
use futuresbot::indicators::calculate_atr;
use futuresbot::models::{Candle, InstrumentMeta, Side};
use futuresbot::portfolio::TrailingStopTracker;
use futuresbot::risk::RiskSizer;
use futuresbot::strategy::{EntryDecision, MarketView, StrategyEngine};

fn flat_candles(n: usize, base: f64, tf_minutes: i64) -> Vec<Candle> {
    (0..n)
        .map(|i| Candle {
            symbol: "SOL/USDT:USDT".to_string(),
            timestamp: Utc::now() + chrono::Duration::minutes(tf_minutes * i as i64),
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
                symbol: "SOL/USDT:USDT".to_string(),
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

/// Entry candles with a quiet base, a volatile sell-off into oversold,
/// and a final rejection wick off the lower band on spiked volume
fn long_setup_candles() -> Vec<Candle> {
    let mut candles = flat_candles(220, 100.0, 3);

    for i in 0..14 {
        let price = 100.0 - i as f64 * 1.5;
        candles.push(Candle {
            symbol: "SOL/USDT:USDT".to_string(),
            timestamp: Utc::now() + chrono::Duration::minutes(3 * (220 + i) as i64),
            open: price,
            high: price + 0.4,
            low: price - 2.2,
            close: price - 1.4,
            volume: 1200.0,
        });
    }

    let last_close = candles.last().map(|c| c.close).unwrap_or(80.0);
    candles.push(Candle {
        symbol: "SOL/USDT:USDT".to_string(),
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
fn test_signal_to_sized_position_to_trailing_exit() {
    let cfg = BotConfig::default();

    // 1. A bullish range setup with aligned higher-timeframe bias fires
    let entry = long_setup_candles();
    let htf = trending_candles(250, 100.0, 0.5);
    let mtf = flat_candles(60, 100.0, 15);

    let view = MarketView {
        entry_candles: &entry,
        htf_candles: &htf,
        mtf_candles: &mtf,
        order_flow: None,
        session_age_bars: 100,
        open_longs: 0,
        open_shorts: 0,
    };

    let decision = StrategyEngine::check_entry(&view, &cfg);
    let side = match decision {
        EntryDecision::Enter { side, .. } => side,
        EntryDecision::Skip { reason } => panic!("expected entry, skipped: {}", reason),
    };
    assert_eq!(side, Side::Long);

    // 2. Size it against a small account
    let atr = calculate_atr(&entry, 14).expect("atr");
    assert!(atr > 0.0);

    let entry_price = entry.last().unwrap().close;
    let meta = InstrumentMeta {
        price_tick: 0.01,
        qty_step: 0.001,
    };
    let sizer = RiskSizer {
        risk_fraction: cfg.risk_fraction,
        leverage: cfg.leverage,
        min_order_notional: cfg.min_order_notional,
        sl_atr_mult: cfg.sl_atr_mult,
        tp_atr_mult: cfg.tp_atr_mult,
    };
    let size = sizer
        .size(200.0, entry_price, atr, true, &meta)
        .expect("sized position");

    assert!(size.quantity > 0.0);
    assert!(size.notional >= cfg.min_order_notional - 1e-9);
    assert!(size.stop_loss < entry_price);
    assert!(size.take_profit > entry_price);

    // 3. Track the position with a chandelier stop and ride it up
    let mut tracker = TrailingStopTracker::new(cfg.chandelier_mult);
    tracker.register("SOL/USDT:USDT", side, entry_price, atr);
    let initial_stop = tracker.stop_price("SOL/USDT:USDT").expect("stop");
    assert!(initial_stop < entry_price);

    let rally_high = entry_price + 6.0 * atr;
    let stop_after_rally = tracker
        .update("SOL/USDT:USDT", rally_high, rally_high - atr, atr)
        .expect("updated stop");
    assert!(stop_after_rally > initial_stop);
    assert!(stop_after_rally > entry_price, "rally should lock in profit");

    // a retrace must not loosen the stop
    let stop_after_retrace = tracker
        .update("SOL/USDT:USDT", entry_price + atr, entry_price, atr)
        .expect("updated stop");
    assert_eq!(stop_after_retrace, stop_after_rally);

    // 4. Price crossing the stop triggers the exit
    assert!(!tracker.is_triggered("SOL/USDT:USDT", stop_after_rally + 0.01));
    assert!(tracker.is_triggered("SOL/USDT:USDT", stop_after_rally - 0.01));

    tracker.remove("SOL/USDT:USDT");
    assert!(tracker.stop_price("SOL/USDT:USDT").is_none());
}

#[test]
fn test_concentration_limit_blocks_portfolio_pileup() {
    let cfg = BotConfig::default();
    let entry = long_setup_candles();
    let htf = trending_candles(250, 100.0, 0.5);
    let mtf = flat_candles(60, 100.0, 15);

    let view = MarketView {
        entry_candles: &entry,
        htf_candles: &htf,
        mtf_candles: &mtf,
        order_flow: None,
        session_age_bars: 100,
        open_longs: cfg.max_concurrent_same_dir,
        open_shorts: 0,
    };

    match StrategyEngine::check_entry(&view, &cfg) {
        EntryDecision::Skip { reason } => assert!(reason.contains("concentration")),
        other => panic!("expected concentration skip, got {:?}", other),
    }
}
