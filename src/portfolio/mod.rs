// Trailing-stop portfolio state (chandelier exits)

use std::collections::HashMap;

use crate::models::Side;

/// Per-symbol chandelier state
///
/// `extreme` is the running high-water (LONG) or low-water (SHORT) mark;
/// `stop` only ever moves in the favorable direction, even when the
/// extreme retraces.
#[derive(Debug, Clone)]
pub struct TrailingStop {
    pub side: Side,
    pub entry_price: f64,
    pub extreme: f64,
    pub stop: f64,
    pub atr: f64,
}

/// Tracks chandelier trailing stops for every open position
///
/// One entry per symbol; lifetime mirrors the active-position map, with
/// reconciliation removing orphans. Callers wrap the tracker in their own
/// lock, mutation here is plain and synchronous.
pub struct TrailingStopTracker {
    multiplier: f64,
    stops: HashMap<String, TrailingStop>,
}

impl TrailingStopTracker {
    pub fn new(multiplier: f64) -> Self {
        Self {
            multiplier,
            stops: HashMap::new(),
        }
    }

    pub fn set_multiplier(&mut self, multiplier: f64) {
        self.multiplier = multiplier;
    }

    /// Start tracking a freshly opened position
    ///
    /// The extreme seeds at the entry price, so the initial stop sits a
    /// full ATR multiple away from entry.
    pub fn register(&mut self, symbol: &str, side: Side, entry_price: f64, atr: f64) {
        let stop = match side {
            Side::Long => entry_price - self.multiplier * atr,
            Side::Short => entry_price + self.multiplier * atr,
        };
        self.stops.insert(
            symbol.to_string(),
            TrailingStop {
                side,
                entry_price,
                extreme: entry_price,
                stop,
                atr,
            },
        );
    }

    /// Advance the stop for a new candle; returns the (possibly unchanged)
    /// stop, or None if the symbol is untracked
    pub fn update(&mut self, symbol: &str, high: f64, low: f64, atr: f64) -> Option<f64> {
        let state = self.stops.get_mut(symbol)?;
        state.atr = atr;

        match state.side {
            Side::Long => {
                if high > state.extreme {
                    state.extreme = high;
                }
                let candidate = state.extreme - self.multiplier * atr;
                if candidate > state.stop {
                    state.stop = candidate;
                }
            }
            Side::Short => {
                if low < state.extreme {
                    state.extreme = low;
                }
                let candidate = state.extreme + self.multiplier * atr;
                if candidate < state.stop {
                    state.stop = candidate;
                }
            }
        }

        Some(state.stop)
    }

    /// Has price crossed the stop in the adverse direction
    pub fn is_triggered(&self, symbol: &str, price: f64) -> bool {
        match self.stops.get(symbol) {
            Some(s) => match s.side {
                Side::Long => price <= s.stop,
                Side::Short => price >= s.stop,
            },
            None => false,
        }
    }

    pub fn stop_price(&self, symbol: &str) -> Option<f64> {
        self.stops.get(symbol).map(|s| s.stop)
    }

    pub fn get(&self, symbol: &str) -> Option<&TrailingStop> {
        self.stops.get(symbol)
    }

    pub fn remove(&mut self, symbol: &str) -> Option<TrailingStop> {
        self.stops.remove(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.stops.keys().cloned().collect()
    }

    pub fn open_longs(&self) -> usize {
        self.stops.values().filter(|s| s.side == Side::Long).count()
    }

    pub fn open_shorts(&self) -> usize {
        self.stops
            .values()
            .filter(|s| s.side == Side::Short)
            .count()
    }

    /// Drop tracked symbols that no longer have a live position
    pub fn retain_symbols(&mut self, live: &[String]) {
        self.stops.retain(|symbol, _| live.contains(symbol));
    }
}
