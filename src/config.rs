use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Operator-tunable bot parameters
///
/// Loaded from the environment at startup, overlaid with values previously
/// persisted by operator commands, and mutated live through [`SharedConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Virtual execution: no orders hit the exchange, fills priced off ticker
    pub dry_run: bool,
    /// Use the exchange testnet base URL
    pub use_testnet: bool,
    /// Operator pause: blocks new entries, keeps supervising open positions
    pub is_paused: bool,

    pub leverage: u32,
    /// Fraction of capital committed as margin per trade (fixed-fractional)
    pub risk_fraction: f64,
    /// Exchange minimum order notional in quote currency
    pub min_order_notional: f64,

    pub sl_atr_mult: f64,
    pub tp_atr_mult: f64,
    pub chandelier_mult: f64,

    pub entry_timeframe: String,
    pub htf_timeframe: String,
    pub mtf_timeframe: String,

    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub session_warmup_bars: usize,
    pub adx_threshold: f64,
    pub atr_long_len: usize,
    pub atr_ratio_mult: f64,
    pub vol_spike_mult: f64,
    pub extreme_vol_mult: f64,
    pub vwap_band_mult: f64,
    pub max_concurrent_same_dir: usize,

    /// Minutes a symbol is locked out after a losing close
    pub loss_cooldown_minutes: i64,
    /// Account equity below this triggers the fail-safe halt
    pub equity_collapse_floor: f64,

    pub reconcile_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub top_symbol_limit: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            use_testnet: false,
            is_paused: false,
            leverage: 3,
            risk_fraction: 0.005,
            min_order_notional: 6.0,
            sl_atr_mult: 1.5,
            tp_atr_mult: 2.5,
            chandelier_mult: 2.0,
            entry_timeframe: "3m".to_string(),
            htf_timeframe: "1h".to_string(),
            mtf_timeframe: "15m".to_string(),
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            session_warmup_bars: 30,
            adx_threshold: 25.0,
            atr_long_len: 200,
            atr_ratio_mult: 1.2,
            vol_spike_mult: 1.5,
            extreme_vol_mult: 2.5,
            vwap_band_mult: 2.5,
            max_concurrent_same_dir: 2,
            loss_cooldown_minutes: 45,
            equity_collapse_floor: 10.0,
            reconcile_interval_secs: 20,
            monitor_interval_secs: 10,
            top_symbol_limit: 10,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl BotConfig {
    /// Build config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dry_run: env_parse("DRY_RUN", defaults.dry_run),
            use_testnet: env_parse("USE_TESTNET", defaults.use_testnet),
            is_paused: false,
            leverage: env_parse("LEVERAGE", defaults.leverage),
            risk_fraction: env_parse("RISK_PERCENTAGE", defaults.risk_fraction),
            min_order_notional: env_parse("MIN_ORDER_NOTIONAL", defaults.min_order_notional),
            sl_atr_mult: env_parse("SL_ATR_MULT", defaults.sl_atr_mult),
            tp_atr_mult: env_parse("TP_ATR_MULT", defaults.tp_atr_mult),
            chandelier_mult: env_parse("CHANDELIER_MULT", defaults.chandelier_mult),
            entry_timeframe: std::env::var("ENTRY_TIMEFRAME")
                .unwrap_or(defaults.entry_timeframe),
            htf_timeframe: std::env::var("HTF_TIMEFRAME").unwrap_or(defaults.htf_timeframe),
            mtf_timeframe: std::env::var("MTF_TIMEFRAME").unwrap_or(defaults.mtf_timeframe),
            loss_cooldown_minutes: env_parse(
                "LOSS_COOLDOWN_MINUTES",
                defaults.loss_cooldown_minutes,
            ),
            equity_collapse_floor: env_parse(
                "EQUITY_COLLAPSE_FLOOR",
                defaults.equity_collapse_floor,
            ),
            ..defaults
        }
    }

    /// Apply one persisted key-value pair (startup restore and live mutation
    /// both funnel through here so the accepted keys stay in one place)
    pub fn apply_kv(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "dry_run" => self.dry_run = value.parse()?,
            "is_paused" => self.is_paused = value.parse()?,
            "leverage" => self.leverage = value.parse()?,
            "risk_fraction" => self.risk_fraction = value.parse()?,
            "sl_atr_mult" => self.sl_atr_mult = value.parse()?,
            "tp_atr_mult" => self.tp_atr_mult = value.parse()?,
            "chandelier_mult" => self.chandelier_mult = value.parse()?,
            "entry_timeframe" => self.entry_timeframe = value.to_string(),
            "loss_cooldown_minutes" => self.loss_cooldown_minutes = value.parse()?,
            other => anyhow::bail!("unknown config key: {}", other),
        }
        Ok(())
    }

    /// Serialized parameter snapshot attached to every trade record
    pub fn params_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Shared, live-mutable configuration handle
///
/// Injected into every component at construction. Reads take a cheap
/// snapshot; writes go through `update` so no component holds the lock
/// across an await point.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<BotConfig>>,
}

impl SharedConfig {
    pub fn new(config: BotConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> BotConfig {
        self.inner.read().unwrap().clone()
    }

    pub fn update<F: FnOnce(&mut BotConfig)>(&self, f: F) {
        let mut cfg = self.inner.write().unwrap();
        f(&mut cfg);
    }

    pub fn set_kv(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut cfg = self.inner.write().unwrap();
        cfg.apply_kv(key, value)
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(BotConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_conservative() {
        let cfg = BotConfig::default();
        assert!(cfg.dry_run);
        assert!(cfg.risk_fraction < 0.02);
        assert!(cfg.sl_atr_mult < cfg.tp_atr_mult);
    }

    #[test]
    fn test_apply_kv_known_keys() {
        let mut cfg = BotConfig::default();
        cfg.apply_kv("leverage", "5").unwrap();
        cfg.apply_kv("risk_fraction", "0.01").unwrap();
        cfg.apply_kv("dry_run", "false").unwrap();

        assert_eq!(cfg.leverage, 5);
        assert_eq!(cfg.risk_fraction, 0.01);
        assert!(!cfg.dry_run);
    }

    #[test]
    fn test_apply_kv_rejects_unknown_key() {
        let mut cfg = BotConfig::default();
        assert!(cfg.apply_kv("no_such_key", "1").is_err());
    }

    #[test]
    fn test_shared_config_update_visible_to_snapshots() {
        let shared = SharedConfig::new(BotConfig::default());
        shared.update(|c| c.is_paused = true);
        assert!(shared.snapshot().is_paused);

        shared.set_kv("leverage", "7").unwrap();
        assert_eq!(shared.snapshot().leverage, 7);
    }

    #[test]
    fn test_params_json_round_trips() {
        let cfg = BotConfig::default();
        let json = cfg.params_json();
        let parsed: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.leverage, cfg.leverage);
    }
}
