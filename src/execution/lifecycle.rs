//! Order lifecycle state machine
//!
//! Tracks every order and position the bot knows about and reconciles
//! that picture against the exchange. All per-symbol transitions happen
//! under one mutex; the maps here are the bot's working memory, the
//! trade log is the durable audit trail.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::config::SharedConfig;
use crate::db::Database;
use crate::exchange::{ExchangeClient, ExchangeError};
use crate::models::{OrderResult, OwnTrade, Side, TradeAction, TradeRecord};
use crate::notify::Notifier;
use crate::portfolio::TrailingStopTracker;

// Fee assumptions for the realized-R:R audit log only
const MAKER_FEE: f64 = 0.0002;
const TAKER_FEE: f64 = 0.0005;

const TRADE_LOG_CAP: usize = 200;

// A resting limit entry that hasn't filled in this long is a stale
// signal; reconciliation cancels it and frees the symbol
const PENDING_ENTRY_MAX_AGE_MINUTES: i64 = 30;

/// How a tracked position came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSource {
    Entry,
    Manual,
}

/// Position the bot is supervising
#[derive(Debug, Clone)]
pub struct ActivePosition {
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub source: PositionSource,
}

/// Limit entry submitted but not yet filled
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub order_id: String,
    pub side: Side,
    pub limit_price: f64,
    pub tp_price: f64,
    pub sl_price: f64,
    pub quantity: f64,
    pub atr: f64,
    pub submitted_at: DateTime<Utc>,
}

struct LifecycleState {
    pending: HashMap<String, PendingEntry>,
    active: HashMap<String, ActivePosition>,
    cooldowns: HashMap<String, DateTime<Utc>>,
    tracker: TrailingStopTracker,
}

/// Snapshot for the operator status command
#[derive(Debug, Clone)]
pub struct LifecycleStatus {
    pub halted: bool,
    pub paused: bool,
    pub dry_run: bool,
    pub uptime_secs: i64,
    pub open_positions: Vec<(String, Side, f64, f64)>,
    pub pending_entries: usize,
    pub cooldowns: Vec<(String, DateTime<Utc>)>,
}

/// The single owner of order and position state
///
/// One instance per process, shared across the candle handlers, the
/// reconciliation loop, the trailing monitor and the operator console.
pub struct OrderLifecycleManager {
    exchange: Arc<dyn ExchangeClient>,
    config: SharedConfig,
    db: Option<Arc<Database>>,
    notifier: Arc<Notifier>,
    state: Mutex<LifecycleState>,
    halted: AtomicBool,
    started_at: DateTime<Utc>,
    trade_log: std::sync::Mutex<VecDeque<TradeRecord>>,
}

impl OrderLifecycleManager {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        config: SharedConfig,
        db: Option<Arc<Database>>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let chandelier_mult = config.snapshot().chandelier_mult;
        Self {
            exchange,
            config,
            db,
            notifier,
            state: Mutex::new(LifecycleState {
                pending: HashMap::new(),
                active: HashMap::new(),
                cooldowns: HashMap::new(),
                tracker: TrailingStopTracker::new(chandelier_mult),
            }),
            halted: AtomicBool::new(false),
            started_at: Utc::now(),
            trade_log: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    // -- halt flag --

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Set the fail-safe halt; blocks new entries, never in-flight
    /// supervision of open positions
    pub fn halt(&self, reason: &str) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            tracing::error!("🛑 HALT set: {}", reason);
            self.notifier.send_detached(format!("🛑 HALT: {}", reason));
        }
    }

    pub fn clear_halt(&self) {
        self.halted.store(false, Ordering::SeqCst);
        tracing::warn!("halt flag cleared by operator");
    }

    // -- audit trail --

    async fn record_trade(&self, record: TradeRecord) {
        tracing::info!(
            "📝 {} {} qty {} @ {} pnl {:?} ({})",
            record.action.as_str(),
            record.symbol,
            record.quantity,
            record.price,
            record.realized_pnl,
            record.reason
        );

        {
            let mut log = self.trade_log.lock().unwrap_or_else(|e| e.into_inner());
            log.push_back(record.clone());
            while log.len() > TRADE_LOG_CAP {
                log.pop_front();
            }
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.insert_trade(&record).await {
                tracing::error!("failed to persist trade record: {}", e);
            }
        }
    }

    /// In-memory tail of the audit trail (newest last)
    pub fn recent_trades(&self) -> Vec<TradeRecord> {
        self.trade_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    // -- entry path --

    /// Open a position at market
    ///
    /// Returns Ok(false) when a precondition rejects the entry; only
    /// infrastructure failures surface as errors.
    pub async fn place_entry(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        atr: f64,
        reason: &str,
    ) -> anyhow::Result<bool> {
        if self.is_halted() {
            tracing::warn!("{}: entry rejected, halt flag set", symbol);
            return Ok(false);
        }

        let cfg = self.config.snapshot();
        let mut state = self.state.lock().await;

        if !self.entry_allowed(&mut state, symbol) {
            return Ok(false);
        }

        if !cfg.dry_run {
            self.setup_symbol(symbol, cfg.leverage).await;
        }

        // Everything fallible happens BEFORE the order goes out. Once a
        // live fill exists the position must be tracked no matter what,
        // so the fallback price is fetched up front.
        let meta = self.exchange.instrument_meta(symbol).await?;
        let reference_price = self.exchange.fetch_ticker_price(symbol).await?;

        let fill_price = if cfg.dry_run {
            reference_price
        } else {
            let order = self
                .exchange
                .submit_market_order(symbol, side.entry_order_side(), quantity, false)
                .await?;
            match self.resolve_fill_price(symbol, &order).await {
                Some(p) => p,
                None => {
                    tracing::warn!(
                        "{}: fill price unavailable, estimating from pre-trade ticker {:.4}",
                        symbol,
                        reference_price
                    );
                    reference_price
                }
            }
        };

        let (tp_price, sl_price) = match side {
            Side::Long => (
                meta.round_price(fill_price + cfg.tp_atr_mult * atr),
                meta.round_price(fill_price - cfg.sl_atr_mult * atr),
            ),
            Side::Short => (
                meta.round_price(fill_price - cfg.tp_atr_mult * atr),
                meta.round_price(fill_price + cfg.sl_atr_mult * atr),
            ),
        };

        // Track BEFORE exit orders: a tracked-but-unprotected position is
        // recoverable by the monitor, an untracked one is invisible
        state.active.insert(
            symbol.to_string(),
            ActivePosition {
                side,
                entry_price: fill_price,
                quantity,
                entry_time: Utc::now(),
                source: PositionSource::Entry,
            },
        );
        state.tracker.set_multiplier(cfg.chandelier_mult);
        state.tracker.register(symbol, side, fill_price, atr);

        if !cfg.dry_run {
            self.place_paired_exit_orders(symbol, side, quantity, tp_price, sl_price)
                .await;
        }

        let record = TradeRecord::new(TradeAction::for_side(side), symbol, fill_price, quantity)
            .with_reason(reason)
            .dry_run(cfg.dry_run);
        let record = TradeRecord {
            params_json: Some(cfg.params_json()),
            ..record
        };
        drop(state);

        self.record_trade(record).await;
        self.notifier.send_detached(format!(
            "{} {} {} qty {} @ {:.4}\nTP {:.4} / SL {:.4}\n{}",
            if cfg.dry_run { "🧪" } else { "🚀" },
            side,
            symbol,
            quantity,
            fill_price,
            tp_price,
            sl_price,
            reason
        ));

        Ok(true)
    }

    /// Open a position with a resting limit order, tracked as pending
    /// until the fill shows up in reconciliation
    pub async fn place_limit_entry(
        &self,
        symbol: &str,
        side: Side,
        limit_price: f64,
        quantity: f64,
        atr: f64,
    ) -> anyhow::Result<bool> {
        if self.is_halted() {
            tracing::warn!("{}: limit entry rejected, halt flag set", symbol);
            return Ok(false);
        }

        let cfg = self.config.snapshot();
        let mut state = self.state.lock().await;

        if !self.entry_allowed(&mut state, symbol) {
            return Ok(false);
        }
        if cfg.dry_run {
            tracing::info!("{}: limit entries skipped in dry-run", symbol);
            return Ok(false);
        }

        self.setup_symbol(symbol, cfg.leverage).await;

        let meta = self.exchange.instrument_meta(symbol).await?;
        let limit_price = meta.round_price(limit_price);
        let (tp_price, sl_price) = match side {
            Side::Long => (
                meta.round_price(limit_price + cfg.tp_atr_mult * atr),
                meta.round_price(limit_price - cfg.sl_atr_mult * atr),
            ),
            Side::Short => (
                meta.round_price(limit_price - cfg.tp_atr_mult * atr),
                meta.round_price(limit_price + cfg.sl_atr_mult * atr),
            ),
        };

        let order = self
            .exchange
            .submit_limit_order(symbol, side.entry_order_side(), quantity, limit_price, false)
            .await?;

        state.pending.insert(
            symbol.to_string(),
            PendingEntry {
                order_id: order.id,
                side,
                limit_price,
                tp_price,
                sl_price,
                quantity,
                atr,
                submitted_at: Utc::now(),
            },
        );

        tracing::info!("{}: limit {} entry resting at {:.4}", symbol, side, limit_price);
        Ok(true)
    }

    /// Precondition gate shared by both entry paths; expired cooldowns
    /// are cleaned up here
    fn entry_allowed(&self, state: &mut LifecycleState, symbol: &str) -> bool {
        if state.pending.contains_key(symbol) || state.active.contains_key(symbol) {
            tracing::debug!("{}: entry rejected, already tracked", symbol);
            return false;
        }

        if let Some(until) = state.cooldowns.get(symbol).copied() {
            if Utc::now() < until {
                tracing::info!("{}: entry rejected, loss cooldown until {}", symbol, until);
                return false;
            }
            state.cooldowns.remove(symbol);
        }

        true
    }

    /// Idempotent leverage/margin-mode setup; "already set" rejections
    /// are success
    async fn setup_symbol(&self, symbol: &str, leverage: u32) {
        match self.exchange.set_margin_mode(symbol, "isolated").await {
            Ok(()) | Err(ExchangeError::Benign(_)) => {}
            Err(e) => tracing::warn!("{}: set_margin_mode failed: {}", symbol, e),
        }
        if let Err(e) = self.exchange.set_leverage(symbol, leverage).await {
            tracing::warn!("{}: set_leverage failed: {}", symbol, e);
        }
    }

    /// Fill price chain: order average, then most recent own trade
    async fn resolve_fill_price(&self, symbol: &str, order: &OrderResult) -> Option<f64> {
        if let Some(avg) = order.average_price {
            if avg > 0.0 {
                return Some(avg);
            }
        }

        match self.exchange.fetch_recent_fills(symbol, 1).await {
            Ok(fills) => fills.last().map(|f| f.price).filter(|p| *p > 0.0),
            Err(e) => {
                tracing::warn!("{}: fetch_recent_fills failed: {}", symbol, e);
                None
            }
        }
    }

    /// Close price and realized PnL from the fills belonging to this
    /// position; fills predating its entry are other trades' history
    fn readback_from_fills(fills: &[OwnTrade], position: &ActivePosition) -> (f64, f64) {
        let own: Vec<_> = fills
            .iter()
            .filter(|f| f.timestamp >= position.entry_time)
            .collect();
        let price = own
            .last()
            .map(|f| f.price)
            .unwrap_or(position.entry_price);
        let pnl = own.iter().map(|f| f.realized_pnl).sum::<f64>();
        (price, pnl)
    }

    /// Place the reduce-only TP limit and SL stop pair
    ///
    /// Returns whether both protective legs landed; the caller never
    /// untracks the position on failure here.
    pub async fn place_paired_exit_orders(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        tp_price: f64,
        sl_price: f64,
    ) -> bool {
        let exit_side = side.exit_order_side();

        // Fee-adjusted R:R, audit only: maker on the TP leg, taker on the stop
        let entry_mid = (tp_price + sl_price) / 2.0;
        let reward = (tp_price - entry_mid).abs() - tp_price * MAKER_FEE;
        let risk = (entry_mid - sl_price).abs() + sl_price * TAKER_FEE;
        if risk > 0.0 {
            tracing::info!("{}: fee-adjusted R:R {:.2}", symbol, reward / risk);
        }

        let tp_ok = match self
            .exchange
            .submit_limit_order(symbol, exit_side, quantity, tp_price, true)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("{}: take-profit order failed: {}", symbol, e);
                self.notifier
                    .send_detached(format!("⚠️ {} take-profit placement failed: {}", symbol, e));
                false
            }
        };

        let sl_ok = match self
            .exchange
            .submit_stop_market_order(symbol, exit_side, quantity, sl_price, true)
            .await
        {
            Ok(_) => true,
            Err(ExchangeError::UnsupportedOrderType) => {
                // This venue wants conditional orders on its algo channel
                tracing::info!("{}: stop rejected on standard channel, using algo channel", symbol);
                match self
                    .exchange
                    .submit_algo_stop_order(symbol, exit_side, quantity, sl_price)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!("{}: algo stop order failed: {}", symbol, e);
                        self.notifier
                            .send_detached(format!("⚠️ {} stop placement failed: {}", symbol, e));
                        false
                    }
                }
            }
            Err(e) => {
                tracing::error!("{}: stop order failed: {}", symbol, e);
                self.notifier
                    .send_detached(format!("⚠️ {} stop placement failed: {}", symbol, e));
                false
            }
        };

        tp_ok && sl_ok
    }

    /// Cancel a resting limit entry; "order not found" means it already
    /// filled or expired exchange-side and counts as success
    pub async fn cancel_pending_entry(&self, symbol: &str, reason: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let pending = match state.pending.remove(symbol) {
            Some(p) => p,
            None => return Ok(false),
        };

        match self.exchange.cancel_order(&pending.order_id, symbol).await {
            Ok(()) | Err(ExchangeError::OrderNotFound) => {}
            Err(e) => {
                tracing::error!("{}: cancel pending entry failed: {}", symbol, e);
            }
        }

        let record = TradeRecord::new(
            TradeAction::Canceled,
            symbol,
            pending.limit_price,
            pending.quantity,
        )
        .with_reason(reason);
        drop(state);

        self.record_trade(record).await;
        Ok(true)
    }

    // -- reconciliation --

    /// Reconcile local tracking against live exchange state
    ///
    /// Absorbs externally opened positions as MANUAL, finalizes
    /// externally closed ones (orphan-order cleanup, PnL readback,
    /// cooldown arming). Idempotent: a second run with no exchange-side
    /// change records nothing.
    pub async fn check_active_positions_state(&self) -> anyhow::Result<()> {
        let cfg = self.config.snapshot();
        if cfg.dry_run {
            // Virtual positions have no exchange-side counterpart
            return Ok(());
        }

        let live = self.exchange.fetch_positions().await?;
        let live_by_symbol: HashMap<String, _> =
            live.into_iter().map(|p| (p.symbol.clone(), p)).collect();

        let mut state = self.state.lock().await;

        // Pending limit entries whose position showed up have filled
        let filled: Vec<String> = state
            .pending
            .keys()
            .filter(|s| live_by_symbol.contains_key(*s))
            .cloned()
            .collect();
        for symbol in filled {
            if let Some(pending) = state.pending.remove(&symbol) {
                tracing::info!("{}: limit entry filled", symbol);
                state.active.insert(
                    symbol.clone(),
                    ActivePosition {
                        side: pending.side,
                        entry_price: pending.limit_price,
                        quantity: pending.quantity,
                        entry_time: Utc::now(),
                        source: PositionSource::Entry,
                    },
                );
                state
                    .tracker
                    .register(&symbol, pending.side, pending.limit_price, pending.atr);

                self.place_paired_exit_orders(
                    &symbol,
                    pending.side,
                    pending.quantity,
                    pending.tp_price,
                    pending.sl_price,
                )
                .await;

                let record = TradeRecord::new(
                    TradeAction::for_side(pending.side),
                    &symbol,
                    pending.limit_price,
                    pending.quantity,
                )
                .with_reason("limit entry filled");
                self.record_trade(record).await;
            }
        }

        // Absorb positions opened outside the bot into supervision
        let unknown: Vec<String> = live_by_symbol
            .keys()
            .filter(|s| !state.active.contains_key(*s))
            .cloned()
            .collect();
        for symbol in unknown {
            let pos = &live_by_symbol[&symbol];
            tracing::warn!(
                "{}: untracked {} position of {} contracts found, absorbing as MANUAL",
                symbol,
                pos.side,
                pos.contracts
            );
            state.active.insert(
                symbol.clone(),
                ActivePosition {
                    side: pos.side,
                    entry_price: pos.entry_price,
                    quantity: pos.contracts,
                    entry_time: Utc::now(),
                    source: PositionSource::Manual,
                },
            );

            let record = TradeRecord::new(
                TradeAction::Manual,
                &symbol,
                pos.entry_price,
                pos.contracts,
            )
            .with_reason("externally opened position absorbed");
            self.record_trade(record).await;
            self.notifier
                .send_detached(format!("👀 absorbed manual {} position on {}", pos.side, symbol));
        }

        // Finalize positions the exchange no longer holds
        let closed: Vec<String> = state
            .active
            .keys()
            .filter(|s| !live_by_symbol.contains_key(*s))
            .cloned()
            .collect();
        for symbol in closed {
            if let Err(e) = self.finalize_external_close(&mut state, &symbol, &cfg).await {
                // One symbol's failure never aborts the sweep
                tracing::error!("{}: close reconciliation failed: {}", symbol, e);
            }
        }

        // Pending entries whose order died exchange-side (expired,
        // canceled by the operator) or that sat unfilled too long must
        // be dropped, or entry_allowed blocks the symbol forever
        let dropped: Vec<(String, String)> = if state.pending.is_empty() {
            Vec::new()
        } else {
            let open_ids: HashSet<String> = match self.exchange.list_open_orders().await {
                Ok(orders) => orders.into_iter().map(|o| o.id).collect(),
                Err(e) => {
                    tracing::warn!("pending-entry sweep: list_open_orders failed: {}", e);
                    return Ok(());
                }
            };
            let now = Utc::now();
            state
                .pending
                .iter()
                .filter_map(|(symbol, pending)| {
                    if !open_ids.contains(&pending.order_id) {
                        Some((symbol.clone(), "entry order gone from exchange".to_string()))
                    } else if (now - pending.submitted_at).num_minutes()
                        >= PENDING_ENTRY_MAX_AGE_MINUTES
                    {
                        Some((symbol.clone(), "entry unfilled past staleness window".to_string()))
                    } else {
                        None
                    }
                })
                .collect()
        };
        drop(state);

        for (symbol, reason) in dropped {
            if let Err(e) = self.cancel_pending_entry(&symbol, &reason).await {
                tracing::error!("{}: pending entry cleanup failed: {}", symbol, e);
            }
        }

        Ok(())
    }

    async fn finalize_external_close(
        &self,
        state: &mut LifecycleState,
        symbol: &str,
        cfg: &crate::config::BotConfig,
    ) -> anyhow::Result<()> {
        let position = match state.active.get(symbol) {
            Some(p) => p.clone(),
            None => return Ok(()),
        };

        // Remove orphaned protective legs on both channels
        if let Err(e) = self.exchange.cancel_all_orders(symbol).await {
            tracing::warn!("{}: cancel_all_orders failed: {}", symbol, e);
        }
        match self.exchange.list_algo_orders(Some(symbol)).await {
            Ok(orders) => {
                for order in orders {
                    if let Err(e) = self
                        .exchange
                        .cancel_algo_order(&order.raw_symbol, &order.algo_id)
                        .await
                    {
                        tracing::warn!("{}: cancel algo order {} failed: {}", symbol, order.algo_id, e);
                    }
                }
            }
            Err(e) => tracing::warn!("{}: list_algo_orders failed: {}", symbol, e),
        }

        // Read realized PnL back from our own fills; older fills on the
        // same symbol belong to previous trades and must not leak in
        let (close_price, pnl) = match self.exchange.fetch_recent_fills(symbol, 5).await {
            Ok(fills) => Self::readback_from_fills(&fills, &position),
            Err(e) => {
                tracing::warn!("{}: fetch_recent_fills failed: {}", symbol, e);
                (position.entry_price, 0.0)
            }
        };

        self.close_locked(state, symbol, close_price, pnl, "closed on exchange", cfg)
            .await;
        Ok(())
    }

    /// Shared close finalization: record, cooldown, untrack, notify.
    /// Caller holds the state lock.
    async fn close_locked(
        &self,
        state: &mut LifecycleState,
        symbol: &str,
        close_price: f64,
        pnl: f64,
        reason: &str,
        cfg: &crate::config::BotConfig,
    ) {
        let position = match state.active.remove(symbol) {
            Some(p) => p,
            None => return,
        };
        state.tracker.remove(symbol);

        if pnl < 0.0 {
            let until = Utc::now() + Duration::minutes(cfg.loss_cooldown_minutes);
            state.cooldowns.insert(symbol.to_string(), until);
            tracing::info!("{}: loss cooldown armed until {}", symbol, until);
        }

        let record = TradeRecord::new(
            TradeAction::Closed,
            symbol,
            close_price,
            position.quantity,
        )
        .with_reason(reason)
        .with_pnl(pnl)
        .dry_run(cfg.dry_run);
        self.record_trade(record).await;

        let emoji = if pnl >= 0.0 { "✅" } else { "🔻" };
        self.notifier.send_detached(format!(
            "{} {} {} closed @ {:.4}, PnL {:.2} USDT ({})",
            emoji, position.side, symbol, close_price, pnl, reason
        ));
    }

    /// Actively close a tracked position (trailing stop, time exit,
    /// operator command). Cancels protective legs first so the close
    /// cannot race them into duplicate exposure.
    pub async fn force_close(&self, symbol: &str, reason: &str) -> anyhow::Result<bool> {
        let cfg = self.config.snapshot();
        let mut state = self.state.lock().await;

        let position = match state.active.get(symbol) {
            Some(p) => p.clone(),
            None => return Ok(false),
        };

        let (close_price, pnl) = if cfg.dry_run {
            let price = self.exchange.fetch_ticker_price(symbol).await?;
            let direction = match position.side {
                Side::Long => 1.0,
                Side::Short => -1.0,
            };
            let pnl = (price - position.entry_price) * position.quantity * direction;
            (price, pnl)
        } else {
            if let Err(e) = self.exchange.cancel_all_orders(symbol).await {
                tracing::warn!("{}: cancel_all_orders failed: {}", symbol, e);
            }
            if let Ok(orders) = self.exchange.list_algo_orders(Some(symbol)).await {
                for order in orders {
                    let _ = self
                        .exchange
                        .cancel_algo_order(&order.raw_symbol, &order.algo_id)
                        .await;
                }
            }

            self.exchange
                .close_position_market(symbol, position.side, position.quantity)
                .await?;

            match self.exchange.fetch_recent_fills(symbol, 5).await {
                Ok(fills) => Self::readback_from_fills(&fills, &position),
                Err(_) => (position.entry_price, 0.0),
            }
        };

        self.close_locked(&mut state, symbol, close_price, pnl, reason, &cfg)
            .await;
        Ok(true)
    }

    // -- startup sweep --

    /// Rebuild tracking from live exchange state and clear stale orders
    ///
    /// Runs once at startup. One account-wide open-order enumeration on
    /// each channel; every order for a symbol with no live position is
    /// canceled, protective orders for live positions are preserved.
    pub async fn sync_state_from_exchange(&self) -> anyhow::Result<()> {
        let live = self.exchange.fetch_positions().await?;
        let mut state = self.state.lock().await;

        for pos in &live {
            tracing::info!(
                "restoring {} {} position: {} contracts @ {:.4}",
                pos.symbol,
                pos.side,
                pos.contracts,
                pos.entry_price
            );
            state.active.insert(
                pos.symbol.clone(),
                ActivePosition {
                    side: pos.side,
                    entry_price: pos.entry_price,
                    quantity: pos.contracts,
                    entry_time: Utc::now(),
                    source: PositionSource::Manual,
                },
            );
        }

        match self.exchange.list_open_orders().await {
            Ok(orders) => {
                for order in orders {
                    if state.active.contains_key(&order.symbol) {
                        continue; // protective legs for a live position stay
                    }
                    tracing::warn!(
                        "{}: canceling stale order {} (reduce_only={})",
                        order.symbol,
                        order.id,
                        order.reduce_only
                    );
                    if let Err(e) = self.exchange.cancel_order(&order.id, &order.symbol).await {
                        tracing::error!("{}: stale order cancel failed: {}", order.symbol, e);
                    }
                }
            }
            Err(e) => tracing::error!("startup open-order sweep failed: {}", e),
        }

        match self.exchange.list_algo_orders(None).await {
            Ok(orders) => {
                for order in orders {
                    if state.active.contains_key(&order.symbol) {
                        continue;
                    }
                    tracing::warn!(
                        "{}: canceling stale algo order {}",
                        order.symbol,
                        order.algo_id
                    );
                    if let Err(e) = self
                        .exchange
                        .cancel_algo_order(&order.raw_symbol, &order.algo_id)
                        .await
                    {
                        tracing::error!("{}: stale algo cancel failed: {}", order.symbol, e);
                    }
                }
            }
            Err(e) => tracing::error!("startup algo-order sweep failed: {}", e),
        }

        let restored = state.active.len();
        drop(state);
        if restored > 0 {
            self.notifier
                .send_detached(format!("♻️ restored {} live position(s) at startup", restored));
        }

        Ok(())
    }

    /// Balance sanity check; equity under the collapse floor is the one
    /// error class that halts instead of being absorbed
    pub async fn check_state_mismatch(&self) -> anyhow::Result<f64> {
        let balance = self.exchange.fetch_balance_usdt().await?;
        let floor = self.config.snapshot().equity_collapse_floor;

        if balance < floor {
            self.halt(&format!(
                "equity collapse: balance {:.2} below floor {:.2}",
                balance, floor
            ));
        }

        Ok(balance)
    }

    // -- trailing exits --

    /// Advance a symbol's chandelier stop for a closed candle and force
    /// the exit when price has crossed it
    pub async fn run_trailing_check(
        &self,
        symbol: &str,
        high: f64,
        low: f64,
        atr: f64,
        last_price: f64,
    ) -> anyhow::Result<()> {
        let triggered = {
            let mut state = self.state.lock().await;
            match state.tracker.update(symbol, high, low, atr) {
                Some(stop) => {
                    tracing::debug!("{}: trailing stop at {:.4}", symbol, stop);
                    state.tracker.is_triggered(symbol, last_price)
                }
                None => false,
            }
        };

        if triggered {
            tracing::info!("{}: chandelier stop hit at {:.4}", symbol, last_price);
            self.force_close(symbol, "chandelier trailing stop").await?;
        }

        Ok(())
    }

    // -- panic --

    /// Cancel everything, flatten everything, then halt
    pub async fn panic_close_all(&self) -> anyhow::Result<usize> {
        self.halt("operator panic");

        let cfg = self.config.snapshot();
        let mut state = self.state.lock().await;

        // Resting limit entries first
        let pending_symbols: Vec<String> = state.pending.keys().cloned().collect();
        for symbol in pending_symbols {
            if let Some(p) = state.pending.remove(&symbol) {
                match self.exchange.cancel_order(&p.order_id, &symbol).await {
                    Ok(()) | Err(ExchangeError::OrderNotFound) => {}
                    Err(e) => tracing::error!("{}: panic cancel failed: {}", symbol, e),
                }
            }
        }

        let symbols: Vec<String> = state.active.keys().cloned().collect();
        let mut closed = 0usize;

        for symbol in &symbols {
            let position = match state.active.get(symbol) {
                Some(p) => p.clone(),
                None => continue,
            };

            if !cfg.dry_run {
                if let Err(e) = self.exchange.cancel_all_orders(symbol).await {
                    tracing::warn!("{}: panic cancel_all failed: {}", symbol, e);
                }
                if let Ok(orders) = self.exchange.list_algo_orders(Some(symbol)).await {
                    for order in orders {
                        let _ = self
                            .exchange
                            .cancel_algo_order(&order.raw_symbol, &order.algo_id)
                            .await;
                    }
                }
                if let Err(e) = self
                    .exchange
                    .close_position_market(symbol, position.side, position.quantity)
                    .await
                {
                    tracing::error!("{}: panic close failed: {}", symbol, e);
                    continue;
                }
            }

            state.active.remove(symbol);
            state.tracker.remove(symbol);
            closed += 1;

            let record = TradeRecord::new(
                TradeAction::Panic,
                symbol,
                position.entry_price,
                position.quantity,
            )
            .with_reason("operator panic close")
            .dry_run(cfg.dry_run);
            self.record_trade(record).await;
        }

        drop(state);
        self.notifier
            .send_detached(format!("🚨 PANIC: flattened {} position(s), halted", closed));
        Ok(closed)
    }

    // -- status --

    pub async fn status(&self) -> LifecycleStatus {
        let cfg = self.config.snapshot();
        let state = self.state.lock().await;

        LifecycleStatus {
            halted: self.is_halted(),
            paused: cfg.is_paused,
            dry_run: cfg.dry_run,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            open_positions: state
                .active
                .iter()
                .map(|(s, p)| (s.clone(), p.side, p.entry_price, p.quantity))
                .collect(),
            pending_entries: state.pending.len(),
            cooldowns: state
                .cooldowns
                .iter()
                .map(|(s, t)| (s.clone(), *t))
                .collect(),
        }
    }

    /// Symbols with a tracked trailing stop, for the monitor loop
    pub async fn trailing_symbols(&self) -> Vec<String> {
        self.state.lock().await.tracker.symbols()
    }

    /// Same-direction open counts for the strategy concentration check
    pub async fn direction_counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        let longs = state
            .active
            .values()
            .filter(|p| p.side == Side::Long)
            .count();
        let shorts = state.active.len() - longs;
        (longs, shorts)
    }

    pub async fn is_tracked(&self, symbol: &str) -> bool {
        let state = self.state.lock().await;
        state.active.contains_key(symbol) || state.pending.contains_key(symbol)
    }

    #[cfg(test)]
    pub(crate) async fn set_cooldown_for_test(&self, symbol: &str, until: DateTime<Utc>) {
        self.state
            .lock()
            .await
            .cooldowns
            .insert(symbol.to_string(), until);
    }

    #[cfg(test)]
    pub(crate) async fn set_pending_submitted_at_for_test(&self, symbol: &str, when: DateTime<Utc>) {
        if let Some(pending) = self.state.lock().await.pending.get_mut(symbol) {
            pending.submitted_at = when;
        }
    }
}
