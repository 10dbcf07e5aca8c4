/// Fixed-fractional position sizing
///
/// Margin committed per trade is a fixed fraction of account capital,
/// clamped between the exchange minimum and a near-total-capital ceiling.
/// Notional exposure is margin times leverage; the contract quantity is
/// floored to the instrument's step so exposure never rounds up.

use crate::models::InstrumentMeta;

#[derive(Debug, Clone, Copy)]
pub struct PositionSize {
    pub margin: f64,
    pub notional: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

pub struct RiskSizer {
    pub risk_fraction: f64,
    pub leverage: u32,
    pub min_order_notional: f64,
    pub sl_atr_mult: f64,
    pub tp_atr_mult: f64,
}

impl RiskSizer {
    /// Size a position for the given capital, entry price and ATR
    ///
    /// `is_long` picks which side of entry the stop and target land on.
    /// Returns None when capital cannot cover even the minimum margin or
    /// the floored quantity comes out to zero.
    pub fn size(
        &self,
        capital: f64,
        entry_price: f64,
        atr: f64,
        is_long: bool,
        meta: &InstrumentMeta,
    ) -> Option<PositionSize> {
        if capital <= 0.0 || entry_price <= 0.0 || atr <= 0.0 {
            return None;
        }

        let leverage = self.leverage.max(1) as f64;

        // Margin floor: smallest margin that satisfies the exchange's
        // minimum notional at this leverage
        let min_margin = self.min_order_notional / leverage;
        // Margin ceiling: never commit the whole account to one trade
        let max_margin = capital * 0.95;

        // Dust account: even the exchange minimum would blow the ceiling
        if min_margin > max_margin {
            return None;
        }

        let margin = (capital * self.risk_fraction).clamp(min_margin, max_margin);

        let notional = margin * leverage;
        let quantity = meta.round_quantity(notional / entry_price);
        if quantity <= 0.0 {
            return None;
        }

        let (stop_loss, take_profit) = if is_long {
            (
                entry_price - self.sl_atr_mult * atr,
                entry_price + self.tp_atr_mult * atr,
            )
        } else {
            (
                entry_price + self.sl_atr_mult * atr,
                entry_price - self.tp_atr_mult * atr,
            )
        };

        if stop_loss <= 0.0 {
            return None;
        }

        Some(PositionSize {
            margin,
            notional,
            quantity: meta.round_quantity(quantity),
            stop_loss: meta.round_price(stop_loss),
            take_profit: meta.round_price(take_profit),
        })
    }
}
