//! Risk governor
//!
//! Pure position-size arithmetic: tier-based sizing and dual-order exposure
//! validation with smart-lot downsizing. Daily counters live in
//! [`crate::risk::safety`], not here - the governor never mutates anything.

use tracing::debug;

use crate::config::{AccountTier, InstrumentConfig, RiskConfig};

/// Outcome of a dual-order risk validation
///
/// On rejection the suggested `smart_lot` is returned rather than failing
/// silently - the caller decides whether to retry reduced or abandon.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskCheck {
    pub valid: bool,
    pub reason: Option<String>,
    pub smart_lot: Option<f64>,
}

impl RiskCheck {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
            smart_lot: None,
        }
    }

    fn rejected(reason: String, smart_lot: Option<f64>) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            smart_lot,
        }
    }
}

pub struct RiskGovernor {
    config: RiskConfig,
}

impl RiskGovernor {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Base lot from account balance and tier, floored to the lot step
    pub fn size_position(
        &self,
        balance: f64,
        tier: AccountTier,
        instrument: &InstrumentConfig,
    ) -> f64 {
        let raw = (balance / 1_000.0) * tier.lots_per_thousand();
        let lot = floor_to_step(raw, instrument.lot_step);
        lot.max(instrument.min_lot)
    }

    /// Validate the combined exposure of a dual entry against the remaining
    /// daily loss budget.
    ///
    /// Total exposure = `sl_pips x pip_value_per_lot x lot x order_count`.
    /// The cap is `daily_room x safety_margin`; a breach returns the largest
    /// per-order lot that fits, floored to the lot step.
    pub fn validate_dual_order_risk(
        &self,
        instrument: &InstrumentConfig,
        lot_per_order: f64,
        order_count: u32,
        daily_room: f64,
        sl_pips: f64,
    ) -> RiskCheck {
        if sl_pips <= 0.0 {
            return RiskCheck::rejected(format!("non-positive stop distance: {} pips", sl_pips), None);
        }
        if lot_per_order <= 0.0 {
            return RiskCheck::rejected(format!("non-positive lot: {}", lot_per_order), None);
        }

        let exposure =
            sl_pips * instrument.pip_value_per_lot * lot_per_order * order_count as f64;
        let cap = daily_room * self.config.safety_margin;

        debug!(exposure, cap, daily_room, "Dual-order risk check");

        if exposure <= cap {
            return RiskCheck::ok();
        }

        let smart_lot = floor_to_step(
            cap / (sl_pips * instrument.pip_value_per_lot) / order_count as f64,
            instrument.lot_step,
        );

        let reason = format!(
            "exposure ${:.2} exceeds budget ${:.2} ({}% of ${:.2} daily room)",
            exposure,
            cap,
            (self.config.safety_margin * 100.0) as u32,
            daily_room
        );

        if smart_lot < instrument.min_lot {
            RiskCheck::rejected(reason, None)
        } else {
            RiskCheck::rejected(reason, Some(smart_lot))
        }
    }
}

/// Floor a lot to the broker's lot step
pub fn floor_to_step(lot: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return lot;
    }
    // Nudge before flooring so 0.049999999 from float division still lands on 0.05
    ((lot / step) + 1e-9).floor() * step
}
