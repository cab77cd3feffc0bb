// =============================================================================
// Position sizer — risk-based / fixed / fractional-Kelly / vol-adjusted
// =============================================================================
//
// The sizer turns an approved intent into a share quantity:
//
//   risk_based   qty = floor(risk_per_trade x equity / |entry - stop|)
//   fixed        configured share count
//   kelly        qty = floor(fraction x kelly(win_rate, payoff) x equity / entry)
//                with fraction <= 0.25
//   vol_adjusted risk_based scaled by target_vol / realized_vol
//
// Confidence scales the base quantity in [0.5, 1.0]. Post-processing clamps
// to the per-position notional and percent caps and the tier multiplier,
// then rejects zero quantities and notionals beyond the remaining exposure
// headroom.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::config::{PositionLimitsConfig, SizingConfig, SizingMethod};
use crate::market_data::Tier;

/// Vol-adjustment scale is kept inside this band so a quiet tape cannot
/// balloon size without bound.
const VOL_SCALE_MIN: f64 = 0.25;
const VOL_SCALE_MAX: f64 = 2.0;

/// Win statistics the Kelly method consumes, derived from the trade journal.
#[derive(Debug, Clone, Copy)]
pub struct TradeStats {
    /// Fraction of closed trades that won, [0, 1].
    pub win_rate: f64,
    /// Average win over average loss.
    pub payoff: f64,
}

/// Everything the sizer needs to size one intent.
#[derive(Debug, Clone)]
pub struct SizeRequest {
    pub symbol: String,
    pub entry: f64,
    pub stop: f64,
    /// Regime-adjusted confidence, [0, 1].
    pub confidence: f64,
    pub equity: f64,
    pub tier: Tier,
    /// Realized per-bar volatility of the symbol, for the vol-adjusted method.
    pub realized_vol: Option<f64>,
    /// Journal statistics, for the Kelly method.
    pub stats: Option<TradeStats>,
    /// Remaining portfolio exposure budget in account currency.
    pub exposure_headroom: f64,
}

/// Why sizing rejected an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeRejection {
    ZeroQty,
    ExceedsHeadroom,
}

impl std::fmt::Display for SizeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroQty => write!(f, "ZERO_QTY"),
            Self::ExceedsHeadroom => write!(f, "EXCEEDS_HEADROOM"),
        }
    }
}

pub struct PositionSizer {
    config: SizingConfig,
    limits: PositionLimitsConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig, limits: PositionLimitsConfig) -> Self {
        Self { config, limits }
    }

    /// Size one intent with the given method. Returns a whole-share quantity.
    pub fn size(&self, method: SizingMethod, req: &SizeRequest) -> Result<f64, SizeRejection> {
        if req.entry <= 0.0 || req.equity <= 0.0 {
            return Err(SizeRejection::ZeroQty);
        }

        let base = match method {
            SizingMethod::RiskBased => self.risk_based(req),
            SizingMethod::Fixed => self.config.fixed_shares,
            SizingMethod::Kelly => self.kelly(req),
            SizingMethod::VolAdjusted => {
                let scale = match req.realized_vol {
                    Some(vol) if vol > 0.0 => {
                        (self.config.target_vol / vol).clamp(VOL_SCALE_MIN, VOL_SCALE_MAX)
                    }
                    _ => 1.0,
                };
                self.risk_based(req) * scale
            }
        };

        // Confidence tempers size rather than multiplying it away entirely.
        let confidence_scale = 0.5 + 0.5 * req.confidence.clamp(0.0, 1.0);
        let mut qty = base * confidence_scale;

        // Per-position clamps.
        let value_cap = self.limits.max_position_value / req.entry;
        let percent_cap = self.limits.max_position_size_percent / 100.0 * req.equity / req.entry;
        qty = qty.min(value_cap).min(percent_cap);

        // Tier multiplier last, then whole shares.
        qty = (qty * req.tier.size_multiplier()).floor();

        if qty <= 0.0 {
            return Err(SizeRejection::ZeroQty);
        }
        if qty * req.entry > req.exposure_headroom {
            debug!(
                symbol = %req.symbol,
                notional = qty * req.entry,
                headroom = req.exposure_headroom,
                "sized notional exceeds exposure headroom"
            );
            return Err(SizeRejection::ExceedsHeadroom);
        }

        debug!(
            symbol = %req.symbol,
            method = ?method,
            qty,
            notional = qty * req.entry,
            "position sized"
        );
        Ok(qty)
    }

    /// Confirm the closing quantity for an exit. Exits always close the
    /// full open quantity; the only rejection is a degenerate empty
    /// position.
    pub fn confirm_exit(&self, open_qty: f64) -> Result<f64, SizeRejection> {
        if open_qty <= 0.0 {
            return Err(SizeRejection::ZeroQty);
        }
        Ok(open_qty)
    }

    fn risk_based(&self, req: &SizeRequest) -> f64 {
        let stop_distance = (req.entry - req.stop).abs();
        if stop_distance <= 0.0 {
            return 0.0;
        }
        (self.config.risk_per_trade * req.equity / stop_distance).floor()
    }

    fn kelly(&self, req: &SizeRequest) -> f64 {
        let Some(stats) = req.stats else {
            // Without a track record there is no Kelly edge to lever.
            return 0.0;
        };
        if stats.payoff <= 0.0 {
            return 0.0;
        }
        let edge = stats.win_rate - (1.0 - stats.win_rate) / stats.payoff;
        if edge <= 0.0 {
            return 0.0;
        }
        let fraction = self.config.kelly_fraction.min(0.25);
        (fraction * edge * req.equity / req.entry).floor()
    }
}
