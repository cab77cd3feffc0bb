// =============================================================================
// RSI Divergence strategy
// =============================================================================
//
// Scans a lookback window for divergence between price extremes and RSI
// extremes:
//
//   bullish — price prints a lower low while RSI prints a higher low
//   bearish — price prints a higher high while RSI prints a lower high
//
// The window is split in half; extremes are compared between halves.
// Divergence strength is the RSI improvement in points scaled to [0, 1];
// signals below `min_divergence_strength` are discarded. Conservative mode
// additionally requires RSI to still sit near the oversold/overbought zone.
// =============================================================================

use crate::config::StrategyParams;
use crate::errors::EngineError;
use crate::indicators::rsi::rsi;
use crate::market_data::{closes, Bar};
use crate::signals::{Signal, SignalKind, SignalStrength};
use crate::strategies::{volume_gate, CycleContext, EnrichedBars, Strategy, StrategyId};
use crate::types::Direction;

/// RSI points of divergence that map to strength 1.0.
const FULL_STRENGTH_POINTS: f64 = 10.0;

pub struct RsiDivergence {
    params: StrategyParams,
}

impl RsiDivergence {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }

    /// (index of min, min close) over a half-window, paired with RSI there.
    fn extreme(
        window: &[(f64, f64)],
        lowest: bool,
    ) -> Option<(f64, f64)> {
        window
            .iter()
            .copied()
            .reduce(|best, cur| {
                let better = if lowest { cur.0 < best.0 } else { cur.0 > best.0 };
                if better {
                    cur
                } else {
                    best
                }
            })
    }
}

impl Strategy for RsiDivergence {
    fn id(&self) -> StrategyId {
        StrategyId::RsiDivergence
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn analyze(&self, bars: Vec<Bar>) -> Result<EnrichedBars, EngineError> {
        let prices = closes(&bars);
        let mut enriched = EnrichedBars::new(bars);
        enriched.append("rsi", rsi(&prices, 14));
        Ok(enriched)
    }

    fn generate_signal(
        &self,
        symbol: &str,
        enriched: &EnrichedBars,
        ctx: &CycleContext,
    ) -> Result<Option<Signal>, EngineError> {
        let lookback = self.params.lookback.max(8);
        let rsi_series = match enriched.series("rsi") {
            Some(series) => series,
            None => return Ok(None),
        };

        // Pair (close, rsi) over the trailing window where RSI is defined.
        let paired: Vec<(f64, f64)> = enriched
            .bars
            .iter()
            .zip(rsi_series)
            .filter_map(|(bar, rsi_val)| rsi_val.map(|r| (bar.close, r)))
            .collect();
        if paired.len() < lookback {
            return Ok(None);
        }
        let window = &paired[paired.len() - lookback..];
        let (older, recent) = window.split_at(lookback / 2);

        let Some(close) = enriched.last_close() else {
            return Ok(None);
        };
        let Some(rsi_now) = enriched.latest("rsi") else {
            return Ok(None);
        };

        if !volume_gate(&self.params, enriched) {
            return Ok(None);
        }

        // Bullish: lower low in price, higher low in RSI.
        let (Some((old_low, old_low_rsi)), Some((new_low, new_low_rsi))) =
            (Self::extreme(older, true), Self::extreme(recent, true))
        else {
            return Ok(None);
        };
        let bullish = new_low < old_low && new_low_rsi > old_low_rsi;

        // Bearish: higher high in price, lower high in RSI.
        let (Some((old_high, old_high_rsi)), Some((new_high, new_high_rsi))) =
            (Self::extreme(older, false), Self::extreme(recent, false))
        else {
            return Ok(None);
        };
        let bearish = new_high > old_high && new_high_rsi < old_high_rsi;

        let (direction, divergence_points) = if bullish {
            (Direction::Long, new_low_rsi - old_low_rsi)
        } else if bearish {
            (Direction::Short, old_high_rsi - new_high_rsi)
        } else {
            return Ok(None);
        };

        let divergence_strength = (divergence_points / FULL_STRENGTH_POINTS).clamp(0.0, 1.0);
        let min_strength = if self.params.conservative {
            (self.params.min_divergence_strength * 1.5).min(1.0)
        } else {
            self.params.min_divergence_strength
        };
        if divergence_strength < min_strength {
            return Ok(None);
        }

        if self.params.conservative {
            // Only fade genuinely stretched tape.
            let near_zone = match direction {
                Direction::Long => rsi_now < self.params.rsi_oversold + 10.0,
                Direction::Short => rsi_now > self.params.rsi_overbought - 10.0,
            };
            if !near_zone {
                return Ok(None);
            }
        }

        let strength = if divergence_strength >= 0.7 {
            SignalStrength::Strong
        } else if divergence_strength >= 0.4 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };
        let confidence = (0.5 + divergence_strength * 0.35).clamp(0.0, 1.0);

        let stop = self.compute_stop(direction, close, &enriched.bars);
        let take = self.compute_take(direction, close, stop);

        Ok(Some(Signal {
            symbol: symbol.to_string(),
            kind: match direction {
                Direction::Long => SignalKind::Long,
                Direction::Short => SignalKind::Short,
            },
            strength,
            strategy: self.id(),
            confidence,
            suggested_entry: close,
            suggested_stop: stop,
            suggested_take: take,
            timestamp: ctx.now_ms,
        }))
    }
}
