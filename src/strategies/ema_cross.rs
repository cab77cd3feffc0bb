// =============================================================================
// EMA Cross strategy
// =============================================================================
//
// LONG when the fast EMA crosses above the slow EMA within the last
// `confirmation_bars`, RSI is below the overbought threshold, the volume
// gate passes, and price sits above the trend EMA. SHORT is the mirror.
// Signal strength scales with the fast/slow spread normalised by ATR.
// =============================================================================

use crate::config::StrategyParams;
use crate::errors::EngineError;
use crate::indicators::{atr::atr, ema::ema, rsi::rsi};
use crate::market_data::{closes, Bar};
use crate::signals::{Signal, SignalKind, SignalStrength};
use crate::strategies::{volume_gate, CycleContext, EnrichedBars, Strategy, StrategyId};
use crate::types::Direction;

pub struct EmaCross {
    params: StrategyParams,
}

impl EmaCross {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }

    /// Was there a fast-over-slow cross that has held for the last
    /// `confirm` bars? (And the mirror for crosses down.)
    fn crossed(
        &self,
        enriched: &EnrichedBars,
        confirm: usize,
        up: bool,
    ) -> Option<bool> {
        let above = |i: usize| -> Option<bool> {
            let fast = enriched.nth_from_end("ema_fast", i)?;
            let slow = enriched.nth_from_end("ema_slow", i)?;
            Some(if up { fast > slow } else { fast < slow })
        };

        for i in 0..confirm {
            if !above(i)? {
                return Some(false);
            }
        }
        // The bar just before the confirmation run must be on the other side.
        Some(!above(confirm)?)
    }
}

impl Strategy for EmaCross {
    fn id(&self) -> StrategyId {
        StrategyId::EmaCross
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn analyze(&self, bars: Vec<Bar>) -> Result<EnrichedBars, EngineError> {
        let prices = closes(&bars);
        let mut enriched = EnrichedBars::new(bars);
        enriched.append("ema_fast", ema(&prices, self.params.fast_period));
        enriched.append("ema_slow", ema(&prices, self.params.slow_period));
        enriched.append("ema_trend", ema(&prices, self.params.trend_period));
        enriched.append("rsi", rsi(&prices, 14));
        enriched.append("atr", atr(&enriched.bars, 14));
        Ok(enriched)
    }

    fn generate_signal(
        &self,
        symbol: &str,
        enriched: &EnrichedBars,
        ctx: &CycleContext,
    ) -> Result<Option<Signal>, EngineError> {
        let confirm = self.params.confirmation_bars.max(1) as usize;

        let (Some(close), Some(fast), Some(slow), Some(trend), Some(rsi_now)) = (
            enriched.last_close(),
            enriched.latest("ema_fast"),
            enriched.latest("ema_slow"),
            enriched.latest("ema_trend"),
            enriched.latest("rsi"),
        ) else {
            return Ok(None);
        };

        let crossed_up = self.crossed(enriched, confirm, true).unwrap_or(false);
        let crossed_down = self.crossed(enriched, confirm, false).unwrap_or(false);

        let direction = if crossed_up && rsi_now < self.params.rsi_overbought && close > trend {
            Some(Direction::Long)
        } else if crossed_down && rsi_now > self.params.rsi_oversold && close < trend {
            Some(Direction::Short)
        } else {
            // A cross against an open trend direction reads as an exit cue
            // even when the fresh-entry gates fail.
            if crossed_down {
                return Ok(Some(self.exit_signal(symbol, SignalKind::ExitLong, close, ctx)));
            }
            if crossed_up {
                return Ok(Some(self.exit_signal(symbol, SignalKind::ExitShort, close, ctx)));
            }
            return Ok(None);
        };

        let Some(direction) = direction else {
            return Ok(None);
        };

        if !volume_gate(&self.params, enriched) {
            return Ok(None);
        }

        // Strength: fast/slow spread in ATR units.
        let spread_atr = match enriched.latest("atr") {
            Some(atr_now) if atr_now > 0.0 => (fast - slow).abs() / atr_now,
            _ => return Ok(None),
        };
        let strength = if spread_atr >= 0.8 {
            SignalStrength::Strong
        } else if spread_atr >= 0.3 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };
        let confidence = (0.5 + (spread_atr * 0.25).min(0.35)).clamp(0.0, 1.0);

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

impl EmaCross {
    fn exit_signal(&self, symbol: &str, kind: SignalKind, close: f64, ctx: &CycleContext) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            kind,
            strength: SignalStrength::Moderate,
            strategy: self.id(),
            confidence: 0.6,
            suggested_entry: close,
            suggested_stop: 0.0,
            suggested_take: 0.0,
            timestamp: ctx.now_ms,
        }
    }
}
