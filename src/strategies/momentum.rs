// =============================================================================
// Momentum strategy — ROC persistence with ADX confirmation
// =============================================================================
//
// LONG when rate-of-change exceeds the entry threshold with ADX confirming
// a real trend and RSI not yet exhausted; SHORT mirrors. Emits an exit cue
// when momentum flips against the previous reading while no fresh entry
// qualifies.
// =============================================================================

use crate::config::StrategyParams;
use crate::errors::EngineError;
use crate::indicators::{adx::adx, roc::roc, rsi::rsi};
use crate::market_data::{closes, Bar};
use crate::signals::{Signal, SignalKind, SignalStrength};
use crate::strategies::{volume_gate, CycleContext, EnrichedBars, Strategy, StrategyId};
use crate::types::Direction;

/// Minimum ADX for a momentum entry.
const MIN_ADX: f64 = 25.0;
/// ROC percent that maps to full strength.
const FULL_STRENGTH_ROC: f64 = 5.0;

pub struct Momentum {
    params: StrategyParams,
}

impl Momentum {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }

    /// Entry threshold in ROC percent. `deviation_percent` doubles as the
    /// momentum floor for this strategy.
    fn roc_threshold(&self) -> f64 {
        self.params.deviation_percent.max(0.5)
    }
}

impl Strategy for Momentum {
    fn id(&self) -> StrategyId {
        StrategyId::Momentum
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn analyze(&self, bars: Vec<Bar>) -> Result<EnrichedBars, EngineError> {
        let prices = closes(&bars);
        let mut enriched = EnrichedBars::new(bars);
        enriched.append("roc", roc(&prices, self.params.lookback.clamp(5, 30)));
        enriched.append("rsi", rsi(&prices, 14));
        enriched.append("adx", adx(&enriched.bars, 14));
        Ok(enriched)
    }

    fn generate_signal(
        &self,
        symbol: &str,
        enriched: &EnrichedBars,
        ctx: &CycleContext,
    ) -> Result<Option<Signal>, EngineError> {
        let (Some(close), Some(roc_now), Some(rsi_now), Some(adx_now)) = (
            enriched.last_close(),
            enriched.latest("roc"),
            enriched.latest("rsi"),
            enriched.latest("adx"),
        ) else {
            return Ok(None);
        };
        let threshold = self.roc_threshold();

        let direction = if roc_now >= threshold
            && adx_now >= MIN_ADX
            && rsi_now < self.params.rsi_overbought
        {
            Some(Direction::Long)
        } else if roc_now <= -threshold
            && adx_now >= MIN_ADX
            && rsi_now > self.params.rsi_oversold
        {
            Some(Direction::Short)
        } else {
            None
        };

        let Some(direction) = direction else {
            // Momentum flip without a qualifying entry: cue an exit for any
            // position riding the old trend.
            if let Some(roc_prev) = enriched.nth_from_end("roc", 1) {
                if roc_prev > threshold && roc_now < 0.0 {
                    return Ok(Some(self.exit_signal(symbol, SignalKind::ExitLong, close, ctx)));
                }
                if roc_prev < -threshold && roc_now > 0.0 {
                    return Ok(Some(self.exit_signal(symbol, SignalKind::ExitShort, close, ctx)));
                }
            }
            return Ok(None);
        };

        if !volume_gate(&self.params, enriched) {
            return Ok(None);
        }

        let magnitude = (roc_now.abs() / FULL_STRENGTH_ROC).clamp(0.0, 1.0);
        let strength = if magnitude >= 0.7 {
            SignalStrength::Strong
        } else if magnitude >= 0.35 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };
        let confidence = (0.5 + magnitude * 0.3 + ((adx_now - MIN_ADX) / 100.0)).clamp(0.0, 0.9);

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

impl Momentum {
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
