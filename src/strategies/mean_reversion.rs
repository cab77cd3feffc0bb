// =============================================================================
// Mean Reversion strategy — Bollinger band fades
// =============================================================================
//
// LONG when the close pierces the lower band with RSI oversold; SHORT when
// it pierces the upper band with RSI overbought. The pierce depth relative
// to the band span drives strength and confidence. Stops default to the
// percent policy: ATR stops widen exactly when reversion trades are most
// stretched.
// =============================================================================

use crate::config::StrategyParams;
use crate::errors::EngineError;
use crate::indicators::{bollinger::bollinger, rsi::rsi};
use crate::market_data::{closes, Bar};
use crate::signals::{Signal, SignalKind, SignalStrength};
use crate::strategies::{volume_gate, CycleContext, EnrichedBars, Strategy, StrategyId};
use crate::types::Direction;

const BAND_PERIOD: usize = 20;
const BAND_STD: f64 = 2.0;

pub struct MeanReversion {
    params: StrategyParams,
}

impl MeanReversion {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }
}

impl Strategy for MeanReversion {
    fn id(&self) -> StrategyId {
        StrategyId::MeanReversion
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn analyze(&self, bars: Vec<Bar>) -> Result<EnrichedBars, EngineError> {
        let prices = closes(&bars);
        let mut enriched = EnrichedBars::new(bars);
        let bands = bollinger(&prices, BAND_PERIOD, BAND_STD);
        enriched.append("bb_upper", bands.upper);
        enriched.append("bb_middle", bands.middle);
        enriched.append("bb_lower", bands.lower);
        enriched.append("rsi", rsi(&prices, 14));
        Ok(enriched)
    }

    fn generate_signal(
        &self,
        symbol: &str,
        enriched: &EnrichedBars,
        ctx: &CycleContext,
    ) -> Result<Option<Signal>, EngineError> {
        let (Some(close), Some(upper), Some(middle), Some(lower), Some(rsi_now)) = (
            enriched.last_close(),
            enriched.latest("bb_upper"),
            enriched.latest("bb_middle"),
            enriched.latest("bb_lower"),
            enriched.latest("rsi"),
        ) else {
            return Ok(None);
        };

        let span = (upper - lower).max(1e-9);
        let direction = if close < lower && rsi_now < self.params.rsi_oversold {
            Direction::Long
        } else if close > upper && rsi_now > self.params.rsi_overbought {
            Direction::Short
        } else {
            return Ok(None);
        };

        if !volume_gate(&self.params, enriched) {
            return Ok(None);
        }

        let pierce = match direction {
            Direction::Long => (lower - close) / span,
            Direction::Short => (close - upper) / span,
        };
        let strength = if pierce >= 0.25 {
            SignalStrength::Strong
        } else if pierce >= 0.10 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };
        let confidence = (0.55 + pierce * 1.2).clamp(0.0, 0.9);

        let stop = self.compute_stop(direction, close, &enriched.bars);
        // Reversion targets the middle band rather than a fixed multiple,
        // unless the configured policy gives a closer target.
        let policy_take = self.compute_take(direction, close, stop);
        let take = match direction {
            Direction::Long => policy_take.min(middle.max(close)),
            Direction::Short => policy_take.max(middle.min(close)),
        };

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
