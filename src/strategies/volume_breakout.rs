// =============================================================================
// Volume Breakout strategy
// =============================================================================
//
// LONG when the last close clears the prior N-bar high on expanded volume
// with positive momentum and RSI not yet extreme. SHORT mirrors below the
// prior N-bar low. The advanced variant additionally requires Chaikin Money
// Flow confirmation in the breakout direction.
// =============================================================================

use crate::config::StrategyParams;
use crate::errors::EngineError;
use crate::indicators::{donchian::donchian, roc::roc, rsi::rsi, volume_flow::cmf};
use crate::market_data::{closes, Bar};
use crate::signals::{Signal, SignalKind, SignalStrength};
use crate::strategies::{volume_gate, CycleContext, EnrichedBars, Strategy, StrategyId};
use crate::types::Direction;

pub struct VolumeBreakout {
    params: StrategyParams,
}

impl VolumeBreakout {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }
}

impl Strategy for VolumeBreakout {
    fn id(&self) -> StrategyId {
        StrategyId::VolumeBreakout
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn analyze(&self, bars: Vec<Bar>) -> Result<EnrichedBars, EngineError> {
        let prices = closes(&bars);
        let mut enriched = EnrichedBars::new(bars);
        let channel = donchian(&enriched.bars, self.params.lookback);
        enriched.append("donchian_upper", channel.upper);
        enriched.append("donchian_lower", channel.lower);
        enriched.append("roc", roc(&prices, self.params.lookback.min(14).max(2)));
        enriched.append("rsi", rsi(&prices, 14));
        if self.params.advanced {
            enriched.append("cmf", cmf(&enriched.bars, self.params.lookback));
        }
        Ok(enriched)
    }

    fn generate_signal(
        &self,
        symbol: &str,
        enriched: &EnrichedBars,
        ctx: &CycleContext,
    ) -> Result<Option<Signal>, EngineError> {
        let (Some(close), Some(upper), Some(lower), Some(roc_now), Some(rsi_now)) = (
            enriched.last_close(),
            enriched.latest("donchian_upper"),
            enriched.latest("donchian_lower"),
            enriched.latest("roc"),
            enriched.latest("rsi"),
        ) else {
            return Ok(None);
        };

        let direction = if close > upper && roc_now > 0.0 && rsi_now < self.params.rsi_overbought
        {
            Direction::Long
        } else if close < lower && roc_now < 0.0 && rsi_now > self.params.rsi_oversold {
            Direction::Short
        } else {
            return Ok(None);
        };

        if !volume_gate(&self.params, enriched) {
            return Ok(None);
        }

        if self.params.advanced {
            // CMF must confirm the flow direction.
            let Some(cmf_now) = enriched.latest("cmf") else {
                return Ok(None);
            };
            let confirmed = match direction {
                Direction::Long => cmf_now > 0.0,
                Direction::Short => cmf_now < 0.0,
            };
            if !confirmed {
                return Ok(None);
            }
        }

        // Breakout margin past the channel edge, as a fraction of the channel.
        let channel_span = (upper - lower).max(1e-9);
        let margin = match direction {
            Direction::Long => (close - upper) / channel_span,
            Direction::Short => (lower - close) / channel_span,
        };
        let strength = if margin >= 0.10 {
            SignalStrength::Strong
        } else if margin >= 0.03 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };
        let confidence = (0.55 + margin * 2.0).clamp(0.0, 0.9);

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
