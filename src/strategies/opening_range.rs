// =============================================================================
// Opening Range Breakout (ORB) strategy
// =============================================================================
//
// The opening range is the high/low of the first `confirmation_bars` bars of
// the current session day. LONG when a later close breaks above the range
// high early in the session; SHORT mirrors below the range low. Late-session
// breakouts are ignored: the edge decays after the morning.
// =============================================================================

use crate::config::StrategyParams;
use crate::errors::EngineError;
use crate::market_data::Bar;
use crate::signals::{Signal, SignalKind, SignalStrength};
use crate::strategies::{volume_gate, CycleContext, EnrichedBars, Strategy, StrategyId};
use crate::types::Direction;

const DAY_MS: i64 = 86_400_000;
/// Breakouts after this much session time are stale.
const LATEST_ENTRY_MINUTES: i64 = 180;

pub struct OpeningRange {
    params: StrategyParams,
}

impl OpeningRange {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }

    /// (range_high, range_low, bars_into_day) for the last bar's day.
    fn opening_range(&self, bars: &[Bar]) -> Option<(f64, f64, usize)> {
        let last = bars.last()?;
        let day = last.open_time.div_euclid(DAY_MS);

        let today: Vec<&Bar> = bars
            .iter()
            .filter(|b| b.open_time.div_euclid(DAY_MS) == day)
            .collect();

        let range_bars = self.params.confirmation_bars.max(1) as usize;
        if today.len() <= range_bars {
            // Still inside (or just completing) the opening range.
            return None;
        }

        let mut high = f64::MIN;
        let mut low = f64::MAX;
        for b in &today[..range_bars] {
            high = high.max(b.high);
            low = low.min(b.low);
        }
        Some((high, low, today.len()))
    }
}

impl Strategy for OpeningRange {
    fn id(&self) -> StrategyId {
        StrategyId::OpeningRange
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn analyze(&self, bars: Vec<Bar>) -> Result<EnrichedBars, EngineError> {
        // The range is computed from raw bars; nothing to append.
        Ok(EnrichedBars::new(bars))
    }

    fn generate_signal(
        &self,
        symbol: &str,
        enriched: &EnrichedBars,
        ctx: &CycleContext,
    ) -> Result<Option<Signal>, EngineError> {
        let Some(close) = enriched.last_close() else {
            return Ok(None);
        };
        let Some((range_high, range_low, _)) = self.opening_range(&enriched.bars) else {
            return Ok(None);
        };

        if let Some(minutes) = ctx.minutes_since_open {
            if minutes > LATEST_ENTRY_MINUTES {
                return Ok(None);
            }
        }

        let range_span = (range_high - range_low).max(1e-9);
        let direction = if close > range_high {
            Direction::Long
        } else if close < range_low {
            Direction::Short
        } else {
            return Ok(None);
        };

        if !volume_gate(&self.params, enriched) {
            return Ok(None);
        }

        let margin = match direction {
            Direction::Long => (close - range_high) / range_span,
            Direction::Short => (range_low - close) / range_span,
        };
        let strength = if margin >= 0.5 {
            SignalStrength::Strong
        } else if margin >= 0.15 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };
        let confidence = (0.55 + margin * 0.5).clamp(0.0, 0.85);

        // ORB rides the opposite side of the range as its natural stop.
        let policy_stop = self.compute_stop(direction, close, &enriched.bars);
        let stop = match direction {
            Direction::Long => policy_stop.max(range_low),
            Direction::Short => policy_stop.min(range_high),
        };
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
