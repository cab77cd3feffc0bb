// =============================================================================
// Pairs strategy — ratio z-score against the index proxy
// =============================================================================
//
// Tracks the ratio of the symbol's close to the index proxy's close. When
// the ratio stretches past an entry z-score versus its rolling mean, the
// strategy trades the convergence: LONG a symbol that is cheap relative to
// the index, SHORT one that is rich. Conservative mode widens the required
// stretch.
// =============================================================================

use crate::config::StrategyParams;
use crate::errors::EngineError;
use crate::market_data::Bar;
use crate::signals::{Signal, SignalKind, SignalStrength};
use crate::strategies::{volume_gate, CycleContext, EnrichedBars, Strategy, StrategyId};
use crate::types::Direction;

const ENTRY_Z: f64 = 2.0;
const CONSERVATIVE_ENTRY_Z: f64 = 2.5;
/// Z-score that maps to full strength.
const FULL_STRENGTH_Z: f64 = 4.0;

pub struct Pairs {
    params: StrategyParams,
}

impl Pairs {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }

    fn entry_z(&self) -> f64 {
        if self.params.conservative {
            CONSERVATIVE_ENTRY_Z
        } else {
            ENTRY_Z
        }
    }

    /// Z-score of the latest symbol/proxy close ratio against its rolling
    /// window. Series are aligned from the end.
    fn ratio_zscore(&self, bars: &[Bar], proxy: &[Bar]) -> Option<f64> {
        let window = self.params.lookback.max(10);
        let n = bars.len().min(proxy.len());
        if n < window + 1 {
            return None;
        }

        let ratios: Vec<f64> = (0..n)
            .map(|i| {
                let s = bars[bars.len() - n + i].close;
                let p = proxy[proxy.len() - n + i].close;
                if p != 0.0 {
                    s / p
                } else {
                    0.0
                }
            })
            .collect();

        let last = *ratios.last()?;
        let window_slice = &ratios[ratios.len() - 1 - window..ratios.len() - 1];
        let mean: f64 = window_slice.iter().sum::<f64>() / window as f64;
        let variance =
            window_slice.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / window as f64;
        let sd = variance.sqrt();
        if sd <= 0.0 || !sd.is_finite() {
            return None;
        }
        Some((last - mean) / sd)
    }
}

impl Strategy for Pairs {
    fn id(&self) -> StrategyId {
        StrategyId::Pairs
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn analyze(&self, bars: Vec<Bar>) -> Result<EnrichedBars, EngineError> {
        // The second leg lives in the cycle context; nothing to precompute.
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
        let Some(z) = self.ratio_zscore(&enriched.bars, &ctx.proxy_bars) else {
            return Ok(None);
        };

        let entry_z = self.entry_z();
        let direction = if z <= -entry_z {
            Direction::Long // cheap vs index — bet on convergence up
        } else if z >= entry_z {
            Direction::Short // rich vs index
        } else {
            return Ok(None);
        };

        if !volume_gate(&self.params, enriched) {
            return Ok(None);
        }

        let stretch = ((z.abs() - entry_z) / (FULL_STRENGTH_Z - entry_z)).clamp(0.0, 1.0);
        let strength = if stretch >= 0.6 {
            SignalStrength::Strong
        } else if stretch >= 0.25 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };
        let confidence = (0.55 + stretch * 0.25).clamp(0.0, 0.85);

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

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::{bars_from_closes, ctx};

    fn strategy() -> Pairs {
        let mut params = StrategyParams::default();
        params.volume_filter = false;
        params.lookback = 20;
        Pairs::new(params)
    }

    fn ctx_with_proxy(proxy_closes: &[f64]) -> CycleContext {
        let mut c = ctx();
        c.proxy_bars = bars_from_closes(proxy_closes, 1_000_000.0);
        c
    }

    #[test]
    fn stable_ratio_is_quiet() {
        let s = strategy();
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i % 5) as f64 * 0.1).collect();
        let proxy: Vec<f64> = (0..40).map(|i| 400.0 + (i % 5) as f64 * 0.4).collect();
        let enriched = s.analyze(bars_from_closes(&closes, 1000.0)).unwrap();
        assert!(s
            .generate_signal("TEST", &enriched, &ctx_with_proxy(&proxy))
            .unwrap()
            .is_none());
    }

    #[test]
    fn symbol_lagging_index_fires_long() {
        let s = strategy();
        // Symbol tracks the index, then underperforms badly at the end.
        let mut closes: Vec<f64> = (0..40).map(|_| 100.0).collect();
        let proxy: Vec<f64> = (0..43).map(|_| 400.0).collect();
        // Tiny noise keeps the ratio sd nonzero.
        for (i, c) in closes.iter_mut().enumerate() {
            *c += (i % 3) as f64 * 0.05;
        }
        closes.extend([96.0, 94.0, 92.0]); // sharp relative cheapening
        let enriched = s.analyze(bars_from_closes(&closes, 1000.0)).unwrap();
        let signal = s
            .generate_signal("TEST", &enriched, &ctx_with_proxy(&proxy))
            .unwrap()
            .expect("stretched-cheap ratio should fire");
        assert_eq!(signal.kind, SignalKind::Long);
    }

    #[test]
    fn symbol_outrunning_index_fires_short() {
        let s = strategy();
        let mut closes: Vec<f64> = (0..40).map(|i| 100.0 + (i % 3) as f64 * 0.05).collect();
        let proxy: Vec<f64> = (0..43).map(|_| 400.0).collect();
        closes.extend([104.0, 106.0, 108.0]);
        let enriched = s.analyze(bars_from_closes(&closes, 1000.0)).unwrap();
        let signal = s
            .generate_signal("TEST", &enriched, &ctx_with_proxy(&proxy))
            .unwrap()
            .expect("stretched-rich ratio should fire");
        assert_eq!(signal.kind, SignalKind::Short);
    }

    #[test]
    fn missing_proxy_is_quiet() {
        let s = strategy();
        let closes: Vec<f64> = (0..40).map(|_| 100.0).collect();
        let enriched = s.analyze(bars_from_closes(&closes, 1000.0)).unwrap();
        assert!(s.generate_signal("TEST", &enriched, &ctx()).unwrap().is_none());
    }

    #[test]
    fn conservative_mode_needs_wider_stretch() {
        let mut params = StrategyParams::default();
        params.volume_filter = false;
        params.lookback = 20;
        params.conservative = true;
        let strict = Pairs::new(params);
        assert!(strict.entry_z() > strategy().entry_z());
    }
}
