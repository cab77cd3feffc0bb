// =============================================================================
// Market Regime Detector
// =============================================================================
//
// Classifies the market from index-proxy bars using four factors: slope of
// the long EMA vs price, ADX magnitude, realized-volatility percentile, and
// drawdown of the proxy itself. Each regime carries per-strategy weights and
// an overall aggressiveness scalar the sizer consumes.
//
// Detection hierarchy (evaluated top-to-bottom; first match wins):
//
//   1. CRISIS            — proxy drawdown >= 12% or vol percentile >= 0.98
//   2. HIGH_VOLATILITY   — vol percentile >= 0.90
//   3. STRONG_TREND_UP   — EMA slope >= +0.10%/bar AND ADX > 25
//   4. STRONG_TREND_DOWN — mirror
//   5. WEAK_TREND_UP     — EMA slope >= +0.03%/bar
//   6. WEAK_TREND_DOWN   — mirror
//   7. RANGING           — everything else
//
// CRISIS forces aggressiveness to 0: only exits pass the pipeline.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::adx::current_adx;
use crate::indicators::ema::ema;
use crate::indicators::volatility::{percentile_rank, realized_vol};
use crate::market_data::{closes, Bar};
use crate::strategies::StrategyId;

// Classification thresholds.
const CRISIS_DRAWDOWN: f64 = 0.12;
const CRISIS_VOL_PCT: f64 = 0.98;
const HIGH_VOL_PCT: f64 = 0.90;
const STRONG_SLOPE: f64 = 0.0010; // fraction per bar
const WEAK_SLOPE: f64 = 0.0003;
const TREND_ADX: f64 = 25.0;

const EMA_PERIOD: usize = 50;
const SLOPE_SPAN: usize = 5;
const VOL_WINDOW: usize = 20;
const ADX_PERIOD: usize = 14;

/// High-level market regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegime {
    StrongTrendUp,
    WeakTrendUp,
    StrongTrendDown,
    WeakTrendDown,
    Ranging,
    HighVolatility,
    Crisis,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongTrendUp => write!(f, "STRONG_TREND_UP"),
            Self::WeakTrendUp => write!(f, "WEAK_TREND_UP"),
            Self::StrongTrendDown => write!(f, "STRONG_TREND_DOWN"),
            Self::WeakTrendDown => write!(f, "WEAK_TREND_DOWN"),
            Self::Ranging => write!(f, "RANGING"),
            Self::HighVolatility => write!(f, "HIGH_VOLATILITY"),
            Self::Crisis => write!(f, "CRISIS"),
        }
    }
}

impl MarketRegime {
    /// Overall risk appetite in [0, 1]. CRISIS is hard zero.
    pub fn aggressiveness(self) -> f64 {
        match self {
            Self::StrongTrendUp => 1.0,
            Self::WeakTrendUp => 0.75,
            Self::Ranging => 0.5,
            Self::WeakTrendDown => 0.4,
            Self::StrongTrendDown => 0.3,
            Self::HighVolatility => 0.35,
            Self::Crisis => 0.0,
        }
    }

    /// Per-strategy weight in [0, 1] for this regime. Trend followers are
    /// favoured in trends, reversion styles in ranges, breakout styles when
    /// volatility expands.
    pub fn strategy_weights(self) -> HashMap<StrategyId, f64> {
        use StrategyId::*;
        let entries: &[(StrategyId, f64)] = match self {
            Self::StrongTrendUp | Self::StrongTrendDown => &[
                (EmaCross, 1.0),
                (Momentum, 1.0),
                (VolumeBreakout, 0.9),
                (OpeningRange, 0.8),
                (VwapCross, 0.6),
                (RsiDivergence, 0.4),
                (MeanReversion, 0.2),
                (Pairs, 0.4),
            ],
            Self::WeakTrendUp | Self::WeakTrendDown => &[
                (EmaCross, 0.8),
                (Momentum, 0.7),
                (VolumeBreakout, 0.7),
                (OpeningRange, 0.6),
                (VwapCross, 0.7),
                (RsiDivergence, 0.6),
                (MeanReversion, 0.5),
                (Pairs, 0.6),
            ],
            Self::Ranging => &[
                (EmaCross, 0.4),
                (Momentum, 0.3),
                (VolumeBreakout, 0.5),
                (OpeningRange, 0.5),
                (VwapCross, 0.8),
                (RsiDivergence, 0.9),
                (MeanReversion, 1.0),
                (Pairs, 0.9),
            ],
            Self::HighVolatility => &[
                (EmaCross, 0.5),
                (Momentum, 0.4),
                (VolumeBreakout, 0.8),
                (OpeningRange, 0.6),
                (VwapCross, 0.4),
                (RsiDivergence, 0.5),
                (MeanReversion, 0.4),
                (Pairs, 0.5),
            ],
            Self::Crisis => &[
                (EmaCross, 0.0),
                (Momentum, 0.0),
                (VolumeBreakout, 0.0),
                (OpeningRange, 0.0),
                (VwapCross, 0.0),
                (RsiDivergence, 0.0),
                (MeanReversion, 0.0),
                (Pairs, 0.0),
            ],
        };
        entries.iter().copied().collect()
    }
}

/// Complete snapshot of the detected regime plus contributing metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: MarketRegime,
    /// Long-EMA slope, fraction per bar.
    pub ema_slope: f64,
    pub adx: f64,
    /// Percentile rank of current realized vol within the series, [0, 1].
    pub vol_percentile: f64,
    /// Drawdown of the proxy from its in-window peak close.
    pub proxy_drawdown: f64,
    /// Confidence in the classification, [0, 1].
    pub confidence: f64,
    pub aggressiveness: f64,
    pub strategy_weights: HashMap<StrategyId, f64>,
}

impl RegimeState {
    pub fn weight_for(&self, id: StrategyId) -> f64 {
        self.strategy_weights.get(&id).copied().unwrap_or(0.5)
    }

    /// Mean weight across a contributing strategy set.
    pub fn mean_weight(&self, ids: &[StrategyId]) -> f64 {
        if ids.is_empty() {
            return 0.0;
        }
        ids.iter().map(|&id| self.weight_for(id)).sum::<f64>() / ids.len() as f64
    }
}

/// Thread-safe detector caching the latest state.
pub struct RegimeDetector {
    state: RwLock<Option<RegimeState>>,
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
        }
    }

    /// Run detection over the proxy bars and cache the result. Returns None
    /// when the inputs cannot support the underlying indicators.
    pub fn update(&self, proxy_bars: &[Bar]) -> Option<RegimeState> {
        let prices = closes(proxy_bars);
        if prices.len() < EMA_PERIOD + SLOPE_SPAN {
            return None;
        }

        // --- Factor 1: slope of the long EMA -----------------------------
        let ema_series = ema(&prices, EMA_PERIOD);
        let ema_now = crate::indicators::latest(&ema_series)?;
        let ema_then = crate::indicators::nth_from_end(&ema_series, SLOPE_SPAN)?;
        let ema_slope = if ema_then != 0.0 {
            (ema_now - ema_then) / ema_then / SLOPE_SPAN as f64
        } else {
            0.0
        };

        // --- Factor 2: ADX ----------------------------------------------
        let adx = current_adx(proxy_bars, ADX_PERIOD).unwrap_or(0.0);

        // --- Factor 3: realized vol percentile ---------------------------
        let vol_series = realized_vol(&prices, VOL_WINDOW);
        let vol_percentile = percentile_rank(&vol_series).unwrap_or(0.5);

        // --- Factor 4: proxy drawdown ------------------------------------
        let peak = prices.iter().copied().fold(f64::MIN, f64::max);
        let last = *prices.last()?;
        let proxy_drawdown = if peak > 0.0 { (peak - last) / peak } else { 0.0 };

        let (regime, confidence) = classify(ema_slope, adx, vol_percentile, proxy_drawdown);

        let new_state = RegimeState {
            regime,
            ema_slope,
            adx,
            vol_percentile,
            proxy_drawdown,
            confidence,
            aggressiveness: regime.aggressiveness(),
            strategy_weights: regime.strategy_weights(),
        };

        debug!(
            regime = %regime,
            slope = format!("{:.5}", ema_slope),
            adx = format!("{:.1}", adx),
            vol_pct = format!("{:.2}", vol_percentile),
            drawdown = format!("{:.3}", proxy_drawdown),
            confidence = format!("{:.2}", confidence),
            "regime detected"
        );

        *self.state.write() = Some(new_state.clone());
        Some(new_state)
    }

    /// Most recently detected state without recomputing.
    pub fn current(&self) -> Option<RegimeState> {
        self.state.read().clone()
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Classification logic
// =============================================================================

fn classify(slope: f64, adx: f64, vol_pct: f64, drawdown: f64) -> (MarketRegime, f64) {
    // 1. CRISIS — capital preservation dominates everything else.
    if drawdown >= CRISIS_DRAWDOWN || vol_pct >= CRISIS_VOL_PCT {
        let confidence = remap(drawdown.max(vol_pct - CRISIS_VOL_PCT + CRISIS_DRAWDOWN), CRISIS_DRAWDOWN, 0.30, 0.75, 1.0);
        return (MarketRegime::Crisis, confidence);
    }

    // 2. HIGH_VOLATILITY — expansion without crisis-level damage.
    if vol_pct >= HIGH_VOL_PCT {
        let confidence = remap(vol_pct, HIGH_VOL_PCT, 1.0, 0.60, 1.0);
        return (MarketRegime::HighVolatility, confidence);
    }

    // 3/4. Strong trends need slope and ADX agreement.
    if slope >= STRONG_SLOPE && adx > TREND_ADX {
        let slope_conf = remap(slope, STRONG_SLOPE, STRONG_SLOPE * 3.0, 0.60, 1.0);
        let adx_conf = remap(adx, TREND_ADX, 50.0, 0.60, 1.0);
        return (MarketRegime::StrongTrendUp, (slope_conf + adx_conf) / 2.0);
    }
    if slope <= -STRONG_SLOPE && adx > TREND_ADX {
        let slope_conf = remap(-slope, STRONG_SLOPE, STRONG_SLOPE * 3.0, 0.60, 1.0);
        let adx_conf = remap(adx, TREND_ADX, 50.0, 0.60, 1.0);
        return (MarketRegime::StrongTrendDown, (slope_conf + adx_conf) / 2.0);
    }

    // 5/6. Weak trends on slope alone.
    if slope >= WEAK_SLOPE {
        return (
            MarketRegime::WeakTrendUp,
            remap(slope, WEAK_SLOPE, STRONG_SLOPE, 0.50, 0.80),
        );
    }
    if slope <= -WEAK_SLOPE {
        return (
            MarketRegime::WeakTrendDown,
            remap(-slope, WEAK_SLOPE, STRONG_SLOPE, 0.50, 0.80),
        );
    }

    // 7. RANGING — nothing directional, nothing explosive.
    (MarketRegime::Ranging, remap(adx, 20.0, 5.0, 0.40, 0.80))
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`,
/// clamped to the output range.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    out_lo + t.clamp(0.0, 1.0) * (out_hi - out_lo)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Timeframe;

    fn bar(i: i64, close: f64, range: f64) -> Bar {
        Bar {
            symbol: "SPY".into(),
            timeframe: Timeframe::Min30,
            open_time: i * 1_800_000,
            open: close,
            high: close + range,
            low: close - range,
            close,
            volume: 1_000.0,
        }
    }

    #[test]
    fn classify_crisis_on_drawdown() {
        let (regime, conf) = classify(0.002, 30.0, 0.5, 0.15);
        assert_eq!(regime, MarketRegime::Crisis);
        assert!(conf >= 0.75);
    }

    #[test]
    fn classify_crisis_on_extreme_vol() {
        let (regime, _) = classify(0.0, 10.0, 0.99, 0.0);
        assert_eq!(regime, MarketRegime::Crisis);
    }

    #[test]
    fn classify_high_volatility() {
        let (regime, _) = classify(0.0, 10.0, 0.93, 0.02);
        assert_eq!(regime, MarketRegime::HighVolatility);
    }

    #[test]
    fn classify_strong_trend_needs_adx() {
        let (regime, _) = classify(0.002, 30.0, 0.5, 0.0);
        assert_eq!(regime, MarketRegime::StrongTrendUp);
        // Same slope without ADX support degrades to weak trend.
        let (regime, _) = classify(0.002, 15.0, 0.5, 0.0);
        assert_eq!(regime, MarketRegime::WeakTrendUp);
    }

    #[test]
    fn classify_downtrends_mirror() {
        let (regime, _) = classify(-0.002, 30.0, 0.5, 0.05);
        assert_eq!(regime, MarketRegime::StrongTrendDown);
        let (regime, _) = classify(-0.0005, 15.0, 0.5, 0.05);
        assert_eq!(regime, MarketRegime::WeakTrendDown);
    }

    #[test]
    fn classify_ranging_default() {
        let (regime, _) = classify(0.0001, 12.0, 0.5, 0.01);
        assert_eq!(regime, MarketRegime::Ranging);
    }

    #[test]
    fn crisis_zeroes_aggressiveness() {
        assert_eq!(MarketRegime::Crisis.aggressiveness(), 0.0);
        for w in MarketRegime::Crisis.strategy_weights().values() {
            assert_eq!(*w, 0.0);
        }
    }

    #[test]
    fn weights_cover_every_strategy() {
        for regime in [
            MarketRegime::StrongTrendUp,
            MarketRegime::Ranging,
            MarketRegime::HighVolatility,
        ] {
            let weights = regime.strategy_weights();
            for id in StrategyId::ALL {
                let w = weights.get(&id).copied().unwrap();
                assert!((0.0..=1.0).contains(&w));
            }
        }
    }

    #[test]
    fn detector_flags_steady_uptrend() {
        let bars: Vec<Bar> = (0..120).map(|i| bar(i, 100.0 + i as f64 * 0.5, 0.4)).collect();
        let detector = RegimeDetector::new();
        let state = detector.update(&bars).unwrap();
        assert!(
            matches!(
                state.regime,
                MarketRegime::StrongTrendUp | MarketRegime::WeakTrendUp
            ),
            "got {:?}",
            state.regime
        );
        assert!(state.ema_slope > 0.0);
        assert!(detector.current().is_some());
    }

    #[test]
    fn detector_flags_crash_as_crisis() {
        // Flat then a 20% collapse.
        let mut bars: Vec<Bar> = (0..100).map(|i| bar(i, 100.0, 0.3)).collect();
        for i in 0..20 {
            let close = 100.0 - (i as f64 + 1.0) * 1.0;
            bars.push(bar(100 + i, close, 1.5));
        }
        let detector = RegimeDetector::new();
        let state = detector.update(&bars).unwrap();
        assert_eq!(state.regime, MarketRegime::Crisis);
        assert_eq!(state.aggressiveness, 0.0);
    }

    #[test]
    fn detector_insufficient_data() {
        let bars: Vec<Bar> = (0..10).map(|i| bar(i, 100.0, 0.5)).collect();
        assert!(RegimeDetector::new().update(&bars).is_none());
    }

    #[test]
    fn mean_weight_over_set() {
        let state = RegimeState {
            regime: MarketRegime::Ranging,
            ema_slope: 0.0,
            adx: 10.0,
            vol_percentile: 0.5,
            proxy_drawdown: 0.0,
            confidence: 0.5,
            aggressiveness: 0.5,
            strategy_weights: MarketRegime::Ranging.strategy_weights(),
        };
        let mean = state.mean_weight(&[StrategyId::MeanReversion, StrategyId::EmaCross]);
        assert!((mean - 0.7).abs() < 1e-10); // (1.0 + 0.4) / 2
    }
}
