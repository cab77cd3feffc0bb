// =============================================================================
// Signal quality enhancer — bounded confidence adjustments
// =============================================================================
//
// Adjusts an entry intent's consensus confidence by four independent,
// individually bounded factors:
//
//   volume confirmation   +/- 15%   tape participation vs the declared floor
//   market correlation    +/- 12%   symbol-vs-index co-movement and index tone
//   technical confluence  +/- 20%   agreement from indicators the originating
//                                   strategies did not use (MACD, OBV, ADX)
//   timing                +/- 15%   time-of-day and time-to-close
//
// Each factor is a multiplicative percent adjustment; the result is clamped
// to [0, 1]. Intents that land below the confidence floor are dropped.
// Exits are never enhanced or dropped here.
// =============================================================================

use tracing::debug;

use crate::config::SignalsConfig;
use crate::indicators::{
    adx::current_adx, macd::macd, roc::current_roc, volume::current_volume_ratio,
    volume_flow::obv,
};
use crate::market_data::{closes, volumes, Bar};
use crate::signals::TradeIntent;
use crate::strategies::CycleContext;
use crate::types::Direction;

const VOLUME_BOUND: f64 = 0.15;
const CORRELATION_BOUND: f64 = 0.12;
const CONFLUENCE_BOUND: f64 = 0.20;
const TIMING_BOUND: f64 = 0.15;

/// Outcome of the enhancement pass.
#[derive(Debug)]
pub enum Enhanced {
    /// Adjusted intent with its new confidence.
    Kept(TradeIntent),
    /// Confidence fell below the floor; reason records the factor values.
    Dropped { confidence: f64, floor: f64 },
}

/// Apply all four factors to an entry intent. `volume_floor` is the highest
/// volume-ratio threshold declared by the contributing strategies.
pub fn enhance(
    mut intent: TradeIntent,
    bars: &[Bar],
    volume_floor: f64,
    config: &SignalsConfig,
    ctx: &CycleContext,
) -> Enhanced {
    if !intent.kind.is_entry() {
        return Enhanced::Kept(intent);
    }
    let Some(direction) = intent.kind.entry_direction() else {
        return Enhanced::Kept(intent);
    };

    let f_volume = volume_factor(bars, volume_floor);
    let f_corr = correlation_factor(bars, &ctx.proxy_bars, direction);
    let f_confluence = confluence_factor(bars, direction);
    let f_timing = timing_factor(ctx);

    let before = intent.confidence;
    let mut confidence = before;
    for factor in [f_volume, f_corr, f_confluence, f_timing] {
        confidence *= 1.0 + factor;
    }
    confidence = confidence.clamp(0.0, 1.0);
    intent.confidence = confidence;

    debug!(
        symbol = %intent.symbol,
        before = format!("{:.3}", before),
        after = format!("{:.3}", confidence),
        volume = format!("{:+.3}", f_volume),
        correlation = format!("{:+.3}", f_corr),
        confluence = format!("{:+.3}", f_confluence),
        timing = format!("{:+.3}", f_timing),
        "confidence enhanced"
    );

    // At the floor is accepted; strictly below is rejected.
    if confidence < config.confidence_floor {
        Enhanced::Dropped {
            confidence,
            floor: config.confidence_floor,
        }
    } else {
        Enhanced::Kept(intent)
    }
}

// ---------------------------------------------------------------------------
// Factors (each returns a value inside +/- its bound)
// ---------------------------------------------------------------------------

/// Higher when current participation exceeds the declared floor.
fn volume_factor(bars: &[Bar], volume_floor: f64) -> f64 {
    let vols = volumes(bars);
    let Some(ratio) = current_volume_ratio(&vols, 20) else {
        return 0.0;
    };
    let floor = volume_floor.max(0.5);
    // ratio == floor is neutral; double the floor maxes the boost.
    (((ratio - floor) / floor).clamp(-1.0, 1.0)) * VOLUME_BOUND
}

/// Pearson correlation of simple returns over the shared tail.
fn returns_correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 10 {
        return None;
    }
    let rets = |xs: &[f64]| -> Vec<f64> {
        xs[xs.len() - n..]
            .windows(2)
            .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
            .collect()
    };
    let ra = rets(a);
    let rb = rets(b);
    let m = ra.len() as f64;
    let mean_a = ra.iter().sum::<f64>() / m;
    let mean_b = rb.iter().sum::<f64>() / m;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..ra.len() {
        let da = ra[i] - mean_a;
        let db = rb[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    let corr = cov / (var_a.sqrt() * var_b.sqrt());
    if corr.is_finite() {
        Some(corr)
    } else {
        None
    }
}

/// Penalise longs in symbols that move with a declining index; reward them
/// when the index is rising (mirror for shorts).
fn correlation_factor(bars: &[Bar], proxy_bars: &[Bar], direction: Direction) -> f64 {
    if proxy_bars.is_empty() {
        return 0.0;
    }
    let symbol_closes = closes(bars);
    let proxy_closes = closes(proxy_bars);
    let Some(corr) = returns_correlation(&symbol_closes, &proxy_closes) else {
        return 0.0;
    };
    let Some(proxy_roc) = current_roc(&proxy_closes, 10) else {
        return 0.0;
    };
    let index_tone = (proxy_roc / 2.0).clamp(-1.0, 1.0);
    (corr * index_tone * direction.sign()).clamp(-1.0, 1.0) * CORRELATION_BOUND
}

/// Vote among indicators outside the strategy set: MACD histogram sign, OBV
/// slope, and ADX-qualified momentum direction.
fn confluence_factor(bars: &[Bar], direction: Direction) -> f64 {
    let prices = closes(bars);
    let mut votes = 0.0;
    let mut cast = 0.0;

    if let Some(hist) = crate::indicators::latest(&macd(&prices, 12, 26, 9).histogram) {
        cast += 1.0;
        votes += hist.signum();
    }

    let obv_series = obv(bars);
    if obv_series.len() >= 6 {
        let recent = obv_series[obv_series.len() - 1];
        let prior = obv_series[obv_series.len() - 6];
        cast += 1.0;
        votes += (recent - prior).signum();
    }

    if let (Some(adx_now), Some(roc_now)) = (current_adx(bars, 14), current_roc(&prices, 10)) {
        if adx_now > 20.0 {
            cast += 1.0;
            votes += roc_now.signum();
        }
    }

    if cast == 0.0 {
        return 0.0;
    }
    (votes / cast) * direction.sign() * CONFLUENCE_BOUND
}

/// Opening drive and mid-session carry trade well; the final minutes do not
/// leave room for the trade to work.
fn timing_factor(ctx: &CycleContext) -> f64 {
    let (Some(since_open), Some(to_close)) = (ctx.minutes_since_open, ctx.minutes_to_close)
    else {
        return 0.0;
    };

    if to_close <= 30 {
        return -TIMING_BOUND;
    }
    if since_open <= 60 {
        return TIMING_BOUND * 0.6;
    }
    if to_close <= 90 {
        return -TIMING_BOUND * 0.4;
    }
    0.0
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SizingMethod;
    use crate::regime::MarketRegime;
    use crate::signals::SignalKind;
    use crate::strategies::test_support::bars_from_closes;
    use crate::strategies::StrategyId;

    fn intent(kind: SignalKind, confidence: f64) -> TradeIntent {
        TradeIntent::new(
            1,
            "AAPL",
            kind,
            confidence,
            vec![StrategyId::EmaCross],
            MarketRegime::Ranging,
            SizingMethod::RiskBased,
            150.0,
            147.0,
            156.0,
            0,
        )
    }

    fn quiet_ctx() -> CycleContext {
        CycleContext {
            cycle_id: 1,
            now_ms: 0,
            proxy_bars: Vec::new(),
            minutes_to_close: Some(120),
            minutes_since_open: Some(90),
        }
    }

    #[test]
    fn factors_respect_bounds() {
        let bars = bars_from_closes(&(0..60).map(|i| 100.0 + i as f64 * 0.3).collect::<Vec<_>>(), 1000.0);
        assert!(volume_factor(&bars, 1.5).abs() <= VOLUME_BOUND + 1e-12);
        assert!(confluence_factor(&bars, Direction::Long).abs() <= CONFLUENCE_BOUND + 1e-12);
        assert!(timing_factor(&quiet_ctx()).abs() <= TIMING_BOUND + 1e-12);
    }

    #[test]
    fn confluence_boosts_aligned_longs() {
        let rising: Vec<f64> = (0..80).map(|i| 100.0 + i as f64 * 0.5).collect();
        let bars = bars_from_closes(&rising, 1000.0);
        assert!(confluence_factor(&bars, Direction::Long) > 0.0);
        assert!(confluence_factor(&bars, Direction::Short) < 0.0);
    }

    #[test]
    fn final_minutes_penalised() {
        let mut ctx = quiet_ctx();
        ctx.minutes_to_close = Some(15);
        assert!((timing_factor(&ctx) + TIMING_BOUND).abs() < 1e-12);
    }

    #[test]
    fn opening_hour_boosted() {
        let mut ctx = quiet_ctx();
        ctx.minutes_since_open = Some(30);
        ctx.minutes_to_close = Some(360);
        assert!(timing_factor(&ctx) > 0.0);
    }

    #[test]
    fn floor_boundary_semantics() {
        let config = SignalsConfig::default(); // floor 0.55
        let bars = bars_from_closes(&vec![100.0; 60], 1000.0);
        let mut ctx = quiet_ctx();
        ctx.minutes_since_open = Some(90); // neutral timing

        // Flat bars, no proxy, neutral timing, and a volume floor equal to
        // the flat tape's ratio: every factor is 0 and confidence passes
        // through unchanged. Exactly at the floor is accepted.
        let kept = enhance(intent(SignalKind::Long, 0.55), &bars, 1.0, &config, &ctx);
        assert!(matches!(kept, Enhanced::Kept(_)));

        // Strictly below the floor is rejected.
        let dropped = enhance(intent(SignalKind::Long, 0.549), &bars, 1.0, &config, &ctx);
        assert!(matches!(dropped, Enhanced::Dropped { .. }));
    }

    #[test]
    fn exits_are_never_dropped() {
        let config = SignalsConfig::default();
        let bars = bars_from_closes(&vec![100.0; 60], 1000.0);
        let result = enhance(intent(SignalKind::ExitLong, 0.1), &bars, 1.5, &config, &quiet_ctx());
        assert!(matches!(result, Enhanced::Kept(_)));
    }

    #[test]
    fn correlation_penalises_longs_into_weak_index() {
        // Symbol and proxy both falling: high correlation, negative tone.
        let falling: Vec<f64> = (0..60).map(|i| 200.0 - i as f64 * 0.8).collect();
        let symbol_bars = bars_from_closes(&falling, 1000.0);
        let proxy_bars = bars_from_closes(&falling, 1_000_000.0);
        let factor = correlation_factor(&symbol_bars, &proxy_bars, Direction::Long);
        assert!(factor < 0.0, "long into a falling correlated index must be penalised, got {factor}");
        // The mirror short is rewarded.
        assert!(correlation_factor(&symbol_bars, &proxy_bars, Direction::Short) > 0.0);
    }

    #[test]
    fn confidence_clamped_to_unit_interval() {
        let config = SignalsConfig::default();
        let rising: Vec<f64> = (0..80).map(|i| 100.0 + i as f64 * 0.5).collect();
        let mut bars = bars_from_closes(&rising, 1000.0);
        // Volume spike on the last bar maxes the volume factor.
        bars.last_mut().unwrap().volume = 10_000.0;
        let mut ctx = quiet_ctx();
        ctx.minutes_since_open = Some(30);
        ctx.minutes_to_close = Some(360);

        match enhance(intent(SignalKind::Long, 0.95), &bars, 0.5, &config, &ctx) {
            Enhanced::Kept(intent) => assert!(intent.confidence <= 1.0),
            other => panic!("expected Kept, got {other:?}"),
        }
    }
}
