// =============================================================================
// Volume-flow indicators — OBV, A/D line, Chaikin Money Flow
// =============================================================================
//
// OBV: running total of volume, added on up-closes and subtracted on
//      down-closes. Defined from the first bar (seed 0.0).
// A/D: accumulation/distribution line using the money-flow multiplier
//      ((C-L) - (H-C)) / (H-L). Defined from the first bar.
// CMF: Σ(money-flow volume) / Σ(volume) over a rolling window, in [-1, 1].
// =============================================================================

use crate::market_data::Bar;

/// On-Balance Volume. Defined for every bar; seeded at 0.0.
pub fn obv(bars: &[Bar]) -> Vec<f64> {
    let mut out = Vec::with_capacity(bars.len());
    let mut total = 0.0;

    for (i, bar) in bars.iter().enumerate() {
        if i > 0 {
            let prev_close = bars[i - 1].close;
            if bar.close > prev_close {
                total += bar.volume;
            } else if bar.close < prev_close {
                total -= bar.volume;
            }
        }
        out.push(total);
    }
    out
}

/// Money-flow multiplier for one bar: ((C-L) - (H-C)) / (H-L), zero when the
/// bar has no range.
fn money_flow_multiplier(bar: &Bar) -> f64 {
    let range = bar.high - bar.low;
    if range <= 0.0 {
        return 0.0;
    }
    ((bar.close - bar.low) - (bar.high - bar.close)) / range
}

/// Accumulation/Distribution line. Defined for every bar.
pub fn ad_line(bars: &[Bar]) -> Vec<f64> {
    let mut out = Vec::with_capacity(bars.len());
    let mut total = 0.0;
    for bar in bars {
        total += money_flow_multiplier(bar) * bar.volume;
        out.push(total);
    }
    out
}

/// Chaikin Money Flow over a rolling `period`, aligned to the input. None
/// during warm-up or when the window traded no volume.
pub fn cmf(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if period == 0 || bars.len() < period {
        return out;
    }

    let mfv: Vec<f64> = bars
        .iter()
        .map(|b| money_flow_multiplier(b) * b.volume)
        .collect();

    for i in (period - 1)..bars.len() {
        let window = i + 1 - period..=i;
        let mfv_sum: f64 = mfv[window.clone()].iter().sum();
        let vol_sum: f64 = bars[window].iter().map(|b| b.volume).sum();
        if vol_sum > 0.0 {
            let value = mfv_sum / vol_sum;
            if value.is_finite() {
                out[i] = Some(value);
            }
        }
    }
    out
}

/// Most recent CMF value.
pub fn current_cmf(bars: &[Bar], period: usize) -> Option<f64> {
    crate::indicators::latest(&cmf(bars, period))
}
