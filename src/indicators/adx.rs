// =============================================================================
// Average Directional Index (ADX) — trend strength, direction-blind
// =============================================================================
//
// Per bar: +DM/-DM (directional movement) and True Range, Wilder-smoothed
// over `period`, give the directional indicators
//
//   +DI = smoothed(+DM) / smoothed(TR) * 100
//   -DI = smoothed(-DM) / smoothed(TR) * 100
//   DX  = |+DI - -DI| / (+DI + -DI) * 100
//
// and ADX is the Wilder-smoothed average of DX. Readings above ~25 mark a
// trending tape; below ~20, chop. Both the momentum strategy and the regime
// detector key off those levels.
// =============================================================================

use crate::market_data::Bar;

/// Compute the ADX series, aligned to the input bars. The first defined value
/// sits at index `2 * period` (period bars for the initial DM/TR smoothing
/// plus period DX values to seed the ADX average).
pub fn adx(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let n = bars.len();
    let mut out = vec![None; n];
    if period == 0 || n < 2 * period + 1 {
        return out;
    }

    let period_f = period as f64;
    let bar_count = n - 1;

    // ------------------------------------------------------------------
    // Step 1 & 2: Raw +DM, -DM, and True Range per consecutive pair
    // ------------------------------------------------------------------
    let mut plus_dm = Vec::with_capacity(bar_count);
    let mut minus_dm = Vec::with_capacity(bar_count);
    let mut tr_vals = Vec::with_capacity(bar_count);

    for i in 1..n {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_high = bars[i - 1].high;
        let prev_low = bars[i - 1].low;
        let prev_close = bars[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    // ------------------------------------------------------------------
    // Step 3-5: Wilder's smoothing and DX per bar
    // ------------------------------------------------------------------
    let mut smooth_plus_dm: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus_dm: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values: Vec<f64> = Vec::with_capacity(bar_count - period + 1);

    match compute_dx(smooth_plus_dm, smooth_minus_dm, smooth_tr) {
        Some(dx) => dx_values.push(dx),
        None => return out,
    }

    for i in period..bar_count {
        smooth_plus_dm = smooth_plus_dm - smooth_plus_dm / period_f + plus_dm[i];
        smooth_minus_dm = smooth_minus_dm - smooth_minus_dm / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];

        match compute_dx(smooth_plus_dm, smooth_minus_dm, smooth_tr) {
            Some(dx) => dx_values.push(dx),
            None => return out,
        }
    }

    // ------------------------------------------------------------------
    // Step 6: ADX = Wilder's smoothed average of DX, re-aligned to bars.
    // dx_values[j] corresponds to bar index period + j.
    // ------------------------------------------------------------------
    if dx_values.len() < period {
        return out;
    }

    let seed: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return out;
    }
    out[2 * period] = Some(seed);

    let mut value = seed;
    for (j, &dx) in dx_values.iter().enumerate().skip(period) {
        value = (value * (period_f - 1.0) + dx) / period_f;
        if !value.is_finite() {
            break;
        }
        out[period + j + 1] = Some(value);
    }

    out
}

/// Most recent ADX value.
pub fn current_adx(bars: &[Bar], period: usize) -> Option<f64> {
    crate::indicators::latest(&adx(bars, period))
}

/// Compute DX from smoothed +DM, -DM, and TR values.
fn compute_dx(smooth_plus_dm: f64, smooth_minus_dm: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = (smooth_plus_dm / smooth_tr) * 100.0;
    let minus_di = (smooth_minus_dm / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        // Both +DI and -DI are zero — no directional movement.
        return Some(0.0);
    }

    let dx = ((plus_di - minus_di).abs() / di_sum) * 100.0;
    if dx.is_finite() {
        Some(dx)
    } else {
        None
    }
}
