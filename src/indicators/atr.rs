// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// True Range per bar spans any overnight gap:
//
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is Wilder's smoothing of TR, seeded with a simple average of the
// first `period` values:
//
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Stop distances and signal-strength normalisation both run off the
// 14-period value.
// =============================================================================

use crate::market_data::Bar;

/// Compute the ATR series, aligned to the input bars (first value at index
/// `period`; the first bar has no True Range).
pub fn atr(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if period == 0 || bars.len() < period + 1 {
        return out;
    }

    let tr_values: Vec<f64> = (1..bars.len())
        .map(|i| {
            let high = bars[i].high;
            let low = bars[i].low;
            let prev_close = bars[i - 1].close;
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect();

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return out;
    }
    out[period] = Some(seed);

    let period_f = period as f64;
    let mut value = seed;
    for (i, &tr) in tr_values.iter().enumerate().skip(period) {
        value = (value * (period_f - 1.0) + tr) / period_f;
        if !value.is_finite() {
            break;
        }
        out[i + 1] = Some(value);
    }

    out
}

/// Most recent ATR value.
pub fn current_atr(bars: &[Bar], period: usize) -> Option<f64> {
    crate::indicators::latest(&atr(bars, period))
}

/// ATR as a fraction of the last close. Useful for comparing volatility
/// across assets with different price scales.
pub fn current_atr_frac(bars: &[Bar], period: usize) -> Option<f64> {
    let value = current_atr(bars, period)?;
    let last_close = bars.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some(value / last_close)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Timeframe;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: "TEST".into(),
            timeframe: Timeframe::Min30,
            open_time: 0,
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn atr_period_zero() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 20];
        assert!(atr(&bars, 0).iter().all(|v| v.is_none()));
    }

    #[test]
    fn atr_insufficient_data() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 10];
        assert!(atr(&bars, 14).iter().all(|v| v.is_none()));
    }

    #[test]
    fn atr_exact_minimum_data() {
        // period=3, need 4 bars to get 3 TR values.
        let bars = vec![
            bar(100.0, 102.0, 98.0, 101.0),
            bar(101.0, 104.0, 99.0, 103.0),
            bar(103.0, 106.0, 100.0, 105.0),
            bar(105.0, 108.0, 102.0, 107.0),
        ];
        let series = atr(&bars, 3);
        assert!(series[..3].iter().all(|v| v.is_none()));
        let value = series[3].unwrap();
        assert!(value > 0.0 && value.is_finite());
    }

    #[test]
    fn atr_constant_range_converges() {
        // All bars have the same 10-point range; ATR should sit near 10.
        let mut bars = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            bars.push(bar(base, base + 5.0, base - 5.0, base));
        }
        let value = current_atr(&bars, 14).unwrap();
        assert!((value - 10.0).abs() < 1.0, "expected ATR near 10.0, got {value}");
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap scenario: |H - prevClose| > H - L.
        let bars = vec![
            bar(100.0, 105.0, 95.0, 95.0),
            bar(110.0, 115.0, 108.0, 112.0), // gap up: |115-95|=20 > 7
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        let value = current_atr(&bars, 3).unwrap();
        assert!(value > 7.0, "ATR should reflect the gap, got {value}");
    }

    #[test]
    fn atr_frac_is_scale_free() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let frac = current_atr_frac(&bars, 14).unwrap();
        assert!(frac > 0.0 && frac < 1.0);
    }

    #[test]
    fn atr_nan_truncates_tail() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, f64::NAN, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(current_atr(&bars, 3).is_none());
    }
}
