// =============================================================================
// Realized volatility — rolling standard deviation of simple returns
// =============================================================================
//
// Used by the regime detector (volatility percentile) and the
// volatility-adjusted position sizer. Values are per-bar return standard
// deviations; callers that need an annualized figure scale by the bar
// frequency themselves.
// =============================================================================

/// Rolling standard deviation of simple returns over `window` returns,
/// aligned to the input closes.
pub fn realized_vol(closes: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if window == 0 || closes.len() < window + 1 {
        return out;
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect();

    for i in window..=returns.len() {
        let slice = &returns[i - window..i];
        let mean: f64 = slice.iter().sum::<f64>() / window as f64;
        let variance = slice.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / window as f64;
        let sd = variance.sqrt();
        if sd.is_finite() {
            // returns[i-1] belongs to closes[i], so the value lands at index i.
            out[i] = Some(sd);
        }
    }
    out
}

/// Most recent realized volatility.
pub fn current_realized_vol(closes: &[f64], window: usize) -> Option<f64> {
    crate::indicators::latest(&realized_vol(closes, window))
}

/// Percentile rank (0..=1) of the latest value within the defined series.
pub fn percentile_rank(series: &[Option<f64>]) -> Option<f64> {
    let defined: Vec<f64> = series.iter().flatten().copied().collect();
    let last = *defined.last()?;
    if defined.len() < 2 {
        return Some(0.5);
    }
    let below = defined.iter().filter(|&&v| v <= last).count();
    Some(below as f64 / defined.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_series_has_zero_vol() {
        let closes = vec![100.0; 30];
        assert!(current_realized_vol(&closes, 20).unwrap().abs() < 1e-12);
    }

    #[test]
    fn choppy_beats_smooth() {
        let smooth: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 0.1).collect();
        let choppy: Vec<f64> = (0..40)
            .map(|i| 100.0 + if i % 2 == 0 { 5.0 } else { -5.0 })
            .collect();
        let v_smooth = current_realized_vol(&smooth, 20).unwrap();
        let v_choppy = current_realized_vol(&choppy, 20).unwrap();
        assert!(v_choppy > v_smooth * 10.0);
    }

    #[test]
    fn warmup_region() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let series = realized_vol(&closes, 20);
        assert!(series[19].is_none());
        assert!(series[20].is_some());
    }

    #[test]
    fn percentile_of_extreme_value() {
        let mut series: Vec<Option<f64>> = (0..50).map(|i| Some(i as f64 * 0.001)).collect();
        series.push(Some(10.0)); // far above everything seen
        let rank = percentile_rank(&series).unwrap();
        assert!(rank > 0.95);
    }

    #[test]
    fn insufficient_data() {
        assert!(current_realized_vol(&[1.0, 2.0], 20).is_none());
    }
}
