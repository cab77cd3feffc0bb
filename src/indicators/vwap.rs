// =============================================================================
// Volume-Weighted Average Price (VWAP) — session reset
// =============================================================================
//
// VWAP = Σ(typical_price * volume) / Σ(volume), accumulated from the start
// of the trading day and reset at each UTC day boundary. Entries are None
// until the session has traded any volume.
// =============================================================================

use crate::market_data::Bar;

const DAY_MS: i64 = 86_400_000;

/// Compute the session-reset VWAP series, aligned to the input bars.
pub fn session_vwap(bars: &[Bar]) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];

    let mut session_day: Option<i64> = None;
    let mut pv_sum = 0.0;
    let mut vol_sum = 0.0;

    for (i, bar) in bars.iter().enumerate() {
        let day = bar.open_time.div_euclid(DAY_MS);
        if session_day != Some(day) {
            session_day = Some(day);
            pv_sum = 0.0;
            vol_sum = 0.0;
        }

        let typical = (bar.high + bar.low + bar.close) / 3.0;
        if typical.is_finite() && bar.volume.is_finite() && bar.volume >= 0.0 {
            pv_sum += typical * bar.volume;
            vol_sum += bar.volume;
        }

        if vol_sum > 0.0 {
            let value = pv_sum / vol_sum;
            if value.is_finite() {
                out[i] = Some(value);
            }
        }
    }

    out
}

/// Most recent session VWAP.
pub fn current_vwap(bars: &[Bar]) -> Option<f64> {
    crate::indicators::latest(&session_vwap(bars))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Timeframe;

    fn bar_at(open_time: i64, price: f64, volume: f64) -> Bar {
        Bar {
            symbol: "TEST".into(),
            timeframe: Timeframe::Min30,
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    #[test]
    fn vwap_single_bar_is_typical_price() {
        let bars = vec![bar_at(0, 100.0, 500.0)];
        let value = current_vwap(&bars).unwrap();
        assert!((value - 100.0).abs() < 1e-10);
    }

    #[test]
    fn vwap_is_volume_weighted() {
        // Heavy volume at 100, light volume at 110 — VWAP leans toward 100.
        let bars = vec![bar_at(0, 100.0, 900.0), bar_at(1_800_000, 110.0, 100.0)];
        let value = current_vwap(&bars).unwrap();
        assert!((value - 101.0).abs() < 1e-10, "got {value}");
    }

    #[test]
    fn vwap_resets_at_day_boundary() {
        let bars = vec![
            bar_at(0, 100.0, 1000.0),
            // Next UTC day: accumulator must reset, so VWAP equals the new price.
            bar_at(DAY_MS, 200.0, 10.0),
        ];
        let series = session_vwap(&bars);
        assert!((series[0].unwrap() - 100.0).abs() < 1e-10);
        assert!((series[1].unwrap() - 200.0).abs() < 1e-10);
    }

    #[test]
    fn vwap_none_with_zero_volume() {
        let bars = vec![bar_at(0, 100.0, 0.0)];
        assert!(session_vwap(&bars)[0].is_none());
    }

    #[test]
    fn vwap_alignment() {
        let bars: Vec<Bar> = (0..10)
            .map(|i| bar_at(i * 1_800_000, 100.0 + i as f64, 100.0))
            .collect();
        assert_eq!(session_vwap(&bars).len(), 10);
    }
}
