// =============================================================================
// Donchian Channels — rolling highs and lows
// =============================================================================
//
// The upper channel at bar i is the highest high of the `period` bars
// *preceding* i (the current bar is excluded), the lower channel the lowest
// low. Exclusion matters for breakout detection: a close above the prior
// N-bar high is a breakout only if the current bar did not define that high.
// =============================================================================

use crate::market_data::Bar;

/// Aligned Donchian channel series.
#[derive(Debug, Clone)]
pub struct Donchian {
    pub upper: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

/// Compute Donchian channels over the prior `period` bars.
pub fn donchian(bars: &[Bar], period: usize) -> Donchian {
    let n = bars.len();
    let mut result = Donchian {
        upper: vec![None; n],
        lower: vec![None; n],
    };
    if period == 0 || n <= period {
        return result;
    }

    for i in period..n {
        let window = &bars[i - period..i];
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut valid = true;
        for b in window {
            if !b.high.is_finite() || !b.low.is_finite() {
                valid = false;
                break;
            }
            high = high.max(b.high);
            low = low.min(b.low);
        }
        if valid {
            result.upper[i] = Some(high);
            result.lower[i] = Some(low);
        }
    }
    result
}
