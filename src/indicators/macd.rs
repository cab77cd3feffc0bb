// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow)
// Signal    = EMA(MACD line, signal_period)
// Histogram = MACD line - Signal
//
// All three series are aligned to the input closes.
// =============================================================================

use crate::indicators::ema::ema;

/// MACD output: three aligned series.
#[derive(Debug, Clone)]
pub struct Macd {
    pub line: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

/// Compute MACD with the given fast/slow/signal periods (classically
/// 12/26/9).
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Macd {
    let n = closes.len();
    let empty = Macd {
        line: vec![None; n],
        signal: vec![None; n],
        histogram: vec![None; n],
    };
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return empty;
    }

    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);

    let mut line = vec![None; n];
    for i in 0..n {
        if let (Some(f), Some(s)) = (fast_ema[i], slow_ema[i]) {
            line[i] = Some(f - s);
        }
    }

    // Signal: EMA over the defined region of the MACD line, re-aligned.
    let first_defined = match line.iter().position(|v| v.is_some()) {
        Some(idx) => idx,
        None => return empty,
    };
    let defined: Vec<f64> = line[first_defined..].iter().map(|v| v.unwrap_or(0.0)).collect();
    let signal_defined = ema(&defined, signal_period);

    let mut signal = vec![None; n];
    for (offset, value) in signal_defined.into_iter().enumerate() {
        signal[first_defined + offset] = value;
    }

    let mut histogram = vec![None; n];
    for i in 0..n {
        if let (Some(l), Some(s)) = (line[i], signal[i]) {
            histogram[i] = Some(l - s);
        }
    }

    Macd {
        line,
        signal,
        histogram,
    }
}
