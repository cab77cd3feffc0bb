// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period), upper/lower = middle ± k * σ. The Band Width
// (BBW) is the normalised distance: (upper - lower) / middle * 100 — the
// volatility metric the regime detector reads.
// =============================================================================

/// Aligned Bollinger Band series.
#[derive(Debug, Clone)]
pub struct Bollinger {
    pub upper: Vec<Option<f64>>,
    pub middle: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
    pub width: Vec<Option<f64>>,
}

/// Latest fully-defined point of a Bollinger series.
#[derive(Debug, Clone, Copy)]
pub struct BollingerPoint {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

impl Bollinger {
    pub fn latest(&self) -> Option<BollingerPoint> {
        let i = self.middle.iter().rposition(|v| v.is_some())?;
        Some(BollingerPoint {
            upper: self.upper[i]?,
            middle: self.middle[i]?,
            lower: self.lower[i]?,
            width: self.width[i]?,
        })
    }
}

/// Compute Bollinger Bands over `closes` with the given `period` and band
/// width `num_std` (σ multiplier). Entries before the warm-up are None, as
/// are entries where the middle band is zero (degenerate input).
pub fn bollinger(closes: &[f64], period: usize, num_std: f64) -> Bollinger {
    let n = closes.len();
    let mut result = Bollinger {
        upper: vec![None; n],
        middle: vec![None; n],
        lower: vec![None; n],
        width: vec![None; n],
    };
    if period == 0 || n < period {
        return result;
    }

    for i in (period - 1)..n {
        let window = &closes[i + 1 - period..=i];
        let mean: f64 = window.iter().sum::<f64>() / period as f64;
        if mean == 0.0 || !mean.is_finite() {
            continue;
        }
        let variance = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / period as f64;
        let std_dev = variance.sqrt();

        let upper = mean + num_std * std_dev;
        let lower = mean - num_std * std_dev;
        let width = (upper - lower) / mean * 100.0;
        if !width.is_finite() {
            continue;
        }

        result.upper[i] = Some(upper);
        result.middle[i] = Some(mean);
        result.lower[i] = Some(lower);
        result.width[i] = Some(width);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = bollinger(&closes, 20, 2.0);
        let point = bb.latest().unwrap();
        assert!(point.upper > point.middle);
        assert!(point.lower < point.middle);
        assert!(point.width > 0.0);
    }

    #[test]
    fn bollinger_insufficient_data() {
        let bb = bollinger(&[1.0, 2.0, 3.0], 20, 2.0);
        assert!(bb.latest().is_none());
    }

    #[test]
    fn bollinger_flat_has_zero_width() {
        let closes = vec![100.0; 20];
        let point = bollinger(&closes, 20, 2.0).latest().unwrap();
        assert!(point.width.abs() < 1e-10);
        assert!((point.upper - point.lower).abs() < 1e-10);
    }

    #[test]
    fn bollinger_alignment() {
        let closes: Vec<f64> = (1..=25).map(|x| x as f64).collect();
        let bb = bollinger(&closes, 20, 2.0);
        assert_eq!(bb.middle.len(), 25);
        assert!(bb.middle[18].is_none());
        assert!(bb.middle[19].is_some());
    }
}
