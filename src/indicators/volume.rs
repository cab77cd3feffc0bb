// =============================================================================
// Rolling volume statistics — mean and ratio
// =============================================================================
//
// The volume ratio at bar i is volume[i] divided by the mean volume of the
// `period` bars preceding i (current bar excluded). Strategies use it as a
// participation gate: a breakout on 0.3x average volume is noise.
// =============================================================================

/// Rolling mean of the `period` values preceding each index (exclusive).
pub fn volume_mean(volumes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; volumes.len()];
    if period == 0 || volumes.len() <= period {
        return out;
    }

    let mut window_sum: f64 = volumes[..period].iter().sum();
    for i in period..volumes.len() {
        let mean = window_sum / period as f64;
        if mean.is_finite() {
            out[i] = Some(mean);
        }
        window_sum += volumes[i] - volumes[i - period];
    }
    out
}

/// Current volume over the trailing mean, aligned to the input. None during
/// warm-up and when the trailing mean is zero.
pub fn volume_ratio(volumes: &[f64], period: usize) -> Vec<Option<f64>> {
    let means = volume_mean(volumes, period);
    volumes
        .iter()
        .zip(means)
        .map(|(&v, mean)| match mean {
            Some(m) if m > 0.0 => {
                let ratio = v / m;
                if ratio.is_finite() {
                    Some(ratio)
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect()
}

/// Most recent volume ratio.
pub fn current_volume_ratio(volumes: &[f64], period: usize) -> Option<f64> {
    crate::indicators::latest(&volume_ratio(volumes, period))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_excludes_current_bar() {
        let volumes = vec![10.0, 20.0, 30.0, 600.0];
        let means = volume_mean(&volumes, 3);
        // At index 3 the mean covers [10, 20, 30], not the 600 spike.
        assert!((means[3].unwrap() - 20.0).abs() < 1e-10);
    }

    #[test]
    fn ratio_flags_volume_spike() {
        let mut volumes = vec![100.0; 20];
        volumes.push(300.0);
        let ratio = current_volume_ratio(&volumes, 20).unwrap();
        assert!((ratio - 3.0).abs() < 1e-10);
    }

    #[test]
    fn ratio_none_on_zero_mean() {
        let mut volumes = vec![0.0; 20];
        volumes.push(100.0);
        assert!(current_volume_ratio(&volumes, 20).is_none());
    }

    #[test]
    fn warmup_region_is_none() {
        let volumes = vec![100.0; 25];
        let ratios = volume_ratio(&volumes, 20);
        assert!(ratios[19].is_none());
        assert!(ratios[20].is_some());
    }

    #[test]
    fn insufficient_data() {
        assert!(volume_ratio(&[1.0, 2.0], 20).iter().all(|v| v.is_none()));
    }
}
