use super::rolling_mean;

/// Current volume relative to its rolling average. 1.0 means average volume.
pub fn volume_ratio_series(volumes: &[f64], period: usize) -> Vec<f64> {
    let means = rolling_mean(volumes, period);
    volumes
        .iter()
        .zip(means.iter())
        .map(|(v, m)| {
            if m.is_nan() || *m == 0.0 {
                f64::NAN
            } else {
                v / m
            }
        })
        .collect()
}

/// On-balance volume, defined from the first bar.
pub fn obv_series(closes: &[f64], volumes: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; closes.len()];
    for i in 1..closes.len() {
        let delta = if closes[i] > closes[i - 1] {
            volumes[i]
        } else if closes[i] < closes[i - 1] {
            -volumes[i]
        } else {
            0.0
        };
        out[i] = out[i - 1] + delta;
    }
    out
}

/// Chaikin Money Flow.
pub fn cmf_series(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    volumes: &[f64],
    period: usize,
) -> Vec<f64> {
    let len = closes.len();
    let mut out = vec![f64::NAN; len];
    if period == 0 || len < period {
        return out;
    }

    let mfv: Vec<f64> = (0..len)
        .map(|i| {
            let range = highs[i] - lows[i];
            if range == 0.0 {
                0.0
            } else {
                ((closes[i] - lows[i]) - (highs[i] - closes[i])) / range * volumes[i]
            }
        })
        .collect();

    for i in (period - 1)..len {
        let vol_sum: f64 = volumes[i + 1 - period..=i].iter().sum();
        if vol_sum == 0.0 {
            out[i] = 0.0;
        } else {
            out[i] = mfv[i + 1 - period..=i].iter().sum::<f64>() / vol_sum;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obv_accumulates_on_up_moves() {
        let closes = [100.0, 101.0, 102.0, 101.0];
        let volumes = [10.0, 20.0, 30.0, 5.0];
        let obv = obv_series(&closes, &volumes);
        assert_eq!(obv, vec![0.0, 20.0, 50.0, 45.0]);
    }

    #[test]
    fn volume_ratio_flags_spikes() {
        let mut volumes = vec![100.0; 25];
        volumes.push(300.0);
        let ratio = volume_ratio_series(&volumes, 20);
        assert!(ratio[25] > 2.5);
    }
}
