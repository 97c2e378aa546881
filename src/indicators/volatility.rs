use super::{rolling_mean, rolling_stddev};

/// Wilder-smoothed Average True Range.
pub fn atr_series(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let len = closes.len();
    let mut out = vec![f64::NAN; len];
    if period == 0 || len <= period {
        return out;
    }

    let mut tr = vec![0.0; len];
    tr[0] = highs[0] - lows[0];
    for i in 1..len {
        tr[i] = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
    }

    let mut atr = tr[1..=period].iter().sum::<f64>() / period as f64;
    out[period] = atr;
    for i in (period + 1)..len {
        atr = (atr * (period as f64 - 1.0) + tr[i]) / period as f64;
        out[i] = atr;
    }
    out
}

pub fn bollinger_series(
    closes: &[f64],
    period: usize,
    std_dev: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let middle = rolling_mean(closes, period);
    let devs = rolling_stddev(closes, period);
    let upper: Vec<f64> = middle
        .iter()
        .zip(devs.iter())
        .map(|(m, d)| m + std_dev * d)
        .collect();
    let lower: Vec<f64> = middle
        .iter()
        .zip(devs.iter())
        .map(|(m, d)| m - std_dev * d)
        .collect();
    (upper, middle, lower)
}

/// Bollinger band width normalized by the middle band.
pub fn bbw_series(closes: &[f64], period: usize, std_dev: f64) -> Vec<f64> {
    let (upper, middle, lower) = bollinger_series(closes, period, std_dev);
    (0..closes.len())
        .map(|i| {
            if middle[i].is_nan() || middle[i] == 0.0 {
                f64::NAN
            } else {
                (upper[i] - lower[i]) / middle[i]
            }
        })
        .collect()
}

/// Donchian channel over the *previous* `period` bars, so a close above the
/// upper band is a genuine breakout rather than self-inclusion.
pub fn donchian_series(highs: &[f64], lows: &[f64], period: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let len = highs.len();
    let mut upper = vec![f64::NAN; len];
    let mut lower = vec![f64::NAN; len];
    let mut middle = vec![f64::NAN; len];
    if period == 0 {
        return (upper, middle, lower);
    }
    for i in period..len {
        let hi = highs[i - period..i].iter().cloned().fold(f64::MIN, f64::max);
        let lo = lows[i - period..i].iter().cloned().fold(f64::MAX, f64::min);
        upper[i] = hi;
        lower[i] = lo;
        middle[i] = (hi + lo) / 2.0;
    }
    (upper, middle, lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atr_constant_range() {
        let highs: Vec<f64> = (0..30).map(|i| 102.0 + i as f64).collect();
        let lows: Vec<f64> = (0..30).map(|i| 98.0 + i as f64).collect();
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let atr = atr_series(&highs, &lows, &closes, 14);
        // True range settles near the bar range plus the 1-unit gap
        assert!(atr[29] > 3.9 && atr[29] < 5.1);
    }

    #[test]
    fn bollinger_bands_bracket_price() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.5).sin()).collect();
        let (upper, middle, lower) = bollinger_series(&closes, 20, 2.0);
        for i in 20..40 {
            assert!(lower[i] <= middle[i] && middle[i] <= upper[i]);
        }
    }

    #[test]
    fn donchian_breakout_detectable() {
        let mut highs: Vec<f64> = vec![101.0; 25];
        let mut lows: Vec<f64> = vec![99.0; 25];
        highs.push(105.0);
        lows.push(103.0);
        let (upper, _, _) = donchian_series(&highs, &lows, 20);
        let last = highs.len() - 1;
        // Prior channel top excludes the breakout bar itself
        assert!((upper[last] - 101.0).abs() < 1e-12);
    }
}
