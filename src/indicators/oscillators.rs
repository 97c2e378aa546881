use super::{rolling_mean, rolling_stddev};

/// Wilder-smoothed RSI.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; closes.len()];
    if period == 0 || closes.len() <= period {
        return out;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss += -change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = rsi_value(avg_gain, avg_loss);

    for i in (period + 1)..closes.len() {
        let change = closes[i] - closes[i - 1];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = rsi_value(avg_gain, avg_loss);
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Fast %K smoothed into %D by simple average.
pub fn stochastic_series(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    period: usize,
    d_period: usize,
) -> (Vec<f64>, Vec<f64>) {
    let len = closes.len();
    let mut k = vec![f64::NAN; len];
    if period == 0 || len < period {
        return (k.clone(), k);
    }
    for i in (period - 1)..len {
        let window_high = highs[i + 1 - period..=i]
            .iter()
            .cloned()
            .fold(f64::MIN, f64::max);
        let window_low = lows[i + 1 - period..=i]
            .iter()
            .cloned()
            .fold(f64::MAX, f64::min);
        let range = window_high - window_low;
        k[i] = if range == 0.0 {
            50.0
        } else {
            (closes[i] - window_low) / range * 100.0
        };
    }

    let mut d = vec![f64::NAN; len];
    for i in (period - 1 + d_period - 1)..len {
        let window = &k[i + 1 - d_period..=i];
        if window.iter().all(|v| v.is_finite()) {
            d[i] = window.iter().sum::<f64>() / d_period as f64;
        }
    }
    (k, d)
}

pub fn williams_r_series(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let len = closes.len();
    let mut out = vec![f64::NAN; len];
    if period == 0 || len < period {
        return out;
    }
    for i in (period - 1)..len {
        let window_high = highs[i + 1 - period..=i]
            .iter()
            .cloned()
            .fold(f64::MIN, f64::max);
        let window_low = lows[i + 1 - period..=i]
            .iter()
            .cloned()
            .fold(f64::MAX, f64::min);
        let range = window_high - window_low;
        out[i] = if range == 0.0 {
            -50.0
        } else {
            (window_high - closes[i]) / range * -100.0
        };
    }
    out
}

/// Commodity Channel Index over typical prices.
pub fn cci_series(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let len = closes.len();
    let typical: Vec<f64> = (0..len)
        .map(|i| (highs[i] + lows[i] + closes[i]) / 3.0)
        .collect();
    let means = rolling_mean(&typical, period);

    let mut out = vec![f64::NAN; len];
    if period == 0 || len < period {
        return out;
    }
    for i in (period - 1)..len {
        let window = &typical[i + 1 - period..=i];
        let mean = means[i];
        let mean_dev = window.iter().map(|v| (v - mean).abs()).sum::<f64>() / period as f64;
        out[i] = if mean_dev == 0.0 {
            0.0
        } else {
            (typical[i] - mean) / (0.015 * mean_dev)
        };
    }
    out
}

/// Rate of change in percent over `period` bars.
pub fn roc_series(closes: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; closes.len()];
    if period == 0 {
        return out;
    }
    for i in period..closes.len() {
        let base = closes[i - period];
        if base != 0.0 {
            out[i] = (closes[i] - base) / base * 100.0;
        }
    }
    out
}

/// Money Flow Index: volume-weighted RSI analogue.
pub fn mfi_series(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    volumes: &[f64],
    period: usize,
) -> Vec<f64> {
    let len = closes.len();
    let mut out = vec![f64::NAN; len];
    if period == 0 || len <= period {
        return out;
    }
    let typical: Vec<f64> = (0..len)
        .map(|i| (highs[i] + lows[i] + closes[i]) / 3.0)
        .collect();
    let flows: Vec<f64> = (0..len).map(|i| typical[i] * volumes[i]).collect();

    for i in period..len {
        let mut positive = 0.0;
        let mut negative = 0.0;
        for j in (i + 1 - period)..=i {
            if typical[j] > typical[j - 1] {
                positive += flows[j];
            } else if typical[j] < typical[j - 1] {
                negative += flows[j];
            }
        }
        out[i] = if negative == 0.0 {
            100.0
        } else {
            let ratio = positive / negative;
            100.0 - 100.0 / (1.0 + ratio)
        };
    }
    out
}

/// Bollinger %B companion used by the evaluator for strength scaling.
pub fn percent_b(close: f64, upper: f64, lower: f64) -> f64 {
    let range = upper - lower;
    if range == 0.0 {
        0.5
    } else {
        (close - lower) / range
    }
}

#[allow(dead_code)]
pub(crate) fn zscore(values: &[f64], period: usize) -> Vec<f64> {
    let means = rolling_mean(values, period);
    let devs = rolling_stddev(values, period);
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            if means[i].is_nan() || devs[i].is_nan() || devs[i] == 0.0 {
                f64::NAN
            } else {
                (v - means[i]) / devs[i]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_hits_100_on_monotonic_rise() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let rsi = rsi_series(&closes, 14);
        assert!((rsi[29] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_drops_below_30_on_steady_fall() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64 * 2.0).collect();
        let rsi = rsi_series(&closes, 14);
        assert!(rsi[29] < 30.0);
    }

    #[test]
    fn stochastic_k_bounded() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        let (k, d) = stochastic_series(&highs, &lows, &closes, 14, 3);
        for v in k.iter().chain(d.iter()).filter(|v| v.is_finite()) {
            assert!((0.0..=100.0).contains(v));
        }
    }

    #[test]
    fn roc_positive_on_rise() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let roc = roc_series(&closes, 10);
        assert!(roc[19] > 0.0);
    }
}
