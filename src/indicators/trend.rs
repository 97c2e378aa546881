use super::rolling_mean;

pub fn sma_series(closes: &[f64], period: usize) -> Vec<f64> {
    rolling_mean(closes, period)
}

/// EMA seeded with the SMA of the first `period` values.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut ema = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = ema;
    for i in period..values.len() {
        ema = (values[i] - ema) * alpha + ema;
        out[i] = ema;
    }
    out
}

/// MACD line, signal line and histogram.
pub fn macd_series(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let len = closes.len();
    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);

    let macd: Vec<f64> = (0..len)
        .map(|i| {
            if fast_ema[i].is_nan() || slow_ema[i].is_nan() {
                f64::NAN
            } else {
                fast_ema[i] - slow_ema[i]
            }
        })
        .collect();

    // Signal EMA starts where the MACD line becomes defined
    let mut signal = vec![f64::NAN; len];
    if let Some(start) = macd.iter().position(|v| v.is_finite()) {
        let defined = &macd[start..];
        let ema = ema_series(defined, signal_period);
        for (offset, value) in ema.into_iter().enumerate() {
            signal[start + offset] = value;
        }
    }

    let histogram: Vec<f64> = (0..len)
        .map(|i| {
            if macd[i].is_nan() || signal[i].is_nan() {
                f64::NAN
            } else {
                macd[i] - signal[i]
            }
        })
        .collect();

    (macd, signal, histogram)
}

/// Wilder ADX over the +DI/-DI spread.
pub fn adx_series(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let len = closes.len();
    let mut out = vec![f64::NAN; len];
    if period == 0 || len < 2 * period + 1 {
        return out;
    }

    let mut tr = vec![0.0; len];
    let mut plus_dm = vec![0.0; len];
    let mut minus_dm = vec![0.0; len];
    for i in 1..len {
        let high_move = highs[i] - highs[i - 1];
        let low_move = lows[i - 1] - lows[i];
        plus_dm[i] = if high_move > low_move && high_move > 0.0 {
            high_move
        } else {
            0.0
        };
        minus_dm[i] = if low_move > high_move && low_move > 0.0 {
            low_move
        } else {
            0.0
        };
        tr[i] = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
    }

    let mut tr_smooth: f64 = tr[1..=period].iter().sum();
    let mut plus_smooth: f64 = plus_dm[1..=period].iter().sum();
    let mut minus_smooth: f64 = minus_dm[1..=period].iter().sum();

    let mut dx = vec![f64::NAN; len];
    for i in (period + 1)..len {
        tr_smooth = tr_smooth - tr_smooth / period as f64 + tr[i];
        plus_smooth = plus_smooth - plus_smooth / period as f64 + plus_dm[i];
        minus_smooth = minus_smooth - minus_smooth / period as f64 + minus_dm[i];

        if tr_smooth == 0.0 {
            dx[i] = 0.0;
            continue;
        }
        let plus_di = plus_smooth / tr_smooth * 100.0;
        let minus_di = minus_smooth / tr_smooth * 100.0;
        let di_sum = plus_di + minus_di;
        dx[i] = if di_sum == 0.0 {
            0.0
        } else {
            (plus_di - minus_di).abs() / di_sum * 100.0
        };
    }

    // First ADX is the average of the first `period` DX values
    let first_adx_idx = 2 * period;
    let mut adx = dx[(period + 1)..=first_adx_idx]
        .iter()
        .sum::<f64>()
        / period as f64;
    out[first_adx_idx] = adx;
    for i in (first_adx_idx + 1)..len {
        adx = (adx * (period as f64 - 1.0) + dx[i]) / period as f64;
        out[i] = adx;
    }
    out
}

/// Parabolic SAR with standard acceleration schedule.
pub fn psar_series(highs: &[f64], lows: &[f64], step: f64, max_step: f64) -> Vec<f64> {
    let len = highs.len();
    let mut out = vec![f64::NAN; len];
    if len < 2 {
        return out;
    }

    let mut uptrend = highs[1] + lows[1] >= highs[0] + lows[0];
    let mut sar = if uptrend { lows[0] } else { highs[0] };
    let mut extreme = if uptrend { highs[1] } else { lows[1] };
    let mut af = step;

    out[1] = sar;
    for i in 2..len {
        sar += af * (extreme - sar);
        if uptrend {
            sar = sar.min(lows[i - 1]).min(lows[i - 2]);
            if lows[i] < sar {
                uptrend = false;
                sar = extreme;
                extreme = lows[i];
                af = step;
            } else if highs[i] > extreme {
                extreme = highs[i];
                af = (af + step).min(max_step);
            }
        } else {
            sar = sar.max(highs[i - 1]).max(highs[i - 2]);
            if highs[i] > sar {
                uptrend = true;
                sar = extreme;
                extreme = highs[i];
                af = step;
            } else if lows[i] < extreme {
                extreme = lows[i];
                af = (af + step).min(max_step);
            }
        }
        out[i] = sar;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_tracks_constant_series() {
        let values = vec![5.0; 30];
        let ema = ema_series(&values, 10);
        assert!((ema[29] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn macd_crosses_signal_after_reversal() {
        // Long decline then sharp rally forces a bullish cross
        let mut closes: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        closes.extend((0..30).map(|i| 140.0 + i as f64 * 3.0));
        let (macd, signal, _) = macd_series(&closes, 12, 26, 9);

        let crossed = (40..closes.len()).any(|i| {
            macd[i - 1].is_finite()
                && signal[i - 1].is_finite()
                && macd[i - 1] < signal[i - 1]
                && macd[i] >= signal[i]
        });
        assert!(crossed);
    }

    #[test]
    fn adx_rises_in_strong_trend() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + i as f64 * 2.0).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        let adx = adx_series(&highs, &lows, &closes, 14);
        assert!(adx[79] > 25.0);
    }

    #[test]
    fn psar_sits_below_price_in_uptrend() {
        let highs: Vec<f64> = (0..30).map(|i| 101.0 + i as f64).collect();
        let lows: Vec<f64> = (0..30).map(|i| 99.0 + i as f64).collect();
        let sar = psar_series(&highs, &lows, 0.02, 0.2);
        assert!(sar[29] < lows[29]);
    }
}
