pub mod oscillators;
pub mod patterns;
pub mod trend;
pub mod volatility;
pub mod volume;

use std::collections::HashMap;

use crate::types::{Candle, SignalKind, SignalParams};

/// One computed series, aligned 1:1 with the input candles. Warmup bars are
/// `f64::NAN` (or `0` for patterns).
#[derive(Debug, Clone)]
pub enum IndicatorSeries {
    Single(Vec<f64>),
    Macd {
        macd: Vec<f64>,
        signal: Vec<f64>,
        histogram: Vec<f64>,
    },
    Bands {
        upper: Vec<f64>,
        middle: Vec<f64>,
        lower: Vec<f64>,
    },
    Stoch {
        k: Vec<f64>,
        d: Vec<f64>,
    },
    Pattern(Vec<i8>),
}

impl IndicatorSeries {
    pub fn len(&self) -> usize {
        match self {
            IndicatorSeries::Single(v) => v.len(),
            IndicatorSeries::Macd { macd, .. } => macd.len(),
            IndicatorSeries::Bands { middle, .. } => middle.len(),
            IndicatorSeries::Stoch { k, .. } => k.len(),
            IndicatorSeries::Pattern(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type IndicatorSet = HashMap<SignalKind, IndicatorSeries>;

/// Stateless indicator computation over a candle slice. Holds no state and
/// reads none; everything it needs arrives as arguments.
pub struct IndicatorEngine;

impl IndicatorEngine {
    /// Bars an indicator needs before its first defined value.
    pub fn warmup(kind: SignalKind, params: &SignalParams) -> usize {
        let period = params.period;
        match kind {
            SignalKind::Rsi => period.unwrap_or(14) as usize + 1,
            SignalKind::Macd => {
                let slow = params.slow_period.unwrap_or(26) as usize;
                let signal = params.signal_period.unwrap_or(9) as usize;
                slow + signal
            }
            SignalKind::Bollinger | SignalKind::Bbw => period.unwrap_or(20) as usize,
            SignalKind::Ema => period.unwrap_or(21) as usize,
            SignalKind::Ma200 => period.unwrap_or(200) as usize,
            SignalKind::Stochastic => {
                period.unwrap_or(14) as usize + params.signal_period.unwrap_or(3) as usize
            }
            SignalKind::Atr => period.unwrap_or(14) as usize + 1,
            SignalKind::Adx => 2 * period.unwrap_or(14) as usize,
            SignalKind::Volume => period.unwrap_or(20) as usize,
            SignalKind::Obv => period.unwrap_or(10) as usize + 1,
            SignalKind::Mfi => period.unwrap_or(14) as usize + 1,
            SignalKind::Cmf => period.unwrap_or(20) as usize,
            SignalKind::Cci => period.unwrap_or(20) as usize,
            SignalKind::Roc => period.unwrap_or(10) as usize + 1,
            SignalKind::WilliamsR => period.unwrap_or(14) as usize,
            SignalKind::Donchian => period.unwrap_or(20) as usize + 1,
            SignalKind::Psar => 2,
            SignalKind::CdlEngulfing | SignalKind::CdlHammer | SignalKind::CdlDoji => 2,
            SignalKind::CdlMorningStar => 3,
        }
    }

    /// Largest warmup across a requirement set, plus one bar of history for
    /// event conditions.
    pub fn max_warmup(required: &[(SignalKind, SignalParams)]) -> usize {
        required
            .iter()
            .map(|(kind, params)| Self::warmup(*kind, params))
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Compute every required series over the candle slice. Series are keyed
    /// by kind; within one requirement set each kind appears once.
    pub fn compute(candles: &[Candle], required: &[(SignalKind, SignalParams)]) -> IndicatorSet {
        let closes: Vec<f64> = candles.iter().map(|c| c.close_f64()).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high_f64()).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low_f64()).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume_f64()).collect();

        let mut out: IndicatorSet = HashMap::with_capacity(required.len());
        for (kind, params) in required {
            if out.contains_key(kind) {
                continue;
            }
            let series = match kind {
                SignalKind::Rsi => IndicatorSeries::Single(oscillators::rsi_series(
                    &closes,
                    params.period.unwrap_or(14) as usize,
                )),
                SignalKind::Macd => {
                    let (macd, signal, histogram) = trend::macd_series(
                        &closes,
                        params.fast_period.unwrap_or(12) as usize,
                        params.slow_period.unwrap_or(26) as usize,
                        params.signal_period.unwrap_or(9) as usize,
                    );
                    IndicatorSeries::Macd {
                        macd,
                        signal,
                        histogram,
                    }
                }
                SignalKind::Bollinger => {
                    let (upper, middle, lower) = volatility::bollinger_series(
                        &closes,
                        params.period.unwrap_or(20) as usize,
                        params.std_dev.unwrap_or(2.0),
                    );
                    IndicatorSeries::Bands {
                        upper,
                        middle,
                        lower,
                    }
                }
                SignalKind::Ema => IndicatorSeries::Single(trend::ema_series(
                    &closes,
                    params.period.unwrap_or(21) as usize,
                )),
                SignalKind::Ma200 => IndicatorSeries::Single(trend::sma_series(
                    &closes,
                    params.period.unwrap_or(200) as usize,
                )),
                SignalKind::Stochastic => {
                    let (k, d) = oscillators::stochastic_series(
                        &highs,
                        &lows,
                        &closes,
                        params.period.unwrap_or(14) as usize,
                        params.signal_period.unwrap_or(3) as usize,
                    );
                    IndicatorSeries::Stoch { k, d }
                }
                SignalKind::Atr => IndicatorSeries::Single(volatility::atr_series(
                    &highs,
                    &lows,
                    &closes,
                    params.period.unwrap_or(14) as usize,
                )),
                SignalKind::Adx => IndicatorSeries::Single(trend::adx_series(
                    &highs,
                    &lows,
                    &closes,
                    params.period.unwrap_or(14) as usize,
                )),
                SignalKind::Volume => IndicatorSeries::Single(volume::volume_ratio_series(
                    &volumes,
                    params.period.unwrap_or(20) as usize,
                )),
                SignalKind::Obv => {
                    IndicatorSeries::Single(volume::obv_series(&closes, &volumes))
                }
                SignalKind::Mfi => IndicatorSeries::Single(oscillators::mfi_series(
                    &highs,
                    &lows,
                    &closes,
                    &volumes,
                    params.period.unwrap_or(14) as usize,
                )),
                SignalKind::Cmf => IndicatorSeries::Single(volume::cmf_series(
                    &highs,
                    &lows,
                    &closes,
                    &volumes,
                    params.period.unwrap_or(20) as usize,
                )),
                SignalKind::Cci => IndicatorSeries::Single(oscillators::cci_series(
                    &highs,
                    &lows,
                    &closes,
                    params.period.unwrap_or(20) as usize,
                )),
                SignalKind::Roc => IndicatorSeries::Single(oscillators::roc_series(
                    &closes,
                    params.period.unwrap_or(10) as usize,
                )),
                SignalKind::WilliamsR => IndicatorSeries::Single(oscillators::williams_r_series(
                    &highs,
                    &lows,
                    &closes,
                    params.period.unwrap_or(14) as usize,
                )),
                SignalKind::Bbw => IndicatorSeries::Single(volatility::bbw_series(
                    &closes,
                    params.period.unwrap_or(20) as usize,
                    params.std_dev.unwrap_or(2.0),
                )),
                SignalKind::Donchian => {
                    let (upper, middle, lower) = volatility::donchian_series(
                        &highs,
                        &lows,
                        params.period.unwrap_or(20) as usize,
                    );
                    IndicatorSeries::Bands {
                        upper,
                        middle,
                        lower,
                    }
                }
                SignalKind::Psar => IndicatorSeries::Single(trend::psar_series(
                    &highs,
                    &lows,
                    params.multiplier.unwrap_or(0.02),
                    0.2,
                )),
                SignalKind::CdlEngulfing => {
                    IndicatorSeries::Pattern(patterns::engulfing_series(candles))
                }
                SignalKind::CdlHammer => {
                    IndicatorSeries::Pattern(patterns::hammer_series(candles))
                }
                SignalKind::CdlDoji => IndicatorSeries::Pattern(patterns::doji_series(candles)),
                SignalKind::CdlMorningStar => {
                    IndicatorSeries::Pattern(patterns::morning_star_series(candles))
                }
            };
            out.insert(*kind, series);
        }
        out
    }
}

/// Rolling mean helper shared by the series functions.
pub(crate) fn rolling_mean(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = sum / period as f64;
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = sum / period as f64;
    }
    out
}

/// Rolling population standard deviation.
pub(crate) fn rolling_stddev(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    for i in (period - 1)..values.len() {
        let window = &values[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        out[i] = variance.sqrt();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    pub(crate) fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let start = Utc::now() - Duration::hours(closes.len() as i64);
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let close = Decimal::try_from(c).unwrap();
                Candle {
                    open_time: start + Duration::hours(i as i64),
                    open: close,
                    high: close * Decimal::new(101, 2),
                    low: close * Decimal::new(99, 2),
                    close,
                    volume: Decimal::from(1000),
                }
            })
            .collect()
    }

    #[test]
    fn series_align_with_input_length() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64).sin()).collect();
        let candles = candles_from_closes(&closes);
        let required = vec![
            (SignalKind::Rsi, SignalParams::default()),
            (SignalKind::Macd, SignalParams::default()),
            (SignalKind::Bollinger, SignalParams::default()),
        ];
        let set = IndicatorEngine::compute(&candles, &required);
        for series in set.values() {
            assert_eq!(series.len(), candles.len());
        }
    }

    #[test]
    fn warmup_bars_are_nan() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let candles = candles_from_closes(&closes);
        let required = vec![(SignalKind::Rsi, SignalParams::default())];
        let set = IndicatorEngine::compute(&candles, &required);
        match set.get(&SignalKind::Rsi).unwrap() {
            IndicatorSeries::Single(values) => {
                assert!(values[..14].iter().all(|v| v.is_nan()));
                assert!(values[14..].iter().all(|v| v.is_finite()));
            }
            _ => panic!("rsi should be a single series"),
        }
    }

    #[test]
    fn rolling_mean_matches_manual() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let means = rolling_mean(&values, 3);
        assert!(means[0].is_nan() && means[1].is_nan());
        assert!((means[2] - 2.0).abs() < 1e-12);
        assert!((means[4] - 4.0).abs() < 1e-12);
    }
}
