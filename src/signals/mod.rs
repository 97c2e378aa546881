use crate::indicators::{IndicatorSeries, IndicatorSet};
use crate::types::{Candle, MatchedSignal, SignalCondition, SignalDirection, SignalKind, SignalSpec};

/// Catalog of enabled (indicator, condition) pairs a backtest sweeps by
/// default when the operator doesn't narrow the set.
pub fn default_catalog() -> Vec<SignalSpec> {
    use SignalCondition::*;
    use SignalKind::*;
    vec![
        SignalSpec::new(Rsi, Oversold),
        SignalSpec::new(Rsi, OversoldEntry),
        SignalSpec::new(Rsi, OversoldExit),
        SignalSpec::new(Macd, BullishCross),
        SignalSpec::new(Macd, Positive),
        SignalSpec::new(Bollinger, PriceBelowLower),
        SignalSpec::new(Bollinger, CrossAboveMiddle),
        SignalSpec::new(Ema, CrossAbove),
        SignalSpec::new(Ma200, PriceAbove),
        SignalSpec::new(Stochastic, Oversold),
        SignalSpec::new(Stochastic, BullishCross),
        SignalSpec::new(Adx, StrongTrend),
        SignalSpec::new(Volume, SpikeAbove),
        SignalSpec::new(Obv, TrendUp),
        SignalSpec::new(Mfi, Oversold),
        SignalSpec::new(Cmf, Positive),
        SignalSpec::new(Cci, Oversold),
        SignalSpec::new(Roc, ZeroCrossUp),
        SignalSpec::new(WilliamsR, Oversold),
        SignalSpec::new(Bbw, SqueezeFire),
        SignalSpec::new(Donchian, BreakoutUp),
        SignalSpec::new(Psar, FlipBullish),
        SignalSpec::new(CdlEngulfing, Bullish),
        SignalSpec::new(CdlHammer, Bullish),
        SignalSpec::new(CdlMorningStar, Bullish),
    ]
}

/// Result of evaluating one spec at one bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalEvaluation {
    pub matches: bool,
    pub strength: f64,
    pub direction: SignalDirection,
    pub is_event: bool,
}

impl SignalEvaluation {
    fn no_match(is_event: bool) -> Self {
        Self {
            matches: false,
            strength: 0.0,
            direction: SignalDirection::Neutral,
            is_event,
        }
    }

    fn matched(strength: f64, direction: SignalDirection, is_event: bool) -> Self {
        Self {
            matches: true,
            strength: strength.clamp(0.0, 100.0),
            direction,
            is_event,
        }
    }
}

/// Sum of matched strengths; the aggregation every strength threshold is
/// checked against.
pub fn combined_strength(matched: &[MatchedSignal]) -> f64 {
    matched.iter().map(|m| m.strength).sum()
}

/// Net direction of a matched set: the side with the larger summed strength.
pub fn net_direction(matched: &[MatchedSignal]) -> SignalDirection {
    let mut long = 0.0;
    let mut short = 0.0;
    for m in matched {
        match m.direction {
            SignalDirection::Long => long += m.strength,
            SignalDirection::Short => short += m.strength,
            SignalDirection::Neutral => {}
        }
    }
    if long > short {
        SignalDirection::Long
    } else if short > long {
        SignalDirection::Short
    } else {
        SignalDirection::Neutral
    }
}

/// Evaluate one signal spec at bar `i` against precomputed series. Warmup
/// bars (NaN values, or missing previous bar for event conditions) never
/// match.
pub fn evaluate_signal(
    spec: &SignalSpec,
    series: &IndicatorSet,
    candles: &[Candle],
    i: usize,
) -> SignalEvaluation {
    let is_event = spec.condition.is_event();
    if i >= candles.len() || (is_event && i == 0) {
        return SignalEvaluation::no_match(is_event);
    }
    let Some(series) = series.get(&spec.kind) else {
        return SignalEvaluation::no_match(is_event);
    };
    let close = candles[i].close_f64();

    use SignalCondition::*;
    match (spec.kind, series) {
        (SignalKind::Rsi, IndicatorSeries::Single(rsi)) => {
            let oversold = spec.params.oversold.unwrap_or(30.0);
            let overbought = spec.params.overbought.unwrap_or(70.0);
            let now = rsi[i];
            if now.is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                Oversold if now < oversold => SignalEvaluation::matched(
                    50.0 + (oversold - now) * 2.5,
                    SignalDirection::Long,
                    false,
                ),
                Overbought if now > overbought => SignalEvaluation::matched(
                    50.0 + (now - overbought) * 2.5,
                    SignalDirection::Short,
                    false,
                ),
                OversoldEntry if crossed_below(rsi, i, oversold) => SignalEvaluation::matched(
                    60.0 + (oversold - now) * 2.0,
                    SignalDirection::Long,
                    true,
                ),
                OversoldExit if crossed_above(rsi, i, oversold) => {
                    SignalEvaluation::matched(65.0, SignalDirection::Long, true)
                }
                OverboughtEntry if crossed_above(rsi, i, overbought) => SignalEvaluation::matched(
                    60.0 + (now - overbought) * 2.0,
                    SignalDirection::Short,
                    true,
                ),
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Macd, IndicatorSeries::Macd { macd, signal, histogram }) => {
            if macd[i].is_nan() || signal[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            let hist_pct = if close != 0.0 {
                (histogram[i] / close * 100.0).abs()
            } else {
                0.0
            };
            match spec.condition {
                BullishCross
                    if i > 0
                        && macd[i - 1].is_finite()
                        && signal[i - 1].is_finite()
                        && macd[i - 1] < signal[i - 1]
                        && macd[i] >= signal[i] =>
                {
                    SignalEvaluation::matched(
                        60.0 + (hist_pct * 50.0).min(30.0),
                        SignalDirection::Long,
                        true,
                    )
                }
                BearishCross
                    if i > 0
                        && macd[i - 1].is_finite()
                        && signal[i - 1].is_finite()
                        && macd[i - 1] > signal[i - 1]
                        && macd[i] <= signal[i] =>
                {
                    SignalEvaluation::matched(
                        60.0 + (hist_pct * 50.0).min(30.0),
                        SignalDirection::Short,
                        true,
                    )
                }
                Positive if macd[i] > 0.0 => {
                    SignalEvaluation::matched(55.0, SignalDirection::Long, false)
                }
                Negative if macd[i] < 0.0 => {
                    SignalEvaluation::matched(55.0, SignalDirection::Short, false)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Bollinger, IndicatorSeries::Bands { upper, middle, lower }) => {
            if upper[i].is_nan() || lower[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            let pb = crate::indicators::oscillators::percent_b(close, upper[i], lower[i]);
            match spec.condition {
                PriceBelowLower if close < lower[i] => SignalEvaluation::matched(
                    60.0 + (-pb * 100.0).min(35.0),
                    SignalDirection::Long,
                    false,
                ),
                PriceAboveUpper if close > upper[i] => SignalEvaluation::matched(
                    60.0 + ((pb - 1.0) * 100.0).min(35.0),
                    SignalDirection::Short,
                    false,
                ),
                CrossAboveMiddle
                    if i > 0
                        && middle[i - 1].is_finite()
                        && candles[i - 1].close_f64() < middle[i - 1]
                        && close >= middle[i] =>
                {
                    SignalEvaluation::matched(60.0, SignalDirection::Long, true)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Ema | SignalKind::Ma200, IndicatorSeries::Single(ma)) => {
            if ma[i].is_nan() || ma[i] == 0.0 {
                return SignalEvaluation::no_match(is_event);
            }
            let dist_pct = (close - ma[i]) / ma[i] * 100.0;
            match spec.condition {
                PriceAbove if close > ma[i] => SignalEvaluation::matched(
                    50.0 + (dist_pct * 10.0).min(30.0),
                    SignalDirection::Long,
                    false,
                ),
                PriceBelow if close < ma[i] => SignalEvaluation::matched(
                    50.0 + (-dist_pct * 10.0).min(30.0),
                    SignalDirection::Short,
                    false,
                ),
                CrossAbove
                    if i > 0
                        && ma[i - 1].is_finite()
                        && candles[i - 1].close_f64() < ma[i - 1]
                        && close >= ma[i] =>
                {
                    SignalEvaluation::matched(65.0, SignalDirection::Long, true)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Stochastic, IndicatorSeries::Stoch { k, d }) => {
            let oversold = spec.params.oversold.unwrap_or(20.0);
            let overbought = spec.params.overbought.unwrap_or(80.0);
            if k[i].is_nan() || d[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                Oversold if k[i] < oversold => SignalEvaluation::matched(
                    55.0 + (oversold - k[i]) * 1.5,
                    SignalDirection::Long,
                    false,
                ),
                Overbought if k[i] > overbought => SignalEvaluation::matched(
                    55.0 + (k[i] - overbought) * 1.5,
                    SignalDirection::Short,
                    false,
                ),
                BullishCross
                    if i > 0
                        && k[i - 1].is_finite()
                        && d[i - 1].is_finite()
                        && k[i - 1] <= d[i - 1]
                        && k[i] > d[i] =>
                {
                    SignalEvaluation::matched(60.0, SignalDirection::Long, true)
                }
                BearishCross
                    if i > 0
                        && k[i - 1].is_finite()
                        && d[i - 1].is_finite()
                        && k[i - 1] >= d[i - 1]
                        && k[i] < d[i] =>
                {
                    SignalEvaluation::matched(60.0, SignalDirection::Short, true)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Adx, IndicatorSeries::Single(adx)) => {
            let threshold = spec.params.threshold.unwrap_or(25.0);
            if adx[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                StrongTrend if adx[i] > threshold => SignalEvaluation::matched(
                    50.0 + (adx[i] - threshold).min(30.0),
                    SignalDirection::Neutral,
                    false,
                ),
                WeakTrend if adx[i] <= threshold => {
                    SignalEvaluation::matched(50.0, SignalDirection::Neutral, false)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Atr, IndicatorSeries::Single(atr)) => match spec.condition {
            Expanding
                if i > 0
                    && atr[i].is_finite()
                    && atr[i - 1].is_finite()
                    && atr[i] > atr[i - 1] =>
            {
                SignalEvaluation::matched(50.0, SignalDirection::Neutral, false)
            }
            _ => SignalEvaluation::no_match(is_event),
        },
        (SignalKind::Volume, IndicatorSeries::Single(ratio)) => {
            let threshold = spec.params.threshold.unwrap_or(2.0);
            match spec.condition {
                SpikeAbove if ratio[i].is_finite() && ratio[i] >= threshold => {
                    SignalEvaluation::matched(
                        50.0 + ((ratio[i] - threshold) * 20.0).min(40.0),
                        SignalDirection::Neutral,
                        false,
                    )
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Obv, IndicatorSeries::Single(obv)) => {
            let lookback = spec.params.period.unwrap_or(10) as usize;
            if i < lookback {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                TrendUp if obv[i] > obv[i - lookback] => {
                    SignalEvaluation::matched(55.0, SignalDirection::Long, false)
                }
                TrendDown if obv[i] < obv[i - lookback] => {
                    SignalEvaluation::matched(55.0, SignalDirection::Short, false)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Mfi, IndicatorSeries::Single(mfi)) => {
            let oversold = spec.params.oversold.unwrap_or(20.0);
            let overbought = spec.params.overbought.unwrap_or(80.0);
            if mfi[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                Oversold if mfi[i] < oversold => SignalEvaluation::matched(
                    55.0 + (oversold - mfi[i]) * 1.5,
                    SignalDirection::Long,
                    false,
                ),
                Overbought if mfi[i] > overbought => SignalEvaluation::matched(
                    55.0 + (mfi[i] - overbought) * 1.5,
                    SignalDirection::Short,
                    false,
                ),
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Cmf, IndicatorSeries::Single(cmf)) => {
            if cmf[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                Positive if cmf[i] > 0.0 => SignalEvaluation::matched(
                    50.0 + (cmf[i] * 100.0).min(30.0),
                    SignalDirection::Long,
                    false,
                ),
                Negative if cmf[i] < 0.0 => SignalEvaluation::matched(
                    50.0 + (-cmf[i] * 100.0).min(30.0),
                    SignalDirection::Short,
                    false,
                ),
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Cci, IndicatorSeries::Single(cci)) => {
            if cci[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                Oversold if cci[i] < -100.0 => SignalEvaluation::matched(
                    55.0 + ((-100.0 - cci[i]) / 5.0).min(35.0),
                    SignalDirection::Long,
                    false,
                ),
                Overbought if cci[i] > 100.0 => SignalEvaluation::matched(
                    55.0 + ((cci[i] - 100.0) / 5.0).min(35.0),
                    SignalDirection::Short,
                    false,
                ),
                ZeroCrossUp if crossed_above(cci, i, 0.0) => {
                    SignalEvaluation::matched(58.0, SignalDirection::Long, true)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Roc, IndicatorSeries::Single(roc)) => {
            if roc[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                Positive if roc[i] > 0.0 => SignalEvaluation::matched(
                    50.0 + (roc[i] * 5.0).min(25.0),
                    SignalDirection::Long,
                    false,
                ),
                Negative if roc[i] < 0.0 => SignalEvaluation::matched(
                    50.0 + (-roc[i] * 5.0).min(25.0),
                    SignalDirection::Short,
                    false,
                ),
                ZeroCrossUp if crossed_above(roc, i, 0.0) => {
                    SignalEvaluation::matched(60.0, SignalDirection::Long, true)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::WilliamsR, IndicatorSeries::Single(wr)) => {
            let oversold = spec.params.oversold.unwrap_or(-80.0);
            let overbought = spec.params.overbought.unwrap_or(-20.0);
            if wr[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                Oversold if wr[i] < oversold => SignalEvaluation::matched(
                    55.0 + (oversold - wr[i]) * 1.5,
                    SignalDirection::Long,
                    false,
                ),
                Overbought if wr[i] > overbought => SignalEvaluation::matched(
                    55.0 + (wr[i] - overbought) * 1.5,
                    SignalDirection::Short,
                    false,
                ),
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Bbw, IndicatorSeries::Single(bbw)) => {
            let threshold = spec.params.threshold.unwrap_or(0.04);
            if bbw[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                SqueezeFire if crossed_above(bbw, i, threshold) => {
                    SignalEvaluation::matched(65.0, SignalDirection::Neutral, true)
                }
                Tight if bbw[i] < threshold => {
                    SignalEvaluation::matched(55.0, SignalDirection::Neutral, false)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Donchian, IndicatorSeries::Bands { upper, lower, .. }) => {
            if upper[i].is_nan() || lower[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            match spec.condition {
                BreakoutUp
                    if close > upper[i]
                        && i > 0
                        && upper[i - 1].is_finite()
                        && candles[i - 1].close_f64() <= upper[i - 1] =>
                {
                    SignalEvaluation::matched(70.0, SignalDirection::Long, true)
                }
                BreakoutDown
                    if close < lower[i]
                        && i > 0
                        && lower[i - 1].is_finite()
                        && candles[i - 1].close_f64() >= lower[i - 1] =>
                {
                    SignalEvaluation::matched(70.0, SignalDirection::Short, true)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (SignalKind::Psar, IndicatorSeries::Single(sar)) => {
            if sar[i].is_nan() {
                return SignalEvaluation::no_match(is_event);
            }
            let prev_close = if i > 0 { candles[i - 1].close_f64() } else { f64::NAN };
            match spec.condition {
                FlipBullish
                    if i > 0
                        && sar[i - 1].is_finite()
                        && sar[i - 1] >= prev_close
                        && sar[i] < close =>
                {
                    SignalEvaluation::matched(65.0, SignalDirection::Long, true)
                }
                FlipBearish
                    if i > 0
                        && sar[i - 1].is_finite()
                        && sar[i - 1] <= prev_close
                        && sar[i] > close =>
                {
                    SignalEvaluation::matched(65.0, SignalDirection::Short, true)
                }
                PriceAbove if close > sar[i] => {
                    SignalEvaluation::matched(52.0, SignalDirection::Long, false)
                }
                PriceBelow if close < sar[i] => {
                    SignalEvaluation::matched(52.0, SignalDirection::Short, false)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        (kind, IndicatorSeries::Pattern(values)) if kind.is_candlestick_pattern() => {
            let base = match kind {
                SignalKind::CdlMorningStar => 70.0,
                SignalKind::CdlEngulfing => 65.0,
                SignalKind::CdlHammer => 60.0,
                _ => 50.0,
            };
            match spec.condition {
                Bullish if values[i] == 1 => {
                    SignalEvaluation::matched(base, SignalDirection::Long, true)
                }
                Bearish if values[i] == -1 => {
                    SignalEvaluation::matched(base, SignalDirection::Short, true)
                }
                _ => SignalEvaluation::no_match(is_event),
            }
        }
        _ => SignalEvaluation::no_match(is_event),
    }
}

fn crossed_below(series: &[f64], i: usize, threshold: f64) -> bool {
    i > 0
        && series[i - 1].is_finite()
        && series[i].is_finite()
        && series[i - 1] >= threshold
        && series[i] < threshold
}

fn crossed_above(series: &[f64], i: usize, threshold: f64) -> bool {
    i > 0
        && series[i - 1].is_finite()
        && series[i].is_finite()
        && series[i - 1] < threshold
        && series[i] >= threshold
}

/// Evaluate every enabled spec at a bar and collect the matches.
pub fn evaluate_all(
    specs: &[SignalSpec],
    series: &IndicatorSet,
    candles: &[Candle],
    i: usize,
) -> Vec<MatchedSignal> {
    let mut matched = Vec::new();
    for spec in specs {
        let eval = evaluate_signal(spec, series, candles, i);
        if eval.matches {
            matched.push(MatchedSignal {
                spec: spec.clone(),
                strength: eval.strength,
                direction: eval.direction,
                is_event: eval.is_event,
            });
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorEngine;
    use crate::types::SignalParams;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let start = Utc::now() - Duration::hours(closes.len() as i64);
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let close = Decimal::try_from(c).unwrap();
                Candle {
                    open_time: start + Duration::hours(i as i64),
                    open: close,
                    high: close * Decimal::new(1005, 3),
                    low: close * Decimal::new(995, 3),
                    close,
                    volume: Decimal::from(1000),
                }
            })
            .collect()
    }

    #[test]
    fn rsi_oversold_state_matches_with_scaled_strength() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 - i as f64 * 1.5).collect();
        let candles = candles_from_closes(&closes);
        let required = vec![(SignalKind::Rsi, SignalParams::default())];
        let series = IndicatorEngine::compute(&candles, &required);

        let spec = SignalSpec::new(SignalKind::Rsi, SignalCondition::Oversold);
        let eval = evaluate_signal(&spec, &series, &candles, candles.len() - 1);
        assert!(eval.matches);
        assert!(!eval.is_event);
        assert_eq!(eval.direction, SignalDirection::Long);
        assert!(eval.strength > 50.0 && eval.strength <= 100.0);
    }

    #[test]
    fn event_condition_fires_only_on_transition_bar() {
        // Decline pushes RSI into oversold at some bar; the entry event must
        // fire exactly once while the state keeps matching afterwards.
        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 + (i % 2) as f64).collect();
        closes.extend((0..20).map(|i| 100.0 - i as f64 * 2.0));
        let candles = candles_from_closes(&closes);
        let required = vec![(SignalKind::Rsi, SignalParams::default())];
        let series = IndicatorEngine::compute(&candles, &required);

        let entry = SignalSpec::new(SignalKind::Rsi, SignalCondition::OversoldEntry);
        let fires: Vec<usize> = (0..candles.len())
            .filter(|&i| evaluate_signal(&entry, &series, &candles, i).matches)
            .collect();
        assert_eq!(fires.len(), 1);

        let state = SignalSpec::new(SignalKind::Rsi, SignalCondition::Oversold);
        let state_bars: Vec<usize> = (0..candles.len())
            .filter(|&i| evaluate_signal(&state, &series, &candles, i).matches)
            .collect();
        assert!(state_bars.len() > 1);
        assert!(state_bars.contains(&fires[0]));
    }

    #[test]
    fn warmup_bars_never_match() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let candles = candles_from_closes(&closes);
        let required = vec![(SignalKind::Rsi, SignalParams::default())];
        let series = IndicatorEngine::compute(&candles, &required);

        let spec = SignalSpec::new(SignalKind::Rsi, SignalCondition::Oversold);
        for i in 0..14 {
            assert!(!evaluate_signal(&spec, &series, &candles, i).matches);
        }
    }

    #[test]
    fn combined_strength_is_sum_of_matched() {
        let matched = vec![
            MatchedSignal {
                spec: SignalSpec::new(SignalKind::Rsi, SignalCondition::Oversold),
                strength: 62.5,
                direction: SignalDirection::Long,
                is_event: false,
            },
            MatchedSignal {
                spec: SignalSpec::new(SignalKind::Macd, SignalCondition::BullishCross),
                strength: 71.0,
                direction: SignalDirection::Long,
                is_event: true,
            },
        ];
        assert!((combined_strength(&matched) - 133.5).abs() < 1e-9);
        assert_eq!(net_direction(&matched), SignalDirection::Long);
    }
}
