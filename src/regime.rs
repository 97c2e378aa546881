use crate::indicators::trend::{adx_series, ema_series};
use crate::types::{Candle, MarketRegime};

/// Classified market state at one bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeSnapshot {
    pub regime: MarketRegime,
    pub confidence: f64,
}

impl RegimeSnapshot {
    pub fn unknown() -> Self {
        Self {
            regime: MarketRegime::Unknown,
            confidence: 0.0,
        }
    }
}

/// Market-regime classification contract. The engine treats the classifier
/// as an external collaborator; this trait is the boundary.
pub trait RegimeClassifier: Send + Sync {
    fn classify(&self, candles: &[Candle], i: usize) -> RegimeSnapshot;
}

/// Default classifier: EMA(20/50) spread decides direction, ADX(14) decides
/// whether the market is trending at all.
pub struct EmaAdxClassifier {
    fast_period: usize,
    slow_period: usize,
    adx_period: usize,
    adx_trend_threshold: f64,
}

impl Default for EmaAdxClassifier {
    fn default() -> Self {
        Self {
            fast_period: 20,
            slow_period: 50,
            adx_period: 14,
            adx_trend_threshold: 20.0,
        }
    }
}

impl RegimeClassifier for EmaAdxClassifier {
    fn classify(&self, candles: &[Candle], i: usize) -> RegimeSnapshot {
        if i >= candles.len() || i + 1 < self.slow_period.max(2 * self.adx_period + 1) {
            return RegimeSnapshot::unknown();
        }

        let window = &candles[..=i];
        let closes: Vec<f64> = window.iter().map(|c| c.close_f64()).collect();
        let highs: Vec<f64> = window.iter().map(|c| c.high_f64()).collect();
        let lows: Vec<f64> = window.iter().map(|c| c.low_f64()).collect();

        let fast = ema_series(&closes, self.fast_period);
        let slow = ema_series(&closes, self.slow_period);
        let adx = adx_series(&highs, &lows, &closes, self.adx_period);

        let (fast_now, slow_now, adx_now) = (fast[i], slow[i], adx[i]);
        if fast_now.is_nan() || slow_now.is_nan() || slow_now == 0.0 {
            return RegimeSnapshot::unknown();
        }

        let spread_pct = (fast_now - slow_now) / slow_now * 100.0;
        let trending = adx_now.is_finite() && adx_now > self.adx_trend_threshold;

        if !trending {
            let confidence = if adx_now.is_finite() {
                ((self.adx_trend_threshold - adx_now) / self.adx_trend_threshold)
                    .clamp(0.2, 0.9)
            } else {
                0.2
            };
            return RegimeSnapshot {
                regime: MarketRegime::Ranging,
                confidence,
            };
        }

        let regime = if spread_pct > 0.0 {
            MarketRegime::Uptrend
        } else {
            MarketRegime::Downtrend
        };
        let confidence = (0.4 + spread_pct.abs() / 2.0 + (adx_now - self.adx_trend_threshold) / 100.0)
            .clamp(0.4, 0.99);
        RegimeSnapshot { regime, confidence }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
                    high: close * Decimal::new(101, 2),
                    low: close * Decimal::new(99, 2),
                    close,
                    volume: Decimal::from(1000),
                }
            })
            .collect()
    }

    #[test]
    fn steady_rise_is_uptrend() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let candles = candles_from_closes(&closes);
        let classifier = EmaAdxClassifier::default();
        let snapshot = classifier.classify(&candles, candles.len() - 1);
        assert_eq!(snapshot.regime, MarketRegime::Uptrend);
        assert!(snapshot.confidence >= 0.4);
    }

    #[test]
    fn steady_fall_is_downtrend() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 * 0.99f64.powi(i)).collect();
        let candles = candles_from_closes(&closes);
        let classifier = EmaAdxClassifier::default();
        let snapshot = classifier.classify(&candles, candles.len() - 1);
        assert_eq!(snapshot.regime, MarketRegime::Downtrend);
    }

    #[test]
    fn short_history_is_unknown() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let candles = candles_from_closes(&closes);
        let classifier = EmaAdxClassifier::default();
        assert_eq!(
            classifier.classify(&candles, candles.len() - 1).regime,
            MarketRegime::Unknown
        );
    }
}
