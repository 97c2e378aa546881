use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{ScanSettings, SignalMatchingMode};
use crate::error::EngineResult;
use crate::exchange::ExchangeClient;
use crate::indicators::IndicatorEngine;
use crate::regime::{RegimeClassifier, RegimeSnapshot};
use crate::signals::{combined_strength, evaluate_all, net_direction};
use crate::types::{
    Candle, CandleWindow, MarketRegime, SignalMatch, Strategy, TimeFrame,
};

/// Extra candles kept beyond the strict warmup so event conditions always
/// have a previous bar and small gaps heal without a refetch.
const WINDOW_MARGIN: usize = 10;

/// Everything a scan cycle needs beyond the strategies themselves.
pub struct CycleContext<'a> {
    pub settings: &'a ScanSettings,
    pub prices: &'a HashMap<String, Decimal>,
    /// Externally supplied performance-momentum score, 0..100, higher is
    /// better.
    pub conviction_score: Option<f64>,
}

#[derive(Debug, Default)]
pub struct DetectionOutcome {
    pub matches: Vec<(Strategy, SignalMatch, RegimeSnapshot)>,
    pub strategies_scanned: u64,
}

/// Evaluates every active strategy against the most recent closed candle of
/// its (coin, timeframe) each scan cycle.
pub struct SignalDetectionEngine {
    exchange: Arc<dyn ExchangeClient>,
    regime: Arc<dyn RegimeClassifier>,
    windows: Mutex<HashMap<(String, TimeFrame), CandleWindow>>,
}

impl SignalDetectionEngine {
    pub fn new(exchange: Arc<dyn ExchangeClient>, regime: Arc<dyn RegimeClassifier>) -> Self {
        Self {
            exchange,
            regime,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch candles through the sliding window cache. A warm window only
    /// pulls the newest bars; a cold or stale one is rebuilt.
    async fn candles_for(
        &self,
        coin: &str,
        timeframe: TimeFrame,
        min_len: usize,
    ) -> EngineResult<Vec<Candle>> {
        let key = (coin.to_string(), timeframe);
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(key)
            .or_insert_with(|| CandleWindow::new(min_len + WINDOW_MARGIN));
        // Strategies on the same pair can need deeper history than whoever
        // created the window
        if window.max_size < min_len + WINDOW_MARGIN {
            window.max_size = min_len + WINDOW_MARGIN;
        }

        let bar_ms = timeframe.to_milliseconds() as i64;
        let warm = window.len() >= min_len
            && window.last().map_or(false, |c| {
                (Utc::now() - c.open_time).num_milliseconds() < 3 * bar_ms
            });

        if warm {
            let update = self.exchange.get_klines(coin, timeframe, 2).await?;
            for candle in update {
                window.push(candle);
            }
        } else {
            let full = self
                .exchange
                .get_klines(coin, timeframe, (min_len + WINDOW_MARGIN) as u32)
                .await?;
            window.candles.clear();
            for candle in full {
                window.push(candle);
            }
        }
        Ok(window.candles.clone())
    }

    /// One cycle over the active strategies. Matches that clear every
    /// admission rule come back paired with their strategy and the regime
    /// observed at the trigger bar.
    pub async fn scan(
        &self,
        strategies: &[Strategy],
        ctx: &CycleContext<'_>,
    ) -> DetectionOutcome {
        let mut outcome = DetectionOutcome::default();

        for strategy in strategies {
            outcome.strategies_scanned += 1;
            match self.scan_strategy(strategy, ctx).await {
                Ok(Some((m, regime))) => outcome.matches.push((strategy.clone(), m, regime)),
                Ok(None) => {}
                Err(e) => {
                    warn!(strategy = %strategy.name(), coin = %strategy.coin(), "scan failed: {}", e);
                }
            }
        }

        outcome
    }

    async fn scan_strategy(
        &self,
        strategy: &Strategy,
        ctx: &CycleContext<'_>,
    ) -> EngineResult<Option<(SignalMatch, RegimeSnapshot)>> {
        let timeframe = strategy.combination.timeframe;
        let required: Vec<_> = strategy
            .combination
            .signals
            .iter()
            .map(|s| (s.kind, s.params.clone()))
            .collect();
        let warmup = IndicatorEngine::max_warmup(&required);

        let candles = self
            .candles_for(strategy.coin(), timeframe, warmup + 2)
            .await?;
        if candles.len() <= warmup {
            debug!(coin = %strategy.coin(), "window not warm enough yet");
            return Ok(None);
        }

        let i = candles.len() - 1;
        let series = IndicatorEngine::compute(&candles, &required);
        let matched = evaluate_all(&strategy.combination.signals, &series, &candles, i);

        if matched.len() < strategy.required_signals {
            return Ok(None);
        }
        if matched
            .iter()
            .any(|m| m.strength < strategy.min_core_signal_strength)
        {
            return Ok(None);
        }

        let strength = combined_strength(&matched);
        if strength < ctx.settings.minimum_combined_strength {
            return Ok(None);
        }

        let regime = self.regime.classify(&candles, i);
        // A trusted non-uptrend classification blocks entries when the
        // operator asked for it; low-confidence reads don't.
        if ctx.settings.block_trading_in_downtrend
            && regime.confidence >= ctx.settings.minimum_regime_confidence
            && regime.regime != MarketRegime::Uptrend
        {
            debug!(coin = %strategy.coin(), regime = %regime.regime, "blocked outside uptrend");
            return Ok(None);
        }

        if let Some(min_conviction) = ctx.settings.minimum_conviction_score {
            if ctx.conviction_score.unwrap_or(0.0) < min_conviction {
                return Ok(None);
            }
        }

        let admitted = match ctx.settings.signal_matching_mode {
            SignalMatchingMode::Event => matched.iter().any(|m| m.is_event),
            SignalMatchingMode::State => matched.iter().all(|m| !m.is_event),
            SignalMatchingMode::Both => true,
            SignalMatchingMode::ConvictionBased => {
                let weight = ctx.conviction_score.unwrap_or(0.0) / 100.0;
                strength * weight >= ctx.settings.minimum_combined_strength
            }
        };
        if !admitted {
            return Ok(None);
        }

        let price = ctx
            .prices
            .get(strategy.coin())
            .copied()
            .unwrap_or(candles[i].close);

        let direction = net_direction(&matched);
        let m = SignalMatch {
            coin: strategy.coin().to_string(),
            timeframe,
            candle_time: candles[i].open_time,
            price,
            combined_strength: strength,
            market_regime: regime.regime,
            direction,
            future_price_move: None,
            future_max_drawdown: None,
            successful: None,
            time_to_peak_minutes: None,
            win_duration_minutes: None,
            signals: matched,
        };
        Ok(Some((m, regime)))
    }

    /// Current ATR for a coin, used by position sizing at entry.
    pub async fn current_atr(&self, coin: &str, timeframe: TimeFrame) -> EngineResult<f64> {
        use crate::indicators::volatility::atr_series;
        let candles = self.candles_for(coin, timeframe, 16).await?;
        let highs: Vec<f64> = candles.iter().map(|c| c.high_f64()).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low_f64()).collect();
        let closes: Vec<f64> = candles.iter().map(|c| c.close_f64()).collect();
        let atr = atr_series(&highs, &lows, &closes, 14);
        Ok(atr.last().copied().filter(|v| v.is_finite()).unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeClient;
    use crate::types::{
        combination_signature, Combination, SignalCondition, SignalKind, SignalSpec,
    };
    use chrono::Duration;
    use std::collections::HashMap as StdHashMap;

    struct FixedRegime(MarketRegime, f64);

    impl RegimeClassifier for FixedRegime {
        fn classify(&self, _candles: &[Candle], _i: usize) -> RegimeSnapshot {
            RegimeSnapshot {
                regime: self.0,
                confidence: self.1,
            }
        }
    }

    fn oversold_candles() -> Vec<Candle> {
        // Collapse into deep oversold at the final bar
        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 + (i % 2) as f64 * 0.2).collect();
        let mut price = 100.0;
        for _ in 0..25 {
            price -= 2.0;
            closes.push(price);
        }
        let start = Utc::now() - Duration::hours(closes.len() as i64);
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let close = Decimal::try_from(c).unwrap();
                Candle {
                    open_time: start + Duration::hours(i as i64),
                    open: close,
                    high: close * Decimal::new(1002, 3),
                    low: close * Decimal::new(998, 3),
                    close,
                    volume: Decimal::from(1000),
                }
            })
            .collect()
    }

    fn oversold_strategy() -> Strategy {
        let signals = vec![
            SignalSpec::new(SignalKind::Rsi, SignalCondition::Oversold),
            SignalSpec::new(SignalKind::WilliamsR, SignalCondition::Oversold),
        ];
        Strategy::from_combination(Combination {
            signature: combination_signature(&signals, TimeFrame::H1),
            combination_name: "oversold pair".to_string(),
            coin: "BTCUSDT".to_string(),
            timeframe: TimeFrame::H1,
            signals,
            occurrences: 10,
            success_rate: 70.0,
            net_average_price_move: 1.0,
            profit_factor: 2.0,
            dominant_market_regime: MarketRegime::Ranging,
            market_regime_distribution: StdHashMap::new(),
            median_lowest_low: 0.4,
            avg_win_duration_minutes: Some(60.0),
            combined_strength: 150.0,
        })
    }

    fn permissive_settings() -> ScanSettings {
        ScanSettings {
            minimum_combined_strength: 100.0,
            block_trading_in_downtrend: false,
            ..ScanSettings::default()
        }
    }

    #[tokio::test]
    async fn firing_strategy_emits_one_match() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_klines()
            .returning(|_, _, _| Ok(oversold_candles()));

        let engine = SignalDetectionEngine::new(
            Arc::new(mock),
            Arc::new(FixedRegime(MarketRegime::Ranging, 0.8)),
        );
        let settings = permissive_settings();
        let prices = StdHashMap::new();
        let ctx = CycleContext {
            settings: &settings,
            prices: &prices,
            conviction_score: None,
        };

        let outcome = engine.scan(&[oversold_strategy()], &ctx).await;
        assert_eq!(outcome.strategies_scanned, 1);
        assert_eq!(outcome.matches.len(), 1);
        let (_, m, _) = &outcome.matches[0];
        assert_eq!(m.signals.len(), 2);
        let sum: f64 = m.signals.iter().map(|s| s.strength).sum();
        assert!((m.combined_strength - sum).abs() < 1e-9);
    }

    #[tokio::test]
    async fn downtrend_block_rejects_when_confident() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_klines()
            .returning(|_, _, _| Ok(oversold_candles()));

        let engine = SignalDetectionEngine::new(
            Arc::new(mock),
            Arc::new(FixedRegime(MarketRegime::Downtrend, 0.9)),
        );
        let settings = ScanSettings {
            minimum_combined_strength: 100.0,
            block_trading_in_downtrend: true,
            ..ScanSettings::default()
        };
        let prices = StdHashMap::new();
        let ctx = CycleContext {
            settings: &settings,
            prices: &prices,
            conviction_score: None,
        };

        let outcome = engine.scan(&[oversold_strategy()], &ctx).await;
        assert!(outcome.matches.is_empty());
    }

    #[tokio::test]
    async fn event_mode_rejects_pure_state_matches() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_klines()
            .returning(|_, _, _| Ok(oversold_candles()));

        let engine = SignalDetectionEngine::new(
            Arc::new(mock),
            Arc::new(FixedRegime(MarketRegime::Ranging, 0.8)),
        );
        let settings = ScanSettings {
            signal_matching_mode: SignalMatchingMode::Event,
            ..permissive_settings()
        };
        let prices = StdHashMap::new();
        let ctx = CycleContext {
            settings: &settings,
            prices: &prices,
            conviction_score: None,
        };

        // Both signals are state conditions; event mode requires at least one
        // transition signal
        let outcome = engine.scan(&[oversold_strategy()], &ctx).await;
        assert!(outcome.matches.is_empty());
    }

    #[tokio::test]
    async fn conviction_floor_rejects_low_scores() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_klines()
            .returning(|_, _, _| Ok(oversold_candles()));

        let engine = SignalDetectionEngine::new(
            Arc::new(mock),
            Arc::new(FixedRegime(MarketRegime::Ranging, 0.8)),
        );
        let settings = ScanSettings {
            minimum_conviction_score: Some(60.0),
            ..permissive_settings()
        };
        let prices = StdHashMap::new();
        let ctx = CycleContext {
            settings: &settings,
            prices: &prices,
            conviction_score: Some(40.0),
        };

        let outcome = engine.scan(&[oversold_strategy()], &ctx).await;
        assert!(outcome.matches.is_empty());
    }

    #[tokio::test]
    async fn warm_window_only_fetches_the_tail() {
        let mut mock = MockExchangeClient::new();
        let full = oversold_candles();
        let tail = full[full.len() - 2..].to_vec();
        let mut calls = 0u32;
        mock.expect_get_klines().returning(move |_, _, limit| {
            calls += 1;
            if calls == 1 {
                assert!(limit > 2);
                Ok(full.clone())
            } else {
                assert_eq!(limit, 2);
                Ok(tail.clone())
            }
        });

        let engine = SignalDetectionEngine::new(
            Arc::new(mock),
            Arc::new(FixedRegime(MarketRegime::Ranging, 0.8)),
        );
        let settings = permissive_settings();
        let prices = StdHashMap::new();
        let ctx = CycleContext {
            settings: &settings,
            prices: &prices,
            conviction_score: None,
        };
        let strategies = [oversold_strategy()];
        engine.scan(&strategies, &ctx).await;
        engine.scan(&strategies, &ctx).await;
    }
}
