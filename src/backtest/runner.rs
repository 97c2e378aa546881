use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangeClient;
use crate::indicators::IndicatorEngine;
use crate::regime::RegimeClassifier;
use crate::signals::{combined_strength, evaluate_all, net_direction};
use crate::types::{
    Candle, MarketRegime, SignalDirection, SignalMatch, SignalSpec, TimeFrame,
};

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub coins: Vec<String>,
    pub timeframe: TimeFrame,
    pub period_days: u32,
    pub enabled_signals: Vec<SignalSpec>,
    pub target_gain_pct: f64,
    pub future_window_minutes: u64,
    pub required_signals: usize,
    pub max_signals: usize,
    pub min_combined_strength: f64,
    pub regime_aware: bool,
    pub batch_size: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            coins: Vec::new(),
            timeframe: TimeFrame::H1,
            period_days: 30,
            enabled_signals: Vec::new(),
            target_gain_pct: 1.0,
            future_window_minutes: 240,
            required_signals: 2,
            max_signals: 5,
            min_combined_strength: 100.0,
            regime_aware: false,
            batch_size: 3,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.coins.is_empty() {
            return Err(EngineError::Config("no coins selected".to_string()));
        }
        if self.enabled_signals.is_empty() {
            return Err(EngineError::Config("no signals enabled".to_string()));
        }
        for spec in &self.enabled_signals {
            spec.validate().map_err(EngineError::Config)?;
        }
        if !(1..=10).contains(&self.required_signals) {
            return Err(EngineError::Config(
                "required_signals must be between 1 and 10".to_string(),
            ));
        }
        if self.max_signals < self.required_signals || self.max_signals > 10 {
            return Err(EngineError::Config(
                "max_signals must be between required_signals and 10".to_string(),
            ));
        }
        if self.future_window_minutes < self.timeframe.to_minutes() {
            return Err(EngineError::Config(format!(
                "future window of {}m is shorter than one {} candle",
                self.future_window_minutes, self.timeframe
            )));
        }
        if self.target_gain_pct <= 0.0 {
            return Err(EngineError::Config("target_gain_pct must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn future_window_candles(&self) -> usize {
        (self.future_window_minutes / self.timeframe.to_minutes()).max(1) as usize
    }

    fn period_candles(&self) -> u32 {
        let minutes = self.period_days as u64 * 24 * 60;
        (minutes / self.timeframe.to_minutes()).max(1) as u32
    }

    fn requirement_set(&self) -> Vec<(crate::types::SignalKind, crate::types::SignalParams)> {
        let mut seen = Vec::new();
        for spec in &self.enabled_signals {
            if !seen.iter().any(|(k, _)| *k == spec.kind) {
                seen.push((spec.kind, spec.params.clone()));
            }
        }
        seen
    }
}

#[derive(Debug, Clone)]
pub struct CoinFailure {
    pub coin: String,
    pub reason: String,
}

/// Sampled progress record; the channel keeps only the newest value so a slow
/// consumer never backs the runner up.
#[derive(Debug, Clone, Default)]
pub struct BacktestProgress {
    pub completed_coins: usize,
    pub total_coins: usize,
    pub current_coin: String,
}

#[derive(Debug, Default)]
pub struct BacktestRun {
    pub matches: Vec<SignalMatch>,
    pub signal_counts: HashMap<String, u32>,
    pub failed_coins: Vec<CoinFailure>,
}

struct CoinOutput {
    matches: Vec<SignalMatch>,
    signal_counts: HashMap<String, u32>,
}

/// Drives indicator computation and signal evaluation over historical
/// candles, coin by coin, emitting raw matches for aggregation.
pub struct BacktestRunner {
    exchange: Arc<dyn ExchangeClient>,
    regime: Arc<dyn RegimeClassifier>,
    progress: Option<watch::Sender<BacktestProgress>>,
}

impl BacktestRunner {
    pub fn new(exchange: Arc<dyn ExchangeClient>, regime: Arc<dyn RegimeClassifier>) -> Self {
        Self {
            exchange,
            regime,
            progress: None,
        }
    }

    /// Attach a progress channel; the caller keeps the receiver.
    pub fn with_progress(mut self) -> (Self, watch::Receiver<BacktestProgress>) {
        let (tx, rx) = watch::channel(BacktestProgress::default());
        self.progress = Some(tx);
        (self, rx)
    }

    pub async fn run(&self, config: &BacktestConfig) -> EngineResult<BacktestRun> {
        config.validate()?;
        info!(
            coins = config.coins.len(),
            timeframe = %config.timeframe,
            signals = config.enabled_signals.len(),
            "starting backtest run"
        );

        let mut run = BacktestRun::default();
        let mut completed = 0usize;

        // Coins run in parallel batches; each batch is a synchronization
        // point. Within a coin the pipeline is serial.
        for chunk in config.coins.chunks(config.batch_size) {
            let futures = chunk
                .iter()
                .map(|coin| self.run_coin(coin, config))
                .collect::<Vec<_>>();
            let results = join_all(futures).await;

            for (coin, result) in chunk.iter().zip(results) {
                completed += 1;
                match result {
                    Ok(output) => {
                        run.matches.extend(output.matches);
                        for (key, count) in output.signal_counts {
                            *run.signal_counts.entry(key).or_insert(0) += count;
                        }
                    }
                    Err(e) => {
                        warn!(coin = %coin, "coin failed during backtest: {}", e);
                        run.failed_coins.push(CoinFailure {
                            coin: coin.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
                if let Some(tx) = &self.progress {
                    let _ = tx.send(BacktestProgress {
                        completed_coins: completed,
                        total_coins: config.coins.len(),
                        current_coin: coin.clone(),
                    });
                }
            }
        }

        if run.failed_coins.len() == config.coins.len() {
            return Err(EngineError::Fatal(format!(
                "all {} coins failed during backtest",
                config.coins.len()
            )));
        }

        info!(
            matches = run.matches.len(),
            failed = run.failed_coins.len(),
            "backtest run complete"
        );
        Ok(run)
    }

    async fn run_coin(&self, coin: &str, config: &BacktestConfig) -> EngineResult<CoinOutput> {
        let required = config.requirement_set();
        let warmup = IndicatorEngine::max_warmup(&required);
        let future_window = config.future_window_candles();
        let limit = config.period_candles() + warmup as u32 + future_window as u32;

        let candles = self
            .exchange
            .get_klines(coin, config.timeframe, limit)
            .await?;

        if candles.len() <= warmup + 1 {
            return Err(EngineError::Consistency(format!(
                "{}: {} candles is below the {} bar warmup",
                coin,
                candles.len(),
                warmup
            )));
        }

        let series = IndicatorEngine::compute(&candles, &required);
        let mut matches = Vec::new();
        let mut signal_counts: HashMap<String, u32> = HashMap::new();

        for i in warmup..candles.len() {
            let mut matched = evaluate_all(&config.enabled_signals, &series, &candles, i);
            if matched.len() < config.required_signals {
                continue;
            }

            let snapshot = self.regime.classify(&candles, i);
            if config.regime_aware {
                matched.retain(|m| Self::admissible_in_regime(m.direction, snapshot.regime));
                if matched.len() < config.required_signals {
                    continue;
                }
            }

            // Strengths are positive, so the strongest admissible subset is
            // the top-k by strength with k capped at max_signals.
            matched.sort_by(|a, b| {
                b.strength
                    .partial_cmp(&a.strength)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.spec.canonical().cmp(&b.spec.canonical()))
            });
            matched.truncate(config.max_signals.min(matched.len()));
            let strength = combined_strength(&matched);
            if strength < config.min_combined_strength {
                continue;
            }

            let Some(forward) = Self::walk_forward(
                &candles,
                i,
                future_window,
                config.target_gain_pct,
                config.timeframe,
            ) else {
                continue;
            };

            for m in &matched {
                *signal_counts.entry(m.spec.canonical()).or_insert(0) += 1;
            }

            let direction = net_direction(&matched);
            matches.push(SignalMatch {
                coin: coin.to_string(),
                timeframe: config.timeframe,
                candle_time: candles[i].open_time,
                price: candles[i].close,
                combined_strength: strength,
                market_regime: snapshot.regime,
                direction,
                future_price_move: Some(forward.price_move_pct),
                future_max_drawdown: Some(forward.max_drawdown_pct),
                successful: Some(forward.price_move_pct >= config.target_gain_pct),
                time_to_peak_minutes: Some(forward.time_to_peak_minutes),
                win_duration_minutes: forward.win_duration_minutes,
                signals: matched,
            });
        }

        debug!(coin, matches = matches.len(), "coin pipeline complete");
        Ok(CoinOutput {
            matches,
            signal_counts,
        })
    }

    fn admissible_in_regime(direction: SignalDirection, regime: MarketRegime) -> bool {
        match (direction, regime) {
            (SignalDirection::Long, MarketRegime::Downtrend) => false,
            (SignalDirection::Short, MarketRegime::Uptrend) => false,
            _ => true,
        }
    }

    fn walk_forward(
        candles: &[Candle],
        i: usize,
        window: usize,
        target_gain_pct: f64,
        timeframe: TimeFrame,
    ) -> Option<ForwardMetrics> {
        let entry = candles[i].close_f64();
        if entry <= 0.0 || i + 1 >= candles.len() {
            return None;
        }
        let end = (i + window).min(candles.len() - 1);
        let bar_minutes = timeframe.to_minutes() as i64;

        let mut max_high = f64::MIN;
        let mut min_low = f64::MAX;
        let mut peak_offset = 1usize;
        let mut win_offset: Option<usize> = None;
        let target_price = entry * (1.0 + target_gain_pct / 100.0);

        for (offset, candle) in candles[i + 1..=end].iter().enumerate() {
            let high = candle.high_f64();
            let low = candle.low_f64();
            if high > max_high {
                max_high = high;
                peak_offset = offset + 1;
            }
            if low < min_low {
                min_low = low;
            }
            if win_offset.is_none() && high >= target_price {
                win_offset = Some(offset + 1);
            }
        }

        Some(ForwardMetrics {
            price_move_pct: (max_high - entry) / entry * 100.0,
            max_drawdown_pct: ((entry - min_low) / entry * 100.0).max(0.0),
            time_to_peak_minutes: peak_offset as i64 * bar_minutes,
            win_duration_minutes: win_offset.map(|o| o as i64 * bar_minutes),
        })
    }
}

struct ForwardMetrics {
    price_move_pct: f64,
    max_drawdown_pct: f64,
    time_to_peak_minutes: i64,
    win_duration_minutes: Option<i64>,
}
