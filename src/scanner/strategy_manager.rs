use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ScanSettings;
use crate::error::EngineResult;
use crate::storage::Store;
use crate::types::{OptedOutCombination, Strategy};

/// Per-rule rejection counters, reset on every load.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterCounters {
    pub opted_out: u32,
    pub invalid_spec: u32,
    pub empty_signals: u32,
    pub below_strength: u32,
    pub underperforming: u32,
    pub excluded_from_scanner: u32,
    pub accepted: u32,
}

/// Sort-ordering score. Real-trade metrics dominate once a strategy has
/// enough live history; fresh strategies lean on backtest metrics plus a
/// newcomer bonus.
pub fn profitability_score(strategy: &Strategy) -> f64 {
    let rt = strategy.real_trade_count;
    let r_pf = strategy.real_profit_factor;
    let r_sr = strategy.real_success_rate;
    let b_pf = strategy.combination.profit_factor;
    let b_sr = strategy.combination.success_rate;
    let cs = strategy.combination.combined_strength;

    if rt >= 10 {
        0.4 * r_pf + 0.003 * r_sr + 0.2 * b_pf + 0.001 * b_sr + 0.001 * cs
    } else if rt >= 5 {
        0.3 * r_pf + 0.002 * r_sr + 0.3 * b_pf + 0.002 * b_sr + 0.001 * cs
    } else {
        let newcomer = if rt == 0 { 0.5 } else { -0.2 };
        let strength_bonus = if rt == 0 && cs > 0.0 { cs / 1000.0 } else { 0.0 };
        0.4 * b_pf + 0.003 * b_sr + 0.002 * cs + newcomer + strength_bonus
    }
}

/// Loads, filters and ranks the strategies the scanner works with each
/// cycle.
pub struct StrategyManager {
    store: Arc<dyn Store>,
    active: RwLock<Vec<Strategy>>,
    counters: Mutex<FilterCounters>,
    average_signal_strength: Mutex<f64>,
    change_tx: broadcast::Sender<usize>,
}

impl StrategyManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            store,
            active: RwLock::new(Vec::new()),
            counters: Mutex::new(FilterCounters::default()),
            average_signal_strength: Mutex::new(0.0),
            change_tx,
        }
    }

    /// Rebuild the active list from the store: apply the rejection rules in
    /// order, score the survivors and sort them best-first.
    pub async fn load_active(&self, settings: &ScanSettings) -> EngineResult<Vec<Strategy>> {
        let all = self.store.list_strategies().await?;
        let opted_out = self.store.list_opted_out().await?;

        let mut counters = FilterCounters::default();
        let mut active: Vec<Strategy> = Vec::new();

        for mut strategy in all {
            if Self::is_opted_out(&strategy, &opted_out) {
                counters.opted_out += 1;
                continue;
            }
            if strategy.combination.signals.is_empty() {
                counters.empty_signals += 1;
                continue;
            }
            if let Err(reason) = strategy.validate() {
                warn!(strategy = %strategy.name(), "rejecting unloadable strategy: {}", reason);
                counters.invalid_spec += 1;
                continue;
            }
            if strategy.combination.combined_strength < settings.minimum_combined_strength {
                counters.below_strength += 1;
                continue;
            }
            if strategy.real_trade_count >= 5
                && (strategy.real_profit_factor < 0.8 || strategy.real_success_rate < 25.0)
            {
                counters.underperforming += 1;
                continue;
            }
            if !strategy.included_in_scanner {
                counters.excluded_from_scanner += 1;
                continue;
            }

            strategy.profitability_score = profitability_score(&strategy);
            counters.accepted += 1;
            active.push(strategy);
        }

        active.sort_by(|a, b| {
            b.profitability_score
                .partial_cmp(&a.profitability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        debug!(
            accepted = counters.accepted,
            opted_out = counters.opted_out,
            below_strength = counters.below_strength,
            underperforming = counters.underperforming,
            excluded = counters.excluded_from_scanner,
            "strategy filter pass complete"
        );

        *self.counters.lock().await = counters;
        *self.active.write().await = active.clone();
        Ok(active)
    }

    fn is_opted_out(strategy: &Strategy, registry: &[OptedOutCombination]) -> bool {
        if strategy.opted_out_globally || strategy.opted_out_for_coin {
            return true;
        }
        registry.iter().any(|entry| {
            entry.signature == strategy.signature()
                && entry
                    .coin
                    .as_deref()
                    .map_or(true, |coin| coin == strategy.coin())
        })
    }

    /// Reload and notify subscribers; also refreshes the average-strength
    /// stat over the new active set.
    pub async fn refresh(&self, settings: &ScanSettings) -> EngineResult<usize> {
        let active = self.load_active(settings).await?;
        let avg = if active.is_empty() {
            0.0
        } else {
            active
                .iter()
                .map(|s| s.combination.combined_strength)
                .sum::<f64>()
                / active.len() as f64
        };
        *self.average_signal_strength.lock().await = avg;
        let count = active.len();
        info!(count, avg_strength = avg, "strategies refreshed");
        let _ = self.change_tx.send(count);
        Ok(count)
    }

    pub async fn active(&self) -> Vec<Strategy> {
        self.active.read().await.clone()
    }

    pub async fn counters(&self) -> FilterCounters {
        *self.counters.lock().await
    }

    pub async fn average_signal_strength(&self) -> f64 {
        *self.average_signal_strength.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<usize> {
        self.change_tx.subscribe()
    }

    /// Recompute a strategy's real-trade statistics after a trade closes and
    /// persist the updated row.
    pub async fn record_trade_result(&self, strategy_id: &str) -> EngineResult<()> {
        let Some(mut strategy) = self.store.get_strategy(strategy_id).await? else {
            return Ok(());
        };
        let trades = self.store.list_trades_for_strategy(strategy_id).await?;
        if trades.is_empty() {
            return Ok(());
        }

        let wins = trades.iter().filter(|t| t.is_win()).count();
        let mut gross_profit = 0.0f64;
        let mut gross_loss = 0.0f64;
        for trade in &trades {
            let pnl: f64 = trade.pnl.try_into().unwrap_or(0.0);
            if pnl >= 0.0 {
                gross_profit += pnl;
            } else {
                gross_loss += -pnl;
            }
        }

        strategy.real_trade_count = trades.len() as u32;
        strategy.real_success_rate = wins as f64 / trades.len() as f64 * 100.0;
        strategy.real_profit_factor = if gross_loss == 0.0 {
            if gross_profit > 0.0 {
                crate::backtest::aggregator::PROFIT_FACTOR_CAP
            } else {
                1.0
            }
        } else {
            (gross_profit / gross_loss).min(crate::backtest::aggregator::PROFIT_FACTOR_CAP)
        };
        strategy.profitability_score = profitability_score(&strategy);
        self.store.update_strategy(&strategy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockStore;
    use crate::types::{
        combination_signature, Combination, MarketRegime, SignalCondition, SignalKind, SignalSpec,
        TimeFrame,
    };
    use chrono::Utc;
    use std::collections::HashMap;

    fn strategy(coin: &str, strength: f64) -> Strategy {
        let signals = vec![
            SignalSpec::new(SignalKind::Rsi, SignalCondition::OversoldEntry),
            SignalSpec::new(SignalKind::Macd, SignalCondition::BullishCross),
        ];
        Strategy::from_combination(Combination {
            signature: combination_signature(&signals, TimeFrame::H1) + coin,
            combination_name: "test".to_string(),
            coin: coin.to_string(),
            timeframe: TimeFrame::H1,
            signals,
            occurrences: 10,
            success_rate: 70.0,
            net_average_price_move: 1.2,
            profit_factor: 2.0,
            dominant_market_regime: MarketRegime::Uptrend,
            market_regime_distribution: HashMap::new(),
            median_lowest_low: 0.5,
            avg_win_duration_minutes: Some(90.0),
            combined_strength: strength,
        })
    }

    fn store_with(strategies: Vec<Strategy>, opted_out: Vec<OptedOutCombination>) -> MockStore {
        let mut store = MockStore::new();
        store
            .expect_list_strategies()
            .returning(move || Ok(strategies.clone()));
        store
            .expect_list_opted_out()
            .returning(move || Ok(opted_out.clone()));
        store
    }

    #[tokio::test]
    async fn filter_rules_applied_in_order_with_counters() {
        let opted = {
            let mut s = strategy("BTCUSDT", 200.0);
            s.opted_out_globally = true;
            s
        };
        let weak = strategy("ETHUSDT", 50.0);
        let underperformer = {
            let mut s = strategy("SOLUSDT", 200.0);
            s.real_trade_count = 6;
            s.real_profit_factor = 0.5;
            s.real_success_rate = 40.0;
            s
        };
        let excluded = {
            let mut s = strategy("BNBUSDT", 200.0);
            s.included_in_scanner = false;
            s
        };
        let good = strategy("XRPUSDT", 200.0);

        let manager = Arc::new(StrategyManager::new(Arc::new(store_with(
            vec![opted, weak, underperformer, excluded, good],
            Vec::new(),
        ))));

        let active = manager.load_active(&ScanSettings::default()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].coin(), "XRPUSDT");

        let counters = manager.counters().await;
        assert_eq!(counters.opted_out, 1);
        assert_eq!(counters.below_strength, 1);
        assert_eq!(counters.underperforming, 1);
        assert_eq!(counters.excluded_from_scanner, 1);
        assert_eq!(counters.accepted, 1);
    }

    #[tokio::test]
    async fn registry_opt_out_applies_globally_and_per_coin() {
        let a = strategy("BTCUSDT", 200.0);
        let b = strategy("ETHUSDT", 200.0);
        let registry = vec![
            OptedOutCombination {
                signature: a.signature().to_string(),
                coin: None,
                opted_out_at: Utc::now(),
            },
            OptedOutCombination {
                signature: b.signature().to_string(),
                coin: Some("SOLUSDT".to_string()),
                opted_out_at: Utc::now(),
            },
        ];
        let manager = StrategyManager::new(Arc::new(store_with(vec![a, b], registry)));
        let active = manager.load_active(&ScanSettings::default()).await.unwrap();
        // a is opted out everywhere; b's opt-out names another coin
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].coin(), "ETHUSDT");
    }

    #[test]
    fn score_tiers_follow_real_trade_count() {
        let fresh = strategy("BTCUSDT", 160.0);
        let fresh_score = profitability_score(&fresh);
        // Newcomer: 0.4*2.0 + 0.003*70 + 0.002*160 + 0.5 + 0.16
        assert!((fresh_score - (0.8 + 0.21 + 0.32 + 0.5 + 0.16)).abs() < 1e-9);

        let mut seasoned = strategy("BTCUSDT", 160.0);
        seasoned.real_trade_count = 12;
        seasoned.real_profit_factor = 3.0;
        seasoned.real_success_rate = 80.0;
        let seasoned_score = profitability_score(&seasoned);
        assert!(
            (seasoned_score - (0.4 * 3.0 + 0.003 * 80.0 + 0.2 * 2.0 + 0.001 * 70.0 + 0.001 * 160.0))
                .abs()
                < 1e-9
        );

        let mut mid = strategy("BTCUSDT", 160.0);
        mid.real_trade_count = 6;
        mid.real_profit_factor = 1.5;
        mid.real_success_rate = 50.0;
        let mid_score = profitability_score(&mid);
        assert!(
            (mid_score - (0.3 * 1.5 + 0.002 * 50.0 + 0.3 * 2.0 + 0.002 * 70.0 + 0.001 * 160.0))
                .abs()
                < 1e-9
        );
    }

    #[tokio::test]
    async fn active_list_sorted_by_score_descending() {
        let mut strong = strategy("BTCUSDT", 300.0);
        strong.combination.profit_factor = 5.0;
        let weak = strategy("ETHUSDT", 160.0);

        let manager = StrategyManager::new(Arc::new(store_with(vec![weak, strong], Vec::new())));
        let active = manager.load_active(&ScanSettings::default()).await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(active[0].profitability_score >= active[1].profitability_score);
        assert_eq!(active[0].coin(), "BTCUSDT");
    }
}
