use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::EngineResult;
use crate::storage::Store;
use crate::types::{
    combination_signature, Combination, MarketRegime, RegimeStats, SignalMatch, Strategy,
};

pub const PROFIT_FACTOR_CAP: f64 = 999.99;

#[derive(Debug, Clone)]
pub struct AggregationConfig {
    pub min_occurrences: u32,
    pub min_profit_factor: f64,
    pub min_average_price_move: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_occurrences: 3,
            min_profit_factor: 1.0,
            min_average_price_move: 0.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct AggregationOutcome {
    /// Surviving combinations that are the best at one or more trigger bars.
    pub combinations: Vec<Combination>,
    /// Raw matches that still have a surviving best combination.
    pub kept_matches: Vec<SignalMatch>,
}

/// Profit-factor rule shared by the group and per-regime computations:
/// a lossless group is capped at 999.99 when every occurrence hit target,
/// 100.0 when there was any profit at all, and 1.0 otherwise.
fn profit_factor(gross_profit: f64, gross_loss: f64, occurrences: u32, successful: u32) -> f64 {
    if gross_loss == 0.0 {
        if occurrences > 0 && successful == occurrences {
            PROFIT_FACTOR_CAP
        } else if gross_profit > 0.0 {
            100.0
        } else {
            1.0
        }
    } else {
        (gross_profit / gross_loss).min(PROFIT_FACTOR_CAP)
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Group raw matches into combinations, rank them, and keep only the
/// best-at-trigger pairs of (match, combination).
pub fn aggregate(matches: &[SignalMatch], config: &AggregationConfig) -> AggregationOutcome {
    let mut groups: HashMap<(String, String), Vec<&SignalMatch>> = HashMap::new();
    for m in matches {
        let signature = combination_signature(&m.specs(), m.timeframe);
        groups
            .entry((m.coin.clone(), signature))
            .or_default()
            .push(m);
    }

    let mut survivors: Vec<Combination> = Vec::new();
    for ((coin, signature), group) in groups {
        let combination = build_combination(coin, signature, &group);
        if combination.occurrences < config.min_occurrences
            || combination.profit_factor < config.min_profit_factor
            || combination.net_average_price_move < config.min_average_price_move
        {
            continue;
        }
        survivors.push(combination);
    }

    // Best-at-trigger: each raw match keeps the highest-profit-factor
    // surviving combination whose signal set it contains; matches with no
    // surviving combination are dropped.
    let mut kept_matches: Vec<SignalMatch> = Vec::new();
    let mut chosen_signatures: Vec<String> = Vec::new();
    for m in matches {
        let specs = m.specs();
        let best = survivors
            .iter()
            .filter(|c| {
                c.coin == m.coin
                    && c.timeframe == m.timeframe
                    && c.signals.iter().all(|s| specs.contains(s))
            })
            .max_by(|a, b| {
                a.profit_factor
                    .partial_cmp(&b.profit_factor)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.signature.cmp(&a.signature))
            });
        if let Some(best) = best {
            if !chosen_signatures.contains(&best.signature) {
                chosen_signatures.push(best.signature.clone());
            }
            kept_matches.push(m.clone());
        }
    }

    let mut combinations: Vec<Combination> = survivors
        .into_iter()
        .filter(|c| chosen_signatures.contains(&c.signature))
        .collect();
    combinations.sort_by(|a, b| {
        b.profit_factor
            .partial_cmp(&a.profit_factor)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.signature.cmp(&b.signature))
    });

    debug!(
        combinations = combinations.len(),
        kept = kept_matches.len(),
        dropped = matches.len() - kept_matches.len(),
        "aggregation complete"
    );

    AggregationOutcome {
        combinations,
        kept_matches,
    }
}

fn build_combination(coin: String, signature: String, group: &[&SignalMatch]) -> Combination {
    let occurrences = group.len() as u32;
    let successful = group
        .iter()
        .filter(|m| m.successful == Some(true))
        .count() as u32;

    let mut gross_profit = 0.0;
    let mut gross_loss = 0.0;
    let mut move_sum = 0.0;
    let mut strength_sum = 0.0;
    let mut drawdowns: Vec<f64> = Vec::new();
    let mut win_durations: Vec<f64> = Vec::new();
    let mut regime_groups: HashMap<MarketRegime, Vec<&SignalMatch>> = HashMap::new();

    for m in group {
        let price_move = m.future_price_move.unwrap_or(0.0);
        move_sum += price_move;
        if price_move >= 0.0 {
            gross_profit += price_move;
        } else {
            gross_loss += -price_move;
        }
        strength_sum += m.combined_strength;
        if let Some(dd) = m.future_max_drawdown {
            drawdowns.push(dd);
        }
        if m.successful == Some(true) {
            if let Some(d) = m.win_duration_minutes {
                win_durations.push(d as f64);
            }
        }
        regime_groups.entry(m.market_regime).or_default().push(m);
    }

    let mut market_regime_distribution = HashMap::new();
    let mut dominant = (MarketRegime::Unknown, 0u32);
    for (regime, members) in &regime_groups {
        let occ = members.len() as u32;
        let succ = members
            .iter()
            .filter(|m| m.successful == Some(true))
            .count() as u32;
        let mut gp = 0.0;
        let mut gl = 0.0;
        let mut moves = 0.0;
        for m in members {
            let pm = m.future_price_move.unwrap_or(0.0);
            moves += pm;
            if pm >= 0.0 {
                gp += pm;
            } else {
                gl += -pm;
            }
        }
        market_regime_distribution.insert(
            *regime,
            RegimeStats {
                occurrences: occ,
                successful: succ,
                gross_profit: gp,
                gross_loss: gl,
                success_rate: if occ > 0 {
                    succ as f64 / occ as f64 * 100.0
                } else {
                    0.0
                },
                profit_factor: profit_factor(gp, gl, occ, succ),
                avg_price_move: if occ > 0 { moves / occ as f64 } else { 0.0 },
            },
        );
        if occ > dominant.1 {
            dominant = (*regime, occ);
        }
    }

    let first = group[0];
    Combination {
        signature,
        combination_name: Combination::derive_name(&first.specs(), first.timeframe),
        coin,
        timeframe: first.timeframe,
        signals: {
            let mut specs = first.specs();
            specs.sort_by(|a, b| a.canonical().cmp(&b.canonical()));
            specs
        },
        occurrences,
        success_rate: if occurrences > 0 {
            successful as f64 / occurrences as f64 * 100.0
        } else {
            0.0
        },
        net_average_price_move: if occurrences > 0 {
            move_sum / occurrences as f64
        } else {
            0.0
        },
        profit_factor: profit_factor(gross_profit, gross_loss, occurrences, successful),
        dominant_market_regime: dominant.0,
        market_regime_distribution,
        median_lowest_low: median(&mut drawdowns),
        avg_win_duration_minutes: if win_durations.is_empty() {
            None
        } else {
            Some(win_durations.iter().sum::<f64>() / win_durations.len() as f64)
        },
        combined_strength: if occurrences > 0 {
            strength_sum / occurrences as f64
        } else {
            0.0
        },
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionReport {
    pub created: u32,
    pub duplicates: u32,
}

/// Persist the chosen combinations as scanner strategies. Signature
/// uniqueness is enforced by filtering before insert; existing signatures
/// only bump the duplicate counter.
pub async fn admit_to_scanner(
    store: &dyn Store,
    combinations: &[Combination],
) -> EngineResult<AdmissionReport> {
    let mut report = AdmissionReport::default();
    for combination in combinations {
        if store
            .strategy_signature_exists(&combination.signature)
            .await?
        {
            report.duplicates += 1;
            continue;
        }
        let strategy = Strategy::from_combination(combination.clone());
        store.create_strategy(&strategy).await?;
        report.created += 1;
    }
    info!(
        created = report.created,
        duplicates = report.duplicates,
        "admitted combinations to scanner"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockStore;
    use crate::types::{
        MatchedSignal, SignalCondition, SignalDirection, SignalKind, SignalSpec, TimeFrame,
    };
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn rsi_entry() -> SignalSpec {
        SignalSpec::new(SignalKind::Rsi, SignalCondition::OversoldEntry)
    }

    fn macd_cross() -> SignalSpec {
        SignalSpec::new(SignalKind::Macd, SignalCondition::BullishCross)
    }

    fn volume_spike() -> SignalSpec {
        SignalSpec::new(SignalKind::Volume, SignalCondition::SpikeAbove)
    }

    fn match_with(
        specs: Vec<SignalSpec>,
        offset_hours: i64,
        price_move: f64,
        successful: bool,
    ) -> SignalMatch {
        let signals: Vec<MatchedSignal> = specs
            .into_iter()
            .map(|spec| MatchedSignal {
                spec,
                strength: 60.0,
                direction: SignalDirection::Long,
                is_event: true,
            })
            .collect();
        let combined = signals.iter().map(|s| s.strength).sum();
        SignalMatch {
            coin: "BTCUSDT".to_string(),
            timeframe: TimeFrame::H1,
            candle_time: Utc::now() + Duration::hours(offset_hours),
            price: dec!(50000),
            signals,
            combined_strength: combined,
            market_regime: MarketRegime::Uptrend,
            direction: SignalDirection::Long,
            future_price_move: Some(price_move),
            future_max_drawdown: Some(0.3),
            successful: Some(successful),
            time_to_peak_minutes: Some(120),
            win_duration_minutes: if successful { Some(60) } else { None },
        }
    }

    #[test]
    fn all_winners_hit_profit_factor_cap() {
        // Three triggers, all reaching +1% inside the window, zero losses
        let specs = vec![rsi_entry(), macd_cross()];
        let matches = vec![
            match_with(specs.clone(), 0, 1.2, true),
            match_with(specs.clone(), 5, 1.5, true),
            match_with(specs.clone(), 9, 1.1, true),
        ];
        let outcome = aggregate(&matches, &AggregationConfig::default());
        assert_eq!(outcome.combinations.len(), 1);
        let combo = &outcome.combinations[0];
        assert_eq!(combo.occurrences, 3);
        assert!((combo.success_rate - 100.0).abs() < 1e-9);
        assert_eq!(combo.profit_factor, PROFIT_FACTOR_CAP);
        assert_eq!(outcome.kept_matches.len(), 3);
    }

    #[test]
    fn lossless_with_failures_gets_pf_100() {
        // Positive moves that fall short of target: no gross loss, not all
        // successful
        let specs = vec![rsi_entry(), macd_cross()];
        let matches = vec![
            match_with(specs.clone(), 0, 0.5, false),
            match_with(specs.clone(), 3, 1.2, true),
            match_with(specs.clone(), 7, 0.4, false),
        ];
        let outcome = aggregate(&matches, &AggregationConfig::default());
        assert_eq!(outcome.combinations[0].profit_factor, 100.0);
    }

    #[test]
    fn profit_factor_is_capped_ratio_with_losses() {
        let specs = vec![rsi_entry(), macd_cross()];
        let matches = vec![
            match_with(specs.clone(), 0, 2.0, true),
            match_with(specs.clone(), 3, 2.0, true),
            match_with(specs.clone(), 7, -1.0, false),
        ];
        let outcome = aggregate(&matches, &AggregationConfig::default());
        let combo = &outcome.combinations[0];
        assert!((combo.profit_factor - 4.0).abs() < 1e-9);
        assert!((combo.net_average_price_move - 1.0).abs() < 1e-9);
    }

    #[test]
    fn best_at_trigger_prefers_higher_profit_factor_superset() {
        // Combination A (2 signals) occurs alone early; at later bars the
        // 3-signal superset B fires with a better profit factor. Matches
        // containing B's signals must be attributed to B, not A.
        let a = vec![rsi_entry(), macd_cross()];
        let b = vec![rsi_entry(), macd_cross(), volume_spike()];

        let mut matches = vec![
            match_with(a.clone(), 0, 1.2, true),
            match_with(a.clone(), 2, -0.8, false),
            match_with(a.clone(), 4, 1.1, true),
        ];
        let b_matches = vec![
            match_with(b.clone(), 10, 2.0, true),
            match_with(b.clone(), 12, 2.2, true),
            match_with(b.clone(), 14, 2.1, true),
        ];
        matches.extend(b_matches);

        let outcome = aggregate(&matches, &AggregationConfig::default());
        assert_eq!(outcome.combinations.len(), 2);

        // B has PF cap, A has a finite PF; B ranks first
        assert_eq!(outcome.combinations[0].signals.len(), 3);
        assert!(outcome.combinations[0].profit_factor > outcome.combinations[1].profit_factor);

        // Every match survives: A-bars keep A, B-bars keep B (the superset)
        assert_eq!(outcome.kept_matches.len(), 6);
    }

    #[test]
    fn below_threshold_combinations_are_discarded() {
        let specs = vec![rsi_entry(), macd_cross()];
        let matches = vec![
            match_with(specs.clone(), 0, 1.2, true),
            match_with(specs.clone(), 3, 1.0, true),
        ];
        // min_occurrences 3 filters the pair out; their matches drop too
        let outcome = aggregate(&matches, &AggregationConfig::default());
        assert!(outcome.combinations.is_empty());
        assert!(outcome.kept_matches.is_empty());
    }

    #[test]
    fn aggregate_is_deterministic() {
        let a = vec![rsi_entry(), macd_cross()];
        let b = vec![rsi_entry(), volume_spike()];
        let matches = vec![
            match_with(a.clone(), 0, 1.2, true),
            match_with(b.clone(), 1, 0.8, false),
            match_with(a.clone(), 2, -0.4, false),
            match_with(b.clone(), 3, 1.6, true),
            match_with(a.clone(), 4, 1.9, true),
            match_with(b.clone(), 5, 1.1, true),
        ];
        let config = AggregationConfig {
            min_occurrences: 2,
            ..AggregationConfig::default()
        };
        let first = aggregate(&matches, &config);
        let second = aggregate(&matches, &config);

        assert_eq!(first.combinations.len(), second.combinations.len());
        for (x, y) in first.combinations.iter().zip(second.combinations.iter()) {
            assert_eq!(x.signature, y.signature);
            assert!((x.profit_factor - y.profit_factor).abs() < 1e-9);
            assert!((x.net_average_price_move - y.net_average_price_move).abs() < 1e-9);
            assert!((x.success_rate - y.success_rate).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn duplicate_signature_save_is_a_noop() {
        let specs = vec![rsi_entry(), macd_cross()];
        let matches = vec![
            match_with(specs.clone(), 0, 1.2, true),
            match_with(specs.clone(), 3, 1.4, true),
            match_with(specs.clone(), 6, 1.3, true),
        ];
        let outcome = aggregate(&matches, &AggregationConfig::default());

        let mut store = MockStore::new();
        // First combination is new, the re-save sees it existing
        let mut exists = false;
        store
            .expect_strategy_signature_exists()
            .returning(move |_| {
                let was = exists;
                exists = true;
                Ok(was)
            });
        store
            .expect_create_strategy()
            .times(1)
            .returning(|s| Ok(s.id.clone()));

        let first = admit_to_scanner(&store, &outcome.combinations).await.unwrap();
        assert_eq!(first, AdmissionReport { created: 1, duplicates: 0 });

        let second = admit_to_scanner(&store, &outcome.combinations).await.unwrap();
        assert_eq!(second, AdmissionReport { created: 0, duplicates: 1 });
    }
}
