use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Combination, SignalDirection};

/// A persisted combination promoted into the live scanner, with the control
/// fields that govern entry, sizing and exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    #[serde(flatten)]
    pub combination: Combination,
    pub included_in_scanner: bool,
    pub opted_out_globally: bool,
    pub opted_out_for_coin: bool,
    pub required_signals: usize,
    pub risk_percentage: f64,
    pub stop_loss_atr_multiplier: f64,
    pub take_profit_atr_multiplier: f64,
    pub enable_trailing_take_profit: bool,
    pub trailing_stop_percentage: f64,
    pub estimated_exit_time_minutes: i64,
    pub strategy_direction: SignalDirection,
    pub min_core_signal_strength: f64,
    pub real_trade_count: u32,
    pub real_profit_factor: f64,
    pub real_success_rate: f64,
    pub profitability_score: f64,
}

impl Strategy {
    /// Promote an aggregated combination with default trade controls. All
    /// of the combination's signals are required to fire.
    pub fn from_combination(combination: Combination) -> Self {
        let required_signals = combination.signals.len();
        Self {
            id: Uuid::new_v4().to_string(),
            combination,
            included_in_scanner: true,
            opted_out_globally: false,
            opted_out_for_coin: false,
            required_signals,
            risk_percentage: 1.0,
            stop_loss_atr_multiplier: 1.5,
            take_profit_atr_multiplier: 3.0,
            enable_trailing_take_profit: false,
            trailing_stop_percentage: 1.0,
            estimated_exit_time_minutes: 240,
            strategy_direction: SignalDirection::Long,
            min_core_signal_strength: 0.0,
            real_trade_count: 0,
            real_profit_factor: 0.0,
            real_success_rate: 0.0,
            profitability_score: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.combination.combination_name
    }

    pub fn coin(&self) -> &str {
        &self.combination.coin
    }

    pub fn signature(&self) -> &str {
        &self.combination.signature
    }

    /// Validate the persisted row; an unparseable signal spec makes the
    /// whole strategy unloadable.
    pub fn validate(&self) -> Result<(), String> {
        if self.combination.coin.is_empty() {
            return Err("strategy has no coin".to_string());
        }
        for spec in &self.combination.signals {
            spec.validate()?;
        }
        if self.required_signals > self.combination.signals.len().max(1) {
            return Err(format!(
                "required_signals {} exceeds signal count {}",
                self.required_signals,
                self.combination.signals.len()
            ));
        }
        Ok(())
    }
}
