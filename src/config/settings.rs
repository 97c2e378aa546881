use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalMatchingMode {
    /// At least one event signal must be in the matched set.
    Event,
    /// All matched signals must be state signals.
    State,
    /// No extra constraint beyond the strength threshold.
    Both,
    /// Conviction-weighted strength must clear the threshold.
    ConvictionBased,
}

/// Runtime scanner configuration, persisted as a single row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    pub scan_frequency_ms: u64,
    pub minimum_combined_strength: f64,
    pub max_positions: usize,
    pub risk_per_trade: f64,
    pub portfolio_heat_max: f64,
    pub default_position_size: Decimal,
    pub use_win_strategy_size: bool,
    pub minimum_regime_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_conviction_score: Option<f64>,
    pub signal_matching_mode: SignalMatchingMode,
    pub block_trading_in_downtrend: bool,
    pub reset_stats_on_mode_switch: bool,
}

pub const MIN_SCAN_FREQUENCY_MS: u64 = 100;
pub const MAX_SCAN_FREQUENCY_MS: u64 = 5 * 60 * 1000;

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            scan_frequency_ms: 30_000,
            minimum_combined_strength: 150.0,
            max_positions: 5,
            risk_per_trade: 1.0,
            portfolio_heat_max: 20.0,
            default_position_size: dec!(100),
            use_win_strategy_size: true,
            minimum_regime_confidence: 0.4,
            minimum_conviction_score: None,
            signal_matching_mode: SignalMatchingMode::Both,
            block_trading_in_downtrend: true,
            reset_stats_on_mode_switch: false,
        }
    }
}

impl ScanSettings {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.scan_frequency_ms < MIN_SCAN_FREQUENCY_MS
            || self.scan_frequency_ms > MAX_SCAN_FREQUENCY_MS
        {
            errors.push(format!(
                "scan_frequency_ms must be between {} and {}",
                MIN_SCAN_FREQUENCY_MS, MAX_SCAN_FREQUENCY_MS
            ));
        }
        if self.max_positions == 0 {
            errors.push("max_positions must be > 0".to_string());
        }
        if self.risk_per_trade <= 0.0 || self.risk_per_trade > 10.0 {
            errors.push("risk_per_trade must be between 0 and 10%".to_string());
        }
        if self.minimum_combined_strength < 0.0 {
            errors.push("minimum_combined_strength must be >= 0".to_string());
        }
        if self.default_position_size <= Decimal::ZERO {
            errors.push("default_position_size must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.minimum_regime_confidence) {
            errors.push("minimum_regime_confidence must be between 0 and 1".to_string());
        }
        if let Some(score) = self.minimum_conviction_score {
            if !(0.0..=100.0).contains(&score) {
                errors.push("minimum_conviction_score must be between 0 and 100".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Static process configuration: API credentials, persistence path, mode.
/// Layered from `config.toml` and environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub database_path: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_mode")]
    pub trading_mode: String,
    #[serde(default)]
    pub scanner: Option<ScanSettings>,
}

fn default_db_path() -> String {
    "sqlite:./signal_scanner.db".to_string()
}

fn default_mode() -> String {
    "testnet".to_string()
}

impl AppConfig {
    /// Layer config.toml (optional) under SCANNER_-prefixed environment
    /// variables. `.env` is read first so keys stay out of the config file.
    pub fn load(path: &str) -> Result<Self, crate::error::EngineError> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("SCANNER"));

        let cfg = builder
            .build()
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))?;

        cfg.try_deserialize()
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(ScanSettings::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_positions_and_bad_frequency() {
        let settings = ScanSettings {
            max_positions: 0,
            scan_frequency_ms: 10,
            ..ScanSettings::default()
        };
        let errors = settings.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
