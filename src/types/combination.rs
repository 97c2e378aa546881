use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{MarketRegime, SignalSpec, TimeFrame};

/// Canonical de-duplication key for a signal set on a timeframe:
/// `TF:{tf}|` followed by the sorted canonical signal fragments joined by
/// `+!`. Input signal order never changes the result.
pub fn combination_signature(signals: &[SignalSpec], timeframe: TimeFrame) -> String {
    let mut parts: Vec<String> = signals.iter().map(|s| s.canonical()).collect();
    parts.sort();
    format!("TF:{}|{}", timeframe.as_str(), parts.join("+!"))
}

/// Per-regime slice of a combination's backtest metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeStats {
    pub occurrences: u32,
    pub successful: u32,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub success_rate: f64,
    pub profit_factor: f64,
    pub avg_price_move: f64,
}

/// De-duplicated group of signal matches sharing a signature, with the
/// ranking metrics that decide admission into the live scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Combination {
    pub signature: String,
    pub combination_name: String,
    pub coin: String,
    pub timeframe: TimeFrame,
    pub signals: Vec<SignalSpec>,
    pub occurrences: u32,
    pub success_rate: f64,
    pub net_average_price_move: f64,
    pub profit_factor: f64,
    pub dominant_market_regime: MarketRegime,
    pub market_regime_distribution: HashMap<MarketRegime, RegimeStats>,
    pub median_lowest_low: f64,
    pub avg_win_duration_minutes: Option<f64>,
    pub combined_strength: f64,
}

impl Combination {
    /// Human-readable name derived from the signal set.
    pub fn derive_name(signals: &[SignalSpec], timeframe: TimeFrame) -> String {
        let mut parts: Vec<String> = signals
            .iter()
            .map(|s| format!("{} {}", s.kind, s.condition))
            .collect();
        parts.sort();
        format!("{} @ {}", parts.join(" + "), timeframe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SignalCondition, SignalKind};

    fn rsi_entry() -> SignalSpec {
        SignalSpec::new(SignalKind::Rsi, SignalCondition::OversoldEntry)
    }

    fn macd_cross() -> SignalSpec {
        SignalSpec::new(SignalKind::Macd, SignalCondition::BullishCross)
    }

    #[test]
    fn signature_is_order_independent() {
        let a = combination_signature(&[rsi_entry(), macd_cross()], TimeFrame::H1);
        let b = combination_signature(&[macd_cross(), rsi_entry()], TimeFrame::H1);
        assert_eq!(a, b);
        assert_eq!(a, "TF:1h|macd:bullish_cross+!rsi:oversold_entry");
    }

    #[test]
    fn signature_is_idempotent() {
        let signals = vec![rsi_entry(), macd_cross()];
        let first = combination_signature(&signals, TimeFrame::M15);
        let second = combination_signature(&signals, TimeFrame::M15);
        assert_eq!(first, second);
    }

    #[test]
    fn signature_distinguishes_timeframe() {
        let signals = vec![rsi_entry()];
        assert_ne!(
            combination_signature(&signals, TimeFrame::H1),
            combination_signature(&signals, TimeFrame::H4)
        );
    }
}
