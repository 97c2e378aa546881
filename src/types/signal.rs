use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{MarketRegime, SignalDirection, TimeFrame};

/// Closed set of indicator kinds the engine understands. Persisted strategy
/// rows referencing anything else are rejected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Rsi,
    Macd,
    Bollinger,
    Ema,
    Ma200,
    Stochastic,
    Atr,
    Adx,
    Volume,
    Obv,
    Mfi,
    Cmf,
    Cci,
    Roc,
    WilliamsR,
    Bbw,
    Donchian,
    Psar,
    CdlEngulfing,
    CdlHammer,
    CdlDoji,
    CdlMorningStar,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Rsi => "rsi",
            SignalKind::Macd => "macd",
            SignalKind::Bollinger => "bollinger",
            SignalKind::Ema => "ema",
            SignalKind::Ma200 => "ma200",
            SignalKind::Stochastic => "stochastic",
            SignalKind::Atr => "atr",
            SignalKind::Adx => "adx",
            SignalKind::Volume => "volume",
            SignalKind::Obv => "obv",
            SignalKind::Mfi => "mfi",
            SignalKind::Cmf => "cmf",
            SignalKind::Cci => "cci",
            SignalKind::Roc => "roc",
            SignalKind::WilliamsR => "williams_r",
            SignalKind::Bbw => "bbw",
            SignalKind::Donchian => "donchian",
            SignalKind::Psar => "psar",
            SignalKind::CdlEngulfing => "cdl_engulfing",
            SignalKind::CdlHammer => "cdl_hammer",
            SignalKind::CdlDoji => "cdl_doji",
            SignalKind::CdlMorningStar => "cdl_morning_star",
        }
    }

    pub fn is_candlestick_pattern(&self) -> bool {
        matches!(
            self,
            SignalKind::CdlEngulfing
                | SignalKind::CdlHammer
                | SignalKind::CdlDoji
                | SignalKind::CdlMorningStar
        )
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named condition an indicator kind exposes. Conditions split into two
/// classes: event conditions fire on a bar-to-bar transition, state
/// conditions hold over a single bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCondition {
    // State conditions
    Oversold,
    Overbought,
    PriceBelowLower,
    PriceAboveUpper,
    PriceAbove,
    PriceBelow,
    StrongTrend,
    WeakTrend,
    SpikeAbove,
    TrendUp,
    TrendDown,
    Positive,
    Negative,
    Expanding,
    Tight,
    // Event conditions
    OversoldEntry,
    OversoldExit,
    OverboughtEntry,
    BullishCross,
    BearishCross,
    CrossAboveMiddle,
    CrossAbove,
    ZeroCrossUp,
    SqueezeFire,
    BreakoutUp,
    BreakoutDown,
    FlipBullish,
    FlipBearish,
    Bullish,
    Bearish,
}

impl SignalCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalCondition::Oversold => "oversold",
            SignalCondition::Overbought => "overbought",
            SignalCondition::PriceBelowLower => "price_below_lower",
            SignalCondition::PriceAboveUpper => "price_above_upper",
            SignalCondition::PriceAbove => "price_above",
            SignalCondition::PriceBelow => "price_below",
            SignalCondition::StrongTrend => "strong_trend",
            SignalCondition::WeakTrend => "weak_trend",
            SignalCondition::SpikeAbove => "spike_above",
            SignalCondition::TrendUp => "trend_up",
            SignalCondition::TrendDown => "trend_down",
            SignalCondition::Positive => "positive",
            SignalCondition::Negative => "negative",
            SignalCondition::Expanding => "expanding",
            SignalCondition::Tight => "tight",
            SignalCondition::OversoldEntry => "oversold_entry",
            SignalCondition::OversoldExit => "oversold_exit",
            SignalCondition::OverboughtEntry => "overbought_entry",
            SignalCondition::BullishCross => "bullish_cross",
            SignalCondition::BearishCross => "bearish_cross",
            SignalCondition::CrossAboveMiddle => "cross_above_middle",
            SignalCondition::CrossAbove => "cross_above",
            SignalCondition::ZeroCrossUp => "zero_cross_up",
            SignalCondition::SqueezeFire => "squeeze_fire",
            SignalCondition::BreakoutUp => "breakout_up",
            SignalCondition::BreakoutDown => "breakout_down",
            SignalCondition::FlipBullish => "flip_bullish",
            SignalCondition::FlipBearish => "flip_bearish",
            SignalCondition::Bullish => "bullish",
            SignalCondition::Bearish => "bearish",
        }
    }

    /// Event conditions require the previous bar; state conditions only the
    /// current one.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            SignalCondition::OversoldEntry
                | SignalCondition::OversoldExit
                | SignalCondition::OverboughtEntry
                | SignalCondition::BullishCross
                | SignalCondition::BearishCross
                | SignalCondition::CrossAboveMiddle
                | SignalCondition::CrossAbove
                | SignalCondition::ZeroCrossUp
                | SignalCondition::SqueezeFire
                | SignalCondition::BreakoutUp
                | SignalCondition::BreakoutDown
                | SignalCondition::FlipBullish
                | SignalCondition::FlipBearish
                | SignalCondition::Bullish
                | SignalCondition::Bearish
        )
    }
}

impl fmt::Display for SignalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Threshold/period overrides for one signal spec. Unset fields fall back to
/// the indicator defaults. Canonicalization emits only the set fields, sorted
/// by key, so equal specs always produce equal signatures.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast_period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oversold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overbought: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
}

impl SignalParams {
    pub fn is_empty(&self) -> bool {
        self.period.is_none()
            && self.fast_period.is_none()
            && self.slow_period.is_none()
            && self.signal_period.is_none()
            && self.std_dev.is_none()
            && self.oversold.is_none()
            && self.overbought.is_none()
            && self.threshold.is_none()
            && self.multiplier.is_none()
    }

    /// `k=v` fragments for every set field, sorted by key.
    pub fn canonical_fragments(&self) -> Vec<String> {
        let mut parts: Vec<String> = Vec::new();
        if let Some(v) = self.fast_period {
            parts.push(format!("fast_period={}", v));
        }
        if let Some(v) = self.multiplier {
            parts.push(format!("multiplier={}", v));
        }
        if let Some(v) = self.overbought {
            parts.push(format!("overbought={}", v));
        }
        if let Some(v) = self.oversold {
            parts.push(format!("oversold={}", v));
        }
        if let Some(v) = self.period {
            parts.push(format!("period={}", v));
        }
        if let Some(v) = self.signal_period {
            parts.push(format!("signal_period={}", v));
        }
        if let Some(v) = self.slow_period {
            parts.push(format!("slow_period={}", v));
        }
        if let Some(v) = self.std_dev {
            parts.push(format!("std_dev={}", v));
        }
        if let Some(v) = self.threshold {
            parts.push(format!("threshold={}", v));
        }
        parts.sort();
        parts
    }
}

/// One (indicator, condition) selector with optional parameter overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(rename = "value")]
    pub condition: SignalCondition,
    #[serde(rename = "parameters", default, skip_serializing_if = "SignalParams::is_empty")]
    pub params: SignalParams,
}

impl SignalSpec {
    pub fn new(kind: SignalKind, condition: SignalCondition) -> Self {
        Self {
            kind,
            condition,
            params: SignalParams::default(),
        }
    }

    /// Canonical text form used inside combination signatures:
    /// `{type}:{value}[{k=v,...}]`, params omitted when empty.
    pub fn canonical(&self) -> String {
        let fragments = self.params.canonical_fragments();
        if fragments.is_empty() {
            format!("{}:{}", self.kind.as_str(), self.condition.as_str())
        } else {
            format!(
                "{}:{}[{}]",
                self.kind.as_str(),
                self.condition.as_str(),
                fragments.join(",")
            )
        }
    }

    /// A condition only makes sense for certain kinds; reject mismatches at
    /// strategy load.
    pub fn validate(&self) -> Result<(), String> {
        use SignalCondition::*;
        use SignalKind::*;
        let ok = match self.kind {
            Rsi => matches!(
                self.condition,
                Oversold | Overbought | OversoldEntry | OversoldExit | OverboughtEntry
            ),
            Macd => matches!(self.condition, BullishCross | BearishCross | Positive | Negative),
            Bollinger => matches!(
                self.condition,
                PriceBelowLower | PriceAboveUpper | CrossAboveMiddle
            ),
            Ema | Ma200 => matches!(self.condition, PriceAbove | PriceBelow | CrossAbove),
            Stochastic => matches!(self.condition, Oversold | Overbought | BullishCross | BearishCross),
            Atr => matches!(self.condition, Expanding),
            Adx => matches!(self.condition, StrongTrend | WeakTrend),
            Volume => matches!(self.condition, SpikeAbove),
            Obv => matches!(self.condition, TrendUp | TrendDown),
            Mfi => matches!(self.condition, Oversold | Overbought),
            Cmf => matches!(self.condition, Positive | Negative),
            Cci => matches!(self.condition, Oversold | Overbought | ZeroCrossUp),
            Roc => matches!(self.condition, Positive | Negative | ZeroCrossUp),
            WilliamsR => matches!(self.condition, Oversold | Overbought),
            Bbw => matches!(self.condition, SqueezeFire | Tight),
            Donchian => matches!(self.condition, BreakoutUp | BreakoutDown),
            Psar => matches!(self.condition, FlipBullish | FlipBearish | PriceAbove | PriceBelow),
            CdlEngulfing | CdlHammer | CdlDoji | CdlMorningStar => {
                matches!(self.condition, Bullish | Bearish)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "condition '{}' is not valid for indicator '{}'",
                self.condition, self.kind
            ))
        }
    }
}

/// A spec that matched at a bar, with its calibrated strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedSignal {
    #[serde(flatten)]
    pub spec: SignalSpec,
    pub strength: f64,
    pub direction: SignalDirection,
    pub is_event: bool,
}

/// Bar-level detection record, produced by the backtest runner per trigger
/// bar and by the live detection engine per scan cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMatch {
    pub coin: String,
    pub timeframe: TimeFrame,
    pub candle_time: DateTime<Utc>,
    pub price: Decimal,
    pub signals: Vec<MatchedSignal>,
    pub combined_strength: f64,
    pub market_regime: MarketRegime,
    pub direction: SignalDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub future_price_move: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub future_max_drawdown: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_peak_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_duration_minutes: Option<i64>,
}

impl SignalMatch {
    pub fn specs(&self) -> Vec<SignalSpec> {
        self.signals.iter().map(|m| m.spec.clone()).collect()
    }

    pub fn contains_spec(&self, spec: &SignalSpec) -> bool {
        self.signals.iter().any(|m| m.spec == *spec)
    }

    pub fn has_event_signal(&self) -> bool {
        self.signals.iter().any(|m| m.is_event)
    }

    pub fn all_state_signals(&self) -> bool {
        self.signals.iter().all(|m| !m.is_event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_omits_empty_params() {
        let spec = SignalSpec::new(SignalKind::Rsi, SignalCondition::OversoldEntry);
        assert_eq!(spec.canonical(), "rsi:oversold_entry");
    }

    #[test]
    fn canonical_sorts_params_by_key() {
        let spec = SignalSpec {
            kind: SignalKind::Rsi,
            condition: SignalCondition::Oversold,
            params: SignalParams {
                period: Some(14),
                oversold: Some(25.0),
                ..Default::default()
            },
        };
        assert_eq!(spec.canonical(), "rsi:oversold[oversold=25,period=14]");
    }

    #[test]
    fn condition_kind_mismatch_rejected() {
        let spec = SignalSpec::new(SignalKind::Volume, SignalCondition::BullishCross);
        assert!(spec.validate().is_err());
        let spec = SignalSpec::new(SignalKind::Macd, SignalCondition::BullishCross);
        assert!(spec.validate().is_ok());
    }
}
