use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MarketRegime, SignalDirection, SignalSpec, TradingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Pending,
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TimeExit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TimeExit => "time_exit",
            ExitReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tracked position from order fill to closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePosition {
    pub position_id: String,
    pub strategy_id: String,
    pub strategy_name: String,
    pub coin: String,
    pub direction: SignalDirection,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub quantity: Decimal,
    pub entry_value: Decimal,
    pub entry_time: DateTime<Utc>,
    pub status: PositionStatus,
    pub atr_at_entry: f64,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    pub max_price_seen: Decimal,
    /// Exit controls copied from the owning strategy at entry.
    pub enable_trailing_take_profit: bool,
    pub trailing_stop_percentage: f64,
    pub estimated_exit_time_minutes: i64,
    pub wallet_id: String,
    pub trading_mode: TradingMode,
    pub exchange_order_id: String,
    pub conviction_score: f64,
    pub market_regime: MarketRegime,
    pub trigger_signals: Vec<SignalSpec>,
    pub last_price_update: DateTime<Utc>,
}

impl LivePosition {
    pub fn update_price(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.current_price = price;
        if price > self.max_price_seen {
            self.max_price_seen = price;
        }
        self.last_price_update = now;
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        let diff = self.current_price - self.entry_price;
        match self.direction {
            SignalDirection::Short => -diff * self.quantity,
            _ => diff * self.quantity,
        }
    }

    pub fn pnl_percentage(&self) -> Decimal {
        if self.entry_value.is_zero() {
            return Decimal::ZERO;
        }
        (self.unrealized_pnl() / self.entry_value) * Decimal::from(100)
    }

    pub fn holding_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_minutes()
    }

    /// Stop/entry/take ordering that must hold for any open position.
    pub fn exit_levels_consistent(&self) -> bool {
        match self.direction {
            SignalDirection::Short => {
                self.take_profit_price < self.entry_price && self.entry_price < self.stop_loss_price
            }
            _ => self.stop_loss_price < self.entry_price && self.entry_price < self.take_profit_price,
        }
    }
}

/// Terminal record created when a position closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub position_id: String,
    pub strategy_id: String,
    pub strategy_name: String,
    pub coin: String,
    pub direction: SignalDirection,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub pnl_percentage: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub trigger_signals: Vec<SignalSpec>,
    pub conviction_score: f64,
    pub market_regime: MarketRegime,
    pub fees_paid: Decimal,
}

impl Trade {
    pub fn from_closed_position(
        position: &LivePosition,
        exit_price: Decimal,
        exit_time: DateTime<Utc>,
        exit_reason: ExitReason,
        fees_paid: Decimal,
    ) -> Self {
        let diff = exit_price - position.entry_price;
        let gross = match position.direction {
            SignalDirection::Short => -diff * position.quantity,
            _ => diff * position.quantity,
        };
        let pnl = gross - fees_paid;
        let pnl_percentage = if position.entry_value.is_zero() {
            Decimal::ZERO
        } else {
            (pnl / position.entry_value) * Decimal::from(100)
        };
        Self {
            trade_id: Uuid::new_v4().to_string(),
            position_id: position.position_id.clone(),
            strategy_id: position.strategy_id.clone(),
            strategy_name: position.strategy_name.clone(),
            coin: position.coin.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            pnl,
            pnl_percentage,
            entry_time: position.entry_time,
            exit_time,
            exit_reason,
            trigger_signals: position.trigger_signals.clone(),
            conviction_score: position.conviction_score,
            market_regime: position.market_regime,
            fees_paid,
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}
