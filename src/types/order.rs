#![allow(dead_code)]
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExitReason, MarketRegime, Side, SignalMatch, TradingMode};

/// Order status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeOrderStatus {
    New,
    PendingNew,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl ExchangeOrderStatus {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(ExchangeOrderStatus::New),
            "PENDING_NEW" => Some(ExchangeOrderStatus::PendingNew),
            "PARTIALLY_FILLED" => Some(ExchangeOrderStatus::PartiallyFilled),
            "FILLED" => Some(ExchangeOrderStatus::Filled),
            "CANCELED" => Some(ExchangeOrderStatus::Canceled),
            "REJECTED" => Some(ExchangeOrderStatus::Rejected),
            "EXPIRED" => Some(ExchangeOrderStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeOrderStatus::New => "NEW",
            ExchangeOrderStatus::PendingNew => "PENDING_NEW",
            ExchangeOrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            ExchangeOrderStatus::Filled => "FILLED",
            ExchangeOrderStatus::Canceled => "CANCELED",
            ExchangeOrderStatus::Rejected => "REJECTED",
            ExchangeOrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_still_pending(&self) -> bool {
        matches!(self, ExchangeOrderStatus::New | ExchangeOrderStatus::PendingNew)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Rejected | ExchangeOrderStatus::Expired
        )
    }
}

/// Why a tracked order left the pending map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOrderOutcome {
    Filled,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub at: DateTime<Utc>,
    pub status: ExchangeOrderStatus,
    pub executed_qty: Decimal,
}

/// Context carried from submission to fill so the fill handler can build the
/// right domain object without re-deriving anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderMetadata {
    Entry {
        strategy_id: String,
        strategy_name: String,
        signal: SignalMatch,
        atr: f64,
        conviction_score: f64,
        market_regime: MarketRegime,
        wallet_id: String,
        stop_loss_price: Decimal,
        take_profit_price: Decimal,
        enable_trailing_take_profit: bool,
        trailing_stop_percentage: f64,
        estimated_exit_time_minutes: i64,
    },
    Exit {
        position_id: String,
        exit_reason: ExitReason,
    },
}

/// RAM-only record of a submitted order awaiting a terminal status.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub order_id: String,
    pub coin: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub trading_mode: TradingMode,
    pub submitted_at: DateTime<Utc>,
    pub last_checked: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub status: ExchangeOrderStatus,
    pub checks: Vec<StatusSnapshot>,
    pub metadata: OrderMetadata,
}

impl PendingOrder {
    pub fn new(
        order_id: String,
        coin: String,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        trading_mode: TradingMode,
        submitted_at: DateTime<Utc>,
        metadata: OrderMetadata,
    ) -> Self {
        Self {
            order_id,
            coin,
            side,
            quantity,
            price,
            trading_mode,
            submitted_at,
            last_checked: None,
            retry_count: 0,
            status: ExchangeOrderStatus::New,
            checks: Vec::new(),
            metadata,
        }
    }

    pub fn record_check(&mut self, at: DateTime<Utc>, status: ExchangeOrderStatus, executed_qty: Decimal) {
        self.last_checked = Some(at);
        self.status = status;
        self.checks.push(StatusSnapshot {
            at,
            status,
            executed_qty,
        });
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.submitted_at).num_seconds()
    }
}
