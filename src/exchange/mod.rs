pub mod binance;

pub use binance::BinanceClient;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineResult;
use crate::types::{Candle, ExchangeOrderStatus, Side, Ticker24h, TimeFrame, TradingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }
}

/// Acknowledgement returned on order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// Point-in-time order state returned by polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub status: ExchangeOrderStatus,
    pub executed_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub cummulative_quote_qty: Option<Decimal>,
}

impl OrderState {
    /// Fill price, preferring the exchange average and falling back to
    /// quote-quantity division.
    pub fn fill_price(&self) -> Option<Decimal> {
        self.avg_price.or_else(|| {
            let quote = self.cummulative_quote_qty?;
            if self.executed_qty.is_zero() {
                None
            } else {
                Some(quote / self.executed_qty)
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub available_balance: Decimal,
    pub balances: Vec<AssetBalance>,
}

impl Wallet {
    pub fn empty() -> Self {
        Self {
            available_balance: Decimal::ZERO,
            balances: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCheck {
    pub ok: bool,
    pub message: String,
}

/// Abstract exchange surface the engine talks to. The Binance REST client is
/// the production implementation; tests substitute a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_klines(
        &self,
        coin: &str,
        timeframe: TimeFrame,
        limit: u32,
    ) -> EngineResult<Vec<Candle>>;

    async fn get_ticker_price(&self, coin: &str, mode: TradingMode) -> EngineResult<Decimal>;

    async fn get_ticker_price_batch(
        &self,
        coins: &[String],
        mode: TradingMode,
    ) -> EngineResult<HashMap<String, Decimal>>;

    async fn get_ticker_24h(&self, coin: &str, mode: TradingMode) -> EngineResult<Ticker24h>;

    async fn get_ticker_24h_batch(
        &self,
        coins: &[String],
        mode: TradingMode,
    ) -> EngineResult<HashMap<String, Ticker24h>>;

    async fn create_order(
        &self,
        mode: TradingMode,
        coin: &str,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> EngineResult<OrderAck>;

    async fn get_order(
        &self,
        mode: TradingMode,
        coin: &str,
        order_id: &str,
    ) -> EngineResult<OrderState>;

    async fn get_wallet(&self, mode: TradingMode) -> EngineResult<Wallet>;

    async fn test_keys(&self, mode: TradingMode) -> EngineResult<KeyCheck>;
}
