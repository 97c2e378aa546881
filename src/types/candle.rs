#![allow(dead_code)]
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn body_size(&self) -> Decimal {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn upper_wick(&self) -> Decimal {
        self.high - self.close.max(self.open)
    }

    pub fn lower_wick(&self) -> Decimal {
        self.close.min(self.open) - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn is_doji(&self) -> bool {
        let body = self.body_size();
        let range = self.range();
        if range.is_zero() {
            return true;
        }
        body / range < Decimal::new(1, 1)
    }

    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }

    pub fn close_f64(&self) -> f64 {
        self.close.try_into().unwrap_or(f64::NAN)
    }

    pub fn high_f64(&self) -> f64 {
        self.high.try_into().unwrap_or(f64::NAN)
    }

    pub fn low_f64(&self) -> f64 {
        self.low.try_into().unwrap_or(f64::NAN)
    }

    pub fn open_f64(&self) -> f64 {
        self.open.try_into().unwrap_or(f64::NAN)
    }

    pub fn volume_f64(&self) -> f64 {
        self.volume.try_into().unwrap_or(f64::NAN)
    }
}

/// Sliding window over the most recent candles for one (coin, timeframe).
#[derive(Debug, Clone, Default)]
pub struct CandleWindow {
    pub candles: Vec<Candle>,
    pub max_size: usize,
}

impl CandleWindow {
    pub fn new(max_size: usize) -> Self {
        Self {
            candles: Vec::with_capacity(max_size),
            max_size,
        }
    }

    pub fn push(&mut self, candle: Candle) {
        // Drop stale duplicates of the same bar, keep time strictly increasing
        if let Some(last) = self.candles.last() {
            if candle.open_time <= last.open_time {
                if candle.open_time == last.open_time {
                    *self.candles.last_mut().unwrap() = candle;
                }
                return;
            }
        }
        if self.candles.len() >= self.max_size {
            self.candles.remove(0);
        }
        self.candles.push(candle);
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close_f64()).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.high_f64()).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.low_f64()).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.volume_f64()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker24h {
    pub coin: String,
    pub price: Decimal,
    pub price_change_24h: Decimal,
    pub price_change_pct_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub volume_24h: Decimal,
    pub timestamp: DateTime<Utc>,
}
