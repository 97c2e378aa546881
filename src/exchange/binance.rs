#![allow(dead_code)]
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::{Candle, ExchangeOrderStatus, Side, Ticker24h, TimeFrame, TradingMode};

use super::{ExchangeClient, KeyCheck, OrderAck, OrderState, OrderType, AssetBalance, Wallet};

const BINANCE_API: &str = "https://api.binance.com";
const BINANCE_TESTNET: &str = "https://testnet.binance.vision";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type HmacSha256 = Hmac<Sha256>;

/// Binance-style REST client. Holds both base URLs; the trading mode passed
/// per call selects between testnet and live.
pub struct BinanceClient {
    client: Client,
    api_key: String,
    secret_key: String,
    limiter: DefaultDirectRateLimiter,
}

impl BinanceClient {
    pub fn new(api_key: String, secret_key: String) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        // Spot API weight budget; 10 req/s keeps paginated kline fetches
        // under the limit with headroom.
        let limiter = RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
        Self {
            client,
            api_key,
            secret_key,
            limiter,
        }
    }

    pub fn public_only() -> Self {
        Self::new(String::new(), String::new())
    }

    fn base_url(&self, mode: TradingMode) -> &'static str {
        match mode {
            TradingMode::Testnet => BINANCE_TESTNET,
            TradingMode::Live => BINANCE_API,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn build_signed_query(&self, params: &[(&str, String)]) -> String {
        let timestamp = Utc::now().timestamp_millis();
        let mut query_parts: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        query_parts.push(format!("timestamp={}", timestamp));
        query_parts.push("recvWindow=5000".to_string());
        let query = query_parts.join("&");
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    /// Map an error body to the taxonomy. `-2010` is the insufficient-balance
    /// rejection; any explicit rejection code becomes ExchangeRejection.
    fn classify_error(status: reqwest::StatusCode, body: &str) -> EngineError {
        if body.contains("\"code\":-2010") || body.contains("insufficient balance") {
            return EngineError::ExchangeRejection(body.to_string());
        }
        if status.is_client_error() {
            EngineError::ExchangeRejection(format!("{}: {}", status, body))
        } else {
            EngineError::TransientNetwork(format!("{}: {}", status, body))
        }
    }

    fn parse_kline_row(row: &[serde_json::Value]) -> EngineResult<Candle> {
        let open_time = row.first().and_then(|v| v.as_i64()).unwrap_or(0);
        let open = row.get(1).and_then(|v| v.as_str()).unwrap_or("0");
        let high = row.get(2).and_then(|v| v.as_str()).unwrap_or("0");
        let low = row.get(3).and_then(|v| v.as_str()).unwrap_or("0");
        let close = row.get(4).and_then(|v| v.as_str()).unwrap_or("0");
        let volume = row.get(5).and_then(|v| v.as_str()).unwrap_or("0");

        let parse = |s: &str| {
            Decimal::from_str(s)
                .map_err(|e| EngineError::TransientNetwork(format!("bad kline field '{}': {}", s, e)))
        };

        Ok(Candle {
            open_time: Utc
                .timestamp_millis_opt(open_time)
                .single()
                .unwrap_or_else(Utc::now),
            open: parse(open)?,
            high: parse(high)?,
            low: parse(low)?,
            close: parse(close)?,
            volume: parse(volume)?,
        })
    }

    fn ticker_from_response(coin: &str, resp: &Ticker24hResponse) -> EngineResult<Ticker24h> {
        let parse = |s: &str| {
            Decimal::from_str(s)
                .map_err(|e| EngineError::TransientNetwork(format!("bad ticker field: {}", e)))
        };
        Ok(Ticker24h {
            coin: coin.to_string(),
            price: parse(&resp.last_price)?,
            price_change_24h: parse(&resp.price_change)?,
            price_change_pct_24h: parse(&resp.price_change_percent)?,
            high_24h: parse(&resp.high_price)?,
            low_24h: parse(&resp.low_price)?,
            volume_24h: parse(&resp.volume)?,
            timestamp: Utc::now(),
        })
    }

    fn symbols_param(coins: &[String]) -> String {
        let quoted: Vec<String> = coins.iter().map(|c| format!("\"{}\"", c)).collect();
        format!("[{}]", quoted.join(","))
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn get_klines(
        &self,
        coin: &str,
        timeframe: TimeFrame,
        limit: u32,
    ) -> EngineResult<Vec<Candle>> {
        // Paginate 1000 candles per page, oldest first.
        let mut remaining = limit;
        let mut all: Vec<Candle> = Vec::with_capacity(limit as usize);
        let mut end_time: Option<i64> = None;

        while remaining > 0 {
            self.limiter.until_ready().await;
            let page = remaining.min(1000);
            let mut url = format!(
                "{}/api/v3/klines?symbol={}&interval={}&limit={}",
                self.base_url(TradingMode::Live),
                coin,
                timeframe.as_str(),
                page
            );
            if let Some(end) = end_time {
                url.push_str(&format!("&endTime={}", end));
            }

            let resp = self.client.get(&url).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::classify_error(status, &body));
            }
            let rows: Vec<Vec<serde_json::Value>> = resp.json().await?;
            if rows.is_empty() {
                break;
            }
            let got = rows.len() as u32;
            let mut batch: Vec<Candle> = rows
                .iter()
                .map(|row| Self::parse_kline_row(row))
                .collect::<EngineResult<Vec<_>>>()?;

            end_time = batch
                .first()
                .map(|c| c.open_time.timestamp_millis() - 1);
            batch.extend(all);
            all = batch;

            if got < page {
                break;
            }
            remaining -= got.min(remaining);
        }

        debug!(coin, count = all.len(), "fetched klines");
        Ok(all)
    }

    async fn get_ticker_price(&self, coin: &str, mode: TradingMode) -> EngineResult<Decimal> {
        self.limiter.until_ready().await;
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url(mode),
            coin
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, &body));
        }
        let ticker: PriceResponse = resp.json().await?;
        Decimal::from_str(&ticker.price)
            .map_err(|e| EngineError::TransientNetwork(format!("bad price: {}", e)))
    }

    async fn get_ticker_price_batch(
        &self,
        coins: &[String],
        mode: TradingMode,
    ) -> EngineResult<HashMap<String, Decimal>> {
        if coins.is_empty() {
            return Ok(HashMap::new());
        }
        self.limiter.until_ready().await;
        let url = format!(
            "{}/api/v3/ticker/price?symbols={}",
            self.base_url(mode),
            Self::symbols_param(coins)
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, &body));
        }
        let tickers: Vec<PriceResponse> = resp.json().await?;
        let mut out = HashMap::with_capacity(tickers.len());
        for t in tickers {
            match Decimal::from_str(&t.price) {
                Ok(price) => {
                    out.insert(t.symbol, price);
                }
                Err(e) => warn!(symbol = %t.symbol, "unparseable batch price: {}", e),
            }
        }
        Ok(out)
    }

    async fn get_ticker_24h(&self, coin: &str, mode: TradingMode) -> EngineResult<Ticker24h> {
        self.limiter.until_ready().await;
        let url = format!(
            "{}/api/v3/ticker/24hr?symbol={}",
            self.base_url(mode),
            coin
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, &body));
        }
        let ticker: Ticker24hResponse = resp.json().await?;
        Self::ticker_from_response(coin, &ticker)
    }

    async fn get_ticker_24h_batch(
        &self,
        coins: &[String],
        mode: TradingMode,
    ) -> EngineResult<HashMap<String, Ticker24h>> {
        if coins.is_empty() {
            return Ok(HashMap::new());
        }
        self.limiter.until_ready().await;
        let url = format!(
            "{}/api/v3/ticker/24hr?symbols={}",
            self.base_url(mode),
            Self::symbols_param(coins)
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, &body));
        }
        let tickers: Vec<Ticker24hResponse> = resp.json().await?;
        let mut out = HashMap::with_capacity(tickers.len());
        for t in &tickers {
            match Self::ticker_from_response(&t.symbol, t) {
                Ok(ticker) => {
                    out.insert(t.symbol.clone(), ticker);
                }
                Err(e) => warn!(symbol = %t.symbol, "unparseable batch ticker: {}", e),
            }
        }
        Ok(out)
    }

    async fn create_order(
        &self,
        mode: TradingMode,
        coin: &str,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> EngineResult<OrderAck> {
        self.limiter.until_ready().await;
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", coin.to_string()),
            ("side", side.as_str().to_string()),
            ("type", order_type.as_str().to_string()),
            ("quantity", quantity.to_string()),
        ];
        if let Some(p) = price {
            params.push(("price", p.to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }

        let query = self.build_signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url(mode), query);

        debug!(coin, %side, %quantity, "placing order");

        let resp = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, &body));
        }

        let order: CreateOrderResponse = resp.json().await?;
        Ok(OrderAck {
            order_id: order.order_id.to_string(),
        })
    }

    async fn get_order(
        &self,
        mode: TradingMode,
        coin: &str,
        order_id: &str,
    ) -> EngineResult<OrderState> {
        self.limiter.until_ready().await;
        let params: Vec<(&str, String)> = vec![
            ("symbol", coin.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let query = self.build_signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url(mode), query);

        let resp = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, &body));
        }

        let order: OrderResponse = resp.json().await?;
        let status = ExchangeOrderStatus::from_wire(&order.status).ok_or_else(|| {
            EngineError::Consistency(format!("unknown order status '{}'", order.status))
        })?;

        Ok(OrderState {
            status,
            executed_qty: Decimal::from_str(&order.executed_qty).unwrap_or(Decimal::ZERO),
            avg_price: order
                .avg_price
                .as_deref()
                .and_then(|p| Decimal::from_str(p).ok())
                .filter(|p| !p.is_zero()),
            cummulative_quote_qty: order
                .cummulative_quote_qty
                .as_deref()
                .and_then(|q| Decimal::from_str(q).ok()),
        })
    }

    async fn get_wallet(&self, mode: TradingMode) -> EngineResult<Wallet> {
        self.limiter.until_ready().await;
        let query = self.build_signed_query(&[]);
        let url = format!("{}/api/v3/account?{}", self.base_url(mode), query);

        let resp = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, &body));
        }

        let account: AccountResponse = resp.json().await?;
        let mut balances = Vec::new();
        let mut available = Decimal::ZERO;
        for b in account.balances {
            let free = Decimal::from_str(&b.free).unwrap_or(Decimal::ZERO);
            let locked = Decimal::from_str(&b.locked).unwrap_or(Decimal::ZERO);
            if b.asset == "USDT" {
                available = free;
            }
            if !free.is_zero() || !locked.is_zero() {
                balances.push(AssetBalance {
                    asset: b.asset,
                    free,
                    locked,
                });
            }
        }

        Ok(Wallet {
            available_balance: available,
            balances,
        })
    }

    async fn test_keys(&self, mode: TradingMode) -> EngineResult<KeyCheck> {
        if self.api_key.is_empty() || self.secret_key.is_empty() {
            return Ok(KeyCheck {
                ok: false,
                message: "API key or secret not configured".to_string(),
            });
        }
        match self.get_wallet(mode).await {
            Ok(_) => Ok(KeyCheck {
                ok: true,
                message: "keys valid".to_string(),
            }),
            Err(EngineError::TransientNetwork(m)) => Err(EngineError::TransientNetwork(m)),
            Err(e) => Ok(KeyCheck {
                ok: false,
                message: e.to_string(),
            }),
        }
    }
}

// API response types

#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(default)]
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct Ticker24hResponse {
    #[serde(default)]
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "priceChange")]
    price_change: String,
    #[serde(rename = "priceChangePercent")]
    price_change_percent: String,
    #[serde(rename = "highPrice")]
    high_price: String,
    #[serde(rename = "lowPrice")]
    low_price: String,
    volume: String,
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    #[serde(rename = "orderId")]
    order_id: u64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId")]
    order_id: u64,
    status: String,
    #[serde(rename = "executedQty", default)]
    executed_qty: String,
    #[serde(rename = "avgPrice")]
    avg_price: Option<String>,
    #[serde(rename = "cummulativeQuoteQty")]
    cummulative_quote_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<BalanceResponse>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    asset: String,
    free: String,
    locked: String,
}
