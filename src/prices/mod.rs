#![allow(dead_code)]
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangeClient;
use crate::types::{Ticker24h, TradingMode};

const DEFAULT_STALENESS: Duration = Duration::from_secs(30);
const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_ERROR_TTL: Duration = Duration::from_secs(5);
pub const COORDINATOR_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FetchKind {
    Price,
    Ticker,
}

type BatchKey = (TradingMode, FetchKind);

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: Result<T, String>,
    at: Instant,
}

impl<T> CacheEntry<T> {
    fn fresh(&self, staleness: Duration, error_ttl: Duration) -> bool {
        let ttl = if self.value.is_err() { error_ttl } else { staleness };
        self.at.elapsed() < ttl
    }
}

/// One pending batch per (mode, kind). Callers add symbols while it is
/// collecting; once dispatched, late callers wait for completion and then
/// start a fresh batch for anything still missing.
struct PendingBatch {
    symbols: HashSet<String>,
    dispatched: bool,
    done_rx: watch::Receiver<bool>,
}

#[derive(Default)]
struct CacheState {
    prices: HashMap<(String, TradingMode), CacheEntry<Decimal>>,
    tickers: HashMap<(String, TradingMode), CacheEntry<Ticker24h>>,
    batches: HashMap<BatchKey, PendingBatch>,
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    api_calls: AtomicU64,
    batched_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub api_calls: u64,
    pub batched_requests: u64,
    pub hit_rate: f64,
}

type SubscriberFn = Box<dyn Fn() -> Vec<String> + Send + Sync>;

/// Process-wide coalescing cache of spot prices and 24h tickers.
///
/// Simultaneous lookups for uncached symbols join one collected batch per
/// (mode, kind); at most one network fetch is ever in flight for a key.
#[derive(Clone)]
pub struct PriceCache {
    exchange: Arc<dyn ExchangeClient>,
    staleness: Duration,
    batch_delay: Duration,
    error_ttl: Duration,
    state: Arc<Mutex<CacheState>>,
    metrics: Arc<CacheMetrics>,
    subscribers: Arc<std::sync::Mutex<HashMap<u64, SubscriberFn>>>,
    next_subscriber_id: Arc<AtomicU64>,
}

/// Unsubscribes its callback when dropped.
pub struct Subscription {
    id: u64,
    subscribers: Arc<std::sync::Mutex<HashMap<u64, SubscriberFn>>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.remove(&self.id);
        }
    }
}

impl PriceCache {
    pub fn new(exchange: Arc<dyn ExchangeClient>) -> Self {
        Self::with_timing(exchange, DEFAULT_STALENESS, DEFAULT_BATCH_DELAY, DEFAULT_ERROR_TTL)
    }

    pub fn with_timing(
        exchange: Arc<dyn ExchangeClient>,
        staleness: Duration,
        batch_delay: Duration,
        error_ttl: Duration,
    ) -> Self {
        Self {
            exchange,
            staleness,
            batch_delay,
            error_ttl,
            state: Arc::new(Mutex::new(CacheState::default())),
            metrics: Arc::new(CacheMetrics::default()),
            subscribers: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn get_price(&self, coin: &str, mode: TradingMode) -> EngineResult<Decimal> {
        let mut first_check = true;
        loop {
            let mut rx = {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.prices.get(&(coin.to_string(), mode)) {
                    if entry.fresh(self.staleness, self.error_ttl) {
                        if first_check {
                            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                        }
                        return entry
                            .value
                            .clone()
                            .map_err(EngineError::TransientNetwork);
                    }
                }
                if first_check {
                    self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                    first_check = false;
                }
                self.join_batch(&mut state, mode, FetchKind::Price, std::slice::from_ref(&coin.to_string()))
            };
            let _ = rx.changed().await;
        }
    }

    pub async fn get_ticker_24h(&self, coin: &str, mode: TradingMode) -> EngineResult<Ticker24h> {
        let mut first_check = true;
        loop {
            let mut rx = {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.tickers.get(&(coin.to_string(), mode)) {
                    if entry.fresh(self.staleness, self.error_ttl) {
                        if first_check {
                            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                        }
                        return entry
                            .value
                            .clone()
                            .map_err(EngineError::TransientNetwork);
                    }
                }
                if first_check {
                    self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                    first_check = false;
                }
                self.join_batch(&mut state, mode, FetchKind::Ticker, std::slice::from_ref(&coin.to_string()))
            };
            let _ = rx.changed().await;
        }
    }

    /// Batch lookup; cached symbols are served immediately, the rest go
    /// through one coalesced fetch. Symbols that fail individually are simply
    /// absent from the result map.
    pub async fn get_batch_prices(
        &self,
        coins: &[String],
        mode: TradingMode,
    ) -> EngineResult<HashMap<String, Decimal>> {
        let mut out = HashMap::with_capacity(coins.len());
        let mut rounds = 0u8;
        loop {
            let mut rx = {
                let mut state = self.state.lock().await;
                let mut missing: Vec<String> = Vec::new();
                for coin in coins {
                    if out.contains_key(coin) {
                        continue;
                    }
                    match state.prices.get(&(coin.clone(), mode)) {
                        Some(entry) if entry.fresh(self.staleness, self.error_ttl) => {
                            if rounds == 0 {
                                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                            }
                            if let Ok(price) = &entry.value {
                                out.insert(coin.clone(), *price);
                            }
                        }
                        _ => {
                            if rounds == 0 {
                                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                            }
                            missing.push(coin.clone());
                        }
                    }
                }
                // Symbols with fresh error entries are skipped above; a few
                // rounds cover joining a batch that was already dispatched.
                if missing.is_empty() || rounds >= 3 {
                    return Ok(out);
                }
                self.join_batch(&mut state, mode, FetchKind::Price, &missing)
            };
            let _ = rx.changed().await;
            rounds += 1;
        }
    }

    /// Register a callback announcing which coins a subscriber needs; the
    /// global coordinator batches the union. Dropping the handle
    /// unsubscribes.
    pub fn subscribe_global_updates<F>(&self, callback: F) -> Subscription
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .insert(id, Box::new(callback));
        Subscription {
            id,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Periodic union-of-subscriptions ticker refresh. Runs until the
    /// shutdown signal flips.
    pub fn spawn_coordinator(
        &self,
        mode: TradingMode,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let coins: Vec<String> = {
                            let subs = cache.subscribers.lock().expect("subscriber registry poisoned");
                            let mut union: HashSet<String> = HashSet::new();
                            for callback in subs.values() {
                                union.extend(callback());
                            }
                            union.into_iter().collect()
                        };
                        if coins.is_empty() {
                            continue;
                        }
                        debug!(count = coins.len(), "global ticker refresh");
                        let mut rx = {
                            let mut state = cache.state.lock().await;
                            cache.join_batch(&mut state, mode, FetchKind::Ticker, &coins)
                        };
                        let _ = rx.changed().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let hits = self.metrics.hits.load(Ordering::Relaxed);
        let misses = self.metrics.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        MetricsSnapshot {
            hits,
            misses,
            api_calls: self.metrics.api_calls.load(Ordering::Relaxed),
            batched_requests: self.metrics.batched_requests.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Add symbols to the (mode, kind) batch, creating and scheduling it if
    /// absent. Returns a receiver that fires when the batch completes. Must
    /// be called with the state lock held; the lock serializes batch creation
    /// across keys.
    fn join_batch(
        &self,
        state: &mut CacheState,
        mode: TradingMode,
        kind: FetchKind,
        symbols: &[String],
    ) -> watch::Receiver<bool> {
        let key = (mode, kind);
        if let Some(batch) = state.batches.get_mut(&key) {
            if !batch.dispatched {
                batch.symbols.extend(symbols.iter().cloned());
            }
            return batch.done_rx.clone();
        }

        let (done_tx, done_rx) = watch::channel(false);
        state.batches.insert(
            key,
            PendingBatch {
                symbols: symbols.iter().cloned().collect(),
                dispatched: false,
                done_rx: done_rx.clone(),
            },
        );

        let cache = self.clone();
        tokio::spawn(async move {
            cache.dispatch_batch(mode, kind, done_tx).await;
        });

        done_rx
    }

    async fn dispatch_batch(&self, mode: TradingMode, kind: FetchKind, done_tx: watch::Sender<bool>) {
        // Collection window: let concurrent callers pile their symbols on
        tokio::time::sleep(self.batch_delay).await;

        let key = (mode, kind);
        let symbols: Vec<String> = {
            let mut state = self.state.lock().await;
            match state.batches.get_mut(&key) {
                Some(batch) => {
                    batch.dispatched = true;
                    batch.symbols.iter().cloned().collect()
                }
                None => Vec::new(),
            }
        };

        if !symbols.is_empty() {
            self.metrics
                .batched_requests
                .fetch_add(symbols.len() as u64, Ordering::Relaxed);
            match kind {
                FetchKind::Price => self.fetch_prices(&symbols, mode).await,
                FetchKind::Ticker => self.fetch_tickers(&symbols, mode).await,
            }
        }

        let mut state = self.state.lock().await;
        state.batches.remove(&key);
        let _ = done_tx.send(true);
    }

    async fn fetch_prices(&self, symbols: &[String], mode: TradingMode) {
        self.metrics.api_calls.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        match self.exchange.get_ticker_price_batch(symbols, mode).await {
            Ok(map) => {
                let mut state = self.state.lock().await;
                for symbol in symbols {
                    let value = map
                        .get(symbol)
                        .copied()
                        .ok_or_else(|| format!("{} missing from batch response", symbol));
                    state
                        .prices
                        .insert((symbol.clone(), mode), CacheEntry { value, at: now });
                }
            }
            Err(e) => {
                warn!("batch price fetch failed, falling back to singles: {}", e);
                // Per-symbol fallback tolerates individual failures
                let results = futures::future::join_all(symbols.iter().map(|symbol| {
                    let exchange = Arc::clone(&self.exchange);
                    async move { (symbol.clone(), exchange.get_ticker_price(symbol, mode).await) }
                }))
                .await;
                self.metrics
                    .api_calls
                    .fetch_add(symbols.len() as u64, Ordering::Relaxed);
                let mut state = self.state.lock().await;
                for (symbol, result) in results {
                    let value = result.map_err(|e| e.to_string());
                    state
                        .prices
                        .insert((symbol, mode), CacheEntry { value, at: now });
                }
            }
        }
    }

    async fn fetch_tickers(&self, symbols: &[String], mode: TradingMode) {
        self.metrics.api_calls.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        match self.exchange.get_ticker_24h_batch(symbols, mode).await {
            Ok(map) => {
                let mut state = self.state.lock().await;
                for symbol in symbols {
                    let value = map
                        .get(symbol)
                        .cloned()
                        .ok_or_else(|| format!("{} missing from batch response", symbol));
                    state
                        .tickers
                        .insert((symbol.clone(), mode), CacheEntry { value, at: now });
                }
            }
            Err(e) => {
                warn!("batch ticker fetch failed, falling back to singles: {}", e);
                let results = futures::future::join_all(symbols.iter().map(|symbol| {
                    let exchange = Arc::clone(&self.exchange);
                    async move { (symbol.clone(), exchange.get_ticker_24h(symbol, mode).await) }
                }))
                .await;
                self.metrics
                    .api_calls
                    .fetch_add(symbols.len() as u64, Ordering::Relaxed);
                let mut state = self.state.lock().await;
                for (symbol, result) in results {
                    let value = result.map_err(|e| e.to_string());
                    state
                        .tickers
                        .insert((symbol, mode), CacheEntry { value, at: now });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeClient;
    use rust_decimal_macros::dec;

    fn coins(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce_into_one_fetch() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_ticker_price_batch()
            .times(1)
            .returning(|symbols, _| {
                let mut out = HashMap::new();
                for s in symbols {
                    out.insert(s.clone(), dec!(50000));
                }
                Ok(out)
            });

        let cache = PriceCache::with_timing(
            Arc::new(mock),
            DEFAULT_STALENESS,
            Duration::from_millis(20),
            DEFAULT_ERROR_TTL,
        );

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get_price("BTCUSDT", TradingMode::Testnet).await
            }));
        }

        for handle in handles {
            let price = handle.await.unwrap().unwrap();
            assert_eq!(price, dec!(50000));
        }

        let metrics = cache.metrics();
        assert_eq!(metrics.api_calls, 1);
        assert_eq!(metrics.misses, 50);
        assert_eq!(metrics.hits, 0);
    }

    #[tokio::test]
    async fn cached_value_served_within_staleness_window() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_ticker_price_batch()
            .times(1)
            .returning(|symbols, _| {
                let mut out = HashMap::new();
                for s in symbols {
                    out.insert(s.clone(), dec!(3000));
                }
                Ok(out)
            });

        let cache = PriceCache::with_timing(
            Arc::new(mock),
            DEFAULT_STALENESS,
            Duration::from_millis(5),
            DEFAULT_ERROR_TTL,
        );

        let first = cache.get_price("ETHUSDT", TradingMode::Live).await.unwrap();
        let second = cache.get_price("ETHUSDT", TradingMode::Live).await.unwrap();
        assert_eq!(first, second);

        let metrics = cache.metrics();
        assert_eq!(metrics.api_calls, 1);
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
    }

    #[tokio::test]
    async fn batch_failure_falls_back_to_singles() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_ticker_price_batch()
            .times(1)
            .returning(|_, _| Err(EngineError::TransientNetwork("batch endpoint down".into())));
        mock.expect_get_ticker_price()
            .returning(|symbol, _| {
                if symbol == "BADUSDT" {
                    Err(EngineError::TransientNetwork("no such symbol".into()))
                } else {
                    Ok(dec!(100))
                }
            });

        let cache = PriceCache::with_timing(
            Arc::new(mock),
            DEFAULT_STALENESS,
            Duration::from_millis(5),
            DEFAULT_ERROR_TTL,
        );

        let prices = cache
            .get_batch_prices(&coins(&["SOLUSDT", "BADUSDT"]), TradingMode::Testnet)
            .await
            .unwrap();

        assert_eq!(prices.get("SOLUSDT"), Some(&dec!(100)));
        // Failed symbol is surfaced by absence, not by failing the batch
        assert!(!prices.contains_key("BADUSDT"));

        // The error entry keeps failing until its TTL expires
        assert!(cache
            .get_price("BADUSDT", TradingMode::Testnet)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stale_entry_refetches() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_ticker_price_batch()
            .times(2)
            .returning(|symbols, _| {
                let mut out = HashMap::new();
                for s in symbols {
                    out.insert(s.clone(), dec!(1));
                }
                Ok(out)
            });

        let cache = PriceCache::with_timing(
            Arc::new(mock),
            Duration::from_millis(30),
            Duration::from_millis(5),
            DEFAULT_ERROR_TTL,
        );

        cache.get_price("BTCUSDT", TradingMode::Live).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.get_price("BTCUSDT", TradingMode::Live).await.unwrap();

        assert_eq!(cache.metrics().api_calls, 2);
    }

    #[tokio::test]
    async fn subscription_drop_unsubscribes() {
        let mock = MockExchangeClient::new();
        let cache = PriceCache::new(Arc::new(mock));

        let sub = cache.subscribe_global_updates(|| vec!["BTCUSDT".to_string()]);
        assert_eq!(cache.subscribers.lock().unwrap().len(), 1);
        drop(sub);
        assert_eq!(cache.subscribers.lock().unwrap().len(), 0);
    }
}
