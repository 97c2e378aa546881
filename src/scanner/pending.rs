use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::exchange::{ExchangeClient, OrderState, OrderType};
use crate::types::{ExchangeOrderStatus, PendingOrder, PendingOrderOutcome, Side};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_RETRIES: u32 = 3;
pub const MAX_PENDING_SECS: i64 = 300;

/// Receives terminal order events. The position manager is the production
/// sink: BUY fills create positions, SELL fills close them.
#[async_trait]
pub trait FillSink: Send + Sync {
    async fn on_buy_filled(&self, order: &PendingOrder, state: &OrderState);
    async fn on_sell_filled(&self, order: &PendingOrder, state: &OrderState);
    async fn on_order_failed(&self, order: &PendingOrder, outcome: PendingOrderOutcome);
}

/// Tracks submitted orders until a terminal status. One monitoring loop
/// exists at most; it starts when the map becomes non-empty and parks when
/// it drains.
pub struct PendingOrderManager {
    orders: Mutex<HashMap<String, PendingOrder>>,
    failed_orders: Mutex<Vec<PendingOrder>>,
    exchange: Arc<dyn ExchangeClient>,
    sink: Arc<dyn FillSink>,
    monitor_running: AtomicBool,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl PendingOrderManager {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        sink: Arc<dyn FillSink>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            failed_orders: Mutex::new(Vec::new()),
            exchange,
            sink,
            monitor_running: AtomicBool::new(false),
            poll_interval,
            shutdown,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.orders.lock().await.len()
    }

    pub async fn failed_orders(&self) -> Vec<PendingOrder> {
        self.failed_orders.lock().await.clone()
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor_running.load(Ordering::Acquire)
    }

    /// Register a submitted order and make sure the monitor loop is running.
    pub async fn track(self: &Arc<Self>, order: PendingOrder) {
        debug!(order_id = %order.order_id, coin = %order.coin, side = %order.side, "tracking order");
        self.orders
            .lock()
            .await
            .insert(order.order_id.clone(), order);
        self.ensure_monitor();
    }

    fn ensure_monitor(self: &Arc<Self>) {
        if self.monitor_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.monitor_loop().await;
        });
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            let remaining = self.check_once().await;
            if remaining == 0 {
                // Park the loop; a racing track() restarts it
                self.monitor_running.store(false, Ordering::Release);
                let still_empty = self.orders.lock().await.is_empty();
                if still_empty {
                    break;
                }
                if self.monitor_running.swap(true, Ordering::AcqRel) {
                    break;
                }
            }
        }
        self.monitor_running.store(false, Ordering::Release);
    }

    /// One polling pass over every tracked order. Returns the number of
    /// orders still pending.
    pub async fn check_once(self: &Arc<Self>) -> usize {
        let snapshot: Vec<PendingOrder> = {
            let orders = self.orders.lock().await;
            orders.values().cloned().collect()
        };
        let now = Utc::now();

        for order in snapshot {
            if order.age_seconds(now) > MAX_PENDING_SECS {
                info!(order_id = %order.order_id, "pending order expired");
                self.fail_order(&order, PendingOrderOutcome::Expired).await;
                continue;
            }

            match self
                .exchange
                .get_order(order.trading_mode, &order.coin, &order.order_id)
                .await
            {
                Ok(state) => {
                    {
                        let mut orders = self.orders.lock().await;
                        if let Some(tracked) = orders.get_mut(&order.order_id) {
                            tracked.record_check(now, state.status, state.executed_qty);
                        }
                    }
                    match state.status {
                        ExchangeOrderStatus::New | ExchangeOrderStatus::PendingNew => {}
                        ExchangeOrderStatus::PartiallyFilled => {
                            debug!(
                                order_id = %order.order_id,
                                executed = %state.executed_qty,
                                "order partially filled"
                            );
                        }
                        ExchangeOrderStatus::Filled => {
                            let removed = self.orders.lock().await.remove(&order.order_id);
                            if let Some(filled) = removed {
                                info!(order_id = %filled.order_id, side = %filled.side, "order filled");
                                match filled.side {
                                    Side::Buy => self.sink.on_buy_filled(&filled, &state).await,
                                    Side::Sell => self.sink.on_sell_filled(&filled, &state).await,
                                }
                            }
                        }
                        ExchangeOrderStatus::Canceled
                        | ExchangeOrderStatus::Rejected
                        | ExchangeOrderStatus::Expired => {
                            self.fail_order(&order, PendingOrderOutcome::Failed).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, "order poll failed: {}", e);
                    let exhausted = {
                        let mut orders = self.orders.lock().await;
                        match orders.get_mut(&order.order_id) {
                            Some(tracked) => {
                                tracked.retry_count += 1;
                                tracked.retry_count >= MAX_RETRIES
                            }
                            None => false,
                        }
                    };
                    if exhausted {
                        let order = {
                            let orders = self.orders.lock().await;
                            orders.get(&order.order_id).cloned()
                        };
                        if let Some(order) = order {
                            self.fail_order(&order, PendingOrderOutcome::Failed).await;
                        }
                    }
                }
            }
        }

        self.orders.lock().await.len()
    }

    /// Move an order to the failed list, notify the sink, and resubmit BUY
    /// orders that still have retries left.
    async fn fail_order(self: &Arc<Self>, order: &PendingOrder, outcome: PendingOrderOutcome) {
        let removed = self.orders.lock().await.remove(&order.order_id);
        let Some(mut failed) = removed else {
            return;
        };
        failed.status = match outcome {
            PendingOrderOutcome::Expired => ExchangeOrderStatus::Expired,
            _ => failed.status,
        };
        self.failed_orders.lock().await.push(failed.clone());
        self.sink.on_order_failed(&failed, outcome).await;

        if failed.side == Side::Buy && failed.retry_count < MAX_RETRIES {
            match self.resubmit(&failed).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(order_id = %failed.order_id, "retry submission failed: {}", e);
                }
            }
        }
    }

    /// Resubmit the same payload under a fresh exchange order id.
    async fn resubmit(self: &Arc<Self>, failed: &PendingOrder) -> EngineResult<()> {
        let ack = self
            .exchange
            .create_order(
                failed.trading_mode,
                &failed.coin,
                failed.side,
                OrderType::Market,
                failed.quantity,
                None,
            )
            .await?;

        info!(
            old = %failed.order_id,
            new = %ack.order_id,
            attempt = failed.retry_count + 1,
            "resubmitted failed BUY"
        );

        let mut retry = PendingOrder::new(
            ack.order_id,
            failed.coin.clone(),
            failed.side,
            failed.quantity,
            failed.price,
            failed.trading_mode,
            Utc::now(),
            failed.metadata.clone(),
        );
        retry.retry_count = failed.retry_count + 1;
        self.track(retry).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::exchange::{MockExchangeClient, OrderAck};
    use crate::types::{ExitReason, OrderMetadata, TradingMode};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct RecordingSink {
        events: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FillSink for RecordingSink {
        async fn on_buy_filled(&self, order: &PendingOrder, _state: &OrderState) {
            self.events
                .lock()
                .unwrap()
                .push(format!("buy_filled:{}", order.order_id));
        }
        async fn on_sell_filled(&self, order: &PendingOrder, _state: &OrderState) {
            self.events
                .lock()
                .unwrap()
                .push(format!("sell_filled:{}", order.order_id));
        }
        async fn on_order_failed(&self, order: &PendingOrder, outcome: PendingOrderOutcome) {
            self.events
                .lock()
                .unwrap()
                .push(format!("failed:{}:{:?}", order.order_id, outcome));
        }
    }

    impl RecordingSink {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    fn exit_order(order_id: &str, submitted_secs_ago: i64) -> PendingOrder {
        PendingOrder::new(
            order_id.to_string(),
            "BTCUSDT".to_string(),
            Side::Sell,
            dec!(0.5),
            dec!(50000),
            TradingMode::Testnet,
            Utc::now() - chrono::Duration::seconds(submitted_secs_ago),
            OrderMetadata::Exit {
                position_id: "pos-1".to_string(),
                exit_reason: ExitReason::StopLoss,
            },
        )
    }

    fn buy_order(order_id: &str, submitted_secs_ago: i64) -> PendingOrder {
        PendingOrder::new(
            order_id.to_string(),
            "BTCUSDT".to_string(),
            Side::Buy,
            dec!(0.5),
            dec!(50000),
            TradingMode::Testnet,
            Utc::now() - chrono::Duration::seconds(submitted_secs_ago),
            OrderMetadata::Exit {
                // Metadata content is irrelevant for manager-level tests
                position_id: "pos-1".to_string(),
                exit_reason: ExitReason::Manual,
            },
        )
    }

    fn manager(
        exchange: MockExchangeClient,
        sink: Arc<RecordingSink>,
        poll: Duration,
    ) -> (Arc<PendingOrderManager>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let manager = Arc::new(PendingOrderManager::new(Arc::new(exchange), sink, poll, rx));
        (manager, tx)
    }

    fn filled_state() -> OrderState {
        OrderState {
            status: ExchangeOrderStatus::Filled,
            executed_qty: dec!(0.5),
            avg_price: Some(dec!(50010)),
            cummulative_quote_qty: None,
        }
    }

    #[tokio::test]
    async fn fill_dispatches_to_sink_and_stops_tracking() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_order()
            .returning(|_, _, _| Ok(filled_state()));

        let sink = Arc::new(RecordingSink::default());
        let (manager, _shutdown) = manager(mock, Arc::clone(&sink), Duration::from_secs(10));

        manager.track(exit_order("11", 5)).await;
        let remaining = manager.check_once().await;

        assert_eq!(remaining, 0);
        assert_eq!(sink.events(), vec!["sell_filled:11".to_string()]);
    }

    #[tokio::test]
    async fn expired_buy_is_failed_and_resubmitted_with_new_id() {
        let mut mock = MockExchangeClient::new();
        // Still NEW on the exchange, but 301s old locally
        mock.expect_get_order().returning(|_, _, _| {
            Ok(OrderState {
                status: ExchangeOrderStatus::New,
                executed_qty: Decimal::ZERO,
                avg_price: None,
                cummulative_quote_qty: None,
            })
        });
        mock.expect_create_order()
            .times(1)
            .returning(|_, _, _, _, _, _| {
                Ok(OrderAck {
                    order_id: "43".to_string(),
                })
            });

        let sink = Arc::new(RecordingSink::default());
        let (manager, _shutdown) = manager(mock, Arc::clone(&sink), Duration::from_secs(10));

        manager.track(buy_order("42", MAX_PENDING_SECS + 1)).await;
        let remaining = manager.check_once().await;

        // The retry is now the only tracked order, under a fresh id
        assert_eq!(remaining, 1);
        let orders = manager.orders.lock().await;
        let retry = orders.get("43").expect("retry tracked");
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.quantity, dec!(0.5));
        drop(orders);

        assert_eq!(manager.failed_orders().await.len(), 1);
        assert_eq!(sink.events(), vec!["failed:42:Expired".to_string()]);
    }

    #[tokio::test]
    async fn rejected_sell_fails_without_resubmission() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_order().returning(|_, _, _| {
            Ok(OrderState {
                status: ExchangeOrderStatus::Rejected,
                executed_qty: Decimal::ZERO,
                avg_price: None,
                cummulative_quote_qty: None,
            })
        });
        // No create_order expectation: resubmission would panic the mock

        let sink = Arc::new(RecordingSink::default());
        let (manager, _shutdown) = manager(mock, Arc::clone(&sink), Duration::from_secs(10));

        manager.track(exit_order("7", 5)).await;
        let remaining = manager.check_once().await;

        assert_eq!(remaining, 0);
        assert_eq!(sink.events(), vec!["failed:7:Failed".to_string()]);
    }

    #[tokio::test]
    async fn poll_errors_exhaust_retries_into_failure() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_order()
            .returning(|_, _, _| Err(EngineError::TransientNetwork("timeout".to_string())));
        mock.expect_create_order()
            .times(0..=1)
            .returning(|_, _, _, _, _, _| {
                Ok(OrderAck {
                    order_id: "next".to_string(),
                })
            });

        let sink = Arc::new(RecordingSink::default());
        let (manager, _shutdown) = manager(mock, Arc::clone(&sink), Duration::from_secs(10));

        manager.track(exit_order("9", 5)).await;
        assert_eq!(manager.check_once().await, 1);
        assert_eq!(manager.check_once().await, 1);
        // Third consecutive error reaches MAX_RETRIES
        assert_eq!(manager.check_once().await, 0);
        assert_eq!(sink.events(), vec!["failed:9:Failed".to_string()]);
    }

    #[tokio::test]
    async fn monitor_runs_while_orders_pending_and_parks_when_drained() {
        let mut mock = MockExchangeClient::new();
        let mut polls = 0u32;
        mock.expect_get_order().returning(move |_, _, _| {
            polls += 1;
            if polls < 3 {
                Ok(OrderState {
                    status: ExchangeOrderStatus::New,
                    executed_qty: Decimal::ZERO,
                    avg_price: None,
                    cummulative_quote_qty: None,
                })
            } else {
                Ok(filled_state())
            }
        });

        let sink = Arc::new(RecordingSink::default());
        let (manager, _shutdown) = manager(mock, Arc::clone(&sink), Duration::from_millis(10));

        manager.track(exit_order("5", 1)).await;
        assert!(manager.monitor_running());

        // Give the loop time to poll to the fill and park itself
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.pending_count().await, 0);
        assert!(!manager.monitor_running());
        assert_eq!(sink.events(), vec!["sell_filled:5".to_string()]);
    }
}
