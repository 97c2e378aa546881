pub mod activity;
pub mod detection;
pub mod engine;
pub mod pending;
pub mod positions;
pub mod session;
pub mod strategy_manager;

pub use activity::{ActivityLevel, ActivityLog};
pub use detection::{CycleContext, SignalDetectionEngine};
pub use engine::{CycleReport, Scanner};
pub use pending::{FillSink, PendingOrderManager};
pub use positions::{atr_position_size, PositionManager, SizedPosition};
pub use session::SessionCoordinator;
pub use strategy_manager::{profitability_score, StrategyManager};

#[cfg(test)]
mod tests {
    use super::pending::FillSink;
    use super::*;
    use crate::exchange::{MockExchangeClient, OrderAck, OrderState};
    use crate::notifications::NotificationManager;
    use crate::prices::PriceCache;
    use crate::storage::MockStore;
    use crate::types::{
        ExchangeOrderStatus, ExitReason, LivePosition, MarketRegime, OrderMetadata,
        PendingOrder, PositionStatus, Side, SignalDirection, TradingMode,
    };
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn trailing_position() -> LivePosition {
        let now = Utc::now();
        LivePosition {
            position_id: "pos-trail".to_string(),
            strategy_id: "strat-1".to_string(),
            strategy_name: "trailing test".to_string(),
            coin: "BTCUSDT".to_string(),
            direction: SignalDirection::Long,
            entry_price: dec!(100),
            current_price: dec!(100),
            quantity: dec!(1),
            entry_value: dec!(100),
            entry_time: now,
            status: PositionStatus::Open,
            atr_at_entry: 2.0,
            stop_loss_price: dec!(97),
            take_profit_price: dec!(106),
            max_price_seen: dec!(100),
            enable_trailing_take_profit: true,
            trailing_stop_percentage: 1.0,
            estimated_exit_time_minutes: 10_000,
            wallet_id: "spot".to_string(),
            trading_mode: TradingMode::Testnet,
            exchange_order_id: "1".to_string(),
            conviction_score: 50.0,
            market_regime: MarketRegime::Uptrend,
            trigger_signals: Vec::new(),
            last_price_update: now,
        }
    }

    fn store_with_position(position: LivePosition) -> MockStore {
        let mut store = MockStore::new();
        store
            .expect_list_positions()
            .returning(move |_| Ok(vec![position.clone()]));
        store.expect_update_position().returning(|_| Ok(()));
        store
    }

    fn scripted_price_cache(prices: Vec<Decimal>) -> PriceCache {
        let mut mock = MockExchangeClient::new();
        let mut sequence = prices.into_iter();
        mock.expect_get_ticker_price_batch().returning(move |coins, _| {
            let price = sequence.next().expect("price script exhausted");
            let mut out = HashMap::new();
            for coin in coins {
                out.insert(coin.clone(), price);
            }
            Ok(out)
        });
        // Staleness zero forces a fetch per monitor tick
        PriceCache::with_timing(
            Arc::new(mock),
            Duration::ZERO,
            Duration::from_millis(1),
            Duration::ZERO,
        )
    }

    fn manager_with(
        store: MockStore,
        exchange: MockExchangeClient,
        prices: PriceCache,
    ) -> PositionManager {
        PositionManager::new(
            Arc::new(store),
            Arc::new(exchange),
            prices,
            Arc::new(NotificationManager::new()),
            Arc::new(ActivityLog::new()),
        )
    }

    #[tokio::test]
    async fn trailing_stop_advances_and_exits_as_stop_loss() {
        // Long at 100, ATR 2, stop 97, trailing 1%. Path 100 -> 108 -> 106:
        // the peak lifts the stop to 106.92, the pullback to 106 exits as a
        // stop-loss in profit.
        let mut exchange = MockExchangeClient::new();
        exchange
            .expect_create_order()
            .times(1)
            .returning(|_, _, side, _, _, _| {
                assert_eq!(side, Side::Sell);
                Ok(OrderAck {
                    order_id: "sell-1".to_string(),
                })
            });

        let manager = manager_with(
            store_with_position(trailing_position()),
            exchange,
            scripted_price_cache(vec![dec!(108), dec!(106)]),
        );
        manager.load_from_store(TradingMode::Testnet).await.unwrap();

        // Tick 1: peak at 108, no exit (fixed TP is disabled by trailing)
        let exits = manager.monitor_all(TradingMode::Testnet).await.unwrap();
        assert!(exits.is_empty());
        {
            let positions = manager.open_positions().await;
            assert_eq!(positions[0].max_price_seen, dec!(108));
            assert_eq!(positions[0].stop_loss_price, dec!(106.92));
        }

        // Tick 2: pullback to 106 trips the trailed stop
        let exits = manager.monitor_all(TradingMode::Testnet).await.unwrap();
        assert_eq!(exits.len(), 1);
        match &exits[0].metadata {
            OrderMetadata::Exit {
                position_id,
                exit_reason,
            } => {
                assert_eq!(position_id, "pos-trail");
                assert_eq!(*exit_reason, ExitReason::StopLoss);
            }
            _ => panic!("expected exit metadata"),
        }
        // Position is closing; no further exit order may be submitted
        assert!(manager.open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn sell_fill_converts_position_to_trade() {
        let mut store = store_with_position(trailing_position());
        store
            .expect_create_trade()
            .times(1)
            .withf(|trade| {
                trade.position_id == "pos-trail"
                    && trade.exit_reason == ExitReason::StopLoss
                    && trade.exit_price == dec!(106.92)
                    && trade.pnl > Decimal::ZERO
            })
            .returning(|_| Ok(()));
        store
            .expect_delete_position()
            .times(1)
            .returning(|_| Ok(()));

        let manager = manager_with(
            store,
            MockExchangeClient::new(),
            scripted_price_cache(vec![]),
        );
        manager.load_from_store(TradingMode::Testnet).await.unwrap();

        let order = PendingOrder::new(
            "sell-1".to_string(),
            "BTCUSDT".to_string(),
            Side::Sell,
            dec!(1),
            dec!(106),
            TradingMode::Testnet,
            Utc::now(),
            OrderMetadata::Exit {
                position_id: "pos-trail".to_string(),
                exit_reason: ExitReason::StopLoss,
            },
        );
        let state = OrderState {
            status: ExchangeOrderStatus::Filled,
            executed_qty: dec!(1),
            avg_price: Some(dec!(106.92)),
            cummulative_quote_qty: None,
        };
        manager.on_sell_filled(&order, &state).await;
        assert!(manager.open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn failed_exit_order_reopens_the_position() {
        let manager = manager_with(
            store_with_position(trailing_position()),
            MockExchangeClient::new(),
            scripted_price_cache(vec![]),
        );
        manager.load_from_store(TradingMode::Testnet).await.unwrap();

        // Force the closing state, then report the exit order failed
        {
            let positions = manager.open_positions().await;
            assert_eq!(positions.len(), 1);
        }
        let order = PendingOrder::new(
            "sell-9".to_string(),
            "BTCUSDT".to_string(),
            Side::Sell,
            dec!(1),
            dec!(106),
            TradingMode::Testnet,
            Utc::now(),
            OrderMetadata::Exit {
                position_id: "pos-trail".to_string(),
                exit_reason: ExitReason::StopLoss,
            },
        );
        manager
            .on_order_failed(&order, crate::types::PendingOrderOutcome::Failed)
            .await;
        let positions = manager.open_positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn buy_fill_creates_open_position_with_consistent_levels() {
        let mut store = MockStore::new();
        store.expect_create_position().times(1).returning(|_| Ok(()));

        let manager = manager_with(store, MockExchangeClient::new(), scripted_price_cache(vec![]));

        let signal = crate::types::SignalMatch {
            coin: "ETHUSDT".to_string(),
            timeframe: crate::types::TimeFrame::H1,
            candle_time: Utc::now(),
            price: dec!(3000),
            signals: Vec::new(),
            combined_strength: 150.0,
            market_regime: MarketRegime::Uptrend,
            direction: SignalDirection::Long,
            future_price_move: None,
            future_max_drawdown: None,
            successful: None,
            time_to_peak_minutes: None,
            win_duration_minutes: None,
        };
        let order = PendingOrder::new(
            "buy-1".to_string(),
            "ETHUSDT".to_string(),
            Side::Buy,
            dec!(0.5),
            dec!(3000),
            TradingMode::Testnet,
            Utc::now(),
            OrderMetadata::Entry {
                strategy_id: "strat-2".to_string(),
                strategy_name: "eth entry".to_string(),
                signal,
                atr: 20.0,
                conviction_score: 60.0,
                market_regime: MarketRegime::Uptrend,
                wallet_id: "spot".to_string(),
                stop_loss_price: dec!(2970),
                take_profit_price: dec!(3060),
                enable_trailing_take_profit: false,
                trailing_stop_percentage: 1.0,
                estimated_exit_time_minutes: 240,
            },
        );
        let state = OrderState {
            status: ExchangeOrderStatus::Filled,
            executed_qty: dec!(0.5),
            avg_price: Some(dec!(3001)),
            cummulative_quote_qty: None,
        };
        manager.on_buy_filled(&order, &state).await;

        let positions = manager.open_positions().await;
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.status, PositionStatus::Open);
        assert_eq!(p.entry_price, dec!(3001));
        assert!(p.quantity > Decimal::ZERO);
        assert!(p.exit_levels_consistent());
    }
}
