use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ScanSettings;
use crate::error::{EngineError, EngineResult};
use crate::exchange::{ExchangeClient, OrderState, OrderType, Wallet};
use crate::notifications::{AlertType, Notifier};
use crate::prices::PriceCache;
use crate::scanner::activity::{ActivityLevel, ActivityLog};
use crate::scanner::pending::FillSink;
use crate::storage::Store;
use crate::types::{
    ExitReason, LivePosition, OrderMetadata, PendingOrder, PendingOrderOutcome, PositionStatus,
    Side, SignalDirection, SignalMatch, Strategy, Trade, TradingMode,
};

/// Exchange minimum notional for one order.
pub const MINIMUM_TRADE_VALUE: Decimal = dec!(10);

/// ATR-adaptive sizing result.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedPosition {
    pub quantity: Decimal,
    pub position_value: Decimal,
    pub risk_amount: Decimal,
    pub stop_loss_distance: Decimal,
    pub take_profit_distance: Decimal,
    pub reward_risk_ratio: f64,
}

/// Risk-based sizing: the quantity that loses exactly `risk_percentage` of
/// the balance when the stop is hit. Position value is hard-capped at the
/// balance; a non-positive ATR falls back to a 2% price stop.
pub fn atr_position_size(
    balance: Decimal,
    risk_percentage: f64,
    stop_loss_atr_multiplier: f64,
    take_profit_atr_multiplier: f64,
    atr: f64,
    price: Decimal,
) -> SizedPosition {
    let risk_pct = Decimal::try_from(risk_percentage).unwrap_or(Decimal::ONE);
    let risk_amount = balance * risk_pct / dec!(100);

    let atr_dec = Decimal::try_from(atr.max(0.0)).unwrap_or(Decimal::ZERO);
    let stop_loss_distance = if atr_dec > Decimal::ZERO {
        atr_dec * Decimal::try_from(stop_loss_atr_multiplier).unwrap_or(Decimal::ONE)
    } else {
        price * dec!(0.02)
    };

    let mut quantity = if stop_loss_distance.is_zero() {
        Decimal::ZERO
    } else {
        risk_amount / stop_loss_distance
    };
    let mut position_value = quantity * price;
    if position_value > balance && !price.is_zero() {
        quantity = balance / price;
        position_value = balance;
    }

    let take_profit_distance = if atr_dec > Decimal::ZERO {
        atr_dec * Decimal::try_from(take_profit_atr_multiplier).unwrap_or(Decimal::TWO)
    } else {
        stop_loss_distance * dec!(2)
    };

    let reward_risk_ratio = if stop_loss_distance.is_zero() {
        0.0
    } else {
        let tp: f64 = take_profit_distance.try_into().unwrap_or(0.0);
        let sl: f64 = stop_loss_distance.try_into().unwrap_or(1.0);
        tp / sl
    };

    SizedPosition {
        quantity,
        position_value,
        risk_amount,
        stop_loss_distance,
        take_profit_distance,
        reward_risk_ratio,
    }
}

/// Owns the in-memory open-position list (the single source of truth) and
/// converts detection matches into orders and exits into trades.
pub struct PositionManager {
    positions: Mutex<Vec<LivePosition>>,
    store: Arc<dyn Store>,
    exchange: Arc<dyn ExchangeClient>,
    prices: PriceCache,
    notifier: Arc<dyn Notifier>,
    activity: Arc<ActivityLog>,
}

impl PositionManager {
    pub fn new(
        store: Arc<dyn Store>,
        exchange: Arc<dyn ExchangeClient>,
        prices: PriceCache,
        notifier: Arc<dyn Notifier>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            positions: Mutex::new(Vec::new()),
            store,
            exchange,
            prices,
            notifier,
            activity,
        }
    }

    /// Rehydrate open positions from the store on start/restart.
    pub async fn load_from_store(&self, mode: TradingMode) -> EngineResult<usize> {
        let stored = self.store.list_positions(mode).await?;
        let mut positions = self.positions.lock().await;
        *positions = stored;
        Ok(positions.len())
    }

    pub async fn open_positions(&self) -> Vec<LivePosition> {
        self.positions
            .lock()
            .await
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect()
    }

    pub async fn open_count(&self) -> usize {
        self.positions
            .lock()
            .await
            .iter()
            .filter(|p| matches!(p.status, PositionStatus::Open | PositionStatus::Closing))
            .count()
    }

    /// Wipe the in-memory list after persisting closure intent for anything
    /// still open (hard reset path).
    pub async fn clear_in_memory(&self) -> EngineResult<usize> {
        let mut positions = self.positions.lock().await;
        for position in positions.iter_mut() {
            if position.status == PositionStatus::Open {
                position.status = PositionStatus::Closing;
                self.store.update_position(position).await?;
            }
        }
        let n = positions.len();
        positions.clear();
        Ok(n)
    }

    /// Open path: admission guards, sizing, stop/take levels, MARKET BUY.
    /// Returns the pending order to track, or None when a guard rejects.
    pub async fn open_for_match(
        &self,
        strategy: &Strategy,
        signal: &SignalMatch,
        wallet: &Wallet,
        settings: &ScanSettings,
        mode: TradingMode,
        atr: f64,
        conviction_score: f64,
    ) -> EngineResult<Option<PendingOrder>> {
        let open_now = self.open_count().await;
        if open_now >= settings.max_positions {
            debug!(
                coin = %signal.coin,
                open = open_now,
                max = settings.max_positions,
                "max positions reached"
            );
            return Ok(None);
        }

        let floor = settings.default_position_size.max(MINIMUM_TRADE_VALUE);
        if wallet.available_balance < floor {
            debug!(coin = %signal.coin, "insufficient balance for new position");
            return Ok(None);
        }

        // One outstanding order per coin per strategy
        if self
            .positions
            .lock()
            .await
            .iter()
            .any(|p| p.coin == signal.coin && p.strategy_id == strategy.id)
        {
            debug!(coin = %signal.coin, "strategy already holds this coin");
            return Ok(None);
        }

        let price = signal.price;
        let sized = if settings.use_win_strategy_size {
            atr_position_size(
                wallet.available_balance,
                strategy.risk_percentage,
                strategy.stop_loss_atr_multiplier,
                strategy.take_profit_atr_multiplier,
                atr,
                price,
            )
        } else {
            let value = settings.default_position_size.min(wallet.available_balance);
            let quantity = if price.is_zero() {
                Decimal::ZERO
            } else {
                value / price
            };
            SizedPosition {
                quantity,
                position_value: value,
                risk_amount: value,
                stop_loss_distance: price * dec!(0.02),
                take_profit_distance: price * dec!(0.04),
                reward_risk_ratio: 2.0,
            }
        };

        if sized.position_value < MINIMUM_TRADE_VALUE || sized.quantity.is_zero() {
            debug!(coin = %signal.coin, "sized position below exchange minimum");
            return Ok(None);
        }

        let stop_loss_price = price - sized.stop_loss_distance;
        let take_profit_price = price + sized.take_profit_distance;

        let ack = match self
            .exchange
            .create_order(mode, &signal.coin, Side::Buy, OrderType::Market, sized.quantity, None)
            .await
        {
            Ok(ack) => ack,
            Err(EngineError::ExchangeRejection(reason)) => {
                self.notifier
                    .notify(AlertType::OrderRejected {
                        coin: signal.coin.clone(),
                        side: Side::Buy,
                        reason: reason.clone(),
                    })
                    .await;
                self.activity.add(
                    ActivityLevel::Error,
                    format!("BUY {} rejected: {}", signal.coin, reason),
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        info!(
            coin = %signal.coin,
            strategy = %strategy.name(),
            quantity = %sized.quantity,
            price = %price,
            "entry order submitted"
        );
        self.activity.add_with_data(
            ActivityLevel::Trade,
            format!(
                "BUY {} {} @ ~{} ({})",
                sized.quantity, signal.coin, price, strategy.name()
            ),
            Some(serde_json::json!({
                "order_id": ack.order_id,
                "combined_strength": signal.combined_strength,
            })),
        );

        Ok(Some(PendingOrder::new(
            ack.order_id,
            signal.coin.clone(),
            Side::Buy,
            sized.quantity,
            price,
            mode,
            Utc::now(),
            OrderMetadata::Entry {
                strategy_id: strategy.id.clone(),
                strategy_name: strategy.name().to_string(),
                signal: signal.clone(),
                atr,
                conviction_score,
                market_regime: signal.market_regime,
                wallet_id: "spot".to_string(),
                stop_loss_price,
                take_profit_price,
                enable_trailing_take_profit: strategy.enable_trailing_take_profit,
                trailing_stop_percentage: strategy.trailing_stop_percentage,
                estimated_exit_time_minutes: strategy.estimated_exit_time_minutes,
            },
        )))
    }

    /// Monitor path: refresh price, advance trailing stop, fire the first
    /// applicable exit. Returns exit orders for the pending-order manager to
    /// track.
    pub async fn monitor_all(
        &self,
        mode: TradingMode,
    ) -> EngineResult<Vec<PendingOrder>> {
        let now = Utc::now();
        let mut exits = Vec::new();
        let mut positions = self.positions.lock().await;

        for position in positions.iter_mut() {
            if position.status != PositionStatus::Open {
                continue;
            }

            // Exit checks only run against a just-refreshed price; a failed
            // refresh skips the position until the next cycle.
            let price = match self.prices.get_price(&position.coin, mode).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(coin = %position.coin, "price refresh failed: {}", e);
                    continue;
                }
            };
            position.update_price(price, now);

            if position.enable_trailing_take_profit {
                let trail_pct = Decimal::try_from(position.trailing_stop_percentage)
                    .unwrap_or(Decimal::ONE);
                let trail_level =
                    position.max_price_seen * (Decimal::ONE - trail_pct / dec!(100));
                if trail_level > position.stop_loss_price {
                    position.stop_loss_price = trail_level;
                }
            }

            // With trailing enabled the advancing stop replaces the fixed
            // take-profit; profit is banked when price falls off its peak.
            let exit_reason = if price <= position.stop_loss_price {
                Some(ExitReason::StopLoss)
            } else if !position.enable_trailing_take_profit
                && price >= position.take_profit_price
            {
                Some(ExitReason::TakeProfit)
            } else if position.holding_minutes(now) >= position.estimated_exit_time_minutes {
                Some(ExitReason::TimeExit)
            } else {
                None
            };

            let Some(reason) = exit_reason else {
                self.store.update_position(position).await.ok();
                continue;
            };

            position.status = PositionStatus::Closing;
            self.store.update_position(position).await?;

            let ack = match self
                .exchange
                .create_order(
                    mode,
                    &position.coin,
                    Side::Sell,
                    OrderType::Market,
                    position.quantity,
                    None,
                )
                .await
            {
                Ok(ack) => ack,
                Err(e) => {
                    // The position stays open and the next tick retries
                    warn!(coin = %position.coin, "exit order failed: {}", e);
                    position.status = PositionStatus::Open;
                    self.store.update_position(position).await?;
                    if let EngineError::ExchangeRejection(reason) = &e {
                        self.notifier
                            .notify(AlertType::OrderRejected {
                                coin: position.coin.clone(),
                                side: Side::Sell,
                                reason: reason.clone(),
                            })
                            .await;
                    }
                    continue;
                }
            };

            info!(
                coin = %position.coin,
                reason = %reason,
                price = %price,
                "exit order submitted"
            );
            self.activity.add(
                ActivityLevel::Trade,
                format!("SELL {} {} ({})", position.quantity, position.coin, reason),
            );

            exits.push(PendingOrder::new(
                ack.order_id,
                position.coin.clone(),
                Side::Sell,
                position.quantity,
                price,
                mode,
                now,
                OrderMetadata::Exit {
                    position_id: position.position_id.clone(),
                    exit_reason: reason,
                },
            ));
        }

        Ok(exits)
    }
}

#[async_trait]
impl FillSink for PositionManager {
    /// BUY fill: materialize the position from the order metadata.
    async fn on_buy_filled(&self, order: &PendingOrder, state: &OrderState) {
        let OrderMetadata::Entry {
            strategy_id,
            strategy_name,
            signal,
            atr,
            conviction_score,
            market_regime,
            wallet_id,
            stop_loss_price,
            take_profit_price,
            enable_trailing_take_profit,
            trailing_stop_percentage,
            estimated_exit_time_minutes,
        } = &order.metadata
        else {
            warn!(order_id = %order.order_id, "buy fill without entry metadata");
            return;
        };

        let entry_price = state.fill_price().unwrap_or(order.price);
        let quantity = if state.executed_qty.is_zero() {
            order.quantity
        } else {
            state.executed_qty
        };
        let now = Utc::now();

        let position = LivePosition {
            position_id: Uuid::new_v4().to_string(),
            strategy_id: strategy_id.clone(),
            strategy_name: strategy_name.clone(),
            coin: order.coin.clone(),
            direction: SignalDirection::Long,
            entry_price,
            current_price: entry_price,
            quantity,
            entry_value: entry_price * quantity,
            entry_time: now,
            status: PositionStatus::Open,
            atr_at_entry: *atr,
            stop_loss_price: *stop_loss_price,
            take_profit_price: *take_profit_price,
            max_price_seen: entry_price,
            enable_trailing_take_profit: *enable_trailing_take_profit,
            trailing_stop_percentage: *trailing_stop_percentage,
            estimated_exit_time_minutes: *estimated_exit_time_minutes,
            wallet_id: wallet_id.clone(),
            trading_mode: order.trading_mode,
            exchange_order_id: order.order_id.clone(),
            conviction_score: *conviction_score,
            market_regime: *market_regime,
            trigger_signals: signal.specs(),
            last_price_update: now,
        };

        if let Err(e) = self.store.create_position(&position).await {
            warn!(coin = %order.coin, "failed to persist filled position: {}", e);
            return;
        }
        self.positions.lock().await.push(position.clone());

        self.notifier
            .notify(AlertType::PositionOpened {
                coin: order.coin.clone(),
                quantity,
                entry_price,
            })
            .await;
        self.activity.add(
            ActivityLevel::Success,
            format!("position opened: {} {} @ {}", quantity, order.coin, entry_price),
        );
    }

    /// SELL fill: convert the position into a terminal trade record.
    async fn on_sell_filled(&self, order: &PendingOrder, state: &OrderState) {
        let OrderMetadata::Exit {
            position_id,
            exit_reason,
        } = &order.metadata
        else {
            warn!(order_id = %order.order_id, "sell fill without exit metadata");
            return;
        };

        let position = {
            let mut positions = self.positions.lock().await;
            match positions.iter().position(|p| &p.position_id == position_id) {
                Some(idx) => positions.remove(idx),
                None => {
                    warn!(position_id = %position_id, "sell fill for unknown position");
                    return;
                }
            }
        };

        let exit_price = state.fill_price().unwrap_or(order.price);
        let trade =
            Trade::from_closed_position(&position, exit_price, Utc::now(), *exit_reason, Decimal::ZERO);

        if let Err(e) = self.store.create_trade(&trade).await {
            warn!(coin = %position.coin, "failed to persist trade: {}", e);
        }
        if let Err(e) = self.store.delete_position(position_id).await {
            warn!(position_id = %position_id, "failed to delete closed position: {}", e);
        }

        self.notifier
            .notify(AlertType::PositionClosed {
                coin: position.coin.clone(),
                pnl: trade.pnl,
                pnl_pct: trade.pnl_percentage,
                reason: exit_reason.as_str().to_string(),
            })
            .await;
        self.activity.add_with_data(
            ActivityLevel::Trade,
            format!(
                "position closed: {} pnl {} ({}%)",
                position.coin, trade.pnl, trade.pnl_percentage
            ),
            Some(serde_json::json!({"exit_reason": exit_reason.as_str()})),
        );
    }

    /// Order failure. Entry failures leave no position behind; exit failures
    /// reopen the position so the next monitor tick can retry.
    async fn on_order_failed(&self, order: &PendingOrder, outcome: PendingOrderOutcome) {
        match &order.metadata {
            OrderMetadata::Entry { strategy_name, .. } => {
                self.activity.add(
                    ActivityLevel::Warning,
                    format!(
                        "entry order {} for {} failed ({:?})",
                        order.order_id, strategy_name, outcome
                    ),
                );
            }
            OrderMetadata::Exit { position_id, .. } => {
                let mut positions = self.positions.lock().await;
                if let Some(position) = positions
                    .iter_mut()
                    .find(|p| &p.position_id == position_id)
                {
                    position.status = PositionStatus::Open;
                    self.store.update_position(position).await.ok();
                }
                self.activity.add(
                    ActivityLevel::Warning,
                    format!(
                        "exit order {} failed ({:?}), position reopened",
                        order.order_id, outcome
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_amount_and_quantity_follow_the_formula() {
        let sized = atr_position_size(dec!(10000), 1.0, 1.5, 3.0, 2.0, dec!(100));
        // risk = 100, stop distance = 3, qty = 33.33..
        assert_eq!(sized.risk_amount, dec!(100));
        assert_eq!(sized.stop_loss_distance, dec!(3.0));
        assert!((sized.reward_risk_ratio - 2.0).abs() < 1e-9);
        let expected_qty = dec!(100) / dec!(3.0);
        assert_eq!(sized.quantity, expected_qty);
    }

    #[test]
    fn position_value_is_capped_at_balance() {
        // Tiny stop distance would size far beyond the balance
        let sized = atr_position_size(dec!(1000), 5.0, 1.0, 2.0, 0.01, dec!(100));
        assert!(sized.position_value <= dec!(1000));
        assert_eq!(sized.quantity, dec!(10));
    }

    #[test]
    fn zero_atr_falls_back_to_percent_stop() {
        let sized = atr_position_size(dec!(1000), 1.0, 1.5, 3.0, 0.0, dec!(200));
        // 2% of 200 = 4
        assert_eq!(sized.stop_loss_distance, dec!(4.00));
        assert_eq!(sized.take_profit_distance, dec!(8.00));
        assert!((sized.reward_risk_ratio - 2.0).abs() < 1e-9);
    }

    #[test]
    fn risk_never_exceeds_the_configured_percentage() {
        let balance = dec!(5000);
        let sized = atr_position_size(balance, 2.0, 2.0, 4.0, 1.5, dec!(50));
        assert_eq!(sized.risk_amount, balance * dec!(2) / dec!(100));
    }
}
