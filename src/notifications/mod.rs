#![allow(dead_code)]
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::types::{Side, TradingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Operator-facing alerts. Transport is external; this module renders and
/// fans them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AlertType {
    ScannerStarted {
        mode: TradingMode,
    },
    ScannerStopped,
    LeadershipAcquired {
        session_id: String,
    },
    LeadershipDenied,
    LeadershipLost {
        reason: String,
    },
    PositionOpened {
        coin: String,
        quantity: Decimal,
        entry_price: Decimal,
    },
    PositionClosed {
        coin: String,
        pnl: Decimal,
        pnl_pct: Decimal,
        reason: String,
    },
    OrderRejected {
        coin: String,
        side: Side,
        reason: String,
    },
    StoreUnavailable {
        consecutive_failures: u32,
    },
}

impl AlertType {
    pub fn severity(&self) -> Severity {
        match self {
            AlertType::ScannerStarted { .. }
            | AlertType::ScannerStopped
            | AlertType::LeadershipAcquired { .. }
            | AlertType::PositionOpened { .. }
            | AlertType::PositionClosed { .. } => Severity::Info,
            AlertType::LeadershipDenied | AlertType::OrderRejected { .. } => Severity::Warning,
            AlertType::LeadershipLost { .. } | AlertType::StoreUnavailable { .. } => {
                Severity::Critical
            }
        }
    }

    pub fn message(&self) -> String {
        match self {
            AlertType::ScannerStarted { mode } => format!("scanner started in {} mode", mode),
            AlertType::ScannerStopped => "scanner stopped".to_string(),
            AlertType::LeadershipAcquired { session_id } => {
                format!("session {} is now leader", session_id)
            }
            AlertType::LeadershipDenied => {
                "another session is already leading the scanner".to_string()
            }
            AlertType::LeadershipLost { reason } => format!("leadership lost: {}", reason),
            AlertType::PositionOpened {
                coin,
                quantity,
                entry_price,
            } => format!("opened {} {} @ {}", quantity, coin, entry_price),
            AlertType::PositionClosed {
                coin,
                pnl,
                pnl_pct,
                reason,
            } => format!("closed {} pnl {} ({}%) via {}", coin, pnl, pnl_pct, reason),
            AlertType::OrderRejected { coin, side, reason } => {
                format!("{} {} rejected: {}", side, coin, reason)
            }
            AlertType::StoreUnavailable {
                consecutive_failures,
            } => format!("store unavailable ({} consecutive failures)", consecutive_failures),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub alert: AlertType,
}

/// Side-channel notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: AlertType);
}

/// Default notifier: structured log line per alert plus a broadcast channel
/// any consumer can subscribe to.
pub struct NotificationManager {
    tx: broadcast::Sender<Notification>,
}

impl NotificationManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for NotificationManager {
    async fn notify(&self, alert: AlertType) {
        let severity = alert.severity();
        let message = alert.message();
        match severity {
            Severity::Info => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Critical => error!("{}", message),
        }
        let _ = self.tx.send(Notification {
            timestamp: Utc::now(),
            severity,
            message,
            alert,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn notify_reaches_subscribers() {
        let manager = NotificationManager::new();
        let mut rx = manager.subscribe();
        manager
            .notify(AlertType::PositionOpened {
                coin: "BTCUSDT".to_string(),
                quantity: dec!(0.5),
                entry_price: dec!(50000),
            })
            .await;
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.severity, Severity::Info);
        assert!(notification.message.contains("BTCUSDT"));
    }

    #[test]
    fn severities_map_by_alert_class() {
        assert_eq!(AlertType::ScannerStopped.severity(), Severity::Info);
        assert_eq!(AlertType::LeadershipDenied.severity(), Severity::Warning);
        assert_eq!(
            AlertType::LeadershipLost {
                reason: "takeover".to_string()
            }
            .severity(),
            Severity::Critical
        );
    }
}
