pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::ScanSettings;
use crate::error::EngineResult;
use crate::types::{
    LivePosition, OptedOutCombination, ScannerStats, Session, Strategy, Trade, TradingMode,
};

/// Typed persistence surface. The SQLite store is the production
/// implementation; tests substitute a mock.
///
/// Signature uniqueness on strategies is enforced by filter-before-insert
/// (`strategy_signature_exists`), not by the store itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    // Strategies
    async fn list_strategies(&self) -> EngineResult<Vec<Strategy>>;
    async fn get_strategy(&self, id: &str) -> EngineResult<Option<Strategy>>;
    async fn create_strategy(&self, strategy: &Strategy) -> EngineResult<String>;
    async fn update_strategy(&self, strategy: &Strategy) -> EngineResult<()>;
    async fn delete_strategy(&self, id: &str) -> EngineResult<()>;
    async fn strategy_signature_exists(&self, signature: &str) -> EngineResult<bool>;

    // Positions
    async fn list_positions(&self, mode: TradingMode) -> EngineResult<Vec<LivePosition>>;
    async fn create_position(&self, position: &LivePosition) -> EngineResult<()>;
    async fn update_position(&self, position: &LivePosition) -> EngineResult<()>;
    async fn delete_position(&self, position_id: &str) -> EngineResult<()>;

    // Trades
    async fn create_trade(&self, trade: &Trade) -> EngineResult<()>;
    async fn list_trades_for_strategy(&self, strategy_id: &str) -> EngineResult<Vec<Trade>>;

    // Session / leadership. All three mutate the single session row via
    // compare-and-swap on the leader id.
    async fn load_session(&self) -> EngineResult<Session>;
    async fn try_acquire_leadership(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        timeout_secs: i64,
    ) -> EngineResult<bool>;
    async fn heartbeat_leader(&self, session_id: &str, now: DateTime<Utc>) -> EngineResult<bool>;
    async fn release_leadership(&self, session_id: &str) -> EngineResult<()>;

    // Settings
    async fn load_settings(&self) -> EngineResult<Option<ScanSettings>>;
    async fn save_settings(&self, settings: &ScanSettings) -> EngineResult<()>;

    // Scanner stats
    async fn load_stats(&self, mode: TradingMode) -> EngineResult<Option<ScannerStats>>;
    async fn upsert_stats(&self, stats: &ScannerStats) -> EngineResult<()>;

    // Opt-out registry
    async fn list_opted_out(&self) -> EngineResult<Vec<OptedOutCombination>>;
    async fn create_opted_out(&self, entry: &OptedOutCombination) -> EngineResult<()>;
}
