use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::config::ScanSettings;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    ExitReason, LivePosition, MarketRegime, OptedOutCombination, ScannerStats, Session,
    SignalDirection, SignalSpec, Strategy, Trade, TradingMode,
};

use super::Store;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(db_path: &str) -> EngineResult<Self> {
        info!("initializing SQLite store at {}", db_path);

        let options = SqliteConnectOptions::from_str(db_path)
            .map_err(|e| EngineError::Config(format!("bad database path: {}", e)))?
            .create_if_missing(true);

        // An in-memory database is per-connection; a pool bigger than one
        // would hand out empty databases
        let max_connections = if db_path.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                combination_signature TEXT NOT NULL,
                coin TEXT NOT NULL,
                included_in_scanner INTEGER NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_strategies_signature ON strategies(combination_signature)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                position_id TEXT PRIMARY KEY,
                coin TEXT NOT NULL,
                trading_mode TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                strategy_name TEXT NOT NULL,
                coin TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                pnl TEXT NOT NULL,
                pnl_percentage TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                trigger_signals TEXT NOT NULL,
                conviction_score REAL NOT NULL,
                market_regime TEXT NOT NULL,
                fees_paid TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_strategy ON trades(strategy_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                leader_session_id TEXT,
                last_heartbeat TEXT NOT NULL,
                is_globally_active INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // The session table holds exactly one row
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO session (id, leader_session_id, last_heartbeat, is_globally_active)
            VALUES (1, NULL, '1970-01-01T00:00:00Z', 0)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scanner_stats (
                mode TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS opted_out_combinations (
                signature TEXT NOT NULL,
                coin TEXT,
                opted_out_at TEXT NOT NULL,
                PRIMARY KEY (signature, coin)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn parse_decimal(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap_or(Decimal::ZERO)
    }

    fn parse_time(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_strategies(&self) -> EngineResult<Vec<Strategy>> {
        let rows = sqlx::query("SELECT payload FROM strategies")
            .fetch_all(&self.pool)
            .await?;
        let mut strategies = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            strategies.push(serde_json::from_str(&payload)?);
        }
        Ok(strategies)
    }

    async fn get_strategy(&self, id: &str) -> EngineResult<Option<Strategy>> {
        let row = sqlx::query("SELECT payload FROM strategies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn create_strategy(&self, strategy: &Strategy) -> EngineResult<String> {
        let payload = serde_json::to_string(strategy)?;
        sqlx::query(
            r#"
            INSERT INTO strategies (id, combination_signature, coin, included_in_scanner, payload)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&strategy.id)
        .bind(strategy.signature())
        .bind(strategy.coin())
        .bind(strategy.included_in_scanner as i64)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(strategy.id.clone())
    }

    async fn update_strategy(&self, strategy: &Strategy) -> EngineResult<()> {
        let payload = serde_json::to_string(strategy)?;
        let result = sqlx::query(
            "UPDATE strategies SET combination_signature = ?, coin = ?, included_in_scanner = ?, payload = ? WHERE id = ?",
        )
        .bind(strategy.signature())
        .bind(strategy.coin())
        .bind(strategy.included_in_scanner as i64)
        .bind(payload)
        .bind(&strategy.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::Consistency(format!(
                "strategy {} not found for update",
                strategy.id
            )));
        }
        Ok(())
    }

    async fn delete_strategy(&self, id: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM strategies WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn strategy_signature_exists(&self, signature: &str) -> EngineResult<bool> {
        let row =
            sqlx::query("SELECT COUNT(*) as n FROM strategies WHERE combination_signature = ?")
                .bind(signature)
                .fetch_one(&self.pool)
                .await?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }

    async fn list_positions(&self, mode: TradingMode) -> EngineResult<Vec<LivePosition>> {
        let rows = sqlx::query("SELECT payload FROM positions WHERE trading_mode = ?")
            .bind(mode.as_str())
            .fetch_all(&self.pool)
            .await?;
        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            positions.push(serde_json::from_str(&payload)?);
        }
        Ok(positions)
    }

    async fn create_position(&self, position: &LivePosition) -> EngineResult<()> {
        let payload = serde_json::to_string(position)?;
        sqlx::query(
            r#"
            INSERT INTO positions (position_id, coin, trading_mode, status, payload)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.position_id)
        .bind(&position.coin)
        .bind(position.trading_mode.as_str())
        .bind(position.status.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_position(&self, position: &LivePosition) -> EngineResult<()> {
        let payload = serde_json::to_string(position)?;
        sqlx::query("UPDATE positions SET status = ?, payload = ? WHERE position_id = ?")
            .bind(position.status.as_str())
            .bind(payload)
            .bind(&position.position_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_position(&self, position_id: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM positions WHERE position_id = ?")
            .bind(position_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_trade(&self, trade: &Trade) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                trade_id, position_id, strategy_id, strategy_name, coin, direction,
                entry_price, exit_price, quantity, pnl, pnl_percentage,
                entry_time, exit_time, exit_reason, trigger_signals,
                conviction_score, market_regime, fees_paid
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.trade_id)
        .bind(&trade.position_id)
        .bind(&trade.strategy_id)
        .bind(&trade.strategy_name)
        .bind(&trade.coin)
        .bind(trade.direction.as_str())
        .bind(trade.entry_price.to_string())
        .bind(trade.exit_price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.pnl.to_string())
        .bind(trade.pnl_percentage.to_string())
        .bind(trade.entry_time.to_rfc3339())
        .bind(trade.exit_time.to_rfc3339())
        .bind(trade.exit_reason.as_str())
        .bind(serde_json::to_string(&trade.trigger_signals)?)
        .bind(trade.conviction_score)
        .bind(trade.market_regime.as_str())
        .bind(trade.fees_paid.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_trades_for_strategy(&self, strategy_id: &str) -> EngineResult<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE strategy_id = ? ORDER BY exit_time")
            .bind(strategy_id)
            .fetch_all(&self.pool)
            .await?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            let direction: String = row.get("direction");
            let exit_reason: String = row.get("exit_reason");
            let signals: String = row.get("trigger_signals");
            let regime: String = row.get("market_regime");
            let entry_time: String = row.get("entry_time");
            let exit_time: String = row.get("exit_time");

            trades.push(Trade {
                trade_id: row.get("trade_id"),
                position_id: row.get("position_id"),
                strategy_id: row.get("strategy_id"),
                strategy_name: row.get("strategy_name"),
                coin: row.get("coin"),
                direction: match direction.as_str() {
                    "short" => SignalDirection::Short,
                    "neutral" => SignalDirection::Neutral,
                    _ => SignalDirection::Long,
                },
                entry_price: Self::parse_decimal(row.get("entry_price")),
                exit_price: Self::parse_decimal(row.get("exit_price")),
                quantity: Self::parse_decimal(row.get("quantity")),
                pnl: Self::parse_decimal(row.get("pnl")),
                pnl_percentage: Self::parse_decimal(row.get("pnl_percentage")),
                entry_time: Self::parse_time(&entry_time),
                exit_time: Self::parse_time(&exit_time),
                exit_reason: match exit_reason.as_str() {
                    "take_profit" => ExitReason::TakeProfit,
                    "time_exit" => ExitReason::TimeExit,
                    "manual" => ExitReason::Manual,
                    _ => ExitReason::StopLoss,
                },
                trigger_signals: serde_json::from_str::<Vec<SignalSpec>>(&signals)
                    .unwrap_or_default(),
                conviction_score: row.get("conviction_score"),
                market_regime: MarketRegime::from_str(&regime),
                fees_paid: Self::parse_decimal(row.get("fees_paid")),
            });
        }
        Ok(trades)
    }

    async fn load_session(&self) -> EngineResult<Session> {
        let row = sqlx::query(
            "SELECT leader_session_id, last_heartbeat, is_globally_active FROM session WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let heartbeat: String = row.get("last_heartbeat");
                let active: i64 = row.get("is_globally_active");
                Ok(Session {
                    leader_session_id: row.get("leader_session_id"),
                    last_heartbeat: Self::parse_time(&heartbeat),
                    is_globally_active: active != 0,
                })
            }
            None => Ok(Session::inactive()),
        }
    }

    async fn try_acquire_leadership(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        timeout_secs: i64,
    ) -> EngineResult<bool> {
        let stale_cutoff = (now - chrono::Duration::seconds(timeout_secs)).to_rfc3339();
        // CAS: claim only when inactive, stale, or already ours
        let result = sqlx::query(
            r#"
            UPDATE session
            SET leader_session_id = ?, last_heartbeat = ?, is_globally_active = 1
            WHERE id = 1
              AND (is_globally_active = 0
                   OR last_heartbeat < ?
                   OR leader_session_id = ?)
            "#,
        )
        .bind(session_id)
        .bind(now.to_rfc3339())
        .bind(stale_cutoff)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat_leader(&self, session_id: &str, now: DateTime<Utc>) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE session
            SET last_heartbeat = ?
            WHERE id = 1 AND leader_session_id = ? AND is_globally_active = 1
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_leadership(&self, session_id: &str) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE session
            SET leader_session_id = NULL, is_globally_active = 0
            WHERE id = 1 AND leader_session_id = ?
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_settings(&self) -> EngineResult<Option<ScanSettings>> {
        let row = sqlx::query("SELECT payload FROM scan_settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn save_settings(&self, settings: &ScanSettings) -> EngineResult<()> {
        let payload = serde_json::to_string(settings)?;
        sqlx::query(
            r#"
            INSERT INTO scan_settings (id, payload) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET payload = excluded.payload
            "#,
        )
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_stats(&self, mode: TradingMode) -> EngineResult<Option<ScannerStats>> {
        let row = sqlx::query("SELECT payload FROM scanner_stats WHERE mode = ?")
            .bind(mode.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_stats(&self, stats: &ScannerStats) -> EngineResult<()> {
        let payload = serde_json::to_string(stats)?;
        sqlx::query(
            r#"
            INSERT INTO scanner_stats (mode, payload) VALUES (?, ?)
            ON CONFLICT(mode) DO UPDATE SET payload = excluded.payload
            "#,
        )
        .bind(stats.mode.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_opted_out(&self) -> EngineResult<Vec<OptedOutCombination>> {
        let rows = sqlx::query("SELECT signature, coin, opted_out_at FROM opted_out_combinations")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let at: String = row.get("opted_out_at");
                OptedOutCombination {
                    signature: row.get("signature"),
                    coin: row.get("coin"),
                    opted_out_at: Self::parse_time(&at),
                }
            })
            .collect())
    }

    async fn create_opted_out(&self, entry: &OptedOutCombination) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO opted_out_combinations (signature, coin, opted_out_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&entry.signature)
        .bind(&entry.coin)
        .bind(entry.opted_out_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        combination_signature, Combination, SignalCondition, SignalKind, SignalSpec, TimeFrame,
    };
    use std::collections::HashMap;

    async fn memory_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn sample_strategy() -> Strategy {
        let signals = vec![
            SignalSpec::new(SignalKind::Rsi, SignalCondition::OversoldEntry),
            SignalSpec::new(SignalKind::Macd, SignalCondition::BullishCross),
        ];
        let signature = combination_signature(&signals, TimeFrame::H1);
        Strategy::from_combination(Combination {
            signature,
            combination_name: Combination::derive_name(&signals, TimeFrame::H1),
            coin: "BTCUSDT".to_string(),
            timeframe: TimeFrame::H1,
            signals,
            occurrences: 12,
            success_rate: 75.0,
            net_average_price_move: 1.4,
            profit_factor: 2.2,
            dominant_market_regime: MarketRegime::Uptrend,
            market_regime_distribution: HashMap::new(),
            median_lowest_low: 0.6,
            avg_win_duration_minutes: Some(95.0),
            combined_strength: 160.0,
        })
    }

    #[tokio::test]
    async fn strategy_round_trip() {
        let store = memory_store().await;
        let strategy = sample_strategy();
        store.create_strategy(&strategy).await.unwrap();

        let loaded = store.get_strategy(&strategy.id).await.unwrap().unwrap();
        assert_eq!(loaded.signature(), strategy.signature());
        assert_eq!(loaded.combination.occurrences, 12);
        assert!(store
            .strategy_signature_exists(strategy.signature())
            .await
            .unwrap());
        assert!(!store.strategy_signature_exists("TF:1h|nope").await.unwrap());
    }

    #[tokio::test]
    async fn leadership_cas_single_winner() {
        let store = memory_store().await;
        let now = Utc::now();

        assert!(store.try_acquire_leadership("a", now, 30).await.unwrap());
        // Fresh heartbeat blocks a second instance
        assert!(!store.try_acquire_leadership("b", now, 30).await.unwrap());
        // Heartbeat only succeeds for the leader
        assert!(store.heartbeat_leader("a", now).await.unwrap());
        assert!(!store.heartbeat_leader("b", now).await.unwrap());

        // Stale heartbeat lets another instance take over
        let later = now + chrono::Duration::seconds(35);
        assert!(store.try_acquire_leadership("b", later, 30).await.unwrap());
        assert!(!store.heartbeat_leader("a", later).await.unwrap());

        let session = store.load_session().await.unwrap();
        assert_eq!(session.leader_session_id.as_deref(), Some("b"));
        assert!(session.is_globally_active);
    }

    #[tokio::test]
    async fn release_clears_only_own_leadership() {
        let store = memory_store().await;
        let now = Utc::now();
        store.try_acquire_leadership("a", now, 30).await.unwrap();

        store.release_leadership("b").await.unwrap();
        assert!(store.load_session().await.unwrap().is_globally_active);

        store.release_leadership("a").await.unwrap();
        let session = store.load_session().await.unwrap();
        assert!(!session.is_globally_active);
        assert!(session.leader_session_id.is_none());
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = memory_store().await;
        assert!(store.load_settings().await.unwrap().is_none());
        let settings = ScanSettings::default();
        store.save_settings(&settings).await.unwrap();
        let loaded = store.load_settings().await.unwrap().unwrap();
        assert_eq!(loaded.max_positions, settings.max_positions);
    }
}
