use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::settings::{MAX_SCAN_FREQUENCY_MS, MIN_SCAN_FREQUENCY_MS};
use crate::config::SettingsManager;
use crate::error::{EngineError, EngineResult};
use crate::exchange::{ExchangeClient, Wallet};
use crate::notifications::{AlertType, Notifier};
use crate::prices::{PriceCache, COORDINATOR_INTERVAL};
use crate::storage::Store;
use crate::types::{ScannerStats, TradingMode};

use super::activity::{ActivityLevel, ActivityLog};
use super::detection::{CycleContext, SignalDetectionEngine};
use super::pending::PendingOrderManager;
use super::positions::PositionManager;
use super::session::SessionCoordinator;
use super::strategy_manager::StrategyManager;

/// Consecutive store failures tolerated before the scanner declares the
/// store gone and stops.
const MAX_STORE_FAILURES: u32 = 5;

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub strategies_scanned: u64,
    pub signals_found: u64,
    pub trades_executed: u64,
    pub elapsed_ms: f64,
    pub average_signal_strength: f64,
}

/// The session leader's scan-cycle scheduler: one task per process, driving
/// strategy evaluation, position monitoring and order tracking.
pub struct Scanner {
    store: Arc<dyn Store>,
    exchange: Arc<dyn ExchangeClient>,
    prices: PriceCache,
    pub strategies: Arc<StrategyManager>,
    detection: Arc<SignalDetectionEngine>,
    pub positions: Arc<PositionManager>,
    pending: Arc<PendingOrderManager>,
    notifier: Arc<dyn Notifier>,
    pub activity: Arc<ActivityLog>,
    pub settings: Arc<SettingsManager>,
    session: Arc<SessionCoordinator>,

    mode: RwLock<TradingMode>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    stats: Mutex<ScannerStats>,
    wallet: RwLock<Wallet>,
    conviction_score: RwLock<Option<f64>>,
    strategies_stale: AtomicBool,
    store_failures: AtomicU32,
    active_coins: Arc<std::sync::RwLock<Vec<String>>>,
    price_subscription: Mutex<Option<crate::prices::Subscription>>,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        exchange: Arc<dyn ExchangeClient>,
        prices: PriceCache,
        strategies: Arc<StrategyManager>,
        detection: Arc<SignalDetectionEngine>,
        positions: Arc<PositionManager>,
        pending: Arc<PendingOrderManager>,
        notifier: Arc<dyn Notifier>,
        activity: Arc<ActivityLog>,
        settings: Arc<SettingsManager>,
        session: Arc<SessionCoordinator>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
        mode: TradingMode,
    ) -> Self {
        Self {
            store,
            exchange,
            prices,
            strategies,
            detection,
            positions,
            pending,
            notifier,
            activity,
            settings,
            session,
            mode: RwLock::new(mode),
            running: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            stats: Mutex::new(ScannerStats::new(mode)),
            wallet: RwLock::new(Wallet::empty()),
            conviction_score: RwLock::new(None),
            strategies_stale: AtomicBool::new(true),
            store_failures: AtomicU32::new(0),
            active_coins: Arc::new(std::sync::RwLock::new(Vec::new())),
            price_subscription: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn mode(&self) -> TradingMode {
        *self.mode.read().await
    }

    pub async fn stats(&self) -> ScannerStats {
        self.stats.lock().await.clone()
    }

    /// Externally computed performance-momentum score for the conviction
    /// filter (0..100, higher is better).
    pub async fn set_conviction_score(&self, score: Option<f64>) {
        *self.conviction_score.write().await = score;
    }

    /// Claim session leadership and launch the background tasks. Returns
    /// false when another instance is leading; the caller surfaces that.
    pub async fn start(self: &Arc<Self>) -> EngineResult<bool> {
        if self.running.load(Ordering::Acquire) {
            return Ok(true);
        }

        // Persisted settings override defaults on every start
        if let Some(persisted) = self.store.load_settings().await? {
            if let Err(e) = self.settings.update(persisted).await {
                return Err(EngineError::Config(format!("persisted settings invalid: {}", e)));
            }
        }

        if !self.session.try_acquire().await? {
            self.notifier.notify(AlertType::LeadershipDenied).await;
            return Ok(false);
        }

        let mode = *self.mode.read().await;
        if let Some(stats) = self.store.load_stats(mode).await? {
            *self.stats.lock().await = stats;
        } else {
            *self.stats.lock().await = ScannerStats::new(mode);
        }
        let restored = self.positions.load_from_store(mode).await?;
        if restored > 0 {
            info!(count = restored, "restored open positions from store");
        }

        let _ = self.shutdown_tx.send(false);
        self.running.store(true, Ordering::Release);
        self.store_failures.store(0, Ordering::Relaxed);

        let (lost_tx, lost_rx) = watch::channel(false);
        let _ = self
            .session
            .spawn_heartbeat(self.shutdown_rx.clone(), lost_tx);
        let _ = self
            .prices
            .spawn_coordinator(mode, COORDINATOR_INTERVAL, self.shutdown_rx.clone());

        // Feed the global price coordinator the coins the scanner works
        let coins_mirror = Arc::clone(&self.active_coins);
        *self.price_subscription.lock().await = Some(
            self.prices
                .subscribe_global_updates(move || coins_mirror.read().expect("coins mirror").clone()),
        );

        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            scanner.scan_loop(lost_rx).await;
        });

        self.notifier
            .notify(AlertType::LeadershipAcquired {
                session_id: self.session.session_id().to_string(),
            })
            .await;
        self.notifier.notify(AlertType::ScannerStarted { mode }).await;
        self.activity
            .add(ActivityLevel::Info, format!("scanner started ({})", mode));
        Ok(true)
    }

    /// Request cancellation: the in-flight cycle finishes its phase, loops
    /// exit, leadership is released.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        *self.price_subscription.lock().await = None;
        self.session.release().await;

        let stats = self.stats.lock().await.clone();
        if let Err(e) = self.store.upsert_stats(&stats).await {
            warn!("failed to persist stats on stop: {}", e);
        }

        self.notifier.notify(AlertType::ScannerStopped).await;
        self.activity.add(ActivityLevel::Info, "scanner stopped");
    }

    pub async fn restart(self: &Arc<Self>) -> EngineResult<bool> {
        self.stop().await;
        self.start().await
    }

    /// Stop, drop in-memory position state (persisting closure intent),
    /// reset per-mode stats, force a strategy reload, start again.
    pub async fn hard_reset(self: &Arc<Self>) -> EngineResult<bool> {
        self.stop().await;

        let cleared = self.positions.clear_in_memory().await?;
        if cleared > 0 {
            info!(count = cleared, "cleared in-memory positions");
        }

        let mode = *self.mode.read().await;
        let fresh = ScannerStats::new(mode);
        self.store.upsert_stats(&fresh).await?;
        *self.stats.lock().await = fresh;

        self.strategies_stale.store(true, Ordering::Release);
        self.activity.add(ActivityLevel::Warning, "hard reset performed");
        self.start().await
    }

    /// Switch trading mode with the stop-update-start protocol.
    pub async fn set_mode(self: &Arc<Self>, mode: TradingMode) -> EngineResult<bool> {
        let was_running = self.running.load(Ordering::Acquire);
        self.stop().await;
        *self.mode.write().await = mode;

        let settings = self.settings.snapshot().await;
        let stats = if settings.reset_stats_on_mode_switch {
            ScannerStats::new(mode)
        } else {
            self.store
                .load_stats(mode)
                .await?
                .unwrap_or_else(|| ScannerStats::new(mode))
        };
        *self.stats.lock().await = stats;

        self.strategies_stale.store(true, Ordering::Release);
        info!(mode = %mode, "trading mode switched");
        if was_running {
            self.start().await
        } else {
            Ok(false)
        }
    }

    pub fn mark_strategies_stale(&self) {
        self.strategies_stale.store(true, Ordering::Release);
    }

    async fn scan_loop(self: Arc<Self>, mut leadership_lost: watch::Receiver<bool>) {
        let mut shutdown = self.shutdown_rx.clone();
        info!("scan loop started");

        loop {
            if *shutdown.borrow() || !self.running.load(Ordering::Acquire) {
                break;
            }
            if *leadership_lost.borrow() {
                self.on_leadership_lost().await;
                break;
            }

            match self.run_cycle().await {
                Ok(report) => {
                    debug!(
                        scanned = report.strategies_scanned,
                        signals = report.signals_found,
                        trades = report.trades_executed,
                        elapsed_ms = report.elapsed_ms,
                        "cycle complete"
                    );
                    self.store_failures.store(0, Ordering::Relaxed);
                }
                Err(e) if e.is_terminal() => {
                    error!("terminal error in scan cycle: {}", e);
                    self.stop().await;
                    break;
                }
                Err(e) => {
                    warn!("scan cycle error: {}", e);
                    if matches!(e, EngineError::Consistency(_)) {
                        self.activity
                            .add(ActivityLevel::Error, format!("cycle error: {}", e));
                    }
                }
            }

            let frequency = {
                let settings = self.settings.snapshot().await;
                settings
                    .scan_frequency_ms
                    .clamp(MIN_SCAN_FREQUENCY_MS, MAX_SCAN_FREQUENCY_MS)
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(frequency)) => {}
                _ = shutdown.changed() => {}
                _ = leadership_lost.changed() => {}
            }
        }
        info!("scan loop exited");
    }

    async fn on_leadership_lost(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        self.notifier
            .notify(AlertType::LeadershipLost {
                reason: "another session took over".to_string(),
            })
            .await;
        self.activity
            .add(ActivityLevel::Error, "leadership lost; scanner stopped");
    }

    /// One scan cycle: strategies, prices, wallet, position monitoring,
    /// detection, entries, order nudge, stats.
    pub async fn run_cycle(&self) -> EngineResult<CycleReport> {
        let started = Instant::now();
        let settings = self.settings.snapshot().await;
        let mode = *self.mode.read().await;
        let mut report = CycleReport::default();

        // 1. Active strategies, reloaded when marked stale
        let mut active = self.strategies.active().await;
        if active.is_empty() || self.strategies_stale.swap(false, Ordering::AcqRel) {
            active = match self.strategies.load_active(&settings).await {
                Ok(list) => list,
                Err(e) => {
                    self.count_store_failure()?;
                    return Err(e);
                }
            };
        }

        // 2. One coalesced price fetch for every coin in play
        let coins: Vec<String> = {
            let mut set: HashSet<String> = active.iter().map(|s| s.coin().to_string()).collect();
            for p in self.positions.open_positions().await {
                set.insert(p.coin);
            }
            set.into_iter().collect()
        };
        *self.active_coins.write().expect("coins mirror") = coins.clone();
        let prices = if coins.is_empty() {
            Default::default()
        } else {
            self.prices.get_batch_prices(&coins, mode).await?
        };

        // 3. Wallet refresh; all wallet mutations flow through the scanner
        match self.exchange.get_wallet(mode).await {
            Ok(wallet) => *self.wallet.write().await = wallet,
            Err(e) => warn!("wallet refresh failed: {}", e),
        }

        // 4. Monitor existing positions, submit exits
        let exits = self.positions.monitor_all(mode).await?;
        for order in exits {
            self.pending.track(order).await;
        }

        // 5. Detect new signals
        let conviction = *self.conviction_score.read().await;
        let ctx = CycleContext {
            settings: &settings,
            prices: &prices,
            conviction_score: conviction,
        };
        let outcome = self.detection.scan(&active, &ctx).await;
        report.strategies_scanned = outcome.strategies_scanned;
        report.signals_found = outcome.matches.len() as u64;

        if !outcome.matches.is_empty() {
            report.average_signal_strength = outcome
                .matches
                .iter()
                .map(|(_, m, _)| m.combined_strength)
                .sum::<f64>()
                / outcome.matches.len() as f64;
        }

        // 6. Open positions for admitted matches; entry mutations are
        // serialized inside the position manager
        let wallet = self.wallet.read().await.clone();
        for (strategy, signal, _regime) in &outcome.matches {
            let atr = self
                .detection
                .current_atr(&signal.coin, signal.timeframe)
                .await
                .unwrap_or(0.0);
            match self
                .positions
                .open_for_match(
                    strategy,
                    signal,
                    &wallet,
                    &settings,
                    mode,
                    atr,
                    conviction.unwrap_or(0.0),
                )
                .await
            {
                Ok(Some(order)) => {
                    self.pending.track(order).await;
                    report.trades_executed += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(coin = %signal.coin, "entry failed: {}", e),
            }
        }

        // 7. Nudge the pending-order monitor
        self.pending.check_once().await;

        // 8. Per-cycle stats
        report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let stats = {
            let mut stats = self.stats.lock().await;
            stats.record_cycle(
                report.elapsed_ms,
                report.strategies_scanned,
                report.signals_found,
                report.trades_executed,
                report.average_signal_strength,
                chrono::Utc::now(),
            );
            stats.clone()
        };
        if let Err(e) = self.store.upsert_stats(&stats).await {
            warn!("stats upsert failed: {}", e);
            self.count_store_failure()?;
        }

        self.activity.add_with_data(
            ActivityLevel::Cycle,
            format!(
                "cycle {}: {} scanned, {} signals, {} trades",
                stats.total_scan_cycles,
                report.strategies_scanned,
                report.signals_found,
                report.trades_executed
            ),
            Some(serde_json::json!({"elapsed_ms": report.elapsed_ms})),
        );

        Ok(report)
    }

    fn count_store_failure(&self) -> EngineResult<()> {
        let failures = self.store_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= MAX_STORE_FAILURES {
            return Err(EngineError::Fatal(format!(
                "store unavailable after {} consecutive failures",
                failures
            )));
        }
        Ok(())
    }

    /// Export the recent activity log as JSON lines.
    pub fn export_activity(&self) -> String {
        self.activity.export_jsonl()
    }
}
