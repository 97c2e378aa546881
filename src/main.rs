mod backtest;
mod config;
mod error;
mod exchange;
mod indicators;
mod notifications;
mod prices;
mod regime;
mod scanner;
mod signals;
mod storage;
mod types;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use backtest::{admit_to_scanner, aggregate, AggregationConfig, BacktestConfig, BacktestRunner};
use config::{AppConfig, ScanSettings, SettingsManager};
use error::EngineError;
use exchange::{BinanceClient, ExchangeClient};
use notifications::NotificationManager;
use prices::PriceCache;
use regime::EmaAdxClassifier;
use scanner::{
    ActivityLog, PendingOrderManager, PositionManager, Scanner, SessionCoordinator,
    SignalDetectionEngine, StrategyManager,
};
use storage::{SqliteStore, Store};
use types::{TimeFrame, TradingMode};

const EXIT_BAD_CONFIG: i32 = 1;
const EXIT_LEADERSHIP_DENIED: i32 = 2;

#[derive(Parser)]
#[command(name = "crypto-signal-scanner")]
#[command(version = "0.1.0")]
#[command(about = "Automated signal-combination trading engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live scanner until interrupted
    Start {
        /// Trading mode: testnet or live
        #[arg(short, long, default_value = "testnet")]
        mode: String,

        /// Write the activity log here on shutdown (JSON lines)
        #[arg(long)]
        export_log: Option<String>,
    },
    /// Backtest the signal catalog and admit ranked combinations
    Backtest {
        /// Coins to scan, comma separated
        #[arg(long, default_value = "BTCUSDT,ETHUSDT,SOLUSDT")]
        coins: String,

        /// Candle timeframe (1m,5m,15m,30m,1h,4h,1d)
        #[arg(long, default_value = "1h")]
        timeframe: String,

        /// Historical window in days
        #[arg(long, default_value = "30")]
        days: u32,

        /// Target gain percent defining a successful trigger
        #[arg(long, default_value = "1.0")]
        target_gain: f64,

        /// Forward walk window in minutes
        #[arg(long, default_value = "240")]
        future_window: u64,

        /// Minimum signals that must fire together
        #[arg(long, default_value = "2")]
        required_signals: usize,

        /// Maximum signals per combination
        #[arg(long, default_value = "5")]
        max_signals: usize,

        /// Minimum combined strength per trigger bar
        #[arg(long, default_value = "100.0")]
        min_strength: f64,

        /// Filter signals by market regime admissibility
        #[arg(long)]
        regime_aware: bool,

        /// Persist surviving combinations as scanner strategies
        #[arg(long)]
        admit: bool,
    },
    /// List persisted strategies with their scores
    Strategies,
    /// Show per-mode scanner statistics
    Status,
    /// Verify exchange API keys
    TestKeys {
        #[arg(short, long, default_value = "testnet")]
        mode: String,
    },
    /// Write a default config file template
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let app_config = match AppConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", e);
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    let result = match cli.command {
        Commands::Start { mode, export_log } => run_start(&app_config, &mode, export_log).await,
        Commands::Backtest {
            coins,
            timeframe,
            days,
            target_gain,
            future_window,
            required_signals,
            max_signals,
            min_strength,
            regime_aware,
            admit,
        } => {
            run_backtest(
                &app_config,
                BacktestCliArgs {
                    coins,
                    timeframe,
                    days,
                    target_gain,
                    future_window,
                    required_signals,
                    max_signals,
                    min_strength,
                    regime_aware,
                    admit,
                },
            )
            .await
        }
        Commands::Strategies => list_strategies(&app_config).await,
        Commands::Status => show_status(&app_config).await,
        Commands::TestKeys { mode } => test_keys(&app_config, &mode).await,
        Commands::InitConfig => init_config(&cli.config),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(engine_err) = e.downcast_ref::<EngineError>() {
                if matches!(engine_err, EngineError::Config(_)) {
                    error!("{}", engine_err);
                    std::process::exit(EXIT_BAD_CONFIG);
                }
            }
            Err(e)
        }
    }
}

fn parse_mode(s: &str) -> Result<TradingMode> {
    TradingMode::from_str(s)
        .ok_or_else(|| anyhow!(EngineError::Config(format!("unknown trading mode '{}'", s))))
}

fn parse_timeframe(s: &str) -> Result<TimeFrame> {
    TimeFrame::from_str(s)
        .ok_or_else(|| anyhow!(EngineError::Config(format!("unknown timeframe '{}'", s))))
}

async fn run_start(app_config: &AppConfig, mode: &str, export_log: Option<String>) -> Result<()> {
    let mode = parse_mode(mode)?;

    // Composition root: every subsystem is constructed here and handed its
    // dependencies explicitly.
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&app_config.database_path).await?);
    let exchange: Arc<dyn ExchangeClient> = Arc::new(BinanceClient::new(
        app_config.api_key.clone(),
        app_config.api_secret.clone(),
    ));
    let prices = PriceCache::new(Arc::clone(&exchange));
    let notifier = Arc::new(NotificationManager::new());
    let activity = Arc::new(ActivityLog::new());
    let regime = Arc::new(EmaAdxClassifier::default());

    let strategies = Arc::new(StrategyManager::new(Arc::clone(&store)));
    let detection = Arc::new(SignalDetectionEngine::new(
        Arc::clone(&exchange),
        regime.clone(),
    ));
    let positions = Arc::new(PositionManager::new(
        Arc::clone(&store),
        Arc::clone(&exchange),
        prices.clone(),
        notifier.clone(),
        Arc::clone(&activity),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pending = Arc::new(PendingOrderManager::new(
        Arc::clone(&exchange),
        Arc::clone(&positions) as Arc<dyn scanner::FillSink>,
        scanner::pending::POLL_INTERVAL,
        shutdown_rx.clone(),
    ));

    let settings = Arc::new(SettingsManager::new(
        app_config.scanner.clone().unwrap_or_default(),
    ));
    let session = Arc::new(SessionCoordinator::new(Arc::clone(&store)));

    let scanner = Arc::new(Scanner::new(
        Arc::clone(&store),
        Arc::clone(&exchange),
        prices,
        strategies,
        detection,
        positions,
        pending,
        notifier,
        Arc::clone(&activity),
        settings,
        session,
        shutdown_tx,
        shutdown_rx,
        mode,
    ));

    match scanner.start().await {
        Ok(true) => {}
        Ok(false) => {
            warn!("another instance is leading this session; exiting");
            std::process::exit(EXIT_LEADERSHIP_DENIED);
        }
        Err(e) => {
            if e.is_terminal() {
                error!("{}", e);
                std::process::exit(EXIT_BAD_CONFIG);
            }
            return Err(e.into());
        }
    }

    info!("scanner running; press Ctrl+C to stop");
    info!("admin commands on stdin: stop | restart | hard-reset | mode <testnet|live> | reload | conviction <0-100> | export <path>");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = tokio::io::AsyncBufReadExt::lines(stdin);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                scanner.stop().await;
                break;
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { continue };
                if !handle_admin_command(&scanner, line.trim()).await? {
                    break;
                }
            }
        }
    }

    if let Some(path) = export_log {
        std::fs::write(&path, scanner.export_activity())?;
        info!("activity log exported to {}", path);
    }

    Ok(())
}

/// One admin command from stdin. Returns false when the scanner should shut
/// down.
async fn handle_admin_command(scanner: &Arc<Scanner>, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("stop") => {
            scanner.stop().await;
            return Ok(false);
        }
        Some("restart") => {
            if !scanner.restart().await? {
                warn!("restart denied: another session took leadership");
                std::process::exit(EXIT_LEADERSHIP_DENIED);
            }
        }
        Some("hard-reset") => {
            if !scanner.hard_reset().await? {
                warn!("hard reset: leadership denied on restart");
                std::process::exit(EXIT_LEADERSHIP_DENIED);
            }
        }
        Some("mode") => match parts.next().and_then(TradingMode::from_str) {
            Some(mode) => {
                scanner.set_mode(mode).await?;
            }
            None => warn!("usage: mode <testnet|live>"),
        },
        Some("reload") => {
            scanner.mark_strategies_stale();
            info!("strategies will reload on the next cycle");
        }
        Some("conviction") => match parts.next().and_then(|v| v.parse::<f64>().ok()) {
            Some(score) if (0.0..=100.0).contains(&score) => {
                scanner.set_conviction_score(Some(score)).await;
            }
            _ => warn!("usage: conviction <0-100>"),
        },
        Some("export") => {
            let path = parts.next().unwrap_or("activity.jsonl");
            std::fs::write(path, scanner.export_activity())?;
            info!("activity log exported to {}", path);
        }
        Some(other) => warn!("unknown command '{}'", other),
        None => {}
    }
    Ok(true)
}

struct BacktestCliArgs {
    coins: String,
    timeframe: String,
    days: u32,
    target_gain: f64,
    future_window: u64,
    required_signals: usize,
    max_signals: usize,
    min_strength: f64,
    regime_aware: bool,
    admit: bool,
}

async fn run_backtest(app_config: &AppConfig, args: BacktestCliArgs) -> Result<()> {
    let timeframe = parse_timeframe(&args.timeframe)?;
    let coins: Vec<String> = args
        .coins
        .split(',')
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .collect();

    let config = BacktestConfig {
        coins,
        timeframe,
        period_days: args.days,
        enabled_signals: signals::default_catalog(),
        target_gain_pct: args.target_gain,
        future_window_minutes: args.future_window,
        required_signals: args.required_signals,
        max_signals: args.max_signals,
        min_combined_strength: args.min_strength,
        regime_aware: args.regime_aware,
        batch_size: 3,
    };

    let exchange: Arc<dyn ExchangeClient> = Arc::new(BinanceClient::public_only());
    let runner = BacktestRunner::new(exchange, Arc::new(EmaAdxClassifier::default()));
    let run = runner.run(&config).await.map_err(anyhow::Error::from)?;

    info!(
        matches = run.matches.len(),
        failed_coins = run.failed_coins.len(),
        "backtest finished"
    );
    for failure in &run.failed_coins {
        warn!("{}: {}", failure.coin, failure.reason);
    }

    let outcome = aggregate(&run.matches, &AggregationConfig::default());
    println!(
        "\n{:<56} {:>6} {:>8} {:>8} {:>9}",
        "Combination", "Occ", "Win %", "PF", "Avg Move"
    );
    println!("{}", "-".repeat(92));
    for combo in &outcome.combinations {
        println!(
            "{:<56} {:>6} {:>7.1}% {:>8.2} {:>8.2}%",
            combo.combination_name,
            combo.occurrences,
            combo.success_rate,
            combo.profit_factor,
            combo.net_average_price_move
        );
    }

    if args.admit {
        let store = SqliteStore::new(&app_config.database_path).await?;
        let report = admit_to_scanner(&store, &outcome.combinations).await?;
        info!(
            created = report.created,
            duplicates = report.duplicates,
            "combinations admitted to scanner"
        );
    }

    Ok(())
}

async fn list_strategies(app_config: &AppConfig) -> Result<()> {
    let store = SqliteStore::new(&app_config.database_path).await?;
    let manager = StrategyManager::new(Arc::new(store));
    let active = manager.load_active(&ScanSettings::default()).await?;
    let counters = manager.counters().await;

    println!(
        "\n{:<40} {:<10} {:>8} {:>8} {:>8}",
        "Strategy", "Coin", "PF", "Win %", "Score"
    );
    println!("{}", "-".repeat(80));
    for strategy in &active {
        println!(
            "{:<40} {:<10} {:>8.2} {:>7.1}% {:>8.3}",
            strategy.name(),
            strategy.coin(),
            strategy.combination.profit_factor,
            strategy.combination.success_rate,
            strategy.profitability_score
        );
    }
    println!(
        "\n{} active | rejected: {} opted out, {} weak, {} underperforming, {} excluded",
        counters.accepted,
        counters.opted_out,
        counters.below_strength,
        counters.underperforming,
        counters.excluded_from_scanner
    );
    Ok(())
}

async fn show_status(app_config: &AppConfig) -> Result<()> {
    let store = SqliteStore::new(&app_config.database_path).await?;
    for mode in [TradingMode::Testnet, TradingMode::Live] {
        match store.load_stats(mode).await? {
            Some(stats) => {
                println!("\n=== {} ===", mode);
                println!("cycles:            {}", stats.total_scan_cycles);
                println!("scans:             {}", stats.total_scans);
                println!("signals found:     {}", stats.signals_found);
                println!("trades executed:   {}", stats.trades_executed);
                println!("avg scan time:     {:.1} ms", stats.average_scan_time_ms);
                println!("avg strength:      {:.1}", stats.average_signal_strength);
                println!("last updated:      {}", stats.last_updated);
            }
            None => println!("\n=== {} ===\nno stats recorded", mode),
        }
    }
    Ok(())
}

fn init_config(path: &str) -> Result<()> {
    #[derive(serde::Serialize)]
    struct Template {
        database_path: String,
        trading_mode: String,
        scanner: ScanSettings,
    }

    if std::path::Path::new(path).exists() {
        return Err(anyhow!("{} already exists", path));
    }
    let template = Template {
        database_path: "sqlite:./signal_scanner.db".to_string(),
        trading_mode: "testnet".to_string(),
        scanner: ScanSettings::default(),
    };
    std::fs::write(path, toml::to_string_pretty(&template)?)?;
    info!("wrote default configuration to {}", path);
    info!("set SCANNER_API_KEY and SCANNER_API_SECRET in the environment or .env");
    Ok(())
}

async fn test_keys(app_config: &AppConfig, mode: &str) -> Result<()> {
    let mode = parse_mode(mode)?;
    let client = BinanceClient::new(app_config.api_key.clone(), app_config.api_secret.clone());
    let check = client.test_keys(mode).await?;
    if check.ok {
        info!("API keys valid for {}", mode);
        Ok(())
    } else {
        error!("API key check failed: {}", check.message);
        std::process::exit(EXIT_BAD_CONFIG);
    }
}
