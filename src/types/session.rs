#![allow(dead_code)]
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TradingMode;

/// Single shared row used for leader election across client instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub leader_session_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub is_globally_active: bool,
}

impl Session {
    pub fn inactive() -> Self {
        Self {
            leader_session_id: None,
            last_heartbeat: DateTime::<Utc>::MIN_UTC,
            is_globally_active: false,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout_secs: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() > timeout_secs
    }
}

/// Per-mode scan counters, upserted once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerStats {
    pub mode: TradingMode,
    pub total_scan_cycles: u64,
    pub total_scans: u64,
    pub signals_found: u64,
    pub trades_executed: u64,
    pub average_scan_time_ms: f64,
    pub last_scan_time_ms: f64,
    pub average_signal_strength: f64,
    pub last_cycle_average_signal_strength: f64,
    pub last_updated: DateTime<Utc>,
}

impl ScannerStats {
    pub fn new(mode: TradingMode) -> Self {
        Self {
            mode,
            total_scan_cycles: 0,
            total_scans: 0,
            signals_found: 0,
            trades_executed: 0,
            average_scan_time_ms: 0.0,
            last_scan_time_ms: 0.0,
            average_signal_strength: 0.0,
            last_cycle_average_signal_strength: 0.0,
            last_updated: Utc::now(),
        }
    }

    pub fn record_cycle(
        &mut self,
        elapsed_ms: f64,
        scans: u64,
        signals: u64,
        trades: u64,
        cycle_avg_strength: f64,
        now: DateTime<Utc>,
    ) {
        self.total_scan_cycles += 1;
        self.total_scans += scans;
        self.signals_found += signals;
        self.trades_executed += trades;
        self.last_scan_time_ms = elapsed_ms;
        let n = self.total_scan_cycles as f64;
        self.average_scan_time_ms += (elapsed_ms - self.average_scan_time_ms) / n;
        self.last_cycle_average_signal_strength = cycle_avg_strength;
        if cycle_avg_strength > 0.0 {
            self.average_signal_strength +=
                (cycle_avg_strength - self.average_signal_strength) / n;
        }
        self.last_updated = now;
    }
}

/// A combination the operator excluded from scanning, globally or per coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptedOutCombination {
    pub signature: String,
    /// None opts the signature out everywhere.
    pub coin: Option<String>,
    pub opted_out_at: DateTime<Utc>,
}

