pub mod aggregator;
pub mod runner;

pub use aggregator::{admit_to_scanner, aggregate, AdmissionReport, AggregationConfig, AggregationOutcome};
pub use runner::{BacktestConfig, BacktestProgress, BacktestRun, BacktestRunner, CoinFailure};
