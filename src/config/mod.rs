pub mod manager;
pub mod settings;

pub use manager::{SettingsChange, SettingsManager};
pub use settings::{AppConfig, ScanSettings, SignalMatchingMode};
