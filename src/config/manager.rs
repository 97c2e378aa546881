use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use super::settings::ScanSettings;

#[derive(Debug, Clone)]
pub enum SettingsChange {
    Updated(ScanSettings),
}

/// Shared, runtime-mutable scanner settings. Readers take snapshots; writers
/// validate before committing and broadcast the change so the scanner can do
/// its stop-phase-update-start refresh.
pub struct SettingsManager {
    settings: Arc<RwLock<ScanSettings>>,
    change_tx: broadcast::Sender<SettingsChange>,
}

impl SettingsManager {
    pub fn new(initial: ScanSettings) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            settings: Arc::new(RwLock::new(initial)),
            change_tx,
        }
    }

    pub async fn snapshot(&self) -> ScanSettings {
        self.settings.read().await.clone()
    }

    pub async fn update(&self, next: ScanSettings) -> Result<(), String> {
        if let Err(errors) = next.validate() {
            return Err(errors.join(", "));
        }
        {
            let mut guard = self.settings.write().await;
            *guard = next.clone();
        }
        info!(
            scan_frequency_ms = next.scan_frequency_ms,
            max_positions = next.max_positions,
            "scanner settings updated"
        );
        let _ = self.change_tx.send(SettingsChange::Updated(next));
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_rejects_invalid_settings() {
        let manager = SettingsManager::new(ScanSettings::default());
        let bad = ScanSettings {
            max_positions: 0,
            ..ScanSettings::default()
        };
        assert!(manager.update(bad).await.is_err());
        // Original snapshot untouched
        assert_eq!(manager.snapshot().await.max_positions, 5);
    }

    #[tokio::test]
    async fn update_broadcasts_change() {
        let manager = SettingsManager::new(ScanSettings::default());
        let mut rx = manager.subscribe();
        let next = ScanSettings {
            max_positions: 7,
            ..ScanSettings::default()
        };
        manager.update(next).await.unwrap();
        match rx.recv().await.unwrap() {
            SettingsChange::Updated(s) => assert_eq!(s.max_positions, 7),
        }
    }
}
