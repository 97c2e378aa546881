use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::storage::Store;

pub const SESSION_TIMEOUT_SECS: i64 = 30;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Cluster-wide session leadership over the shared session row. Exactly one
/// instance holds leadership; stale heartbeats allow takeover.
pub struct SessionCoordinator {
    store: Arc<dyn Store>,
    session_id: String,
    timeout_secs: i64,
}

impl SessionCoordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            session_id: Uuid::new_v4().to_string(),
            timeout_secs: SESSION_TIMEOUT_SECS,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Compare-and-swap leadership claim. Returns false when another
    /// instance is still heartbeating.
    pub async fn try_acquire(&self) -> EngineResult<bool> {
        let acquired = self
            .store
            .try_acquire_leadership(&self.session_id, Utc::now(), self.timeout_secs)
            .await?;
        if acquired {
            info!(session_id = %self.session_id, "acquired session leadership");
        } else {
            let session = self.store.load_session().await?;
            info!(
                leader = ?session.leader_session_id,
                "another session holds leadership"
            );
        }
        Ok(acquired)
    }

    /// One heartbeat tick. A CAS miss means another instance took over.
    pub async fn heartbeat(&self) -> EngineResult<()> {
        let ok = self
            .store
            .heartbeat_leader(&self.session_id, Utc::now())
            .await?;
        if ok {
            Ok(())
        } else {
            let session = self.store.load_session().await?;
            Err(EngineError::LeadershipLost(format!(
                "leader is now {:?}",
                session.leader_session_id
            )))
        }
    }

    /// Best-effort release on stop or process exit.
    pub async fn release(&self) {
        if let Err(e) = self.store.release_leadership(&self.session_id).await {
            warn!("failed to release leadership: {}", e);
        } else {
            info!(session_id = %self.session_id, "released session leadership");
        }
    }

    /// Heartbeat loop; flips `leadership_lost` and exits when a CAS miss
    /// reveals a takeover, or when shutdown is signalled.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        leadership_lost: watch::Sender<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match coordinator.heartbeat().await {
                            Ok(()) => {}
                            Err(EngineError::LeadershipLost(reason)) => {
                                warn!("leadership lost: {}", reason);
                                let _ = leadership_lost.send(true);
                                break;
                            }
                            Err(e) => {
                                // Transient store failure: keep trying, the
                                // row is still ours until someone takes it
                                warn!("heartbeat error: {}", e);
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;

    #[tokio::test]
    async fn second_instance_denied_while_first_heartbeats() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new("sqlite::memory:").await.unwrap());
        let first = SessionCoordinator::new(Arc::clone(&store));
        let second = SessionCoordinator::new(Arc::clone(&store));

        assert!(first.try_acquire().await.unwrap());
        assert!(!second.try_acquire().await.unwrap());
        assert!(first.heartbeat().await.is_ok());
    }

    #[tokio::test]
    async fn stale_leader_is_superseded_and_observes_loss() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new("sqlite::memory:").await.unwrap());
        let first = SessionCoordinator::new(Arc::clone(&store));
        assert!(first.try_acquire().await.unwrap());

        // Age the heartbeat past the session timeout
        let stale = Utc::now() - chrono::Duration::seconds(SESSION_TIMEOUT_SECS + 5);
        store
            .try_acquire_leadership(first.session_id(), stale, SESSION_TIMEOUT_SECS)
            .await
            .unwrap();

        let second = SessionCoordinator::new(Arc::clone(&store));
        assert!(second.try_acquire().await.unwrap());

        // The old leader's next tick sees the takeover
        match first.heartbeat().await {
            Err(EngineError::LeadershipLost(_)) => {}
            other => panic!("expected LeadershipLost, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn release_frees_leadership_for_next_start() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new("sqlite::memory:").await.unwrap());
        let first = SessionCoordinator::new(Arc::clone(&store));
        assert!(first.try_acquire().await.unwrap());
        first.release().await;

        let second = SessionCoordinator::new(Arc::clone(&store));
        assert!(second.try_acquire().await.unwrap());
    }
}
