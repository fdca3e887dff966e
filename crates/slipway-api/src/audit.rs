//! AuditRecorder — where every dispatched call is written down.

use async_trait::async_trait;
use tracing::debug;

use slipway_state::{AuditEntry, Persistence, StateResult};

#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> StateResult<()>;
}

/// Writes audit entries to the durable store, or the mirror's journal
/// while the store is unreachable.
pub struct StoreAuditRecorder {
    persistence: Persistence,
}

impl StoreAuditRecorder {
    pub fn new(persistence: Persistence) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl AuditRecorder for StoreAuditRecorder {
    async fn record(&self, entry: AuditEntry) -> StateResult<()> {
        let persistence = self.persistence.clone();
        let id = entry.id.clone();
        let written = tokio::task::spawn_blocking(move || persistence.record_audit(&entry))
            .await
            .map_err(|e| slipway_state::StateError::Write(e.to_string()))??;
        debug!(audit = %id, degraded = written.degraded, "audit entry recorded");
        Ok(())
    }
}
