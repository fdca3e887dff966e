//! Registry leases: one in-flight operation per (project, environment).
//!
//! A lease is the `pending` field of a registry entry, set through the same
//! compare-and-swap that guards every registry write. The final commit of
//! an operation clears it in that operation's last swap.

use std::time::Duration;

use tracing::{debug, warn};

use slipway_state::{Deployment, Persistence, PendingOperation, SlotRegistryEntry};

use crate::error::{OrchestrationError, OrchestrationResult};

/// A registry entry held by the current operation.
#[derive(Debug, Clone)]
pub struct Lease {
    /// The entry as stored right after the lease was taken.
    pub entry: SlotRegistryEntry,
    pub degraded: bool,
}

impl Lease {
    /// Take the lease on `entry`. Fails with a conflict when another live
    /// lease is present or the entry moved since it was read; a lease older
    /// than `ttl` is taken over.
    pub fn acquire(
        persistence: &Persistence,
        mut entry: SlotRegistryEntry,
        operation: PendingOperation,
        ttl: Duration,
        now: u64,
    ) -> OrchestrationResult<Self> {
        let key = entry.table_key();
        if let Some(held) = entry.live_lease(now, ttl.as_secs()) {
            return Err(OrchestrationError::Conflict {
                key,
                reason: format!(
                    "{} of slot {} by {} in progress since {}",
                    held.operation, held.slot, held.holder, held.started_at
                ),
            });
        }
        if let Some(stale) = &entry.pending {
            warn!(
                %key,
                operation = %stale.operation,
                holder = %stale.holder,
                started_at = stale.started_at,
                "taking over abandoned registry lease"
            );
        }

        let expected = entry.version;
        entry.pending = Some(operation);
        let written = persistence.swap_registry(&entry, expected, None)?;
        entry.version = written.value;
        debug!(%key, version = entry.version, "registry lease acquired");
        Ok(Self {
            entry,
            degraded: written.degraded,
        })
    }

    /// Write `next` (with the lease cleared) and optionally its deployment
    /// row in one swap. Returns whether the write was degraded.
    pub fn commit(
        &self,
        persistence: &Persistence,
        mut next: SlotRegistryEntry,
        deployment: Option<&Deployment>,
    ) -> OrchestrationResult<(SlotRegistryEntry, bool)> {
        next.pending = None;
        let written = persistence.swap_registry(&next, self.entry.version, deployment)?;
        next.version = written.value;
        Ok((next, written.degraded))
    }

    /// Drop the lease without touching slot state. Failures are logged;
    /// the lease then expires after its ttl.
    pub fn release(&self, persistence: &Persistence, deployment: Option<&Deployment>) {
        let key = self.entry.table_key();
        let mut entry = self.entry.clone();
        entry.pending = None;
        match persistence.swap_registry(&entry, self.entry.version, deployment) {
            Ok(_) => debug!(%key, "registry lease released"),
            Err(e) => {
                warn!(%key, error = %e, "failed to release registry lease");
                if let Some(deployment) = deployment
                    && let Err(e) = persistence.record_deployment(deployment)
                {
                    warn!(deployment = %deployment.id, error = %e, "failed to record deployment");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use slipway_core::{Environment, SlotName};
    use slipway_state::{FileMirror, OperationKind, StateStore};

    use super::*;

    fn persistence() -> (tempfile::TempDir, Persistence) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mirror = Arc::new(FileMirror::open(dir.path()).unwrap());
        (dir, Persistence::new(store, mirror))
    }

    fn pending(holder: &str, started_at: u64) -> PendingOperation {
        PendingOperation {
            operation: OperationKind::Deploy,
            slot: SlotName::Blue,
            holder: holder.to_string(),
            deployment_id: None,
            started_at,
        }
    }

    const TTL: Duration = Duration::from_secs(900);

    #[test]
    fn second_holder_conflicts_until_released() {
        let (_dir, persistence) = persistence();
        let entry = SlotRegistryEntry::new("shop", Environment::Production, 4000, 100);
        let lease = Lease::acquire(&persistence, entry.clone(), pending("a", 100), TTL, 100).unwrap();
        assert_eq!(lease.entry.version, 1);

        let stored = persistence
            .get_registry("shop", Environment::Production)
            .unwrap()
            .value
            .unwrap();
        let err = Lease::acquire(&persistence, stored, pending("b", 101), TTL, 101).unwrap_err();
        assert!(matches!(err, OrchestrationError::Conflict { .. }));

        lease.release(&persistence, None);
        let stored = persistence
            .get_registry("shop", Environment::Production)
            .unwrap()
            .value
            .unwrap();
        assert!(stored.pending.is_none());
        assert!(Lease::acquire(&persistence, stored, pending("b", 102), TTL, 102).is_ok());
    }

    #[test]
    fn stale_read_conflicts() {
        let (_dir, persistence) = persistence();
        let entry = SlotRegistryEntry::new("shop", Environment::Production, 4000, 100);
        let lease = Lease::acquire(&persistence, entry.clone(), pending("a", 100), TTL, 100).unwrap();
        lease.release(&persistence, None);

        // `entry` still carries version 0.
        let err = Lease::acquire(&persistence, entry, pending("b", 101), TTL, 101).unwrap_err();
        assert!(matches!(err, OrchestrationError::Conflict { .. }));
    }

    #[test]
    fn abandoned_lease_is_taken_over() {
        let (_dir, persistence) = persistence();
        let entry = SlotRegistryEntry::new("shop", Environment::Production, 4000, 100);
        Lease::acquire(&persistence, entry, pending("crashed", 100), TTL, 100).unwrap();

        let stored = persistence
            .get_registry("shop", Environment::Production)
            .unwrap()
            .value
            .unwrap();
        let now = 100 + TTL.as_secs();
        let lease = Lease::acquire(&persistence, stored, pending("b", now), TTL, now).unwrap();
        assert_eq!(lease.entry.pending.as_ref().map(|p| p.holder.as_str()), Some("b"));
    }

    #[test]
    fn commit_clears_lease() {
        let (_dir, persistence) = persistence();
        let entry = SlotRegistryEntry::new("shop", Environment::Production, 4000, 100);
        let lease = Lease::acquire(&persistence, entry, pending("a", 100), TTL, 100).unwrap();
        let (committed, degraded) = lease.commit(&persistence, lease.entry.clone(), None).unwrap();
        assert!(!degraded);
        assert_eq!(committed.version, 2);
        assert!(committed.pending.is_none());
    }
}
