//! Primary-plus-fallback persistence with an explicit degraded flag.
//!
//! Every call goes to the durable store first. Only availability failures
//! (see [`StateError::is_unavailable`]) fall back to the [`FileMirror`];
//! conflicts and data errors propagate unchanged. Results carry a
//! `degraded` flag so callers can surface reduced consistency guarantees.

use std::sync::Arc;

use tracing::{debug, info, warn};

use slipway_core::Environment;

use crate::durable::DurableStore;
use crate::error::{StateError, StateResult};
use crate::mirror::FileMirror;
use crate::types::*;

/// A value plus whether it came from (or was written to) the file mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct Degradable<T> {
    pub value: T,
    pub degraded: bool,
}

impl<T> Degradable<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value,
            degraded: false,
        }
    }

    pub fn degraded(value: T) -> Self {
        Self {
            value,
            degraded: true,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Degradable<U> {
        Degradable {
            value: f(self.value),
            degraded: self.degraded,
        }
    }
}

#[derive(Clone)]
pub struct Persistence {
    primary: Arc<dyn DurableStore>,
    mirror: Arc<FileMirror>,
}

impl Persistence {
    pub fn new(primary: Arc<dyn DurableStore>, mirror: Arc<FileMirror>) -> Self {
        Self { primary, mirror }
    }

    pub fn primary(&self) -> &Arc<dyn DurableStore> {
        &self.primary
    }

    pub fn mirror(&self) -> &FileMirror {
        &self.mirror
    }

    fn fall_back<T>(
        &self,
        operation: &'static str,
        primary: StateResult<T>,
        mirror: impl FnOnce() -> StateResult<T>,
    ) -> StateResult<Degradable<T>> {
        match primary {
            Ok(value) => Ok(Degradable::fresh(value)),
            Err(e) if e.is_unavailable() => {
                warn!(operation, error = %e, "durable store unavailable, using file mirror");
                Ok(Degradable::degraded(mirror()?))
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort mirror refresh after a successful primary call.
    fn refresh(&self, what: &str, result: StateResult<()>) {
        if let Err(e) = result {
            warn!(what, error = %e, "failed to refresh file mirror");
        }
    }

    // ── Projects ───────────────────────────────────────────────────

    pub fn put_project(&self, project: &Project) -> StateResult<()> {
        self.primary.put_project(project)?;
        self.refresh("project", self.mirror.cache_project(project));
        Ok(())
    }

    pub fn get_project(&self, name: &str) -> StateResult<Degradable<Option<Project>>> {
        let result = self.fall_back("get_project", self.primary.get_project(name), || {
            self.mirror.get_project(name)
        })?;
        if let (false, Some(project)) = (result.degraded, &result.value) {
            self.refresh("project", self.mirror.cache_project(project));
        }
        Ok(result)
    }

    pub fn list_projects(&self) -> StateResult<Degradable<Vec<Project>>> {
        self.fall_back("list_projects", self.primary.list_projects(), || {
            self.mirror.list_projects()
        })
    }

    // ── Slot registry ──────────────────────────────────────────────

    pub fn get_registry(
        &self,
        project: &str,
        environment: Environment,
    ) -> StateResult<Degradable<Option<SlotRegistryEntry>>> {
        let key = registry_key(project, environment);
        let result = self.fall_back(
            "get_registry",
            self.primary.get_registry(project, environment),
            || Ok(self.mirror.get_entry(&key)?.map(|m| m.entry)),
        )?;
        if result.degraded {
            return Ok(result);
        }

        // The primary is back; push any entry written while it was down.
        match self.mirror.get_entry(&key) {
            Ok(Some(mirrored)) if mirrored.unsynced => {
                self.push_unsynced(&mirrored.entry)?;
                Ok(Degradable::fresh(Some(mirrored.entry)))
            }
            Ok(_) => Ok(result),
            Err(e) => {
                warn!(%key, error = %e, "file mirror unreadable");
                Ok(result)
            }
        }
    }

    pub fn list_registry(&self) -> StateResult<Degradable<Vec<SlotRegistryEntry>>> {
        self.fall_back("list_registry", self.primary.list_registry(), || {
            self.mirror.entries()
        })
    }

    /// Compare-and-swap a registry entry, optionally with its deployment row.
    pub fn swap_registry(
        &self,
        entry: &SlotRegistryEntry,
        expected: u64,
        deployment: Option<&Deployment>,
    ) -> StateResult<Degradable<u64>> {
        match self.primary.swap_registry(entry, expected, deployment) {
            Ok(version) => {
                let mut stored = entry.clone();
                stored.version = version;
                self.refresh("registry", self.mirror.put_synced(&stored));
                Ok(Degradable::fresh(version))
            }
            Err(e) if e.is_unavailable() => {
                warn!(key = %entry.table_key(), error = %e, "durable store unavailable, writing registry to file mirror");
                let version = self.mirror.swap_unsynced(entry, expected)?;
                if let Some(deployment) = deployment {
                    self.mirror.append_deployment(deployment)?;
                }
                Ok(Degradable::degraded(version))
            }
            Err(e) => Err(e),
        }
    }

    fn push_unsynced(&self, entry: &SlotRegistryEntry) -> StateResult<()> {
        let key = entry.table_key();
        self.primary.restore_registry(entry)?;
        self.mirror.mark_synced(&key)?;
        info!(%key, version = entry.version, "unsynced registry entry pushed to durable store");
        Ok(())
    }

    /// Push every unsynced mirror entry and journaled deployment and audit
    /// entry to the durable store. Journals are removed once replayed.
    /// Returns the number of registry entries pushed.
    pub fn reconcile(&self) -> StateResult<usize> {
        let unsynced = self.mirror.unsynced_entries()?;
        for entry in &unsynced {
            self.push_unsynced(entry)?;
        }
        let deployments = self
            .mirror
            .drain_deployments(|deployment| self.primary.put_deployment(deployment))?;
        let audited = self.mirror.drain_audit(|entry| self.primary.append_audit(entry))?;
        debug!(pushed = unsynced.len(), deployments, audited, "reconciliation finished");
        Ok(unsynced.len())
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn record_deployment(&self, deployment: &Deployment) -> StateResult<Degradable<()>> {
        self.fall_back(
            "record_deployment",
            self.primary.put_deployment(deployment),
            || self.mirror.append_deployment(deployment),
        )
    }

    pub fn list_deployments(
        &self,
        project: &str,
        environment: Environment,
        limit: usize,
    ) -> StateResult<Degradable<Vec<Deployment>>> {
        self.fall_back(
            "list_deployments",
            self.primary.list_deployments(project, environment, limit),
            || {
                let mut journal: Vec<Deployment> = self
                    .mirror
                    .journaled_deployments()?
                    .into_iter()
                    .filter(|d| d.project == project && d.environment == environment)
                    .collect();
                journal.reverse();
                journal.truncate(limit);
                Ok(journal)
            },
        )
    }

    // ── Audit ──────────────────────────────────────────────────────

    pub fn record_audit(&self, entry: &AuditEntry) -> StateResult<Degradable<()>> {
        self.fall_back("record_audit", self.primary.append_audit(entry), || {
            self.mirror.append_audit(entry)
        })
    }

    // ── Credentials ────────────────────────────────────────────────

    pub fn find_credential(
        &self,
        token_hash: &str,
    ) -> StateResult<Degradable<Option<CredentialRecord>>> {
        let result = self.fall_back(
            "find_credential",
            self.primary.find_credential_by_hash(token_hash),
            || self.mirror.get_credential(token_hash),
        )?;
        if let (false, Some(credential)) = (result.degraded, &result.value) {
            self.refresh("credential", self.mirror.cache_credential(credential));
        }
        Ok(result)
    }

    pub fn touch_credential(&self, token_hash: &str, now: u64) -> StateResult<()> {
        match self.primary.touch_credential(token_hash, now) {
            Err(StateError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use crate::testing::FlakyStore;

    fn setup() -> (tempfile::TempDir, Arc<FlakyStore>, Persistence) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(StateStore::open_in_memory().unwrap()));
        let mirror = Arc::new(FileMirror::open(dir.path()).unwrap());
        let persistence = Persistence::new(store.clone(), mirror);
        (dir, store, persistence)
    }

    fn entry() -> SlotRegistryEntry {
        SlotRegistryEntry::new("shop", Environment::Production, 4000, 10)
    }

    #[test]
    fn healthy_primary_is_not_degraded_and_refreshes_mirror() {
        let (_dir, _store, persistence) = setup();
        let written = persistence.swap_registry(&entry(), 0, None).unwrap();
        assert!(!written.degraded);
        assert_eq!(written.value, 1);

        let mirrored = persistence.mirror().get_entry("shop/production").unwrap().unwrap();
        assert!(!mirrored.unsynced);
        assert_eq!(mirrored.entry.version, 1);
    }

    #[test]
    fn outage_falls_back_to_mirror_and_flags_unsynced() {
        let (_dir, store, persistence) = setup();
        persistence.swap_registry(&entry(), 0, None).unwrap();

        store.set_available(false);
        let read = persistence.get_registry("shop", Environment::Production).unwrap();
        assert!(read.degraded);
        let current = read.value.unwrap();
        assert_eq!(current.version, 1);

        let written = persistence.swap_registry(&current, 1, None).unwrap();
        assert!(written.degraded);
        assert_eq!(written.value, 2);
        assert_eq!(persistence.mirror().unsynced_entries().unwrap().len(), 1);
    }

    #[test]
    fn recovery_pushes_unsynced_entries() {
        let (_dir, store, persistence) = setup();
        store.set_available(false);
        persistence.swap_registry(&entry(), 0, None).unwrap();

        store.set_available(true);
        let read = persistence.get_registry("shop", Environment::Production).unwrap();
        assert!(!read.degraded);
        assert_eq!(read.value.unwrap().version, 1);
        assert!(persistence.mirror().unsynced_entries().unwrap().is_empty());

        // The durable store now accepts the next CAS from the pushed version.
        let next = persistence.swap_registry(&entry(), 1, None).unwrap();
        assert_eq!(next.value, 2);
    }

    #[test]
    fn conflicts_do_not_fall_back() {
        let (_dir, _store, persistence) = setup();
        persistence.swap_registry(&entry(), 0, None).unwrap();
        let err = persistence.swap_registry(&entry(), 0, None).unwrap_err();
        assert!(err.is_conflict());
        assert!(persistence.mirror().unsynced_entries().unwrap().is_empty());
    }

    #[test]
    fn projects_cached_for_degraded_reads() {
        let (_dir, store, persistence) = setup();
        persistence.put_project(&Project::new("shop", "team1", 1)).unwrap();

        store.set_available(false);
        let project = persistence.get_project("shop").unwrap();
        assert!(project.degraded);
        assert_eq!(project.value.unwrap().team_id, "team1");
    }

    #[test]
    fn reconcile_replays_journaled_deployments() {
        let (_dir, store, persistence) = setup();
        store.set_available(false);
        let mut deployment = Deployment::begin(
            "shop",
            Environment::Production,
            slipway_core::SlotName::Blue,
            "shop:v1",
            "v1",
            "cred",
            5,
        );
        deployment.succeed(6);
        persistence
            .swap_registry(&entry(), 0, Some(&deployment))
            .unwrap();

        store.set_available(true);
        assert_eq!(persistence.reconcile().unwrap(), 1);
        let history = persistence
            .list_deployments("shop", Environment::Production, 5)
            .unwrap();
        assert!(!history.degraded);
        assert_eq!(history.value, vec![deployment]);
    }

    fn audit(id: &str) -> AuditEntry {
        AuditEntry {
            id: id.to_string(),
            operation: "deploy".to_string(),
            team_id: Some("team1".to_string()),
            credential_id: None,
            project: Some("shop".to_string()),
            environment: Some(Environment::Production),
            params: serde_json::json!({}),
            outcome: AuditOutcome::Success,
            message: None,
            degraded: true,
            duration_ms: 3,
            recorded_at: 1_000,
        }
    }

    #[test]
    fn degraded_history_lists_each_deployment_once() {
        let (_dir, store, persistence) = setup();
        store.set_available(false);
        let mut deployment = Deployment::begin(
            "shop",
            Environment::Production,
            slipway_core::SlotName::Blue,
            "shop:v1",
            "v1",
            "cred",
            5,
        );
        persistence.record_deployment(&deployment).unwrap();
        deployment.succeed(6);
        persistence
            .swap_registry(&entry(), 0, Some(&deployment))
            .unwrap();

        let history = persistence
            .list_deployments("shop", Environment::Production, 5)
            .unwrap();
        assert!(history.degraded);
        assert_eq!(history.value, vec![deployment]);
    }

    #[test]
    fn reconcile_drains_journals_once() {
        let (dir, store, persistence) = setup();
        store.set_available(false);
        let deployment = Deployment::begin(
            "shop",
            Environment::Production,
            slipway_core::SlotName::Blue,
            "shop:v1",
            "v1",
            "cred",
            5,
        );
        persistence.record_deployment(&deployment).unwrap();
        assert!(persistence.record_audit(&audit("a1")).unwrap().degraded);

        store.set_available(true);
        persistence.reconcile().unwrap();
        assert_eq!(store.inner().list_audit(10).unwrap(), vec![audit("a1")]);
        assert!(!dir.path().join("deployments.jsonl").exists());
        assert!(!dir.path().join("audit.jsonl").exists());

        // A second pass finds nothing to replay.
        persistence.reconcile().unwrap();
        assert_eq!(store.inner().list_audit(10).unwrap().len(), 1);
        assert_eq!(
            store
                .inner()
                .list_deployments("shop", Environment::Production, 10)
                .unwrap(),
            vec![deployment]
        );
    }
}
