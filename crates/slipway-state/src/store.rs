//! StateStore — redb-backed durable persistence for Slipway.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing). redb allows a single writer process per file, which matches
//! the one-daemon-per-host deployment model.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use slipway_core::Environment;

use crate::durable::DurableStore;
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [PROJECTS, REGISTRY, DEPLOYMENTS, AUDIT, CREDENTIALS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every value whose key starts with `prefix`, in key order.
    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }
}

impl DurableStore for StateStore {
    // ── Projects ───────────────────────────────────────────────────

    fn put_project(&self, project: &Project) -> StateResult<()> {
        self.put_json(PROJECTS, &project.name, project)?;
        debug!(project = %project.name, "project stored");
        Ok(())
    }

    fn get_project(&self, name: &str) -> StateResult<Option<Project>> {
        self.get_json(PROJECTS, name)
    }

    fn list_projects(&self) -> StateResult<Vec<Project>> {
        self.scan_json(PROJECTS, "")
    }

    // ── Slot registry ──────────────────────────────────────────────

    fn get_registry(
        &self,
        project: &str,
        environment: Environment,
    ) -> StateResult<Option<SlotRegistryEntry>> {
        self.get_json(REGISTRY, &registry_key(project, environment))
    }

    fn list_registry(&self) -> StateResult<Vec<SlotRegistryEntry>> {
        self.scan_json(REGISTRY, "")
    }

    fn swap_registry(
        &self,
        entry: &SlotRegistryEntry,
        expected: u64,
        deployment: Option<&Deployment>,
    ) -> StateResult<u64> {
        let key = entry.table_key();
        let mut stored = entry.clone();
        stored.version = expected + 1;
        let bytes = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
            let current: Option<SlotRegistryEntry> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let found = current.as_ref().map(|e| e.version).unwrap_or(0);
            if found != expected {
                return Err(StateError::VersionConflict {
                    key,
                    expected,
                    found,
                });
            }

            if current.is_none() {
                for row in table.iter().map_err(map_err!(Read))? {
                    let (_, value) = row.map_err(map_err!(Read))?;
                    let other: SlotRegistryEntry =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if let Some(port) = entry.ports().into_iter().find(|p| other.ports().contains(p)) {
                        return Err(StateError::PortConflict {
                            port,
                            holder: other.table_key(),
                        });
                    }
                }
            }

            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        if let Some(deployment) = deployment {
            let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(deployment.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version = stored.version, "registry entry swapped");
        Ok(stored.version)
    }

    fn restore_registry(&self, entry: &SlotRegistryEntry) -> StateResult<()> {
        self.put_json(REGISTRY, &entry.table_key(), entry)
    }

    // ── Deployments ────────────────────────────────────────────────

    fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put_json(DEPLOYMENTS, &deployment.table_key(), deployment)
    }

    fn list_deployments(
        &self,
        project: &str,
        environment: Environment,
        limit: usize,
    ) -> StateResult<Vec<Deployment>> {
        let prefix = format!("{}:", registry_key(project, environment));
        let mut results: Vec<Deployment> = self.scan_json(DEPLOYMENTS, &prefix)?;
        results.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        results.truncate(limit);
        Ok(results)
    }

    // ── Audit ──────────────────────────────────────────────────────

    fn append_audit(&self, entry: &AuditEntry) -> StateResult<()> {
        self.put_json(AUDIT, &entry.table_key(), entry)
    }

    fn list_audit(&self, limit: usize) -> StateResult<Vec<AuditEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let audit: AuditEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(audit);
        }
        Ok(results)
    }

    // ── Credentials ────────────────────────────────────────────────

    fn put_credential(&self, credential: &CredentialRecord) -> StateResult<()> {
        self.put_json(CREDENTIALS, &credential.token_hash, credential)?;
        debug!(credential = %credential.id, team = %credential.team_id, "credential stored");
        Ok(())
    }

    fn find_credential_by_hash(&self, token_hash: &str) -> StateResult<Option<CredentialRecord>> {
        self.get_json(CREDENTIALS, token_hash)
    }

    fn touch_credential(&self, token_hash: &str, now: u64) -> StateResult<()> {
        let mut credential: CredentialRecord = self
            .get_json(CREDENTIALS, token_hash)?
            .ok_or_else(|| StateError::NotFound(format!("credential {token_hash}")))?;
        credential.last_used_at = Some(now);
        self.put_json(CREDENTIALS, token_hash, &credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_core::{Role, SlotName};

    fn test_entry(project: &str, base_port: u16) -> SlotRegistryEntry {
        SlotRegistryEntry::new(project, Environment::Production, base_port, 1000)
    }

    fn test_deployment(project: &str, started_at: u64) -> Deployment {
        Deployment::begin(
            project,
            Environment::Production,
            SlotName::Blue,
            "registry.local/app:v1",
            "v1",
            "cred-1",
            started_at,
        )
    }

    // ── Registry CAS ───────────────────────────────────────────────

    #[test]
    fn registry_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let entry = test_entry("shop", 4000);

        let version = store.swap_registry(&entry, 0, None).unwrap();
        assert_eq!(version, 1);

        let stored = store
            .get_registry("shop", Environment::Production)
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.blue.port, 4000);
    }

    #[test]
    fn registry_stale_version_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let entry = test_entry("shop", 4000);
        store.swap_registry(&entry, 0, None).unwrap();
        store.swap_registry(&entry, 1, None).unwrap();

        let err = store.swap_registry(&entry, 1, None).unwrap_err();
        assert!(matches!(
            err,
            StateError::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
        assert!(err.is_conflict());
    }

    #[test]
    fn registry_create_twice_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        store.swap_registry(&test_entry("shop", 4000), 0, None).unwrap();
        let err = store.swap_registry(&test_entry("shop", 4002), 0, None).unwrap_err();
        assert!(matches!(err, StateError::VersionConflict { .. }));
    }

    #[test]
    fn registry_create_rejects_taken_ports() {
        let store = StateStore::open_in_memory().unwrap();
        store.swap_registry(&test_entry("shop", 4000), 0, None).unwrap();

        let err = store.swap_registry(&test_entry("blog", 4000), 0, None).unwrap_err();
        match err {
            StateError::PortConflict { port, holder } => {
                assert_eq!(port, 4000);
                assert_eq!(holder, "shop/production");
            }
            other => panic!("expected port conflict, got {other:?}"),
        }
        assert!(store.get_registry("blog", Environment::Production).unwrap().is_none());
    }

    #[test]
    fn swap_writes_deployment_in_same_transaction() {
        let store = StateStore::open_in_memory().unwrap();
        let mut deployment = test_deployment("shop", 1000);
        deployment.succeed(1010);

        store
            .swap_registry(&test_entry("shop", 4000), 0, Some(&deployment))
            .unwrap();
        let history = store
            .list_deployments("shop", Environment::Production, 10)
            .unwrap();
        assert_eq!(history, vec![deployment.clone()]);

        // A rejected swap must not leave the deployment row behind.
        let mut second = test_deployment("shop", 2000);
        second.succeed(2010);
        assert!(store
            .swap_registry(&test_entry("shop", 4000), 0, Some(&second))
            .is_err());
        let history = store
            .list_deployments("shop", Environment::Production, 10)
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn deployments_listed_newest_first_and_limited() {
        let store = StateStore::open_in_memory().unwrap();
        for t in [1000, 3000, 2000] {
            store.put_deployment(&test_deployment("shop", t)).unwrap();
        }
        store.put_deployment(&test_deployment("blog", 5000)).unwrap();

        let recent = store
            .list_deployments("shop", Environment::Production, 2)
            .unwrap();
        let started: Vec<u64> = recent.iter().map(|d| d.started_at).collect();
        assert_eq!(started, vec![3000, 2000]);
    }

    // ── Audit ──────────────────────────────────────────────────────

    #[test]
    fn audit_listed_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        for (i, at) in [10u64, 30, 20].into_iter().enumerate() {
            store
                .append_audit(&AuditEntry {
                    id: format!("a{i}"),
                    operation: "deploy".to_string(),
                    team_id: Some("team1".to_string()),
                    credential_id: None,
                    project: Some("shop".to_string()),
                    environment: Some(Environment::Production),
                    params: serde_json::json!({}),
                    outcome: AuditOutcome::Success,
                    message: None,
                    degraded: false,
                    duration_ms: 5,
                    recorded_at: at,
                })
                .unwrap();
        }
        let recent = store.list_audit(2).unwrap();
        let times: Vec<u64> = recent.iter().map(|a| a.recorded_at).collect();
        assert_eq!(times, vec![30, 20]);
    }

    // ── Credentials ────────────────────────────────────────────────

    #[test]
    fn credential_lookup_and_touch() {
        let store = StateStore::open_in_memory().unwrap();
        let credential = CredentialRecord {
            id: "cred-1".to_string(),
            team_id: "team1".to_string(),
            role: Role::Member,
            token_hash: "abc123".to_string(),
            scopes: vec!["*".to_string()],
            expires_at: None,
            created_at: 1000,
            last_used_at: None,
        };
        store.put_credential(&credential).unwrap();

        store.touch_credential("abc123", 2000).unwrap();
        let found = store.find_credential_by_hash("abc123").unwrap().unwrap();
        assert_eq!(found.last_used_at, Some(2000));
        assert!(store.find_credential_by_hash("nope").unwrap().is_none());
        assert!(matches!(
            store.touch_credential("nope", 1),
            Err(StateError::NotFound(_))
        ));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state").join("slipway.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_project(&Project::new("shop", "team1", 1000)).unwrap();
            store.swap_registry(&test_entry("shop", 4000), 0, None).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_project("shop").unwrap().unwrap().team_id, "team1");
        assert_eq!(store.list_registry().unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_projects().unwrap().is_empty());
        assert!(store.list_registry().unwrap().is_empty());
        assert!(store.list_audit(10).unwrap().is_empty());
        assert!(store.get_project("nope").unwrap().is_none());
    }
}
