//! Durable-store doubles for exercising degraded mode.

use std::sync::atomic::{AtomicBool, Ordering};

use slipway_core::Environment;

use crate::durable::DurableStore;
use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::*;

/// Wraps a real store and can be switched "offline" at runtime.
pub struct FlakyStore {
    inner: StateStore,
    available: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: StateStore) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &StateStore {
        &self.inner
    }

    fn check(&self) -> StateResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StateError::Unavailable("connection refused".to_string()))
        }
    }
}

impl DurableStore for FlakyStore {
    fn put_project(&self, project: &Project) -> StateResult<()> {
        self.check()?;
        self.inner.put_project(project)
    }

    fn get_project(&self, name: &str) -> StateResult<Option<Project>> {
        self.check()?;
        self.inner.get_project(name)
    }

    fn list_projects(&self) -> StateResult<Vec<Project>> {
        self.check()?;
        self.inner.list_projects()
    }

    fn get_registry(
        &self,
        project: &str,
        environment: Environment,
    ) -> StateResult<Option<SlotRegistryEntry>> {
        self.check()?;
        self.inner.get_registry(project, environment)
    }

    fn list_registry(&self) -> StateResult<Vec<SlotRegistryEntry>> {
        self.check()?;
        self.inner.list_registry()
    }

    fn swap_registry(
        &self,
        entry: &SlotRegistryEntry,
        expected: u64,
        deployment: Option<&Deployment>,
    ) -> StateResult<u64> {
        self.check()?;
        self.inner.swap_registry(entry, expected, deployment)
    }

    fn restore_registry(&self, entry: &SlotRegistryEntry) -> StateResult<()> {
        self.check()?;
        self.inner.restore_registry(entry)
    }

    fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.check()?;
        self.inner.put_deployment(deployment)
    }

    fn list_deployments(
        &self,
        project: &str,
        environment: Environment,
        limit: usize,
    ) -> StateResult<Vec<Deployment>> {
        self.check()?;
        self.inner.list_deployments(project, environment, limit)
    }

    fn append_audit(&self, entry: &AuditEntry) -> StateResult<()> {
        self.check()?;
        self.inner.append_audit(entry)
    }

    fn list_audit(&self, limit: usize) -> StateResult<Vec<AuditEntry>> {
        self.check()?;
        self.inner.list_audit(limit)
    }

    fn put_credential(&self, credential: &CredentialRecord) -> StateResult<()> {
        self.check()?;
        self.inner.put_credential(credential)
    }

    fn find_credential_by_hash(&self, token_hash: &str) -> StateResult<Option<CredentialRecord>> {
        self.check()?;
        self.inner.find_credential_by_hash(token_hash)
    }

    fn touch_credential(&self, token_hash: &str, now: u64) -> StateResult<()> {
        self.check()?;
        self.inner.touch_credential(token_hash, now)
    }
}
