//! The durable-store capability consumed by the orchestration layer.

use slipway_core::Environment;

use crate::error::StateResult;
use crate::types::*;

/// Authoritative, transactional persistence for Slipway state.
///
/// Implementations must make `swap_registry` atomic: the version check,
/// the entry write, and the optional deployment row either all land or
/// none do.
pub trait DurableStore: Send + Sync {
    fn put_project(&self, project: &Project) -> StateResult<()>;

    fn get_project(&self, name: &str) -> StateResult<Option<Project>>;

    fn list_projects(&self) -> StateResult<Vec<Project>>;

    fn get_registry(
        &self,
        project: &str,
        environment: Environment,
    ) -> StateResult<Option<SlotRegistryEntry>>;

    fn list_registry(&self) -> StateResult<Vec<SlotRegistryEntry>>;

    /// Compare-and-swap a registry entry.
    ///
    /// Succeeds only when the stored version equals `expected` (0 for an
    /// entry that does not exist yet). Creating an entry fails with
    /// `PortConflict` when another entry already holds one of its ports.
    /// Returns the new version.
    fn swap_registry(
        &self,
        entry: &SlotRegistryEntry,
        expected: u64,
        deployment: Option<&Deployment>,
    ) -> StateResult<u64>;

    /// Overwrite a registry entry without a version check (reconciliation only).
    fn restore_registry(&self, entry: &SlotRegistryEntry) -> StateResult<()>;

    fn put_deployment(&self, deployment: &Deployment) -> StateResult<()>;

    /// Most recent deployments for a pair, newest first.
    fn list_deployments(
        &self,
        project: &str,
        environment: Environment,
        limit: usize,
    ) -> StateResult<Vec<Deployment>>;

    fn append_audit(&self, entry: &AuditEntry) -> StateResult<()>;

    /// Most recent audit entries, newest first.
    fn list_audit(&self, limit: usize) -> StateResult<Vec<AuditEntry>>;

    fn put_credential(&self, credential: &CredentialRecord) -> StateResult<()>;

    fn find_credential_by_hash(&self, token_hash: &str) -> StateResult<Option<CredentialRecord>>;

    fn touch_credential(&self, token_hash: &str, now: u64) -> StateResult<()>;
}
