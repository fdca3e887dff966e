//! Domain types for the Slipway state layer.
//!
//! These types represent projects, the blue/green slot registry, deployment
//! history, audit entries, and stored credentials. All of them serialize
//! to/from JSON for storage in redb tables and in the file mirror.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use slipway_core::{Environment, Role, SlotName};

/// Unique identifier for a deployment attempt.
pub type DeploymentId = String;

/// Build the registry key for a (project, environment) pair.
pub fn registry_key(project: &str, environment: Environment) -> String {
    format!("{project}/{environment}")
}

// ── Project ───────────────────────────────────────────────────────

/// A registered application. Read by orchestration, never mutated by it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub name: String,
    pub team_id: String,
    #[serde(default)]
    pub environments: BTreeMap<Environment, ProjectEnvironment>,
    pub created_at: u64,
}

/// Per-environment settings declared for a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectEnvironment {
    /// Variables synchronized into each slot's env file.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Custom domains bound to this environment.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub resources: Option<ResourceOverrides>,
}

/// Per-project container limits overriding the runtime defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceOverrides {
    pub cpus: Option<String>,
    pub memory: Option<String>,
}

impl Project {
    pub fn new(name: &str, team_id: &str, created_at: u64) -> Self {
        Self {
            name: name.to_string(),
            team_id: team_id.to_string(),
            environments: BTreeMap::new(),
            created_at,
        }
    }

    /// Settings for an environment, empty when none were declared.
    pub fn environment(&self, environment: Environment) -> ProjectEnvironment {
        self.environments
            .get(&environment)
            .cloned()
            .unwrap_or_default()
    }
}

// ── Slots ─────────────────────────────────────────────────────────

/// Lifecycle state of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Empty,
    Deployed,
    Active,
    Grace,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::Deployed => "deployed",
            SlotState::Active => "active",
            SlotState::Grace => "grace",
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two instances that exist per (project, environment).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slot {
    pub name: SlotName,
    pub state: SlotState,
    pub port: u16,
    pub image: Option<String>,
    pub version: Option<String>,
    /// Unix timestamp of the last successful deploy into this slot.
    pub deployed_at: Option<u64>,
    /// Credential identity that performed the last deploy.
    pub deployed_by: Option<String>,
    /// Last-known health verdict.
    #[serde(default)]
    pub healthy: bool,
}

impl Slot {
    fn empty(name: SlotName, port: u16) -> Self {
        Self {
            name,
            state: SlotState::Empty,
            port,
            image: None,
            version: None,
            deployed_at: None,
            deployed_by: None,
            healthy: false,
        }
    }
}

/// The release a successful deploy writes into its target slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub image: String,
    pub version: String,
    pub deployed_by: String,
}

/// Which orchestration call holds a registry lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Deploy,
    Promote,
    Rollback,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OperationKind::Deploy => "deploy",
            OperationKind::Promote => "promote",
            OperationKind::Rollback => "rollback",
        })
    }
}

/// An in-flight operation recorded on a registry entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOperation {
    pub operation: OperationKind,
    pub slot: SlotName,
    pub holder: String,
    pub deployment_id: Option<DeploymentId>,
    pub started_at: u64,
}

impl PendingOperation {
    /// Whether the lease has outlived `ttl_secs` and may be taken over.
    pub fn is_stale(&self, now: u64, ttl_secs: u64) -> bool {
        now.saturating_sub(self.started_at) >= ttl_secs
    }
}

/// Violations of the two-slot invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("slot {slot} is {state} and cannot receive a deploy")]
    SlotNotDeployable { slot: SlotName, state: SlotState },

    #[error("slot {slot} is {state}; only a deployed slot can be promoted")]
    SlotNotDeployed { slot: SlotName, state: SlotState },

    #[error("no grace slot is available for rollback")]
    NoGraceSlot,

    #[error("grace period for slot {slot} expired at {expired_at}")]
    GraceExpired { slot: SlotName, expired_at: u64 },

    #[error("registry invariant violated: {0}")]
    Invariant(String),
}

/// Outcome of a promote transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// The target slot was already active; nothing changed.
    AlreadyActive,
    /// The target is now active; `previous` (if any) entered grace.
    Switched { previous: Option<SlotName> },
}

/// The single source of truth for live routing of one (project, environment).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotRegistryEntry {
    pub project: String,
    pub environment: Environment,
    pub blue: Slot,
    pub green: Slot,
    pub active_slot: Option<SlotName>,
    pub grace_expires_at: Option<u64>,
    /// Even base port of the pair: blue = base, green = base + 1.
    pub base_port: u16,
    /// Optimistic concurrency version; 0 means "never stored".
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub pending: Option<PendingOperation>,
    pub updated_at: u64,
}

impl SlotRegistryEntry {
    /// A fresh entry with both slots empty on the given port pair.
    pub fn new(project: &str, environment: Environment, base_port: u16, now: u64) -> Self {
        Self {
            project: project.to_string(),
            environment,
            blue: Slot::empty(SlotName::Blue, base_port + SlotName::Blue.port_offset()),
            green: Slot::empty(SlotName::Green, base_port + SlotName::Green.port_offset()),
            active_slot: None,
            grace_expires_at: None,
            base_port,
            version: 0,
            pending: None,
            updated_at: now,
        }
    }

    pub fn table_key(&self) -> String {
        registry_key(&self.project, self.environment)
    }

    pub fn slot(&self, name: SlotName) -> &Slot {
        match name {
            SlotName::Blue => &self.blue,
            SlotName::Green => &self.green,
        }
    }

    pub fn slot_mut(&mut self, name: SlotName) -> &mut Slot {
        match name {
            SlotName::Blue => &mut self.blue,
            SlotName::Green => &mut self.green,
        }
    }

    pub fn slots(&self) -> [&Slot; 2] {
        [&self.blue, &self.green]
    }

    /// Ports claimed by this entry.
    pub fn ports(&self) -> [u16; 2] {
        [self.blue.port, self.green.port]
    }

    pub fn grace_slot(&self) -> Option<SlotName> {
        self.slots()
            .into_iter()
            .find(|s| s.state == SlotState::Grace)
            .map(|s| s.name)
    }

    /// The slot a new deploy must target: never the active one, and the
    /// first named slot when nothing is active yet.
    pub fn deploy_target(&self) -> SlotName {
        match self.active_slot {
            Some(active) => active.other(),
            None => SlotName::FIRST,
        }
    }

    /// The lease currently held on this entry, ignoring stale ones.
    pub fn live_lease(&self, now: u64, ttl_secs: u64) -> Option<&PendingOperation> {
        self.pending.as_ref().filter(|p| !p.is_stale(now, ttl_secs))
    }

    /// Check the two-slot invariants.
    pub fn check_invariants(&self) -> Result<(), TransitionError> {
        let active: Vec<SlotName> = self
            .slots()
            .into_iter()
            .filter(|s| s.state == SlotState::Active)
            .map(|s| s.name)
            .collect();
        let grace_count = self
            .slots()
            .into_iter()
            .filter(|s| s.state == SlotState::Grace)
            .count();

        if active.len() > 1 {
            return Err(TransitionError::Invariant("both slots are active".to_string()));
        }
        if grace_count > 1 {
            return Err(TransitionError::Invariant("both slots are in grace".to_string()));
        }
        if grace_count == 1 && self.grace_expires_at.is_none() {
            return Err(TransitionError::Invariant(
                "grace slot without an expiry".to_string(),
            ));
        }
        if active.first().copied() != self.active_slot {
            return Err(TransitionError::Invariant(format!(
                "active pointer {:?} disagrees with slot states {:?}",
                self.active_slot, active
            )));
        }
        for slot in self.slots() {
            if slot.port != self.base_port + slot.name.port_offset() {
                return Err(TransitionError::Invariant(format!(
                    "slot {} has port {} outside pair {}",
                    slot.name, slot.port, self.base_port
                )));
            }
        }
        Ok(())
    }

    /// Record a successful deploy: `empty | deployed | grace → deployed`.
    ///
    /// Overwriting the grace slot ends its rollback window.
    pub fn record_deploy(
        &mut self,
        target: SlotName,
        release: &Release,
        now: u64,
    ) -> Result<(), TransitionError> {
        let state = self.slot(target).state;
        match state {
            SlotState::Empty | SlotState::Deployed => {}
            SlotState::Grace => self.grace_expires_at = None,
            SlotState::Active => {
                return Err(TransitionError::SlotNotDeployable { slot: target, state });
            }
        }

        let slot = self.slot_mut(target);
        slot.state = SlotState::Deployed;
        slot.image = Some(release.image.clone());
        slot.version = Some(release.version.clone());
        slot.deployed_at = Some(now);
        slot.deployed_by = Some(release.deployed_by.clone());
        slot.healthy = true;
        self.updated_at = now;
        self.check_invariants()
    }

    /// Switch traffic: `deployed → active`, previous `active → grace`.
    pub fn promote(
        &mut self,
        target: SlotName,
        now: u64,
        grace_secs: u64,
    ) -> Result<Promotion, TransitionError> {
        let state = self.slot(target).state;
        match state {
            SlotState::Active => return Ok(Promotion::AlreadyActive),
            SlotState::Deployed => {}
            SlotState::Empty | SlotState::Grace => {
                return Err(TransitionError::SlotNotDeployed { slot: target, state });
            }
        }

        let previous = self.active_slot;
        let sibling = target.other();
        match self.slot(sibling).state {
            SlotState::Active => {
                self.slot_mut(sibling).state = SlotState::Grace;
                self.grace_expires_at = Some(now + grace_secs);
            }
            SlotState::Grace => {
                // A grace slot without an active sibling cannot roll back to anything.
                self.slot_mut(sibling).state = SlotState::Deployed;
                self.grace_expires_at = None;
            }
            SlotState::Empty | SlotState::Deployed => {}
        }

        let slot = self.slot_mut(target);
        slot.state = SlotState::Active;
        slot.healthy = true;
        self.active_slot = Some(target);
        self.updated_at = now;
        self.check_invariants()?;
        Ok(Promotion::Switched { previous })
    }

    /// Restore the grace slot: `grace → active`, current `active → deployed`.
    ///
    /// Returns the slot that became active.
    pub fn rollback(&mut self, now: u64) -> Result<SlotName, TransitionError> {
        let grace = self.grace_slot().ok_or(TransitionError::NoGraceSlot)?;
        let expires_at = self.grace_expires_at.ok_or_else(|| {
            TransitionError::Invariant("grace slot without an expiry".to_string())
        })?;
        if now >= expires_at {
            return Err(TransitionError::GraceExpired {
                slot: grace,
                expired_at: expires_at,
            });
        }

        let sibling = grace.other();
        match self.slot(sibling).state {
            SlotState::Active => self.slot_mut(sibling).state = SlotState::Deployed,
            SlotState::Empty | SlotState::Deployed | SlotState::Grace => {
                return Err(TransitionError::Invariant(format!(
                    "grace slot {grace} has no active sibling"
                )));
            }
        }

        let slot = self.slot_mut(grace);
        slot.state = SlotState::Active;
        slot.healthy = true;
        self.active_slot = Some(grace);
        self.grace_expires_at = None;
        self.updated_at = now;
        self.check_invariants()?;
        Ok(grace)
    }
}

// ── Deployments ───────────────────────────────────────────────────

/// Status of a deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Success,
    Failed,
}

/// Outcome of one protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStep {
    pub name: String,
    pub status: StepStatus,
    pub detail: Option<String>,
    pub at: u64,
}

/// Append-only history row for one deploy attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub project: String,
    pub environment: Environment,
    pub slot: SlotName,
    pub version: String,
    pub image: String,
    pub status: DeploymentStatus,
    pub deployed_by: String,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    #[serde(default)]
    pub steps: Vec<DeploymentStep>,
    pub error: Option<String>,
}

impl Deployment {
    /// Begin a new pending deployment with a fresh id.
    pub fn begin(
        project: &str,
        environment: Environment,
        slot: SlotName,
        image: &str,
        version: &str,
        deployed_by: &str,
        now: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project: project.to_string(),
            environment,
            slot,
            version: version.to_string(),
            image: image.to_string(),
            status: DeploymentStatus::Pending,
            deployed_by: deployed_by.to_string(),
            started_at: now,
            finished_at: None,
            steps: Vec::new(),
            error: None,
        }
    }

    pub fn table_key(&self) -> String {
        format!("{}:{}", registry_key(&self.project, self.environment), self.id)
    }

    pub fn step(&mut self, name: &str, status: StepStatus, detail: Option<String>, now: u64) {
        self.steps.push(DeploymentStep {
            name: name.to_string(),
            status,
            detail,
            at: now,
        });
    }

    pub fn succeed(&mut self, now: u64) {
        self.status = DeploymentStatus::Success;
        self.finished_at = Some(now);
    }

    pub fn fail(&mut self, error: &str, now: u64) {
        self.status = DeploymentStatus::Failed;
        self.error = Some(error.to_string());
        self.finished_at = Some(now);
    }
}

// ── Audit ─────────────────────────────────────────────────────────

/// Outcome recorded for an orchestration call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure { kind: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: String,
    pub operation: String,
    pub team_id: Option<String>,
    pub credential_id: Option<String>,
    pub project: Option<String>,
    pub environment: Option<Environment>,
    pub params: serde_json::Value,
    pub outcome: AuditOutcome,
    pub message: Option<String>,
    pub degraded: bool,
    pub duration_ms: u64,
    /// Unix timestamp in milliseconds.
    pub recorded_at: u64,
}

impl AuditEntry {
    pub fn table_key(&self) -> String {
        format!("{:020}:{}", self.recorded_at, self.id)
    }
}

// ── Credentials ───────────────────────────────────────────────────

/// A stored API credential. Only the hash of the secret token is kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialRecord {
    pub id: String,
    pub team_id: String,
    pub role: Role,
    /// Hex SHA-256 of the token segment.
    pub token_hash: String,
    /// Project names this credential may act on; `*` grants all.
    pub scopes: Vec<String>,
    pub expires_at: Option<u64>,
    pub created_at: u64,
    pub last_used_at: Option<u64>,
}

impl CredentialRecord {
    pub fn allows_project(&self, project: &str) -> bool {
        self.scopes.iter().any(|s| s == "*" || s == project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: u64 = 48 * 3600;

    fn release(version: &str) -> Release {
        Release {
            image: format!("registry.local/myapp:{version}"),
            version: version.to_string(),
            deployed_by: "cred-1".to_string(),
        }
    }

    fn fresh() -> SlotRegistryEntry {
        SlotRegistryEntry::new("myapp", Environment::Production, 4000, 1_000)
    }

    #[test]
    fn new_entry_uses_parity_ports() {
        let entry = fresh();
        assert_eq!(entry.blue.port, 4000);
        assert_eq!(entry.green.port, 4001);
        assert_eq!(entry.deploy_target(), SlotName::Blue);
        entry.check_invariants().unwrap();
    }

    #[test]
    fn deploy_then_promote_then_rollback() {
        let mut entry = fresh();
        entry.record_deploy(SlotName::Blue, &release("v1"), 1_100).unwrap();
        assert_eq!(entry.blue.state, SlotState::Deployed);

        let promotion = entry.promote(SlotName::Blue, 1_200, GRACE).unwrap();
        assert_eq!(promotion, Promotion::Switched { previous: None });
        assert_eq!(entry.active_slot, Some(SlotName::Blue));
        assert_eq!(entry.grace_expires_at, None);

        assert_eq!(entry.deploy_target(), SlotName::Green);
        entry.record_deploy(SlotName::Green, &release("v2"), 1_300).unwrap();
        let promotion = entry.promote(SlotName::Green, 1_400, GRACE).unwrap();
        assert_eq!(
            promotion,
            Promotion::Switched {
                previous: Some(SlotName::Blue)
            }
        );
        assert_eq!(entry.blue.state, SlotState::Grace);
        assert_eq!(entry.grace_expires_at, Some(1_400 + GRACE));

        let restored = entry.rollback(1_500).unwrap();
        assert_eq!(restored, SlotName::Blue);
        assert_eq!(entry.blue.state, SlotState::Active);
        assert_eq!(entry.green.state, SlotState::Deployed);
        assert_eq!(entry.grace_expires_at, None);
    }

    #[test]
    fn promote_active_is_idempotent() {
        let mut entry = fresh();
        entry.record_deploy(SlotName::Blue, &release("v1"), 1_100).unwrap();
        entry.promote(SlotName::Blue, 1_200, GRACE).unwrap();
        let before = entry.clone();

        assert_eq!(
            entry.promote(SlotName::Blue, 9_999, GRACE).unwrap(),
            Promotion::AlreadyActive
        );
        assert_eq!(entry, before);
    }

    #[test]
    fn promote_empty_slot_is_rejected() {
        let mut entry = fresh();
        assert_eq!(
            entry.promote(SlotName::Green, 1_200, GRACE),
            Err(TransitionError::SlotNotDeployed {
                slot: SlotName::Green,
                state: SlotState::Empty
            })
        );
    }

    #[test]
    fn rollback_after_expiry_is_refused_without_change() {
        let mut entry = fresh();
        entry.record_deploy(SlotName::Blue, &release("v1"), 1_000).unwrap();
        entry.promote(SlotName::Blue, 1_000, GRACE).unwrap();
        entry.record_deploy(SlotName::Green, &release("v2"), 1_000).unwrap();
        entry.promote(SlotName::Green, 1_000, GRACE).unwrap();
        let before = entry.clone();

        let err = entry.rollback(1_000 + GRACE).unwrap_err();
        assert_eq!(
            err,
            TransitionError::GraceExpired {
                slot: SlotName::Blue,
                expired_at: 1_000 + GRACE
            }
        );
        assert_eq!(entry, before);
    }

    #[test]
    fn rollback_without_grace_slot() {
        let mut entry = fresh();
        assert_eq!(entry.rollback(1_000), Err(TransitionError::NoGraceSlot));
    }

    #[test]
    fn deploying_over_grace_slot_closes_the_window() {
        let mut entry = fresh();
        entry.record_deploy(SlotName::Blue, &release("v1"), 1_000).unwrap();
        entry.promote(SlotName::Blue, 1_000, GRACE).unwrap();
        entry.record_deploy(SlotName::Green, &release("v2"), 1_000).unwrap();
        entry.promote(SlotName::Green, 1_000, GRACE).unwrap();

        assert_eq!(entry.deploy_target(), SlotName::Blue);
        entry.record_deploy(SlotName::Blue, &release("v3"), 2_000).unwrap();
        assert_eq!(entry.blue.state, SlotState::Deployed);
        assert_eq!(entry.grace_expires_at, None);
        assert_eq!(entry.grace_slot(), None);
    }

    #[test]
    fn deploy_into_active_slot_is_rejected() {
        let mut entry = fresh();
        entry.record_deploy(SlotName::Blue, &release("v1"), 1_000).unwrap();
        entry.promote(SlotName::Blue, 1_000, GRACE).unwrap();
        assert!(matches!(
            entry.record_deploy(SlotName::Blue, &release("v2"), 1_000),
            Err(TransitionError::SlotNotDeployable { .. })
        ));
    }

    #[test]
    fn invariants_catch_two_active_slots() {
        let mut entry = fresh();
        entry.blue.state = SlotState::Active;
        entry.green.state = SlotState::Active;
        entry.active_slot = Some(SlotName::Blue);
        assert!(entry.check_invariants().is_err());
    }

    #[test]
    fn unknown_slot_state_fails_deserialization() {
        let mut value = serde_json::to_value(fresh()).unwrap();
        value["blue"]["state"] = serde_json::json!("draining");
        assert!(serde_json::from_value::<SlotRegistryEntry>(value).is_err());
    }

    #[test]
    fn stale_lease_detection() {
        let lease = PendingOperation {
            operation: OperationKind::Deploy,
            slot: SlotName::Blue,
            holder: "cred-1".to_string(),
            deployment_id: None,
            started_at: 1_000,
        };
        assert!(!lease.is_stale(1_100, 900));
        assert!(lease.is_stale(1_900, 900));
    }
}
