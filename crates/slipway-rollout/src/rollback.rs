//! RollbackEngine — routes traffic back to the grace slot.
//!
//! Refused outright once the grace window has closed; no lease is taken
//! and nothing is written in that case.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use slipway_auth::AuthContext;
use slipway_container::container_name;
use slipway_core::{Environment, Role, SlotName, epoch_secs};
use slipway_proxy::{AppliedChange, SiteBlock};
use slipway_state::{OperationKind, PendingOperation, Project, SlotRegistryEntry};

use crate::context::{OrchestrationContext, detached};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::lease::Lease;
use crate::promote::{revert, routed_hosts};

#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub project: String,
    pub environment: Environment,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub project: String,
    pub environment: Environment,
    /// Slot serving traffic again.
    pub slot: SlotName,
    pub port: u16,
    /// Formerly active slot, now `deployed`.
    pub demoted: SlotName,
    pub entry: SlotRegistryEntry,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct RollbackEngine {
    ctx: Arc<OrchestrationContext>,
}

impl RollbackEngine {
    pub fn new(ctx: Arc<OrchestrationContext>) -> Self {
        Self { ctx }
    }

    /// Runs to completion even if the returned future is dropped.
    pub async fn rollback(
        &self,
        auth: &AuthContext,
        request: &RollbackRequest,
    ) -> OrchestrationResult<RollbackOutcome> {
        let engine = self.clone();
        let auth = auth.clone();
        let request = request.clone();
        detached("rollback", async move {
            let mut degraded = false;
            let result = engine.run(&auth, &request, &mut degraded).await;
            result.map_err(|e| e.degraded_if(degraded))
        })
        .await
    }

    async fn run(
        &self,
        auth: &AuthContext,
        request: &RollbackRequest,
        degraded: &mut bool,
    ) -> OrchestrationResult<RollbackOutcome> {
        let ctx = &self.ctx;
        let environment = request.environment;

        let resolved = ctx.resolve_project(auth, &request.project, Role::Admin)?;
        *degraded |= resolved.degraded;
        let project = resolved.value;

        let loaded = ctx.persistence.get_registry(&project.name, environment)?;
        *degraded |= loaded.degraded;
        let entry = loaded.value.ok_or(OrchestrationError::NoGraceSlot)?;

        let now = epoch_secs();
        let restored = entry.clone().rollback(now)?;
        let demoted = restored.other();

        let lease = Lease::acquire(
            &ctx.persistence,
            entry,
            PendingOperation {
                operation: OperationKind::Rollback,
                slot: restored,
                holder: auth.credential_id.clone(),
                deployment_id: None,
                started_at: now,
            },
            ctx.settings.lease_ttl,
            now,
        )?;
        *degraded |= lease.degraded;

        let change = match self.switch(&project, environment, restored, &lease).await {
            Ok(change) => change,
            Err(e) => {
                lease.release(&ctx.persistence, None);
                warn!(project = %project.name, %environment, slot = %restored, error = %e, "rollback failed");
                return Err(e);
            }
        };

        let mut next = lease.entry.clone();
        let committed = next
            .rollback(epoch_secs())
            .map_err(OrchestrationError::from)
            .and_then(|_| lease.commit(&ctx.persistence, next, None));
        let (entry, commit_degraded) = match committed {
            Ok(done) => done,
            Err(e) => {
                revert(ctx, &change).await;
                lease.release(&ctx.persistence, None);
                warn!(project = %project.name, %environment, slot = %restored, error = %e, "rollback commit failed");
                return Err(e);
            }
        };
        *degraded |= commit_degraded;

        info!(
            project = %project.name,
            %environment,
            slot = %restored,
            demoted = %demoted,
            degraded = *degraded,
            "rolled back to grace slot"
        );
        Ok(RollbackOutcome {
            project: project.name,
            environment,
            slot: restored,
            port: entry.slot(restored).port,
            demoted,
            entry,
            degraded: *degraded,
        })
    }

    async fn switch(
        &self,
        project: &Project,
        environment: Environment,
        restored: SlotName,
        lease: &Lease,
    ) -> OrchestrationResult<AppliedChange> {
        let ctx = &self.ctx;
        let slot = lease.entry.slot(restored);
        let container = container_name(&project.name, environment, restored);
        ctx.verifier
            .verify_once(&container, slot.port)
            .await
            .map_err(|e| OrchestrationError::HealthCheckFailed {
                container: container.clone(),
                detail: e.to_string(),
            })?;
        debug!(%container, "grace slot healthy");

        let block = SiteBlock {
            project: project.name.clone(),
            environment,
            hosts: routed_hosts(project, environment, &ctx.settings.base_domain),
            slot: restored,
            version: slot.version.clone(),
            primary_port: slot.port,
            drain_port: Some(lease.entry.slot(restored.other()).port),
            policy: ctx.settings.upstream.clone(),
        };
        Ok(ctx.proxy.apply(&block).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use slipway_state::SlotState;

    use super::*;
    use crate::deploy::DeployRequest;
    use crate::promote::PromoteRequest;
    use crate::testing::Harness;

    fn request() -> RollbackRequest {
        RollbackRequest {
            project: "myapp".to_string(),
            environment: Environment::Production,
        }
    }

    /// Blue active with v1 superseded by green v2: blue sits in grace.
    async fn blue_in_grace(h: &Harness) {
        h.register_project("myapp", "acme");
        let auth = h.auth("acme", Role::Member);
        for version in ["v1", "v2"] {
            h.deployer()
                .deploy(
                    &auth,
                    &DeployRequest {
                        project: "myapp".to_string(),
                        environment: Environment::Production,
                        image: format!("acme/myapp:{version}"),
                        version: None,
                    },
                )
                .await
                .unwrap();
            h.promoter()
                .promote(&auth, &PromoteRequest::new("myapp", Environment::Production))
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_restores_grace_slot() {
        let h = Harness::new();
        blue_in_grace(&h).await;

        let admin = h.auth("acme", Role::Admin);
        let outcome = h.roller().rollback(&admin, &request()).await.unwrap();
        assert_eq!(outcome.slot, SlotName::Blue);
        assert_eq!(outcome.demoted, SlotName::Green);

        let entry = h.entry("myapp", Environment::Production).unwrap();
        assert_eq!(entry.blue.state, SlotState::Active);
        assert_eq!(entry.green.state, SlotState::Deployed);
        assert_eq!(entry.grace_expires_at, None);
        assert!(entry.pending.is_none());

        let site = h.site_file("myapp", Environment::Production).unwrap();
        assert!(site.contains("reverse_proxy localhost:4000 localhost:4001 {"));
        assert!(site.contains("X-Slipway-Version v1"));

        // The demoted slot stays promotable.
        let member = h.auth("acme", Role::Member);
        let outcome = h
            .promoter()
            .promote(&member, &PromoteRequest::new("myapp", Environment::Production))
            .await
            .unwrap();
        assert_eq!(outcome.slot, SlotName::Green);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_grace_changes_nothing() {
        let h = Harness::new();
        blue_in_grace(&h).await;
        let mut entry = h.entry("myapp", Environment::Production).unwrap();
        entry.grace_expires_at = Some(epoch_secs().saturating_sub(1));
        h.overwrite_entry(&entry);
        let stored = h.entry("myapp", Environment::Production).unwrap();
        let site_before = h.site_file("myapp", Environment::Production);
        let reloads = h.controller.reloads.load(Ordering::SeqCst);

        let admin = h.auth("acme", Role::Admin);
        let err = h.roller().rollback(&admin, &request()).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::GraceExpired {
                slot: SlotName::Blue,
                ..
            }
        ));
        assert_eq!(err.kind(), "grace_expired");

        assert_eq!(h.entry("myapp", Environment::Production).unwrap(), stored);
        assert_eq!(h.site_file("myapp", Environment::Production), site_before);
        assert_eq!(h.controller.reloads.load(Ordering::SeqCst), reloads);
    }

    #[tokio::test(start_paused = true)]
    async fn no_grace_slot_is_refused() {
        let h = Harness::new();
        h.register_project("myapp", "acme");
        let admin = h.auth("acme", Role::Admin);
        let err = h.roller().rollback(&admin, &request()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::NoGraceSlot));
    }

    #[tokio::test(start_paused = true)]
    async fn members_cannot_roll_back() {
        let h = Harness::new();
        blue_in_grace(&h).await;
        let member = h.auth("acme", Role::Member);
        let err = h.roller().rollback(&member, &request()).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::Auth(slipway_auth::AuthError::InsufficientRole { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reload_keeps_green_active() {
        let h = Harness::new();
        blue_in_grace(&h).await;
        let site_before = h.site_file("myapp", Environment::Production);

        h.controller.fail_reload.store(true, Ordering::SeqCst);
        let admin = h.auth("acme", Role::Admin);
        let err = h.roller().rollback(&admin, &request()).await.unwrap_err();
        assert_eq!(err.kind(), "config_rejected");

        assert_eq!(h.site_file("myapp", Environment::Production), site_before);
        let entry = h.entry("myapp", Environment::Production).unwrap();
        assert_eq!(entry.green.state, SlotState::Active);
        assert_eq!(entry.blue.state, SlotState::Grace);
        assert!(entry.pending.is_none());
    }
}
