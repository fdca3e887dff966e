//! PromoteEngine — switches live traffic to a deployed slot.
//!
//! The registry is written only after the proxy reloaded with the target
//! port listed first. If that final write fails the proxy change is
//! reverted, so routing and registry never disagree for long.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use slipway_auth::AuthContext;
use slipway_container::container_name;
use slipway_core::{Environment, Role, SlotName, epoch_secs};
use slipway_proxy::{AppliedChange, SiteBlock, default_host};
use slipway_state::{
    OperationKind, PendingOperation, Project, Promotion, SlotRegistryEntry, SlotState,
};

use crate::context::{OrchestrationContext, detached};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::lease::Lease;

#[derive(Debug, Clone)]
pub struct PromoteRequest {
    pub project: String,
    pub environment: Environment,
    /// Slot to promote; defaults to the most recently deployed one.
    pub slot: Option<SlotName>,
}

impl PromoteRequest {
    pub fn new(project: &str, environment: Environment) -> Self {
        Self {
            project: project.to_string(),
            environment,
            slot: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromoteOutcome {
    pub project: String,
    pub environment: Environment,
    pub slot: SlotName,
    pub port: u16,
    /// Slot that was active before, now in grace.
    pub previous: Option<SlotName>,
    pub grace_expires_at: Option<u64>,
    pub already_active: bool,
    pub hosts: Vec<String>,
    pub entry: SlotRegistryEntry,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct PromoteEngine {
    ctx: Arc<OrchestrationContext>,
}

impl PromoteEngine {
    pub fn new(ctx: Arc<OrchestrationContext>) -> Self {
        Self { ctx }
    }

    /// Runs to completion even if the returned future is dropped.
    pub async fn promote(
        &self,
        auth: &AuthContext,
        request: &PromoteRequest,
    ) -> OrchestrationResult<PromoteOutcome> {
        let engine = self.clone();
        let auth = auth.clone();
        let request = request.clone();
        detached("promote", async move {
            let mut degraded = false;
            let result = engine.run(&auth, &request, &mut degraded).await;
            result.map_err(|e| e.degraded_if(degraded))
        })
        .await
    }

    async fn run(
        &self,
        auth: &AuthContext,
        request: &PromoteRequest,
        degraded: &mut bool,
    ) -> OrchestrationResult<PromoteOutcome> {
        let ctx = &self.ctx;
        let environment = request.environment;

        let resolved = ctx.resolve_project(auth, &request.project, Role::Member)?;
        *degraded |= resolved.degraded;
        let project = resolved.value;
        let hosts = routed_hosts(&project, environment, &ctx.settings.base_domain);

        let loaded = ctx.persistence.get_registry(&project.name, environment)?;
        *degraded |= loaded.degraded;
        let entry = loaded.value.ok_or(OrchestrationError::SlotNotDeployed {
            slot: request.slot.unwrap_or(SlotName::FIRST),
            state: SlotState::Empty,
        })?;

        let target = request.slot.unwrap_or_else(|| promotion_target(&entry));
        let state = entry.slot(target).state;
        match state {
            SlotState::Active => {
                debug!(project = %project.name, %environment, slot = %target, "slot already active");
                return Ok(PromoteOutcome {
                    project: project.name,
                    environment,
                    slot: target,
                    port: entry.slot(target).port,
                    previous: None,
                    grace_expires_at: entry.grace_expires_at,
                    already_active: true,
                    hosts,
                    entry,
                    degraded: *degraded,
                });
            }
            SlotState::Deployed => {}
            SlotState::Empty | SlotState::Grace => {
                return Err(OrchestrationError::SlotNotDeployed { slot: target, state });
            }
        }

        let now = epoch_secs();
        let lease = Lease::acquire(
            &ctx.persistence,
            entry,
            PendingOperation {
                operation: OperationKind::Promote,
                slot: target,
                holder: auth.credential_id.clone(),
                deployment_id: None,
                started_at: now,
            },
            ctx.settings.lease_ttl,
            now,
        )?;
        *degraded |= lease.degraded;

        let switched = self.switch(&project, environment, target, &hosts, &lease).await;
        let change = match switched {
            Ok(change) => change,
            Err(e) => {
                lease.release(&ctx.persistence, None);
                warn!(project = %project.name, %environment, slot = %target, error = %e, "promote failed");
                return Err(e);
            }
        };

        let finished = epoch_secs();
        let mut next = lease.entry.clone();
        let committed = next
            .promote(target, finished, ctx.settings.grace_period.as_secs())
            .map_err(OrchestrationError::from)
            .and_then(|promotion| {
                lease
                    .commit(&ctx.persistence, next, None)
                    .map(|(entry, degraded)| (promotion, entry, degraded))
            });
        let (promotion, entry, commit_degraded) = match committed {
            Ok(done) => done,
            Err(e) => {
                revert(ctx, &change).await;
                lease.release(&ctx.persistence, None);
                warn!(project = %project.name, %environment, slot = %target, error = %e, "promote commit failed");
                return Err(e);
            }
        };
        *degraded |= commit_degraded;

        let previous = match promotion {
            Promotion::Switched { previous } => previous,
            Promotion::AlreadyActive => None,
        };
        info!(
            project = %project.name,
            %environment,
            slot = %target,
            previous = ?previous,
            grace_expires_at = ?entry.grace_expires_at,
            degraded = *degraded,
            "slot promoted"
        );
        Ok(PromoteOutcome {
            project: project.name,
            environment,
            slot: target,
            port: entry.slot(target).port,
            previous,
            grace_expires_at: entry.grace_expires_at,
            already_active: false,
            hosts,
            entry,
            degraded: *degraded,
        })
    }

    /// Verify the target once, then route to it with the current active
    /// slot as drain target.
    async fn switch(
        &self,
        project: &Project,
        environment: Environment,
        target: SlotName,
        hosts: &[String],
        lease: &Lease,
    ) -> OrchestrationResult<AppliedChange> {
        let ctx = &self.ctx;
        let slot = lease.entry.slot(target);
        let container = container_name(&project.name, environment, target);
        ctx.verifier
            .verify_once(&container, slot.port)
            .await
            .map_err(|e| OrchestrationError::HealthCheckFailed {
                container: container.clone(),
                detail: e.to_string(),
            })?;
        debug!(%container, "promotion target healthy");

        let block = SiteBlock {
            project: project.name.clone(),
            environment,
            hosts: hosts.to_vec(),
            slot: target,
            version: slot.version.clone(),
            primary_port: slot.port,
            drain_port: lease.entry.active_slot.map(|s| lease.entry.slot(s).port),
            policy: ctx.settings.upstream.clone(),
        };
        Ok(ctx.proxy.apply(&block).await?)
    }
}

/// Custom domains for the environment, or the generated default host.
pub(crate) fn routed_hosts(project: &Project, environment: Environment, base_domain: &str) -> Vec<String> {
    let domains = project.environment(environment).domains;
    if domains.is_empty() {
        vec![default_host(&project.name, environment, base_domain)]
    } else {
        domains
    }
}

/// Put the proxy back after a failed registry commit.
pub(crate) async fn revert(ctx: &OrchestrationContext, change: &AppliedChange) {
    if let Err(e) = ctx.proxy.revert(change).await {
        warn!(path = %change.path.display(), error = %e, "failed to revert proxy change");
    }
}

/// The deployed slot to promote when none is named: the most recent deploy.
fn promotion_target(entry: &SlotRegistryEntry) -> SlotName {
    entry
        .slots()
        .into_iter()
        .filter(|s| s.state == SlotState::Deployed)
        .max_by_key(|s| s.deployed_at)
        .map(|s| s.name)
        .unwrap_or_else(|| entry.deploy_target())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use slipway_container::ContainerHealth;

    use super::*;
    use crate::deploy::DeployRequest;
    use crate::testing::Harness;

    const GRACE: u64 = 48 * 3600;

    async fn deploy(h: &Harness, version: &str) {
        let auth = h.auth("acme", Role::Member);
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
    }

    fn request() -> PromoteRequest {
        PromoteRequest::new("myapp", Environment::Production)
    }

    #[tokio::test(start_paused = true)]
    async fn first_promotion_routes_to_blue() {
        let h = Harness::new();
        h.register_project("myapp", "acme");
        deploy(&h, "v1").await;

        let auth = h.auth("acme", Role::Member);
        let outcome = h.promoter().promote(&auth, &request()).await.unwrap();
        assert_eq!(outcome.slot, SlotName::Blue);
        assert_eq!(outcome.previous, None);
        assert_eq!(outcome.grace_expires_at, None);
        assert_eq!(outcome.hosts, vec!["myapp.apps.localhost".to_string()]);

        let site = h.site_file("myapp", Environment::Production).unwrap();
        assert!(site.contains("reverse_proxy localhost:4000 {"));
        assert_eq!(h.controller.validations.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.reloads.load(Ordering::SeqCst), 1);
        let entry = h.entry("myapp", Environment::Production).unwrap();
        assert_eq!(entry.active_slot, Some(SlotName::Blue));
        assert!(entry.pending.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn second_promotion_puts_previous_into_grace() {
        let h = Harness::new();
        h.register_project("myapp", "acme");
        let auth = h.auth("acme", Role::Member);
        deploy(&h, "v1").await;
        h.promoter().promote(&auth, &request()).await.unwrap();
        deploy(&h, "v2").await;

        let before = epoch_secs();
        let outcome = h.promoter().promote(&auth, &request()).await.unwrap();
        assert_eq!(outcome.slot, SlotName::Green);
        assert_eq!(outcome.previous, Some(SlotName::Blue));
        let expires = outcome.grace_expires_at.unwrap();
        assert!(expires >= before + GRACE && expires <= epoch_secs() + GRACE);

        let entry = h.entry("myapp", Environment::Production).unwrap();
        assert_eq!(entry.green.state, SlotState::Active);
        assert_eq!(entry.blue.state, SlotState::Grace);

        let site = h.site_file("myapp", Environment::Production).unwrap();
        assert!(site.contains("reverse_proxy localhost:4001 localhost:4000 {"));
        assert!(site.contains("X-Slipway-Version v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn promoting_active_slot_is_idempotent() {
        let h = Harness::new();
        h.register_project("myapp", "acme");
        let auth = h.auth("acme", Role::Member);
        deploy(&h, "v1").await;
        h.promoter().promote(&auth, &request()).await.unwrap();
        let before = h.entry("myapp", Environment::Production).unwrap();

        let mut again = request();
        again.slot = Some(SlotName::Blue);
        let outcome = h.promoter().promote(&auth, &again).await.unwrap();
        assert!(outcome.already_active);
        assert_eq!(outcome.entry, before);
        assert_eq!(h.entry("myapp", Environment::Production).unwrap(), before);
        assert_eq!(h.controller.validations.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_slot_cannot_be_promoted() {
        let h = Harness::new();
        h.register_project("myapp", "acme");
        let auth = h.auth("acme", Role::Member);

        let err = h.promoter().promote(&auth, &request()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::SlotNotDeployed { .. }));

        deploy(&h, "v1").await;
        let mut green = request();
        green.slot = Some(SlotName::Green);
        let err = h.promoter().promote(&auth, &green).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::SlotNotDeployed {
                slot: SlotName::Green,
                state: SlotState::Empty
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_config_leaves_everything_as_is() {
        let h = Harness::new();
        h.register_project("myapp", "acme");
        let auth = h.auth("acme", Role::Member);
        deploy(&h, "v1").await;
        h.promoter().promote(&auth, &request()).await.unwrap();
        deploy(&h, "v2").await;
        let site_before = h.site_file("myapp", Environment::Production);
        let entry_before = h.entry("myapp", Environment::Production).unwrap();

        h.controller.reject.store(true, Ordering::SeqCst);
        let err = h.promoter().promote(&auth, &request()).await.unwrap_err();
        assert_eq!(err.kind(), "config_rejected");
        assert_eq!(h.controller.validations.load(Ordering::SeqCst), 2);
        assert_eq!(h.controller.reloads.load(Ordering::SeqCst), 1);

        assert_eq!(h.site_file("myapp", Environment::Production), site_before);
        let entry = h.entry("myapp", Environment::Production).unwrap();
        assert_eq!(entry.blue, entry_before.blue);
        assert_eq!(entry.green, entry_before.green);
        assert_eq!(entry.active_slot, Some(SlotName::Blue));
        assert!(entry.pending.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_target_is_not_promoted() {
        let h = Harness::new();
        h.register_project("myapp", "acme");
        let auth = h.auth("acme", Role::Member);
        deploy(&h, "v1").await;

        h.runtime.set_health(ContainerHealth::Unhealthy);
        let err = h.promoter().promote(&auth, &request()).await.unwrap_err();
        assert_eq!(err.kind(), "health_check_timeout");
        assert_eq!(h.site_file("myapp", Environment::Production), None);
        assert_eq!(h.controller.validations.load(Ordering::SeqCst), 0);
        assert_eq!(h.controller.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_during_outage_is_flagged_degraded() {
        let h = Harness::new();
        h.register_project("myapp", "acme");
        let auth = h.auth("acme", Role::Member);
        deploy(&h, "v1").await;

        h.store.set_available(false);
        h.controller.reject.store(true, Ordering::SeqCst);
        let err = h.promoter().promote(&auth, &request()).await.unwrap_err();
        assert!(err.is_degraded());
        assert_eq!(err.kind(), "config_rejected");

        let mirrored = h.persistence.mirror().get_entry("myapp/production").unwrap().unwrap();
        assert!(mirrored.entry.pending.is_none());
        assert_eq!(mirrored.entry.active_slot, None);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_domains_are_routed() {
        let h = Harness::new();
        let mut project = Project::new("myapp", "acme", 1);
        project.environments.entry(Environment::Production).or_default().domains =
            vec!["myapp.example.com".to_string(), "www.myapp.example.com".to_string()];
        h.persistence.put_project(&project).unwrap();
        let auth = h.auth("acme", Role::Member);
        deploy(&h, "v1").await;

        let outcome = h.promoter().promote(&auth, &request()).await.unwrap();
        assert_eq!(outcome.hosts.len(), 2);
        let site = h.site_file("myapp", Environment::Production).unwrap();
        assert!(site.contains("myapp.example.com, www.myapp.example.com {"));
    }
}
