//! DeployOrchestrator — moves a new image into the non-active slot.
//!
//! Protocol, each step aborting the rest on failure:
//!
//! 1. resolve the project (typo suggestion on miss)
//! 2. load the registry entry, or allocate a port pair for a new one
//! 3. pick the slot that is not active
//! 4. take the registry lease and record a pending deployment
//! 5. pull, replace the slot's container, sync its env file, run it
//! 6. poll until the runtime, in-container and external probes agree
//! 7. commit the slot as `deployed` together with the deployment row
//!
//! A failure after the container started tears it down again; the slot's
//! registry state is only ever written by the final commit. The protocol
//! runs on its own task, so a caller that stops waiting does not strand
//! the lease or an unverified container.

use std::fmt::Display;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use slipway_auth::AuthContext;
use slipway_container::{RunSpec, SlotVariables, container_name};
use slipway_core::{Environment, ImageRef, Role, SlotName, epoch_secs, validate_version_label};
use slipway_state::{
    Deployment, OperationKind, PendingOperation, Project, Release, SlotRegistryEntry, StepStatus,
};

use crate::context::{OrchestrationContext, detached};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::lease::Lease;

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub project: String,
    pub environment: Environment,
    pub image: String,
    /// Version label; defaults to the image tag.
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub deployment_id: String,
    pub project: String,
    pub environment: Environment,
    pub slot: SlotName,
    pub port: u16,
    pub image: String,
    pub version: String,
    /// Address reaching the new slot directly, bypassing live routing.
    pub preview_url: String,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct DeployOrchestrator {
    ctx: Arc<OrchestrationContext>,
}

impl DeployOrchestrator {
    pub fn new(ctx: Arc<OrchestrationContext>) -> Self {
        Self { ctx }
    }

    /// Runs to completion even if the returned future is dropped.
    pub async fn deploy(
        &self,
        auth: &AuthContext,
        request: &DeployRequest,
    ) -> OrchestrationResult<DeployOutcome> {
        let engine = self.clone();
        let auth = auth.clone();
        let request = request.clone();
        detached("deploy", async move {
            let mut degraded = false;
            let result = engine.run(&auth, &request, &mut degraded).await;
            result.map_err(|e| e.degraded_if(degraded))
        })
        .await
    }

    async fn run(
        &self,
        auth: &AuthContext,
        request: &DeployRequest,
        degraded: &mut bool,
    ) -> OrchestrationResult<DeployOutcome> {
        let ctx = &self.ctx;
        let environment = request.environment;

        let resolved = ctx.resolve_project(auth, &request.project, Role::Member)?;
        *degraded |= resolved.degraded;
        let project = resolved.value;

        let image = ImageRef::parse(&request.image)
            .map_err(|e| OrchestrationError::Validation(e.to_string()))?;
        let version = match request.version.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => default_version(&image),
        };
        validate_version_label(&version)
            .map_err(|e| OrchestrationError::Validation(e.to_string()))?;

        let now = epoch_secs();
        let loaded = ctx.persistence.get_registry(&project.name, environment)?;
        *degraded |= loaded.degraded;
        let entry = match loaded.value {
            Some(entry) => entry,
            None => {
                let registry = ctx.persistence.list_registry()?;
                *degraded |= registry.degraded;
                let base = ctx.ports.allocate(environment, &registry.value).await?;
                info!(project = %project.name, %environment, base, "new slot pair");
                SlotRegistryEntry::new(&project.name, environment, base, now)
            }
        };

        let target = entry.deploy_target();
        let port = entry.slot(target).port;
        let mut deployment = Deployment::begin(
            &project.name,
            environment,
            target,
            &image.to_string(),
            &version,
            &auth.credential_id,
            now,
        );

        let lease = Lease::acquire(
            &ctx.persistence,
            entry,
            PendingOperation {
                operation: OperationKind::Deploy,
                slot: target,
                holder: auth.credential_id.clone(),
                deployment_id: Some(deployment.id.clone()),
                started_at: now,
            },
            ctx.settings.lease_ttl,
            now,
        )?;
        *degraded |= lease.degraded;
        *degraded |= ctx.persistence.record_deployment(&deployment)?.degraded;

        info!(
            project = %project.name,
            %environment,
            slot = %target,
            port,
            image = %image,
            deployment = %deployment.id,
            "deploy started"
        );
        let started = tokio::time::Instant::now();

        if let Err(e) = self
            .launch(&project, environment, target, port, &image, &version, &mut deployment)
            .await
        {
            deployment.fail(&e.to_string(), epoch_secs());
            lease.release(&ctx.persistence, Some(&deployment));
            warn!(project = %project.name, %environment, slot = %target, error = %e, "deploy failed");
            return Err(e);
        }

        let finished = epoch_secs();
        let mut next = lease.entry.clone();
        let release = Release {
            image: image.to_string(),
            version: version.clone(),
            deployed_by: auth.credential_id.clone(),
        };
        let committed = next
            .record_deploy(target, &release, finished)
            .map_err(OrchestrationError::from)
            .and_then(|()| {
                let mut done = deployment.clone();
                done.step("commit", StepStatus::Ok, None, finished);
                done.succeed(finished);
                lease
                    .commit(&ctx.persistence, next, Some(&done))
                    .map(|(_, degraded)| (done, degraded))
            });
        let (deployment, commit_degraded) = match committed {
            Ok(done) => done,
            Err(e) => {
                let container = container_name(&project.name, environment, target);
                self.teardown(&container).await;
                deployment.step("commit", StepStatus::Failed, Some(e.to_string()), finished);
                deployment.fail(&e.to_string(), finished);
                lease.release(&ctx.persistence, Some(&deployment));
                warn!(project = %project.name, %environment, slot = %target, error = %e, "deploy commit failed");
                return Err(e);
            }
        };
        *degraded |= commit_degraded;

        info!(
            project = %project.name,
            %environment,
            slot = %target,
            port,
            version = %version,
            elapsed_ms = started.elapsed().as_millis() as u64,
            degraded = *degraded,
            "deploy succeeded"
        );
        Ok(DeployOutcome {
            deployment_id: deployment.id,
            project: project.name,
            environment,
            slot: target,
            port,
            image: image.to_string(),
            version,
            preview_url: ctx.preview_url(port),
            degraded: *degraded,
        })
    }

    /// Steps 5 and 6: get a healthy container serving on `port`.
    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        project: &Project,
        environment: Environment,
        slot: SlotName,
        port: u16,
        image: &ImageRef,
        version: &str,
        deployment: &mut Deployment,
    ) -> OrchestrationResult<()> {
        let ctx = &self.ctx;
        let container = container_name(&project.name, environment, slot);

        let pulled = ctx.runtime.pull(image).await;
        track(deployment, "pull", &pulled);
        pulled.map_err(|e| OrchestrationError::ImagePullFailed {
            image: image.to_string(),
            message: e.to_string(),
        })?;
        debug!(image = %image, "image pulled");

        let replaced = match ctx.runtime.stop(&container).await {
            Ok(()) => ctx.runtime.remove(&container).await,
            Err(e) => Err(e),
        };
        track(deployment, "replace", &replaced);
        replaced?;
        debug!(%container, "previous container removed");

        let settings = project.environment(environment);
        let env_file = ctx.env_files.sync(
            &project.name,
            &settings.env,
            &SlotVariables {
                port: ctx.settings.internal_port,
                slot,
                environment,
                version,
            },
        );
        track(deployment, "env", &env_file);
        let env_file = env_file?;
        debug!(path = %env_file.display(), "env file synchronized");

        let resources = settings.resources.unwrap_or_default();
        let spec = RunSpec {
            name: container.clone(),
            image: image.clone(),
            host_port: port,
            internal_port: ctx.settings.internal_port,
            env_file,
            cpus: resources.cpus.unwrap_or_else(|| ctx.settings.cpus.clone()),
            memory: resources.memory.unwrap_or_else(|| ctx.settings.memory.clone()),
            network: ctx.settings.network.clone(),
            health_path: ctx.settings.health_path.clone(),
            labels: [
                ("slipway.project".to_string(), project.name.clone()),
                ("slipway.environment".to_string(), environment.to_string()),
                ("slipway.slot".to_string(), slot.to_string()),
                ("slipway.version".to_string(), version.to_string()),
            ]
            .into_iter()
            .collect(),
        };
        let started = ctx.runtime.run(&spec).await;
        track(deployment, "run", &started);
        if let Err(e) = started {
            self.teardown(&container).await;
            return Err(OrchestrationError::ContainerStartFailed {
                container,
                message: e.to_string(),
            });
        }
        debug!(%container, port, "container started");

        let health = ctx.verifier.wait_until_healthy(&container, port).await;
        track(deployment, "health", &health);
        if let Err(e) = health {
            self.teardown(&container).await;
            return Err(OrchestrationError::HealthCheckTimeout {
                container,
                detail: e.to_string(),
            });
        }
        Ok(())
    }

    /// Best-effort removal of a container this call started.
    async fn teardown(&self, container: &str) {
        let runtime = &self.ctx.runtime;
        if let Err(e) = runtime.stop(container).await {
            warn!(container, error = %e, "failed to stop container during teardown");
        }
        match runtime.remove(container).await {
            Ok(()) => debug!(container, "container torn down"),
            Err(e) => warn!(container, error = %e, "failed to remove container during teardown"),
        }
    }
}

fn track<T, E: Display>(deployment: &mut Deployment, step: &str, result: &Result<T, E>) {
    let (status, detail) = match result {
        Ok(_) => (StepStatus::Ok, None),
        Err(e) => (StepStatus::Failed, Some(e.to_string())),
    };
    deployment.step(step, status, detail, epoch_secs());
}

/// The tag, or a short digest for digest-pinned images.
fn default_version(image: &ImageRef) -> String {
    match (image.effective_tag(), &image.digest) {
        (Some(tag), _) => tag.to_string(),
        (None, Some(digest)) => {
            let hex = digest.trim_start_matches("sha256:");
            hex.chars().take(12).collect()
        }
        (None, None) => "latest".to_string(),
    }
}
