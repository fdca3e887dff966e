//! Read-only view of a (project, environment).

use serde::Serialize;

use slipway_auth::AuthContext;
use slipway_core::{Environment, Role};
use slipway_state::{Deployment, SlotRegistryEntry};

use crate::context::OrchestrationContext;
use crate::error::OrchestrationResult;

/// Deployments returned alongside the registry entry.
pub const RECENT_DEPLOYMENTS: usize = 10;

#[derive(Debug, Clone)]
pub struct StatusRequest {
    pub project: String,
    pub environment: Environment,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub project: String,
    pub environment: Environment,
    /// `None` until the first deploy created the pair.
    pub entry: Option<SlotRegistryEntry>,
    /// Newest first.
    pub deployments: Vec<Deployment>,
    pub degraded: bool,
}

pub fn slot_status(
    ctx: &OrchestrationContext,
    auth: &AuthContext,
    request: &StatusRequest,
) -> OrchestrationResult<SlotStatus> {
    let resolved = ctx.resolve_project(auth, &request.project, Role::Viewer)?;
    let project = resolved.value;
    let entry = ctx.persistence.get_registry(&project.name, request.environment)?;
    let deployments =
        ctx.persistence
            .list_deployments(&project.name, request.environment, RECENT_DEPLOYMENTS)?;
    Ok(SlotStatus {
        project: project.name,
        environment: request.environment,
        entry: entry.value,
        deployments: deployments.value,
        degraded: resolved.degraded || entry.degraded || deployments.degraded,
    })
}

#[cfg(test)]
mod tests {
    use slipway_core::SlotName;
    use slipway_state::DeploymentStatus;

    use super::*;
    use crate::deploy::DeployRequest;
    use crate::testing::Harness;

    fn request() -> StatusRequest {
        StatusRequest {
            project: "myapp".to_string(),
            environment: Environment::Production,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn viewer_sees_entry_and_history() {
        let h = Harness::new();
        h.register_project("myapp", "acme");
        let viewer = h.auth("acme", Role::Viewer);

        let status = slot_status(&h.context, &viewer, &request()).unwrap();
        assert!(status.entry.is_none());
        assert!(status.deployments.is_empty());

        let member = h.auth("acme", Role::Member);
        h.deployer()
            .deploy(
                &member,
                &DeployRequest {
                    project: "myapp".to_string(),
                    environment: Environment::Production,
                    image: "acme/myapp:v1".to_string(),
                    version: None,
                },
            )
            .await
            .unwrap();

        let status = slot_status(&h.context, &viewer, &request()).unwrap();
        let entry = status.entry.unwrap();
        assert_eq!(entry.deploy_target(), SlotName::Blue);
        assert_eq!(status.deployments.len(), 1);
        assert_eq!(status.deployments[0].status, DeploymentStatus::Success);
        assert!(!status.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn served_from_mirror_while_store_is_down() {
        let h = Harness::new();
        h.register_project("myapp", "acme");
        let viewer = h.auth("acme", Role::Viewer);
        h.store.set_available(false);

        let status = slot_status(&h.context, &viewer, &request()).unwrap();
        assert!(status.degraded);
        assert!(status.entry.is_none());
    }
}
