//! Shared collaborators and settings for the orchestration engines.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use slipway_auth::AuthContext;
use slipway_container::{ContainerRuntime, EnvFileSync};
use slipway_core::config::ConfigError;
use slipway_core::{Role, SlipwayConfig};
use slipway_health::{HealthPolicy, HealthVerifier};
use slipway_proxy::{ProxyConfigManager, UpstreamPolicy};
use slipway_state::{Degradable, Persistence, Project};

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::ports::PortAllocator;
use crate::suggest::closest;

/// Values the engines read from configuration.
#[derive(Debug, Clone)]
pub struct OrchestrationSettings {
    /// Host used in preview addresses.
    pub public_host: String,
    pub base_domain: String,
    pub internal_port: u16,
    pub cpus: String,
    pub memory: String,
    pub network: Option<String>,
    pub health_path: String,
    pub grace_period: Duration,
    pub lease_ttl: Duration,
    pub upstream: UpstreamPolicy,
}

impl OrchestrationSettings {
    pub fn from_config(config: &SlipwayConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            public_host: config.server.public_host.clone(),
            base_domain: config.proxy.base_domain.clone(),
            internal_port: config.runtime.internal_port,
            cpus: config.runtime.cpus.clone(),
            memory: config.runtime.memory.clone(),
            network: config.runtime.network.clone(),
            health_path: config.health.path.clone(),
            grace_period: config.promotion.grace_period()?,
            lease_ttl: config.promotion.lease_ttl()?,
            upstream: UpstreamPolicy {
                health_uri: config.health.path.clone(),
                ..UpstreamPolicy::default()
            },
        })
    }

    pub fn health_policy(config: &SlipwayConfig) -> Result<HealthPolicy, ConfigError> {
        Ok(HealthPolicy {
            path: config.health.path.clone(),
            internal_port: config.runtime.internal_port,
            timeout: config.health.timeout()?,
            interval: config.health.interval()?,
        })
    }
}

/// Everything a deploy, promote or rollback touches.
pub struct OrchestrationContext {
    pub persistence: Persistence,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub verifier: Arc<HealthVerifier>,
    pub proxy: Arc<ProxyConfigManager>,
    pub ports: PortAllocator,
    pub env_files: EnvFileSync,
    pub settings: OrchestrationSettings,
}

impl OrchestrationContext {
    /// Load a project and check the caller may run a `required` operation on it.
    ///
    /// The role is checked before the lookup, so callers without it learn
    /// nothing about which projects exist. Unknown names fail with the
    /// closest name the caller's team owns.
    pub fn resolve_project(
        &self,
        auth: &AuthContext,
        name: &str,
        required: Role,
    ) -> OrchestrationResult<Degradable<Project>> {
        auth.require_role(required)?;
        let lookup = self.persistence.get_project(name)?;
        let degraded = lookup.degraded;
        let Some(project) = lookup.value else {
            let known = self.persistence.list_projects()?.value;
            let suggestion = closest(
                name,
                known
                    .iter()
                    .filter(|p| p.team_id == auth.team_id)
                    .map(|p| p.name.as_str()),
            );
            debug!(project = name, suggestion = ?suggestion, "unknown project");
            return Err(OrchestrationError::UnknownProject {
                name: name.to_string(),
                suggestion,
            }
            .degraded_if(degraded));
        };
        auth.authorize(required, &project)
            .map_err(|e| OrchestrationError::from(e).degraded_if(degraded))?;
        Ok(Degradable {
            value: project,
            degraded,
        })
    }

    pub fn preview_url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.settings.public_host)
    }
}

/// Run an engine body on its own task. Dropping the caller's future no
/// longer cancels it, so every started operation still reaches its
/// teardown and releases its lease.
pub(crate) async fn detached<T, F>(operation: &'static str, body: F) -> OrchestrationResult<T>
where
    F: Future<Output = OrchestrationResult<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(body).await {
        Ok(result) => result,
        Err(e) => Err(OrchestrationError::Invariant(format!(
            "{operation} task ended abnormally: {e}"
        ))),
    }
}
