use slipway_auth::AuthError;
use slipway_container::RuntimeError;
use slipway_core::{Environment, SlotName};
use slipway_proxy::ProxyError;
use slipway_state::{SlotState, StateError, TransitionError};
use thiserror::Error;

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Typed failure of a deploy, promote, rollback or status call.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("unknown project {name:?}")]
    UnknownProject {
        name: String,
        suggestion: Option<String>,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("concurrent change on {key}: {reason}")]
    Conflict { key: String, reason: String },

    #[error("no free port pair left in the {environment} range {start}-{end}")]
    PortRangeExhausted {
        environment: Environment,
        start: u16,
        end: u16,
    },

    #[error("failed to pull image {image}: {message}")]
    ImagePullFailed { image: String, message: String },

    #[error("failed to start container {container}: {message}")]
    ContainerStartFailed { container: String, message: String },

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("container {container} did not become healthy: {detail}")]
    HealthCheckTimeout { container: String, detail: String },

    #[error("container {container} failed its health check: {detail}")]
    HealthCheckFailed { container: String, detail: String },

    #[error("proxy configuration rejected: {0}")]
    ConfigRejected(String),

    #[error("rollback window for slot {slot} closed at {expired_at}")]
    GraceExpired { slot: SlotName, expired_at: u64 },

    #[error("no slot is in its grace period")]
    NoGraceSlot,

    #[error("slot {slot} is {state}; only a deployed slot can be promoted")]
    SlotNotDeployed { slot: SlotName, state: SlotState },

    #[error("persistence error: {0}")]
    Persistence(StateError),

    #[error("registry invariant violated: {0}")]
    Invariant(String),

    /// Any of the above, hit after the durable store was found unreachable.
    #[error(transparent)]
    Degraded(Box<OrchestrationError>),
}

impl OrchestrationError {
    /// Wrap as [`OrchestrationError::Degraded`] when `degraded` is set.
    pub fn degraded_if(self, degraded: bool) -> Self {
        if degraded && !self.is_degraded() {
            OrchestrationError::Degraded(Box::new(self))
        } else {
            self
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, OrchestrationError::Degraded(_))
    }

    /// The underlying failure, without the degraded wrapper.
    pub fn root(&self) -> &OrchestrationError {
        match self {
            OrchestrationError::Degraded(inner) => inner.root(),
            other => other,
        }
    }

    /// Stable error class carried in the operation envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationError::Degraded(inner) => inner.kind(),
            OrchestrationError::Auth(_) => "auth_error",
            OrchestrationError::UnknownProject { .. }
            | OrchestrationError::Validation(_)
            | OrchestrationError::SlotNotDeployed { .. } => "validation_error",
            OrchestrationError::Conflict { .. } | OrchestrationError::PortRangeExhausted { .. } => {
                "conflict_error"
            }
            OrchestrationError::ImagePullFailed { .. }
            | OrchestrationError::ContainerStartFailed { .. }
            | OrchestrationError::Runtime(_) => "runtime_error",
            OrchestrationError::HealthCheckTimeout { .. }
            | OrchestrationError::HealthCheckFailed { .. } => "health_check_timeout",
            OrchestrationError::ConfigRejected(_) => "config_rejected",
            OrchestrationError::GraceExpired { .. } | OrchestrationError::NoGraceSlot => {
                "grace_expired"
            }
            OrchestrationError::Persistence(_) | OrchestrationError::Invariant(_) => {
                "persistence_error"
            }
        }
    }

    /// Actionable guidance for the caller, when there is any.
    pub fn hint(&self) -> Option<String> {
        match self {
            OrchestrationError::Degraded(inner) => inner.hint(),
            OrchestrationError::Auth(AuthError::RateLimited { retry_after }) => Some(format!(
                "wait {}s before retrying",
                retry_after.as_secs().max(1)
            )),
            OrchestrationError::Auth(AuthError::InsufficientRole { required, .. }) => {
                Some(format!("ask a team owner for a {required} credential"))
            }
            OrchestrationError::Auth(e) if e.is_unauthenticated() => {
                Some("issue a new credential with `slipwayd credential issue`".to_string())
            }
            OrchestrationError::UnknownProject {
                suggestion: Some(name),
                ..
            } => Some(format!("did you mean {name:?}?")),
            OrchestrationError::UnknownProject { .. } => {
                Some("register the project with `slipwayd project register`".to_string())
            }
            OrchestrationError::Conflict { .. } => {
                Some("another operation is running on this environment; retry once it finishes".to_string())
            }
            OrchestrationError::PortRangeExhausted { environment, .. } => Some(format!(
                "widen [ports.{environment}] or remove unused environments"
            )),
            OrchestrationError::ImagePullFailed { .. } => {
                Some("check the image reference and registry credentials".to_string())
            }
            OrchestrationError::HealthCheckTimeout { .. }
            | OrchestrationError::HealthCheckFailed { .. } => Some(
                "make sure the application answers 2xx on its health path and listens on the configured internal port"
                    .to_string(),
            ),
            OrchestrationError::ConfigRejected(_) => {
                Some("the previous proxy configuration is still in effect".to_string())
            }
            OrchestrationError::GraceExpired { .. } | OrchestrationError::NoGraceSlot => {
                Some("deploy the previous version again and promote it".to_string())
            }
            OrchestrationError::SlotNotDeployed { .. } => {
                Some("deploy into the slot before promoting it".to_string())
            }
            _ => None,
        }
    }
}

impl From<StateError> for OrchestrationError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::VersionConflict {
                key,
                expected,
                found,
            } => OrchestrationError::Conflict {
                key,
                reason: format!("registry moved from version {expected} to {found}"),
            },
            StateError::PortConflict { port, holder } => OrchestrationError::Conflict {
                key: holder,
                reason: format!("port {port} was claimed concurrently"),
            },
            other => OrchestrationError::Persistence(other),
        }
    }
}

impl From<TransitionError> for OrchestrationError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::SlotNotDeployable { slot, state } => {
                OrchestrationError::Validation(format!("slot {slot} is {state} and cannot receive a deploy"))
            }
            TransitionError::SlotNotDeployed { slot, state } => {
                OrchestrationError::SlotNotDeployed { slot, state }
            }
            TransitionError::NoGraceSlot => OrchestrationError::NoGraceSlot,
            TransitionError::GraceExpired { slot, expired_at } => {
                OrchestrationError::GraceExpired { slot, expired_at }
            }
            TransitionError::Invariant(message) => OrchestrationError::Invariant(message),
        }
    }
}

impl From<ProxyError> for OrchestrationError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::InvalidHost(host) => {
                OrchestrationError::Validation(format!("invalid host name {host:?}"))
            }
            ProxyError::InvalidLabel(e) => OrchestrationError::Validation(e.to_string()),
            ProxyError::ConfigRejected(message) => OrchestrationError::ConfigRejected(message),
            other => OrchestrationError::ConfigRejected(other.to_string()),
        }
    }
}
