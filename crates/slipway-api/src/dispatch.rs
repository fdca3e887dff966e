//! Dispatcher — auth → engine → audit → metrics for one operation.

use std::sync::Arc;

use axum::http::StatusCode;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use slipway_auth::{AuthContext, AuthError, AuthGate};
use slipway_core::epoch_millis;
use slipway_metrics::{OperationMetrics, SUCCESS};
use slipway_rollout::{
    DeployOrchestrator, DeployRequest, OrchestrationContext, OrchestrationError,
    OrchestrationResult, PromoteEngine, PromoteRequest, RollbackEngine, RollbackRequest,
    StatusRequest, slot_status,
};
use slipway_state::{AuditEntry, AuditOutcome, Degradable};

use crate::audit::AuditRecorder;
use crate::operation::{ErrorBody, Operation, OperationResponse};

/// A finished call: the envelope plus the HTTP status it maps to.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub status: StatusCode,
    pub response: OperationResponse,
}

pub struct Dispatcher {
    gate: AuthGate,
    context: Arc<OrchestrationContext>,
    deployer: DeployOrchestrator,
    promoter: PromoteEngine,
    roller: RollbackEngine,
    audit: Arc<dyn AuditRecorder>,
    metrics: Arc<OperationMetrics>,
}

impl Dispatcher {
    pub fn new(
        gate: AuthGate,
        context: Arc<OrchestrationContext>,
        audit: Arc<dyn AuditRecorder>,
        metrics: Arc<OperationMetrics>,
    ) -> Self {
        Self {
            gate,
            deployer: DeployOrchestrator::new(context.clone()),
            promoter: PromoteEngine::new(context.clone()),
            roller: RollbackEngine::new(context.clone()),
            context,
            audit,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<OperationMetrics> {
        &self.metrics
    }

    /// Run one operation on behalf of the bearer of `credential`.
    pub async fn dispatch(&self, credential: Option<&str>, operation: Operation) -> Dispatched {
        let started = Instant::now();
        let name = operation.name();
        debug!(operation = name, project = operation.project(), "dispatching operation");

        let auth = match self.authenticate(credential).await {
            Ok(auth) => auth,
            Err(e) => return self.finish(&operation, None, Err(e), false, started).await,
        };
        let result = self.run(&auth.value, &operation).await;
        self.finish(&operation, Some(&auth.value), result, auth.degraded, started)
            .await
    }

    async fn authenticate(
        &self,
        credential: Option<&str>,
    ) -> OrchestrationResult<Degradable<AuthContext>> {
        let raw = credential.ok_or_else(|| {
            AuthError::Malformed("missing bearer credential".to_string())
        })?;
        Ok(self.gate.authenticate(raw).await?)
    }

    async fn run(
        &self,
        auth: &AuthContext,
        operation: &Operation,
    ) -> OrchestrationResult<(serde_json::Value, bool)> {
        match operation {
            Operation::SlotStatus {
                project,
                environment,
            } => {
                let status = slot_status(
                    &self.context,
                    auth,
                    &StatusRequest {
                        project: project.clone(),
                        environment: *environment,
                    },
                )?;
                encode(&status, status.degraded)
            }
            Operation::Deploy {
                project,
                environment,
                image,
                version,
            } => {
                let outcome = self
                    .deployer
                    .deploy(
                        auth,
                        &DeployRequest {
                            project: project.clone(),
                            environment: *environment,
                            image: image.clone(),
                            version: version.clone(),
                        },
                    )
                    .await?;
                encode(&outcome, outcome.degraded)
            }
            Operation::Promote {
                project,
                environment,
                slot,
            } => {
                let outcome = self
                    .promoter
                    .promote(
                        auth,
                        &PromoteRequest {
                            project: project.clone(),
                            environment: *environment,
                            slot: *slot,
                        },
                    )
                    .await?;
                encode(&outcome, outcome.degraded)
            }
            Operation::Rollback {
                project,
                environment,
            } => {
                let outcome = self
                    .roller
                    .rollback(
                        auth,
                        &RollbackRequest {
                            project: project.clone(),
                            environment: *environment,
                        },
                    )
                    .await?;
                encode(&outcome, outcome.degraded)
            }
        }
    }

    async fn finish(
        &self,
        operation: &Operation,
        auth: Option<&AuthContext>,
        result: OrchestrationResult<(serde_json::Value, bool)>,
        auth_degraded: bool,
        started: Instant,
    ) -> Dispatched {
        let name = operation.name();
        let elapsed = started.elapsed();

        let (status, response, outcome, message) = match result {
            Ok((data, degraded)) => (
                StatusCode::OK,
                OperationResponse::ok(name, data, degraded || auth_degraded),
                AuditOutcome::Success,
                None,
            ),
            Err(e) => {
                let status = http_status(&e);
                let body = ErrorBody::from(&e);
                let outcome = AuditOutcome::Failure {
                    kind: body.kind.clone(),
                };
                let message = Some(body.message.clone());
                (
                    status,
                    OperationResponse::failed(name, body, e.is_degraded() || auth_degraded),
                    outcome,
                    message,
                )
            }
        };

        let outcome_label = match &outcome {
            AuditOutcome::Success => SUCCESS.to_string(),
            AuditOutcome::Failure { kind } => kind.clone(),
        };
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            operation: name.to_string(),
            team_id: auth.map(|a| a.team_id.clone()),
            credential_id: auth.map(|a| a.credential_id.clone()),
            project: Some(operation.project().to_string()),
            environment: Some(operation.environment()),
            params: operation.params(),
            outcome,
            message,
            degraded: response.degraded,
            duration_ms: elapsed.as_millis() as u64,
            recorded_at: epoch_millis(),
        };
        if let Err(e) = self.audit.record(entry).await {
            warn!(operation = name, error = %e, "failed to record audit entry");
        }
        self.metrics
            .record(name, &outcome_label, elapsed, response.degraded)
            .await;

        info!(
            operation = name,
            project = operation.project(),
            environment = %operation.environment(),
            outcome = %outcome_label,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            degraded = response.degraded,
            "operation finished"
        );
        Dispatched { status, response }
    }
}

fn encode<T: Serialize>(value: &T, degraded: bool) -> OrchestrationResult<(serde_json::Value, bool)> {
    serde_json::to_value(value)
        .map(|data| (data, degraded))
        .map_err(|e| OrchestrationError::Invariant(format!("unserializable result: {e}")))
}

/// HTTP status for a failed operation.
pub fn http_status(e: &OrchestrationError) -> StatusCode {
    match e {
        OrchestrationError::Degraded(inner) => http_status(inner),
        OrchestrationError::Auth(AuthError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
        OrchestrationError::Auth(a) if a.is_unauthenticated() => StatusCode::UNAUTHORIZED,
        OrchestrationError::Auth(a) if a.is_forbidden() => StatusCode::FORBIDDEN,
        OrchestrationError::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
        OrchestrationError::UnknownProject { .. } => StatusCode::NOT_FOUND,
        OrchestrationError::Validation(_) | OrchestrationError::SlotNotDeployed { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        OrchestrationError::Conflict { .. }
        | OrchestrationError::PortRangeExhausted { .. }
        | OrchestrationError::GraceExpired { .. }
        | OrchestrationError::NoGraceSlot => StatusCode::CONFLICT,
        OrchestrationError::ImagePullFailed { .. }
        | OrchestrationError::ContainerStartFailed { .. }
        | OrchestrationError::Runtime(_)
        | OrchestrationError::ConfigRejected(_) => StatusCode::BAD_GATEWAY,
        OrchestrationError::HealthCheckTimeout { .. }
        | OrchestrationError::HealthCheckFailed { .. } => StatusCode::GATEWAY_TIMEOUT,
        OrchestrationError::Persistence(_) | OrchestrationError::Invariant(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
