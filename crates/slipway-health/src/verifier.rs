//! Triple-verified slot readiness.
//!
//! A slot counts as healthy only when three independent signals agree:
//! the runtime's own healthcheck, a probe executed inside the container,
//! and an HTTP probe against the published host port.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use slipway_container::{ContainerHealth, ContainerRuntime};

use crate::checker::{EndpointProbe, ProbeResult};

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// HTTP path probed on the application.
    pub path: String,
    /// Port the application listens on inside the container.
    pub internal_port: u16,
    /// Total budget for `wait_until_healthy`.
    pub timeout: Duration,
    /// Pause between rounds.
    pub interval: Duration,
}

/// The three signals gathered in one verification round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub runtime: ContainerHealth,
    pub exec: bool,
    pub endpoint: ProbeResult,
    /// Runtime errors hit while collecting the signals.
    pub errors: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.runtime == ContainerHealth::Healthy && self.exec && self.endpoint.is_healthy()
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "runtime={:?} exec={} endpoint={:?}",
            self.runtime, self.exec, self.endpoint
        );
        if !self.errors.is_empty() {
            summary.push_str(&format!(" errors=[{}]", self.errors.join("; ")));
        }
        summary
    }
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("slot did not become healthy within {}s after {attempts} checks ({})", elapsed.as_secs(), last.summary())]
    Timeout {
        attempts: u32,
        elapsed: Duration,
        last: HealthReport,
    },

    #[error("container {0} is no longer present")]
    ContainerGone(String),

    #[error("slot is not healthy ({})", .0.summary())]
    Unhealthy(HealthReport),
}

pub struct HealthVerifier {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn EndpointProbe>,
    policy: HealthPolicy,
}

impl HealthVerifier {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn EndpointProbe>,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            runtime,
            probe,
            policy,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Collect all three signals once.
    pub async fn collect(&self, container: &str, host_port: u16) -> HealthReport {
        let mut errors = Vec::new();

        let runtime = match self.runtime.inspect_health(container).await {
            Ok(health) => health,
            Err(e) => {
                errors.push(format!("inspect: {e}"));
                ContainerHealth::Unknown
            }
        };
        let exec = match self
            .runtime
            .exec_probe(container, self.policy.internal_port, &self.policy.path)
            .await
        {
            Ok(ok) => ok,
            Err(e) => {
                errors.push(format!("exec: {e}"));
                false
            }
        };
        let endpoint = self.probe.probe(host_port, &self.policy.path).await;

        HealthReport {
            runtime,
            exec,
            endpoint,
            errors,
        }
    }

    /// One verification pass, used before switching traffic.
    pub async fn verify_once(&self, container: &str, host_port: u16) -> Result<HealthReport, HealthError> {
        let report = self.collect(container, host_port).await;
        if report.runtime == ContainerHealth::Missing {
            return Err(HealthError::ContainerGone(container.to_string()));
        }
        if report.is_healthy() {
            debug!(container, port = host_port, "single health pass succeeded");
            Ok(report)
        } else {
            warn!(container, port = host_port, report = %report.summary(), "single health pass failed");
            Err(HealthError::Unhealthy(report))
        }
    }

    /// Poll until all three signals agree or the policy timeout elapses.
    pub async fn wait_until_healthy(
        &self,
        container: &str,
        host_port: u16,
    ) -> Result<HealthReport, HealthError> {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let report = self.collect(container, host_port).await;
            if report.runtime == ContainerHealth::Missing {
                return Err(HealthError::ContainerGone(container.to_string()));
            }
            if report.is_healthy() {
                info!(
                    container,
                    port = host_port,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "slot healthy"
                );
                return Ok(report);
            }
            debug!(container, attempts, report = %report.summary(), "slot not healthy yet");

            let now = Instant::now();
            if now >= deadline {
                return Err(HealthError::Timeout {
                    attempts,
                    elapsed: now - started,
                    last: report,
                });
            }
            tokio::time::sleep(self.policy.interval.min(deadline - now)).await;
        }
    }
}
