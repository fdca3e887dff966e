//! The container runtime capability.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use slipway_core::{Environment, ImageRef, SlotName};

use crate::error::RuntimeResult;

/// Container name for a slot: `{project}-{environment}-{slot}`.
pub fn container_name(project: &str, environment: Environment, slot: SlotName) -> String {
    format!("{project}-{environment}-{slot}")
}

/// Health as reported by the runtime's own healthcheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerHealth {
    Healthy,
    Starting,
    Unhealthy,
    /// The container has no healthcheck configured.
    Unknown,
    /// No such container.
    Missing,
}

/// Everything needed to start one slot's container.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub name: String,
    pub image: ImageRef,
    pub host_port: u16,
    pub internal_port: u16,
    pub env_file: PathBuf,
    pub cpus: String,
    pub memory: String,
    pub network: Option<String>,
    /// Path probed by the in-container healthcheck.
    pub health_path: String,
    pub labels: BTreeMap<String, String>,
}

/// Operations the orchestrator needs from a container runtime.
///
/// `stop` and `remove` treat an absent container as success.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &ImageRef) -> RuntimeResult<()>;

    async fn stop(&self, name: &str) -> RuntimeResult<()>;

    async fn remove(&self, name: &str) -> RuntimeResult<()>;

    /// Start a detached container; returns its id.
    async fn run(&self, spec: &RunSpec) -> RuntimeResult<String>;

    async fn inspect_health(&self, name: &str) -> RuntimeResult<ContainerHealth>;

    /// Probe the application from inside the container.
    async fn exec_probe(&self, name: &str, port: u16, path: &str) -> RuntimeResult<bool>;

    /// Host ports currently published by any container.
    async fn published_ports(&self) -> RuntimeResult<Vec<u16>>;
}

/// Shell snippet that succeeds when `http://localhost:{port}{path}` answers 2xx.
pub fn probe_command(port: u16, path: &str) -> String {
    let url = format!("http://localhost:{port}{path}");
    format!("wget -q --spider {url} || curl -fsS -o /dev/null {url}")
}
