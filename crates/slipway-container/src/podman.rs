//! `ContainerRuntime` driven through the Podman CLI.
//!
//! Argument vectors and output parsing are plain functions so they can be
//! tested without a runtime installed.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use slipway_core::ImageRef;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{ContainerHealth, ContainerRuntime, RunSpec, probe_command};

pub struct PodmanRuntime {
    binary: String,
    command_timeout: Duration,
}

impl PodmanRuntime {
    pub fn new(binary: &str, command_timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            command_timeout,
        }
    }

    async fn exec(&self, args: &[String]) -> RuntimeResult<Output> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(%command, "running container command");

        let child = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.command_timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(RuntimeError::Spawn {
                command,
                reason: e.to_string(),
            }),
            Err(_) => Err(RuntimeError::Timeout {
                command,
                after: self.command_timeout,
            }),
        }
    }

    /// Run a command and require a zero exit status.
    async fn exec_ok(&self, args: &[String]) -> RuntimeResult<String> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(failure(&self.binary, args, &output))
        }
    }

    /// Like `exec_ok`, but a missing container counts as success.
    async fn exec_absent_ok(&self, args: &[String]) -> RuntimeResult<()> {
        let output = self.exec(args).await?;
        if output.status.success() || is_missing(&output.stderr) {
            Ok(())
        } else {
            Err(failure(&self.binary, args, &output))
        }
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn pull(&self, image: &ImageRef) -> RuntimeResult<()> {
        self.exec_ok(&args(&["pull", "--quiet", &image.to_string()]))
            .await?;
        info!(%image, "image pulled");
        Ok(())
    }

    async fn stop(&self, name: &str) -> RuntimeResult<()> {
        self.exec_absent_ok(&args(&["stop", "--time", "10", name])).await
    }

    async fn remove(&self, name: &str) -> RuntimeResult<()> {
        self.exec_absent_ok(&args(&["rm", "--force", name])).await
    }

    async fn run(&self, spec: &RunSpec) -> RuntimeResult<String> {
        let id = self.exec_ok(&run_args(spec)).await?;
        info!(container = %spec.name, port = spec.host_port, "container started");
        Ok(id)
    }

    async fn inspect_health(&self, name: &str) -> RuntimeResult<ContainerHealth> {
        let argv = args(&["inspect", "--format", "{{.State.Health.Status}}", name]);
        let output = self.exec(&argv).await?;
        if output.status.success() {
            Ok(parse_health(&String::from_utf8_lossy(&output.stdout)))
        } else if is_missing(&output.stderr) {
            Ok(ContainerHealth::Missing)
        } else {
            Err(failure(&self.binary, &argv, &output))
        }
    }

    async fn exec_probe(&self, name: &str, port: u16, path: &str) -> RuntimeResult<bool> {
        let output = self
            .exec(&args(&["exec", name, "sh", "-c", &probe_command(port, path)]))
            .await?;
        Ok(output.status.success())
    }

    async fn published_ports(&self) -> RuntimeResult<Vec<u16>> {
        let stdout = self
            .exec_ok(&args(&["ps", "--all", "--format", "json"]))
            .await?;
        parse_published_ports(&stdout)
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn failure(binary: &str, args: &[String], output: &Output) -> RuntimeError {
    RuntimeError::CommandFailed {
        command: format!("{binary} {}", args.join(" ")).trim().to_string(),
        status: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn is_missing(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr).to_lowercase();
    stderr.contains("no such container") || stderr.contains("no container with name or id")
}

/// Arguments for `podman run`.
pub fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut out = args(&["run", "--detach", "--name", &spec.name]);
    out.push("--publish".to_string());
    out.push(format!("{}:{}", spec.host_port, spec.internal_port));
    out.push("--env-file".to_string());
    out.push(spec.env_file.display().to_string());
    out.extend(args(&["--cpus", &spec.cpus, "--memory", &spec.memory]));
    out.extend(args(&["--restart", "unless-stopped"]));
    out.push("--health-cmd".to_string());
    out.push(probe_command(spec.internal_port, &spec.health_path));
    out.extend(args(&[
        "--health-interval",
        "5s",
        "--health-retries",
        "3",
        "--health-start-period",
        "10s",
    ]));
    if let Some(network) = &spec.network {
        out.push("--network".to_string());
        out.push(network.clone());
    }
    for (key, value) in &spec.labels {
        out.push("--label".to_string());
        out.push(format!("{key}={value}"));
    }
    out.push(spec.image.to_string());
    out
}

pub fn parse_health(stdout: &str) -> ContainerHealth {
    match stdout.trim() {
        "healthy" => ContainerHealth::Healthy,
        "starting" => ContainerHealth::Starting,
        "unhealthy" => ContainerHealth::Unhealthy,
        _ => ContainerHealth::Unknown,
    }
}

/// Extract host ports from `podman ps --format json`.
pub fn parse_published_ports(stdout: &str) -> RuntimeResult<Vec<u16>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let containers: Vec<serde_json::Value> =
        serde_json::from_str(stdout).map_err(|e| RuntimeError::Parse(e.to_string()))?;

    let mut ports = Vec::new();
    for container in &containers {
        let Some(mappings) = container.get("Ports").and_then(|p| p.as_array()) else {
            continue;
        };
        for mapping in mappings {
            let Some(host_port) = mapping.get("host_port").and_then(|p| p.as_u64()) else {
                continue;
            };
            let range = mapping.get("range").and_then(|r| r.as_u64()).unwrap_or(1).max(1);
            for offset in 0..range {
                if let Ok(port) = u16::try_from(host_port + offset) {
                    ports.push(port);
                }
            }
        }
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}
