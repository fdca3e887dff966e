//! In-memory doubles for the external capabilities plus a wired harness.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use slipway_auth::AuthContext;
use slipway_container::{ContainerHealth, ContainerRuntime, EnvFileSync, RunSpec, RuntimeError, RuntimeResult};
use slipway_core::{Environment, ImageRef, Role, SlipwayConfig};
use slipway_health::{EndpointProbe, HealthVerifier, ProbeResult};
use slipway_proxy::{ProxyConfigManager, ProxyController, ProxyError, ProxyResult, site_file_name};
use slipway_state::testing::FlakyStore;
use slipway_state::{
    Deployment, DurableStore, FileMirror, Persistence, Project, SlotRegistryEntry, StateStore,
};

use crate::context::{OrchestrationContext, OrchestrationSettings};
use crate::deploy::DeployOrchestrator;
use crate::ports::{PortAllocator, PortProbe};
use crate::promote::PromoteEngine;
use crate::rollback::RollbackEngine;

// ── Container runtime ─────────────────────────────────────────────

struct RuntimeState {
    calls: Vec<String>,
    /// Running container name → host port.
    running: BTreeMap<String, u16>,
    published: Vec<u16>,
    fail_pull: Option<String>,
    fail_run: Option<String>,
    health: ContainerHealth,
    exec_ok: bool,
    pull_delay: Option<Duration>,
}

/// Container runtime that keeps containers in a map.
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                calls: Vec::new(),
                running: BTreeMap::new(),
                published: Vec::new(),
                fail_pull: None,
                fail_run: None,
                health: ContainerHealth::Healthy,
                exec_ok: true,
                pull_delay: None,
            }),
        }
    }
}

impl FakeRuntime {
    fn with<T>(&self, f: impl FnOnce(&mut RuntimeState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn fail_pull(&self, message: &str) {
        self.with(|s| s.fail_pull = Some(message.to_string()));
    }

    pub fn fail_run(&self, message: &str) {
        self.with(|s| s.fail_run = Some(message.to_string()));
    }

    /// Healthcheck status reported for every running container.
    pub fn set_health(&self, health: ContainerHealth) {
        self.with(|s| s.health = health);
    }

    pub fn set_exec_ok(&self, ok: bool) {
        self.with(|s| s.exec_ok = ok);
    }

    /// Ports reported as published by containers this runtime did not start.
    pub fn set_published_ports(&self, ports: Vec<u16>) {
        self.with(|s| s.published = ports);
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        self.with(|s| s.pull_delay = Some(delay));
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn running(&self) -> Vec<String> {
        self.with(|s| s.running.keys().cloned().collect())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.with(|s| s.running.contains_key(name))
    }

    fn failed(command: &str, stderr: &str) -> RuntimeError {
        RuntimeError::CommandFailed {
            command: command.to_string(),
            status: Some(125),
            stderr: stderr.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, image: &ImageRef) -> RuntimeResult<()> {
        let (delay, failure) = self.with(|s| {
            s.calls.push(format!("pull {image}"));
            (s.pull_delay, s.fail_pull.clone())
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(stderr) => Err(Self::failed("pull", &stderr)),
            None => Ok(()),
        }
    }

    async fn stop(&self, name: &str) -> RuntimeResult<()> {
        self.with(|s| {
            s.calls.push(format!("stop {name}"));
            s.running.remove(name);
        });
        Ok(())
    }

    async fn remove(&self, name: &str) -> RuntimeResult<()> {
        self.with(|s| {
            s.calls.push(format!("rm {name}"));
            s.running.remove(name);
        });
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> RuntimeResult<String> {
        self.with(|s| {
            s.calls.push(format!("run {} {}", spec.name, spec.host_port));
            if let Some(stderr) = &s.fail_run {
                return Err(Self::failed("run", stderr));
            }
            s.running.insert(spec.name.clone(), spec.host_port);
            Ok(format!("id-{}", spec.name))
        })
    }

    async fn inspect_health(&self, name: &str) -> RuntimeResult<ContainerHealth> {
        Ok(self.with(|s| {
            if s.running.contains_key(name) {
                s.health
            } else {
                ContainerHealth::Missing
            }
        }))
    }

    async fn exec_probe(&self, name: &str, _port: u16, _path: &str) -> RuntimeResult<bool> {
        Ok(self.with(|s| s.exec_ok && s.running.contains_key(name)))
    }

    async fn published_ports(&self) -> RuntimeResult<Vec<u16>> {
        Ok(self.with(|s| {
            s.published
                .iter()
                .copied()
                .chain(s.running.values().copied())
                .collect()
        }))
    }
}

// ── Probes ────────────────────────────────────────────────────────

/// External probe with a settable answer; healthy by default.
pub struct FakeProbe {
    result: Mutex<ProbeResult>,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            result: Mutex::new(ProbeResult::Healthy),
        }
    }
}

impl FakeProbe {
    pub fn set(&self, result: ProbeResult) {
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = result;
    }
}

#[async_trait]
impl EndpointProbe for FakeProbe {
    async fn probe(&self, _port: u16, _path: &str) -> ProbeResult {
        *self.result.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Host port check answering from a fixed set.
#[derive(Default)]
pub struct FakePortProbe {
    in_use: Mutex<BTreeSet<u16>>,
}

impl FakePortProbe {
    pub fn mark_in_use(&self, port: u16) {
        self.in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port);
    }
}

impl PortProbe for FakePortProbe {
    fn in_use(&self, port: u16) -> bool {
        self.in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&port)
    }
}

// ── Proxy ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeProxyController {
    pub reject: AtomicBool,
    pub fail_reload: AtomicBool,
    pub validations: AtomicU32,
    pub reloads: AtomicU32,
}

#[async_trait]
impl ProxyController for FakeProxyController {
    async fn validate(&self, _changed: &Path) -> ProxyResult<()> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            Err(ProxyError::ConfigRejected("unrecognized directive".to_string()))
        } else {
            Ok(())
        }
    }

    async fn reload(&self) -> ProxyResult<()> {
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(ProxyError::ReloadFailed("admin endpoint refused".to_string()));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────────

/// A fully wired [`OrchestrationContext`] over doubles and a temp dir.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: SlipwayConfig,
    pub store: Arc<FlakyStore>,
    pub persistence: Persistence,
    pub runtime: Arc<FakeRuntime>,
    pub probe: Arc<FakeProbe>,
    pub port_probe: Arc<FakePortProbe>,
    pub controller: Arc<FakeProxyController>,
    pub context: Arc<OrchestrationContext>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SlipwayConfig::default())
    }

    /// Storage and file paths in `config` are replaced with temp locations.
    pub fn with_config(mut config: SlipwayConfig) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        config.storage.mirror_dir = dir.path().join("mirror");
        config.storage.database = dir.path().join("slipway.redb");
        config.runtime.env_dir = dir.path().join("env");
        config.proxy.sites_dir = dir.path().join("sites");

        let store = Arc::new(FlakyStore::new(
            StateStore::open_in_memory().expect("in-memory store"),
        ));
        let mirror = Arc::new(FileMirror::open(&config.storage.mirror_dir).expect("file mirror"));
        let persistence = Persistence::new(store.clone(), mirror);

        let runtime = Arc::new(FakeRuntime::default());
        let probe = Arc::new(FakeProbe::default());
        let port_probe = Arc::new(FakePortProbe::default());
        let controller = Arc::new(FakeProxyController::default());

        let policy = OrchestrationSettings::health_policy(&config).expect("health policy");
        let settings = OrchestrationSettings::from_config(&config).expect("settings");
        let context = Arc::new(OrchestrationContext {
            persistence: persistence.clone(),
            runtime: runtime.clone(),
            verifier: Arc::new(HealthVerifier::new(runtime.clone(), probe.clone(), policy)),
            proxy: Arc::new(ProxyConfigManager::new(
                &config.proxy.sites_dir,
                controller.clone(),
            )),
            ports: PortAllocator::new(config.ports.clone(), runtime.clone(), port_probe.clone()),
            env_files: EnvFileSync::new(&config.runtime.env_dir),
            settings,
        });

        Self {
            dir,
            config,
            store,
            persistence,
            runtime,
            probe,
            port_probe,
            controller,
            context,
        }
    }

    pub fn register_project(&self, name: &str, team: &str) -> Project {
        let project = Project::new(name, team, 1);
        self.persistence.put_project(&project).expect("put project");
        project
    }

    /// An already-verified caller with access to every project of `team`.
    pub fn auth(&self, team: &str, role: Role) -> AuthContext {
        AuthContext {
            team_id: team.to_string(),
            role,
            scopes: vec!["*".to_string()],
            credential_id: format!("cred-{team}-{role}"),
        }
    }

    pub fn deployer(&self) -> DeployOrchestrator {
        DeployOrchestrator::new(self.context.clone())
    }

    pub fn promoter(&self) -> PromoteEngine {
        PromoteEngine::new(self.context.clone())
    }

    pub fn roller(&self) -> RollbackEngine {
        RollbackEngine::new(self.context.clone())
    }

    /// Registry entry as held by the durable store, bypassing the mirror.
    pub fn entry(&self, project: &str, environment: Environment) -> Option<SlotRegistryEntry> {
        self.store
            .inner()
            .get_registry(project, environment)
            .expect("read registry")
    }

    pub fn overwrite_entry(&self, entry: &SlotRegistryEntry) {
        self.store
            .inner()
            .restore_registry(entry)
            .expect("write registry");
    }

    pub fn deployments(&self, project: &str, environment: Environment) -> Vec<Deployment> {
        self.store
            .inner()
            .list_deployments(project, environment, 100)
            .expect("list deployments")
    }

    pub fn site_file(&self, project: &str, environment: Environment) -> Option<String> {
        std::fs::read_to_string(
            self.config
                .proxy
                .sites_dir
                .join(site_file_name(project, environment)),
        )
        .ok()
    }

    pub fn env_dir(&self) -> PathBuf {
        self.config.runtime.env_dir.clone()
    }
}
