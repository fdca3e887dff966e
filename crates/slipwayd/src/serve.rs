//! `slipwayd serve` — wire every subsystem and serve the operation API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use slipway_api::{Dispatcher, StoreAuditRecorder, build_router};
use slipway_auth::AuthGate;
use slipway_container::{EnvFileSync, PodmanRuntime};
use slipway_core::SlipwayConfig;
use slipway_health::{HealthVerifier, HttpEndpointProbe};
use slipway_metrics::OperationMetrics;
use slipway_proxy::{CaddyController, ProxyConfigManager};
use slipway_rollout::{OrchestrationContext, OrchestrationSettings, OsPortProbe, PortAllocator};

use crate::admin::open_persistence;

/// Probes run on the host against published slot ports.
const PROBE_HOST: &str = "127.0.0.1";

pub async fn run(config: SlipwayConfig) -> anyhow::Result<()> {
    info!("Slipway daemon starting");

    // ── State ──────────────────────────────────────────────────

    let persistence = open_persistence(&config)?;
    info!(path = ?config.storage.database, mirror = ?config.storage.mirror_dir, "state store opened");

    // Entries written while the store was unreachable are pushed before serving.
    match persistence.reconcile() {
        Ok(0) => {}
        Ok(pushed) => info!(pushed, "reconciled file mirror into durable store"),
        Err(e) => warn!(error = %e, "reconciliation failed; unsynced entries stay in the mirror"),
    }

    // ── Capabilities ───────────────────────────────────────────

    let command_timeout = config.runtime.command_timeout()?;
    let runtime = Arc::new(PodmanRuntime::new(&config.runtime.binary, command_timeout));
    let probe = Arc::new(HttpEndpointProbe::new(PROBE_HOST, config.health.probe_timeout()?));
    let controller = Arc::new(CaddyController::new(
        &config.proxy.binary,
        &config.proxy.main_config,
        config.proxy.reload_command.clone(),
        command_timeout,
    ));
    std::fs::create_dir_all(&config.proxy.sites_dir)
        .with_context(|| format!("create {}", config.proxy.sites_dir.display()))?;
    info!(runtime = %config.runtime.binary, proxy = %config.proxy.binary, "capabilities initialized");

    // ── Engines ────────────────────────────────────────────────

    let context = Arc::new(OrchestrationContext {
        persistence: persistence.clone(),
        runtime: runtime.clone(),
        verifier: Arc::new(HealthVerifier::new(
            runtime.clone(),
            probe,
            OrchestrationSettings::health_policy(&config)?,
        )),
        proxy: Arc::new(ProxyConfigManager::new(&config.proxy.sites_dir, controller)),
        ports: PortAllocator::new(config.ports.clone(), runtime, Arc::new(OsPortProbe)),
        env_files: EnvFileSync::new(&config.runtime.env_dir),
        settings: OrchestrationSettings::from_config(&config)?,
    });

    let gate = AuthGate::new(
        persistence.clone(),
        &config.auth.prefix,
        config.auth.rate_limit_requests,
        config.auth.rate_limit_window()?,
    );
    let dispatcher = Arc::new(Dispatcher::new(
        gate,
        context,
        Arc::new(StoreAuditRecorder::new(persistence)),
        Arc::new(OperationMetrics::new()),
    ));

    // ── API server ─────────────────────────────────────────────

    let router = build_router(dispatcher);
    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid server.listen {:?}", config.server.listen))?;

    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("Slipway daemon stopped");
    Ok(())
}
