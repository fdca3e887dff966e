//! PortAllocator — picks the port pair for a new (project, environment).
//!
//! A base port is free only if neither it nor `base + 1` shows up in the
//! registry, among ports published by running containers, or as a port
//! the host OS already has bound. The registry alone can drift from what
//! is actually running, so all three are consulted on every allocation.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

use tracing::debug;

use slipway_container::ContainerRuntime;
use slipway_core::Environment;
use slipway_core::config::PortsConfig;
use slipway_state::SlotRegistryEntry;

use crate::error::{OrchestrationError, OrchestrationResult};

/// Host-level check for a port that something is already listening on.
pub trait PortProbe: Send + Sync {
    fn in_use(&self, port: u16) -> bool;
}

/// Tries to bind the port on all interfaces.
pub struct OsPortProbe;

impl PortProbe for OsPortProbe {
    fn in_use(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_err()
    }
}

pub struct PortAllocator {
    ranges: PortsConfig,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(
        ranges: PortsConfig,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            ranges,
            runtime,
            probe,
        }
    }

    /// First free even base port for `environment`; the pair is `(base, base + 1)`.
    pub async fn allocate(
        &self,
        environment: Environment,
        registry: &[SlotRegistryEntry],
    ) -> OrchestrationResult<u16> {
        let range = self.ranges.range(environment);
        let recorded: BTreeSet<u16> = registry.iter().flat_map(|e| e.ports()).collect();
        let published: BTreeSet<u16> = self.runtime.published_ports().await?.into_iter().collect();

        for base in range.base_ports() {
            let pair = [base, base + 1];
            if let Some(port) = pair.iter().find(|p| recorded.contains(p)) {
                debug!(port, "port recorded in registry");
                continue;
            }
            if let Some(port) = pair.iter().find(|p| published.contains(p)) {
                debug!(port, "port published by a container");
                continue;
            }
            if let Some(port) = pair.iter().find(|p| self.probe.in_use(**p)) {
                debug!(port, "port already bound on host");
                continue;
            }
            debug!(%environment, base, "allocated port pair");
            return Ok(base);
        }

        Err(OrchestrationError::PortRangeExhausted {
            environment,
            start: range.start,
            end: range.end,
        })
    }
}

#[cfg(test)]
mod tests {
    use slipway_core::config::PortRange;

    use super::*;
    use crate::testing::{FakePortProbe, FakeRuntime};

    fn allocator(runtime: Arc<FakeRuntime>, probe: Arc<FakePortProbe>) -> PortAllocator {
        let ranges = PortsConfig {
            production: PortRange::new(4001, 4009),
            ..PortsConfig::default()
        };
        PortAllocator::new(ranges, runtime, probe)
    }

    #[tokio::test]
    async fn first_pair_is_aligned_to_even_port() {
        let runtime = Arc::new(FakeRuntime::default());
        let probe = Arc::new(FakePortProbe::default());
        let base = allocator(runtime, probe)
            .allocate(Environment::Production, &[])
            .await
            .unwrap();
        assert_eq!(base, 4002);
    }

    #[tokio::test]
    async fn skips_every_source_of_used_ports() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.set_published_ports(vec![4005]);
        let probe = Arc::new(FakePortProbe::default());
        probe.mark_in_use(4007);
        let registry = vec![SlotRegistryEntry::new("shop", Environment::Production, 4002, 1)];

        let base = allocator(runtime, probe)
            .allocate(Environment::Production, &registry)
            .await
            .unwrap();
        // 4002-4003 registry, 4004-4005 container, 4006-4007 host.
        assert_eq!(base, 4008);
    }

    #[tokio::test]
    async fn exhausted_range_is_reported() {
        let runtime = Arc::new(FakeRuntime::default());
        let probe = Arc::new(FakePortProbe::default());
        for port in 4002..=4009 {
            probe.mark_in_use(port);
        }
        let err = allocator(runtime, probe)
            .allocate(Environment::Production, &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::PortRangeExhausted {
                environment: Environment::Production,
                ..
            }
        ));
    }

    #[test]
    fn os_probe_sees_bound_listener() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(OsPortProbe.in_use(port));
    }
}
