//! slipway-health — deciding whether a slot is fit to take traffic.
//!
//! ```text
//! HealthVerifier
//!   ├── ContainerRuntime::inspect_health   (runtime healthcheck)
//!   ├── ContainerRuntime::exec_probe       (request from inside the container)
//!   └── EndpointProbe → http_probe()       (request against the host port)
//! ```
//!
//! Deploys poll with `wait_until_healthy`; promote and rollback run a
//! single `verify_once` pass before touching the proxy.

pub mod checker;
pub mod verifier;

pub use checker::{EndpointProbe, HttpEndpointProbe, ProbeResult, http_probe};
pub use verifier::{HealthError, HealthPolicy, HealthReport, HealthVerifier};
