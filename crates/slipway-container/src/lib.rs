//! slipway-container — container lifecycle for blue/green slots.
//!
//! The orchestrator only sees the [`ContainerRuntime`] trait. The shipped
//! implementation shells out to Podman; env files are synchronized per slot
//! before each run.

pub mod envfile;
pub mod error;
pub mod podman;
pub mod runtime;

pub use envfile::{EnvFileSync, SlotVariables};
pub use error::{RuntimeError, RuntimeResult};
pub use podman::PodmanRuntime;
pub use runtime::{ContainerHealth, ContainerRuntime, RunSpec, container_name, probe_command};
