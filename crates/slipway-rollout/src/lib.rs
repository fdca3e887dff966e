//! slipway-rollout — blue/green deploy, promote and rollback.
//!
//! # Components
//!
//! - **`ports`** — port pair allocation checked against registry, runtime and host
//! - **`lease`** — one in-flight operation per (project, environment)
//! - **`deploy`** — image into the non-active slot, verified healthy
//! - **`promote`** — proxy switch to a deployed slot, previous slot into grace
//! - **`rollback`** — proxy switch back to the grace slot
//! - **`status`** — registry entry and recent deployments
//!
//! Every engine reads and writes the registry through
//! [`slipway_state::Persistence`], so results carry a `degraded` flag when
//! the durable store was unreachable.

pub mod context;
pub mod deploy;
pub mod error;
pub mod lease;
pub mod ports;
pub mod promote;
pub mod rollback;
pub mod status;
pub mod suggest;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::{OrchestrationContext, OrchestrationSettings};
pub use deploy::{DeployOrchestrator, DeployOutcome, DeployRequest};
pub use error::{OrchestrationError, OrchestrationResult};
pub use lease::Lease;
pub use ports::{OsPortProbe, PortAllocator, PortProbe};
pub use promote::{PromoteEngine, PromoteOutcome, PromoteRequest};
pub use rollback::{RollbackEngine, RollbackOutcome, RollbackRequest};
pub use status::{SlotStatus, StatusRequest, slot_status};
