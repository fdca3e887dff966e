//! slipway-state — durable state for Slipway.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for projects, the blue/green slot registry, deployment history,
//! audit entries and credentials.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{project}/{environment}`, `{project}/{environment}:{id}`)
//! enable prefix scans for related records.
//!
//! The orchestration layer talks to [`Persistence`], which wraps any
//! [`DurableStore`] together with a [`FileMirror`] and reports whether a
//! result was served in degraded mode.

pub mod durable;
pub mod error;
pub mod mirror;
pub mod persistence;
pub mod store;
pub mod tables;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use durable::DurableStore;
pub use error::{StateError, StateResult};
pub use mirror::FileMirror;
pub use persistence::{Degradable, Persistence};
pub use store::StateStore;
pub use types::*;
