//! slipway-metrics — observability for orchestration calls.
//!
//! # Architecture
//!
//! ```text
//! OperationMetrics
//!   ├── record() ← called once per dispatched operation
//!   └── snapshot() → MetricsSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{MetricsSnapshot, OperationMetrics, OperationSnapshot, SUCCESS};
pub use prometheus::render_prometheus;
