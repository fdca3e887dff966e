//! slipway-api — the operation envelope and its HTTP surface.
//!
//! Every front-end submits the same envelope
//! (`{"operation": ..., "params": {...}}`) and receives an
//! [`OperationResponse`]. The [`Dispatcher`] authenticates the caller, runs
//! the matching engine, writes an audit entry and records metrics.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/operations` | Run one operation (bearer credential) |
//! | GET | `/healthz` | Liveness |
//! | GET | `/metrics` | Prometheus exposition |

pub mod audit;
pub mod dispatch;
pub mod handlers;
pub mod operation;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

pub use audit::{AuditRecorder, StoreAuditRecorder};
pub use dispatch::{Dispatched, Dispatcher, http_status};
pub use operation::{DEGRADED_WARNING, ErrorBody, Operation, OperationResponse};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the complete router (operations + health + metrics).
pub fn build_router(dispatcher: Arc<Dispatcher>) -> Router {
    let api_state = ApiState { dispatcher };

    let api_routes = Router::new()
        .route("/operations", post(handlers::run_operation))
        .with_state(api_state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::prometheus_metrics).with_state(api_state))
}
