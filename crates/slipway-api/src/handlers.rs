//! HTTP handlers.
//!
//! Every orchestration call goes through `POST /api/v1/operations` with the
//! operation envelope as its body and the credential as a bearer token.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use tracing::{debug, error};

use crate::ApiState;
use crate::operation::{ErrorBody, Operation, OperationResponse};

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Best-effort operation name for a body that failed to parse.
fn raw_operation_name(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("operation").and_then(|o| o.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

/// POST /api/v1/operations
pub async fn run_operation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let operation: Operation = match serde_json::from_slice(&body) {
        Ok(op) => op,
        Err(e) => {
            let name = raw_operation_name(&body);
            debug!(operation = %name, error = %e, "rejected operation envelope");
            let error = ErrorBody {
                kind: "validation_error".to_string(),
                message: format!("invalid operation envelope: {e}"),
                hint: Some(
                    "expected {\"operation\": \"slot_status|deploy|promote|rollback\", \"params\": {...}}"
                        .to_string(),
                ),
            };
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(OperationResponse::failed(&name, error, false)),
            );
        }
    };

    // Spawned so a client disconnect still leaves an audit entry behind.
    let dispatcher = state.dispatcher.clone();
    let credential = bearer(&headers).map(str::to_string);
    let name = operation.name();
    let task = tokio::spawn(async move {
        dispatcher.dispatch(credential.as_deref(), operation).await
    });
    match task.await {
        Ok(done) => (done.status, Json(done.response)),
        Err(e) => {
            error!(operation = name, error = %e, "operation task ended abnormally");
            let error = ErrorBody {
                kind: "persistence_error".to_string(),
                message: format!("operation ended abnormally: {e}"),
                hint: None,
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OperationResponse::failed(name, error, false)),
            )
        }
    }
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.dispatcher.metrics().snapshot().await;
    let body = slipway_metrics::render_prometheus(&snapshot);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
