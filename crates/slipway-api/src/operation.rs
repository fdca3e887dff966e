//! The operation envelope shared by every front-end.

use serde::{Deserialize, Serialize};

use slipway_core::{Environment, SlotName};
use slipway_rollout::OrchestrationError;

/// A named operation with its parameters, as posted by a client:
/// `{"operation": "deploy", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "params", rename_all = "snake_case")]
pub enum Operation {
    SlotStatus {
        project: String,
        environment: Environment,
    },
    Deploy {
        project: String,
        environment: Environment,
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Promote {
        project: String,
        environment: Environment,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slot: Option<SlotName>,
    },
    Rollback {
        project: String,
        environment: Environment,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::SlotStatus { .. } => "slot_status",
            Operation::Deploy { .. } => "deploy",
            Operation::Promote { .. } => "promote",
            Operation::Rollback { .. } => "rollback",
        }
    }

    pub fn project(&self) -> &str {
        match self {
            Operation::SlotStatus { project, .. }
            | Operation::Deploy { project, .. }
            | Operation::Promote { project, .. }
            | Operation::Rollback { project, .. } => project,
        }
    }

    pub fn environment(&self) -> Environment {
        match self {
            Operation::SlotStatus { environment, .. }
            | Operation::Deploy { environment, .. }
            | Operation::Promote { environment, .. }
            | Operation::Rollback { environment, .. } => *environment,
        }
    }

    /// Parameters as recorded in the audit log.
    pub fn params(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("params").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Typed failure as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&OrchestrationError> for ErrorBody {
    fn from(e: &OrchestrationError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            hint: e.hint(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Set when any part of the call was served by the file mirror.
    pub degraded: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl OperationResponse {
    pub fn ok(operation: &str, data: serde_json::Value, degraded: bool) -> Self {
        Self {
            success: true,
            operation: operation.to_string(),
            data: Some(data),
            error: None,
            degraded,
            warnings: warnings(degraded),
        }
    }

    pub fn failed(operation: &str, error: ErrorBody, degraded: bool) -> Self {
        Self {
            success: false,
            operation: operation.to_string(),
            data: None,
            error: Some(error),
            degraded,
            warnings: warnings(degraded),
        }
    }
}

pub const DEGRADED_WARNING: &str =
    "durable store unreachable; served from the file mirror with reduced consistency guarantees";

fn warnings(degraded: bool) -> Vec<String> {
    if degraded {
        vec![DEGRADED_WARNING.to_string()]
    } else {
        Vec::new()
    }
}
