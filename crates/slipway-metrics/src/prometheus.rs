//! Prometheus text exposition format.
//!
//! Renders a metrics snapshot into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use crate::collector::MetricsSnapshot;

/// Render a snapshot into Prometheus text format.
///
/// Produces COUNTER and GAUGE metrics with `operation` and `outcome` labels.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    out.push_str("# HELP slipway_operations_total Orchestration calls by operation and outcome.\n");
    out.push_str("# TYPE slipway_operations_total counter\n");
    for s in &snapshot.operations {
        out.push_str(&format!(
            "slipway_operations_total{{operation=\"{}\",outcome=\"{}\"}} {}\n",
            s.operation, s.outcome, s.count
        ));
    }

    out.push_str("# HELP slipway_operation_duration_seconds_total Time spent in orchestration calls.\n");
    out.push_str("# TYPE slipway_operation_duration_seconds_total counter\n");
    for s in &snapshot.operations {
        out.push_str(&format!(
            "slipway_operation_duration_seconds_total{{operation=\"{}\",outcome=\"{}\"}} {:.3}\n",
            s.operation,
            s.outcome,
            s.duration_ms_total as f64 / 1000.0
        ));
    }

    out.push_str("# HELP slipway_operation_duration_seconds_max Longest single call.\n");
    out.push_str("# TYPE slipway_operation_duration_seconds_max gauge\n");
    for s in &snapshot.operations {
        out.push_str(&format!(
            "slipway_operation_duration_seconds_max{{operation=\"{}\",outcome=\"{}\"}} {:.3}\n",
            s.operation,
            s.outcome,
            s.duration_ms_max as f64 / 1000.0
        ));
    }

    out.push_str("# HELP slipway_degraded_responses_total Responses served from the file mirror.\n");
    out.push_str("# TYPE slipway_degraded_responses_total counter\n");
    out.push_str(&format!(
        "slipway_degraded_responses_total {}\n",
        snapshot.degraded_total
    ));

    out
}
