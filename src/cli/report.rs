//! CV-071: Plan, apply and health reports.
//!
//! Reports are plain text for stdout, sorted by vertex ID and independent of
//! the log level.

use crate::core::executor::{Mode, Summary};
use crate::core::health;
use crate::core::types::{HealthLevel, PipelineStage, VertexValue};
use crate::graph::{id, Graph};
use std::fmt::Write;

/// Per-vertex lines for changed, failed and skipped vertices, then totals.
pub fn walk_report(mode: Mode, graph: &Graph<VertexValue>) -> String {
    let summary = Summary::of(graph);
    let mut out = String::new();
    let title = match mode {
        Mode::Plan => "Planning",
        Mode::Apply => "Applying",
    };
    let _ = writeln!(out, "{}: {} vertices", title, graph.len());

    for vertex_id in graph.ids() {
        let Some(outcome) = graph.get(vertex_id).and_then(VertexValue::outcome) else {
            continue;
        };
        if !outcome.is_task() && !outcome.stage.is_broken() {
            continue;
        }
        let name = id::friendly(vertex_id);
        match &outcome.stage {
            PipelineStage::Skipped(dep) => {
                let _ = writeln!(out, "  - {} skipped: {}", name, dep);
            }
            PipelineStage::Success(result) if result.status.is_fatal() => {
                let error = result.status.error.as_deref().unwrap_or("failed");
                let _ = writeln!(out, "  ! {}: {}", name, error);
            }
            PipelineStage::Success(result) if result.status.has_changes() => {
                let _ = writeln!(out, "  ~ {}", name);
                for diff in result.status.differences.iter().filter(|d| d.changes()) {
                    let _ = writeln!(out, "      {}", diff);
                }
                for message in &result.status.messages {
                    let _ = writeln!(out, "      # {}", message);
                }
            }
            PipelineStage::Success(_) => {}
        }
    }

    out.push('\n');
    out.push_str(&totals(mode, &summary));
    out
}

fn totals(mode: Mode, summary: &Summary) -> String {
    let changed = summary.changed.len();
    let unchanged = summary.unchanged.len();
    let failed = summary.failed.len();
    let skipped = summary.skipped.len();
    match mode {
        Mode::Plan if summary.is_clean() => {
            format!("Plan: {} to change, {} unchanged.\n", changed, unchanged)
        }
        Mode::Plan => format!(
            "Plan: {} to change, {} unchanged, {} failed, {} skipped.\n",
            changed, unchanged, failed, skipped
        ),
        Mode::Apply if summary.is_clean() => {
            format!("Apply complete: {} changed, {} unchanged.\n", changed, unchanged)
        }
        Mode::Apply => format!(
            "Apply completed with errors: {} changed, {} unchanged, {} failed, {} skipped.\n",
            changed, unchanged, failed, skipped
        ),
    }
}

/// Displayed vertices with their level and messages, then the overall level.
pub fn health_report(graph: &Graph<VertexValue>) -> String {
    let mut out = String::new();
    for (name, status) in health::displayed(graph) {
        let _ = writeln!(out, "{} [{}]", name, status.level);
        for message in &status.messages {
            let _ = writeln!(out, "  {}", message);
        }
    }
    let overall = health::overall(graph);
    if overall == HealthLevel::Healthy {
        out.push_str("All vertices healthy.\n");
    } else {
        let _ = writeln!(out, "Overall: {}", overall);
    }
    out
}
