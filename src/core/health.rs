//! CV-009: Health checks over an evaluated graph.
//!
//! A read-only walk after plan or apply. Each vertex first hears about
//! failing dependencies through [`HealthChecker::failing_dep`], then
//! reports its own [`HealthStatus`].

use super::error::Result;
use super::types::{HealthLevel, HealthStatus, Outcome, PipelineStage, StatusLevel, VertexValue};
use crate::graph::{id, Graph, WalkOptions};
use tracing::debug;

/// Health contract for one vertex.
pub trait HealthChecker {
    /// Called once per failing dependency before [`HealthChecker::health_check`].
    fn failing_dep(&mut self, id: &str, status: &HealthStatus);

    fn health_check(&self) -> HealthStatus;
}

/// Health of a vertex derived from its plan or apply outcome.
#[derive(Debug, Clone, Default)]
pub struct OutcomeHealth {
    status: HealthStatus,
}

impl OutcomeHealth {
    pub fn new(outcome: Option<&Outcome>) -> Self {
        let mut status = HealthStatus::healthy();
        match outcome.map(|o| &o.stage) {
            None => {}
            Some(PipelineStage::Skipped(dep)) => {
                status.raise(HealthLevel::Error);
                status.messages.push(dep.to_string());
            }
            Some(PipelineStage::Success(result)) => match result.status.level {
                StatusLevel::FatalError => {
                    status.raise(HealthLevel::Error);
                    status.messages.extend(result.status.error.clone());
                }
                StatusLevel::WillChange | StatusLevel::WouldChange if !result.applied => {
                    status.raise(HealthLevel::Warning);
                    status.messages.push("not converged".to_string());
                }
                _ => {}
            },
        }
        Self { status }
    }
}

impl HealthChecker for OutcomeHealth {
    fn failing_dep(&mut self, id: &str, _status: &HealthStatus) {
        self.status.raise(HealthLevel::Warning);
        self.status.messages.push(format!("dependency {} is failing", id));
    }

    fn health_check(&self) -> HealthStatus {
        self.status.clone()
    }
}

/// Replace every vertex with its health.
pub fn check(graph: &Graph<VertexValue>, opts: &WalkOptions) -> Result<Graph<VertexValue>> {
    graph.transform(opts, |handle| {
        let mut checker = OutcomeHealth::new(handle.value().outcome());
        for (dep_id, value) in handle.dependencies() {
            if let VertexValue::Health(status) = value {
                if status.is_failing() {
                    checker.failing_dep(id::friendly(dep_id), status);
                }
            }
        }
        let status = checker.health_check();
        debug!(vertex = %handle.id(), level = %status.level, "health");
        handle.set(VertexValue::Health(status));
        Ok(())
    })
}

/// Vertices whose health should be displayed, with their statuses, sorted by ID.
pub fn displayed(graph: &Graph<VertexValue>) -> Vec<(String, HealthStatus)> {
    graph
        .ids()
        .filter_map(|vertex_id| match graph.get(vertex_id) {
            Some(VertexValue::Health(status)) if status.should_display => {
                Some((id::friendly(vertex_id).to_string(), status.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Worst level in a health graph.
pub fn overall(graph: &Graph<VertexValue>) -> HealthLevel {
    graph
        .ids()
        .filter_map(|vertex_id| match graph.get(vertex_id) {
            Some(VertexValue::Health(status)) => Some(status.level),
            _ => None,
        })
        .max()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DependencyError, EvaluatedResult, TaskStatus};

    fn done(kind: &str, stage: PipelineStage) -> VertexValue {
        VertexValue::Done(Outcome {
            kind: kind.into(),
            stage,
        })
    }

    fn ok(status: TaskStatus) -> PipelineStage {
        PipelineStage::Success(EvaluatedResult {
            status,
            ..EvaluatedResult::default()
        })
    }

    #[test]
    fn test_cv009_failure_propagates_along_edges() {
        let mut g = Graph::new();
        g.add("root", done("module", ok(TaskStatus::new()))).unwrap();
        g.add("root/task.a", done("task", ok(TaskStatus::fatal("boom")))).unwrap();
        g.add(
            "root/task.b",
            done(
                "task",
                PipelineStage::Skipped(DependencyError {
                    upstream: "task.a".into(),
                }),
            ),
        )
        .unwrap();
        g.add("root/task.c", done("task", ok(TaskStatus::no_change("ok")))).unwrap();
        g.connect("root", "root/task.b").unwrap();
        g.connect("root", "root/task.c").unwrap();
        g.connect("root/task.b", "root/task.a").unwrap();

        let h = check(&g, &WalkOptions::with_workers(2)).unwrap();
        let shown = displayed(&h);
        let names: Vec<&str> = shown.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["root", "task.a", "task.b"]);
        assert_eq!(shown[1].1.level, HealthLevel::Error);
        assert_eq!(shown[1].1.messages, vec!["boom"]);
        assert_eq!(
            shown[2].1.messages,
            vec!["dependency task.a failed", "dependency task.a is failing"]
        );
        assert_eq!(shown[0].1.level, HealthLevel::Warning);
        assert_eq!(overall(&h), HealthLevel::Error);
    }

    #[test]
    fn test_cv009_pending_change_is_warning_until_applied() {
        let planned = OutcomeHealth::new(Some(&Outcome {
            kind: "task".into(),
            stage: ok(TaskStatus::will_change("x")),
        }))
        .health_check();
        assert_eq!(planned.level, HealthLevel::Warning);
        assert!(planned.should_display);

        let applied = OutcomeHealth::new(Some(&Outcome {
            kind: "task".into(),
            stage: PipelineStage::Success(EvaluatedResult {
                status: TaskStatus::will_change("x"),
                applied: true,
                ..EvaluatedResult::default()
            }),
        }))
        .health_check();
        assert_eq!(applied.level, HealthLevel::Healthy);
        assert!(!applied.should_display);
    }
}
