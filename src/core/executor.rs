//! CV-008: Executor, the plan and apply walks.
//!
//! Both walks transform the loaded graph, replacing every vertex with its
//! [`Outcome`]. Per vertex the stages are:
//!
//! dependencies → prepare → check → apply (apply walk, when changes are pending)
//!
//! Once a dependency has failed or been skipped, the vertex is skipped
//! with a [`DependencyError`] naming the failed vertex and no later stage
//! runs. Task errors and panics become a fatal status for that vertex;
//! only cancellation and internal errors abort the walk.

use super::error::{Error, Result};
use super::resolver::{Renderer, Scope};
use super::types::{
    DependencyError, EvaluatedResult, Node, Outcome, ParamDecl, PipelineStage, PreparedTask,
    TaskStatus, VertexValue,
};
use crate::graph::walk::panic_message;
use crate::graph::{id, Graph, Handle, WalkOptions};
use crate::resources::{Registry, TaskContext};
use crate::transport::SysCaller;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Check only.
    Plan,
    /// Check, then apply where changes are pending.
    Apply,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Apply => write!(f, "apply"),
        }
    }
}

/// Runs plan and apply walks with a fixed registry and system caller.
#[derive(Clone)]
pub struct Executor {
    registry: Registry,
    sys: Arc<dyn SysCaller>,
    opts: WalkOptions,
}

impl Executor {
    pub fn new(registry: Registry, sys: Arc<dyn SysCaller>, opts: WalkOptions) -> Self {
        Self {
            registry,
            sys,
            opts,
        }
    }

    pub fn plan(&self, graph: &Graph<VertexValue>) -> Result<Graph<VertexValue>> {
        self.run(Mode::Plan, graph)
    }

    pub fn apply(&self, graph: &Graph<VertexValue>) -> Result<Graph<VertexValue>> {
        self.run(Mode::Apply, graph)
    }

    pub fn run(&self, mode: Mode, graph: &Graph<VertexValue>) -> Result<Graph<VertexValue>> {
        let start = Instant::now();
        info!(%mode, vertices = graph.len(), workers = self.opts.workers, "walk started");
        let ids: BTreeSet<String> = graph.ids().map(str::to_string).collect();
        let result = graph.transform(&self.opts, |handle| self.visit(mode, &ids, handle))?;
        info!(%mode, elapsed_ms = start.elapsed().as_millis() as u64, "walk finished");
        Ok(result)
    }

    fn visit(&self, mode: Mode, ids: &BTreeSet<String>, handle: &mut Handle<VertexValue>) -> Result<()> {
        let outcome = match handle.value() {
            VertexValue::Module(_) => Outcome {
                kind: "module".to_string(),
                stage: match failed_upstream(handle) {
                    Some(dep) => PipelineStage::Skipped(dep),
                    None => PipelineStage::Success(EvaluatedResult::default()),
                },
            },
            VertexValue::Param(decl) => Outcome {
                kind: "param".to_string(),
                stage: evaluate_param(ids, handle, decl)?,
            },
            VertexValue::Raw(node) => Outcome {
                kind: node.kind.clone(),
                stage: self.evaluate_resource(mode, ids, handle, node)?,
            },
            VertexValue::Done(_) | VertexValue::Health(_) => {
                return Err(Error::Internal(format!(
                    "{} was already evaluated",
                    handle.id()
                )))
            }
        };
        if let PipelineStage::Skipped(dep) = &outcome.stage {
            warn!(vertex = %handle.id(), upstream = %dep.upstream, "skipped");
        }
        handle.set(VertexValue::Done(outcome));
        Ok(())
    }

    fn evaluate_resource(
        &self,
        mode: Mode,
        ids: &BTreeSet<String>,
        handle: &Handle<VertexValue>,
        node: &Node,
    ) -> Result<PipelineStage> {
        if let Some(dep) = failed_upstream(handle) {
            return Ok(PipelineStage::Skipped(dep));
        }
        let vertex_id = handle.id();
        let ctx = TaskContext::new(vertex_id, handle.cancel_token().clone(), self.sys.clone());
        let renderer = Renderer::new(Scope::of(vertex_id), ids, handle.dependencies());

        let prepared = match self.prepare(&ctx, &renderer, node) {
            Ok(prepared) => prepared,
            Err(e) => return fatal(None, e),
        };

        debug!(vertex = %vertex_id, "check");
        let checked = match guarded(Stage::Check, &node.kind, || prepared.task.check(&ctx, &renderer)) {
            Ok(status) => status,
            Err(e) => return fatal(Some(prepared), e),
        };
        if checked.is_fatal() || mode == Mode::Plan || !checked.has_changes() {
            return Ok(PipelineStage::Success(EvaluatedResult {
                status: checked,
                task: Some(prepared),
                value: None,
                applied: false,
            }));
        }

        debug!(vertex = %vertex_id, "apply");
        let mut applied = match guarded(Stage::Apply, &node.kind, || prepared.task.apply(&ctx)) {
            Ok(status) => status,
            Err(e) => return fatal(Some(prepared), e),
        };
        if applied.differences.is_empty() {
            applied.differences = checked.differences;
        }
        let mut outputs = checked.outputs;
        outputs.append(&mut applied.outputs);
        applied.outputs = outputs;
        Ok(PipelineStage::Success(EvaluatedResult {
            status: applied,
            task: Some(prepared),
            value: None,
            applied: true,
        }))
    }

    fn prepare(&self, ctx: &TaskContext, renderer: &Renderer<'_>, node: &Node) -> Result<PreparedTask> {
        let preparer = self.registry.preparer(node)?;
        let task = guarded(Stage::Check, &node.kind, || preparer.prepare(ctx, renderer))?;
        Ok(PreparedTask {
            kind: node.kind.clone(),
            exports: task.exports(),
            task,
        })
    }
}

/// The first failed or skipped dependency, named by its root cause.
fn failed_upstream(handle: &Handle<VertexValue>) -> Option<DependencyError> {
    handle
        .dependencies()
        .iter()
        .find_map(|(dep_id, value)| match value.outcome().map(|o| &o.stage) {
            Some(PipelineStage::Skipped(dep)) => Some(dep.clone()),
            Some(PipelineStage::Success(result)) if result.status.is_fatal() => {
                Some(DependencyError {
                    upstream: id::friendly(dep_id).to_string(),
                })
            }
            _ => None,
        })
}

/// Resolve a param: the caller's argument, else the default.
fn evaluate_param(
    ids: &BTreeSet<String>,
    handle: &Handle<VertexValue>,
    decl: &ParamDecl,
) -> Result<PipelineStage> {
    if let Some(dep) = failed_upstream(handle) {
        return Ok(PipelineStage::Skipped(dep));
    }
    let vertex_id = handle.id();
    let module = id::parent(vertex_id).unwrap_or(id::ROOT);
    let rendered = match (&decl.arg, &decl.default) {
        (Some(arg), _) => match id::parent(module) {
            Some(caller) => Renderer::new(Scope::within(vertex_id, caller), ids, handle.dependencies())
                .render_value(arg),
            None => Ok(arg.clone()),
        },
        (None, Some(default)) => {
            Renderer::new(Scope::of(vertex_id), ids, handle.dependencies()).render_value(default)
        }
        (None, None) => Err(Error::TaskCheck(format!("param {:?} is required", decl.name))),
    };
    match rendered {
        Ok(value) => Ok(PipelineStage::Success(EvaluatedResult {
            status: TaskStatus::new(),
            value: Some(value),
            ..EvaluatedResult::default()
        })),
        Err(e) if e.is_cancelled() => Err(e),
        Err(Error::TaskCheck(message)) => Ok(failed(None, message)),
        Err(e) => Ok(failed(None, e.to_string())),
    }
}

fn failed(task: Option<PreparedTask>, message: String) -> PipelineStage {
    PipelineStage::Success(EvaluatedResult {
        status: TaskStatus::fatal(message),
        task,
        value: None,
        applied: false,
    })
}

/// Record an error as the vertex's fatal status; cancellation aborts the walk instead.
fn fatal(task: Option<PreparedTask>, error: Error) -> Result<PipelineStage> {
    if error.is_cancelled() {
        return Err(error);
    }
    Ok(failed(task, error.to_string()))
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Check,
    Apply,
}

/// Run a driver call, turning a panic into a check or apply error.
fn guarded<T>(stage: Stage, kind: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = format!("{} driver panicked: {}", kind, panic_message(payload.as_ref()));
        Err(match stage {
            Stage::Check => Error::TaskCheck(message),
            Stage::Apply => Error::TaskApply(message),
        })
    })
}

// ============================================================================
// Summaries
// ============================================================================

/// Per-vertex tallies of a finished walk. Module wrappers are not counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub unchanged: Vec<String>,
    pub changed: Vec<String>,
    /// `(vertex, error)`
    pub failed: Vec<(String, String)>,
    /// `(vertex, failed upstream)`
    pub skipped: Vec<(String, String)>,
}

impl Summary {
    pub fn of(graph: &Graph<VertexValue>) -> Self {
        let mut summary = Self::default();
        for vertex_id in graph.ids() {
            let Some(outcome) = graph.get(vertex_id).and_then(VertexValue::outcome) else {
                continue;
            };
            if outcome.kind == "module" {
                continue;
            }
            let name = id::friendly(vertex_id).to_string();
            match &outcome.stage {
                PipelineStage::Skipped(dep) => summary.skipped.push((name, dep.upstream.clone())),
                PipelineStage::Success(result) if result.status.is_fatal() => {
                    let error = result
                        .status
                        .error
                        .clone()
                        .unwrap_or_else(|| result.status.messages.join("; "));
                    summary.failed.push((name, error));
                }
                PipelineStage::Success(result) if result.status.has_changes() => {
                    summary.changed.push(name)
                }
                PipelineStage::Success(_) => summary.unchanged.push(name),
            }
        }
        summary
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// Exported fields of every evaluated task, keyed by vertex ID.
pub fn exports(graph: &Graph<VertexValue>) -> BTreeMap<String, BTreeMap<String, String>> {
    graph
        .ids()
        .filter_map(|vertex_id| {
            let outcome = graph.get(vertex_id)?.outcome()?;
            outcome
                .is_task()
                .then(|| (vertex_id.to_string(), outcome.exports()))
        })
        .collect()
}
