//! CV-002: Core data model.
//!
//! Parsed nodes, attribute values, task statuses, health statuses and the
//! per-stage vertex values that flow through the pipeline.

use super::error::Position;
use crate::resources::Task;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Attribute values
// ============================================================================

/// An attribute value from the configuration language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Flatten scalars to text the way templates see them.
    pub fn to_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => format_number(*n),
            Self::Bool(b) => b.to_string(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Self::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Apply `f` to every string inside this value.
    pub fn try_map_strings<E>(&self, f: &mut impl FnMut(&str) -> Result<String, E>) -> Result<Value, E> {
        Ok(match self {
            Self::String(s) => Self::String(f(s)?),
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(|v| v.try_map_strings(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Object(map) => {
                let mut out = IndexMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.try_map_strings(f)?);
                }
                Self::Object(out)
            }
            other => other.clone(),
        })
    }

    /// Visit every string inside this value.
    pub fn for_each_string(&self, f: &mut impl FnMut(&str)) {
        match self {
            Self::String(s) => f(s),
            Self::List(items) => items.iter().for_each(|v| v.for_each_string(f)),
            Self::Object(map) => map.values().for_each(|v| v.for_each_string(f)),
            _ => {}
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// One parsed top-level block: `kind "name" { ... }` or `module "source" "name" { ... }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub kind: String,
    pub name: String,
    /// Module source, for `module` calls only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub attrs: IndexMap<String, Value>,
    #[serde(skip)]
    pub pos: Position,
}

impl Node {
    /// Graph ID segment for this node (`kind.name`).
    pub fn segment(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }

    pub fn is_module(&self) -> bool {
        self.kind == "module"
    }

    pub fn is_param(&self) -> bool {
        self.kind == "param"
    }

    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// Explicit dependency targets from `depends` and `depends_on`.
    pub fn explicit_dependencies(&self) -> Vec<String> {
        let mut out = Vec::new();
        for key in ["depends", "depends_on"] {
            match self.attrs.get(key) {
                Some(Value::List(items)) => {
                    out.extend(items.iter().filter_map(|v| v.as_str().map(str::to_string)))
                }
                Some(Value::String(s)) => out.push(s.clone()),
                _ => {}
            }
        }
        out
    }
}

// ============================================================================
// Task status
// ============================================================================

/// Severity of a task status. Ordered; a status only ever moves up.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    #[default]
    NoChange,
    WillChange,
    WouldChange,
    FatalError,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChange => write!(f, "no change"),
            Self::WillChange => write!(f, "will change"),
            Self::WouldChange => write!(f, "would change"),
            Self::FatalError => write!(f, "error"),
        }
    }
}

/// One field-level difference between current and desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Difference {
    pub field: String,
    pub current: String,
    pub desired: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl Difference {
    pub fn new(field: impl Into<String>, current: impl Into<String>, desired: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            current: current.into(),
            desired: desired.into(),
            default: None,
        }
    }

    pub fn changes(&self) -> bool {
        self.current != self.desired
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?} => {:?}", self.field, self.current, self.desired)
    }
}

/// Outcome of a Check or Apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStatus {
    pub level: StatusLevel,
    pub messages: Vec<String>,
    pub differences: Vec<Difference>,
    /// Runtime values exported to `lookup`, on top of the task's own fields.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_change(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
            ..Self::default()
        }
    }

    pub fn will_change(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::WillChange,
            messages: vec![message.into()],
            ..Self::default()
        }
    }

    /// A fatal status carrying the error text.
    pub fn fatal(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            level: StatusLevel::FatalError,
            messages: vec![error.clone()],
            error: Some(error),
            ..Self::default()
        }
    }

    /// Raise the level; never lowers it.
    pub fn raise_level(&mut self, level: StatusLevel) {
        if level > self.level {
            self.level = level;
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn add_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Record a difference; a differing pair raises the level to `WillChange`.
    pub fn add_difference(&mut self, diff: Difference) {
        if diff.changes() {
            self.raise_level(StatusLevel::WillChange);
        }
        self.differences.push(diff);
    }

    pub fn output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn has_changes(&self) -> bool {
        self.level >= StatusLevel::WillChange
    }

    pub fn is_fatal(&self) -> bool {
        self.level == StatusLevel::FatalError
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    #[default]
    Healthy,
    Warning,
    Error,
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub level: HealthLevel,
    /// Whether compact reporters surface this vertex.
    pub should_display: bool,
    pub messages: Vec<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, level: HealthLevel) {
        if level > self.level {
            self.level = level;
        }
        if level > HealthLevel::Healthy {
            self.should_display = true;
        }
    }

    pub fn is_failing(&self) -> bool {
        self.level == HealthLevel::Error
    }
}

// ============================================================================
// Vertex values
// ============================================================================

/// A declared parameter, before resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamDecl {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Argument supplied by the caller; rendered in the caller's scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arg: Option<Value>,
    #[serde(skip)]
    pub pos: Position,
}

/// The root module or a module call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleVertex {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A compiled task and the fields it exports to `lookup`.
#[derive(Clone)]
pub struct PreparedTask {
    pub kind: String,
    pub task: Arc<dyn Task>,
    pub exports: BTreeMap<String, String>,
}

impl fmt::Debug for PreparedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedTask")
            .field("kind", &self.kind)
            .field("exports", &self.exports)
            .finish()
    }
}

/// A dependency failure synthesized in place of running a vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyError {
    /// Friendly ID of the failed vertex at the root of the failure.
    pub upstream: String,
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency {} failed", self.upstream)
    }
}

/// Outcome of the stages that ran for one vertex.
#[derive(Debug, Clone, Default)]
pub struct EvaluatedResult {
    pub status: TaskStatus,
    pub task: Option<PreparedTask>,
    /// Resolved value, for param vertices.
    pub value: Option<Value>,
    /// Whether Apply ran.
    pub applied: bool,
}

/// Either a vertex was evaluated, or it was skipped because a dependency failed.
#[derive(Debug, Clone)]
pub enum PipelineStage {
    Success(EvaluatedResult),
    Skipped(DependencyError),
}

impl PipelineStage {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Success(r) if r.status.is_fatal())
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    /// Failed or skipped.
    pub fn is_broken(&self) -> bool {
        self.is_failed() || self.is_skipped()
    }

    pub fn status(&self) -> Option<&TaskStatus> {
        match self {
            Self::Success(r) => Some(&r.status),
            Self::Skipped(_) => None,
        }
    }

    /// Level as seen by dependents: skipped counts as fatal.
    pub fn level(&self) -> StatusLevel {
        match self {
            Self::Success(r) => r.status.level,
            Self::Skipped(_) => StatusLevel::FatalError,
        }
    }
}

/// The per-vertex result of a plan or apply walk.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// `module`, `param` or a resource kind.
    pub kind: String,
    pub stage: PipelineStage,
}

impl Outcome {
    pub fn is_task(&self) -> bool {
        self.kind != "module" && self.kind != "param"
    }

    /// Exported fields visible to `lookup`: task fields overlaid with runtime outputs.
    pub fn exports(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let PipelineStage::Success(result) = &self.stage {
            if let Some(task) = &result.task {
                out.extend(task.exports.clone());
            }
            out.extend(result.status.outputs.clone());
        }
        out
    }
}

/// A vertex value as it evolves through the pipeline.
#[derive(Debug, Clone)]
pub enum VertexValue {
    /// Root or module call; structural only.
    Module(ModuleVertex),
    /// Declared parameter, not yet resolved.
    Param(ParamDecl),
    /// Raw resource node, not yet rendered.
    Raw(Node),
    /// Result of a plan or apply walk.
    Done(Outcome),
    /// Health walk result.
    Health(HealthStatus),
}

impl VertexValue {
    pub fn kind(&self) -> &str {
        match self {
            Self::Module(_) => "module",
            Self::Param(_) => "param",
            Self::Raw(node) => &node.kind,
            Self::Done(outcome) => &outcome.kind,
            Self::Health(_) => "health",
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            Self::Done(outcome) => Some(outcome),
            _ => None,
        }
    }
}

impl Serialize for VertexValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        match self {
            Self::Module(m) => {
                map.serialize_entry("kind", "module")?;
                map.serialize_entry("source", &m.source)?;
                if let Some(name) = &m.name {
                    map.serialize_entry("name", name)?;
                }
            }
            Self::Param(p) => {
                map.serialize_entry("kind", "param")?;
                map.serialize_entry("name", &p.name)?;
                if let Some(default) = &p.default {
                    map.serialize_entry("default", default)?;
                }
                if let Some(arg) = &p.arg {
                    map.serialize_entry("arg", arg)?;
                }
            }
            Self::Raw(node) => {
                map.serialize_entry("kind", &node.kind)?;
                map.serialize_entry("name", &node.name)?;
                map.serialize_entry("attrs", &node.attrs)?;
            }
            Self::Done(outcome) => {
                map.serialize_entry("kind", &outcome.kind)?;
                match &outcome.stage {
                    PipelineStage::Success(r) => map.serialize_entry("status", &r.status)?,
                    PipelineStage::Skipped(dep) => {
                        map.serialize_entry("skipped", &dep.to_string())?
                    }
                }
            }
            Self::Health(h) => {
                map.serialize_entry("kind", "health")?;
                map.serialize_entry("health", h)?;
            }
        }
        map.end()
    }
}

// ============================================================================
// Tests
// ============================================================================
