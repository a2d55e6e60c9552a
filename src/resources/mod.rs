//! CV-040: Resource contract and kind registry.
//!
//! Each resource kind is a [`Preparer`]: a configuration-shaped value
//! deserialized from a node's attributes. Preparing renders its template
//! fields and yields a [`Task`], which can be checked (read-only) and
//! applied (mutating, idempotent).

pub mod file;
pub mod link;
pub mod package;
pub mod shell;
pub mod template;

use crate::core::error::{Diagnostic, Error, Result};
use crate::core::resolver::Renderer;
use crate::core::types::{Node, TaskStatus};
use crate::graph::CancelToken;
use crate::transport::{ExecOutput, Invocation, SysCaller};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Attributes handled by the graph builder rather than by drivers.
pub const STRUCTURAL_ATTRS: &[&str] = &["depends", "depends_on"];

/// Everything a driver may touch while running.
#[derive(Clone)]
pub struct TaskContext {
    /// Vertex being processed.
    pub id: String,
    pub cancel: CancelToken,
    pub sys: Arc<dyn SysCaller>,
}

impl TaskContext {
    pub fn new(id: impl Into<String>, cancel: CancelToken, sys: Arc<dyn SysCaller>) -> Self {
        Self {
            id: id.into(),
            cancel,
            sys,
        }
    }

    /// Run a script through the context's `SysCaller`.
    pub fn run(&self, invocation: &Invocation) -> Result<ExecOutput> {
        self.cancel.check()?;
        self.sys.run(invocation, &self.cancel)
    }

    pub fn run_script(&self, script: &str) -> Result<ExecOutput> {
        self.run(&Invocation::new(script))
    }
}

/// A resource instance with its fields rendered.
pub trait Task: Send + Sync {
    /// Observe the target and report what Apply would change. Must not mutate.
    fn check(&self, ctx: &TaskContext, renderer: &Renderer<'_>) -> Result<TaskStatus>;

    /// Converge the target. Applying twice has the effect of applying once.
    fn apply(&self, ctx: &TaskContext) -> Result<TaskStatus>;

    /// Fields visible to `lookup` from dependents.
    fn exports(&self) -> BTreeMap<String, String>;
}

/// Configuration for one resource kind, before rendering.
pub trait Preparer: Send + Sync {
    /// Render template fields and build the task.
    fn prepare(&self, ctx: &TaskContext, renderer: &Renderer<'_>) -> Result<Arc<dyn Task>>;

    /// Offered the block name after decoding; kinds that default a field to it override this.
    fn use_block_name(&mut self, _name: &str) {}
}

type Factory = fn(serde_json::Value) -> std::result::Result<Box<dyn Preparer>, serde_json::Error>;

fn decode_into<P>(attrs: serde_json::Value) -> std::result::Result<Box<dyn Preparer>, serde_json::Error>
where
    P: Preparer + DeserializeOwned + 'static,
{
    let preparer: P = serde_json::from_value(attrs)?;
    Ok(Box::new(preparer))
}

/// Immutable map from kind string to preparer decoder.
///
/// Built once with [`RegistryBuilder`]; read-only afterwards.
#[derive(Clone)]
pub struct Registry {
    kinds: Arc<BTreeMap<String, Factory>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kinds.keys()).finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    kinds: BTreeMap<String, Factory>,
}

impl RegistryBuilder {
    pub fn register<P>(mut self, kind: &str) -> Self
    where
        P: Preparer + DeserializeOwned + 'static,
    {
        self.kinds.insert(kind.to_string(), decode_into::<P>);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            kinds: Arc::new(self.kinds),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with every built-in driver.
    pub fn builtin() -> Self {
        Self::builder()
            .register::<file::ContentPreparer>("file.content")
            .register::<file::DirectoryPreparer>("file.directory")
            .register::<link::LinkPreparer>("file.link")
            .register::<package::RpmPreparer>("package.rpm")
            .register::<package::AptPreparer>("package.apt")
            .register::<shell::ShellPreparer>("task")
            .register::<shell::QueryPreparer>("task.query")
            .register::<template::TemplatePreparer>("template")
            .build()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Decode a node's attributes into its kind's preparer.
    pub fn preparer(&self, node: &Node) -> Result<Box<dyn Preparer>> {
        let factory = self.kinds.get(&node.kind).ok_or_else(|| {
            Error::Validation(single(node, format!("unknown resource kind {:?}", node.kind)))
        })?;
        let attrs: serde_json::Map<String, serde_json::Value> = node
            .attrs
            .iter()
            .filter(|(k, _)| !STRUCTURAL_ATTRS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        let mut preparer = factory(serde_json::Value::Object(attrs)).map_err(|e| {
            Error::Validation(single(node, format!("{} {:?}: {}", node.kind, node.name, e)))
        })?;
        preparer.use_block_name(&node.name);
        Ok(preparer)
    }
}

fn single(node: &Node, message: String) -> crate::core::error::Diagnostics {
    let mut d = crate::core::error::Diagnostics::new();
    d.push(Diagnostic::new(node.pos.clone(), message));
    d
}

/// Flatten a serializable task's fields to text for `lookup`.
pub fn exports_of<T: Serialize>(value: &T) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(value) {
        for (k, v) in map {
            let text = match v {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            out.insert(k, text);
        }
    }
    out
}

/// Shorten long values in differences to a BLAKE3 digest.
pub fn display_content(content: &str) -> String {
    if content.len() > 64 {
        format!("blake3:{}", blake3::hash(content.as_bytes()).to_hex())
    } else {
        content.to_string()
    }
}

/// Render an optional field, requiring it to be non-empty.
pub(crate) fn required(renderer: &Renderer<'_>, field: &str, value: &str) -> Result<String> {
    let rendered = renderer.render(value)?;
    if rendered.is_empty() {
        return Err(Error::TaskCheck(format!("{} is required", field)));
    }
    Ok(rendered)
}
