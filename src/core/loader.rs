//! CV-006: Module loading and graph construction.
//!
//! Resolves a module source to bytes (verifying signatures where
//! required), parses it, expands module calls recursively and builds the
//! resource graph:
//!
//! - `root` plus one vertex per param and resource, each with an edge from its module.
//! - Module calls are expanded in place under `root/module.NAME`.
//! - Explicit `depends`/`depends_on` edges.
//! - Implicit edges for every `{{param}}` and `{{lookup}}` reference.

use super::error::{Diagnostic, Diagnostics, Error, Position, Result};
use super::module::Module;
use super::resolver::{references, resolve_path, Scope};
use super::types::{ModuleVertex, Node, ParamDecl, Value, VertexValue};
use crate::graph::{id, Graph};
use crate::keystore::Keystore;
use crate::resources::{Registry, STRUCTURAL_ATTRS};
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Fetching
// ============================================================================

/// Resolves a module source to its bytes.
pub trait Fetcher: Send + Sync {
    /// Contents of `source`, or `None` when it does not exist.
    fn fetch(&self, source: &str) -> Result<Option<Vec<u8>>>;
}

pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Local files; `file://` prefixes are accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsFetcher;

impl Fetcher for FsFetcher {
    fn fetch(&self, source: &str) -> Result<Option<Vec<u8>>> {
        let path = source.strip_prefix("file://").unwrap_or(source);
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }
}

/// HTTP(S) sources over a blocking client. A 404 means "absent".
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("convergent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("cannot build http client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, source: &str) -> Result<Option<Vec<u8>>> {
        let load_error = |message: String| Error::Load {
            source_ref: source.to_string(),
            message,
        };
        let response = self
            .client
            .get(source)
            .send()
            .map_err(|e| load_error(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(load_error(format!("server returned {}", response.status())));
        }
        let body = response.bytes().map_err(|e| load_error(e.to_string()))?;
        Ok(Some(body.to_vec()))
    }
}

/// Local paths through [`FsFetcher`], URLs through a lazily built [`HttpFetcher`].
#[derive(Debug, Default)]
pub struct DefaultFetcher {
    http: Mutex<Option<std::sync::Arc<HttpFetcher>>>,
}

impl DefaultFetcher {
    fn http(&self) -> Result<std::sync::Arc<HttpFetcher>> {
        let mut slot = self
            .http
            .lock()
            .map_err(|_| Error::Internal("http client lock poisoned".to_string()))?;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = std::sync::Arc::new(HttpFetcher::new()?);
        *slot = Some(client.clone());
        Ok(client)
    }
}

impl Fetcher for DefaultFetcher {
    fn fetch(&self, source: &str) -> Result<Option<Vec<u8>>> {
        if is_remote(source) {
            self.http()?.fetch(source)
        } else {
            FsFetcher.fetch(source)
        }
    }
}

/// In-memory sources, for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryFetcher {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: &str, contents: impl AsRef<[u8]>) -> Self {
        self.files
            .insert(source.to_string(), contents.as_ref().to_vec());
        self
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, source: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.get(source).cloned())
    }
}

/// Resolve a module call's source relative to the calling module.
pub fn resolve_source(base: &str, relative: &str) -> Result<String> {
    if is_remote(relative) {
        return Ok(relative.to_string());
    }
    if is_remote(base) {
        let url = reqwest::Url::parse(base)
            .and_then(|b| b.join(relative))
            .map_err(|e| Error::Load {
                source_ref: relative.to_string(),
                message: format!("cannot resolve against {}: {}", base, e),
            })?;
        return Ok(url.to_string());
    }
    let relative_path = Path::new(relative.strip_prefix("file://").unwrap_or(relative));
    if relative_path.is_absolute() {
        return Ok(normalize(relative_path).display().to_string());
    }
    let base_dir = Path::new(base.strip_prefix("file://").unwrap_or(base))
        .parent()
        .unwrap_or(Path::new(""));
    Ok(normalize(&base_dir.join(relative_path)).display().to_string())
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ============================================================================
// Loader
// ============================================================================

/// Builds a validated graph from a root module source.
pub struct Loader<'a> {
    fetcher: &'a dyn Fetcher,
    registry: &'a Registry,
    keystore: Option<&'a Keystore>,
    verify_all: bool,
}

impl<'a> Loader<'a> {
    pub fn new(fetcher: &'a dyn Fetcher, registry: &'a Registry) -> Self {
        Self {
            fetcher,
            registry,
            keystore: None,
            verify_all: false,
        }
    }

    /// Verify `.sig` companions against this keystore.
    pub fn keystore(mut self, keystore: &'a Keystore) -> Self {
        self.keystore = Some(keystore);
        self
    }

    /// Require a verified signature for every module, local ones included.
    pub fn verify_modules(mut self, verify: bool) -> Self {
        self.verify_all = verify;
        self
    }

    /// Load `source` with `args` for its params and build the full graph.
    pub fn load(&self, source: &str, args: &IndexMap<String, String>) -> Result<Graph<VertexValue>> {
        info!(source, "loading module");
        let mut chain = Vec::new();
        let mut graph = self.expand(source, &mut chain)?;

        for (name, value) in args {
            let param_id = id::join(id::ROOT, &id::node_segment("param", name));
            match graph.get(&param_id) {
                Some(VertexValue::Param(decl)) => {
                    let decl = ParamDecl {
                        arg: Some(Value::String(value.clone())),
                        ..decl.clone()
                    };
                    graph.replace(&param_id, VertexValue::Param(decl));
                }
                _ => {
                    return Err(Error::Config(format!(
                        "{} has no parameter {:?}",
                        source, name
                    )))
                }
            }
        }

        link_references(&mut graph)?;
        graph.validate()?;
        info!(vertices = graph.len(), "graph built");
        Ok(graph)
    }

    /// Fetch a module. A `.sig` companion, when present, must verify; with
    /// `verify_modules` it is required for every module.
    fn fetch_module(&self, source: &str) -> Result<Vec<u8>> {
        let bytes = self.fetcher.fetch(source)?.ok_or_else(|| Error::Load {
            source_ref: source.to_string(),
            message: "not found".to_string(),
        })?;
        let sig_source = format!("{}.sig", source);
        match self.fetcher.fetch(&sig_source)? {
            Some(signature) => {
                let keystore = self.keystore.ok_or_else(|| {
                    Error::Signature(format!("{}: no keystore to verify against", source))
                })?;
                let signer = keystore
                    .check_signature(&bytes, &signature)
                    .map_err(|e| match e {
                        Error::Signature(message) => {
                            Error::Signature(format!("{}: {}", source, message))
                        }
                        other => other,
                    })?;
                info!(source, signer = %signer, "module signature verified");
            }
            None if self.verify_all => {
                return Err(Error::Signature(format!("{}: no signature found", source)));
            }
            None if is_remote(source) => warn!(source, "remote module is unsigned"),
            None => {}
        }
        Ok(bytes)
    }

    /// Build the graph of one module, rooted at `root`, with calls expanded.
    fn expand(&self, source: &str, chain: &mut Vec<String>) -> Result<Graph<VertexValue>> {
        if chain.iter().any(|s| s == source) {
            let mut cycle = chain.clone();
            cycle.push(source.to_string());
            return Err(Error::Load {
                source_ref: source.to_string(),
                message: format!("module inclusion cycle: {}", cycle.join(" -> ")),
            });
        }
        let bytes = self.fetch_module(source)?;
        let text = String::from_utf8(bytes).map_err(|_| Error::Load {
            source_ref: source.to_string(),
            message: "module is not valid UTF-8".to_string(),
        })?;
        let module = Module::new(source, &text)?;
        debug!(source, params = module.params.len(), resources = module.resources.len(), "parsed module");

        let mut graph = Graph::new();
        let mut diagnostics = Diagnostics::new();
        graph.add(
            id::ROOT,
            VertexValue::Module(ModuleVertex {
                source: source.to_string(),
                name: None,
            }),
        )?;
        graph.set_meta(id::ROOT, "source", source);

        for param in module.params.values() {
            let param_id = id::join(id::ROOT, &param.node.segment());
            graph.add(
                param_id.clone(),
                VertexValue::Param(ParamDecl {
                    name: param.name().to_string(),
                    default: param.default.clone(),
                    arg: None,
                    pos: param.node.pos.clone(),
                }),
            )?;
            graph.connect(id::ROOT, &param_id)?;
            graph.set_meta(&param_id, "position", param.node.pos.to_string());
        }

        chain.push(source.to_string());
        for resource in &module.resources {
            let node = &resource.node;
            let vertex_id = id::join(id::ROOT, &resource.segment());
            if node.is_module() {
                let call_source = node.source.as_deref().unwrap_or_default();
                let child_source = resolve_source(source, call_source)?;
                let sub = self.expand(&child_source, chain)?;
                graph.add(
                    vertex_id.clone(),
                    VertexValue::Module(ModuleVertex {
                        source: child_source,
                        name: Some(node.name.clone()),
                    }),
                )?;
                graph.connect(id::ROOT, &vertex_id)?;
                graph.adopt(&vertex_id, sub)?;
                bind_arguments(&mut graph, &vertex_id, node, &mut diagnostics);
            } else {
                if let Err(e) = self.registry.preparer(node) {
                    match e {
                        Error::Validation(d) => diagnostics.extend(d),
                        other => return Err(other),
                    }
                }
                graph.add(vertex_id.clone(), VertexValue::Raw(node.clone()))?;
                graph.connect(id::ROOT, &vertex_id)?;
            }
            graph.set_meta(&vertex_id, "position", node.pos.to_string());
            graph.set_meta(&vertex_id, "kind", node.kind.clone());
        }
        chain.pop();

        let ids: BTreeSet<String> = graph.ids().map(str::to_string).collect();
        for resource in &module.resources {
            let vertex_id = id::join(id::ROOT, &resource.segment());
            for target in &resource.depends {
                match resolve_path(&ids, id::ROOT, target) {
                    Some(found) if found == vertex_id => diagnostics.push(Diagnostic::new(
                        resource.node.pos.clone(),
                        format!("{} depends on itself", resource.segment()),
                    )),
                    Some(found) => graph.connect(&vertex_id, &found)?,
                    None => diagnostics.push(Diagnostic::new(
                        resource.node.pos.clone(),
                        format!("{}: unknown dependency {:?}", resource.segment(), target),
                    )),
                }
            }
        }

        diagnostics.into_result()?;
        Ok(graph)
    }
}

/// Hand a module call's attributes to the called module's params.
fn bind_arguments(
    graph: &mut Graph<VertexValue>,
    call_id: &str,
    call: &Node,
    diagnostics: &mut Diagnostics,
) {
    for (key, value) in &call.attrs {
        if STRUCTURAL_ATTRS.contains(&key.as_str()) {
            continue;
        }
        let param_id = id::join(call_id, &id::node_segment("param", key));
        let decl = match graph.get(&param_id) {
            Some(VertexValue::Param(decl)) => decl.clone(),
            _ => {
                diagnostics.push(Diagnostic::new(
                    call.pos.clone(),
                    format!("module {:?}: unknown parameter {:?}", call.name, key),
                ));
                continue;
            }
        };
        graph.replace(
            &param_id,
            VertexValue::Param(ParamDecl {
                arg: Some(value.clone()),
                ..decl
            }),
        );
    }
}

/// Every template string a vertex renders, with the scope it renders in.
fn templates(vertex_id: &str, value: &VertexValue) -> Vec<(Scope, String, Position)> {
    let mut out = Vec::new();
    match value {
        VertexValue::Raw(node) => {
            for (key, attr) in &node.attrs {
                if STRUCTURAL_ATTRS.contains(&key.as_str()) {
                    continue;
                }
                attr.for_each_string(&mut |s| {
                    out.push((Scope::of(vertex_id), s.to_string(), node.pos.clone()))
                });
            }
        }
        VertexValue::Param(decl) => {
            let module = id::parent(vertex_id).unwrap_or(id::ROOT);
            match (&decl.arg, id::parent(module)) {
                (Some(arg), Some(caller)) => arg.for_each_string(&mut |s| {
                    out.push((Scope::within(vertex_id, caller), s.to_string(), decl.pos.clone()))
                }),
                // command-line arguments are literal
                (Some(_), None) => {}
                (None, _) => {
                    if let Some(default) = &decl.default {
                        default.for_each_string(&mut |s| {
                            out.push((Scope::of(vertex_id), s.to_string(), decl.pos.clone()))
                        });
                    }
                }
            }
        }
        _ => {}
    }
    out
}

/// Add an edge for every reference until no new edge appears.
fn link_references(graph: &mut Graph<VertexValue>) -> Result<()> {
    let ids: BTreeSet<String> = graph.ids().map(str::to_string).collect();
    loop {
        let mut diagnostics = Diagnostics::new();
        let mut missing = Vec::new();
        for vertex_id in &ids {
            let Some(value) = graph.get(vertex_id) else {
                continue;
            };
            for (scope, template, pos) in templates(vertex_id, value) {
                match references(&ids, &scope, &template) {
                    Ok(targets) => missing.extend(
                        targets
                            .into_iter()
                            .filter(|t| !graph.has_edge(vertex_id, t))
                            .map(|t| (vertex_id.clone(), t)),
                    ),
                    Err(e) => diagnostics.push(Diagnostic::new(pos, e.to_string())),
                }
            }
        }
        diagnostics.into_result()?;
        if missing.is_empty() {
            return Ok(());
        }
        for (from, to) in missing {
            debug!(from = %from, to = %to, "implicit dependency");
            graph.connect(&from, &to)?;
        }
    }
}
