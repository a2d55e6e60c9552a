//! CV-005: Template rendering and reference resolution.
//!
//! Strings may embed `{{param "k"}}`, `{{lookup "id.field"}}`,
//! `{{env "VAR"}}` and `{{platform.os}}`. Rendering reads only the values
//! of the current vertex's direct dependencies; the implicit-dependency
//! pass in the loader uses [`references`] to add those edges up front.

use super::error::{Error, Result};
use super::types::{PipelineStage, Value, VertexValue};
use crate::graph::id;
use std::collections::{BTreeMap, BTreeSet};

/// One `{{ ... }}` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Param(String),
    Lookup(String),
    Env(String),
    Platform(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece<'t> {
    Text(&'t str),
    Call { expr: &'t str, call: Call },
}

/// Split a template into literal text and calls.
fn parse_template(template: &str) -> Result<Vec<Piece<'_>>> {
    let mut pieces = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            pieces.push(Piece::Text(&rest[..open]));
        }
        let body_start = open + 2;
        let close = rest[body_start..]
            .find("}}")
            .ok_or_else(|| Error::resolution(&rest[open..], "unclosed template"))?;
        let expr = &rest[open..body_start + close + 2];
        let call = parse_call(expr, rest[body_start..body_start + close].trim())?;
        pieces.push(Piece::Call { expr, call });
        rest = &rest[body_start + close + 2..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

fn parse_call(expr: &str, body: &str) -> Result<Call> {
    if let Some(fact) = body.strip_prefix("platform.") {
        return Ok(Call::Platform(fact.to_string()));
    }
    let (func, arg) = match body.find(char::is_whitespace) {
        Some(i) => (&body[..i], body[i..].trim()),
        None => (body, ""),
    };
    let arg = parse_argument(expr, arg)?;
    match func {
        "param" => Ok(Call::Param(arg)),
        "lookup" => Ok(Call::Lookup(arg)),
        "env" => Ok(Call::Env(arg)),
        other => Err(Error::resolution(
            expr,
            format!("unknown template function {:?}", other),
        )),
    }
}

/// A single quoted (with `\` escapes) or bare argument.
fn parse_argument(expr: &str, arg: &str) -> Result<String> {
    if arg.is_empty() {
        return Err(Error::resolution(expr, "missing argument"));
    }
    let Some(quoted) = arg.strip_prefix('"') else {
        if arg.contains(char::is_whitespace) {
            return Err(Error::resolution(expr, "expected a single argument"));
        }
        return Ok(arg.to_string());
    };
    let mut out = String::new();
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => out.push(escaped),
                None => break,
            },
            '"' => {
                if !chars.as_str().trim().is_empty() {
                    return Err(Error::resolution(expr, "expected a single argument"));
                }
                return Ok(out);
            }
            c => out.push(c),
        }
    }
    Err(Error::resolution(expr, "unterminated string argument"))
}

/// Every call in a template, in order.
pub fn template_calls(template: &str) -> Result<Vec<Call>> {
    Ok(parse_template(template)?
        .into_iter()
        .filter_map(|p| match p {
            Piece::Call { call, .. } => Some(call),
            Piece::Text(_) => None,
        })
        .collect())
}

/// Where a template is evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Vertex doing the rendering.
    pub vertex: String,
    /// Module whose params and siblings names resolve against.
    pub module: String,
}

impl Scope {
    pub fn root() -> Self {
        Self {
            vertex: id::ROOT.to_string(),
            module: id::ROOT.to_string(),
        }
    }

    /// Scope of a vertex: its enclosing module.
    pub fn of(vertex: &str) -> Self {
        Self {
            vertex: vertex.to_string(),
            module: id::parent(vertex).unwrap_or(id::ROOT).to_string(),
        }
    }

    /// Render in `module`'s scope on behalf of `vertex` (module-call arguments).
    pub fn within(vertex: &str, module: &str) -> Self {
        Self {
            vertex: vertex.to_string(),
            module: module.to_string(),
        }
    }
}

/// Direct children of `parent` in a sorted ID set.
fn children<'a>(ids: &'a BTreeSet<String>, parent: &str) -> impl Iterator<Item = &'a String> {
    let prefix = format!("{}/", parent);
    let skip = prefix.len();
    ids.range(prefix.clone()..)
        .take_while(move |candidate| candidate.starts_with(&prefix))
        .filter(move |candidate| !candidate[skip..].contains('/'))
}

/// Resolve a dotted resource path (`task.a`, `module.m.t`, bare `t`) within a module.
pub fn resolve_path(ids: &BTreeSet<String>, module: &str, path: &str) -> Option<String> {
    let exact = id::join(module, path);
    if ids.contains(&exact) {
        return Some(exact);
    }
    for child in children(ids, module).filter(|c| id::is_module(c)) {
        let segment = id::segment(child);
        if let Some(rest) = path
            .strip_prefix(segment)
            .and_then(|r| r.strip_prefix('.'))
        {
            if let Some(found) = resolve_path(ids, child, rest) {
                return Some(found);
            }
        }
    }
    let suffix = format!(".{}", path);
    let bare: Vec<&String> = children(ids, module)
        .filter(|c| !id::is_param(c) && id::segment(c).ends_with(&suffix))
        .collect();
    match bare.as_slice() {
        [only] => Some((*only).clone()),
        _ => None,
    }
}

/// Split `path.field` into the vertex path and the field name.
fn split_lookup(path: &str) -> Option<(&str, &str)> {
    let dot = path.rfind('.')?;
    let (vertex, field) = (&path[..dot], &path[dot + 1..]);
    if vertex.is_empty() || field.is_empty() {
        None
    } else {
        Some((vertex, field))
    }
}

/// Vertex IDs a template depends on, resolved against the graph.
///
/// Unresolvable references are left for rendering to report.
pub fn references(ids: &BTreeSet<String>, scope: &Scope, template: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for call in template_calls(template)? {
        let target = match call {
            Call::Param(name) => {
                let target = id::join(&scope.module, &id::node_segment("param", &name));
                ids.contains(&target).then_some(target)
            }
            Call::Lookup(path) => {
                split_lookup(&path).and_then(|(vertex, _)| resolve_path(ids, &scope.module, vertex))
            }
            Call::Env(_) | Call::Platform(_) => None,
        };
        if let Some(target) = target {
            if target != scope.vertex && !out.contains(&target) {
                out.push(target);
            }
        }
    }
    Ok(out)
}

/// Static facts about the host.
pub fn platform_fact(fact: &str) -> Option<&'static str> {
    match fact {
        "os" => Some(std::env::consts::OS),
        "arch" => Some(std::env::consts::ARCH),
        "family" => Some(std::env::consts::FAMILY),
        _ => None,
    }
}

/// Evaluates templates for one vertex against its dependencies.
#[derive(Debug, Clone)]
pub struct Renderer<'a> {
    scope: Scope,
    ids: Option<&'a BTreeSet<String>>,
    deps: Option<&'a BTreeMap<String, VertexValue>>,
}

impl<'a> Renderer<'a> {
    pub fn new(
        scope: Scope,
        ids: &'a BTreeSet<String>,
        deps: &'a BTreeMap<String, VertexValue>,
    ) -> Self {
        Self {
            scope,
            ids: Some(ids),
            deps: Some(deps),
        }
    }

    /// A renderer with no graph: only `env` and `platform` resolve.
    pub fn detached(scope: Scope) -> Renderer<'static> {
        Renderer {
            scope,
            ids: None,
            deps: None,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Same graph, different scope.
    pub fn rescoped(&self, scope: Scope) -> Renderer<'a> {
        Renderer {
            scope,
            ids: self.ids,
            deps: self.deps,
        }
    }

    pub fn render(&self, template: &str) -> Result<String> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }
        let mut out = String::with_capacity(template.len());
        for piece in parse_template(template)? {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Call { expr, call } => out.push_str(&self.evaluate(expr, &call)?),
            }
        }
        Ok(out)
    }

    pub fn render_value(&self, value: &Value) -> Result<Value> {
        value.try_map_strings(&mut |s| self.render(s))
    }

    fn evaluate(&self, expr: &str, call: &Call) -> Result<String> {
        match call {
            Call::Env(var) => Ok(std::env::var(var).unwrap_or_default()),
            Call::Platform(fact) => platform_fact(fact)
                .map(str::to_string)
                .ok_or_else(|| Error::resolution(expr, format!("unknown platform fact {:?}", fact))),
            Call::Param(name) => {
                let target = id::join(&self.scope.module, &id::node_segment("param", name));
                let value = self.dependency(expr, &target, || {
                    format!("param {:?} is not declared in {}", name, self.scope.module)
                })?;
                match value {
                    VertexValue::Done(outcome) => match &outcome.stage {
                        PipelineStage::Success(result) => result
                            .value
                            .as_ref()
                            .map(Value::to_text)
                            .ok_or_else(|| Error::resolution(expr, format!("param {:?} has no value", name))),
                        PipelineStage::Skipped(dep) => Err(Error::resolution(expr, dep.to_string())),
                    },
                    _ => Err(Error::resolution(expr, format!("param {:?} is not resolved yet", name))),
                }
            }
            Call::Lookup(path) => {
                let (vertex, field) = split_lookup(path)
                    .ok_or_else(|| Error::resolution(expr, "lookup needs the form id.field"))?;
                let ids = self
                    .ids
                    .ok_or_else(|| Error::resolution(expr, "lookup is unavailable here"))?;
                let target = resolve_path(ids, &self.scope.module, vertex)
                    .ok_or_else(|| Error::resolution(expr, format!("no resource matches {:?}", vertex)))?;
                let value = self.dependency(expr, &target, || format!("no resource matches {:?}", vertex))?;
                let outcome = value.outcome().ok_or_else(|| {
                    Error::resolution(expr, format!("{} has not run yet", id::friendly(&target)))
                })?;
                if let PipelineStage::Skipped(dep) = &outcome.stage {
                    return Err(Error::resolution(expr, dep.to_string()));
                }
                outcome.exports().remove(field).ok_or_else(|| {
                    Error::resolution(
                        expr,
                        format!("{} has no field {:?}", id::friendly(&target), field),
                    )
                })
            }
        }
    }

    fn dependency(
        &self,
        expr: &str,
        target: &str,
        missing: impl FnOnce() -> String,
    ) -> Result<&'a VertexValue> {
        let (Some(ids), Some(deps)) = (self.ids, self.deps) else {
            return Err(Error::resolution(expr, missing()));
        };
        if !ids.contains(target) {
            return Err(Error::resolution(expr, missing()));
        }
        deps.get(target).ok_or_else(|| {
            Error::resolution(
                expr,
                format!(
                    "{} is not a dependency of {}",
                    id::friendly(target),
                    id::friendly(&self.scope.vertex)
                ),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EvaluatedResult, Outcome, TaskStatus};

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn param_value(v: &str) -> VertexValue {
        VertexValue::Done(Outcome {
            kind: "param".into(),
            stage: PipelineStage::Success(EvaluatedResult {
                value: Some(Value::String(v.into())),
                ..EvaluatedResult::default()
            }),
        })
    }

    fn task_with_output(out: &str) -> VertexValue {
        VertexValue::Done(Outcome {
            kind: "task".into(),
            stage: PipelineStage::Success(EvaluatedResult {
                status: TaskStatus::new().output("output", out),
                ..EvaluatedResult::default()
            }),
        })
    }

    #[test]
    fn test_cv005_parse_calls() {
        let calls = template_calls(r#"a {{param "x"}} b {{ lookup "task.t.output" }} {{platform.os}} {{env HOME}}"#)
            .unwrap();
        assert_eq!(
            calls,
            vec![
                Call::Param("x".into()),
                Call::Lookup("task.t.output".into()),
                Call::Platform("os".into()),
                Call::Env("HOME".into()),
            ]
        );
    }

    #[test]
    fn test_cv005_unclosed_and_unknown() {
        assert!(template_calls("{{param \"x\"").is_err());
        let err = template_calls("{{nope \"x\"}}").unwrap_err();
        assert!(err.to_string().contains("unknown template function"));
        assert!(template_calls(r#"{{param "x" "y"}}"#).is_err());
    }

    #[test]
    fn test_cv005_render_param_from_dependency() {
        let all = ids(&["root", "root/param.filename", "root/file.content.x"]);
        let mut deps = BTreeMap::new();
        deps.insert("root/param.filename".to_string(), param_value("/tmp/a"));
        let r = Renderer::new(Scope::of("root/file.content.x"), &all, &deps);
        assert_eq!(r.render(r#"{{param "filename"}}"#).unwrap(), "/tmp/a");
        assert_eq!(r.render("plain").unwrap(), "plain");
    }

    #[test]
    fn test_cv005_lookup_must_be_dependency() {
        let all = ids(&["root", "root/task.a", "root/task.b"]);
        let deps = BTreeMap::new();
        let r = Renderer::new(Scope::of("root/task.b"), &all, &deps);
        let err = r.render(r#"{{lookup "task.a.output"}}"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"{{lookup "task.a.output"}}: task.a is not a dependency of task.b"#
        );
    }

    #[test]
    fn test_cv005_lookup_descends_into_modules() {
        let all = ids(&[
            "root",
            "root/module.m",
            "root/module.m/task.t",
            "root/task.x",
        ]);
        let mut deps = BTreeMap::new();
        deps.insert("root/module.m/task.t".to_string(), task_with_output("hello"));
        let r = Renderer::new(Scope::of("root/task.x"), &all, &deps);
        assert_eq!(r.render(r#"{{lookup "module.m.t.output"}}"#).unwrap(), "hello");
        assert_eq!(
            r.render(r#"{{lookup "module.m.task.t.output"}}"#).unwrap(),
            "hello"
        );
        let err = r.render(r#"{{lookup "module.m.t.missing"}}"#).unwrap_err();
        assert!(err.to_string().contains("has no field"));
    }

    #[test]
    fn test_cv005_resolve_path_kinds_with_dots() {
        let all = ids(&["root", "root/file.content.x", "root/task.x", "root/task.y"]);
        assert_eq!(
            resolve_path(&all, "root", "file.content.x").as_deref(),
            Some("root/file.content.x")
        );
        // ambiguous bare name
        assert_eq!(resolve_path(&all, "root", "x"), None);
        assert_eq!(resolve_path(&all, "root", "y").as_deref(), Some("root/task.y"));
    }

    #[test]
    fn test_cv005_references_for_implicit_edges() {
        let all = ids(&["root", "root/param.p", "root/task.a", "root/task.b"]);
        let refs = references(
            &all,
            &Scope::of("root/task.b"),
            r#"{{param "p"}} {{lookup "task.a.output"}} {{lookup "task.zz.f"}} {{env "X"}}"#,
        )
        .unwrap();
        assert_eq!(refs, vec!["root/param.p", "root/task.a"]);
    }

    #[test]
    fn test_cv005_env_and_platform() {
        std::env::set_var("CV005_TEST_VAR", "set");
        let r = Renderer::detached(Scope::root());
        assert_eq!(r.render(r#"{{env "CV005_TEST_VAR"}}"#).unwrap(), "set");
        assert_eq!(r.render(r#"{{env "CV005_SURELY_UNSET"}}"#).unwrap(), "");
        assert_eq!(r.render("{{platform.os}}").unwrap(), std::env::consts::OS);
        assert!(r.render("{{platform.kernel}}").is_err());
        assert!(r.render(r#"{{param "x"}}"#).is_err());
    }

    #[test]
    fn test_cv005_escaped_quotes_in_argument() {
        assert_eq!(
            template_calls(r#"{{env "A\"B"}}"#).unwrap(),
            vec![Call::Env("A\"B".into())]
        );
    }
}
