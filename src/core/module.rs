//! CV-004: Module model.
//!
//! A module is the set of params and resources declared in one source
//! file. `param` blocks become [`Param`]s; every other block, including
//! module calls, becomes a [`Resource`].

use super::error::{Diagnostic, Diagnostics, Result};
use super::parser::parse_with_diagnostics;
use super::types::{Node, Value};
use indexmap::IndexMap;
use std::collections::BTreeSet;

/// A module parameter with its optional default.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub node: Node,
    pub default: Option<Value>,
}

impl Param {
    pub fn name(&self) -> &str {
        &self.node.name
    }
}

/// A resource or module call declared in a module.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub node: Node,
    /// Explicit dependency targets, relative to the module.
    pub depends: Vec<String>,
}

impl Resource {
    /// Segment of this resource's vertex ID (`task.a`, `module.web`).
    pub fn segment(&self) -> String {
        self.node.segment()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub params: IndexMap<String, Param>,
    pub resources: Vec<Resource>,
}

const PARAM_ATTRS: &[&str] = &["default", "description"];

impl Module {
    /// Parse and interpret one module source.
    ///
    /// Parser diagnostics and module-level ones (duplicate params,
    /// duplicate resources) are reported together.
    pub fn new(file: &str, text: &str) -> Result<Module> {
        let (nodes, mut diagnostics) = parse_with_diagnostics(file, text)?;
        let module = Self::from_nodes(nodes, &mut diagnostics);
        diagnostics.into_result()?;
        Ok(module)
    }

    pub fn from_nodes(nodes: Vec<Node>, diagnostics: &mut Diagnostics) -> Module {
        let mut module = Module::default();
        let mut seen = BTreeSet::new();

        for node in nodes {
            if node.is_param() {
                if module.params.contains_key(&node.name) {
                    diagnostics.push(Diagnostic::new(
                        node.pos.clone(),
                        format!("duplicate param {:?}", node.name),
                    ));
                    continue;
                }
                for key in node.attrs.keys() {
                    if !PARAM_ATTRS.contains(&key.as_str()) {
                        diagnostics.push(Diagnostic::new(
                            node.pos.clone(),
                            format!("param {:?}: unknown attribute {:?}", node.name, key),
                        ));
                    }
                }
                let default = node.attrs.get("default").cloned();
                module
                    .params
                    .insert(node.name.clone(), Param { node, default });
                continue;
            }

            let segment = node.segment();
            if seen.contains(&segment) {
                diagnostics.push(Diagnostic::new(
                    node.pos.clone(),
                    format!("duplicate resource {:?}", segment),
                ));
                continue;
            }
            seen.insert(segment);
            let depends = node.explicit_dependencies();
            module.resources.push(Resource { node, depends });
        }
        module
    }

    pub fn resource(&self, segment: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.segment() == segment)
    }

    /// Module calls declared in this module.
    pub fn calls(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(|r| r.node.is_module())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{Error, Position};

    #[test]
    fn test_cv004_params_and_resources() {
        let m = Module::new(
            "m.hcl",
            r#"
param "port" { default = 8080 }
param "host" {}
task "a" { apply = "true" }
module "./child.hcl" "c" { port = "{{param \"port\"}}" }
"#,
        )
        .unwrap();
        assert_eq!(m.params.len(), 2);
        assert_eq!(m.params["port"].default, Some(Value::Number(8080.0)));
        assert_eq!(m.params["host"].default, None);
        assert_eq!(m.resources.len(), 2);
        assert!(m.resource("task.a").is_some());
        assert_eq!(m.calls().count(), 1);
    }

    #[test]
    fn test_cv004_duplicate_param() {
        let err = Module::new("d.hcl", "param \"x\" {}\nparam \"x\" {}\n").unwrap_err();
        assert_eq!(err.to_string(), "d.hcl:2:1: duplicate param \"x\"");
    }

    #[test]
    fn test_cv004_duplicate_resource() {
        let err = Module::new(
            "d.hcl",
            "task \"a\" { apply = \"1\" }\ntask \"a\" { apply = \"2\" }\n",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "d.hcl:2:1: duplicate resource \"task.a\"");
    }

    #[test]
    fn test_cv004_three_errors_accumulate_with_positions() {
        let text = "param \"a\" {}\nparam \"a\" {}\nparam \"b\" {}\nparam \"b\" {}\ntask {}\n";
        let Error::Validation(d) = Module::new("p.hcl", text).unwrap_err() else {
            panic!("expected validation error");
        };
        let got: Vec<(Position, String)> = d
            .iter()
            .map(|d| (d.pos.clone(), d.message.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                (Position::new("p.hcl", 2, 1), "duplicate param \"a\"".to_string()),
                (Position::new("p.hcl", 4, 1), "duplicate param \"b\"".to_string()),
                (Position::new("p.hcl", 5, 1), "task: missing name".to_string()),
            ]
        );
    }

    #[test]
    fn test_cv004_param_unknown_attribute() {
        let err = Module::new("u.hcl", "param \"p\" { defualt = 1 }").unwrap_err();
        assert!(err.to_string().contains("unknown attribute \"defualt\""));
    }
}
