//! CV-045: Templates rendered to a file.
//!
//! The body comes from `content` or from a local `source` file and is
//! rendered with the same engine as every other field; the result is
//! converged like `file.content`.

use super::file::{render_mode, FileContent};
use super::{required, Preparer, Task, TaskContext};
use crate::core::error::{Error, Result};
use crate::core::resolver::Renderer;
use crate::core::types::Value;
use serde::Deserialize;
use std::sync::Arc;

/// `template "id" { destination = "/etc/motd"  source = "motd.tmpl" }`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplatePreparer {
    pub destination: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub mode: Option<Value>,
}

impl Preparer for TemplatePreparer {
    fn prepare(&self, _ctx: &TaskContext, renderer: &Renderer<'_>) -> Result<Arc<dyn Task>> {
        let body = match (&self.content, &self.source) {
            (Some(content), None) => content.clone(),
            (None, Some(source)) => {
                let path = renderer.render(source)?;
                std::fs::read_to_string(&path).map_err(|e| Error::io(path, e))?
            }
            (Some(_), Some(_)) => {
                return Err(Error::TaskCheck(
                    "template takes content or source, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::TaskCheck(
                    "template needs content or source".to_string(),
                ))
            }
        };
        Ok(Arc::new(FileContent {
            destination: required(renderer, "destination", &self.destination)?,
            content: renderer.render(&body)?,
            mode: render_mode(renderer, self.mode.as_ref())?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::testing::{local_ctx, renderer};

    #[test]
    fn test_cv045_renders_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("motd.tmpl");
        std::fs::write(&src, "welcome to {{platform.os}}\n").unwrap();
        let dest = dir.path().join("motd");
        let p = TemplatePreparer {
            destination: dest.display().to_string(),
            content: None,
            source: Some(src.display().to_string()),
            mode: None,
        };
        let ctx = local_ctx();
        let task = p.prepare(&ctx, &renderer()).unwrap();
        assert!(task.check(&ctx, &renderer()).unwrap().has_changes());
        task.apply(&ctx).unwrap();
        assert_eq!(
            std::fs::read_to_string(&dest).unwrap(),
            format!("welcome to {}\n", std::env::consts::OS)
        );
        assert!(!task.check(&ctx, &renderer()).unwrap().has_changes());
    }

    #[test]
    fn test_cv045_needs_exactly_one_body() {
        let mut p = TemplatePreparer {
            destination: "/tmp/x".into(),
            content: None,
            source: None,
            mode: None,
        };
        assert!(p.prepare(&local_ctx(), &renderer()).is_err());
        p.content = Some("a".into());
        p.source = Some("b".into());
        assert!(p.prepare(&local_ctx(), &renderer()).is_err());
    }
}
