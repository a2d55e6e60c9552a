//! CV-042: Soft and hard links.

use super::{exports_of, required, Preparer, Task, TaskContext};
use crate::core::error::{Error, Result};
use crate::core::resolver::Renderer;
use crate::core::types::{Difference, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    #[default]
    Soft,
    Hard,
}

/// `file.link "id" { source = "/target"  destination = "/link"  type = "hard" }`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkPreparer {
    pub source: String,
    pub destination: String,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: LinkKind,
}

impl Preparer for LinkPreparer {
    fn prepare(&self, _ctx: &TaskContext, renderer: &Renderer<'_>) -> Result<Arc<dyn Task>> {
        Ok(Arc::new(Link {
            source: required(renderer, "source", &self.source)?,
            destination: required(renderer, "destination", &self.destination)?,
            kind: self.kind,
        }))
    }
}

/// Ensures `destination` is a link to `source`.
#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub source: String,
    pub destination: String,
    #[serde(rename = "type")]
    pub kind: LinkKind,
}

impl Link {
    /// Describe the current entry at `destination`, `None` when it already matches.
    fn mismatch(&self) -> Result<Option<String>> {
        let meta = match fs::symlink_metadata(&self.destination) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Some("<absent>".to_string()))
            }
            Err(e) => return Err(Error::io(&self.destination, e)),
        };
        match self.kind {
            LinkKind::Soft => {
                if !meta.file_type().is_symlink() {
                    return Ok(Some("<not a symlink>".to_string()));
                }
                let target = fs::read_link(&self.destination)
                    .map_err(|e| Error::io(&self.destination, e))?;
                if target == Path::new(&self.source) {
                    Ok(None)
                } else {
                    Ok(Some(target.display().to_string()))
                }
            }
            LinkKind::Hard => {
                let source = fs::metadata(&self.source).map_err(|e| {
                    Error::TaskCheck(format!("hard link source {}: {}", self.source, e))
                })?;
                if source.dev() == meta.dev() && source.ino() == meta.ino() {
                    Ok(None)
                } else {
                    Ok(Some(format!("<inode {}>", meta.ino())))
                }
            }
        }
    }
}

impl Task for Link {
    fn check(&self, _ctx: &TaskContext, _renderer: &Renderer<'_>) -> Result<TaskStatus> {
        match self.mismatch()? {
            None => Ok(TaskStatus::no_change(format!(
                "{} links to {}",
                self.destination, self.source
            ))),
            Some(current) => {
                if current == "<not a symlink>" && Path::new(&self.destination).is_dir() {
                    return Err(Error::TaskCheck(format!(
                        "{} is a directory, refusing to replace it",
                        self.destination
                    )));
                }
                let mut status = TaskStatus::will_change(format!(
                    "{} will link to {}",
                    self.destination, self.source
                ));
                status.add_difference(Difference::new("source", current, &self.source));
                Ok(status)
            }
        }
    }

    fn apply(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        ctx.cancel.check()?;
        if self.mismatch()?.is_none() {
            return Ok(TaskStatus::no_change("already linked"));
        }
        match fs::symlink_metadata(&self.destination) {
            Ok(meta) if meta.is_dir() => {
                return Err(Error::TaskApply(format!(
                    "{} is a directory, refusing to replace it",
                    self.destination
                )))
            }
            Ok(_) => fs::remove_file(&self.destination).map_err(|e| Error::io(&self.destination, e))?,
            Err(_) => {}
        }
        let linked = match self.kind {
            LinkKind::Soft => std::os::unix::fs::symlink(&self.source, &self.destination),
            LinkKind::Hard => fs::hard_link(&self.source, &self.destination),
        };
        linked.map_err(|e| Error::io(&self.destination, e))?;
        Ok(TaskStatus::will_change(format!(
            "linked {} to {}",
            self.destination, self.source
        )))
    }

    fn exports(&self) -> BTreeMap<String, String> {
        exports_of(self)
    }
}
