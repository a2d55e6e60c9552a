//! CV-041: File content and directory drivers.

use super::{display_content, exports_of, required, Preparer, Task, TaskContext};
use crate::core::error::{Error, Result};
use crate::core::resolver::Renderer;
use crate::core::types::{Difference, TaskStatus, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

/// Parse a mode given as an octal string (`"0644"`) or bare digits (`644`).
pub fn parse_mode(text: &str) -> Result<u32> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0o")
        .unwrap_or(trimmed);
    if digits.is_empty() || !digits.chars().all(|c| ('0'..='7').contains(&c)) {
        return Err(Error::TaskCheck(format!("invalid mode {:?}", text)));
    }
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|e| Error::TaskCheck(format!("invalid mode {:?}: {}", text, e)))?;
    if mode > 0o7777 {
        return Err(Error::TaskCheck(format!("invalid mode {:?}", text)));
    }
    Ok(mode)
}

/// Render an optional `mode` attribute.
pub(crate) fn render_mode(renderer: &Renderer<'_>, mode: Option<&Value>) -> Result<Option<u32>> {
    match mode {
        None => Ok(None),
        Some(value) => parse_mode(&renderer.render(&value.to_text())?).map(Some),
    }
}

fn format_mode(mode: u32) -> String {
    format!("{:04o}", mode)
}

fn current_mode(meta: &fs::Metadata) -> u32 {
    meta.permissions().mode() & 0o7777
}

fn io_err(path: &str, e: std::io::Error) -> Error {
    Error::io(path, e)
}

// ============================================================================
// file.content
// ============================================================================

/// `file.content "id" { destination = "/path"  content = "..."  mode = "0644" }`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentPreparer {
    pub destination: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub mode: Option<Value>,
}

impl Preparer for ContentPreparer {
    fn prepare(&self, _ctx: &TaskContext, renderer: &Renderer<'_>) -> Result<Arc<dyn Task>> {
        Ok(Arc::new(FileContent {
            destination: required(renderer, "destination", &self.destination)?,
            content: renderer.render(&self.content)?,
            mode: render_mode(renderer, self.mode.as_ref())?,
        }))
    }
}

/// Ensures a file holds exactly `content`.
#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub destination: String,
    pub content: String,
    #[serde(serialize_with = "serialize_mode")]
    pub mode: Option<u32>,
}

fn serialize_mode<S: serde::Serializer>(mode: &Option<u32>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match mode {
        Some(m) => s.serialize_str(&format_mode(*m)),
        None => s.serialize_none(),
    }
}

impl FileContent {
    fn observe(&self) -> Result<TaskStatus> {
        let path = Path::new(&self.destination);
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut status = TaskStatus::will_change(format!("{} does not exist", self.destination));
                status.add_difference(Difference::new("destination", "<absent>", &self.destination));
                status.add_difference(Difference::new("content", "", display_content(&self.content)));
                if let Some(mode) = self.mode {
                    status.add_difference(Difference::new("mode", "", format_mode(mode)));
                }
                return Ok(status);
            }
            Err(e) => return Err(io_err(&self.destination, e)),
        };
        if !meta.is_file() {
            return Err(Error::TaskCheck(format!(
                "{} exists and is not a regular file",
                self.destination
            )));
        }

        let current = fs::read(path).map_err(|e| io_err(&self.destination, e))?;
        let current = String::from_utf8_lossy(&current);
        let mut status = TaskStatus::new();
        status.add_difference(Difference::new(
            "content",
            display_content(&current),
            display_content(&self.content),
        ));
        if let Some(mode) = self.mode {
            status.add_difference(Difference::new(
                "mode",
                format_mode(current_mode(&meta)),
                format_mode(mode),
            ));
        }
        status.differences.retain(Difference::changes);
        if status.has_changes() {
            status.add_message(format!("{} differs", self.destination));
        } else {
            status.add_message(format!("{} is up to date", self.destination));
        }
        Ok(status)
    }
}

impl Task for FileContent {
    fn check(&self, _ctx: &TaskContext, _renderer: &Renderer<'_>) -> Result<TaskStatus> {
        self.observe()
    }

    fn apply(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        ctx.cancel.check()?;
        let path = Path::new(&self.destination);
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mode = match (self.mode, fs::metadata(path)) {
            (Some(mode), _) => Some(mode),
            (None, Ok(meta)) => Some(current_mode(&meta)),
            (None, Err(_)) => None,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| io_err(&parent.display().to_string(), e))?;
        tmp.write_all(self.content.as_bytes())
            .map_err(|e| io_err(&self.destination, e))?;
        let perms = fs::Permissions::from_mode(mode.unwrap_or(0o644));
        fs::set_permissions(tmp.path(), perms).map_err(|e| io_err(&self.destination, e))?;
        tmp.persist(path)
            .map_err(|e| io_err(&self.destination, e.error))?;

        Ok(TaskStatus::will_change(format!(
            "wrote {} bytes to {}",
            self.content.len(),
            self.destination
        )))
    }

    fn exports(&self) -> BTreeMap<String, String> {
        exports_of(self)
    }
}

// ============================================================================
// file.directory
// ============================================================================

/// `file.directory "id" { destination = "/path"  create_all = true }`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryPreparer {
    pub destination: String,
    #[serde(default)]
    pub create_all: bool,
    #[serde(default)]
    pub mode: Option<Value>,
}

impl Preparer for DirectoryPreparer {
    fn prepare(&self, _ctx: &TaskContext, renderer: &Renderer<'_>) -> Result<Arc<dyn Task>> {
        Ok(Arc::new(Directory {
            destination: required(renderer, "destination", &self.destination)?,
            create_all: self.create_all,
            mode: render_mode(renderer, self.mode.as_ref())?,
        }))
    }
}

/// Ensures a directory exists.
#[derive(Debug, Clone, Serialize)]
pub struct Directory {
    pub destination: String,
    pub create_all: bool,
    #[serde(serialize_with = "serialize_mode")]
    pub mode: Option<u32>,
}

impl Task for Directory {
    fn check(&self, _ctx: &TaskContext, _renderer: &Renderer<'_>) -> Result<TaskStatus> {
        match fs::metadata(&self.destination) {
            Ok(meta) if meta.is_dir() => {
                let mut status = TaskStatus::no_change(format!("{} exists", self.destination));
                if let Some(mode) = self.mode {
                    status.add_difference(Difference::new(
                        "mode",
                        format_mode(current_mode(&meta)),
                        format_mode(mode),
                    ));
                    status.differences.retain(Difference::changes);
                }
                Ok(status)
            }
            Ok(_) => Err(Error::TaskCheck(format!(
                "{} exists and is not a directory",
                self.destination
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let parent_missing = Path::new(&self.destination)
                    .parent()
                    .is_some_and(|p| !p.as_os_str().is_empty() && !p.exists());
                if parent_missing && !self.create_all {
                    return Err(Error::TaskCheck(format!(
                        "parent of {} does not exist (set create_all to create it)",
                        self.destination
                    )));
                }
                let mut status = TaskStatus::will_change(format!("{} does not exist", self.destination));
                status.add_difference(Difference::new("destination", "<absent>", &self.destination));
                Ok(status)
            }
            Err(e) => Err(io_err(&self.destination, e)),
        }
    }

    fn apply(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        ctx.cancel.check()?;
        let created = if Path::new(&self.destination).is_dir() {
            false
        } else if self.create_all {
            fs::create_dir_all(&self.destination).map_err(|e| io_err(&self.destination, e))?;
            true
        } else {
            fs::create_dir(&self.destination).map_err(|e| io_err(&self.destination, e))?;
            true
        };
        if let Some(mode) = self.mode {
            fs::set_permissions(&self.destination, fs::Permissions::from_mode(mode))
                .map_err(|e| io_err(&self.destination, e))?;
        }
        let message = if created {
            format!("created {}", self.destination)
        } else {
            format!("updated mode of {}", self.destination)
        };
        Ok(TaskStatus::will_change(message))
    }

    fn exports(&self) -> BTreeMap<String, String> {
        exports_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StatusLevel;
    use crate::resources::testing::{local_ctx, renderer};

    fn content(dest: &Path, text: &str, mode: Option<u32>) -> FileContent {
        FileContent {
            destination: dest.display().to_string(),
            content: text.to_string(),
            mode,
        }
    }

    #[test]
    fn test_cv041_parse_mode() {
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert_eq!(parse_mode("0o600").unwrap(), 0o600);
        assert!(parse_mode("0999").is_err());
        assert!(parse_mode("").is_err());
        assert!(parse_mode("77777").is_err());
    }

    #[test]
    fn test_cv041_missing_file_will_change() {
        let dir = tempfile::tempdir().unwrap();
        let task = content(&dir.path().join("a"), "hi", None);
        let status = task.check(&local_ctx(), &renderer()).unwrap();
        assert_eq!(status.level, StatusLevel::WillChange);
        assert!(status.differences.iter().any(|d| d.field == "content" && d.desired == "hi"));
    }

    #[test]
    fn test_cv041_apply_then_check_converged() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a");
        let task = content(&dest, "hi", Some(0o600));
        let ctx = local_ctx();
        task.apply(&ctx).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "hi");
        assert_eq!(current_mode(&fs::metadata(&dest).unwrap()), 0o600);
        let status = task.check(&ctx, &renderer()).unwrap();
        assert!(!status.has_changes(), "{:?}", status);
        assert!(status.differences.is_empty());
        // applying twice has the same effect
        task.apply(&ctx).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "hi");
    }

    #[test]
    fn test_cv041_content_difference_uses_digest_for_long_content() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big");
        fs::write(&dest, "small").unwrap();
        let long = "y".repeat(100);
        let status = content(&dest, &long, None).check(&local_ctx(), &renderer()).unwrap();
        let diff = &status.differences[0];
        assert_eq!(diff.current, "small");
        assert!(diff.desired.starts_with("blake3:"));
    }

    #[test]
    fn test_cv041_apply_preserves_existing_mode() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("script.sh");
        fs::write(&dest, "old").unwrap();
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755)).unwrap();
        content(&dest, "new", None).apply(&local_ctx()).unwrap();
        assert_eq!(current_mode(&fs::metadata(&dest).unwrap()), 0o755);
    }

    #[test]
    fn test_cv041_destination_is_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = content(dir.path(), "x", None)
            .check(&local_ctx(), &renderer())
            .unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn test_cv041_prepare_renders_fields() {
        std::env::set_var("CV041_DEST", "/tmp/cv041");
        let p = ContentPreparer {
            destination: r#"{{env "CV041_DEST"}}/f"#.into(),
            content: "on {{platform.os}}".into(),
            mode: Some(Value::Number(644.0)),
        };
        let task = p.prepare(&local_ctx(), &renderer()).unwrap();
        let exports = task.exports();
        assert_eq!(exports["destination"], "/tmp/cv041/f");
        assert_eq!(exports["content"], format!("on {}", std::env::consts::OS));
        assert_eq!(exports["mode"], "0644");
    }

    #[test]
    fn test_cv041_prepare_requires_destination() {
        let p = ContentPreparer {
            destination: String::new(),
            content: "x".into(),
            mode: None,
        };
        let err = p.prepare(&local_ctx(), &renderer()).err().unwrap();
        assert!(err.to_string().contains("destination is required"));
    }

    #[test]
    fn test_cv041_directory_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b");
        let task = Directory {
            destination: dest.display().to_string(),
            create_all: true,
            mode: None,
        };
        let ctx = local_ctx();
        assert!(task.check(&ctx, &renderer()).unwrap().has_changes());
        task.apply(&ctx).unwrap();
        assert!(dest.is_dir());
        assert!(!task.check(&ctx, &renderer()).unwrap().has_changes());
    }

    #[test]
    fn test_cv041_directory_needs_parent() {
        let dir = tempfile::tempdir().unwrap();
        let task = Directory {
            destination: dir.path().join("x/y").display().to_string(),
            create_all: false,
            mode: None,
        };
        assert!(task.check(&local_ctx(), &renderer()).is_err());
    }
}
