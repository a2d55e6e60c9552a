//! CV-001: Error taxonomy.
//!
//! Parse and validation problems accumulate into [`Diagnostics`]; runtime
//! failures surface per vertex. Every variant maps onto one CLI exit code.

use std::fmt;
use std::path::PathBuf;

/// Source position of a node or token (1-based line and column).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(file: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A single positioned validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub pos: Position,
    pub message: String,
}

impl Diagnostic {
    pub fn new(pos: Position, message: impl Into<String>) -> Self {
        Self {
            pos,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.pos, self.message)
    }
}

/// Accumulated diagnostics, kept sorted by position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.0.iter()
    }

    /// Sort by position and turn into an error, or `Ok` when empty.
    pub fn into_result(mut self) -> Result<()> {
        if self.0.is_empty() {
            return Ok(());
        }
        self.0.sort_by(|a, b| a.pos.cmp(&b.pos));
        Err(Error::Validation(self))
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration text; fatal for that file.
    #[error("{pos}: {message}")]
    Parse { pos: Position, message: String },

    /// One or more structural problems, reported together.
    #[error("{0}")]
    Validation(Diagnostics),

    /// An interpolation expression could not be evaluated.
    #[error("{expr}: {cause}")]
    Resolution { expr: String, cause: String },

    /// The dependency graph contains cycles, one member list per component.
    #[error("dependency cycle detected: {}", format_cycles(.0))]
    Cycle(Vec<Vec<String>>),

    /// Synthesized for a vertex whose upstream failed.
    #[error("dependency {upstream} failed")]
    Dependency { upstream: String },

    #[error("check failed: {0}")]
    TaskCheck(String),

    #[error("apply failed: {0}")]
    TaskApply(String),

    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error("keystore: {0}")]
    Keystore(String),

    #[error("cannot load {source_ref}: {message}")]
    Load { source_ref: String, message: String },

    #[error("configuration: {0}")]
    Config(String),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The cancellation token fired; lists vertices that were still running.
    #[error("cancelled{}", format_running(.running))]
    Cancelled { running: Vec<String> },

    /// Vertex callbacks failed during a walk (sorted by vertex ID).
    #[error("{}", format_walk(.0))]
    Walk(Vec<(String, Error)>),

    /// Invariant violated inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn resolution(expr: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Resolution {
            expr: expr.into(),
            cause: cause.into(),
        }
    }

    /// Process exit code for this error: 2 configuration/load, 130 cancelled, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse { .. }
            | Self::Validation(_)
            | Self::Cycle(_)
            | Self::Signature(_)
            | Self::Keystore(_)
            | Self::Load { .. }
            | Self::Config(_)
            | Self::Resolution { .. } => 2,
            Self::Cancelled { .. } => 130,
            Self::Walk(errors) => {
                if errors
                    .iter()
                    .any(|(_, e)| matches!(e, Self::Cancelled { .. }))
                {
                    130
                } else {
                    1
                }
            }
            _ => 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Walk(errors) => errors.iter().any(|(_, e)| e.is_cancelled()),
            _ => false,
        }
    }
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|c| format!("[{}]", c.join(" -> ")))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_running(running: &[String]) -> String {
    if running.is_empty() {
        String::new()
    } else {
        format!(" while running: {}", running.join(", "))
    }
}

fn format_walk(errors: &[(String, Error)]) -> String {
    errors
        .iter()
        .map(|(id, e)| format!("{}: {}", id, e))
        .collect::<Vec<_>>()
        .join("\n")
}
