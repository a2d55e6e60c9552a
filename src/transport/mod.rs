//! CV-030: Command execution seam.
//!
//! Drivers never spawn processes directly; they go through a [`SysCaller`]
//! so that tests can substitute a recording stub.

pub mod local;
#[cfg(test)]
pub mod stub;

use crate::core::error::Result;
use crate::graph::CancelToken;
use std::collections::BTreeMap;

pub use local::LocalSysCaller;

/// Output from executing a script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// stderr if present, else stdout, trimmed. Used in failure messages.
    pub fn diagnostic(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim()
        } else {
            err
        }
    }
}

/// A script plus the environment it runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub script: String,
    /// Working directory; inherited when `None`.
    pub dir: Option<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    pub fn dir(mut self, dir: Option<String>) -> Self {
        self.dir = dir;
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Host command execution.
///
/// A non-zero exit status is not an error; only failing to run the script
/// at all (or cancellation) is.
pub trait SysCaller: Send + Sync {
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<ExecOutput>;
}

/// Quote a word for a POSIX shell, only when it needs quoting.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+@%,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
