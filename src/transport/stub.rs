//! Recording [`SysCaller`] for driver tests.

use super::{ExecOutput, Invocation, SysCaller};
use crate::core::error::Result;
use crate::graph::CancelToken;
use std::sync::Mutex;

/// Answers scripts from a table of `(prefix, output)` rules and records every call.
///
/// The first rule whose prefix matches the script wins; unmatched scripts
/// succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingSysCaller {
    rules: Mutex<Vec<(String, ExecOutput)>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingSysCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, prefix: &str, output: ExecOutput) -> Self {
        self.set(prefix, output);
        self
    }

    /// Add or replace the rule for `prefix`.
    pub fn set(&self, prefix: &str, output: ExecOutput) {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.retain(|(p, _)| p != prefix);
        rules.insert(0, (prefix.to_string(), output));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn called(&self, script: &str) -> bool {
        self.calls().iter().any(|c| c == script)
    }
}

impl SysCaller for RecordingSysCaller {
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<ExecOutput> {
        cancel.check()?;
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation.script.clone());
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rules
            .iter()
            .find(|(prefix, _)| invocation.script.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}
