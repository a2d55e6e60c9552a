//! CV-044: Shell tasks.
//!
//! `task` runs a `check` script (exit 0 means converged) and, when it
//! reports a change, an `apply` script. `task.query` only observes: it
//! runs its query during check and exports the output.

use super::{exports_of, Preparer, Task, TaskContext};
use crate::core::error::{Error, Result};
use crate::core::resolver::Renderer;
use crate::core::types::{Difference, TaskStatus};
use crate::transport::Invocation;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

fn render_env(renderer: &Renderer<'_>, env: &IndexMap<String, String>) -> Result<BTreeMap<String, String>> {
    env.iter()
        .map(|(k, v)| Ok((k.clone(), renderer.render(v)?)))
        .collect()
}

fn render_dir(renderer: &Renderer<'_>, dir: &Option<String>) -> Result<Option<String>> {
    dir.as_deref().map(|d| renderer.render(d)).transpose()
}

// ============================================================================
// task
// ============================================================================

/// `task "id" { check = "test -f /x"  apply = "touch /x"  dir = "/"  env = { K = "v" } }`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellPreparer {
    #[serde(default)]
    pub check: Option<String>,
    pub apply: String,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

impl Preparer for ShellPreparer {
    fn prepare(&self, _ctx: &TaskContext, renderer: &Renderer<'_>) -> Result<Arc<dyn Task>> {
        Ok(Arc::new(Shell {
            check: self.check.as_deref().map(|c| renderer.render(c)).transpose()?,
            apply: renderer.render(&self.apply)?,
            dir: render_dir(renderer, &self.dir)?,
            env: render_env(renderer, &self.env)?,
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Shell {
    pub check: Option<String>,
    pub apply: String,
    pub dir: Option<String>,
    #[serde(skip)]
    pub env: BTreeMap<String, String>,
}

impl Shell {
    fn invocation(&self, script: &str) -> Invocation {
        Invocation::new(script)
            .dir(self.dir.clone())
            .env(self.env.clone())
    }
}

impl Task for Shell {
    fn check(&self, ctx: &TaskContext, _renderer: &Renderer<'_>) -> Result<TaskStatus> {
        let Some(script) = &self.check else {
            return Ok(TaskStatus::will_change("no check script, apply always runs"));
        };
        let out = ctx.run(&self.invocation(script))?;
        let output = out.stdout.trim_end().to_string();
        if out.success() {
            return Ok(TaskStatus::no_change("check passed").output("output", output));
        }
        let mut status = TaskStatus::will_change(format!("check exited {}", out.exit_code));
        status.add_difference(Difference::new(
            "check",
            format!("exit {}", out.exit_code),
            "exit 0",
        ));
        Ok(status.output("output", output))
    }

    fn apply(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let out = ctx.run(&self.invocation(&self.apply))?;
        if !out.success() {
            return Err(Error::TaskApply(format!(
                "apply exited {}: {}",
                out.exit_code,
                out.diagnostic()
            )));
        }
        let mut status = TaskStatus::will_change("apply succeeded");
        let stdout = out.stdout.trim_end();
        if !stdout.is_empty() {
            status.add_message(stdout.to_string());
        }
        Ok(status)
    }

    fn exports(&self) -> BTreeMap<String, String> {
        exports_of(self)
    }
}

// ============================================================================
// task.query
// ============================================================================

/// `task.query "id" { query = "uname -r" }`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryPreparer {
    pub query: String,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

impl Preparer for QueryPreparer {
    fn prepare(&self, _ctx: &TaskContext, renderer: &Renderer<'_>) -> Result<Arc<dyn Task>> {
        Ok(Arc::new(Query {
            query: renderer.render(&self.query)?,
            dir: render_dir(renderer, &self.dir)?,
            env: render_env(renderer, &self.env)?,
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Query {
    pub query: String,
    pub dir: Option<String>,
    #[serde(skip)]
    pub env: BTreeMap<String, String>,
}

impl Task for Query {
    fn check(&self, ctx: &TaskContext, _renderer: &Renderer<'_>) -> Result<TaskStatus> {
        let invocation = Invocation::new(&self.query)
            .dir(self.dir.clone())
            .env(self.env.clone());
        let out = ctx.run(&invocation)?;
        if !out.success() {
            return Err(Error::TaskCheck(format!(
                "query exited {}: {}",
                out.exit_code,
                out.diagnostic()
            )));
        }
        Ok(TaskStatus::no_change("query ran").output("output", out.stdout.trim_end()))
    }

    fn apply(&self, _ctx: &TaskContext) -> Result<TaskStatus> {
        Ok(TaskStatus::no_change("queries never change anything"))
    }

    fn exports(&self) -> BTreeMap<String, String> {
        exports_of(self)
    }
}
