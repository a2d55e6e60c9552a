//! CV-043: Package drivers (rpm/yum and dpkg/apt).
//!
//! Both share the [`PackageManager`] capability set; every query and
//! mutation goes through the context's `SysCaller`.

use super::{exports_of, required, Preparer, Task, TaskContext};
use crate::core::error::{Error, Result};
use crate::core::resolver::Renderer;
use crate::core::types::{Difference, TaskStatus};
use crate::transport::shell_quote;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Package-database capabilities shared by all package drivers.
pub trait PackageManager: Send + Sync + std::fmt::Debug {
    /// Installed version, or `None` when not installed.
    fn installed_version(&self, ctx: &TaskContext, name: &str) -> Result<Option<String>>;

    /// Install; a no-op returning "already installed" when present.
    fn install_package(&self, ctx: &TaskContext, name: &str) -> Result<String>;

    /// Remove; a no-op returning "not installed" when absent.
    fn remove_package(&self, ctx: &TaskContext, name: &str) -> Result<String>;
}

fn run_mutation(ctx: &TaskContext, script: &str) -> Result<String> {
    let out = ctx.run_script(script)?;
    if !out.success() {
        return Err(Error::TaskApply(format!(
            "{} exited {}: {}",
            script,
            out.exit_code,
            out.diagnostic()
        )));
    }
    Ok(out.stdout.trim().to_string())
}

/// rpm for queries, yum for changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rpm;

impl PackageManager for Rpm {
    fn installed_version(&self, ctx: &TaskContext, name: &str) -> Result<Option<String>> {
        let out = ctx.run_script(&format!("rpm -q {}", shell_quote(name)))?;
        if !out.success() {
            return Ok(None);
        }
        let line = out.stdout.lines().next().unwrap_or_default().trim();
        let version = line
            .strip_prefix(name)
            .and_then(|v| v.strip_prefix('-'))
            .unwrap_or(line);
        Ok(Some(version.to_string()))
    }

    fn install_package(&self, ctx: &TaskContext, name: &str) -> Result<String> {
        if self.installed_version(ctx, name)?.is_some() {
            return Ok("already installed".to_string());
        }
        run_mutation(ctx, &format!("yum install -y {}", shell_quote(name)))
    }

    fn remove_package(&self, ctx: &TaskContext, name: &str) -> Result<String> {
        if self.installed_version(ctx, name)?.is_none() {
            return Ok("not installed".to_string());
        }
        run_mutation(ctx, &format!("yum remove -y {}", shell_quote(name)))
    }
}

/// dpkg for queries, apt-get for changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Apt;

impl PackageManager for Apt {
    fn installed_version(&self, ctx: &TaskContext, name: &str) -> Result<Option<String>> {
        let out = ctx.run_script(&format!("dpkg -s {}", shell_quote(name)))?;
        if !out.success() {
            return Ok(None);
        }
        let mut installed = true;
        let mut version = String::new();
        for line in out.stdout.lines() {
            if let Some(status) = line.strip_prefix("Status:") {
                installed = status.trim().ends_with(" installed");
            } else if let Some(v) = line.strip_prefix("Version:") {
                version = v.trim().to_string();
            }
        }
        Ok(installed.then_some(version))
    }

    fn install_package(&self, ctx: &TaskContext, name: &str) -> Result<String> {
        if self.installed_version(ctx, name)?.is_some() {
            return Ok("already installed".to_string());
        }
        run_mutation(
            ctx,
            &format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {}", shell_quote(name)),
        )
    }

    fn remove_package(&self, ctx: &TaskContext, name: &str) -> Result<String> {
        if self.installed_version(ctx, name)?.is_none() {
            return Ok("not installed".to_string());
        }
        run_mutation(
            ctx,
            &format!("DEBIAN_FRONTEND=noninteractive apt-get remove -y {}", shell_quote(name)),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    #[default]
    Present,
    Absent,
}

impl PackageState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
        }
    }
}

/// Fields shared by `package.rpm` and `package.apt`; `name` defaults to the block name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageFields {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: PackageState,
}

impl PackageFields {
    fn prepare(&self, renderer: &Renderer<'_>, manager: Arc<dyn PackageManager>) -> Result<Arc<dyn Task>> {
        Ok(Arc::new(Package {
            name: required(renderer, "name", &self.name)?,
            state: self.state,
            manager,
        }))
    }
}

/// `package.rpm "nginx" { state = "present" }`
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct RpmPreparer(pub PackageFields);

impl Preparer for RpmPreparer {
    fn prepare(&self, _ctx: &TaskContext, renderer: &Renderer<'_>) -> Result<Arc<dyn Task>> {
        self.0.prepare(renderer, Arc::new(Rpm))
    }

    fn use_block_name(&mut self, name: &str) {
        if self.0.name.is_empty() {
            self.0.name = name.to_string();
        }
    }
}

/// `package.apt "nginx" { state = "absent" }`
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct AptPreparer(pub PackageFields);

impl Preparer for AptPreparer {
    fn prepare(&self, _ctx: &TaskContext, renderer: &Renderer<'_>) -> Result<Arc<dyn Task>> {
        self.0.prepare(renderer, Arc::new(Apt))
    }

    fn use_block_name(&mut self, name: &str) {
        if self.0.name.is_empty() {
            self.0.name = name.to_string();
        }
    }
}

/// Ensures a package is present or absent.
#[derive(Debug, Clone, Serialize)]
pub struct Package {
    pub name: String,
    pub state: PackageState,
    #[serde(skip)]
    pub manager: Arc<dyn PackageManager>,
}

impl Task for Package {
    fn check(&self, ctx: &TaskContext, _renderer: &Renderer<'_>) -> Result<TaskStatus> {
        let version = self
            .manager
            .installed_version(ctx, &self.name)
            .map_err(|e| Error::TaskCheck(format!("querying {}: {}", self.name, e)))?;
        let current = if version.is_some() {
            PackageState::Present
        } else {
            PackageState::Absent
        };

        if current == self.state {
            let message = match &version {
                Some(v) if !v.is_empty() => format!("{} {} is installed", self.name, v),
                Some(_) => format!("{} is installed", self.name),
                None => format!("{} is not installed", self.name),
            };
            let mut status = TaskStatus::no_change(message);
            if let Some(v) = version {
                status.outputs.insert("version".to_string(), v);
            }
            return Ok(status);
        }

        let verb = match self.state {
            PackageState::Present => "install",
            PackageState::Absent => "remove",
        };
        let mut status = TaskStatus::will_change(format!("will {} {}", verb, self.name));
        status.add_difference(Difference::new("state", current.as_str(), self.state.as_str()));
        Ok(status)
    }

    fn apply(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let output = match self.state {
            PackageState::Present => self.manager.install_package(ctx, &self.name)?,
            PackageState::Absent => self.manager.remove_package(ctx, &self.name)?,
        };
        let mut status = TaskStatus::will_change(format!(
            "{} is {}",
            self.name,
            self.state.as_str()
        ));
        if !output.is_empty() {
            status.add_message(output);
        }
        Ok(status)
    }

    fn exports(&self) -> BTreeMap<String, String> {
        exports_of(self)
    }
}
