//! CV-031: Local execution via `bash`.
//!
//! The script is fed on stdin from a writer thread while stdout and stderr
//! are drained on reader threads, so neither side can fill a pipe and stall
//! the other. The child runs in its own process group and is polled with a
//! short timeout; a cancel kills the whole group and returns without waiting
//! for the readers.

use super::{ExecOutput, Invocation, SysCaller};
use crate::core::error::{Error, Result};
use crate::graph::CancelToken;
use std::io::{ErrorKind, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

const POLL: Duration = Duration::from_millis(50);

/// Runs scripts on this host.
#[derive(Debug, Clone)]
pub struct LocalSysCaller {
    shell: String,
}

impl Default for LocalSysCaller {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
        }
    }
}

impl LocalSysCaller {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SysCaller for LocalSysCaller {
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<ExecOutput> {
        cancel.check()?;

        let mut cmd = Command::new(&self.shell);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&invocation.env);
        if let Some(dir) = &invocation.dir {
            cmd.current_dir(dir);
        }
        // Own process group, so a cancel reaches everything the script started.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

        let spawn_err = |e: std::io::Error| {
            Error::TaskApply(format!("failed to spawn {}: {}", self.shell, e))
        };
        let mut child = cmd.spawn().map_err(spawn_err)?;

        let stdout = child.stdout.take().map(|s| thread::spawn(move || drain(s)));
        let stderr = child.stderr.take().map(|s| thread::spawn(move || drain(s)));
        let stdin = child.stdin.take().map(|mut pipe| {
            let script = invocation.script.clone();
            thread::spawn(move || pipe.write_all(script.as_bytes()))
        });

        let status = loop {
            match child.wait_timeout(POLL) {
                Ok(Some(status)) => break status,
                Ok(None) if cancel.is_cancelled() => {
                    warn!(pid = child.id(), "cancelled, killing process group");
                    kill_group(child.id());
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Cancelled { running: vec![] });
                }
                Ok(None) => {}
                Err(e) => return Err(Error::TaskApply(format!("wait error: {}", e))),
            }
        };

        if let Some(Ok(Err(e))) = stdin.map(thread::JoinHandle::join) {
            if e.kind() != ErrorKind::BrokenPipe {
                return Err(Error::TaskApply(format!("stdin write error: {}", e)));
            }
        }
        let stdout = join(stdout);
        let stderr = join(stderr);

        debug!(exit_code = ?status.code(), "script finished");
        Ok(ExecOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

/// SIGKILL the child's process group. The child leads it (`process_group(0)`).
#[cfg(unix)]
fn kill_group(pid: u32) {
    let group = format!("-{}", pid);
    let killed = Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = killed {
        warn!(pid, error = %e, "cannot kill process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

fn drain(mut stream: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

fn join(handle: Option<thread::JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Instant;

    fn run(script: &str) -> ExecOutput {
        LocalSysCaller::new()
            .run(&Invocation::new(script), &CancelToken::new())
            .unwrap()
    }

    #[test]
    fn test_cv031_local_echo() {
        let out = run("echo hello");
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_cv031_local_failure() {
        let out = run("exit 42");
        assert!(!out.success());
        assert_eq!(out.exit_code, 42);
    }

    #[test]
    fn test_cv031_local_stderr() {
        let out = run("echo err >&2");
        assert!(out.success());
        assert!(out.stderr.contains("err"));
    }

    #[test]
    fn test_cv031_local_signal_killed() {
        let out = run("kill -9 $$");
        assert_eq!(out.exit_code, -1);
    }

    #[test]
    fn test_cv031_local_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        let inv = Invocation::new("echo $GREETING; pwd")
            .dir(Some(dir.path().display().to_string()))
            .env(env);
        let out = LocalSysCaller::new().run(&inv, &CancelToken::new()).unwrap();
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(lines[0], "hi");
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(lines[1]).canonicalize().unwrap(),
            canonical
        );
    }

    #[test]
    fn test_cv031_cancel_kills_child() {
        let token = CancelToken::new();
        let trigger = token.clone();
        let timer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let start = Instant::now();
        let err = LocalSysCaller::new()
            .run(&Invocation::new("sleep 10; echo done"), &token)
            .unwrap_err();
        timer.join().unwrap();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cv031_cancel_kills_background_children() {
        let token = CancelToken::new();
        let trigger = token.clone();
        let timer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let start = Instant::now();
        let err = LocalSysCaller::new()
            .run(&Invocation::new("sleep 10 &\nsleep 10 &\nwait"), &token)
            .unwrap_err();
        timer.join().unwrap();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cv031_large_script_with_large_output() {
        let script = format!(
            "head -c 200000 /dev/zero | tr '\\0' x\n# {}\necho\necho tail\n",
            "y".repeat(200_000)
        );
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(run(&script));
        });
        let out = rx
            .recv_timeout(Duration::from_secs(30))
            .expect("script did not finish");
        assert!(out.success());
        assert_eq!(out.stdout.matches('x').count(), 200_000);
        assert!(out.stdout.ends_with("\ntail\n"));
    }

    #[test]
    fn test_cv031_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        assert!(LocalSysCaller::new()
            .run(&Invocation::new("echo no"), &token)
            .is_err());
    }
}
