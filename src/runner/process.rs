//! Process runner implementation
//!
//! Executes a probe unit as a child process: the probe is written into a
//! fresh scratch directory (deleted on drop), the interpreter is spawned in
//! isolated mode with a scrubbed environment and its own process group, and
//! the whole group is SIGKILLed when the wall-clock budget expires. An
//! optional configured wrapper command maps execution onto a stronger
//! platform primitive (container runtime, namespace tool) where available.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use tokio::fs;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ProbeRunner, RunLimits, RunOutcome, RunStatus};
use crate::config::get_config;

const PROBE_FILE: &str = "probe.py";
const SCRUBBED_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runner that executes probes as confined child processes
pub struct ProcessRunner {
    python_bin: String,
    wrapper: Vec<String>,
}

impl ProcessRunner {
    /// Build a runner from the worker configuration
    pub fn from_config() -> Self {
        let config = get_config();
        Self {
            python_bin: config.python_bin.clone(),
            wrapper: config.sandbox_wrapper.clone(),
        }
    }

    /// Run a probe in a scratch directory with the given limits
    pub async fn execute(&self, probe_source: &str, limits: &RunLimits) -> Result<RunOutcome> {
        let scratch = tempfile::tempdir().context("Failed to create probe scratch directory")?;
        let probe_path = scratch.path().join(PROBE_FILE);
        fs::write(&probe_path, probe_source)
            .await
            .context("Failed to write probe unit")?;

        let mut cmd = if let Some(wrapper_bin) = self.wrapper.first() {
            let mut cmd = Command::new(wrapper_bin);
            cmd.args(&self.wrapper[1..]);
            cmd.arg(&self.python_bin);
            cmd
        } else {
            Command::new(&self.python_bin)
        };

        cmd.arg("-I")
            .arg(&probe_path)
            .current_dir(scratch.path())
            .env_clear()
            .env("PATH", SCRUBBED_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let memory_bytes = u64::from(limits.memory_mb) * 1024 * 1024;
        let fsize_bytes = u64::from(limits.fsize_kb) * 1024;
        let processes = u64::from(limits.processes);

        // Child-side confinement: own session (so the whole group can be
        // killed) and hard rlimits on memory, file writes, and forks.
        unsafe {
            cmd.pre_exec(move || {
                setsid().map_err(std::io::Error::from)?;
                setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes)
                    .map_err(std::io::Error::from)?;
                setrlimit(Resource::RLIMIT_FSIZE, fsize_bytes, fsize_bytes)
                    .map_err(std::io::Error::from)?;
                setrlimit(Resource::RLIMIT_NPROC, processes, processes)
                    .map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let started = Instant::now();
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.python_bin))?;
        let pid = child.id();

        let output = match timeout(limits.time_budget, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to collect probe output")?,
            Err(_) => {
                // setsid made the child a group leader, so killing its
                // group reaps anything it forked as well.
                if let Some(pid) = pid {
                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        warn!("Failed to kill probe process group {}: {}", pid, e);
                    }
                }
                debug!(
                    "Probe killed after exceeding {} ms budget",
                    limits.time_budget.as_millis()
                );
                return Ok(RunOutcome {
                    status: RunStatus::TimedOut,
                    stdout: String::new(),
                    stderr: String::new(),
                    time_ms: limits.time_budget.as_millis() as u64,
                });
            }
        };

        let time_ms = started.elapsed().as_millis() as u64;

        let status = match output.status.code() {
            Some(code) => RunStatus::Exited(code),
            None => {
                use std::os::unix::process::ExitStatusExt;
                RunStatus::Signaled(output.status.signal().unwrap_or(-1))
            }
        };

        Ok(RunOutcome {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            time_ms,
        })
    }
}

#[async_trait]
impl ProbeRunner for ProcessRunner {
    async fn run(&self, probe_source: &str, limits: &RunLimits) -> Result<RunOutcome> {
        self.execute(probe_source, limits).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn runner() -> ProcessRunner {
        ProcessRunner {
            python_bin: "python3".into(),
            wrapper: vec![],
        }
    }

    async fn interpreter_available() -> bool {
        Command::new("python3")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_captures_partitioned_output() {
        if !interpreter_available().await {
            return;
        }

        let outcome = runner()
            .execute(
                "import sys\nprint('to stdout')\nsys.stderr.write('to stderr')\n",
                &RunLimits::new(Duration::from_secs(10)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert!(outcome.stdout.contains("to stdout"));
        assert!(outcome.stderr.contains("to stderr"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_not_fatal() {
        if !interpreter_available().await {
            return;
        }

        let outcome = runner()
            .execute(
                "import sys\nsys.exit(3)\n",
                &RunLimits::new(Duration::from_secs(10)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Exited(3));
        assert_eq!(outcome.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_budget_expiry_kills_and_discards_output() {
        if !interpreter_available().await {
            return;
        }

        let outcome = runner()
            .execute(
                "print('before sleep', flush=True)\nimport time\ntime.sleep(30)\n",
                &RunLimits::new(Duration::from_millis(500)),
            )
            .await
            .unwrap();

        assert!(outcome.status.is_timeout());
        assert!(outcome.stdout.is_empty());
    }
}
