//! Runner module - probe execution abstraction
//!
//! Provides the execution seam for synthesized probe units:
//! - `ProcessRunner`: spawns the interpreter as a confined child process
//!
//! The runner does NOT:
//! - Parse sentinel output or count verdicts
//! - Know about test specs or scoring
//! - Screen submissions (that happened before synthesis)

pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Resource limits for one probe run
#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Wall-clock budget; the child's process group is killed on expiry
    pub time_budget: Duration,
    /// Address-space limit in MB
    pub memory_mb: u32,
    /// Max file size the probe may write, in KB
    pub fsize_kb: u32,
    /// Max processes the probe may fork
    pub processes: u32,
}

impl RunLimits {
    pub fn new(time_budget: Duration) -> Self {
        Self {
            time_budget,
            ..Self::default()
        }
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(30),
            memory_mb: 256,
            fsize_kb: 262_144,
            processes: 64,
        }
    }
}

/// Execution status (raw, no verdict interpretation)
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// Probe exited on its own with the given exit code
    Exited(i32),
    /// Killed on wall-clock budget; captured output was discarded
    TimedOut,
    /// Killed by a signal
    Signaled(i32),
}

impl RunStatus {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunStatus::TimedOut)
    }
}

/// Raw outcome of running a probe
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time in milliseconds
    pub time_ms: u64,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Exited(code) => code,
            _ => -1,
        }
    }
}

/// Runner trait for executing probe units
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    /// Run a probe source with the given limits
    async fn run(&self, probe_source: &str, limits: &RunLimits) -> Result<RunOutcome>;
}

// Re-exports
pub use process::ProcessRunner;
