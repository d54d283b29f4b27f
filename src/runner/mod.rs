//! Runner module - Execution abstraction layer
//!
//! This module provides a unified interface for running programs:
//! - `ProcessRunner`: spawns one process group under rlimits and a wall-clock deadline
//! - `LanguageRunner`: turns a workspace holding a source file into a compiled
//!   artifact and runs it, using a `Runner` underneath
//!
//! The runner module does NOT:
//! - Compare outputs or score anything
//! - Know about traces or instrumentation
//! - Own the workspace directory (the sandbox supervisor does)

pub mod language;
pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command specification for execution
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Complete environment of the child; nothing is inherited
    pub env: Vec<(String, String)>,
    /// Working directory
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(
        mut self,
        env: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program).with_args(iter.cloned())
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Resource limits for execution
#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Wall-clock deadline
    pub time: Duration,
    /// Address-space ceiling in MB (None: uncapped)
    pub memory_mb: Option<u32>,
    /// Largest file the process may write, in bytes
    pub file_size_bytes: Option<u64>,
}

impl RunLimits {
    pub fn new(time: Duration, memory_mb: Option<u32>) -> Self {
        Self {
            time,
            memory_mb,
            file_size_bytes: None,
        }
    }

    pub fn with_file_size(mut self, bytes: u64) -> Self {
        self.file_size_bytes = Some(bytes);
        self
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Some(256))
    }
}

/// Execution status (raw, no verdict interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by signal
    Signaled(i32),
    /// Wall-clock deadline or CPU limit exceeded; the process group was killed
    TimedOut,
}

impl RunStatus {
    /// Check if execution was successful (exited with code 0)
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }
}

/// Outcome of running a program
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Stdout content (lossy UTF-8), partial if the run was killed
    pub stdout: String,
    /// Stderr content (lossy UTF-8)
    pub stderr: String,
    /// Wall-clock time from spawn to exit
    pub elapsed: Duration,
    /// True when either stream hit the capture cap
    pub truncated: bool,
}

impl RunOutcome {
    /// Check if execution was successful
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Runner trait for executing programs
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command with the given limits and optional stdin.
    ///
    /// `Err` means the process could not be started or supervised at all;
    /// a program that crashes or times out is an `Ok` outcome.
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
    ) -> Result<RunOutcome>;
}

// Re-exports
pub use language::{Artifact, CompileFailure, ExecutionResult, LanguageRunner};
pub use process::ProcessRunner;
