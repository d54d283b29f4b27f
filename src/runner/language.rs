//! Compile-then-run driver for a language descriptor
//!
//! Works on a workspace directory that already holds the source file. For
//! interpreted languages `compile` is a no-op that only resolves the run
//! command.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{CommandSpec, RunLimits, RunStatus, Runner};
use crate::config::EngineConfig;
use crate::core::utils::truncate_chars;
use crate::core::ExecutionStatus;
use crate::languages::{ExecutionStrategy, LanguageDescriptor};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// Host variables a toolchain needs to locate itself (rustup proxies, ccache)
const TOOLCHAIN_ENV: &[&str] = &["HOME", "RUSTUP_HOME", "CARGO_HOME", "RUSTUP_TOOLCHAIN"];
const MAX_DIAGNOSTIC_CHARS: usize = 8000;

/// A runnable program inside a workspace
#[derive(Debug, Clone)]
pub struct Artifact {
    command: CommandSpec,
}

impl Artifact {
    pub fn command(&self) -> &CommandSpec {
        &self.command
    }
}

/// Why a compile step did not produce an artifact
#[derive(Debug, Clone)]
pub struct CompileFailure {
    /// Compiler output verbatim, or a notice when there is none
    pub diagnostic: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Result of one execution of a submission against one test case
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock duration of the run phase (compile phase for compile failures)
    pub duration: Duration,
    /// Failure explanation suitable for the report (compiler stderr, timeout notice, ...)
    pub diagnostic: Option<String>,
    /// Output hit the capture cap
    pub truncated: bool,
    /// Degradations that happened on the way (e.g. instrumentation dropped)
    pub notes: Vec<String>,
}

impl ExecutionResult {
    pub fn compile_failed(failure: CompileFailure) -> Self {
        Self {
            status: ExecutionStatus::CompilationError,
            stdout: String::new(),
            stderr: failure.diagnostic.clone(),
            duration: failure.elapsed,
            diagnostic: Some(failure.diagnostic),
            truncated: false,
            notes: Vec::new(),
        }
    }

    /// A run that never got a process (workspace or spawn failure)
    pub fn not_started(status: ExecutionStatus, diagnostic: impl Into<String>) -> Self {
        let diagnostic = diagnostic.into();
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            diagnostic: Some(diagnostic),
            truncated: false,
            notes: Vec::new(),
        }
    }
}

/// Drives compile and run for any registered language
#[derive(Clone)]
pub struct LanguageRunner {
    runner: Arc<dyn Runner>,
    compile_timeout: Duration,
    compile_memory_mb: u32,
    max_file_size_bytes: u64,
}

impl LanguageRunner {
    pub fn new(runner: Arc<dyn Runner>, config: &EngineConfig) -> Self {
        Self {
            runner,
            compile_timeout: config.compile_timeout,
            compile_memory_mb: config.compile_memory_limit_mb,
            max_file_size_bytes: config.max_file_size_bytes,
        }
    }

    /// Turn the source file in `workspace` into a runnable artifact
    pub async fn compile(
        &self,
        language: &LanguageDescriptor,
        workspace: &Path,
    ) -> Result<Artifact, CompileFailure> {
        let run = CommandSpec::from_vec(&expand_template(&language.run_command, language, workspace))
            .with_env(run_env(workspace))
            .with_work_dir(workspace);

        let compile_cmd = match (&language.compile_command, language.strategy()) {
            (Some(cmd), ExecutionStrategy::CompileThenRun) => cmd,
            // Interpreted language, no compilation needed
            _ => return Ok(Artifact { command: run }),
        };

        let cmd = CommandSpec::from_vec(&expand_template(compile_cmd, language, workspace))
            .with_env(compile_env(workspace))
            .with_work_dir(workspace);
        debug!("Compiling with {:?}", cmd.to_vec());

        let limits = RunLimits::new(self.compile_timeout, Some(self.compile_memory_mb))
            .with_file_size(self.max_file_size_bytes);

        let outcome = match self.runner.run(&cmd, &limits, None).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return Err(CompileFailure {
                    diagnostic: format!("Failed to start compiler: {:#}", e),
                    timed_out: false,
                    elapsed: Duration::ZERO,
                })
            }
        };

        if outcome.is_success() {
            return Ok(Artifact { command: run });
        }

        let diagnostic = if !outcome.stderr.trim().is_empty() {
            outcome.stderr
        } else if !outcome.stdout.trim().is_empty() {
            outcome.stdout
        } else {
            match outcome.status {
                RunStatus::TimedOut => "Compilation timed out".to_string(),
                RunStatus::Signaled(sig) => format!("Compiler crashed (signal {})", sig),
                RunStatus::Exited(code) => format!("Compilation failed with exit code {}", code),
            }
        };

        Err(CompileFailure {
            diagnostic: truncate_chars(&diagnostic, MAX_DIAGNOSTIC_CHARS),
            timed_out: outcome.status == RunStatus::TimedOut,
            elapsed: outcome.elapsed,
        })
    }

    /// Run an artifact once with optional stdin under the given limits
    pub async fn run(
        &self,
        artifact: &Artifact,
        stdin: Option<&[u8]>,
        limits: &RunLimits,
    ) -> ExecutionResult {
        let limits = RunLimits {
            file_size_bytes: limits.file_size_bytes.or(Some(self.max_file_size_bytes)),
            ..limits.clone()
        };

        let outcome = match self.runner.run(&artifact.command, &limits, stdin).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return ExecutionResult::not_started(
                    ExecutionStatus::RuntimeError,
                    format!("Failed to start program: {:#}", e),
                )
            }
        };

        let (status, diagnostic) = match outcome.status {
            RunStatus::Exited(0) => (ExecutionStatus::Success, None),
            RunStatus::TimedOut => (
                ExecutionStatus::Timeout,
                Some(format!(
                    "Time limit exceeded: no exit within {:.1}s",
                    limits.time.as_secs_f64()
                )),
            ),
            RunStatus::Exited(code) => (
                ExecutionStatus::RuntimeError,
                Some(failure_text(&outcome.stderr, || {
                    format!("Program exited with code {}", code)
                })),
            ),
            RunStatus::Signaled(sig) => (
                ExecutionStatus::RuntimeError,
                Some(failure_text(&outcome.stderr, || {
                    format!("Program killed by signal {}", sig)
                })),
            ),
        };

        ExecutionResult {
            status,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration: outcome.elapsed,
            diagnostic,
            truncated: outcome.truncated,
            notes: Vec::new(),
        }
    }
}

fn failure_text(stderr: &str, fallback: impl FnOnce() -> String) -> String {
    if stderr.trim().is_empty() {
        fallback()
    } else {
        truncate_chars(stderr.trim_end(), MAX_DIAGNOSTIC_CHARS)
    }
}

fn expand_template(template: &[String], language: &LanguageDescriptor, dir: &Path) -> Vec<String> {
    let source = dir.join(&language.source_file);
    let artifact = dir.join(language.artifact_file());
    template
        .iter()
        .map(|part| {
            part.replace("{source}", &source.to_string_lossy())
                .replace("{artifact}", &artifact.to_string_lossy())
                .replace("{dir}", &dir.to_string_lossy())
        })
        .collect()
}

fn host_path() -> String {
    std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string())
}

fn run_env(dir: &Path) -> Vec<(String, String)> {
    let dir = dir.to_string_lossy().into_owned();
    vec![
        ("PATH".to_string(), host_path()),
        ("HOME".to_string(), dir.clone()),
        ("TMPDIR".to_string(), dir),
        ("LANG".to_string(), "C.UTF-8".to_string()),
    ]
}

fn compile_env(dir: &Path) -> Vec<(String, String)> {
    let mut env = vec![
        ("PATH".to_string(), host_path()),
        ("TMPDIR".to_string(), dir.to_string_lossy().into_owned()),
        ("LANG".to_string(), "C.UTF-8".to_string()),
    ];
    for key in TOOLCHAIN_ENV {
        if let Ok(value) = std::env::var(key) {
            env.push((key.to_string(), value));
        }
    }
    if !env.iter().any(|(k, _)| k == "HOME") {
        env.push(("HOME".to_string(), dir.to_string_lossy().into_owned()));
    }
    env
}
