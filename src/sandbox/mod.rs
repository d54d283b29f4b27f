//! Sandbox supervisor
//!
//! Owns the lifecycle of one execution: a fresh workspace, the compile step
//! (with the emitter-only fallback), the run under limits and the cleanup.
//! It handles:
//! - Workspace allocation and removal on every exit path
//! - Compile fallback when the instrumented source does not compile
//! - Phase logging per run
//!
//! The supervisor does NOT:
//! - Extract traces or compare outputs
//! - Decide limits (the engine scales them per language)

pub mod workspace;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::core::ExecutionStatus;
use crate::languages::{ExecutionStrategy, LanguageDescriptor};
use crate::runner::{ExecutionResult, LanguageRunner, ProcessRunner, RunLimits};
use crate::weaver::WovenUnit;

pub use workspace::Workspace;

/// File the stdin payload is stored under inside the workspace
pub const STDIN_FILE: &str = "stdin.txt";

/// Lifecycle phase of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Prepared,
    Compiling,
    Running,
    Completed,
    TimedOut,
    CompileFailed,
    RuntimeFailed,
}

impl RunPhase {
    /// Terminal phase for a finished execution
    pub fn terminal(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Success => RunPhase::Completed,
            ExecutionStatus::Timeout => RunPhase::TimedOut,
            ExecutionStatus::CompilationError => RunPhase::CompileFailed,
            ExecutionStatus::RuntimeError => RunPhase::RuntimeFailed,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Prepared => "prepared",
            RunPhase::Compiling => "compiling",
            RunPhase::Running => "running",
            RunPhase::Completed => "completed",
            RunPhase::TimedOut => "timed_out",
            RunPhase::CompileFailed => "compile_failed",
            RunPhase::RuntimeFailed => "runtime_failed",
        };
        write!(f, "{}", s)
    }
}

/// Runs woven units, one workspace per call
#[derive(Clone)]
pub struct Supervisor {
    runner: LanguageRunner,
    work_root: PathBuf,
}

impl Supervisor {
    pub fn new(runner: LanguageRunner, work_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            work_root: work_root.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let process = ProcessRunner::from_config(config);
        Self::new(
            LanguageRunner::new(Arc::new(process), config),
            config.work_root.clone(),
        )
    }

    /// Execute `woven` once with the given stdin. Never fails: problems are
    /// reported through the result's status and diagnostic.
    pub async fn execute(
        &self,
        woven: &WovenUnit,
        language: &LanguageDescriptor,
        stdin: Option<&[u8]>,
        limits: &RunLimits,
    ) -> ExecutionResult {
        let workspace = match Workspace::allocate(&self.work_root).await {
            Ok(workspace) => workspace,
            Err(e) => {
                warn!("Workspace allocation failed: {:#}", e);
                return ExecutionResult::not_started(
                    ExecutionStatus::RuntimeError,
                    format!("Failed to prepare workspace: {:#}", e),
                );
            }
        };
        let run_id = workspace.run_id();
        debug!(%run_id, language = %language.id, phase = %RunPhase::Prepared, "Run prepared");

        let result = self.execute_in(&workspace, woven, language, stdin, limits).await;

        info!(
            %run_id,
            language = %language.id,
            phase = %RunPhase::terminal(result.status),
            duration_ms = result.duration.as_millis() as u64,
            "Run finished"
        );
        if let Err(e) = workspace.close() {
            warn!(%run_id, "Workspace cleanup failed: {:#}", e);
        }
        result
    }

    async fn execute_in(
        &self,
        workspace: &Workspace,
        woven: &WovenUnit,
        language: &LanguageDescriptor,
        stdin: Option<&[u8]>,
        limits: &RunLimits,
    ) -> ExecutionResult {
        let run_id = workspace.run_id();
        if let Err(e) = workspace
            .write(&language.source_file, woven.source.as_bytes())
            .await
        {
            return ExecutionResult::not_started(
                ExecutionStatus::RuntimeError,
                format!("Failed to prepare workspace: {:#}", e),
            );
        }
        if let Some(input) = stdin {
            if let Err(e) = workspace.write(STDIN_FILE, input).await {
                return ExecutionResult::not_started(
                    ExecutionStatus::RuntimeError,
                    format!("Failed to prepare workspace: {:#}", e),
                );
            }
        }

        let mut notes = Vec::new();
        if language.strategy() == ExecutionStrategy::CompileThenRun {
            debug!(%run_id, phase = %RunPhase::Compiling, "Compiling");
        }
        let artifact = match self.runner.compile(language, workspace.path()).await {
            Ok(artifact) => artifact,
            Err(failure) => {
                let fallback = match &woven.fallback {
                    Some(fallback) if !failure.timed_out => fallback,
                    _ => return ExecutionResult::compile_failed(failure),
                };
                warn!(%run_id, "Instrumented source did not compile, retrying without hooks");
                if let Err(e) = workspace
                    .write(&language.source_file, fallback.as_bytes())
                    .await
                {
                    return ExecutionResult::not_started(
                        ExecutionStatus::RuntimeError,
                        format!("Failed to prepare workspace: {:#}", e),
                    );
                }
                match self.runner.compile(language, workspace.path()).await {
                    Ok(artifact) => {
                        notes.push(
                            "instrumentation removed: the instrumented source did not compile"
                                .to_string(),
                        );
                        artifact
                    }
                    Err(failure) => return ExecutionResult::compile_failed(failure),
                }
            }
        };

        debug!(%run_id, phase = %RunPhase::Running, "Running");
        let mut result = self.runner.run(&artifact, stdin, limits).await;
        result.notes.extend(notes);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkPolicy;
    use crate::languages::LanguageRegistry;
    use std::time::Duration;

    const TABLE: &str = r#"
[shell]
source_file = "main.sh"
dialect = "plain"
run_command = "/bin/sh {source}"

[checked]
source_file = "main.sh"
dialect = "plain"
compile_command = "/bin/sh -n {source}"
run_command = "/bin/sh {source}"
"#;

    fn supervisor(root: &std::path::Path) -> Supervisor {
        let process = ProcessRunner::new(1 << 16, NetworkPolicy::Inherit, Duration::from_millis(200));
        Supervisor::new(
            LanguageRunner::new(Arc::new(process), &EngineConfig::default()),
            root,
        )
    }

    fn language(id: &str) -> Arc<LanguageDescriptor> {
        LanguageRegistry::from_toml_str(TABLE)
            .unwrap()
            .resolve(id)
            .unwrap()
    }

    fn left_behind(root: &std::path::Path) -> usize {
        std::fs::read_dir(root).map(|dir| dir.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_run_with_stdin_file_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let woven = WovenUnit::new("cat stdin.txt; read x; echo \"got $x\"".to_string());

        let result = supervisor(root.path())
            .execute(&woven, &language("shell"), Some(b"7\n"), &RunLimits::default())
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "7\ngot 7\n");
        assert!(result.notes.is_empty());
        assert_eq!(left_behind(root.path()), 0);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let woven = WovenUnit::new("echo partial; sleep 5".to_string());
        let limits = RunLimits::new(Duration::from_millis(300), None);

        let started = std::time::Instant::now();
        let result = supervisor(root.path())
            .execute(&woven, &language("shell"), None, &limits)
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.stdout, "partial\n");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(left_behind(root.path()), 0);
    }

    #[tokio::test]
    async fn test_compile_fallback_is_used_and_noted() {
        let root = tempfile::tempdir().unwrap();
        let woven = WovenUnit {
            source: "if then fi (".to_string(),
            fallback: Some("echo ok".to_string()),
            warnings: Vec::new(),
        };

        let result = supervisor(root.path())
            .execute(&woven, &language("checked"), None, &RunLimits::default())
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "ok\n");
        assert_eq!(result.notes.len(), 1);
        assert_eq!(left_behind(root.path()), 0);
    }

    #[tokio::test]
    async fn test_compile_failure_without_fallback() {
        let root = tempfile::tempdir().unwrap();
        let woven = WovenUnit::new("if then fi (".to_string());

        let result = supervisor(root.path())
            .execute(&woven, &language("checked"), None, &RunLimits::default())
            .await;

        assert_eq!(result.status, ExecutionStatus::CompilationError);
        assert!(result.diagnostic.is_some());
        assert!(result.stdout.is_empty());
        assert_eq!(left_behind(root.path()), 0);
    }

    #[test]
    fn test_terminal_phases() {
        assert_eq!(RunPhase::terminal(ExecutionStatus::Success), RunPhase::Completed);
        assert_eq!(RunPhase::terminal(ExecutionStatus::Timeout), RunPhase::TimedOut);
        assert_eq!(RunPhase::terminal(ExecutionStatus::CompilationError).to_string(), "compile_failed");
    }
}
