//! Grading engine
//!
//! One grading pass: validate, weave once, run every test case concurrently
//! through the supervisor, extract traces, then evaluate and score after all
//! runs have reached a terminal state. Runs from every submission share one
//! worker pool.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::checker;
use crate::config::EngineConfig;
use crate::core::{ExecutionStatus, Verdict};
use crate::error::{ConfigError, GradeError};
use crate::evaluator;
use crate::languages::{LanguageDescriptor, LanguageRegistry};
use crate::lesson::{Lesson, Runtime, Submission};
use crate::runner::{ExecutionResult, RunLimits};
use crate::sandbox::Supervisor;
use crate::scoring::{self, ScoreReport, TestCaseReport};
use crate::trace;
use crate::weaver::{self, WovenUnit};

/// Language used for browser lessons whose language has no DOM runtime
const BROWSER_LANGUAGE: &str = "web";

#[derive(Clone)]
pub struct Engine {
    registry: Arc<LanguageRegistry>,
    supervisor: Supervisor,
    pool: Arc<Semaphore>,
    config: Arc<EngineConfig>,
}

impl Engine {
    pub fn new(registry: LanguageRegistry, config: EngineConfig) -> Self {
        let supervisor = Supervisor::from_config(&config);
        Self::with_supervisor(registry, config, supervisor)
    }

    pub fn with_supervisor(
        registry: LanguageRegistry,
        config: EngineConfig,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            supervisor,
            pool: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// Resolve the language a lesson runs in and check the submission against it
    fn resolve_language(
        &self,
        lesson: &Lesson,
        submission: &Submission,
    ) -> Result<Arc<LanguageDescriptor>, ConfigError> {
        let resolve = |name: &str| {
            self.registry
                .resolve(name)
                .ok_or_else(|| ConfigError::UnknownLanguage(name.to_string()))
        };

        let lesson_language = resolve(&lesson.execution_environment.language)?;
        let submitted = resolve(&submission.language)?;
        if submitted.id != lesson_language.id {
            return Err(ConfigError::LanguageMismatch {
                lesson: lesson_language.id.clone(),
                submission: submitted.id.clone(),
            });
        }

        if lesson.execution_environment.runtime == Runtime::Browser && !lesson_language.dialect.is_web() {
            return resolve(BROWSER_LANGUAGE);
        }
        Ok(lesson_language)
    }

    fn limits(&self, lesson: &Lesson, language: &LanguageDescriptor) -> RunLimits {
        let base = lesson.execution_environment.timeout().min(self.config.max_timeout);
        let memory = lesson
            .execution_environment
            .memory_limit_mb
            .unwrap_or(self.config.memory_limit_mb);
        RunLimits::new(
            language.calculate_time_limit(base),
            language.calculate_memory_limit(memory),
        )
    }

    /// Grade one submission. Only configuration problems are errors; every
    /// per-run failure ends up in the report.
    pub async fn grade(&self, lesson: &Lesson, submission: &Submission) -> Result<ScoreReport, GradeError> {
        lesson.validate()?;
        let language = self.resolve_language(lesson, submission)?;
        let unit = submission.source_unit(language.dialect)?;
        let requirements = lesson.requirements();
        let lesson_name = lesson.lesson_id.as_deref().unwrap_or("unnamed");

        let woven = Arc::new(weaver::weave(&unit, language.dialect, &lesson.instrumentation()));
        for warning in &woven.warnings {
            warn!("Instrumentation degraded for lesson {}: {}", lesson_name, warning);
        }

        let limits = self.limits(lesson, &language);
        info!(
            "Grading lesson {} ({}, {} test cases, time limit {:.1}s)",
            lesson_name,
            language.id,
            lesson.test_cases.len(),
            limits.time.as_secs_f64()
        );

        let results = self.run_all(lesson, &woven, &language, &limits).await;

        let mut reports = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            reports.push(self.test_case_report(lesson, index, result, &woven));
        }

        let traces: Vec<_> = reports.iter().map(|r| r.trace.clone()).collect();
        let evaluations = evaluator::evaluate(&traces, &requirements, &unit.full_text());

        let mut report = scoring::aggregate(reports, evaluations, &lesson.grading);
        report.lesson_id = lesson.lesson_id.clone();
        report.language = language.id.clone();

        info!(
            "Graded lesson {}: correctness={} behavioral={} overall={} passed={}",
            lesson_name, report.correctness_score, report.behavioral_score, report.overall_score, report.passed
        );
        Ok(report)
    }

    /// Fan out one run per test case and wait for all of them
    async fn run_all(
        &self,
        lesson: &Lesson,
        woven: &Arc<WovenUnit>,
        language: &Arc<LanguageDescriptor>,
        limits: &RunLimits,
    ) -> Vec<ExecutionResult> {
        let mut tasks = JoinSet::new();
        for (index, case) in lesson.test_cases.iter().enumerate() {
            let pool = self.pool.clone();
            let supervisor = self.supervisor.clone();
            let woven = woven.clone();
            let language = language.clone();
            let limits = limits.clone();
            let stdin = case.input.clone().map(String::into_bytes);

            tasks.spawn(async move {
                let result = match pool.acquire_owned().await {
                    Ok(_permit) => {
                        supervisor
                            .execute(&woven, &language, stdin.as_deref(), &limits)
                            .await
                    }
                    Err(e) => ExecutionResult::not_started(
                        ExecutionStatus::RuntimeError,
                        format!("Worker pool unavailable: {}", e),
                    ),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<ExecutionResult>> = vec![None; lesson.test_cases.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("Test case task failed: {}", e),
            }
        }

        results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| {
                    ExecutionResult::not_started(
                        ExecutionStatus::RuntimeError,
                        "Run aborted before reaching a terminal state",
                    )
                })
            })
            .collect()
    }

    fn test_case_report(
        &self,
        lesson: &Lesson,
        index: usize,
        result: ExecutionResult,
        woven: &WovenUnit,
    ) -> TestCaseReport {
        let case = &lesson.test_cases[index];
        let name = lesson.case_name(index);

        let extraction = trace::extract(&result.stdout);
        let mut trace = extraction.trace;
        if let Some(failure) = &extraction.failure {
            // a compile failure never ran, so there is nothing to report
            if result.status != ExecutionStatus::CompilationError {
                debug!("No trace for test case {}: {}", name, failure);
                trace.errors.push(format!("trace unavailable: {}", failure));
            }
        }
        trace.errors.extend(woven.warnings.iter().cloned());
        trace.errors.extend(result.notes.iter().cloned());

        let (passed, verdict) = match Verdict::from_failed_status(result.status) {
            Some(verdict) => (false, verdict),
            None if checker::check(&extraction.user_output, &case.expected_output, lesson.grading.comparison) => {
                (true, Verdict::Accepted)
            }
            None => (false, Verdict::WrongAnswer),
        };
        debug!("Test case {}: {} ({:?})", name, verdict, result.duration);

        let diagnostic = match result.diagnostic {
            Some(diagnostic) => Some(diagnostic),
            // a successful run that still printed to stderr
            None if !passed && !result.stderr.trim().is_empty() => Some(result.stderr.trim_end().to_string()),
            None => None,
        };

        TestCaseReport {
            name,
            status: result.status,
            verdict,
            passed,
            expected: case.expected_output.describe(),
            actual: extraction.user_output,
            diagnostic,
            duration: result.duration,
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkPolicy;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const TABLE: &str = r#"
[shell]
source_file = "main.sh"
dialect = "plain"
run_command = "/bin/sh {source}"
aliases = ["sh"]

[other]
source_file = "main.sh"
dialect = "plain"
run_command = "/bin/sh {source}"

[python]
source_file = "main.py"
dialect = "python"
run_command = "python3 -u {source}"
"#;

    fn engine(root: &std::path::Path) -> Engine {
        let config = EngineConfig {
            max_concurrent_runs: 2,
            work_root: root.to_path_buf(),
            network: NetworkPolicy::Inherit,
            kill_grace: Duration::from_millis(200),
            ..EngineConfig::default()
        };
        Engine::new(LanguageRegistry::from_toml_str(TABLE).unwrap(), config)
    }

    fn lesson(language: &str, timeout: f64, cases: &str, requirements: &str) -> Lesson {
        Lesson::from_json(&format!(
            r#"{{
                "lesson_id": "test-lesson",
                "execution_environment": {{"language": "{}", "timeout_seconds": {}}},
                "test_cases": {},
                "behavioral_requirements": {},
                "grading": {{"correctness_weight": 0.5, "behavioral_weight": 0.5, "passing_threshold": 70}}
            }}"#,
            language, timeout, cases, requirements
        ))
        .unwrap()
    }

    /// Engine over the shipped language table
    fn builtin_engine(root: &std::path::Path) -> Engine {
        let config = EngineConfig {
            max_concurrent_runs: 2,
            work_root: root.to_path_buf(),
            network: NetworkPolicy::Inherit,
            kill_grace: Duration::from_millis(200),
            ..EngineConfig::default()
        };
        Engine::new(LanguageRegistry::builtin().unwrap(), config)
    }

    fn toolchain_available(program: &str) -> bool {
        std::process::Command::new(program)
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    const DOUBLE_CASES: &str = r#"[
        {"name": "two", "input": "2\n", "expected_output": "4"},
        {"name": "ten", "input": "10\n", "expected_output": "20"},
        {"name": "zero", "input": "0\n", "expected_output": "1"}
    ]"#;

    #[tokio::test]
    async fn test_grades_every_case_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let lesson = lesson("shell", 5.0, DOUBLE_CASES, "[]");
        let submission = Submission::code("sh", "read x; echo $((x * 2))");

        let report = assert_ok!(engine(root.path()).grade(&lesson, &submission).await);

        assert_eq!(report.language, "shell");
        assert_eq!(report.test_cases.len(), 3);
        assert!(report.test_cases[0].passed);
        assert!(report.test_cases[1].passed);
        assert_eq!(report.test_cases[2].verdict, Verdict::WrongAnswer);
        assert_eq!(report.test_cases[2].actual, "0\n");
        assert_eq!(report.correctness_score, 66.7);
        assert_eq!(report.behavioral_score, 100.0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_isolated_to_its_case() {
        let root = tempfile::tempdir().unwrap();
        let lesson = lesson("shell", 1.0, DOUBLE_CASES.replace("\"1\"", "\"0\"").as_str(), "[]");
        let submission = Submission::code("shell", "read x; if [ \"$x\" = 10 ]; then sleep 30; fi; echo $((x * 2))");

        let started = std::time::Instant::now();
        let report = engine(root.path()).grade(&lesson, &submission).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.test_cases[1].status, ExecutionStatus::Timeout);
        assert_eq!(report.test_cases[1].verdict, Verdict::Timeout);
        assert!(report.test_cases[1].diagnostic.is_some());
        assert_eq!(report.correctness_score, 66.7);
        assert!(report.test_cases[0].passed && report.test_cases[2].passed);
    }

    #[tokio::test]
    async fn test_configuration_errors_fail_fast() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let shell_lesson = lesson("shell", 5.0, DOUBLE_CASES, "[]");

        let err = assert_err!(engine.grade(&shell_lesson, &Submission::code("cobol", "x")).await);
        assert!(matches!(err.config(), ConfigError::UnknownLanguage(name) if name == "cobol"));

        let err = assert_err!(engine.grade(&shell_lesson, &Submission::code("other", "echo 4")).await);
        assert!(matches!(err.config(), ConfigError::LanguageMismatch { .. }));

        let no_code = Submission {
            language: "shell".into(),
            ..Submission::default()
        };
        let err = assert_err!(engine.grade(&shell_lesson, &no_code).await);
        assert!(matches!(err.config(), ConfigError::MissingSource("code")));

        let mut endless = shell_lesson.clone();
        endless.execution_environment.timeout_seconds = 1e20;
        let err = assert_err!(engine.grade(&endless, &Submission::code("shell", "echo 4")).await);
        assert!(matches!(err.config(), ConfigError::InvalidLesson(_)));

        // nothing was allocated
        assert_eq!(std::fs::read_dir(root.path()).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_forbidden_pattern_zeroes_behavioral_score() {
        let root = tempfile::tempdir().unwrap();
        let lesson = lesson(
            "shell",
            5.0,
            r#"[{"input": "2\n", "expected_output": "4"}]"#,
            r#"[{"kind": "forbidden_pattern", "patterns": ["expr"]}]"#,
        );
        let submission = Submission::code("shell", "read x; expr $x \\* 2");

        let report = engine(root.path()).grade(&lesson, &submission).await.unwrap();
        assert_eq!(report.correctness_score, 100.0);
        assert_eq!(report.behavioral_score, 0.0);
        assert!(!report.requirements[0].satisfied);
        assert_eq!(report.overall_score, 50.0);
        assert!(!report.passed);
    }

    #[tokio::test]
    async fn test_uninstrumented_language_records_degradation() {
        let root = tempfile::tempdir().unwrap();
        let lesson = lesson(
            "shell",
            5.0,
            r#"[{"input": "2\n", "expected_output": "4"}]"#,
            r#"[{"kind": "loop_usage"}]"#,
        );
        let submission = Submission::code("shell", "read x; echo $((x * 2))");

        let report = engine(root.path()).grade(&lesson, &submission).await.unwrap();
        assert!(report.test_cases[0].passed);
        assert!(!report.requirements[0].satisfied);
        assert!(report.test_cases[0]
            .trace
            .errors
            .iter()
            .any(|e| e.contains("no instrumentation")));
    }

    const FACTORIAL_CASES: &str = r#"[
        {"input": "5\n", "expected_output": "120"},
        {"input": "0\n", "expected_output": "1"},
        {"input": "3\n", "expected_output": "6"}
    ]"#;
    const RECURSION: &str = r#"[{"kind": "recursion", "function": "factorial", "min_calls": 2}]"#;

    #[tokio::test]
    async fn test_recursive_factorial_in_python() {
        if !toolchain_available("python3") {
            eprintln!("python3 not found, skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let lesson = lesson("python", 10.0, FACTORIAL_CASES, RECURSION);
        let submission = Submission::code(
            "python",
            "def factorial(n):\n    return 1 if n <= 1 else n * factorial(n - 1)\n\nprint(factorial(int(input())))\n",
        );

        let report = engine(root.path()).grade(&lesson, &submission).await.unwrap();
        assert_eq!(report.correctness_score, 100.0);
        assert_eq!(report.behavioral_score, 100.0);
        assert_eq!(report.overall_score, 100.0);
        assert!(report.passed);
        assert_eq!(report.test_cases[0].actual, "120\n");
        assert_eq!(report.test_cases[0].trace.depth("factorial"), 5);
    }

    #[tokio::test]
    async fn test_iterative_factorial_in_python() {
        if !toolchain_available("python3") {
            eprintln!("python3 not found, skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let lesson = lesson("python", 10.0, FACTORIAL_CASES, RECURSION);
        let submission = Submission::code(
            "python",
            "def factorial(n):\n    result = 1\n    for i in range(2, n + 1):\n        result *= i\n    return result\n\nprint(factorial(int(input())))\n",
        );

        let report = engine(root.path()).grade(&lesson, &submission).await.unwrap();
        assert_eq!(report.correctness_score, 100.0);
        assert_eq!(report.behavioral_score, 0.0);
        assert!(!report.behavioral_score.is_sign_negative());
        assert_eq!(report.overall_score, 50.0);
        assert!(!report.passed);
        assert_eq!(report.test_cases[0].trace.calls("factorial"), 1);
    }

    /// Grade a recursive factorial with the shipped table and check the trace
    async fn assert_recursive_factorial(language: &str, code: &str) {
        let root = tempfile::tempdir().unwrap();
        let lesson = lesson(language, 10.0, FACTORIAL_CASES, RECURSION);
        let submission = Submission::code(language, code);

        let report = builtin_engine(root.path()).grade(&lesson, &submission).await.unwrap();
        for case in &report.test_cases {
            assert!(case.passed, "{}: {:?} {:?}", language, case.verdict, case.diagnostic);
        }
        assert_eq!(report.test_cases[0].actual, "120\n");
        assert_eq!(report.test_cases[0].trace.depth("factorial"), 5);
        assert_eq!(report.test_cases[1].trace.depth("factorial"), 1);
        assert!(report.requirements[0].satisfied);
        assert_eq!(report.overall_score, 100.0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    /// Factorial that fails at n == 2; the trace must still arrive
    async fn assert_trace_survives_failure(language: &str, code: &str, error: &str) {
        let root = tempfile::tempdir().unwrap();
        let lesson = lesson(language, 10.0, r#"[{"input": "5\n", "expected_output": "120"}]"#, RECURSION);
        let submission = Submission::code(language, code);

        let report = builtin_engine(root.path()).grade(&lesson, &submission).await.unwrap();
        let case = &report.test_cases[0];
        assert_eq!(case.status, ExecutionStatus::RuntimeError, "{}: {:?}", language, case.diagnostic);
        assert!(!case.passed);
        assert_eq!(case.trace.depth("factorial"), 4);
        assert!(
            case.trace.errors.iter().any(|e| e.contains(error)),
            "{}: {:?}",
            language,
            case.trace.errors
        );
        assert!(report.requirements[0].satisfied);
    }

    #[tokio::test]
    async fn test_recursive_factorial_in_javascript() {
        if !toolchain_available("node") {
            eprintln!("node not found, skipping");
            return;
        }
        assert_recursive_factorial(
            "javascript",
            "const n = parseInt(require('fs').readFileSync(0, 'utf8'), 10);\n\
             function factorial(n) {\n  return n <= 1 ? 1 : n * factorial(n - 1);\n}\n\
             console.log(factorial(n));\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_recursive_factorial_in_c() {
        if !toolchain_available("gcc") {
            eprintln!("gcc not found, skipping");
            return;
        }
        assert_recursive_factorial(
            "c",
            "#include <stdio.h>\n\n\
             long factorial(int n) {\n    return n <= 1 ? 1 : n * factorial(n - 1);\n}\n\n\
             int main(void) {\n    int n;\n    if (scanf(\"%d\", &n) != 1) return 1;\n    \
             printf(\"%ld\\n\", factorial(n));\n    return 0;\n}\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_recursive_factorial_in_cpp() {
        if !toolchain_available("g++") {
            eprintln!("g++ not found, skipping");
            return;
        }
        assert_recursive_factorial(
            "cpp",
            "#include <iostream>\n\n\
             long factorial(int n) {\n    return n <= 1 ? 1 : n * factorial(n - 1);\n}\n\n\
             int main() {\n    int n;\n    std::cin >> n;\n    std::cout << factorial(n) << std::endl;\n}\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_recursive_factorial_in_rust() {
        if !toolchain_available("rustc") {
            eprintln!("rustc not found, skipping");
            return;
        }
        assert_recursive_factorial(
            "rust",
            "use std::io::Read;\n\n\
             fn factorial(n: u64) -> u64 {\n    if n <= 1 { 1 } else { n * factorial(n - 1) }\n}\n\n\
             fn main() {\n    let mut input = String::new();\n    \
             std::io::stdin().read_to_string(&mut input).unwrap();\n    \
             let n: u64 = input.trim().parse().unwrap();\n    println!(\"{}\", factorial(n));\n}\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_web_dom_and_events_are_recorded() {
        if !toolchain_available("node") {
            eprintln!("node not found, skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let lesson = lesson(
            "web",
            10.0,
            r#"[{"expected_output": "ready"}]"#,
            r#"[{"kind": "dom_manipulation", "operations": ["getElementById", "textContent"]},
                {"kind": "event_handling", "events": ["click"]}]"#,
        );
        let submission = Submission {
            language: "web".into(),
            html: Some("<button id=\"go\">Go</button>\n<p id=\"out\"></p>".into()),
            javascript: Some(
                "const button = document.getElementById('go');\n\
                 button.addEventListener('click', () => {\n  \
                 document.getElementById('out').textContent = 'clicked';\n});\n\
                 document.getElementById('out').textContent = 'waiting';\n\
                 console.log('ready');\n"
                    .into(),
            ),
            ..Submission::default()
        };

        let report = builtin_engine(root.path()).grade(&lesson, &submission).await.unwrap();
        let case = &report.test_cases[0];
        assert!(case.passed, "{:?} {:?}", case.actual, case.diagnostic);
        assert!(case
            .trace
            .dom_operations
            .iter()
            .any(|op| op.operation == "textContent" && op.target == "#out"));
        assert!(case
            .trace
            .event_handlers
            .iter()
            .any(|handler| handler.event == "click" && handler.target == "#go"));
        assert!(report.requirements.iter().all(|r| r.satisfied));
        assert_eq!(report.overall_score, 100.0);
    }

    #[tokio::test]
    async fn test_trace_survives_python_exception() {
        if !toolchain_available("python3") {
            eprintln!("python3 not found, skipping");
            return;
        }
        assert_trace_survives_failure(
            "python",
            "def factorial(n):\n    if n == 2:\n        raise ValueError('boom')\n    \
             return 1 if n <= 1 else n * factorial(n - 1)\n\nprint(factorial(int(input())))\n",
            "ValueError: boom",
        )
        .await;
    }

    #[tokio::test]
    async fn test_trace_survives_javascript_throw() {
        if !toolchain_available("node") {
            eprintln!("node not found, skipping");
            return;
        }
        assert_trace_survives_failure(
            "javascript",
            "function factorial(n) {\n  if (n === 2) throw new Error('boom');\n  \
             return n <= 1 ? 1 : n * factorial(n - 1);\n}\nconsole.log(factorial(5));\n",
            "Error: boom",
        )
        .await;
    }

    #[tokio::test]
    async fn test_trace_survives_cpp_throw() {
        if !toolchain_available("g++") {
            eprintln!("g++ not found, skipping");
            return;
        }
        assert_trace_survives_failure(
            "cpp",
            "#include <iostream>\n#include <stdexcept>\n\n\
             long factorial(int n) {\n    if (n == 2) throw std::runtime_error(\"boom\");\n    \
             return n <= 1 ? 1 : n * factorial(n - 1);\n}\n\n\
             int main() {\n    std::cout << factorial(5) << std::endl;\n}\n",
            "boom",
        )
        .await;
    }

    #[tokio::test]
    async fn test_trace_survives_rust_panic() {
        if !toolchain_available("rustc") {
            eprintln!("rustc not found, skipping");
            return;
        }
        assert_trace_survives_failure(
            "rust",
            "fn factorial(n: u64) -> u64 {\n    if n == 2 {\n        panic!(\"boom\");\n    }\n    \
             if n <= 1 { 1 } else { n * factorial(n - 1) }\n}\n\n\
             fn main() {\n    println!(\"{}\", factorial(5));\n}\n",
            "panicked: boom",
        )
        .await;
    }

    #[tokio::test]
    async fn test_forged_trace_before_os_exit_is_superseded() {
        if !toolchain_available("python3") {
            eprintln!("python3 not found, skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let lesson = lesson("python", 10.0, r#"[{"input": "5\n", "expected_output": "120"}]"#, RECURSION);
        let forged = format!(
            "{}\n{{\"function_calls\": {{\"factorial\": 9}}, \"recursion_depth\": {{\"factorial\": 9}}}}\n{}",
            crate::trace::TRACE_BEGIN,
            crate::trace::TRACE_END
        );
        let code = format!(
            "import os, sys\n\ndef factorial(n):\n    result = 1\n    for i in range(2, n + 1):\n        \
             result *= i\n    return result\n\nprint(factorial(int(input())))\nprint({:?})\n\
             sys.stdout.flush()\nos._exit(0)\n",
            forged
        );

        let report = builtin_engine(root.path())
            .grade(&lesson, &Submission::code("python", code))
            .await
            .unwrap();
        let case = &report.test_cases[0];
        assert_eq!(case.trace.depth("factorial"), 1);
        assert!(!report.requirements[0].satisfied);
        assert_eq!(report.behavioral_score, 0.0);
    }
}
