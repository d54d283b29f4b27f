//! Score aggregation and feedback
//!
//! Pure functions of their inputs: the same test results and evaluation
//! results always produce the same report, byte for byte.

use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

use crate::core::{ExecutionStatus, Verdict};
use crate::evaluator::EvaluationResult;
use crate::lesson::GradingPolicy;
use crate::trace::ExecutionTrace;

/// How many evidence lines the summary shows per requirement
const SUMMARY_EVIDENCE_LINES: usize = 3;

/// Outcome of one test case
#[derive(Debug, Clone, Serialize)]
pub struct TestCaseReport {
    pub name: String,
    pub status: ExecutionStatus,
    pub verdict: Verdict,
    pub passed: bool,
    pub expected: String,
    /// Program output with the trace region removed
    pub actual: String,
    /// Compiler stderr, runtime stderr or a timeout notice
    pub diagnostic: Option<String>,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub trace: ExecutionTrace,
}

fn serialize_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    pub lesson_id: Option<String>,
    pub language: String,
    pub correctness_score: f64,
    pub behavioral_score: f64,
    pub overall_score: f64,
    pub passed: bool,
    pub passing_threshold: f64,
    pub test_cases: Vec<TestCaseReport>,
    pub requirements: Vec<EvaluationResult>,
    pub feedback: Vec<String>,
}

/// One decimal place, never negative zero
fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0 + 0.0
}

fn correctness_percent(tests: &[TestCaseReport]) -> f64 {
    if tests.is_empty() {
        return 0.0;
    }
    let passed = tests.iter().filter(|t| t.passed).count();
    100.0 * passed as f64 / tests.len() as f64
}

fn behavioral_percent(evaluations: &[EvaluationResult]) -> f64 {
    if evaluations.is_empty() {
        return 100.0;
    }
    let total = evaluations.iter().fold(0.0, |acc, e| acc + e.weight);
    if total <= 0.0 {
        // all weights zero: count requirements equally
        let satisfied = evaluations.iter().filter(|e| e.satisfied).count();
        return 100.0 * satisfied as f64 / evaluations.len() as f64;
    }
    let satisfied = evaluations
        .iter()
        .filter(|e| e.satisfied)
        .fold(0.0, |acc, e| acc + e.weight);
    100.0 * satisfied / total
}

fn overall_percent(correctness: f64, behavioral: f64, policy: &GradingPolicy) -> f64 {
    let total = policy.correctness_weight + policy.behavioral_weight;
    if total <= 0.0 {
        return 0.0;
    }
    (correctness * policy.correctness_weight + behavioral * policy.behavioral_weight) / total
}

/// 100 × passed / total
pub fn correctness_score(tests: &[TestCaseReport]) -> f64 {
    round1(correctness_percent(tests))
}

/// Weighted share of satisfied requirements; 100 when there are none
pub fn behavioral_score(evaluations: &[EvaluationResult]) -> f64 {
    round1(behavioral_percent(evaluations))
}

/// Weighted sum of both scores, with weights normalized to sum to one
pub fn overall_score(correctness: f64, behavioral: f64, policy: &GradingPolicy) -> f64 {
    round1(overall_percent(correctness, behavioral, policy))
}

/// Build the report from test outcomes and requirement evaluations
///
/// Rounding is applied to the reported numbers only; the overall score and
/// the pass decision are computed from the exact ratios.
pub fn aggregate(
    tests: Vec<TestCaseReport>,
    evaluations: Vec<EvaluationResult>,
    policy: &GradingPolicy,
) -> ScoreReport {
    let correctness = correctness_percent(&tests);
    let behavioral = behavioral_percent(&evaluations);
    let overall = overall_percent(correctness, behavioral, policy);
    let passed = overall >= policy.passing_threshold;
    let feedback = feedback(&tests, &evaluations, overall, policy.passing_threshold);

    ScoreReport {
        lesson_id: None,
        language: String::new(),
        correctness_score: round1(correctness),
        behavioral_score: round1(behavioral),
        overall_score: round1(overall),
        passed,
        passing_threshold: policy.passing_threshold,
        test_cases: tests,
        requirements: evaluations,
        feedback,
    }
}

fn feedback(
    tests: &[TestCaseReport],
    evaluations: &[EvaluationResult],
    overall: f64,
    threshold: f64,
) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(
        if overall >= 90.0 {
            "Excellent work! Your solution is correct and uses the required techniques."
        } else if overall >= threshold {
            "Good job! Your solution meets the requirements, with some room for improvement."
        } else if overall >= 50.0 {
            "Partially correct. Review the feedback below and try again."
        } else {
            "Your solution does not meet the requirements yet. Review the feedback below and try again."
        }
        .to_string(),
    );

    if let Some(failure) = tests.iter().find(|t| t.status == ExecutionStatus::CompilationError) {
        lines.push(format!(
            "Your code did not compile: {}",
            failure
                .diagnostic
                .as_deref()
                .and_then(crate::core::utils::last_line)
                .unwrap_or("no compiler output")
        ));
    } else {
        let failed = tests.iter().filter(|t| !t.passed).count();
        if failed > 0 {
            lines.push(format!("{} of {} test cases failed.", failed, tests.len()));
        }
        let timeouts = tests.iter().filter(|t| t.status == ExecutionStatus::Timeout).count();
        if timeouts > 0 {
            lines.push(format!(
                "{} test case(s) ran out of time; look for infinite loops or unbounded recursion.",
                timeouts
            ));
        }
    }

    for evaluation in evaluations.iter().filter(|e| !e.satisfied) {
        if let Some(message) = &evaluation.message {
            lines.push(message.clone());
        }
    }
    lines
}

impl ScoreReport {
    pub fn failed_cases(&self) -> impl Iterator<Item = &TestCaseReport> {
        self.test_cases.iter().filter(|t| !t.passed)
    }

    /// Human-readable rendering
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(50);
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "GRADING RESULTS");
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "Lesson: {}", self.lesson_id.as_deref().unwrap_or("unknown"));
        let _ = writeln!(out, "Language: {}", self.language);
        let _ = writeln!(out, "Overall Score: {}%", self.overall_score);
        let _ = writeln!(
            out,
            "Status: {} (threshold {}%)",
            if self.passed { "PASSED" } else { "FAILED" },
            self.passing_threshold
        );
        let _ = writeln!(out);

        let _ = writeln!(out, "SCORE BREAKDOWN:");
        let _ = writeln!(out, "Correctness: {}%", self.correctness_score);
        let _ = writeln!(out, "Behavioral: {}%", self.behavioral_score);
        let _ = writeln!(out);

        if !self.requirements.is_empty() {
            let _ = writeln!(out, "BEHAVIORAL ANALYSIS:");
            for requirement in &self.requirements {
                let _ = writeln!(
                    out,
                    "{}: {}",
                    requirement.requirement_id,
                    if requirement.satisfied { "PASSED" } else { "FAILED" }
                );
                for line in requirement.evidence.iter().take(SUMMARY_EVIDENCE_LINES) {
                    let _ = writeln!(out, "  - {}", line);
                }
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "FEEDBACK:");
        for line in &self.feedback {
            let _ = writeln!(out, "{}", line);
        }

        let failures: Vec<_> = self.failed_cases().collect();
        if !failures.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "FAILED TEST CASES:");
            for case in failures {
                let _ = writeln!(out, "{}: {}", case.name, case.verdict);
                if let Some(diagnostic) = &case.diagnostic {
                    let _ = writeln!(out, "  {}", crate::core::utils::head_lines(diagnostic, 3));
                } else {
                    let _ = writeln!(
                        out,
                        "  expected {:?}, got {:?}",
                        case.expected,
                        crate::core::utils::truncate_chars(&case.actual, 200)
                    );
                }
            }
        }
        let _ = write!(out, "{}", rule);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(name: &str, status: ExecutionStatus, passed: bool) -> TestCaseReport {
        TestCaseReport {
            name: name.to_string(),
            status,
            verdict: if passed {
                Verdict::Accepted
            } else {
                Verdict::from_failed_status(status).unwrap_or(Verdict::WrongAnswer)
            },
            passed,
            expected: "120".to_string(),
            actual: if passed { "120\n".into() } else { String::new() },
            diagnostic: None,
            duration: Duration::from_millis(12),
            trace: ExecutionTrace::empty(),
        }
    }

    fn requirement(id: &str, satisfied: bool, weight: f64) -> EvaluationResult {
        EvaluationResult {
            requirement_id: id.to_string(),
            kind: "recursion".to_string(),
            satisfied,
            weight,
            evidence: vec![format!("{} evidence", id)],
            message: (!satisfied).then(|| format!("{} is not met", id)),
        }
    }

    #[test]
    fn test_recursive_factorial_scores_full_marks() {
        let tests = vec![
            case("5", ExecutionStatus::Success, true),
            case("0", ExecutionStatus::Success, true),
            case("3", ExecutionStatus::Success, true),
        ];
        let report = aggregate(tests, vec![requirement("recursion", true, 1.0)], &GradingPolicy::default());
        assert_eq!(report.correctness_score, 100.0);
        assert_eq!(report.behavioral_score, 100.0);
        assert_eq!(report.overall_score, 100.0);
        assert!(report.passed);
        assert_eq!(report.feedback.len(), 1);
    }

    #[test]
    fn test_iterative_factorial_fails_the_threshold() {
        let tests = vec![
            case("5", ExecutionStatus::Success, true),
            case("0", ExecutionStatus::Success, true),
            case("3", ExecutionStatus::Success, true),
        ];
        let report = aggregate(tests, vec![requirement("recursion", false, 1.0)], &GradingPolicy::default());
        assert_eq!(report.correctness_score, 100.0);
        assert_eq!(report.behavioral_score, 0.0);
        assert!(!report.behavioral_score.is_sign_negative());
        assert_eq!(report.overall_score, 50.0);
        assert!(!report.passed);
        assert!(report.feedback.contains(&"recursion is not met".to_string()));
        assert!(report.summary().contains("Behavioral: 0%"));
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"behavioral_score\":0.0"));
        assert!(!json.contains(":-0.0"));
    }

    #[test]
    fn test_nothing_passed_reports_positive_zero() {
        let tests = vec![case("a", ExecutionStatus::RuntimeError, false)];
        let report = aggregate(tests, vec![requirement("r", false, 2.0)], &GradingPolicy::default());
        for score in [report.correctness_score, report.behavioral_score, report.overall_score] {
            assert_eq!(score, 0.0);
            assert!(!score.is_sign_negative());
        }
    }

    #[test]
    fn test_one_timeout_out_of_three() {
        let tests = vec![
            case("a", ExecutionStatus::Success, true),
            case("b", ExecutionStatus::Timeout, false),
            case("c", ExecutionStatus::Success, true),
        ];
        let report = aggregate(tests, vec![], &GradingPolicy::default());
        assert_eq!(report.correctness_score, 66.7);
        assert_eq!(report.behavioral_score, 100.0);
        // 0.5 * 66.666.. + 0.5 * 100, rounded once
        assert_eq!(report.overall_score, 83.3);
        assert_eq!(report.test_cases[1].verdict, Verdict::Timeout);
        assert!(report.feedback.iter().any(|f| f.contains("ran out of time")));
    }

    #[test]
    fn test_correctness_is_monotonic() {
        let mut tests = vec![
            case("a", ExecutionStatus::Success, true),
            case("b", ExecutionStatus::RuntimeError, false),
        ];
        let before = correctness_score(&tests);
        tests.push(case("c", ExecutionStatus::Success, true));
        assert!(correctness_score(&tests) >= before);
    }

    #[test]
    fn test_weighted_behavioral_score() {
        let evaluations = vec![requirement("a", true, 3.0), requirement("b", false, 1.0)];
        assert_eq!(behavioral_score(&evaluations), 75.0);
        let unweighted = vec![requirement("a", true, 0.0), requirement("b", false, 0.0)];
        assert_eq!(behavioral_score(&unweighted), 50.0);
    }

    #[test]
    fn test_overall_weights_are_normalized() {
        let policy = GradingPolicy {
            correctness_weight: 3.0,
            behavioral_weight: 1.0,
            ..GradingPolicy::default()
        };
        assert_eq!(overall_score(100.0, 0.0, &policy), 75.0);
        assert_eq!(overall_score(100.0, 0.0, &GradingPolicy::default()), 50.0);
    }

    #[test]
    fn test_pass_decision_uses_exact_overall() {
        // 2 of 3 passed with no behavioral credit is 33.333.., which rounds to
        // the threshold but does not reach it
        let policy = GradingPolicy {
            correctness_weight: 1.0,
            behavioral_weight: 1.0,
            passing_threshold: 33.3,
            ..GradingPolicy::default()
        };
        let tests = vec![
            case("a", ExecutionStatus::Success, true),
            case("b", ExecutionStatus::Success, true),
            case("c", ExecutionStatus::Success, false),
        ];
        let report = aggregate(tests, vec![requirement("r", false, 1.0)], &policy);
        assert_eq!(report.overall_score, 33.3);
        assert!(report.passed);

        let strict = GradingPolicy {
            passing_threshold: 33.4,
            ..policy
        };
        let tests = vec![
            case("a", ExecutionStatus::Success, true),
            case("b", ExecutionStatus::Success, true),
            case("c", ExecutionStatus::Success, false),
        ];
        let report = aggregate(tests, vec![requirement("r", false, 1.0)], &strict);
        assert_eq!(report.overall_score, 33.3);
        assert!(!report.passed);
    }

    #[test]
    fn test_compile_failure_feedback_and_summary() {
        let mut failed = case("only", ExecutionStatus::CompilationError, false);
        failed.diagnostic = Some("main.c:1:1: error: expected ';'\n1 error generated.".into());
        let mut report = aggregate(
            vec![failed],
            vec![requirement("loops", false, 1.0)],
            &GradingPolicy::default(),
        );
        report.lesson_id = Some("loops-1".into());
        report.language = "c".into();

        assert!(report.feedback[1].starts_with("Your code did not compile"));
        let summary = report.summary();
        assert!(summary.contains("Lesson: loops-1"));
        assert!(summary.contains("Status: FAILED"));
        assert!(summary.contains("loops: FAILED"));
        assert!(summary.contains("  - loops evidence"));
        assert!(summary.contains("only: compile_error"));
    }

    #[test]
    fn test_feedback_is_deterministic() {
        let build = || {
            aggregate(
                vec![case("a", ExecutionStatus::Success, true), case("b", ExecutionStatus::Success, false)],
                vec![requirement("r", false, 1.0)],
                &GradingPolicy::default(),
            )
        };
        assert_eq!(build().feedback, build().feedback);
        assert_eq!(build().summary(), build().summary());
    }
}
