use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of one sandboxed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    RuntimeError,
    CompilationError,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::CompilationError => "compilation_error",
            ExecutionStatus::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Verdict for one test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    RuntimeError,
    CompileError,
    Timeout,
}

impl Verdict {
    /// Verdict for a run that did not finish successfully
    pub fn from_failed_status(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::Success => None,
            ExecutionStatus::RuntimeError => Some(Verdict::RuntimeError),
            ExecutionStatus::CompilationError => Some(Verdict::CompileError),
            ExecutionStatus::Timeout => Some(Verdict::Timeout),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::RuntimeError => "runtime_error",
            Verdict::CompileError => "compile_error",
            Verdict::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_display() {
        assert_eq!(Verdict::Accepted.to_string(), "accepted");
        assert_eq!(Verdict::WrongAnswer.to_string(), "wrong_answer");
        assert_eq!(ExecutionStatus::CompilationError.to_string(), "compilation_error");
    }

    #[test]
    fn test_verdict_from_status() {
        assert_eq!(Verdict::from_failed_status(ExecutionStatus::Success), None);
        assert_eq!(
            Verdict::from_failed_status(ExecutionStatus::Timeout),
            Some(Verdict::Timeout)
        );
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::RuntimeError).unwrap();
        assert_eq!(json, "\"runtime_error\"");
    }
}
