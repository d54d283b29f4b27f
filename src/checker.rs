//! Output comparison for test cases
//!
//! Decides whether the user-visible output of a run matches the test case's
//! expectation. Only successful runs are compared; the engine marks every
//! other status as failed before getting here.

use regex::Regex;

use crate::lesson::{ComparisonMode, ExpectedOutput, OutputPredicate};

/// Relative tolerance for numeric equality
const NUMERIC_EPSILON: f64 = 1e-9;

/// Check `actual` against `expected` under `mode`
pub fn check(actual: &str, expected: &ExpectedOutput, mode: ComparisonMode) -> bool {
    match expected {
        ExpectedOutput::Text(text) => compare_text(actual, text, mode),
        ExpectedOutput::Number(value) => parse_number(actual).is_some_and(|n| numbers_equal(n, *value)),
        ExpectedOutput::Predicate(predicate) => match predicate {
            OutputPredicate::Contains(needle) => actual.contains(needle.as_str()),
            OutputPredicate::Matches(pattern) => match Regex::new(pattern) {
                Ok(re) => re.is_match(actual),
                Err(_) => false,
            },
            OutputPredicate::Numeric { value, tolerance } => parse_number(actual)
                .is_some_and(|n| (n - value).abs() <= tolerance.max(NUMERIC_EPSILON)),
            OutputPredicate::OneOf(options) => {
                options.iter().any(|option| compare_text(actual, option, mode))
            }
        },
    }
}

fn compare_text(actual: &str, expected: &str, mode: ComparisonMode) -> bool {
    match mode {
        ComparisonMode::Strict => actual == expected,
        ComparisonMode::Normalized => {
            if compare_output(actual, expected) {
                return true;
            }
            match (parse_number(actual), parse_number(expected)) {
                (Some(a), Some(b)) => numbers_equal(a, b),
                _ => false,
            }
        }
    }
}

/// Line-wise comparison ignoring trailing whitespace and trailing blank lines
pub fn compare_output(actual: &str, expected: &str) -> bool {
    // Normalize outputs: trim trailing whitespace from each line and trailing newlines
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s.lines().map(|line| line.trim_end().to_string()).collect();
        while lines.last().map(|s| s.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        lines
    };

    normalize(actual) == normalize(expected)
}

/// The whole output read as one number
fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn numbers_equal(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= NUMERIC_EPSILON * scale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> ExpectedOutput {
        ExpectedOutput::Text(s.to_string())
    }

    #[test]
    fn test_compare_output_exact_match() {
        assert!(compare_output("hello\nworld\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_trailing_whitespace() {
        assert!(compare_output("hello  \nworld\n", "hello\nworld\n"));
        assert!(compare_output("hello\nworld\n\n\n", "hello\nworld"));
    }

    #[test]
    fn test_compare_output_different() {
        assert!(!compare_output("hello\nworld\n", "hello\nearth\n"));
        assert!(!compare_output("  hello", "hello"));
    }

    #[test]
    fn test_numeric_equality() {
        let normalized = ComparisonMode::Normalized;
        assert!(check("120\n", &text("120"), normalized));
        assert!(check("120.0\n", &text("120"), normalized));
        assert!(check("1e2", &ExpectedOutput::Number(100.0), normalized));
        assert!(!check("121", &ExpectedOutput::Number(120.0), normalized));
        assert!(!check("one hundred", &ExpectedOutput::Number(100.0), normalized));
    }

    #[test]
    fn test_strict_mode() {
        assert!(check("120", &text("120"), ComparisonMode::Strict));
        assert!(!check("120\n", &text("120"), ComparisonMode::Strict));
        assert!(!check("120.0", &text("120"), ComparisonMode::Strict));
    }

    #[test]
    fn test_predicates() {
        let mode = ComparisonMode::Normalized;
        let contains = ExpectedOutput::Predicate(OutputPredicate::Contains("world".into()));
        assert!(check("hello world\n", &contains, mode));
        assert!(!check("hello\n", &contains, mode));

        let matches = ExpectedOutput::Predicate(OutputPredicate::Matches(r"^\d+ items?\n?$".into()));
        assert!(check("3 items\n", &matches, mode));
        assert!(!check("three items", &matches, mode));

        let numeric = ExpectedOutput::Predicate(OutputPredicate::Numeric {
            value: 3.14159,
            tolerance: 0.01,
        });
        assert!(check("3.14\n", &numeric, mode));
        assert!(!check("3.2", &numeric, mode));

        let one_of = ExpectedOutput::Predicate(OutputPredicate::OneOf(vec!["yes".into(), "y".into()]));
        assert!(check("y\n", &one_of, mode));
        assert!(!check("no", &one_of, mode));
    }
}
