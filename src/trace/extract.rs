//! Trace extraction from captured stdout
//!
//! Emitters write `"\n" BEGIN "\n" json "\n" END "\n"`. The region together
//! with the newline before the begin line is cut out, leaving the bytes the
//! program itself printed. Extraction never fails: a missing or broken region
//! yields the empty trace and an informational `ExtractionFailure`.

use std::ops::Range;
use thiserror::Error;

use super::{ExecutionTrace, TRACE_BEGIN, TRACE_END};

/// Why a run produced no usable trace
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionFailure {
    #[error("no trace begin marker in output")]
    MissingBegin,
    #[error("trace begin marker without matching end marker")]
    MissingEnd,
    #[error("trace document is malformed: {0}")]
    Malformed(String),
}

/// Result of splitting stdout into trace and user-visible output
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub trace: ExecutionTrace,
    /// Stdout with every trace region removed
    pub user_output: String,
    pub failure: Option<ExtractionFailure>,
}

struct Line<'a> {
    start: usize,
    /// Offset just past the line terminator
    next: usize,
    text: &'a str,
}

fn lines(text: &str) -> impl Iterator<Item = Line<'_>> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |raw| {
        let line = Line {
            start: offset,
            next: offset + raw.len(),
            text: raw.trim_end_matches(['\n', '\r']),
        };
        offset += raw.len();
        line
    })
}

fn is_marker(line: &str, marker: &str) -> bool {
    line.trim() == marker
}

struct Region {
    /// Bytes to cut, including the newline emitted before the begin line
    cut: Range<usize>,
    body: Range<usize>,
}

/// Split captured stdout into the trace document and the user-visible output
pub fn extract(stdout: &str) -> Extraction {
    let mut regions: Vec<Region> = Vec::new();
    let mut open: Option<(usize, usize)> = None; // (cut start, body start)
    let mut saw_begin = false;

    for line in lines(stdout) {
        if is_marker(line.text, TRACE_BEGIN) {
            saw_begin = true;
            let cut_start = if line.start > 0 && stdout.as_bytes()[line.start - 1] == b'\n' {
                line.start - 1
            } else {
                line.start
            };
            // A second begin inside an open region restarts the body but keeps the cut
            let cut_start = open.map(|(start, _)| start).unwrap_or(cut_start);
            open = Some((cut_start, line.next));
        } else if is_marker(line.text, TRACE_END) {
            if let Some((cut_start, body_start)) = open.take() {
                regions.push(Region {
                    cut: cut_start..line.next,
                    body: body_start..line.start,
                });
            }
        }
    }

    let mut cuts: Vec<Range<usize>> = regions.iter().map(|r| r.cut.clone()).collect();
    if let Some((cut_start, _)) = open {
        // Emission was interrupted; everything after the begin line is trace debris
        cuts.push(cut_start..stdout.len());
    }

    let mut user_output = String::with_capacity(stdout.len());
    let mut kept_from = 0;
    for cut in &cuts {
        user_output.push_str(&stdout[kept_from..cut.start]);
        kept_from = cut.end;
    }
    user_output.push_str(&stdout[kept_from..]);

    let (trace, failure) = match regions.last() {
        Some(region) => match parse_body(&stdout[region.body.clone()]) {
            Ok(trace) => (trace, None),
            Err(e) => (ExecutionTrace::empty(), Some(ExtractionFailure::Malformed(e))),
        },
        None if saw_begin => (ExecutionTrace::empty(), Some(ExtractionFailure::MissingEnd)),
        None => (ExecutionTrace::empty(), Some(ExtractionFailure::MissingBegin)),
    };

    Extraction {
        trace,
        user_output,
        failure,
    }
}

/// Parse the whole body, then fall back to the last line that parses on its
/// own (stray output from other threads can land between the markers)
fn parse_body(body: &str) -> Result<ExecutionTrace, String> {
    let first_error = match serde_json::from_str::<ExecutionTrace>(body.trim()) {
        Ok(trace) => return Ok(trace),
        Err(e) => e.to_string(),
    };

    body.lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<ExecutionTrace>(line).ok())
        .ok_or(first_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExecutionTrace {
        let mut trace = ExecutionTrace::empty();
        trace.function_calls.insert("factorial".into(), 6);
        trace.recursion_depth.insert("factorial".into(), 6);
        trace
    }

    #[test]
    fn test_user_output_is_restored_exactly() {
        for printed in ["120\n", "120", "", "a\n\nb\n\n"] {
            let stdout = format!("{}{}", printed, sample().to_wire());
            let extraction = extract(&stdout);
            assert_eq!(extraction.user_output, printed);
            assert_eq!(extraction.trace, sample());
            assert!(extraction.failure.is_none());
        }
    }

    #[test]
    fn test_missing_begin() {
        let extraction = extract("just output\n");
        assert_eq!(extraction.user_output, "just output\n");
        assert_eq!(extraction.trace, ExecutionTrace::empty());
        assert_eq!(extraction.failure, Some(ExtractionFailure::MissingBegin));
    }

    #[test]
    fn test_missing_end_removes_tail() {
        let stdout = format!("out\n\n{}\n{{\"function_calls\":", TRACE_BEGIN);
        let extraction = extract(&stdout);
        assert_eq!(extraction.user_output, "out\n");
        assert_eq!(extraction.failure, Some(ExtractionFailure::MissingEnd));
        assert!(extraction.trace.is_empty());
    }

    #[test]
    fn test_malformed_body() {
        let stdout = format!("x\n\n{}\nnot json\n{}\n", TRACE_BEGIN, TRACE_END);
        let extraction = extract(&stdout);
        assert_eq!(extraction.user_output, "x\n");
        assert!(matches!(extraction.failure, Some(ExtractionFailure::Malformed(_))));
        assert!(extraction.trace.is_empty());
    }

    #[test]
    fn test_noise_inside_region() {
        let body = serde_json::to_string(&sample()).unwrap();
        let stdout = format!(
            "ok\n\n{}\nthread noise\n{}\n{}\n",
            TRACE_BEGIN, body, TRACE_END
        );
        let extraction = extract(&stdout);
        assert_eq!(extraction.user_output, "ok\n");
        assert_eq!(extraction.trace, sample());
        assert!(extraction.failure.is_none());
    }

    #[test]
    fn test_last_complete_region_wins() {
        let mut first = ExecutionTrace::empty();
        first.function_calls.insert("early".into(), 1);
        let stdout = format!("a\n{}b\n{}", first.to_wire(), sample().to_wire());
        let extraction = extract(&stdout);
        assert_eq!(extraction.user_output, "a\nb\n");
        assert_eq!(extraction.trace, sample());
    }

    #[test]
    fn test_end_without_begin_is_user_output() {
        let stdout = format!("{}\nhello\n", TRACE_END);
        let extraction = extract(&stdout);
        assert_eq!(extraction.user_output, stdout);
        assert_eq!(extraction.failure, Some(ExtractionFailure::MissingBegin));
    }

    #[test]
    fn test_crlf_markers() {
        let body = serde_json::to_string(&sample()).unwrap();
        let stdout = format!("5\r\n\r\n{}\r\n{}\r\n{}\r\n", TRACE_BEGIN, body, TRACE_END);
        let extraction = extract(&stdout);
        assert_eq!(extraction.trace, sample());
        assert!(extraction.user_output.starts_with("5\r\n"));
    }
}
