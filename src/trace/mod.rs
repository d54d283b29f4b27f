//! Runtime trace document emitted by instrumented programs
//!
//! The document travels over the program's stdout between two sentinel lines.
//! Every field defaults to empty, so a partial document from an older or
//! degraded emitter still deserializes.

pub mod extract;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use extract::{extract, Extraction, ExtractionFailure};

pub const TRACE_BEGIN: &str = "<<<GRADER:TRACE:BEGIN>>>";
pub const TRACE_END: &str = "<<<GRADER:TRACE:END>>>";

/// One recorded DOM access
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomOperation {
    pub operation: String,
    #[serde(default)]
    pub target: String,
}

/// One recorded event-listener registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRegistration {
    pub event: String,
    #[serde(default)]
    pub target: String,
}

/// What one instrumented run actually did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// Function name -> number of calls
    #[serde(default)]
    pub function_calls: BTreeMap<String, u64>,
    /// Function name -> deepest self-recursion seen (1 = never re-entered)
    #[serde(default)]
    pub recursion_depth: BTreeMap<String, u64>,
    /// Loop kind -> number of loop executions
    #[serde(default)]
    pub loop_iterations: BTreeMap<String, u64>,
    /// Class or type name -> number of instances created
    #[serde(default)]
    pub class_instantiations: BTreeMap<String, u64>,
    #[serde(default)]
    pub dom_operations: Vec<DomOperation>,
    #[serde(default)]
    pub event_handlers: Vec<EventRegistration>,
    /// Runtime and instrumentation errors, in order of occurrence
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ExecutionTrace {
    /// The canonical empty trace
    pub fn empty() -> Self {
        Self::default()
    }

    /// No behavioral signal at all (errors do not count as evidence)
    pub fn is_empty(&self) -> bool {
        self.function_calls.is_empty()
            && self.recursion_depth.is_empty()
            && self.loop_iterations.is_empty()
            && self.class_instantiations.is_empty()
            && self.dom_operations.is_empty()
            && self.event_handlers.is_empty()
    }

    pub fn calls(&self, function: &str) -> u64 {
        self.function_calls.get(function).copied().unwrap_or(0)
    }

    pub fn depth(&self, function: &str) -> u64 {
        self.recursion_depth.get(function).copied().unwrap_or(0)
    }

    /// Render as a complete sentinel-delimited block, as an emitter would write it
    pub fn to_wire(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("\n{}\n{}\n{}\n", TRACE_BEGIN, body, TRACE_END)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_deserializes() {
        let trace: ExecutionTrace =
            serde_json::from_str(r#"{"function_calls": {"f": 3}}"#).unwrap();
        assert_eq!(trace.calls("f"), 3);
        assert_eq!(trace.calls("g"), 0);
        assert!(trace.errors.is_empty());
        assert!(!trace.is_empty());
    }

    #[test]
    fn test_wire_keys() {
        let json = serde_json::to_value(ExecutionTrace::empty()).unwrap();
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        for key in [
            "function_calls",
            "recursion_depth",
            "loop_iterations",
            "class_instantiations",
            "dom_operations",
            "event_handlers",
            "errors",
        ] {
            assert!(keys.contains(&key.to_string()), "missing {}", key);
        }
    }

    #[test]
    fn test_errors_are_not_evidence() {
        let trace = ExecutionTrace {
            errors: vec!["boom".into()],
            ..Default::default()
        };
        assert!(trace.is_empty());
    }
}
