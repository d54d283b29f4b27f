//! Instrumentation weaver
//!
//! Produces, from a submission's source, a runnable unit that performs the
//! learner's logic and then writes an `ExecutionTrace` to stdout between the
//! trace sentinels. Weaving is total: when a hook cannot be placed the unit
//! degrades (fewer signals, a warning) instead of failing.
//!
//! Interpreted languages carry their tracing runtime as a prelude that loads
//! the learner's code at run time. Compiled languages get hooks inserted into
//! the source text at token positions found by `scan`, plus an appended
//! runtime; they also get an emitter-only fallback for when the hooked source
//! does not compile.

pub mod javascript;
pub mod native;
pub mod plain;
pub mod python;
pub mod rust;
pub mod scan;

use serde::{Deserialize, Serialize};

use crate::languages::Dialect;
use crate::trace::{TRACE_BEGIN, TRACE_END};

/// Which signals the instrumented unit records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    #[serde(alias = "track_function_calls")]
    pub monitor_function_calls: bool,
    #[serde(alias = "track_recursion")]
    pub monitor_recursion: bool,
    #[serde(alias = "monitor_loop_iterations", alias = "track_loops")]
    pub monitor_loops: bool,
    #[serde(alias = "monitor_object_instantiation", alias = "track_class_instantiations")]
    pub monitor_class_instantiations: bool,
    #[serde(alias = "track_dom_operations")]
    pub monitor_dom_operations: bool,
    #[serde(alias = "monitor_event_handler_registration", alias = "track_event_handlers")]
    pub monitor_event_handlers: bool,
    /// Source substrings that are not allowed in the submission
    pub forbidden_patterns: Vec<String>,
}

impl InstrumentationConfig {
    /// Every signal on
    pub fn all() -> Self {
        Self {
            monitor_function_calls: true,
            monitor_recursion: true,
            monitor_loops: true,
            monitor_class_instantiations: true,
            monitor_dom_operations: true,
            monitor_event_handlers: true,
            forbidden_patterns: Vec::new(),
        }
    }

    /// Call hooks are needed for call counts, recursion depth and constructors
    pub fn needs_call_hooks(&self) -> bool {
        self.monitor_function_calls || self.monitor_recursion || self.monitor_class_instantiations
    }

    pub fn records_anything(&self) -> bool {
        self.needs_call_hooks()
            || self.monitor_loops
            || self.monitor_dom_operations
            || self.monitor_event_handlers
    }
}

/// Submission source in the shape its language expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceUnit {
    Code(String),
    Web {
        html: String,
        css: String,
        javascript: String,
    },
}

impl SourceUnit {
    /// All text the learner wrote, for source-level checks
    pub fn full_text(&self) -> String {
        match self {
            SourceUnit::Code(code) => code.clone(),
            SourceUnit::Web {
                html,
                css,
                javascript,
            } => format!("{}\n{}\n{}", html, css, javascript),
        }
    }

    /// The program text proper (the script part of a web submission)
    pub fn program(&self) -> &str {
        match self {
            SourceUnit::Code(code) => code,
            SourceUnit::Web { javascript, .. } => javascript,
        }
    }
}

/// Output of weaving
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WovenUnit {
    /// Content of the language's source file
    pub source: String,
    /// Emitter-only variant to compile when `source` does not compile
    pub fallback: Option<String>,
    /// Degradations noticed while weaving; they end up in the trace's error list
    pub warnings: Vec<String>,
}

impl WovenUnit {
    pub fn new(source: String) -> Self {
        Self {
            source,
            fallback: None,
            warnings: Vec::new(),
        }
    }
}

/// Instrumentation front-end for one dialect
pub trait Weaver: Send + Sync {
    fn weave(&self, unit: &SourceUnit, config: &InstrumentationConfig) -> WovenUnit;
}

static PYTHON: python::PythonWeaver = python::PythonWeaver;
static JAVASCRIPT: javascript::JavaScriptWeaver = javascript::JavaScriptWeaver { web: false };
static WEB: javascript::JavaScriptWeaver = javascript::JavaScriptWeaver { web: true };
static C: native::NativeWeaver = native::NativeWeaver { cpp: false };
static CPP: native::NativeWeaver = native::NativeWeaver { cpp: true };
static RUST: rust::RustWeaver = rust::RustWeaver;
static PLAIN: plain::PlainWeaver = plain::PlainWeaver;

pub fn for_dialect(dialect: Dialect) -> &'static dyn Weaver {
    match dialect {
        Dialect::Python => &PYTHON,
        Dialect::Javascript => &JAVASCRIPT,
        Dialect::Web => &WEB,
        Dialect::C => &C,
        Dialect::Cpp => &CPP,
        Dialect::Rust => &RUST,
        Dialect::Plain => &PLAIN,
    }
}

/// Weave `unit` for `dialect`
pub fn weave(unit: &SourceUnit, dialect: Dialect, config: &InstrumentationConfig) -> WovenUnit {
    for_dialect(dialect).weave(unit, config)
}

/// Substitute `@@KEY@@` placeholders of a runtime template
pub(crate) fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("@@{}@@", key), value);
    }
    out
}

/// Values shared by every runtime template
pub(crate) fn sentinel_values() -> [(&'static str, &'static str); 2] {
    [("TRACE_BEGIN", TRACE_BEGIN), ("TRACE_END", TRACE_END)]
}

/// Double-quoted literal valid in C, C++, Rust, JavaScript and Python
pub(crate) fn quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_ascii_graphic() || c == ' ' => out.push(c),
            // keep it ASCII; identifiers are all this ever sees in practice
            _ => out.push('?'),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholders() {
        let out = render("a @@X@@ b @@Y@@ @@X@@", &[("X", "1"), ("Y", "2")]);
        assert_eq!(out, "a 1 b 2 1");
    }

    #[test]
    fn test_quoted() {
        assert_eq!(quoted("fact"), "\"fact\"");
        assert_eq!(quoted("a\"b\\"), "\"a\\\"b\\\\\"");
        assert_eq!(quoted("é"), "\"?\"");
    }

    #[test]
    fn test_config_aliases() {
        let config: InstrumentationConfig = serde_json::from_str(
            r#"{"track_recursion": true, "monitor_loop_iterations": true, "forbidden_patterns": ["sum("]}"#,
        )
        .unwrap();
        assert!(config.monitor_recursion);
        assert!(config.monitor_loops);
        assert!(!config.monitor_function_calls);
        assert!(config.needs_call_hooks());
        assert_eq!(config.forbidden_patterns, vec!["sum("]);
    }

    #[test]
    fn test_web_full_text_covers_all_parts() {
        let unit = SourceUnit::Web {
            html: "<p id=x></p>".into(),
            css: "p { color: red }".into(),
            javascript: "document.write(1)".into(),
        };
        let text = unit.full_text();
        assert!(text.contains("<p id=x>"));
        assert!(text.contains("color: red"));
        assert!(text.contains("document.write"));
        assert_eq!(unit.program(), "document.write(1)");
    }
}
