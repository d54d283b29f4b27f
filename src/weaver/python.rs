//! Python weaving
//!
//! The submission is not rewritten here. It travels as data inside a prelude
//! script that parses it, inserts loop probes into its AST, runs it under
//! `sys.setprofile` and emits the trace from a `finally` block. A submission
//! that does not parse still produces a trace, with the syntax error recorded.

use serde::Serialize;

use super::{render, sentinel_values, InstrumentationConfig, SourceUnit, Weaver, WovenUnit};

const PRELUDE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/files/instrument/python_prelude.py"
));

#[derive(Serialize)]
struct Payload<'a> {
    source: &'a str,
    config: &'a InstrumentationConfig,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonWeaver;

impl Weaver for PythonWeaver {
    fn weave(&self, unit: &SourceUnit, config: &InstrumentationConfig) -> WovenUnit {
        let source = unit.program();
        let payload = Payload { source, config };

        // JSON text wrapped in a JSON string literal is also a valid Python literal
        let literal = serde_json::to_string(&payload)
            .and_then(|json| serde_json::to_string(&json));
        let literal = match literal {
            Ok(literal) => literal,
            Err(e) => {
                let mut woven = WovenUnit::new(source.to_string());
                woven
                    .warnings
                    .push(format!("instrumentation skipped, payload encoding failed: {}", e));
                return woven;
            }
        };

        let [begin, end] = sentinel_values();
        WovenUnit::new(render(PRELUDE, &[("PAYLOAD", literal.as_str()), begin, end]))
    }
}
