//! Requirement evaluator
//!
//! Applies behavioral requirements to the traces of every test case of one
//! submission. Evaluation is total: an empty or degraded trace only means
//! "no evidence", never an error. Every result carries evidence lines, for
//! satisfied and unsatisfied requirements alike.

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::lesson::{BehavioralRequirement, Rule};
use crate::trace::ExecutionTrace;

/// Outcome of one requirement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub requirement_id: String,
    pub kind: String,
    /// The requirement is met (for `forbidden_pattern`: no pattern occurs)
    pub satisfied: bool,
    pub weight: f64,
    pub evidence: Vec<String>,
    /// Rendered unmet-requirement message, only when not satisfied
    pub message: Option<String>,
}

/// Evaluate `requirements` against the traces of all test cases and the
/// submission's source text
pub fn evaluate(
    traces: &[ExecutionTrace],
    requirements: &[BehavioralRequirement],
    source: &str,
) -> Vec<EvaluationResult> {
    requirements
        .iter()
        .map(|requirement| evaluate_one(traces, requirement, source))
        .collect()
}

/// Values a message template can refer to
struct Outcome {
    satisfied: bool,
    evidence: Vec<String>,
    function: String,
    required: String,
    observed: String,
}

fn evaluate_one(
    traces: &[ExecutionTrace],
    requirement: &BehavioralRequirement,
    source: &str,
) -> EvaluationResult {
    let outcome = match &requirement.rule {
        Rule::Recursion { function, min_depth } => recursion(traces, function.as_deref(), *min_depth),
        Rule::LoopUsage {
            loop_kinds,
            min_iterations,
        } => loop_usage(traces, loop_kinds, *min_iterations),
        Rule::FunctionCallCount { functions } => function_calls(traces, functions),
        Rule::ForbiddenPattern { patterns, regex } => forbidden(source, patterns, *regex),
        Rule::DomManipulation { operations } => dom_operations(traces, operations),
        Rule::EventHandling { events } => event_handlers(traces, events),
    };

    let mut evidence = outcome.evidence.clone();
    let textual = matches!(requirement.rule, Rule::ForbiddenPattern { .. });
    if !outcome.satisfied && !textual && traces.iter().all(ExecutionTrace::is_empty) {
        evidence.push("no runtime trace was recorded for any test case".to_string());
    }

    let message = if outcome.satisfied {
        None
    } else {
        let template = requirement
            .message
            .clone()
            .unwrap_or_else(|| default_message(&requirement.rule).to_string());
        Some(render_message(&template, &outcome))
    };

    EvaluationResult {
        requirement_id: requirement
            .id
            .clone()
            .unwrap_or_else(|| requirement.rule.kind().to_string()),
        kind: requirement.rule.kind().to_string(),
        satisfied: outcome.satisfied,
        weight: requirement.weight,
        evidence,
        message,
    }
}

fn default_message(rule: &Rule) -> &'static str {
    match rule {
        Rule::Recursion { .. } => {
            "{function} must call itself recursively (required depth {required}, observed {observed})."
        }
        Rule::LoopUsage { .. } => "Use a {function} loop (required {required} executions, observed {observed}).",
        Rule::FunctionCallCount { .. } => "Call the required functions often enough: {observed}.",
        Rule::ForbiddenPattern { .. } => "Your code uses something this exercise forbids: {observed}.",
        Rule::DomManipulation { .. } => "Your script must use these DOM operations: {required} (missing {observed}).",
        Rule::EventHandling { .. } => "Register handlers for these events: {required} (missing {observed}).",
    }
}

fn render_message(template: &str, outcome: &Outcome) -> String {
    template
        .replace("{function}", &outcome.function)
        .replace("{required}", &outcome.required)
        .replace("{observed}", &outcome.observed)
}

fn recursion(traces: &[ExecutionTrace], function: Option<&str>, min_depth: u64) -> Outcome {
    // deepest observed depth per function, with the test case it came from
    let mut deepest: BTreeMap<&str, (u64, usize)> = BTreeMap::new();
    for (index, trace) in traces.iter().enumerate() {
        for (name, depth) in &trace.recursion_depth {
            if function.is_some_and(|f| f != name.as_str()) {
                continue;
            }
            let entry = deepest.entry(name.as_str()).or_insert((0, index));
            if *depth > entry.0 {
                *entry = (*depth, index);
            }
        }
    }

    let best = deepest
        .iter()
        .max_by_key(|(_, (depth, _))| *depth)
        .map(|(name, (depth, index))| (*name, *depth, *index));
    let satisfied = best.is_some_and(|(_, depth, _)| depth >= min_depth);

    let mut evidence = Vec::new();
    for (name, (depth, index)) in &deepest {
        evidence.push(format!(
            "{} reached recursion depth {} (test case {})",
            name,
            depth,
            index + 1
        ));
    }
    if let Some(name) = function {
        if deepest.is_empty() {
            let calls: u64 = traces.iter().map(|t| t.calls(name)).max().unwrap_or(0);
            evidence.push(if calls == 0 {
                format!("{} was never called", name)
            } else {
                format!("{} was called {} times but never re-entered itself", name, calls)
            });
        }
    } else if deepest.is_empty() {
        evidence.push("no function calls were recorded".to_string());
    }

    Outcome {
        satisfied,
        evidence,
        function: function
            .map(str::to_string)
            .or_else(|| best.map(|(name, _, _)| name.to_string()))
            .unwrap_or_else(|| "a function".to_string()),
        required: min_depth.to_string(),
        observed: best.map(|(_, depth, _)| depth).unwrap_or(0).to_string(),
    }
}

/// `for_loop`, `While`, `do-while` all name the kinds the runtimes emit
fn loop_kind(name: &str) -> String {
    let name = name.trim().to_lowercase().replace('-', "_");
    let name = name.strip_suffix("_loop").unwrap_or(&name).to_string();
    match name.as_str() {
        "dowhile" => "do_while".to_string(),
        _ => name,
    }
}

fn loop_usage(traces: &[ExecutionTrace], loop_kinds: &[String], min_iterations: u64) -> Outcome {
    let wanted: BTreeSet<String> = loop_kinds.iter().map(|k| loop_kind(k)).collect();

    let mut observed: BTreeMap<String, u64> = BTreeMap::new();
    let mut satisfied = false;
    for trace in traces {
        for (kind, count) in &trace.loop_iterations {
            let kind = loop_kind(kind);
            if !wanted.is_empty() && !wanted.contains(&kind) {
                continue;
            }
            if *count >= min_iterations {
                satisfied = true;
            }
            let best = observed.entry(kind).or_insert(0);
            *best = (*best).max(*count);
        }
    }

    let mut evidence: Vec<String> = observed
        .iter()
        .map(|(kind, count)| format!("{} loop executed {} times in one test case", kind, count))
        .collect();
    if observed.is_empty() {
        evidence.push(if wanted.is_empty() {
            "no loop executions were recorded".to_string()
        } else {
            format!("no {} loop executions were recorded", join(&wanted))
        });
    }

    Outcome {
        satisfied,
        evidence,
        function: if wanted.is_empty() {
            "any".to_string()
        } else {
            join(&wanted)
        },
        required: min_iterations.to_string(),
        observed: observed.values().max().copied().unwrap_or(0).to_string(),
    }
}

fn function_calls(traces: &[ExecutionTrace], functions: &BTreeMap<String, u64>) -> Outcome {
    let mut evidence = Vec::new();
    let mut short = Vec::new();
    for (name, required) in functions {
        let most = traces.iter().map(|t| t.calls(name)).max().unwrap_or(0);
        evidence.push(format!("{} called {} times (required {})", name, most, required));
        if most < *required {
            short.push(format!("{} {}/{}", name, most, required));
        }
    }

    Outcome {
        satisfied: short.is_empty(),
        evidence,
        function: functions.keys().cloned().collect::<Vec<_>>().join(", "),
        required: functions
            .iter()
            .map(|(name, n)| format!("{} >= {}", name, n))
            .collect::<Vec<_>>()
            .join(", "),
        observed: short.join(", "),
    }
}

fn forbidden(source: &str, patterns: &[String], regex: bool) -> Outcome {
    let mut found = Vec::new();
    let mut evidence = Vec::new();
    for pattern in patterns {
        let line = if regex {
            match Regex::new(pattern) {
                Ok(re) => re.find(source).map(|m| line_of(source, m.start())),
                Err(e) => {
                    evidence.push(format!("pattern `{}` could not be compiled: {}", pattern, e));
                    None
                }
            }
        } else {
            source.find(pattern.as_str()).map(|at| line_of(source, at))
        };
        if let Some(line) = line {
            evidence.push(format!("forbidden pattern `{}` found on line {}", pattern, line));
            found.push(pattern.clone());
        }
    }
    if found.is_empty() {
        evidence.push(format!(
            "none of the {} forbidden pattern(s) appear in the source",
            patterns.len()
        ));
    }

    Outcome {
        satisfied: found.is_empty(),
        evidence,
        function: String::new(),
        required: patterns.join(", "),
        observed: found.join(", "),
    }
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

/// A recorded operation matches `style` for `style.color`, and ignores case
fn dom_matches(recorded: &str, required: &str) -> bool {
    let recorded = recorded.to_lowercase();
    let required = required.trim().to_lowercase();
    recorded == required || recorded.starts_with(&format!("{}.", required))
}

fn event_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    match name.strip_prefix("on") {
        // `onclick` names the `click` event; `online` and friends stay as they are
        Some(rest) if KNOWN_EVENTS.contains(&rest) => rest.to_string(),
        _ => name,
    }
}

const KNOWN_EVENTS: &[&str] = &[
    "click", "dblclick", "input", "change", "submit", "keydown", "keyup", "keypress", "load",
    "mouseover", "mouseout", "mousedown", "mouseup", "mousemove", "focus", "blur", "scroll",
    "resize", "domcontentloaded",
];

fn dom_operations(traces: &[ExecutionTrace], operations: &[String]) -> Outcome {
    let mut evidence = Vec::new();
    let mut missing = Vec::new();
    for required in operations {
        let hits: Vec<&str> = traces
            .iter()
            .flat_map(|t| t.dom_operations.iter())
            .filter(|op| dom_matches(&op.operation, required))
            .map(|op| op.target.as_str())
            .collect();
        if hits.is_empty() {
            evidence.push(format!("{} was never used", required));
            missing.push(required.clone());
        } else {
            let targets: BTreeSet<&str> = hits.iter().copied().filter(|t| !t.is_empty()).collect();
            evidence.push(if targets.is_empty() {
                format!("{} used {} times", required, hits.len())
            } else {
                format!("{} used {} times on {}", required, hits.len(), join(&targets))
            });
        }
    }

    Outcome {
        satisfied: missing.is_empty(),
        evidence,
        function: String::new(),
        required: operations.join(", "),
        observed: missing.join(", "),
    }
}

fn event_handlers(traces: &[ExecutionTrace], events: &[String]) -> Outcome {
    let mut evidence = Vec::new();
    let mut missing = Vec::new();
    for required in events {
        let wanted = event_name(required);
        let targets: BTreeSet<&str> = traces
            .iter()
            .flat_map(|t| t.event_handlers.iter())
            .filter(|reg| event_name(&reg.event) == wanted)
            .map(|reg| reg.target.as_str())
            .collect();
        if targets.is_empty() {
            evidence.push(format!("no {} handler was registered", wanted));
            missing.push(required.clone());
        } else {
            evidence.push(format!("{} handler registered on {}", wanted, join(&targets)));
        }
    }

    Outcome {
        satisfied: missing.is_empty(),
        evidence,
        function: String::new(),
        required: events.join(", "),
        observed: missing.join(", "),
    }
}

fn join<S: AsRef<str>>(items: impl IntoIterator<Item = S>) -> String {
    items
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
