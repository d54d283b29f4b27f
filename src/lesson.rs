//! Lesson definition and submission documents
//!
//! Both documents are consumed read-only. `Lesson::validate` rejects every
//! problem that can be detected up front, so nothing downstream of it needs
//! to handle a malformed lesson.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::languages::Dialect;
use crate::weaver::{InstrumentationConfig, SourceUnit};

/// Longest run a lesson may ask for
pub const MAX_TIMEOUT_SECONDS: f64 = 24.0 * 60.0 * 60.0;

/// Where the learner's program runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    #[default]
    Code,
    /// Client-side script against a recording DOM
    Browser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    pub language: String,
    pub timeout_seconds: f64,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
}

impl ExecutionEnvironment {
    /// Saturates instead of panicking on values `validate` would reject
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds).unwrap_or(if self.timeout_seconds > 0.0 {
            Duration::MAX
        } else {
            Duration::ZERO
        })
    }
}

/// Predicate forms of an expected output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPredicate {
    Contains(String),
    Matches(String),
    Numeric {
        value: f64,
        #[serde(default)]
        tolerance: f64,
    },
    OneOf(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpectedOutput {
    Text(String),
    Number(f64),
    Predicate(OutputPredicate),
}

impl ExpectedOutput {
    /// Short rendering for reports
    pub fn describe(&self) -> String {
        match self {
            ExpectedOutput::Text(text) => text.clone(),
            ExpectedOutput::Number(n) => n.to_string(),
            ExpectedOutput::Predicate(OutputPredicate::Contains(s)) => format!("output containing {:?}", s),
            ExpectedOutput::Predicate(OutputPredicate::Matches(re)) => format!("output matching /{}/", re),
            ExpectedOutput::Predicate(OutputPredicate::Numeric { value, tolerance }) => {
                format!("{} ± {}", value, tolerance)
            }
            ExpectedOutput::Predicate(OutputPredicate::OneOf(options)) => {
                format!("one of {:?}", options)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Option<String>,
    pub expected_output: ExpectedOutput,
    #[serde(default)]
    pub requires_input: bool,
}

/// Kind-specific criteria of a behavioral requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    Recursion {
        #[serde(default)]
        function: Option<String>,
        #[serde(default = "default_min_depth", alias = "min_calls")]
        min_depth: u64,
    },
    LoopUsage {
        #[serde(default)]
        loop_kinds: Vec<String>,
        #[serde(default = "default_min_iterations")]
        min_iterations: u64,
    },
    FunctionCallCount {
        functions: BTreeMap<String, u64>,
    },
    ForbiddenPattern {
        patterns: Vec<String>,
        #[serde(default)]
        regex: bool,
    },
    DomManipulation {
        operations: Vec<String>,
    },
    EventHandling {
        events: Vec<String>,
    },
}

fn default_min_depth() -> u64 {
    2
}

fn default_min_iterations() -> u64 {
    1
}

fn default_weight() -> f64 {
    1.0
}

impl Rule {
    pub fn kind(&self) -> &'static str {
        match self {
            Rule::Recursion { .. } => "recursion",
            Rule::LoopUsage { .. } => "loop_usage",
            Rule::FunctionCallCount { .. } => "function_call_count",
            Rule::ForbiddenPattern { .. } => "forbidden_pattern",
            Rule::DomManipulation { .. } => "dom_manipulation",
            Rule::EventHandling { .. } => "event_handling",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralRequirement {
    /// Defaults to the kind, suffixed when a lesson repeats a kind
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub rule: Rule,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Unmet-requirement message; may use `{function}`, `{required}`, `{observed}`
    #[serde(default)]
    pub message: Option<String>,
}

impl BehavioralRequirement {
    pub fn new(rule: Rule) -> Self {
        Self {
            id: None,
            rule,
            weight: default_weight(),
            message: None,
        }
    }
}

/// How user-visible output is compared with a plain-text expectation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMode {
    /// Trailing whitespace per line and trailing blank lines ignored;
    /// numbers compared numerically
    #[default]
    Normalized,
    /// Byte equality
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingPolicy {
    pub correctness_weight: f64,
    pub behavioral_weight: f64,
    pub passing_threshold: f64,
    #[serde(default)]
    pub comparison: ComparisonMode,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        Self {
            correctness_weight: 0.5,
            behavioral_weight: 0.5,
            passing_threshold: 70.0,
            comparison: ComparisonMode::Normalized,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    #[serde(default)]
    pub lesson_id: Option<String>,
    pub execution_environment: ExecutionEnvironment,
    pub test_cases: Vec<TestCase>,
    pub behavioral_requirements: Vec<BehavioralRequirement>,
    pub grading: GradingPolicy,
    /// Derived from the requirement kinds when absent
    #[serde(default)]
    pub instrumentation: Option<InstrumentationConfig>,
}

impl Lesson {
    /// Parse and validate a lesson definition
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let lesson: Lesson = serde_json::from_str(content).map_err(ConfigError::MalformedLesson)?;
        lesson.validate()?;
        Ok(lesson)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidLesson(msg));

        let env = &self.execution_environment;
        if env.language.trim().is_empty() {
            return invalid("execution_environment.language is empty".into());
        }
        if !env.timeout_seconds.is_finite() || env.timeout_seconds <= 0.0 {
            return invalid(format!(
                "execution_environment.timeout_seconds must be positive, got {}",
                env.timeout_seconds
            ));
        }
        if env.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return invalid(format!(
                "execution_environment.timeout_seconds must be at most {}, got {}",
                MAX_TIMEOUT_SECONDS, env.timeout_seconds
            ));
        }
        if env.memory_limit_mb == Some(0) {
            return invalid("execution_environment.memory_limit_mb must be positive".into());
        }

        if self.test_cases.is_empty() {
            return invalid("test_cases is empty".into());
        }
        for (index, case) in self.test_cases.iter().enumerate() {
            if case.requires_input && case.input.is_none() {
                return invalid(format!(
                    "test case `{}` requires input but has none",
                    self.case_name(index)
                ));
            }
            check_expected(&case.expected_output)
                .map_err(|e| ConfigError::InvalidLesson(format!("test case `{}`: {}", self.case_name(index), e)))?;
        }

        for requirement in &self.behavioral_requirements {
            check_requirement(requirement).map_err(ConfigError::InvalidLesson)?;
        }
        if let Some(config) = &self.instrumentation {
            if config.forbidden_patterns.iter().any(|p| p.is_empty()) {
                return invalid("instrumentation.forbidden_patterns contains an empty pattern".into());
            }
        }

        let grading = &self.grading;
        for (name, weight) in [
            ("correctness_weight", grading.correctness_weight),
            ("behavioral_weight", grading.behavioral_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return invalid(format!("grading.{} must be a non-negative number", name));
            }
        }
        if grading.correctness_weight + grading.behavioral_weight <= 0.0 {
            return invalid("grading weights must not both be zero".into());
        }
        if !(0.0..=100.0).contains(&grading.passing_threshold) {
            return invalid(format!(
                "grading.passing_threshold must be within 0..=100, got {}",
                grading.passing_threshold
            ));
        }

        Ok(())
    }

    /// Display name of a test case, numbered from 1 when unnamed
    pub fn case_name(&self, index: usize) -> String {
        match self.test_cases.get(index) {
            Some(case) if !case.name.trim().is_empty() => case.name.clone(),
            _ => format!("test {}", index + 1),
        }
    }

    /// Signals to record: the explicit block plus whatever the requirements need
    ///
    /// An explicit block can switch extra signals on but never off one that a
    /// declared requirement depends on.
    pub fn instrumentation(&self) -> InstrumentationConfig {
        let mut config = self.instrumentation.clone().unwrap_or_default();
        for requirement in &self.behavioral_requirements {
            match &requirement.rule {
                Rule::Recursion { .. } => {
                    config.monitor_recursion = true;
                    config.monitor_function_calls = true;
                }
                Rule::LoopUsage { .. } => config.monitor_loops = true,
                Rule::FunctionCallCount { .. } => config.monitor_function_calls = true,
                Rule::DomManipulation { .. } => config.monitor_dom_operations = true,
                Rule::EventHandling { .. } => config.monitor_event_handlers = true,
                Rule::ForbiddenPattern { .. } => {}
            }
        }
        config
    }

    /// Declared requirements with ids filled in, plus one forbidden-pattern
    /// requirement for `instrumentation.forbidden_patterns`
    pub fn requirements(&self) -> Vec<BehavioralRequirement> {
        let mut requirements = self.behavioral_requirements.clone();
        if let Some(config) = &self.instrumentation {
            if !config.forbidden_patterns.is_empty() {
                requirements.push(BehavioralRequirement {
                    id: Some("forbidden_patterns".to_string()),
                    ..BehavioralRequirement::new(Rule::ForbiddenPattern {
                        patterns: config.forbidden_patterns.clone(),
                        regex: false,
                    })
                });
            }
        }

        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        for requirement in &mut requirements {
            let base = requirement
                .id
                .clone()
                .unwrap_or_else(|| requirement.rule.kind().to_string());
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            requirement.id = Some(if *count == 1 {
                base
            } else {
                format!("{}_{}", base, count)
            });
        }
        requirements
    }
}

fn check_expected(expected: &ExpectedOutput) -> Result<(), String> {
    match expected {
        ExpectedOutput::Number(n) if !n.is_finite() => Err("expected number is not finite".into()),
        ExpectedOutput::Predicate(OutputPredicate::Matches(pattern)) => Regex::new(pattern)
            .map(|_| ())
            .map_err(|e| format!("invalid expected-output regex: {}", e)),
        ExpectedOutput::Predicate(OutputPredicate::Numeric { tolerance, .. }) if *tolerance < 0.0 => {
            Err("numeric tolerance must not be negative".into())
        }
        ExpectedOutput::Predicate(OutputPredicate::OneOf(options)) if options.is_empty() => {
            Err("one_of has no options".into())
        }
        _ => Ok(()),
    }
}

fn check_requirement(requirement: &BehavioralRequirement) -> Result<(), String> {
    let label = requirement
        .id
        .clone()
        .unwrap_or_else(|| requirement.rule.kind().to_string());
    if !requirement.weight.is_finite() || requirement.weight < 0.0 {
        return Err(format!("requirement `{}` has a negative weight", label));
    }
    let empty = |what: &str| Err(format!("requirement `{}` lists no {}", label, what));
    match &requirement.rule {
        Rule::Recursion { min_depth, .. } if *min_depth == 0 => {
            Err(format!("requirement `{}` needs a minimum depth of at least 1", label))
        }
        Rule::FunctionCallCount { functions } if functions.is_empty() => empty("functions"),
        Rule::ForbiddenPattern { patterns, .. } if patterns.is_empty() => empty("patterns"),
        Rule::ForbiddenPattern { patterns, regex: true } => {
            for pattern in patterns {
                Regex::new(pattern)
                    .map_err(|e| format!("requirement `{}` has an invalid regex: {}", label, e))?;
            }
            Ok(())
        }
        Rule::DomManipulation { operations } if operations.is_empty() => empty("operations"),
        Rule::EventHandling { events } if events.is_empty() => empty("events"),
        _ => Ok(()),
    }
}

/// A learner's submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub owner: Option<String>,
    pub language: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub css: Option<String>,
    #[serde(default)]
    pub javascript: Option<String>,
}

impl Submission {
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(ConfigError::MalformedSubmission)
    }

    /// Single-file submission
    pub fn code(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: Some(code.into()),
            ..Self::default()
        }
    }

    /// Source in the shape `dialect` expects
    pub fn source_unit(&self, dialect: Dialect) -> Result<SourceUnit, ConfigError> {
        if dialect.is_web() {
            if self.html.is_none() && self.javascript.is_none() && self.code.is_none() {
                return Err(ConfigError::MissingSource("javascript"));
            }
            return Ok(SourceUnit::Web {
                html: self.html.clone().unwrap_or_default(),
                css: self.css.clone().unwrap_or_default(),
                // a web lesson may receive the script as plain `code`
                javascript: self
                    .javascript
                    .clone()
                    .or_else(|| self.code.clone())
                    .unwrap_or_default(),
            });
        }
        match (&self.code, dialect) {
            (Some(code), _) => Ok(SourceUnit::Code(code.clone())),
            (None, Dialect::Javascript) => self
                .javascript
                .clone()
                .map(SourceUnit::Code)
                .ok_or(ConfigError::MissingSource("code")),
            (None, _) => Err(ConfigError::MissingSource("code")),
        }
    }
}
