//! Fatal error taxonomy
//!
//! Only configuration problems abort a grading pass. Everything that can go
//! wrong while a single test case runs is reported as a value on that test
//! case instead (see `ExecutionStatus`, `ExtractionFailure`, `ScanError`).

use thiserror::Error;

/// Problems with the lesson definition or submission that are detected
/// before any sandbox is allocated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("lesson definition is malformed: {0}")]
    MalformedLesson(#[source] serde_json::Error),

    #[error("submission is malformed: {0}")]
    MalformedSubmission(#[source] serde_json::Error),

    #[error("unsupported language: {0}")]
    UnknownLanguage(String),

    #[error("submission language `{submission}` does not match lesson language `{lesson}`")]
    LanguageMismatch { lesson: String, submission: String },

    #[error("submission is missing `{0}`")]
    MissingSource(&'static str),

    #[error("invalid lesson definition: {0}")]
    InvalidLesson(String),
}

/// Error returned by `Engine::grade`
#[derive(Debug, Error)]
pub enum GradeError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl GradeError {
    pub fn config(&self) -> &ConfigError {
        match self {
            GradeError::Configuration(err) => err,
        }
    }
}
