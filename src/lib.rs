//! Behavioral grading engine
//!
//! Runs learner submissions in isolated processes, records what they did at
//! runtime through per-language instrumentation, checks declarative
//! behavioral requirements against those traces and scores the result.

pub mod checker;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod languages;
pub mod lesson;
pub mod runner;
pub mod sandbox;
pub mod scoring;
pub mod trace;
pub mod weaver;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ConfigError, GradeError};
pub use languages::{LanguageDescriptor, LanguageRegistry};
pub use lesson::{Lesson, Submission};
pub use scoring::ScoreReport;
