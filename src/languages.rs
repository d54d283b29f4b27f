//! Language configuration for compilation and execution
//!
//! The registry is loaded once at startup and then shared read-only by every
//! concurrent run. Adding a language means adding a table to the TOML file
//! (or calling `register`), not touching the engine.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Instrumentation front-end a language is woven with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Python,
    Javascript,
    /// Client-side JavaScript run against a recording DOM
    Web,
    C,
    Cpp,
    Rust,
    /// No instrumentation support; behavioral evidence is always empty
    Plain,
}

impl Dialect {
    pub fn is_web(&self) -> bool {
        matches!(self, Dialect::Web)
    }
}

/// How source text becomes a running process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Interpret,
    CompileThenRun,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStrategy::Interpret => write!(f, "interpret"),
            ExecutionStrategy::CompileThenRun => write!(f, "compile-then-run"),
        }
    }
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageDescriptor {
    /// Canonical identifier (e.g., "python")
    pub id: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Instrumentation front-end
    pub dialect: Dialect,
    /// Compile command template (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command template
    pub run_command: Vec<String>,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = base_memory * multiplier + bonus
    pub memory_limit: Option<(u32, u32)>,
    /// Runtimes that reserve huge virtual address ranges (V8) cannot run under RLIMIT_AS
    pub unlimited_memory: bool,
}

impl LanguageDescriptor {
    pub fn strategy(&self) -> ExecutionStrategy {
        if self.compile_command.is_some() {
            ExecutionStrategy::CompileThenRun
        } else {
            ExecutionStrategy::Interpret
        }
    }

    /// File extension of the source file, without the dot
    pub fn extension(&self) -> &str {
        Path::new(&self.source_file)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
    }

    /// Name of the compiled artifact inside the workspace
    pub fn artifact_file(&self) -> &str {
        Path::new(&self.source_file)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("main")
    }

    /// Calculate actual time limit based on the lesson's base time limit
    pub fn calculate_time_limit(&self, base: Duration) -> Duration {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base
                .checked_mul(multiplier)
                .and_then(|scaled| scaled.checked_add(Duration::from_secs(u64::from(bonus_seconds))))
                .unwrap_or(Duration::MAX),
            None => base,
        }
    }

    /// Calculate actual memory limit based on base memory limit
    /// Returns None when the runtime must not be capped
    pub fn calculate_memory_limit(&self, base_memory_mb: u32) -> Option<u32> {
        if self.unlimited_memory {
            return None;
        }
        Some(match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_memory_mb
                .saturating_mul(multiplier)
                .saturating_add(bonus_mb),
            None => base_memory_mb,
        })
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    dialect: Dialect,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    time_limit: Vec<String>,
    #[serde(default)]
    memory_limit: Vec<String>,
    #[serde(default)]
    unlimited_memory: bool,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Language table keyed by lowercase name and alias
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, Arc<LanguageDescriptor>>,
}

impl LanguageRegistry {
    /// Registry built from the language table shipped with the crate
    pub fn builtin() -> anyhow::Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content).context("Built-in language table is invalid")
    }

    /// Load a registry from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language table {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid language table {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut registry = Self::default();

        for (name, raw) in raw_configs {
            let parse_limit =
                |raw_limit: Vec<String>, kind: &str| -> anyhow::Result<Option<(u32, u32)>> {
                    if raw_limit.is_empty() {
                        return Ok(None);
                    }
                    if raw_limit.len() != 2 {
                        anyhow::bail!("Invalid {} limit for {}: {:?}", kind, name, raw_limit);
                    }
                    let multiplier = raw_limit[0].parse::<u32>().with_context(|| {
                        format!("Invalid {} multiplier for {}: {}", kind, name, raw_limit[0])
                    })?;
                    let offset = raw_limit[1].parse::<u32>().with_context(|| {
                        format!("Invalid {} offset for {}: {}", kind, name, raw_limit[1])
                    })?;
                    Ok(Some((multiplier, offset)))
                };

            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run command for {}", name);
            }

            let descriptor = LanguageDescriptor {
                id: name.to_lowercase(),
                source_file: raw.source_file,
                dialect: raw.dialect,
                compile_command: raw
                    .compile_command
                    .map(|cmd| into_command(&cmd))
                    .filter(|cmd| !cmd.is_empty()),
                run_command,
                time_limit: parse_limit(raw.time_limit, "time")?,
                memory_limit: parse_limit(raw.memory_limit, "memory")?,
                unlimited_memory: raw.unlimited_memory,
            };

            registry.register(descriptor, &raw.aliases);
        }

        Ok(registry)
    }

    /// Register a language under its id and any aliases, replacing earlier entries
    pub fn register(&mut self, descriptor: LanguageDescriptor, aliases: &[String]) {
        let descriptor = Arc::new(descriptor);

        // Add main language name
        self.languages
            .insert(descriptor.id.to_lowercase(), descriptor.clone());

        // Add aliases
        for alias in aliases {
            self.languages
                .insert(alias.to_lowercase(), descriptor.clone());
        }
    }

    /// Get language configuration by language name or alias
    pub fn resolve(&self, language: &str) -> Option<Arc<LanguageDescriptor>> {
        self.languages.get(&language.trim().to_lowercase()).cloned()
    }

    /// Canonical ids of all supported languages, sorted
    pub fn supported(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .languages
            .values()
            .map(|descriptor| descriptor.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
