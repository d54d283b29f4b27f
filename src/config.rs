//! Engine configuration
//!
//! Loaded once at startup from environment variables (the binary calls
//! `dotenvy::dotenv()` first) and shared read-only by every run.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// How spawned programs are cut off from the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPolicy {
    /// Fail the run if a private network namespace cannot be created
    Deny,
    /// Try to create a private network namespace, run anyway if that fails
    BestEffort,
    /// Leave the network untouched
    Inherit,
}

impl FromStr for NetworkPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "deny" => Ok(NetworkPolicy::Deny),
            "best_effort" | "best-effort" => Ok(NetworkPolicy::BestEffort),
            "inherit" | "allow" => Ok(NetworkPolicy::Inherit),
            other => anyhow::bail!("Unknown network policy: {}", other),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of test-case runs allowed in flight at once, across all submissions
    pub max_concurrent_runs: usize,
    /// Parent directory for per-run workspaces
    pub work_root: PathBuf,
    /// Upper bound applied to lesson-supplied timeouts
    pub max_timeout: Duration,
    /// Deadline for a compile step
    pub compile_timeout: Duration,
    /// Address-space ceiling for runs in MB (default: 512MB)
    pub memory_limit_mb: u32,
    /// Address-space ceiling for compilers in MB (default: 4096MB)
    pub compile_memory_limit_mb: u32,
    /// Per-stream capture cap in bytes
    pub max_output_bytes: usize,
    /// Largest file a run may create, in bytes
    pub max_file_size_bytes: u64,
    /// Network isolation policy for spawned processes
    pub network: NetworkPolicy,
    /// How long to wait for output pipes to drain after the process group is killed
    pub kill_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_workers(),
            work_root: std::env::temp_dir().join("grader-runs"),
            max_timeout: Duration::from_secs(60),
            compile_timeout: Duration::from_secs(30),
            memory_limit_mb: 512,
            compile_memory_limit_mb: 4096,
            max_output_bytes: 1024 * 1024,
            max_file_size_bytes: 64 * 1024 * 1024,
            network: NetworkPolicy::BestEffort,
            kill_grace: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            max_concurrent_runs: env_parse("GRADER_WORKERS")?
                .unwrap_or(defaults.max_concurrent_runs),
            work_root: std::env::var_os("GRADER_WORK_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_root),
            max_timeout: env_parse("GRADER_MAX_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_timeout),
            compile_timeout: env_parse("GRADER_COMPILE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.compile_timeout),
            memory_limit_mb: env_parse("GRADER_MEMORY_LIMIT_MB")?
                .unwrap_or(defaults.memory_limit_mb),
            compile_memory_limit_mb: env_parse("GRADER_COMPILE_MEMORY_LIMIT_MB")?
                .unwrap_or(defaults.compile_memory_limit_mb),
            max_output_bytes: env_parse("GRADER_MAX_OUTPUT_BYTES")?
                .unwrap_or(defaults.max_output_bytes),
            max_file_size_bytes: defaults.max_file_size_bytes,
            network: env_parse("GRADER_NETWORK")?.unwrap_or(defaults.network),
            kill_grace: defaults.kill_grace,
        };

        if config.max_concurrent_runs == 0 {
            anyhow::bail!("GRADER_WORKERS must be at least 1");
        }
        if config.max_timeout.is_zero() {
            anyhow::bail!("GRADER_MAX_TIMEOUT_SECS must be at least 1");
        }

        Ok(config)
    }
}

fn default_workers() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            warn!("Could not determine available parallelism ({}), using 2 workers", e);
            2
        }
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_policy_parse() {
        assert_eq!("deny".parse::<NetworkPolicy>().unwrap(), NetworkPolicy::Deny);
        assert_eq!(
            "best-effort".parse::<NetworkPolicy>().unwrap(),
            NetworkPolicy::BestEffort
        );
        assert_eq!("allow".parse::<NetworkPolicy>().unwrap(), NetworkPolicy::Inherit);
        assert!("open".parse::<NetworkPolicy>().is_err());
    }

    #[test]
    fn test_defaults_are_bounded() {
        let config = EngineConfig::default();
        assert!(config.max_concurrent_runs >= 1);
        assert_eq!(config.compile_timeout, Duration::from_secs(30));
        assert_eq!(config.network, NetworkPolicy::BestEffort);
    }
}
