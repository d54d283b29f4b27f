use anyhow::{Context, Result};
use tracing::info;

use grader::{Engine, EngineConfig, LanguageRegistry, Lesson, Submission};

const USAGE: &str = "usage: grader <lesson.json> <submission.json> [--summary]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("grader=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let summary = args.iter().any(|arg| arg == "--summary");
    let paths: Vec<&String> = args.iter().filter(|arg| !arg.starts_with("--")).collect();
    let (lesson_path, submission_path) = match paths.as_slice() {
        [lesson, submission] => (lesson.as_str(), submission.as_str()),
        _ => anyhow::bail!(USAGE),
    };

    // Load language configurations
    let registry = match std::env::var("LANGUAGES_CONFIG") {
        Ok(path) => {
            let registry = LanguageRegistry::load(&path)?;
            info!("Loaded language configurations from {}", path);
            registry
        }
        Err(_) => LanguageRegistry::builtin()?,
    };
    info!("Supported languages: {}", registry.supported().join(", "));

    let config = EngineConfig::from_env()?;
    info!(
        "Engine config: workers={}, work_root={:?}, network={:?}",
        config.max_concurrent_runs, config.work_root, config.network
    );

    let lesson_json = std::fs::read_to_string(lesson_path)
        .with_context(|| format!("Failed to read lesson {}", lesson_path))?;
    let submission_json = std::fs::read_to_string(submission_path)
        .with_context(|| format!("Failed to read submission {}", submission_path))?;
    let lesson = Lesson::from_json(&lesson_json)?;
    let submission = Submission::from_json(&submission_json)?;

    let engine = Engine::new(registry, config);
    let report = engine.grade(&lesson, &submission).await?;

    if summary {
        println!("{}", report.summary());
    } else {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if !report.passed {
        std::process::exit(1);
    }
    Ok(())
}
