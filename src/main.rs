//! # Serving Server Entry Point
//!
//! Bootstraps the prediction service from a model registry and serves
//! predictions over stdin/stdout, one JSON object per line. Also exposes
//! operator commands for health, manual promotion and registry maintenance.

use clap::{Parser, Subcommand};
use serde_json::json;
use serving::error::PredictError;
use serving::model::{ArtifactLoader, JsonArtifactLoader};
use serving::service::PredictOutcome;
use serving::{
    Features, MemoryStore, ModelRegistry, ModelVersion, PredictionService, ServingConfig,
    SqliteModelRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "serving-server")]
#[command(about = "Inference serving core with hot model promotion", long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve predictions: one JSON feature map per stdin line
    Serve,

    /// Score a single feature map
    Predict {
        /// Feature map as JSON, e.g. '{"age": 42, "plan": "pro"}'
        #[arg(short, long)]
        features: String,
    },

    /// Print service health as JSON
    Health,

    /// Promote a registry version immediately
    Reload {
        /// Version to promote
        version: String,
    },

    /// Inspect or edit the model registry
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
}

#[derive(Subcommand)]
enum RegistryCommands {
    /// List every version, most recent first
    List,

    /// Register a new version in staging
    Register {
        /// Version id
        version: String,

        /// Path to the artifact file
        #[arg(short, long)]
        artifact: PathBuf,

        /// Metric as name=value; repeatable. Defaults to the artifact's own metrics
        #[arg(short, long)]
        metric: Vec<String>,
    },

    /// Move a version to archived
    Archive {
        /// Version id
        version: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ServingConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            let service = start_service(&config).await?;
            serve_stdin(&service).await?;
            service.close().await;
        }

        Commands::Predict { features } => {
            let features: Features = serde_json::from_str(&features)?;
            let service = start_service(&config.without_polling()).await?;
            let result = service.predict(features).await;
            println!("{}", serde_json::to_string_pretty(&outcome_json(&result))?);
            service.close().await;
        }

        Commands::Health => {
            let service = start_service(&config.without_polling()).await?;
            println!("{}", serde_json::to_string_pretty(&service.health())?);
            service.close().await;
        }

        Commands::Reload { version } => {
            let service = start_service(&config.without_polling()).await?;
            let result = service.reload_model(&version).await;
            service.close().await;
            let report = result?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Registry { command } => {
            let registry = SqliteModelRegistry::open(&config.registry.path)?;
            run_registry_command(&registry, command)?;
        }
    }

    Ok(())
}

async fn start_service(
    config: &ServingConfig,
) -> Result<PredictionService, Box<dyn std::error::Error>> {
    let registry = Arc::new(SqliteModelRegistry::open(&config.registry.path)?);
    let service = PredictionService::start(
        config,
        registry,
        Arc::new(JsonArtifactLoader),
        Arc::new(MemoryStore::new()),
    )
    .await?;
    Ok(service)
}

async fn serve_stdin(service: &PredictionService) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Features>(line) {
            Ok(features) => outcome_json(&service.predict(features).await),
            Err(e) => json!({ "error": format!("invalid feature map: {}", e), "retryable": false }),
        };

        let mut out = response.to_string();
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn outcome_json(result: &Result<PredictOutcome, PredictError>) -> serde_json::Value {
    match result {
        Ok(outcome) => json!({
            "score": outcome.prediction.score,
            "label": outcome.prediction.label,
            "cache_hit": outcome.cache_hit,
            "latency_us": outcome.latency.as_micros() as u64,
            "model_version": outcome.model_version,
        }),
        Err(e @ PredictError::Unavailable { retry_after }) => json!({
            "error": e.to_string(),
            "retryable": true,
            "retry_after_ms": retry_after.as_millis() as u64,
        }),
        Err(e) => json!({ "error": e.to_string(), "retryable": false }),
    }
}

fn run_registry_command(
    registry: &SqliteModelRegistry,
    command: RegistryCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        RegistryCommands::List => {
            let versions = registry.list_all()?;
            if versions.is_empty() {
                println!("No model versions registered");
                return Ok(());
            }
            println!(
                "{:<20} {:<12} {:<40} {}",
                "VERSION", "STATE", "ARTIFACT", "METRICS"
            );
            for v in versions {
                let metrics: Vec<String> = v
                    .metrics
                    .iter()
                    .map(|(name, value)| format!("{}={:.4}", name, value))
                    .collect();
                println!(
                    "{:<20} {:<12} {:<40} {}",
                    v.version,
                    v.state.as_str(),
                    v.artifact_path,
                    metrics.join(",")
                );
            }
        }

        RegistryCommands::Register {
            version,
            artifact,
            metric,
        } => {
            let mut model = ModelVersion::staging(version, artifact.display().to_string());
            if metric.is_empty() {
                model.metrics = artifact_metrics(&artifact)?;
            } else {
                for raw in &metric {
                    let (name, value) = parse_metric(raw)?;
                    model = model.with_metric(name, value);
                }
            }
            registry.register(&model)?;
            println!("Registered {} in staging", model.version);
        }

        RegistryCommands::Archive { version } => {
            registry.mark_archived(&version)?;
            println!("Archived {}", version);
        }
    }
    Ok(())
}

fn artifact_metrics(path: &Path) -> Result<serving::types::Metrics, Box<dyn std::error::Error>> {
    let artifact = JsonArtifactLoader.load(path)?;
    Ok(artifact.metrics().clone())
}

fn parse_metric(raw: &str) -> Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("metric '{}' must be name=value", raw))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("metric '{}': {}", raw, e))?;
    Ok((name.trim().to_string(), value))
}
