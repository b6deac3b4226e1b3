use anyhow::{Context, Result};
use clap::Parser;
use foreman_config::{ConfigLoader, ForemanConfig, LogLevel};
use foreman_execution::{CommandRequest, LifecycleController, WorkerCategory};
use foreman_logging::{init_logging_from_config, init_simple_tracing};
use serde_json::{json, Value as JsonValue};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

mod cli;
use cli::{Cli, Commands, ConfigCommands};

/// Load configuration from file or environment
fn load_config(config_path: Option<&PathBuf>) -> Result<ForemanConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => loader
            .from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

/// Initialize logging, letting `--log-level` override the configured level
fn init_logging(config: &ForemanConfig, log_level: Option<&str>) -> Result<()> {
    let mut logging = config.logging.clone();
    if let Some(level) = log_level {
        match level.parse::<LogLevel>() {
            Ok(level) => logging.level = level,
            // Not a plain level; treat it as a filter directive
            Err(_) => return init_simple_tracing(level),
        }
    }
    init_logging_from_config(&logging)
}

fn parse_categories(names: &[String]) -> Result<Vec<WorkerCategory>> {
    names
        .iter()
        .map(|name| {
            name.parse::<WorkerCategory>()
                .with_context(|| format!("Invalid worker category '{}'", name))
        })
        .collect()
}

async fn handle_exec(
    config: &ForemanConfig,
    category: &str,
    command: &str,
    payload: Option<&str>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let category: WorkerCategory = category
        .parse()
        .with_context(|| format!("Invalid worker category '{}'", category))?;
    let payload: JsonValue = match payload {
        Some(raw) => serde_json::from_str(raw).context("--payload is not valid JSON")?,
        None => JsonValue::Null,
    };
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(config.dispatch.default_timeout);

    let controller = LifecycleController::try_from_config(config)?;
    let outcome = controller
        .dispatcher()
        .dispatch(CommandRequest::from_value(category, command, payload), timeout)
        .await;
    controller.shutdown().await;

    let reply = outcome.with_context(|| format!("Command '{}' failed", command))?;
    info!(
        round_trip_ms = reply.round_trip.as_millis() as u64,
        worker_ms = ?reply.worker_elapsed_ms,
        "Command completed"
    );

    let output = json!({
        "correlationId": reply.correlation_id,
        "data": reply.payload,
        "executionTimeMs": reply.worker_elapsed_ms,
        "roundTripMs": reply.round_trip.as_millis() as u64,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn handle_health(config: &ForemanConfig, categories: &[String]) -> Result<()> {
    let categories = if categories.is_empty() {
        parse_categories(&config.workers.prewarm)?
    } else {
        parse_categories(categories)?
    };

    let controller = LifecycleController::try_from_config(config)?;
    let started = controller.initialize(&categories).await;
    let health = controller.health();
    controller.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&health)?);
    if !started {
        anyhow::bail!("No worker category could be started");
    }
    Ok(())
}

fn handle_config_validate(path: &Path) -> Result<()> {
    info!("Validating configuration file: {:?}", path);

    if !path.exists() {
        anyhow::bail!("Configuration file not found: {:?}", path);
    }

    ConfigLoader::new()
        .from_file(path)
        .with_context(|| format!("Configuration validation failed for {:?}", path))?;
    println!("Configuration file is valid");
    Ok(())
}

fn handle_config_generate(output: Option<&Path>, force: bool) -> Result<()> {
    let sample = ForemanConfig::generate_sample();

    let Some(output) = output else {
        print!("{}", sample);
        return Ok(());
    };

    if output.exists() && !force {
        anyhow::bail!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        );
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }
    fs::write(output, sample).with_context(|| format!("Failed to write {:?}", output))?;
    println!("Sample configuration written to {:?}", output);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first
    let config = load_config(cli.config.as_ref())?;
    init_logging(&config, cli.log_level.as_deref())?;
    debug!("Foreman CLI starting");

    match &cli.command {
        Commands::Exec {
            category,
            command,
            payload,
            timeout_ms,
        } => handle_exec(&config, category, command, payload.as_deref(), *timeout_ms).await,
        Commands::Health { categories } => handle_health(&config, categories).await,
        Commands::Config { config_cmd } => match config_cmd {
            ConfigCommands::Validate { path } => handle_config_validate(path),
            ConfigCommands::Generate { output, force } => {
                if output.is_none() && *force {
                    warn!("--force has no effect without --output");
                }
                handle_config_generate(output.as_deref(), *force)
            }
        },
    }
}
