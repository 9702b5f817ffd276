use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::{Shell, generate};
use sensor_pipeline::config::{Config, DEFAULT_CONFIG_PATH};
use sensor_pipeline::manifest::{RunOutcome, read_manifest};
use sensor_pipeline::observability::log_snapshot;
use sensor_pipeline::pipeline::{PipelineOrchestrator, RunStatus};
use sensor_pipeline::server::{ApiServer, AppState};
use sensor_pipeline::serving::Predictor;
use sensor_pipeline::store::ArtifactStore;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    let otlp_endpoint = match &command {
        Commands::Train { otlp_endpoint, .. } | Commands::Serve { otlp_endpoint, .. } => {
            otlp_endpoint.clone()
        }
        _ => None,
    };
    if !matches!(command, Commands::Completions { .. }) {
        configure_tracing(otlp_endpoint.as_deref())?;
    }

    match command {
        Commands::Train {
            print_metrics,
            metrics_json,
            otlp_endpoint: _,
        } => train(&config, print_metrics, metrics_json),
        Commands::Serve {
            host,
            port,
            otlp_endpoint: _,
        } => serve(&config, host, port),
        Commands::Predict { input, output } => predict(&config, &input, output.as_deref()),
        Commands::Models { action } => models_command(&config, action),
        Commands::Runs { action } => runs_command(&config, action),
        Commands::Check => check(&config),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "sensor-pipeline", &mut io::stdout());
            Ok(())
        }
    }
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "sensor-pipeline")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

/// Load the config file; a missing default file falls back to built-in
/// defaults plus environment overrides.
fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        return Config::load(path);
    }
    if path == Path::new(DEFAULT_CONFIG_PATH) {
        warn!(
            file = %path.display(),
            "Config file not found; using defaults and environment overrides"
        );
        let mut config = Config::default();
        config.apply_overrides(|key| env::var(key).ok());
        return Ok(config);
    }
    bail!("Config file not found: {}", path.display())
}

fn train(config_path: &Path, print_metrics: bool, metrics_json: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let orchestrator = PipelineOrchestrator::from_config(&config)?;
    let metrics = orchestrator.metrics();

    let outcome = orchestrator.run();

    let snapshot = metrics.snapshot();
    if print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = metrics_json {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metrics directory: {}", parent.display())
            })?;
        }
        let file = File::create(&path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }

    match outcome? {
        RunStatus::AlreadyRunning => {
            println!("Training pipeline is already running.");
        }
        RunStatus::Completed(report) => {
            println!("Training completed successfully.");
            println!("run: {}", report.run_dir.display());
            println!("model: {}", report.model_path.display());
        }
    }
    Ok(())
}

fn serve(config_path: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = load_config(config_path)?;
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let listen: SocketAddr = (host.as_str(), port)
        .to_socket_addrs()
        .with_context(|| format!("Invalid listen address: {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("Listen address {host}:{port} did not resolve"))?;

    let orchestrator = Arc::new(PipelineOrchestrator::from_config(&config)?);
    let metrics = orchestrator.metrics();
    let predictor = Predictor::new(orchestrator.store().resolver());
    let state = AppState::new(orchestrator, predictor)
        .with_upload_limit(config.server.max_upload_bytes);
    let mut server = ApiServer::start(listen, state)?;
    println!("Listening on http://{}", server.address());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down API server");
    server.stop();
    log_snapshot(&metrics.snapshot());
    Ok(())
}

fn predict(config_path: &Path, input: &Path, output: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let body = fs::read(input)
        .with_context(|| format!("Failed to read input file: {}", input.display()))?;
    let predictor = Predictor::new(ArtifactStore::from_config(&config).resolver());
    let csv = predictor
        .predict_csv(&body)
        .with_context(|| format!("Prediction failed for {}", input.display()))?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory: {}", parent.display())
                })?;
            }
            fs::write(path, &csv)
                .with_context(|| format!("Failed to write predictions: {}", path.display()))?;
            info!(output = %path.display(), "Predictions written");
        }
        None => io::stdout().write_all(&csv)?,
    }
    Ok(())
}

fn models_command(config_path: &Path, action: ModelCommands) -> Result<()> {
    let config = load_config(config_path)?;
    let resolver = ArtifactStore::from_config(&config).resolver();
    match action {
        ModelCommands::List { json } => {
            let versions = resolver.versions();
            if json {
                to_writer_pretty(io::stdout(), &versions)?;
                println!();
            } else if versions.is_empty() {
                println!("No models under {}", resolver.root().display());
            } else {
                for version in versions {
                    println!("{}\t{}", version.timestamp, version.model_path.display());
                }
            }
            Ok(())
        }
        ModelCommands::Current => {
            let path = resolver.best_model_path()?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn runs_command(config_path: &Path, action: RunCommands) -> Result<()> {
    let config = load_config(config_path)?;
    let store = ArtifactStore::from_config(&config);
    match action {
        RunCommands::List => {
            let runs = store.runs();
            if runs.is_empty() {
                println!("No runs under {}", store.artifact_root().display());
            }
            for run in runs {
                let manifest_path = run.manifest_path();
                let status = if manifest_path.exists() {
                    match read_manifest(&manifest_path) {
                        Ok(manifest) => match manifest.status {
                            RunOutcome::Succeeded => "succeeded".to_string(),
                            RunOutcome::Failed => format!(
                                "failed: {}",
                                manifest.error.unwrap_or_else(|| "unknown error".into())
                            ),
                        },
                        Err(err) => {
                            warn!(file = %manifest_path.display(), error = %format!("{err:#}"), "Unreadable run manifest");
                            "unknown".to_string()
                        }
                    }
                } else {
                    "incomplete".to_string()
                };
                println!("{}\t{}", run.timestamp(), status);
            }
            Ok(())
        }
    }
}

fn check(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let report = config.validate();

    for warning in &report.warnings {
        warn!(file = %config_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %config_path.display(), "Configuration check passed");
        println!("Configuration OK");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %config_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Configuration check failed with {} error(s)",
            report.errors.len()
        ))
    }
}

#[derive(Parser)]
#[command(
    name = "sensor-pipeline",
    version,
    about = "Sensor fault detection: training pipeline and prediction service"
)]
struct Cli {
    /// Pipeline configuration file
    #[arg(
        long,
        global = true,
        default_value = DEFAULT_CONFIG_PATH,
        value_hint = ValueHint::FilePath
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the training pipeline once
    Train {
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Serve the training trigger and prediction endpoints over HTTP
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Score a CSV file with the current model
    Predict {
        #[arg(long, value_hint = ValueHint::FilePath)]
        input: PathBuf,
        #[arg(long, value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
    },
    /// Inspect committed model versions
    Models {
        #[command(subcommand)]
        action: ModelCommands,
    },
    /// Inspect pipeline runs
    Runs {
        #[command(subcommand)]
        action: RunCommands,
    },
    /// Validate the configuration and schema
    Check,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    List {
        #[arg(long)]
        json: bool,
    },
    Current,
}

#[derive(Subcommand)]
enum RunCommands {
    List,
}
