use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use inframind::config::Config;
use inframind::error::ConfigError;
use inframind::events::{DeploymentEvent, LogLevel};
use inframind::parsers::{ConfigFormat, LogFormat};
use inframind::pipeline::{
    CancellationFlag, ConfigInput, IncidentPipeline, IncidentRequest, LogInput, SourceBlob,
};
use inframind::store::{InMemoryIncidentStore, IncidentRecord, IncidentStore, JsonFileIncidentStore};
use inframind::unifier::{SeverityFilter, MAX_TIME_WINDOW_MINUTES};
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How the finished incident is printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Narrative context string, as handed to a reasoning backend
    Text,
    /// The full incident record
    Json,
    /// Summary statistics only
    Stats,
}

/// Command-line arguments for the incident ingester
#[derive(Parser, Debug)]
#[command(
    name = "inframind",
    about = "Unify logs, metrics, traces and config changes into one incident context",
    long_about = "Parses heterogeneous observability files, merges them into a single \
                  time-ordered incident context and prints the narrative, record or stats."
)]
struct Cli {
    /// Log file, optionally with the service name used for lines that carry none
    #[arg(long = "log", value_name = "FILE[=SOURCE]")]
    logs: Vec<String>,

    /// Log format for every --log file
    #[arg(long, default_value = "auto", value_name = "FORMAT")]
    log_format: String,

    /// Metrics file (JSON)
    #[arg(long = "metrics", value_name = "FILE")]
    metrics: Vec<PathBuf>,

    /// Trace file (JSON)
    #[arg(long = "trace", value_name = "FILE")]
    traces: Vec<PathBuf>,

    /// Configuration file; with two, the first is diffed against the second
    #[arg(long = "config", value_name = "FILE")]
    configs: Vec<PathBuf>,

    /// JSON array of deployment events
    #[arg(long, value_name = "FILE")]
    deployments: Option<PathBuf>,

    /// JSON object of previous metric values, by metric name
    #[arg(long, value_name = "FILE")]
    baseline: Option<PathBuf>,

    /// Keep only records from the last N minutes
    #[arg(long, value_name = "N")]
    window_minutes: Option<i64>,

    #[arg(long, value_name = "ID")]
    incident_id: Option<String>,

    /// Path to settings file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Settings file path (TOML format)"
    )]
    settings: Option<PathBuf>,

    /// Persist the incident record as JSON in this directory
    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Narrow the printed context to this log level and failed spans;
    /// implies --narrow
    #[arg(long, value_name = "LEVEL")]
    min_level: Option<String>,

    /// Narrow the printed context with the settings file's min_log_level
    #[arg(long)]
    narrow: bool,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if self.logs.is_empty()
            && self.metrics.is_empty()
            && self.traces.is_empty()
            && self.configs.is_empty()
            && self.deployments.is_none()
        {
            return Err("Nothing to ingest: pass at least one input file".to_string());
        }

        // Missing settings files fall back to defaults in load_config
        if let Some(ref settings_path) = self.settings {
            if settings_path.exists() {
                if !settings_path.is_file() {
                    return Err(format!(
                        "Settings path is not a file: {}",
                        settings_path.display()
                    ));
                }

                if let Some(extension) = settings_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Settings file does not have .toml extension: {}",
                            settings_path.display()
                        );
                    }
                }
            }
        }

        if let Some(minutes) = self.window_minutes {
            if minutes <= 0 || minutes > MAX_TIME_WINDOW_MINUTES {
                return Err(format!(
                    "--window-minutes must be between 1 and {}, got {}",
                    MAX_TIME_WINDOW_MINUTES, minutes
                ));
            }
        }

        if let Some(ref level) = self.min_level {
            if LogLevel::from_keyword(level).is_none() {
                return Err(format!("--min-level is not a log level: {}", level));
            }
        }

        self.log_format
            .parse::<LogFormat>()
            .map_err(|e| e.to_string())?;

        Ok(())
    }

    /// Severity narrowing for the printed output, if requested
    ///
    /// Starts from the settings' filter; `--min-level` overrides its level.
    fn severity_filter(&self, config: &Config) -> Result<Option<SeverityFilter>, ConfigError> {
        if !self.narrow && self.min_level.is_none() {
            return Ok(None);
        }
        let mut filter = config.severity_filter()?;
        if let Some(level) = self.min_level.as_deref().and_then(LogLevel::from_keyword) {
            filter.min_level = level;
        }
        Ok(Some(filter))
    }

    /// Convert settings path to string safely, handling non-UTF-8 paths
    fn settings_path_str(&self) -> Result<Option<&str>, String> {
        match &self.settings {
            Some(path) => match path.to_str() {
                Some(path_str) => Ok(Some(path_str)),
                None => Err(format!(
                    "Settings file path contains invalid UTF-8 characters: {}",
                    path.display()
                )),
            },
            None => Ok(None),
        }
    }
}

/// Load settings from file or use defaults
///
/// A missing or invalid file is reported and replaced by the defaults.
fn load_config(settings_path: Option<&str>) -> Result<Config, ConfigError> {
    match settings_path {
        Some(path) => {
            info!("Loading settings from: {}", path);
            match Config::from_file(Path::new(path)) {
                Ok(config) => Ok(config),
                Err(ConfigError::ReadError(_)) => {
                    warn!(
                        "Settings file '{}' not found or unreadable, using defaults",
                        path
                    );
                    Ok(Config::default())
                }
                Err(e) => {
                    error!("Settings error in '{}': {}", path, e);
                    warn!("Using default settings due to invalid settings file");
                    Ok(Config::default())
                }
            }
        }
        None => {
            info!("Using default settings");
            Ok(Config::default())
        }
    }
}

/// Split `FILE[=SOURCE]`; the source defaults to the file stem
fn parse_log_arg(arg: &str) -> (PathBuf, String) {
    match arg.rsplit_once('=') {
        Some((path, source)) if !path.is_empty() && !source.is_empty() => {
            (PathBuf::from(path), source.to_string())
        }
        _ => {
            let path = PathBuf::from(arg);
            let source = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string());
            (path, source)
        }
    }
}

/// Raw file bytes; decoding is left to the parsers
fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn display_name(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn build_request(cli: &Cli) -> Result<IncidentRequest> {
    let log_format: LogFormat = cli.log_format.parse()?;

    let logs = cli
        .logs
        .iter()
        .map(|arg| {
            let (path, source) = parse_log_arg(arg);
            Ok(LogInput {
                source,
                content: read_file(&path)?,
                format: log_format,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let blobs = |paths: &[PathBuf]| -> Result<Vec<SourceBlob>> {
        paths
            .iter()
            .map(|path| {
                Ok(SourceBlob {
                    name: display_name(path),
                    content: read_file(path)?,
                })
            })
            .collect()
    };

    let configs = cli
        .configs
        .iter()
        .map(|path| {
            Ok(ConfigInput {
                path: display_name(path),
                content: read_file(path)?,
                format: ConfigFormat::Auto,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let deployments: Vec<DeploymentEvent> = match &cli.deployments {
        Some(path) => serde_json::from_slice(&read_file(path)?)
            .with_context(|| format!("parsing deployments in {}", path.display()))?,
        None => Vec::new(),
    };

    let metric_baseline: Option<HashMap<String, f64>> = match &cli.baseline {
        Some(path) => Some(
            serde_json::from_slice(&read_file(path)?)
                .with_context(|| format!("parsing baseline in {}", path.display()))?,
        ),
        None => None,
    };

    Ok(IncidentRequest {
        incident_id: cli.incident_id.clone(),
        logs,
        metrics: blobs(&cli.metrics)?,
        traces: blobs(&cli.traces)?,
        configs,
        deployments,
        metric_baseline,
        time_window_minutes: cli.window_minutes,
        reference_time: None,
    })
}

fn render(
    pipeline: &IncidentPipeline,
    record: &IncidentRecord,
    output: OutputFormat,
    filter: Option<&SeverityFilter>,
) -> Result<String> {
    let mut record = record.clone();
    if let (Some(filter), Some(context)) = (filter, record.context.as_ref()) {
        let narrowed = pipeline.unifier().filter_by_severity(context, filter);
        record.stats = Some(narrowed.summary_stats());
        record.context = Some(narrowed);
    }

    match output {
        OutputFormat::Text => {
            let context = record
                .context
                .as_ref()
                .context("incident has no unified context")?;
            let mut text = pipeline.narrative(context);
            for warning in &record.warnings {
                text.push_str(&format!("\nWARNING: skipped {}", warning));
            }
            Ok(text)
        }
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&record)?),
        OutputFormat::Stats => Ok(serde_json::to_string_pretty(&record.stats)?),
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let store: Arc<dyn IncidentStore> = match &cli.store_dir {
        Some(dir) => Arc::new(
            JsonFileIncidentStore::new(dir)
                .with_context(|| format!("opening store {}", dir.display()))?,
        ),
        None => Arc::new(InMemoryIncidentStore::new()),
    };
    let pipeline = IncidentPipeline::from_config(&config, store);
    let filter = cli.severity_filter(&config)?;

    let request = build_request(&cli)?;

    let cancel = CancellationFlag::new();
    let signal_flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt signal, cancelling ingestion...");
            signal_flag.cancel();
        }
    });

    let record = pipeline.run(request, &cancel).await?;
    info!("Incident {} {}", record.incident_id, record.status);

    println!("{}", render(&pipeline, &record, cli.output, filter.as_ref())?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let settings_path = match cli.settings_path_str() {
        Ok(path) => path,
        Err(e) => {
            error!("Invalid settings path: {}", e);
            std::process::exit(1);
        }
    };

    let config = match load_config(settings_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load settings: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli, config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
