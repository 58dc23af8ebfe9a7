use crate::error::ConfigError;
use crate::events::LogLevel;
use crate::parsers::MetricsParser;
use crate::pipeline::FailurePolicy;
use crate::unifier::{ContextLimits, SeverityFilter, MAX_TIME_WINDOW_MINUTES};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application settings, loaded from TOML
///
/// Every section and field is optional; missing values take their defaults.
///
/// ```toml
/// [ingestion]
/// anomaly_threshold = 2.5
/// max_file_size_mb = 20
///
/// [unifier]
/// time_window_minutes = 60
/// min_log_level = "error"
///
/// [pipeline]
/// failure_policy = "abort"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ingestion: IngestionConfig,
    pub unifier: UnifierConfig,
    pub context: ContextConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Z-score at which the latest metric value counts as anomalous
    pub anomaly_threshold: f64,
    /// Baseline change, in percent, that flags a metric
    pub change_threshold_percent: f64,
    /// Deviations smaller than this fraction of the mean are noise
    pub min_relative_deviation: f64,
    /// Blobs larger than this are rejected before parsing
    pub max_file_size_mb: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: 2.0,
            change_threshold_percent: 50.0,
            min_relative_deviation: 0.1,
            max_file_size_mb: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifierConfig {
    pub time_window_minutes: Option<i64>,
    /// Lowest log level kept when narrowing a context
    pub min_log_level: String,
    pub correlation_window_minutes: i64,
}

impl Default for UnifierConfig {
    fn default() -> Self {
        Self {
            time_window_minutes: None,
            min_log_level: "WARNING".to_string(),
            correlation_window_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_error_logs: usize,
    pub max_error_traces: usize,
    pub max_context_length: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let limits = ContextLimits::default();
        Self {
            max_error_logs: limits.max_error_logs,
            max_error_traces: limits.max_error_traces,
            max_context_length: limits.max_context_length,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub failure_policy: FailurePolicy,
}

impl Config {
    /// Load and validate settings from a TOML file
    ///
    /// # Errors
    ///
    /// * `ConfigError::ReadError` - the file is missing or unreadable
    /// * `ConfigError::TomlError` - the file is not valid TOML for this schema
    /// * `ConfigError::ValidationError` - a value is out of range
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ingestion = &self.ingestion;
        if !ingestion.anomaly_threshold.is_finite() || ingestion.anomaly_threshold <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "ingestion.anomaly_threshold must be positive, got {}",
                ingestion.anomaly_threshold
            )));
        }
        if !ingestion.change_threshold_percent.is_finite()
            || ingestion.change_threshold_percent <= 0.0
        {
            return Err(ConfigError::ValidationError(format!(
                "ingestion.change_threshold_percent must be positive, got {}",
                ingestion.change_threshold_percent
            )));
        }
        if !ingestion.min_relative_deviation.is_finite() || ingestion.min_relative_deviation < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "ingestion.min_relative_deviation must not be negative, got {}",
                ingestion.min_relative_deviation
            )));
        }
        if ingestion.max_file_size_mb == 0 {
            return Err(ConfigError::ValidationError(
                "ingestion.max_file_size_mb must be at least 1".to_string(),
            ));
        }

        if let Some(minutes) = self.unifier.time_window_minutes {
            check_window("unifier.time_window_minutes", minutes)?;
        }
        check_window(
            "unifier.correlation_window_minutes",
            self.unifier.correlation_window_minutes,
        )?;
        self.min_log_level()?;

        if self.context.max_context_length == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_context_length must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn min_log_level(&self) -> Result<LogLevel, ConfigError> {
        LogLevel::from_keyword(&self.unifier.min_log_level).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "unifier.min_log_level is not a log level: {}",
                self.unifier.min_log_level
            ))
        })
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.ingestion.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn metrics_parser(&self) -> MetricsParser {
        MetricsParser::with_thresholds(
            self.ingestion.anomaly_threshold,
            self.ingestion.change_threshold_percent,
            self.ingestion.min_relative_deviation,
        )
    }

    pub fn context_limits(&self) -> ContextLimits {
        ContextLimits {
            max_error_logs: self.context.max_error_logs,
            max_error_traces: self.context.max_error_traces,
            max_context_length: self.context.max_context_length,
        }
    }

    pub fn correlation_window(&self) -> Duration {
        Duration::try_minutes(self.unifier.correlation_window_minutes).unwrap_or(Duration::MAX)
    }

    /// Severity narrowing at the configured log level
    pub fn severity_filter(&self) -> Result<SeverityFilter, ConfigError> {
        Ok(SeverityFilter {
            min_level: self.min_log_level()?,
            ..SeverityFilter::default()
        })
    }
}

/// Windows must be positive and no longer than [`MAX_TIME_WINDOW_MINUTES`]
fn check_window(name: &str, minutes: i64) -> Result<(), ConfigError> {
    if minutes <= 0 || minutes > MAX_TIME_WINDOW_MINUTES {
        return Err(ConfigError::ValidationError(format!(
            "{} must be between 1 and {}, got {}",
            name, MAX_TIME_WINDOW_MINUTES, minutes
        )));
    }
    Ok(())
}
